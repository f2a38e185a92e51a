//! Document-tree collaborator: block lookup and block attributes.
//!
//! # Responsibility
//! - Locate document blocks backing attribute-view rows.
//! - Read/write block attributes, including the `custom-avs` binding list.
//!
//! # Invariants
//! - `custom-avs` is a comma-separated, duplicate-free list of attribute-view
//!   IDs the block participates in.
//! - Setting an attribute to an empty string removes it.

use crate::db::DbError;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Block attribute listing the attribute views a block is bound to.
pub const NODE_ATTR_AVS: &str = "custom-avs";
/// Transient marker cleared from document nodes when their row is removed.
pub const NODE_ATTR_HIDDEN: &str = "custom-hidden";
/// Block attribute holding the compact `updated` timestamp.
pub const NODE_ATTR_UPDATED: &str = "updated";

pub type DocResult<T> = Result<T, DocError>;

#[derive(Debug)]
pub enum DocError {
    InvalidData(String),
    Db(DbError),
}

impl Display for DocError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidData(message) => write!(f, "invalid document data: {message}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for DocError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidData(_) => None,
            Self::Db(err) => Some(err),
        }
    }
}

impl From<DbError> for DocError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for DocError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Document,
    /// Block embedding an attribute view.
    AttributeView,
    Other,
}

impl BlockKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::AttributeView => "av",
            Self::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "document" => Some(Self::Document),
            "av" => Some(Self::AttributeView),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockNode {
    pub id: String,
    pub root_id: String,
    pub kind: BlockKind,
    /// Reference text used as the row's display text.
    pub content: String,
    pub hpath: String,
    /// Attribute view embedded by an `AttributeView` block.
    pub av_id: Option<String>,
    /// Epoch ms.
    pub updated: i64,
}

impl BlockNode {
    pub fn new(id: impl Into<String>, kind: BlockKind, content: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            root_id: id.clone(),
            id,
            kind,
            content: content.into(),
            hpath: String::new(),
            av_id: None,
            updated: 0,
        }
    }
}

/// Document collaborator consumed by the engine.
pub trait DocumentTree {
    fn get_block(&self, id: &str) -> DocResult<Option<BlockNode>>;

    fn get_block_attrs(&self, id: &str) -> DocResult<BTreeMap<String, String>>;

    /// Upserts the given attributes; empty values delete.
    fn set_block_attrs(&self, id: &str, attrs: &BTreeMap<String, String>) -> DocResult<()>;
}

/// Parses a `custom-avs` attribute value.
pub fn parse_av_ids(value: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for id in value.split(',').map(str::trim).filter(|id| !id.is_empty()) {
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

/// Attribute views a block is bound to.
pub fn block_av_ids(docs: &dyn DocumentTree, block_id: &str) -> DocResult<Vec<String>> {
    let attrs = docs.get_block_attrs(block_id)?;
    Ok(attrs
        .get(NODE_ATTR_AVS)
        .map(|value| parse_av_ids(value))
        .unwrap_or_default())
}

/// Adds `av_id` to the block's `custom-avs`. Returns `false` when the block
/// does not exist.
pub fn bind_block(docs: &dyn DocumentTree, block_id: &str, av_id: &str) -> DocResult<bool> {
    if docs.get_block(block_id)?.is_none() {
        return Ok(false);
    }
    let mut ids = block_av_ids(docs, block_id)?;
    if ids.iter().any(|id| id == av_id) {
        return Ok(true);
    }
    ids.push(av_id.to_string());
    let attrs = BTreeMap::from([(NODE_ATTR_AVS.to_string(), ids.join(","))]);
    docs.set_block_attrs(block_id, &attrs)?;
    Ok(true)
}

/// Removes `av_id` from the block's `custom-avs`; document nodes also lose
/// `custom-hidden`. Returns `false` when the block does not exist.
pub fn unbind_block(docs: &dyn DocumentTree, block_id: &str, av_id: &str) -> DocResult<bool> {
    let Some(node) = docs.get_block(block_id)? else {
        return Ok(false);
    };
    let mut ids = block_av_ids(docs, block_id)?;
    ids.retain(|id| id != av_id);

    let mut attrs = BTreeMap::from([(NODE_ATTR_AVS.to_string(), ids.join(","))]);
    if node.kind == BlockKind::Document {
        attrs.insert(NODE_ATTR_HIDDEN.to_string(), String::new());
    }
    docs.set_block_attrs(block_id, &attrs)?;
    Ok(true)
}

const BLOCK_SELECT_SQL: &str =
    "SELECT id, root_id, type, content, hpath, av_id, updated FROM blocks";

/// SQLite-backed document index over `blocks` and `block_attrs`.
pub struct SqliteDocumentTree<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteDocumentTree<'conn> {
    /// The connection must come from `open_db`/`open_db_in_memory`.
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    /// Inserts or replaces a block row.
    pub fn upsert_block(&self, node: &BlockNode) -> DocResult<()> {
        self.conn.execute(
            "INSERT INTO blocks (id, root_id, type, content, hpath, av_id, updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                root_id = excluded.root_id,
                type = excluded.type,
                content = excluded.content,
                hpath = excluded.hpath,
                av_id = excluded.av_id,
                updated = excluded.updated",
            params![
                node.id,
                node.root_id,
                node.kind.as_str(),
                node.content,
                node.hpath,
                node.av_id,
                node.updated
            ],
        )?;
        Ok(())
    }

    pub fn delete_block(&self, id: &str) -> DocResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM blocks WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}

pub(crate) fn parse_block_row(row: &Row<'_>) -> DocResult<BlockNode> {
    let kind_text: String = row.get("type")?;
    let kind = BlockKind::parse(&kind_text)
        .ok_or_else(|| DocError::InvalidData(format!("invalid block type `{kind_text}`")))?;
    Ok(BlockNode {
        id: row.get("id")?,
        root_id: row.get("root_id")?,
        kind,
        content: row.get("content")?,
        hpath: row.get("hpath")?,
        av_id: row.get("av_id")?,
        updated: row.get("updated")?,
    })
}

impl DocumentTree for SqliteDocumentTree<'_> {
    fn get_block(&self, id: &str) -> DocResult<Option<BlockNode>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{BLOCK_SELECT_SQL} WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_block_row(row)?)),
            None => Ok(None),
        }
    }

    fn get_block_attrs(&self, id: &str) -> DocResult<BTreeMap<String, String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, value FROM block_attrs WHERE block_id = ?1")?;
        let attrs = stmt
            .query_map(params![id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(attrs)
    }

    fn set_block_attrs(&self, id: &str, attrs: &BTreeMap<String, String>) -> DocResult<()> {
        let exists: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM blocks WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(DocError::InvalidData(format!("block not found: {id}")));
        }

        let tx = self.conn.unchecked_transaction()?;
        for (name, value) in attrs {
            if value.is_empty() {
                tx.execute(
                    "DELETE FROM block_attrs WHERE block_id = ?1 AND name = ?2",
                    params![id, name],
                )?;
            } else {
                tx.execute(
                    "INSERT INTO block_attrs (block_id, name, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(block_id, name) DO UPDATE SET value = excluded.value",
                    params![id, name, value],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        bind_block, block_av_ids, parse_av_ids, unbind_block, BlockKind, BlockNode, DocumentTree,
        SqliteDocumentTree, NODE_ATTR_HIDDEN,
    };
    use crate::db::open_db_in_memory;
    use std::collections::BTreeMap;

    #[test]
    fn parse_av_ids_trims_and_dedups() {
        assert_eq!(
            parse_av_ids(" a, b,,a "),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(parse_av_ids("").is_empty());
    }

    #[test]
    fn bind_and_unbind_maintain_custom_avs() {
        let conn = open_db_in_memory().unwrap();
        let docs = SqliteDocumentTree::new(&conn);
        docs.upsert_block(&BlockNode::new("b1", BlockKind::Document, "Doc"))
            .unwrap();
        docs.set_block_attrs(
            "b1",
            &BTreeMap::from([(NODE_ATTR_HIDDEN.to_string(), "true".to_string())]),
        )
        .unwrap();

        assert!(bind_block(&docs, "b1", "av1").unwrap());
        assert!(bind_block(&docs, "b1", "av2").unwrap());
        assert!(bind_block(&docs, "b1", "av1").unwrap());
        assert_eq!(
            block_av_ids(&docs, "b1").unwrap(),
            vec!["av1".to_string(), "av2".to_string()]
        );

        assert!(unbind_block(&docs, "b1", "av1").unwrap());
        let attrs = docs.get_block_attrs("b1").unwrap();
        assert_eq!(attrs.get("custom-avs").map(String::as_str), Some("av2"));
        assert!(!attrs.contains_key(NODE_ATTR_HIDDEN));

        assert!(!bind_block(&docs, "missing", "av1").unwrap());
    }

    #[test]
    fn get_block_reads_inserted_rows() {
        let conn = open_db_in_memory().unwrap();
        let docs = SqliteDocumentTree::new(&conn);
        let mut node = BlockNode::new("b1", BlockKind::Other, "Paragraph");
        node.updated = 42;
        docs.upsert_block(&node).unwrap();
        assert_eq!(docs.get_block("b1").unwrap(), Some(node));
        assert!(docs.get_block("b2").unwrap().is_none());
        assert!(docs.delete_block("b1").unwrap());
    }
}
