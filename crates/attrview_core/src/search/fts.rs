//! SQLite FTS5-based attribute-view search.
//!
//! # Responsibility
//! - Keyword search over blocks that embed an attribute view.
//! - Return one hit per attribute view with its current name.
//!
//! # Invariants
//! - Hits are de-duplicated by attribute-view ID, best rank first.
//! - A blank keyword lists the most recently updated attribute views.

use crate::db::DbError;
use crate::repo::av_store::{AvStore, StoreError};
use crate::repo::document::{parse_block_row, BlockNode, DocError};
use log::warn;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Number of hits listed for a blank keyword.
pub const RECENT_LIMIT: usize = 10;

pub type SearchResult<T> = Result<T, SearchError>;

#[derive(Debug)]
pub enum SearchError {
    /// User-provided query cannot be parsed by FTS5 syntax.
    InvalidQuery {
        query: String,
        message: String,
    },
    Db(DbError),
    InvalidData(String),
}

impl Display for SearchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidQuery { query, message } => {
                write!(f, "invalid full-text query `{query}`: {message}")
            }
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid search row: {message}"),
        }
    }
}

impl Error for SearchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidQuery { .. } => None,
            Self::Db(err) => Some(err),
            Self::InvalidData(_) => None,
        }
    }
}

impl From<DbError> for SearchError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for SearchError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<DocError> for SearchError {
    fn from(value: DocError) -> Self {
        match value {
            DocError::Db(err) => Self::Db(err),
            other => Self::InvalidData(other.to_string()),
        }
    }
}

/// Single hit returned by [`search_attribute_views`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvSearchHit {
    pub av_id: String,
    /// Current attribute-view name; empty when the view is not stored.
    pub av_name: String,
    /// Embedding block.
    pub block_id: String,
    pub hpath: String,
}

/// Searches attribute views whose embedding block matches `keyword`.
///
/// `page` is 1-based; a page beyond the hits is empty.
pub fn search_attribute_views(
    conn: &Connection,
    store: &dyn AvStore,
    keyword: &str,
    page: usize,
    page_size: usize,
) -> SearchResult<Vec<AvSearchHit>> {
    if page_size == 0 {
        return Ok(Vec::new());
    }
    let blocks = match build_match_expression(keyword) {
        Some(match_expr) => matching_blocks(conn, &match_expr)?,
        None => recent_blocks(conn)?,
    };

    let mut seen = BTreeSet::new();
    let hits: Vec<AvSearchHit> = blocks
        .into_iter()
        .filter_map(|block| {
            let av_id = block.av_id.clone().filter(|id| !id.is_empty())?;
            seen.insert(av_id.clone()).then_some((av_id, block))
        })
        .map(|(av_id, block)| AvSearchHit {
            av_name: av_name(store, &av_id),
            av_id,
            block_id: block.id,
            hpath: block.hpath,
        })
        .collect();

    let start = page.saturating_sub(1).saturating_mul(page_size);
    Ok(hits.into_iter().skip(start).take(page_size).collect())
}

fn av_name(store: &dyn AvStore, av_id: &str) -> String {
    match store.load(av_id) {
        Ok(av) => av.name,
        Err(StoreError::NotFound(_)) => String::new(),
        Err(err) => {
            warn!(
                "event=av_search module=search status=degraded av_id={av_id} reason=load_failed error={err}"
            );
            String::new()
        }
    }
}

fn matching_blocks(conn: &Connection, match_expr: &str) -> SearchResult<Vec<BlockNode>> {
    let sql = "SELECT blocks.id, blocks.root_id, blocks.type, blocks.content, blocks.hpath,
                      blocks.av_id, blocks.updated
               FROM blocks_fts
               JOIN blocks ON blocks.rowid = blocks_fts.rowid
               WHERE blocks_fts MATCH ?
                 AND blocks.type = 'av'
               ORDER BY bm25(blocks_fts), blocks.updated DESC, blocks.id ASC";
    query_blocks(conn, sql, vec![Value::Text(match_expr.to_string())], match_expr)
}

fn recent_blocks(conn: &Connection) -> SearchResult<Vec<BlockNode>> {
    let sql = "SELECT id, root_id, type, content, hpath, av_id, updated
               FROM blocks
               WHERE type = 'av'
               ORDER BY updated DESC, id ASC
               LIMIT ?";
    query_blocks(conn, sql, vec![Value::Integer(RECENT_LIMIT as i64)], "")
}

fn query_blocks(
    conn: &Connection,
    sql: &str,
    bind_values: Vec<Value>,
    match_expr: &str,
) -> SearchResult<Vec<BlockNode>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt
        .query(params_from_iter(bind_values))
        .map_err(|err| map_query_error(err, match_expr))?;
    let mut blocks = Vec::new();
    while let Some(row) = rows.next().map_err(|err| map_query_error(err, match_expr))? {
        blocks.push(parse_block_row(row)?);
    }
    Ok(blocks)
}

fn build_match_expression(keyword: &str) -> Option<String> {
    let terms = keyword
        .split_whitespace()
        .map(escape_fts_term)
        .collect::<Vec<_>>();
    if terms.is_empty() {
        return None;
    }
    Some(terms.join(" AND "))
}

fn escape_fts_term(raw: &str) -> String {
    let escaped = raw.replace('"', "\"\"");
    format!("\"{escaped}\"")
}

fn map_query_error(err: rusqlite::Error, query: &str) -> SearchError {
    if is_match_syntax_error(&err) {
        return SearchError::InvalidQuery {
            query: query.to_string(),
            message: err.to_string(),
        };
    }
    SearchError::Db(DbError::Sqlite(err))
}

fn is_match_syntax_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => {
            let msg = message.to_lowercase();
            (msg.contains("fts5") && msg.contains("syntax"))
                || msg.contains("malformed match expression")
                || msg.contains("unterminated")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::{build_match_expression, escape_fts_term};

    #[test]
    fn terms_are_quoted_and_joined() {
        assert_eq!(escape_fts_term("a\"b"), "\"a\"\"b\"");
        assert_eq!(
            build_match_expression("  tasks  2024 ").as_deref(),
            Some("\"tasks\" AND \"2024\"")
        );
        assert_eq!(build_match_expression("   "), None);
    }
}
