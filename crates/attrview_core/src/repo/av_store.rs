//! Attribute-view store contracts and implementations.
//!
//! # Responsibility
//! - Load, create and persist one attribute view by ID.
//! - Keep the byte layout (JSON file or SQLite row) behind `AvStore`.
//!
//! # Invariants
//! - A save writes the whole attribute view or nothing.
//! - Derived payload contents are stripped before every save.
//! - Attribute-view IDs never escape the storage directory.

use crate::db::DbError;
use crate::model::id::now_millis;
use crate::model::AttributeView;
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Storage subpath (relative to a data directory) holding attribute views.
pub const AV_STORAGE_SUBPATH: &str = "storage/av";

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    InvalidId(String),
    Malformed { av_id: String, message: String },
    Io { av_id: String, source: io::Error },
    Db(DbError),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(av_id) => write!(f, "attribute view not found: {av_id}"),
            Self::InvalidId(av_id) => write!(f, "invalid attribute view id `{av_id}`"),
            Self::Malformed { av_id, message } => {
                write!(f, "malformed attribute view {av_id}: {message}")
            }
            Self::Io { av_id, source } => write!(f, "attribute view {av_id} io: {source}"),
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Db(err) => Some(err),
            Self::NotFound(_) | Self::InvalidId(_) | Self::Malformed { .. } => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Persistence boundary for attribute views.
pub trait AvStore {
    fn exists(&self, av_id: &str) -> StoreResult<bool>;

    /// Loads a persisted attribute view; `NotFound` when it does not exist.
    fn load(&self, av_id: &str) -> StoreResult<AttributeView>;

    /// Persists the whole attribute view.
    fn save(&self, av: &AttributeView) -> StoreResult<()>;

    /// IDs of every persisted attribute view.
    fn list_ids(&self) -> StoreResult<Vec<String>>;

    /// Fresh in-memory attribute view with a primary key and zero views.
    ///
    /// Nothing is persisted until `save`.
    fn create(&self, av_id: &str) -> StoreResult<AttributeView> {
        validate_av_id(av_id)?;
        Ok(AttributeView::new(av_id))
    }

    /// Loads the attribute view or creates it; the flag reports creation.
    fn load_or_create(&self, av_id: &str) -> StoreResult<(AttributeView, bool)> {
        match self.load(av_id) {
            Ok(av) => Ok((av, false)),
            Err(StoreError::NotFound(_)) => Ok((self.create(av_id)?, true)),
            Err(err) => Err(err),
        }
    }
}

/// Rejects empty IDs and IDs that could leave the storage directory.
pub fn validate_av_id(av_id: &str) -> StoreResult<()> {
    let valid = !av_id.is_empty()
        && av_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(av_id.to_string()))
    }
}

/// Serializes an attribute view for persistence with derived payloads
/// stripped.
pub fn encode_attribute_view(av: &AttributeView) -> StoreResult<String> {
    let mut persisted = av.clone();
    persisted.strip_derived();
    serde_json::to_string_pretty(&persisted).map_err(|err| StoreError::Malformed {
        av_id: av.id.clone(),
        message: err.to_string(),
    })
}

/// Parses persisted attribute-view JSON.
pub fn decode_attribute_view(av_id: &str, data: &[u8]) -> StoreResult<AttributeView> {
    let mut av: AttributeView =
        serde_json::from_slice(data).map_err(|err| StoreError::Malformed {
            av_id: av_id.to_string(),
            message: err.to_string(),
        })?;
    if av.id.is_empty() {
        av.id = av_id.to_string();
    }
    if av.primary_key().is_none() {
        return Err(StoreError::Malformed {
            av_id: av_id.to_string(),
            message: "missing primary key".to_string(),
        });
    }
    Ok(av)
}

/// Path of an attribute view's JSON under `data_dir`.
pub fn av_json_path(data_dir: &Path, av_id: &str) -> PathBuf {
    data_dir.join(AV_STORAGE_SUBPATH).join(format!("{av_id}.json"))
}

/// One pretty JSON document per attribute view at
/// `<data_dir>/storage/av/<id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileAvStore {
    data_dir: PathBuf,
}

impl JsonFileAvStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn path(&self, av_id: &str) -> StoreResult<PathBuf> {
        validate_av_id(av_id)?;
        Ok(av_json_path(&self.data_dir, av_id))
    }
}

fn io_error(av_id: &str, source: io::Error) -> StoreError {
    StoreError::Io {
        av_id: av_id.to_string(),
        source,
    }
}

impl AvStore for JsonFileAvStore {
    fn exists(&self, av_id: &str) -> StoreResult<bool> {
        Ok(self.path(av_id)?.is_file())
    }

    fn load(&self, av_id: &str) -> StoreResult<AttributeView> {
        let path = self.path(av_id)?;
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(av_id.to_string()))
            }
            Err(err) => return Err(io_error(av_id, err)),
        };
        decode_attribute_view(av_id, &data)
    }

    fn save(&self, av: &AttributeView) -> StoreResult<()> {
        let path = self.path(&av.id)?;
        let data = encode_attribute_view(av)?;
        let result = write_atomically(&path, data.as_bytes());
        match &result {
            Ok(()) => info!(
                "event=av_save module=store status=ok backend=file av_id={} bytes={}",
                av.id,
                data.len()
            ),
            Err(err) => error!(
                "event=av_save module=store status=error backend=file av_id={} error={err}",
                av.id
            ),
        }
        result.map_err(|err| io_error(&av.id, err))
    }

    fn list_ids(&self) -> StoreResult<Vec<String>> {
        let dir = self.data_dir.join(AV_STORAGE_SUBPATH);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error("*", err)),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let path = entry.map_err(|err| io_error("*", err))?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

fn write_atomically(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

/// Attribute views stored as JSON documents in the `attribute_views` table.
pub struct SqliteAvStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteAvStore<'conn> {
    /// The connection must come from `open_db`/`open_db_in_memory`.
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }
}

impl AvStore for SqliteAvStore<'_> {
    fn exists(&self, av_id: &str) -> StoreResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM attribute_views WHERE id = ?1",
                params![av_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn load(&self, av_id: &str) -> StoreResult<AttributeView> {
        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM attribute_views WHERE id = ?1",
                params![av_id],
                |row| row.get(0),
            )
            .optional()?;
        let data = data.ok_or_else(|| StoreError::NotFound(av_id.to_string()))?;
        decode_attribute_view(av_id, data.as_bytes())
    }

    fn save(&self, av: &AttributeView) -> StoreResult<()> {
        validate_av_id(&av.id)?;
        let data = encode_attribute_view(av)?;
        self.conn
            .execute(
                "INSERT INTO attribute_views (id, data, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
                params![av.id, data, now_millis()],
            )
            .map_err(|err| {
                error!(
                    "event=av_save module=store status=error backend=sqlite av_id={} error={err}",
                    av.id
                );
                err
            })?;
        info!(
            "event=av_save module=store status=ok backend=sqlite av_id={} bytes={}",
            av.id,
            data.len()
        );
        Ok(())
    }

    fn list_ids(&self) -> StoreResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM attribute_views ORDER BY id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::{validate_av_id, AvStore, JsonFileAvStore, SqliteAvStore, StoreError};
    use crate::db::open_db_in_memory;
    use crate::model::value::ValuePayload;
    use crate::model::{Key, KeyType, Value};

    #[test]
    fn validate_av_id_rejects_path_tricks() {
        assert!(validate_av_id("20240101120000-abcdefg").is_ok());
        assert!(validate_av_id("").is_err());
        assert!(validate_av_id("../etc").is_err());
        assert!(validate_av_id("a/b").is_err());
    }

    #[test]
    fn sqlite_store_roundtrips_and_strips_derived_contents() {
        let conn = open_db_in_memory().unwrap();
        let store = SqliteAvStore::new(&conn);
        assert!(matches!(store.load("av1"), Err(StoreError::NotFound(_))));

        let (mut av, created) = store.load_or_create("av1").unwrap();
        assert!(created);
        av.add_key(Key::new("rel", "Rel", "", KeyType::Relation)).unwrap();
        let mut value = Value::new("rel", "r1", ValuePayload::relation(vec!["s1".to_string()]));
        value
            .payload
            .relation_payload_mut()
            .unwrap()
            .contents
            .push("cached".to_string());
        av.key_values_mut("rel").unwrap().values.push(value);
        store.save(&av).unwrap();

        assert!(store.exists("av1").unwrap());
        let loaded = store.load("av1").unwrap();
        let relation = loaded.value("rel", "r1").unwrap().payload.relation_payload().unwrap();
        assert_eq!(relation.block_ids, vec!["s1".to_string()]);
        assert!(relation.contents.is_empty());
        assert_eq!(store.list_ids().unwrap(), vec!["av1".to_string()]);
    }

    #[test]
    fn json_store_reports_missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileAvStore::new(dir.path());
        assert!(matches!(store.load("av1"), Err(StoreError::NotFound(_))));

        let path = super::av_json_path(dir.path(), "av1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            store.load("av1"),
            Err(StoreError::Malformed { .. })
        ));
    }
}
