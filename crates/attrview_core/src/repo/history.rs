//! Point-in-time attribute-view sources: history archives and snapshots.
//!
//! # Responsibility
//! - Locate an archived attribute-view JSON for a timestamp.
//! - Fetch an attribute view from a content-addressed snapshot repository.
//!
//! # Invariants
//! - Lookups fall back (archive -> live copy -> fresh empty view) and never
//!   fail just because a copy is missing.

use crate::model::AttributeView;
use crate::repo::av_store::{
    av_json_path, decode_attribute_view, validate_av_id, StoreError, StoreResult,
};
use chrono::{Local, TimeZone};
use log::{info, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name prefix layout of history archive directories.
pub const HISTORY_DIR_LAYOUT: &str = "%Y-%m-%d-%H%M%S";

/// External content-addressed snapshot repository.
pub trait SnapshotRepository {
    /// Raw JSON of `storage/av/<av_id>.json` in snapshot `index_id`, or
    /// `None` when the snapshot does not contain it.
    fn attribute_view_json(&self, index_id: &str, av_id: &str) -> StoreResult<Option<Vec<u8>>>;
}

/// Loads an attribute view from a snapshot, or a fresh one when the
/// snapshot lacks it.
pub fn load_from_snapshot(
    repo: &dyn SnapshotRepository,
    index_id: &str,
    av_id: &str,
) -> StoreResult<AttributeView> {
    validate_av_id(av_id)?;
    match repo.attribute_view_json(index_id, av_id)? {
        Some(data) => decode_attribute_view(av_id, &data),
        None => {
            warn!(
                "event=av_snapshot_load module=history status=degraded av_id={av_id} index_id={index_id} reason=missing"
            );
            Ok(AttributeView::new(av_id))
        }
    }
}

/// Archived copies under `<history_dir>/<YYYY-MM-DD-HHMMSS>*/`.
#[derive(Debug, Clone)]
pub struct HistoryArchive {
    history_dir: PathBuf,
    data_dir: PathBuf,
}

impl HistoryArchive {
    pub fn new(history_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            history_dir: history_dir.into(),
            data_dir: data_dir.into(),
        }
    }

    /// Archive directory whose name starts with the formatted timestamp.
    pub fn archive_dir(&self, created_unix: i64) -> StoreResult<Option<PathBuf>> {
        let Some(created) = Local.timestamp_opt(created_unix, 0).single() else {
            return Ok(None);
        };
        let prefix = created.format(HISTORY_DIR_LAYOUT).to_string();
        let entries = match fs::read_dir(&self.history_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(StoreError::Io {
                    av_id: "*".to_string(),
                    source: err,
                })
            }
        };
        let mut matches: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(&prefix))
            .map(|entry| entry.path())
            .collect();
        matches.sort();
        Ok(matches.into_iter().next())
    }

    /// Archived copy, else the live copy, else a fresh attribute view.
    pub fn load(&self, av_id: &str, created_unix: i64) -> StoreResult<AttributeView> {
        validate_av_id(av_id)?;
        let archived = self
            .archive_dir(created_unix)?
            .map(|dir| av_json_path(&dir, av_id))
            .filter(|path| path.is_file());
        let source = match archived {
            Some(path) => Some(("archive", path)),
            None => Some(("live", av_json_path(&self.data_dir, av_id))).filter(|(_, path)| path.is_file()),
        };

        match source {
            Some((origin, path)) => {
                info!(
                    "event=av_history_load module=history status=ok av_id={av_id} origin={origin}"
                );
                read_json(av_id, &path)
            }
            None => {
                warn!(
                    "event=av_history_load module=history status=degraded av_id={av_id} reason=missing"
                );
                Ok(AttributeView::new(av_id))
            }
        }
    }
}

fn read_json(av_id: &str, path: &Path) -> StoreResult<AttributeView> {
    let data = fs::read(path).map_err(|err| StoreError::Io {
        av_id: av_id.to_string(),
        source: err,
    })?;
    decode_attribute_view(av_id, &data)
}

#[cfg(test)]
mod tests {
    use super::{HistoryArchive, HISTORY_DIR_LAYOUT};
    use crate::model::AttributeView;
    use crate::repo::av_store::{av_json_path, encode_attribute_view};
    use chrono::{Local, TimeZone};

    fn write_av(dir: &std::path::Path, name: &str) {
        let mut av = AttributeView::new("av1");
        av.name = name.to_string();
        let path = av_json_path(dir, "av1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, encode_attribute_view(&av).unwrap()).unwrap();
    }

    #[test]
    fn load_prefers_archive_then_live_then_fresh() {
        let history = tempfile::tempdir().unwrap();
        let data = tempfile::tempdir().unwrap();
        let archive = HistoryArchive::new(history.path(), data.path());
        let created = 1_700_000_000;

        assert_eq!(archive.load("av1", created).unwrap().name, "");

        write_av(data.path(), "live");
        assert_eq!(archive.load("av1", created).unwrap().name, "live");

        let prefix = Local
            .timestamp_opt(created, 0)
            .single()
            .unwrap()
            .format(HISTORY_DIR_LAYOUT)
            .to_string();
        let snapshot_dir = history.path().join(format!("{prefix}-update"));
        write_av(&snapshot_dir, "archived");
        assert_eq!(archive.load("av1", created).unwrap().name, "archived");
    }
}
