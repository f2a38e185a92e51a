//! Process-wide back-reference index between attribute views.
//!
//! # Invariants
//! - Derived data only: used to pick invalidation targets, never to compute
//!   values.

use crate::repo::av_store::{AvStore, StoreResult};
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// `target av -> source avs holding a relation column pointing at it`.
#[derive(Debug, Default)]
pub struct RelationIndex {
    back_refs: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl RelationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, BTreeSet<String>>> {
        self.back_refs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records that `src_av_id` relates to `dest_av_id`.
    pub fn upsert(&self, src_av_id: &str, dest_av_id: &str) {
        self.entries()
            .entry(dest_av_id.to_string())
            .or_default()
            .insert(src_av_id.to_string());
    }

    pub fn remove(&self, src_av_id: &str, dest_av_id: &str) {
        let mut entries = self.entries();
        if let Some(sources) = entries.get_mut(dest_av_id) {
            sources.remove(src_av_id);
            if sources.is_empty() {
                entries.remove(dest_av_id);
            }
        }
    }

    /// Attribute views that relate to `av_id`.
    pub fn sources_of(&self, av_id: &str) -> Vec<String> {
        self.entries()
            .get(av_id)
            .map(|sources| sources.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Rebuilds the whole index from every stored attribute view.
    ///
    /// Unreadable attribute views are skipped. Returns the number of links.
    pub fn rebuild(&self, store: &dyn AvStore) -> StoreResult<usize> {
        let mut rebuilt: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for av_id in store.list_ids()? {
            let av = match store.load(&av_id) {
                Ok(av) => av,
                Err(err) => {
                    warn!("event=relation_index_rebuild module=relation status=degraded av_id={av_id} error={err}");
                    continue;
                }
            };
            for kv in &av.key_values {
                if let Some(relation) = kv.key.relation() {
                    rebuilt
                        .entry(relation.av_id.clone())
                        .or_default()
                        .insert(av.id.clone());
                }
            }
        }
        let links = rebuilt.values().map(BTreeSet::len).sum();
        *self.entries() = rebuilt;
        info!("event=relation_index_rebuild module=relation status=ok links={links}");
        Ok(links)
    }
}

#[cfg(test)]
mod tests {
    use super::RelationIndex;

    #[test]
    fn upsert_remove_and_query() {
        let index = RelationIndex::new();
        index.upsert("a", "b");
        index.upsert("c", "b");
        index.upsert("a", "b");
        assert_eq!(index.sources_of("b"), vec!["a".to_string(), "c".to_string()]);
        index.remove("a", "b");
        assert_eq!(index.sources_of("b"), vec!["c".to_string()]);
        index.remove("c", "b");
        assert!(index.sources_of("b").is_empty());
        index.remove("x", "y");
    }
}
