//! Relation graph maintainer.
//!
//! # Responsibility
//! - Keep two-way relation columns paired and their cells symmetric.
//! - Sever stale links when relation columns are re-pointed or removed.
//! - Keep the back-reference index current and queue invalidation events.
//!
//! # Invariants
//! - For a two-way relation, target row `t` lists source row `s` in the back
//!   column iff `s` lists `t` in the relation column.
//! - Every attribute view touched by one operation is loaded once, so a view
//!   related to itself is mutated through a single instance.

pub mod index;

use crate::event::{InvalidationEvent, InvalidationReason};
use crate::model::id::new_node_id;
use crate::model::value::ValuePayload;
use crate::model::{AttributeView, AvError, Key, KeyType, RelationConfig, Value, ViewColumn};
use crate::repo::av_store::{AvStore, StoreError};
use log::warn;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub use index::RelationIndex;

pub type RelationResult<T> = Result<T, RelationError>;

#[derive(Debug)]
pub enum RelationError {
    Av(AvError),
    Store(StoreError),
}

impl Display for RelationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Av(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RelationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Av(err) => Some(err),
            Self::Store(err) => Some(err),
        }
    }
}

impl From<AvError> for RelationError {
    fn from(value: AvError) -> Self {
        Self::Av(value)
    }
}

impl From<StoreError> for RelationError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// Document-side `custom-avs` change, applied only after the attribute
/// views it refers to are saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingChange {
    Bind { block_id: String, av_id: String },
    Unbind { block_id: String, av_id: String },
}

/// What a successful commit saved and what the caller must still flush.
#[derive(Debug, Default)]
pub struct Committed {
    pub saved: Vec<String>,
    pub events: Vec<InvalidationEvent>,
    pub bindings: Vec<BindingChange>,
}

/// Attribute views loaded by one operation, saved together on commit.
pub struct WorkingSet<'s> {
    store: &'s dyn AvStore,
    avs: BTreeMap<String, AttributeView>,
    dirty: Vec<String>,
    events: Vec<InvalidationEvent>,
    bindings: Vec<BindingChange>,
}

impl<'s> WorkingSet<'s> {
    pub fn new(store: &'s dyn AvStore) -> Self {
        Self {
            store,
            avs: BTreeMap::new(),
            dirty: Vec::new(),
            events: Vec::new(),
            bindings: Vec::new(),
        }
    }

    /// Loads (once) an existing attribute view.
    pub fn load(&mut self, av_id: &str) -> RelationResult<&mut AttributeView> {
        match self.avs.entry(av_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => Ok(entry.insert(self.store.load(av_id)?)),
        }
    }

    /// Loads an attribute view, creating it with a default view when absent.
    pub fn load_or_create(&mut self, av_id: &str) -> RelationResult<&mut AttributeView> {
        let created = match self.avs.entry(av_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                let (mut av, created) = self.store.load_or_create(av_id)?;
                if created {
                    av.ensure_default_view();
                }
                entry.insert(av);
                created
            }
        };
        if created {
            self.mark_dirty(av_id);
        }
        self.load(av_id)
    }

    pub fn mark_dirty(&mut self, av_id: &str) {
        if !self.dirty.iter().any(|id| id == av_id) {
            self.dirty.push(av_id.to_string());
        }
    }

    /// Queues an invalidation event (deduplicated).
    pub fn notify(&mut self, av_id: &str, reason: InvalidationReason) {
        let event = InvalidationEvent::new(av_id, reason);
        if !self.events.contains(&event) {
            self.events.push(event);
        }
    }

    /// Queues binding `block_id` to `av_id`.
    pub fn bind(&mut self, block_id: &str, av_id: &str) {
        self.bindings.push(BindingChange::Bind {
            block_id: block_id.to_string(),
            av_id: av_id.to_string(),
        });
    }

    /// Queues unbinding `block_id` from `av_id`.
    pub fn unbind(&mut self, block_id: &str, av_id: &str) {
        self.bindings.push(BindingChange::Unbind {
            block_id: block_id.to_string(),
            av_id: av_id.to_string(),
        });
    }

    pub fn pending_bindings(&self) -> &[BindingChange] {
        &self.bindings
    }

    pub fn is_dirty(&self, av_id: &str) -> bool {
        self.dirty.iter().any(|id| id == av_id)
    }

    /// Saves dirty attribute views in the order they were first touched.
    ///
    /// Views saved before a failing save stay saved. Queued binding changes
    /// are handed back only when every save succeeded; dropping the working
    /// set discards them.
    pub fn commit(self) -> RelationResult<Committed> {
        for av_id in &self.dirty {
            if let Some(av) = self.avs.get(av_id) {
                self.store.save(av)?;
            }
        }
        Ok(Committed {
            saved: self.dirty,
            events: self.events,
            bindings: self.bindings,
        })
    }
}

/// Classified relation cell edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationChange {
    /// Same set of related rows (possibly reordered).
    Unchanged,
    Grown { added: Vec<String> },
    Shrunk { removed: Vec<String> },
    /// Rows were both added and removed.
    Replaced {
        added: Vec<String>,
        removed: Vec<String>,
    },
}

impl RelationChange {
    pub fn classify(old: &[String], new: &[String]) -> Self {
        let added: Vec<String> = new.iter().filter(|id| !old.contains(id)).cloned().collect();
        let removed: Vec<String> = old.iter().filter(|id| !new.contains(id)).cloned().collect();
        match (added.is_empty(), removed.is_empty()) {
            (true, true) => Self::Unchanged,
            (false, true) => Self::Grown { added },
            (true, false) => Self::Shrunk { removed },
            (false, false) => Self::Replaced { added, removed },
        }
    }

    pub fn added(&self) -> &[String] {
        match self {
            Self::Grown { added } | Self::Replaced { added, .. } => added,
            _ => &[],
        }
    }

    pub fn removed(&self) -> &[String] {
        match self {
            Self::Shrunk { removed } | Self::Replaced { removed, .. } => removed,
            _ => &[],
        }
    }
}

/// Requested relation column configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSpec {
    pub target_av_id: String,
    pub is_two_way: bool,
    /// Back column name; defaults to `<source view name> <column name>`.
    pub back_key_name: Option<String>,
}

fn row_is_detached(av: &AttributeView, row_id: &str) -> bool {
    av.block_key_values()
        .and_then(|kv| kv.value(row_id))
        .map(|value| value.is_detached)
        .unwrap_or(false)
}

/// Adds `related_id` to the relation cell (`key_id`, `row_id`).
///
/// Returns `false` when the row does not exist.
pub fn link(
    av: &mut AttributeView,
    key_id: &str,
    row_id: &str,
    related_id: &str,
) -> Result<bool, AvError> {
    if !av.has_row(row_id) {
        return Ok(false);
    }
    let is_detached = row_is_detached(av, row_id);
    let kv = av.key_values_mut(key_id)?;
    match kv.value_mut(row_id) {
        Some(value) => {
            let actual = value.key_type();
            let relation = value
                .payload
                .relation_payload_mut()
                .ok_or(AvError::TypeMismatch {
                    expected: KeyType::Relation,
                    actual,
                })?;
            if !relation.block_ids.iter().any(|id| id == related_id) {
                relation.block_ids.push(related_id.to_string());
            }
        }
        None => {
            let mut value = Value::new(
                key_id,
                row_id,
                ValuePayload::relation(vec![related_id.to_string()]),
            );
            value.is_detached = is_detached;
            kv.values.push(value);
        }
    }
    Ok(true)
}

/// Removes `related_id` from the relation cell (`key_id`, `row_id`).
pub fn unlink(
    av: &mut AttributeView,
    key_id: &str,
    row_id: &str,
    related_id: &str,
) -> Result<bool, AvError> {
    let kv = av.key_values_mut(key_id)?;
    let Some(relation) = kv
        .value_mut(row_id)
        .and_then(|value| value.payload.relation_payload_mut())
    else {
        return Ok(false);
    };
    let before = relation.block_ids.len();
    relation.block_ids.retain(|id| id != related_id);
    Ok(relation.block_ids.len() != before)
}

/// Removes the back column `back_key_id` from `dest_av_id` and drops the
/// `dest -> src` index entry when nothing else in `dest` relates to `src`.
fn remove_back_key(
    ws: &mut WorkingSet<'_>,
    index: &RelationIndex,
    src_av_id: &str,
    dest_av_id: &str,
    back_key_id: &str,
) -> RelationResult<()> {
    let dest = match ws.load(dest_av_id) {
        Ok(dest) => dest,
        Err(RelationError::Store(StoreError::NotFound(_))) => {
            warn!(
                "event=relation_sever module=relation status=degraded src_av_id={src_av_id} dest_av_id={dest_av_id} reason=target_missing"
            );
            index.remove(src_av_id, dest_av_id);
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let removed = dest.has_key(back_key_id);
    if removed {
        dest.remove_key(back_key_id)?;
    }
    if dest.relation_keys_to(src_av_id).is_empty() {
        index.remove(dest_av_id, src_av_id);
    }
    if removed {
        ws.mark_dirty(dest_av_id);
        if dest_av_id != src_av_id {
            ws.notify(dest_av_id, InvalidationReason::ColumnRemoved);
        }
    }
    Ok(())
}

/// Creates or re-points relation column `key_id` of `src_av_id`.
///
/// Severs the previous link first (removing a stale back column), then
/// creates or renames the back column for two-way relations and back-fills
/// it from the existing relation cells.
pub fn update_relation_column(
    ws: &mut WorkingSet<'_>,
    index: &RelationIndex,
    src_av_id: &str,
    key_id: &str,
    spec: &RelationSpec,
) -> RelationResult<()> {
    let target = spec.target_av_id.as_str();
    let (src_name, column_name, previous) = {
        let src = ws.load(src_av_id)?;
        let key = src.key(key_id)?;
        if key.key_type() != KeyType::Relation {
            return Err(AvError::TypeMismatch {
                expected: KeyType::Relation,
                actual: key.key_type(),
            }
            .into());
        }
        (src.name.clone(), key.name.clone(), key.relation().cloned())
    };
    ws.load(target)?;

    let mut reusable_back_key = None;
    if let Some(previous) = &previous {
        let same_target = previous.av_id == target;
        if previous.is_two_way && !previous.back_key_id.is_empty() {
            if same_target && spec.is_two_way {
                reusable_back_key = Some(previous.back_key_id.clone());
            } else {
                remove_back_key(ws, index, src_av_id, &previous.av_id, &previous.back_key_id)?;
            }
        }
    }

    let back_key_id = if spec.is_two_way {
        let dest = ws.load(target)?;
        reusable_back_key
            .filter(|id| dest.has_key(id))
            .unwrap_or_else(new_node_id)
    } else {
        String::new()
    };

    {
        let src = ws.load(src_av_id)?;
        if let Some(slot) = src.key_mut(key_id)?.relation_mut() {
            *slot = Some(RelationConfig {
                av_id: target.to_string(),
                is_two_way: spec.is_two_way,
                back_key_id: back_key_id.clone(),
            });
        }
    }
    ws.mark_dirty(src_av_id);
    index.upsert(src_av_id, target);

    if let Some(previous) = previous.filter(|previous| previous.av_id != target) {
        if ws.load(src_av_id)?.relation_keys_to(&previous.av_id).is_empty() {
            index.remove(src_av_id, &previous.av_id);
        }
    }

    if spec.is_two_way {
        let explicit_name = spec
            .back_key_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty());
        let back_config = RelationConfig {
            av_id: src_av_id.to_string(),
            is_two_way: true,
            back_key_id: key_id.to_string(),
        };
        let dest = ws.load(target)?;
        match dest.key_mut(&back_key_id) {
            Ok(back) => {
                if let Some(name) = explicit_name {
                    back.name = name.to_string();
                }
                if let Some(slot) = back.relation_mut() {
                    *slot = Some(back_config);
                }
            }
            Err(_) => {
                let name = explicit_name
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{src_name} {column_name}").trim().to_string());
                let mut back = Key::new(back_key_id.clone(), name, "", KeyType::Relation);
                if let Some(slot) = back.relation_mut() {
                    *slot = Some(back_config);
                }
                dest.add_key(back)?;
                for view in &mut dest.views {
                    view.table.columns.push(ViewColumn::new(back_key_id.clone()));
                }
            }
        }
        backfill_back_column(ws, src_av_id, key_id, target, &back_key_id)?;
        ws.mark_dirty(target);
        index.upsert(target, src_av_id);
    }

    if target != src_av_id {
        ws.notify(target, InvalidationReason::RelationChanged);
    }
    Ok(())
}

fn backfill_back_column(
    ws: &mut WorkingSet<'_>,
    src_av_id: &str,
    key_id: &str,
    target: &str,
    back_key_id: &str,
) -> RelationResult<()> {
    let links: Vec<(String, Vec<String>)> = ws
        .load(src_av_id)?
        .key_values(key_id)?
        .values
        .iter()
        .filter_map(|value| {
            value
                .payload
                .relation_payload()
                .map(|relation| (value.block_id.clone(), relation.block_ids.clone()))
        })
        .collect();
    let dest = ws.load(target)?;
    for (row_id, related) in links {
        for target_row in related {
            link(dest, back_key_id, &target_row, &row_id)?;
        }
    }
    Ok(())
}

/// Drops the relation configuration of `key_id`, removing the paired back
/// column of a two-way relation. The key itself stays.
pub fn sever_relation_column(
    ws: &mut WorkingSet<'_>,
    index: &RelationIndex,
    src_av_id: &str,
    key_id: &str,
) -> RelationResult<()> {
    let relation = ws
        .load(src_av_id)?
        .key_mut(key_id)?
        .relation_mut()
        .and_then(|slot| slot.take());
    let Some(relation) = relation else {
        return Ok(());
    };
    ws.mark_dirty(src_av_id);
    if ws.load(src_av_id)?.relation_keys_to(&relation.av_id).is_empty() {
        index.remove(src_av_id, &relation.av_id);
    }
    if relation.is_two_way && !relation.back_key_id.is_empty() {
        remove_back_key(ws, index, src_av_id, &relation.av_id, &relation.back_key_id)?;
    }
    Ok(())
}

/// Removes relation column `key_id` from `src_av_id`, removing the paired
/// back column of a two-way relation.
pub fn remove_relation_column(
    ws: &mut WorkingSet<'_>,
    index: &RelationIndex,
    src_av_id: &str,
    key_id: &str,
) -> RelationResult<()> {
    sever_relation_column(ws, index, src_av_id, key_id)?;
    ws.load(src_av_id)?.remove_key(key_id)?;
    ws.mark_dirty(src_av_id);
    Ok(())
}

fn dedup_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    ids.into_iter()
        .filter(|id| !id.is_empty() && seen.insert(id.clone()))
        .collect()
}

/// Sets relation cell (`key_id`, `row_id`) and mirrors the change into the
/// back column of a two-way relation.
pub fn update_relation_cell(
    ws: &mut WorkingSet<'_>,
    index: &RelationIndex,
    src_av_id: &str,
    key_id: &str,
    row_id: &str,
    block_ids: Vec<String>,
) -> RelationResult<RelationChange> {
    let block_ids = dedup_ids(block_ids);
    let (config, change) = {
        let src = ws.load(src_av_id)?;
        let config = src.key(key_id)?.relation().cloned().ok_or_else(|| {
            AvError::InvariantViolation(format!("relation column {key_id} has no target"))
        })?;
        if !src.has_row(row_id) {
            return Err(AvError::RowNotFound(row_id.to_string()).into());
        }
        let is_detached = row_is_detached(src, row_id);
        let kv = src.key_values_mut(key_id)?;
        let previous = kv
            .value(row_id)
            .and_then(|value| value.payload.relation_payload())
            .map(|relation| relation.block_ids.clone())
            .unwrap_or_default();
        match kv.value_mut(row_id) {
            Some(value) => value.payload = ValuePayload::relation(block_ids.clone()),
            None => {
                let mut value = Value::new(key_id, row_id, ValuePayload::relation(block_ids.clone()));
                value.is_detached = is_detached;
                kv.values.push(value);
            }
        }
        (config, RelationChange::classify(&previous, &block_ids))
    };
    ws.mark_dirty(src_av_id);

    let touches_target = !change.added().is_empty() || !change.removed().is_empty();
    if config.is_two_way && !config.back_key_id.is_empty() && touches_target {
        let dest = ws.load(&config.av_id)?;
        for target_row in change.added() {
            link(dest, &config.back_key_id, target_row, row_id)?;
        }
        for target_row in change.removed() {
            unlink(dest, &config.back_key_id, target_row, row_id)?;
        }
        ws.mark_dirty(&config.av_id);
        if config.av_id != src_av_id {
            ws.notify(&config.av_id, InvalidationReason::BackRelationChanged);
        }
    }

    for dependent in index.sources_of(src_av_id) {
        if dependent != src_av_id {
            ws.notify(&dependent, InvalidationReason::CellChanged);
        }
    }
    Ok(change)
}

/// Strips removed rows from the back columns of two-way relations.
pub fn sever_rows(
    ws: &mut WorkingSet<'_>,
    src_av_id: &str,
    row_ids: &BTreeSet<String>,
) -> RelationResult<()> {
    let mut pending: Vec<(RelationConfig, String, Vec<String>)> = Vec::new();
    for kv in &ws.load(src_av_id)?.key_values {
        let Some(config) = kv.key.relation().filter(|config| config.is_two_way) else {
            continue;
        };
        for value in kv.values.iter().filter(|value| row_ids.contains(&value.block_id)) {
            if let Some(relation) = value.payload.relation_payload() {
                pending.push((config.clone(), value.block_id.clone(), relation.block_ids.clone()));
            }
        }
    }

    for (config, row_id, related) in pending {
        let dest = match ws.load(&config.av_id) {
            Ok(dest) => dest,
            Err(RelationError::Store(StoreError::NotFound(_))) => continue,
            Err(err) => return Err(err),
        };
        let mut changed = false;
        for target_row in &related {
            changed |= unlink(dest, &config.back_key_id, target_row, &row_id).unwrap_or(false);
        }
        if changed {
            ws.mark_dirty(&config.av_id);
            if config.av_id != src_av_id {
                ws.notify(&config.av_id, InvalidationReason::BackRelationChanged);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{BindingChange, RelationChange, WorkingSet};
    use crate::db::open_db_in_memory;
    use crate::repo::av_store::{AvStore, SqliteAvStore};

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn classify_edits() {
        assert_eq!(
            RelationChange::classify(&ids(&["a", "b"]), &ids(&["b", "a"])),
            RelationChange::Unchanged
        );
        assert_eq!(
            RelationChange::classify(&ids(&["a"]), &ids(&["a", "b"])),
            RelationChange::Grown { added: ids(&["b"]) }
        );
        assert_eq!(
            RelationChange::classify(&ids(&["a", "b"]), &ids(&["a"])),
            RelationChange::Shrunk {
                removed: ids(&["b"])
            }
        );
        let replaced = RelationChange::classify(&ids(&["a"]), &ids(&["b"]));
        assert_eq!(replaced.added(), ids(&["b"]).as_slice());
        assert_eq!(replaced.removed(), ids(&["a"]).as_slice());
    }

    #[test]
    fn commit_hands_back_queued_bindings_in_order() {
        let conn = open_db_in_memory().unwrap();
        let store = SqliteAvStore::new(&conn);
        let mut ws = WorkingSet::new(&store);
        ws.load_or_create("A").unwrap();
        ws.bind("b1", "A");
        ws.unbind("b0", "A");
        assert_eq!(ws.pending_bindings().len(), 2);

        let committed = ws.commit().unwrap();
        assert_eq!(committed.saved, vec!["A".to_string()]);
        assert_eq!(
            committed.bindings,
            vec![
                BindingChange::Bind {
                    block_id: "b1".to_string(),
                    av_id: "A".to_string()
                },
                BindingChange::Unbind {
                    block_id: "b0".to_string(),
                    av_id: "A".to_string()
                },
            ]
        );
        assert!(store.exists("A").unwrap());
    }
}
