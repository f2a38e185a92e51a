//! Attribute view aggregate: schema, values and views of one mini-table.
//!
//! # Responsibility
//! - Own the key/value registry and the list of views.
//! - Provide lookups by key ID, (key ID, row ID) and view ID.
//!
//! # Invariants
//! - Exactly one `KeyValues` entry per key ID.
//! - Exactly one key of type `block`; its values enumerate every row.
//! - `Value::key_type()` equals the owning key's type.

use crate::model::id::new_node_id;
use crate::model::key::{Key, KeyType};
use crate::model::value::Value;
use crate::model::view::{View, ViewColumn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Version of the persisted JSON layout.
pub const CURRENT_SPEC: u32 = 1;
/// Name of the primary column created with a new attribute view.
pub const PRIMARY_KEY_NAME: &str = "Block";
/// Name of the view synthesized for an attribute view without views.
pub const DEFAULT_VIEW_NAME: &str = "Table";

pub type AvResult<T> = Result<T, AvError>;

/// Lookup and validation failures on the in-memory model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvError {
    KeyNotFound(String),
    ViewNotFound(String),
    RowNotFound(String),
    TypeMismatch { expected: KeyType, actual: KeyType },
    InvariantViolation(String),
}

impl Display for AvError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyNotFound(id) => write!(f, "key not found: {id}"),
            Self::ViewNotFound(id) => write!(f, "view not found: {id}"),
            Self::RowNotFound(id) => write!(f, "row not found: {id}"),
            Self::TypeMismatch { expected, actual } => {
                write!(f, "value type `{actual}` does not match key type `{expected}`")
            }
            Self::InvariantViolation(message) => write!(f, "invariant violation: {message}"),
        }
    }
}

impl Error for AvError {}

/// One key and its ordered values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValues {
    pub key: Key,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl KeyValues {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            values: Vec::new(),
        }
    }

    pub fn value(&self, block_id: &str) -> Option<&Value> {
        self.values.iter().find(|value| value.block_id == block_id)
    }

    pub fn value_mut(&mut self, block_id: &str) -> Option<&mut Value> {
        self.values.iter_mut().find(|value| value.block_id == block_id)
    }
}

fn current_spec() -> u32 {
    CURRENT_SPEC
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeView {
    #[serde(default = "current_spec")]
    pub spec: u32,
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "keyValues", default)]
    pub key_values: Vec<KeyValues>,
    /// Active view.
    #[serde(rename = "viewID", default)]
    pub active_view_id: String,
    #[serde(default)]
    pub views: Vec<View>,
}

impl AttributeView {
    /// New attribute view with a primary column and zero views.
    pub fn new(id: impl Into<String>) -> Self {
        let primary = Key::new(new_node_id(), PRIMARY_KEY_NAME, "", KeyType::Block);
        Self {
            spec: CURRENT_SPEC,
            id: id.into(),
            name: String::new(),
            key_values: vec![KeyValues::new(primary)],
            active_view_id: String::new(),
            views: Vec::new(),
        }
    }

    /// Synthesizes a default table view when there is none.
    ///
    /// The view shows every key (primary first) and adopts the current row
    /// order. Returns `true` when a view was created.
    pub fn ensure_default_view(&mut self) -> bool {
        if !self.views.is_empty() {
            return false;
        }
        let mut view = View::new_table(DEFAULT_VIEW_NAME);
        let mut key_ids: Vec<&KeyValues> = self.key_values.iter().collect();
        key_ids.sort_by_key(|kv| kv.key.key_type() != KeyType::Block);
        view.table.columns = key_ids
            .into_iter()
            .map(|kv| ViewColumn::new(kv.key.id.clone()))
            .collect();
        view.table.row_ids = self.row_ids();
        self.active_view_id = view.id.clone();
        self.views.push(view);
        true
    }

    pub fn primary_key(&self) -> Option<&Key> {
        self.block_key_values().map(|kv| &kv.key)
    }

    pub fn block_key_values(&self) -> Option<&KeyValues> {
        self.key_values
            .iter()
            .find(|kv| kv.key.key_type() == KeyType::Block)
    }

    pub fn block_key_values_mut(&mut self) -> Option<&mut KeyValues> {
        self.key_values
            .iter_mut()
            .find(|kv| kv.key.key_type() == KeyType::Block)
    }

    pub fn has_key(&self, key_id: &str) -> bool {
        self.key_values.iter().any(|kv| kv.key.id == key_id)
    }

    pub fn key(&self, key_id: &str) -> AvResult<&Key> {
        self.key_values(key_id).map(|kv| &kv.key)
    }

    pub fn key_mut(&mut self, key_id: &str) -> AvResult<&mut Key> {
        self.key_values_mut(key_id).map(|kv| &mut kv.key)
    }

    pub fn key_values(&self, key_id: &str) -> AvResult<&KeyValues> {
        self.key_values
            .iter()
            .find(|kv| kv.key.id == key_id)
            .ok_or_else(|| AvError::KeyNotFound(key_id.to_string()))
    }

    pub fn key_values_mut(&mut self, key_id: &str) -> AvResult<&mut KeyValues> {
        self.key_values
            .iter_mut()
            .find(|kv| kv.key.id == key_id)
            .ok_or_else(|| AvError::KeyNotFound(key_id.to_string()))
    }

    pub fn value(&self, key_id: &str, block_id: &str) -> Option<&Value> {
        self.key_values(key_id).ok()?.value(block_id)
    }

    pub fn value_mut(&mut self, key_id: &str, block_id: &str) -> Option<&mut Value> {
        self.key_values_mut(key_id).ok()?.value_mut(block_id)
    }

    /// Row IDs in primary-column order.
    pub fn row_ids(&self) -> Vec<String> {
        self.block_key_values()
            .map(|kv| kv.values.iter().map(|value| value.block_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_row(&self, block_id: &str) -> bool {
        self.block_key_values()
            .and_then(|kv| kv.value(block_id))
            .is_some()
    }

    /// Primary-column display text of a row; empty when unknown.
    pub fn row_text(&self, block_id: &str) -> String {
        self.block_key_values()
            .and_then(|kv| kv.value(block_id))
            .and_then(|value| value.payload.block())
            .map(|block| block.content.clone())
            .unwrap_or_default()
    }

    /// Appends a key; rejects duplicates and a second primary column.
    pub fn add_key(&mut self, key: Key) -> AvResult<()> {
        if self.has_key(&key.id) {
            return Err(AvError::InvariantViolation(format!(
                "duplicate key id {}",
                key.id
            )));
        }
        if key.key_type() == KeyType::Block && self.primary_key().is_some() {
            return Err(AvError::InvariantViolation(
                "attribute view already has a primary key".to_string(),
            ));
        }
        self.key_values.push(KeyValues::new(key));
        Ok(())
    }

    /// Removes a key with its values and every view reference to it.
    pub fn remove_key(&mut self, key_id: &str) -> AvResult<KeyValues> {
        let index = self
            .key_values
            .iter()
            .position(|kv| kv.key.id == key_id)
            .ok_or_else(|| AvError::KeyNotFound(key_id.to_string()))?;
        if self.key_values[index].key.key_type() == KeyType::Block {
            return Err(AvError::InvariantViolation(
                "the primary key cannot be removed".to_string(),
            ));
        }
        let removed = self.key_values.remove(index);
        for view in &mut self.views {
            view.table.remove_key(key_id);
        }
        Ok(removed)
    }

    /// Removes every value of the given rows. Returns the number removed.
    pub fn remove_row_values(&mut self, block_ids: &BTreeSet<String>) -> usize {
        let mut removed = 0;
        for kv in &mut self.key_values {
            let before = kv.values.len();
            kv.values.retain(|value| !block_ids.contains(&value.block_id));
            removed += before - kv.values.len();
        }
        removed
    }

    pub fn view(&self, view_id: &str) -> AvResult<&View> {
        self.views
            .iter()
            .find(|view| view.id == view_id)
            .ok_or_else(|| AvError::ViewNotFound(view_id.to_string()))
    }

    pub fn view_mut(&mut self, view_id: &str) -> AvResult<&mut View> {
        self.views
            .iter_mut()
            .find(|view| view.id == view_id)
            .ok_or_else(|| AvError::ViewNotFound(view_id.to_string()))
    }

    pub fn view_index(&self, view_id: &str) -> AvResult<usize> {
        self.views
            .iter()
            .position(|view| view.id == view_id)
            .ok_or_else(|| AvError::ViewNotFound(view_id.to_string()))
    }

    /// Resolves the view to use: a valid explicit ID, else the active view,
    /// else the first view.
    pub fn resolve_view_id(&self, requested: Option<&str>) -> Option<String> {
        requested
            .filter(|id| self.views.iter().any(|view| view.id == *id))
            .or_else(|| {
                Some(self.active_view_id.as_str())
                    .filter(|id| self.views.iter().any(|view| view.id == *id))
            })
            .map(str::to_string)
            .or_else(|| self.views.first().map(|view| view.id.clone()))
    }

    /// `base (n)` with the smallest `n` not used by another view.
    pub fn duplicate_view_name(&self, base: &str) -> String {
        let names: BTreeSet<&str> = self.views.iter().map(|view| view.name.as_str()).collect();
        (1..)
            .map(|n| format!("{base} ({n})"))
            .find(|candidate| !names.contains(candidate.as_str()))
            .unwrap_or_else(|| base.to_string())
    }

    /// Drops filter/sort/column references to removed keys in every view.
    pub fn drop_stale_view_refs(&mut self) -> bool {
        let key_ids: BTreeSet<String> = self.key_values.iter().map(|kv| kv.key.id.clone()).collect();
        let mut changed = false;
        for view in &mut self.views {
            changed |= view.table.drop_stale(|id| key_ids.contains(id));
        }
        changed
    }

    /// Clears derived payload contents before persistence.
    pub fn strip_derived(&mut self) {
        for kv in &mut self.key_values {
            for value in &mut kv.values {
                value.strip_derived();
            }
        }
    }

    /// Relation keys of this attribute view pointing at `target_av_id`.
    pub fn relation_keys_to(&self, target_av_id: &str) -> Vec<&Key> {
        self.key_values
            .iter()
            .map(|kv| &kv.key)
            .filter(|key| {
                key.relation()
                    .map(|relation| relation.av_id == target_av_id)
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{AttributeView, AvError};
    use crate::model::key::{Key, KeyType};
    use crate::model::value::{BlockPayload, Value, ValuePayload};
    use std::collections::BTreeSet;

    fn with_rows(ids: &[&str]) -> AttributeView {
        let mut av = AttributeView::new("av1");
        let kv = av.block_key_values_mut().unwrap();
        let key_id = kv.key.id.clone();
        for id in ids {
            kv.values.push(Value::new(
                key_id.clone(),
                *id,
                ValuePayload::Block {
                    block: BlockPayload {
                        id: id.to_string(),
                        content: format!("row {id}"),
                        ..BlockPayload::default()
                    },
                },
            ));
        }
        av
    }

    #[test]
    fn new_attribute_view_has_primary_key_and_no_views() {
        let av = AttributeView::new("av1");
        assert_eq!(av.key_values.len(), 1);
        assert_eq!(av.primary_key().unwrap().key_type(), KeyType::Block);
        assert!(av.views.is_empty());
    }

    #[test]
    fn default_view_lists_keys_and_rows() {
        let mut av = with_rows(&["r1", "r2"]);
        av.add_key(Key::new("k2", "Name", "", KeyType::Text)).unwrap();
        assert!(av.ensure_default_view());
        assert!(!av.ensure_default_view());
        let view = &av.views[0];
        assert_eq!(av.active_view_id, view.id);
        assert_eq!(view.table.columns.len(), 2);
        assert_eq!(view.table.row_ids, vec!["r1".to_string(), "r2".to_string()]);
    }

    #[test]
    fn lookups_fail_with_typed_errors() {
        let av = AttributeView::new("av1");
        assert_eq!(
            av.key("missing").unwrap_err(),
            AvError::KeyNotFound("missing".to_string())
        );
        assert!(matches!(av.view("v"), Err(AvError::ViewNotFound(_))));
    }

    #[test]
    fn remove_key_refuses_primary_and_cleans_views() {
        let mut av = with_rows(&["r1"]);
        av.add_key(Key::new("k2", "Name", "", KeyType::Text)).unwrap();
        av.ensure_default_view();
        let primary = av.primary_key().unwrap().id.clone();
        assert!(matches!(
            av.remove_key(&primary),
            Err(AvError::InvariantViolation(_))
        ));
        av.remove_key("k2").unwrap();
        assert_eq!(av.views[0].table.columns.len(), 1);
    }

    #[test]
    fn remove_row_values_strips_every_key() {
        let mut av = with_rows(&["r1", "r2"]);
        av.add_key(Key::new("k2", "Name", "", KeyType::Text)).unwrap();
        av.key_values_mut("k2")
            .unwrap()
            .values
            .push(Value::new("k2", "r1", ValuePayload::text("Alice")));
        let removed = av.remove_row_values(&BTreeSet::from(["r1".to_string()]));
        assert_eq!(removed, 2);
        assert_eq!(av.row_ids(), vec!["r2".to_string()]);
    }

    #[test]
    fn duplicate_view_name_finds_free_suffix() {
        let mut av = AttributeView::new("av1");
        av.ensure_default_view();
        assert_eq!(av.duplicate_view_name("Table"), "Table (1)");
        let mut copy = av.views[0].clone();
        copy.name = "Table (1)".to_string();
        av.views.push(copy);
        assert_eq!(av.duplicate_view_name("Table"), "Table (2)");
    }
}
