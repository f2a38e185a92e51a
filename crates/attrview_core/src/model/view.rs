//! View definitions: named table projections over an attribute view.
//!
//! # Responsibility
//! - Hold per-view column display attributes, filters, sorts, custom row
//!   order and page size.
//!
//! # Invariants
//! - Columns, filters and sorts reference key IDs of the owning attribute
//!   view; `TableLayout::drop_stale` removes references to deleted keys.

use crate::model::id::new_node_id;
use crate::model::value::ValuePayload;
use serde::{Deserialize, Serialize};

/// Page size used when neither the caller nor the view specify one.
pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LayoutType {
    #[default]
    Table,
}

/// Aggregation operator for column calculations and rollups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalcOperator {
    #[default]
    #[serde(rename = "")]
    None,
    #[serde(rename = "Count all")]
    CountAll,
    #[serde(rename = "Count values")]
    CountValues,
    #[serde(rename = "Count unique values")]
    CountUniqueValues,
    #[serde(rename = "Count empty")]
    CountEmpty,
    #[serde(rename = "Count not empty")]
    CountNotEmpty,
    #[serde(rename = "Percent empty")]
    PercentEmpty,
    #[serde(rename = "Percent not empty")]
    PercentNotEmpty,
    Sum,
    Average,
    Median,
    Min,
    Max,
    Range,
    Earliest,
    Latest,
    Checked,
    Unchecked,
    #[serde(rename = "Percent checked")]
    PercentChecked,
    #[serde(rename = "Percent unchecked")]
    PercentUnchecked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "Contains")]
    Contains,
    #[serde(rename = "Does not contains")]
    DoesNotContain,
    #[serde(rename = "Starts with")]
    StartsWith,
    #[serde(rename = "Ends with")]
    EndsWith,
    #[serde(rename = "Is between")]
    IsBetween,
    #[serde(rename = "Is empty")]
    IsEmpty,
    #[serde(rename = "Is not empty")]
    IsNotEmpty,
    #[serde(rename = "Is true")]
    IsTrue,
    #[serde(rename = "Is false")]
    IsFalse,
}

impl FilterOperator {
    /// Whether the operator needs an operand value.
    pub fn takes_operand(self) -> bool {
        !matches!(
            self,
            Self::IsEmpty | Self::IsNotEmpty | Self::IsTrue | Self::IsFalse
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    #[serde(rename = "ASC")]
    Asc,
    #[serde(rename = "DESC")]
    Desc,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnCalc {
    #[serde(default)]
    pub operator: CalcOperator,
}

/// Per-view display attributes of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewColumn {
    /// Key ID.
    pub id: String,
    #[serde(default)]
    pub wrap: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub pin: bool,
    #[serde(default)]
    pub width: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calc: Option<ColumnCalc>,
}

impl ViewColumn {
    pub fn new(key_id: impl Into<String>) -> Self {
        Self {
            id: key_id.into(),
            wrap: false,
            hidden: false,
            pin: false,
            width: String::new(),
            calc: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewFilter {
    /// Key ID.
    pub column: String,
    pub operator: FilterOperator,
    /// Operand, typed to the column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ValuePayload>,
    /// Upper bound for `Is between` on number columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value2: Option<ValuePayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSort {
    /// Key ID.
    pub column: String,
    #[serde(default)]
    pub order: SortOrder,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableLayout {
    #[serde(default)]
    pub columns: Vec<ViewColumn>,
    #[serde(default)]
    pub filters: Vec<ViewFilter>,
    #[serde(default)]
    pub sorts: Vec<ViewSort>,
    #[serde(rename = "pageSize", default = "default_page_size")]
    pub page_size: usize,
    /// Custom row order.
    #[serde(rename = "rowIds", default)]
    pub row_ids: Vec<String>,
}

impl Default for TableLayout {
    fn default() -> Self {
        Self {
            columns: Vec::new(),
            filters: Vec::new(),
            sorts: Vec::new(),
            page_size: DEFAULT_PAGE_SIZE,
            row_ids: Vec::new(),
        }
    }
}

impl TableLayout {
    pub fn column(&self, key_id: &str) -> Option<&ViewColumn> {
        self.columns.iter().find(|column| column.id == key_id)
    }

    pub fn column_mut(&mut self, key_id: &str) -> Option<&mut ViewColumn> {
        self.columns.iter_mut().find(|column| column.id == key_id)
    }

    /// Removes filters, sorts and columns whose key no longer exists.
    ///
    /// Returns `true` when anything was dropped.
    pub fn drop_stale(&mut self, key_exists: impl Fn(&str) -> bool) -> bool {
        let before = (self.columns.len(), self.filters.len(), self.sorts.len());
        self.columns.retain(|column| key_exists(&column.id));
        self.filters.retain(|filter| key_exists(&filter.column));
        self.sorts.retain(|sort| key_exists(&sort.column));
        before != (self.columns.len(), self.filters.len(), self.sorts.len())
    }

    /// Removes every reference to `key_id`.
    pub fn remove_key(&mut self, key_id: &str) {
        self.drop_stale(|id| id != key_id);
    }
}

/// Named projection over an attribute view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(rename = "type", default)]
    pub layout_type: LayoutType,
    #[serde(default)]
    pub table: TableLayout,
}

impl View {
    /// New table view with a fresh ID and no columns.
    pub fn new_table(name: impl Into<String>) -> Self {
        Self {
            id: new_node_id(),
            name: name.into(),
            icon: String::new(),
            layout_type: LayoutType::Table,
            table: TableLayout::default(),
        }
    }
}

/// Moves the element at `from` so that it directly follows the element
/// matching `previous`, or to the front when `previous` is `None`.
///
/// Returns `false` when `previous` is given but not found.
pub fn move_after<T>(
    items: &mut Vec<T>,
    from: usize,
    previous: Option<&dyn Fn(&T) -> bool>,
) -> bool {
    if from >= items.len() {
        return false;
    }
    let item = items.remove(from);
    let at = match previous {
        None => 0,
        Some(matches) => match items.iter().position(|candidate| matches(candidate)) {
            Some(index) => index + 1,
            None => {
                items.insert(from, item);
                return false;
            }
        },
    };
    items.insert(at, item);
    true
}

#[cfg(test)]
mod tests {
    use super::{
        move_after, CalcOperator, FilterOperator, SortOrder, TableLayout, View, ViewColumn,
        ViewFilter, ViewSort, DEFAULT_PAGE_SIZE,
    };
    use crate::model::value::ValuePayload;

    #[test]
    fn operators_use_wire_names() {
        assert_eq!(
            serde_json::to_string(&CalcOperator::CountUniqueValues).unwrap(),
            "\"Count unique values\""
        );
        assert_eq!(serde_json::to_string(&CalcOperator::None).unwrap(), "\"\"");
        assert_eq!(
            serde_json::to_string(&FilterOperator::DoesNotContain).unwrap(),
            "\"Does not contains\""
        );
        assert_eq!(serde_json::to_string(&SortOrder::Desc).unwrap(), "\"DESC\"");
    }

    #[test]
    fn view_json_defaults_page_size() {
        let view: View =
            serde_json::from_str(r#"{"id":"v","name":"Table","type":"table","table":{}}"#).unwrap();
        assert_eq!(view.table.page_size, DEFAULT_PAGE_SIZE);
        assert!(view.table.row_ids.is_empty());
    }

    #[test]
    fn drop_stale_removes_unknown_keys() {
        let mut table = TableLayout::default();
        table.columns.push(ViewColumn::new("k1"));
        table.columns.push(ViewColumn::new("gone"));
        table.filters.push(ViewFilter {
            column: "gone".to_string(),
            operator: FilterOperator::Contains,
            value: Some(ValuePayload::text("x")),
            value2: None,
        });
        table.sorts.push(ViewSort {
            column: "k1".to_string(),
            order: SortOrder::Asc,
        });

        assert!(table.drop_stale(|id| id == "k1"));
        assert_eq!(table.columns.len(), 1);
        assert!(table.filters.is_empty());
        assert_eq!(table.sorts.len(), 1);
        assert!(!table.drop_stale(|id| id == "k1"));
    }

    #[test]
    fn move_after_reorders_and_rejects_unknown_anchor() {
        let mut items = vec!["a", "b", "c"];
        assert!(move_after(&mut items, 0, Some(&|item: &&str| *item == "c")));
        assert_eq!(items, vec!["b", "c", "a"]);
        assert!(move_after(&mut items, 2, None));
        assert_eq!(items, vec!["a", "b", "c"]);
        assert!(!move_after(&mut items, 1, Some(&|item: &&str| *item == "zz")));
        assert_eq!(items, vec!["a", "b", "c"]);
    }
}
