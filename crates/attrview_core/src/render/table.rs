//! Materialized table produced by a render.

use crate::model::value::ValuePayload;
use crate::model::{ColumnCalc, Key, KeyType, Value, ViewFilter, ViewSort};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableCell {
    /// Stored value ID; empty for synthesized placeholders.
    pub id: String,
    pub value: Value,
    #[serde(rename = "valueType")]
    pub value_type: KeyType,
}

impl TableCell {
    pub fn new(value: Value) -> Self {
        Self {
            id: value.id.clone(),
            value_type: value.key_type(),
            value,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.value.key_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRow {
    pub id: String,
    pub cells: Vec<TableCell>,
}

impl TableRow {
    pub fn cell(&self, key_id: &str) -> Option<&TableCell> {
        self.cells.iter().find(|cell| cell.key_id() == key_id)
    }

    pub fn payload(&self, key_id: &str) -> Option<&ValuePayload> {
        self.cell(key_id).map(|cell| &cell.value.payload)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableColumn {
    pub key: Key,
    pub wrap: bool,
    pub hidden: bool,
    pub pin: bool,
    pub width: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calc: Option<ColumnCalc>,
    /// Calculation over the filtered rows (all pages).
    #[serde(rename = "calcResult", skip_serializing_if = "Option::is_none")]
    pub calc_result: Option<ValuePayload>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewSummary {
    pub id: String,
    pub name: String,
    pub icon: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    #[serde(rename = "avID")]
    pub av_id: String,
    #[serde(rename = "avName")]
    pub av_name: String,
    /// Rendered view.
    #[serde(rename = "viewID")]
    pub view_id: String,
    pub name: String,
    pub icon: String,
    pub views: Vec<ViewSummary>,
    pub columns: Vec<TableColumn>,
    pub rows: Vec<TableRow>,
    pub filters: Vec<ViewFilter>,
    pub sorts: Vec<ViewSort>,
    /// Rows surviving filters, before pagination.
    #[serde(rename = "rowCount")]
    pub row_count: usize,
    #[serde(rename = "pageSize")]
    pub page_size: usize,
}

impl Table {
    pub fn row_ids(&self) -> Vec<&str> {
        self.rows.iter().map(|row| row.id.as_str()).collect()
    }

    pub fn column(&self, key_id: &str) -> Option<&TableColumn> {
        self.columns.iter().find(|column| column.key.id == key_id)
    }

    /// Display text of a cell; `None` when the row or column is absent.
    pub fn cell_text(&self, row_id: &str, key_id: &str) -> Option<String> {
        self.rows
            .iter()
            .find(|row| row.id == row_id)?
            .payload(key_id)
            .map(ValuePayload::to_text)
    }
}
