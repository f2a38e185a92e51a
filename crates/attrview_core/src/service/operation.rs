//! Mutation commands.
//!
//! Every mutation of an attribute view is one `Operation`: the attribute
//! view it targets plus an `Action`. IDs of created entities (keys, views,
//! rows) are chosen by the caller.

use crate::model::{
    CalcOperator, KeyType, NumberFormat, SelectOption, ValuePayload, ViewFilter, ViewSort,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "avID")]
    pub av_id: String,
    #[serde(flatten)]
    pub action: Action,
}

impl Operation {
    pub fn new(av_id: impl Into<String>, action: Action) -> Self {
        Self {
            av_id: av_id.into(),
            action,
        }
    }
}

/// Row to insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowSource {
    /// Row ID; the bound block ID for bound rows.
    pub id: String,
    #[serde(default)]
    pub is_detached: bool,
    /// Display text of a detached row. Bound rows take the block's text.
    #[serde(default)]
    pub content: String,
}

impl RowSource {
    pub fn bound(block_id: impl Into<String>) -> Self {
        Self {
            id: block_id.into(),
            is_detached: false,
            content: String::new(),
        }
    }

    pub fn detached(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            is_detached: true,
            content: content.into(),
        }
    }
}

/// One well-defined change. Optional `view_id`s default to the active view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Action {
    SetName {
        name: String,
    },

    AddColumn {
        key_id: String,
        name: String,
        key_type: KeyType,
        #[serde(default)]
        icon: String,
        /// Column the new one follows in every view; appended when `None`.
        #[serde(default)]
        previous_key_id: Option<String>,
    },
    RemoveColumn {
        key_id: String,
    },
    SortColumn {
        #[serde(default)]
        view_id: Option<String>,
        key_id: String,
        /// Moves to the front when `None`.
        #[serde(default)]
        previous_key_id: Option<String>,
    },
    RenameColumn {
        key_id: String,
        name: String,
    },
    RetypeColumn {
        key_id: String,
        key_type: KeyType,
    },
    SetColumnIcon {
        key_id: String,
        icon: String,
    },
    SetTemplate {
        key_id: String,
        template: String,
    },
    SetNumberFormat {
        key_id: String,
        format: NumberFormat,
    },
    UpdateRelation {
        key_id: String,
        target_av_id: String,
        #[serde(default)]
        is_two_way: bool,
        #[serde(default)]
        back_key_name: Option<String>,
    },
    UpdateRollup {
        key_id: String,
        relation_key_id: String,
        target_key_id: String,
        #[serde(default)]
        calc: Option<CalcOperator>,
    },
    SetOptions {
        key_id: String,
        options: Vec<SelectOption>,
    },
    RemoveOption {
        key_id: String,
        name: String,
    },
    UpdateOption {
        key_id: String,
        old_name: String,
        new_name: String,
        color: String,
    },

    SetColumnWidth {
        #[serde(default)]
        view_id: Option<String>,
        key_id: String,
        width: String,
    },
    SetColumnWrap {
        #[serde(default)]
        view_id: Option<String>,
        key_id: String,
        wrap: bool,
    },
    SetColumnHidden {
        #[serde(default)]
        view_id: Option<String>,
        key_id: String,
        hidden: bool,
    },
    SetColumnPin {
        #[serde(default)]
        view_id: Option<String>,
        key_id: String,
        pin: bool,
    },
    SetColumnCalc {
        #[serde(default)]
        view_id: Option<String>,
        key_id: String,
        operator: CalcOperator,
    },

    AddView {
        view_id: String,
        #[serde(default)]
        name: String,
    },
    RemoveView {
        view_id: String,
    },
    DuplicateView {
        view_id: String,
        new_view_id: String,
    },
    SortView {
        view_id: String,
        #[serde(default)]
        previous_view_id: Option<String>,
    },
    RenameView {
        view_id: String,
        name: String,
    },
    SetViewIcon {
        view_id: String,
        icon: String,
    },
    SetFilters {
        #[serde(default)]
        view_id: Option<String>,
        filters: Vec<ViewFilter>,
    },
    SetSorts {
        #[serde(default)]
        view_id: Option<String>,
        sorts: Vec<ViewSort>,
    },
    SetPageSize {
        #[serde(default)]
        view_id: Option<String>,
        page_size: usize,
    },

    InsertRows {
        #[serde(default)]
        view_id: Option<String>,
        /// Rows go after this row in the custom order, or to the top.
        #[serde(default)]
        previous_id: Option<String>,
        rows: Vec<RowSource>,
    },
    RemoveRows {
        row_ids: Vec<String>,
    },
    SortRow {
        #[serde(default)]
        view_id: Option<String>,
        row_id: String,
        #[serde(default)]
        previous_id: Option<String>,
    },
    ReplaceBlock {
        old_id: String,
        new_id: String,
        #[serde(default)]
        is_detached: bool,
    },
    /// For the primary column, an empty `block.id` detaches a bound row.
    UpdateCell {
        key_id: String,
        row_id: String,
        value: ValuePayload,
    },
}

impl Action {
    /// Stable name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetName { .. } => "set_name",
            Self::AddColumn { .. } => "add_column",
            Self::RemoveColumn { .. } => "remove_column",
            Self::SortColumn { .. } => "sort_column",
            Self::RenameColumn { .. } => "rename_column",
            Self::RetypeColumn { .. } => "retype_column",
            Self::SetColumnIcon { .. } => "set_column_icon",
            Self::SetTemplate { .. } => "set_template",
            Self::SetNumberFormat { .. } => "set_number_format",
            Self::UpdateRelation { .. } => "update_relation",
            Self::UpdateRollup { .. } => "update_rollup",
            Self::SetOptions { .. } => "set_options",
            Self::RemoveOption { .. } => "remove_option",
            Self::UpdateOption { .. } => "update_option",
            Self::SetColumnWidth { .. } => "set_column_width",
            Self::SetColumnWrap { .. } => "set_column_wrap",
            Self::SetColumnHidden { .. } => "set_column_hidden",
            Self::SetColumnPin { .. } => "set_column_pin",
            Self::SetColumnCalc { .. } => "set_column_calc",
            Self::AddView { .. } => "add_view",
            Self::RemoveView { .. } => "remove_view",
            Self::DuplicateView { .. } => "duplicate_view",
            Self::SortView { .. } => "sort_view",
            Self::RenameView { .. } => "rename_view",
            Self::SetViewIcon { .. } => "set_view_icon",
            Self::SetFilters { .. } => "set_filters",
            Self::SetSorts { .. } => "set_sorts",
            Self::SetPageSize { .. } => "set_page_size",
            Self::InsertRows { .. } => "insert_rows",
            Self::RemoveRows { .. } => "remove_rows",
            Self::SortRow { .. } => "sort_row",
            Self::ReplaceBlock { .. } => "replace_block",
            Self::UpdateCell { .. } => "update_cell",
        }
    }
}
