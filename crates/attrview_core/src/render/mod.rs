//! View materialization.
//!
//! # Responsibility
//! - Turn an attribute view plus one of its views into a `Table`: rows with
//!   one cell per column, derived cells resolved, filtered, sorted,
//!   calculated and paginated.
//! - Repair recoverable data problems found on the way.
//!
//! # Invariants
//! - Rendering an unchanged attribute view twice yields identical tables.
//! - Rows whose primary value lacks a block ID are removed from the model;
//!   rows whose document block is missing are only hidden from the output.
//! - `Table::row_count` counts filtered rows before pagination.

pub mod calc;
pub mod derived;
pub mod filter;
pub mod sort;
pub mod table;

use crate::model::id::{now_millis, parse_id_time};
use crate::model::{AttributeView, AvError, CalcOperator, KeyType, View};
use crate::relation::RelationIndex;
use crate::render::derived::{load_related, placeholder, resolve_rows, DerivedSources};
use crate::render::table::{Table, TableCell, TableColumn, TableRow, ViewSummary};
use crate::repo::av_store::{AvStore, StoreError};
use crate::repo::document::DocumentTree;
use log::{info, warn};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type RenderResult<T> = Result<T, RenderError>;

#[derive(Debug)]
pub enum RenderError {
    Store(StoreError),
    Av(AvError),
}

impl Display for RenderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::Av(err) => write!(f, "{err}"),
        }
    }
}

impl Error for RenderError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Av(err) => Some(err),
        }
    }
}

impl From<StoreError> for RenderError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<AvError> for RenderError {
    fn from(value: AvError) -> Self {
        Self::Av(value)
    }
}

/// Collaborators a render reads from.
pub struct RenderContext<'a> {
    pub docs: &'a dyn DocumentTree,
    /// Source of relation targets.
    pub store: &'a dyn AvStore,
    /// Updated with the relation links seen while rendering.
    pub relations: Option<&'a RelationIndex>,
    pub default_page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    /// View to render; falls back to the active view, then the first view.
    pub view_id: Option<String>,
    /// 1-based page.
    pub page: usize,
    /// Overrides the view's page size.
    pub page_size: Option<usize>,
    /// Return every row on one page.
    pub unpaged: bool,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            view_id: None,
            page: 1,
            page_size: None,
            unpaged: false,
        }
    }
}

impl RenderRequest {
    pub fn view(view_id: impl Into<String>) -> Self {
        Self {
            view_id: Some(view_id.into()),
            ..Self::default()
        }
    }

    pub fn unpaged() -> Self {
        Self {
            unpaged: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub table: Table,
    /// The attribute view was repaired or its active view switched; the
    /// caller should persist it.
    pub changed: bool,
}

/// Backfills missing created/updated stamps on primary values.
fn backfill_block_times(av: &mut AttributeView) -> bool {
    let Some(kv) = av.block_key_values_mut() else {
        return false;
    };
    let mut changed = false;
    for value in &mut kv.values {
        let row_id = value.block_id.clone();
        let Some(block) = value.payload.block_mut() else {
            continue;
        };
        if block.created == 0 {
            block.created = parse_id_time(&row_id)
                .map(|time| time.timestamp_millis())
                .unwrap_or_else(now_millis);
            changed = true;
        }
        if block.updated == 0 {
            block.updated = block.created;
            changed = true;
        }
    }
    changed
}

/// Removes rows whose primary value has no block ID.
fn remove_unbound_rows(av: &mut AttributeView) -> bool {
    let broken: BTreeSet<String> = av
        .block_key_values()
        .map(|kv| {
            kv.values
                .iter()
                .filter(|value| {
                    value
                        .payload
                        .block()
                        .map(|block| block.id.is_empty())
                        .unwrap_or(true)
                })
                .map(|value| value.block_id.clone())
                .collect()
        })
        .unwrap_or_default();
    if broken.is_empty() {
        return false;
    }
    warn!(
        "event=av_render module=render status=degraded av_id={} removed_rows={} reason=empty_block_id",
        av.id,
        broken.len()
    );
    av.remove_row_values(&broken);
    for view in &mut av.views {
        view.table.row_ids.retain(|id| !broken.contains(id));
    }
    true
}

/// Normalizes `av` before rendering. Returns `true` when it changed.
fn prepare(av: &mut AttributeView) -> bool {
    let mut changed = av.ensure_default_view();
    changed |= backfill_block_times(av);
    changed |= av.drop_stale_view_refs();
    changed |= remove_unbound_rows(av);
    changed
}

/// Builds one row with a cell for every key, or `None` when the row's
/// document block is gone.
fn build_row(av: &AttributeView, docs: &dyn DocumentTree, row_id: &str) -> Option<TableRow> {
    let primary = av.block_key_values()?.value(row_id)?;
    let mut primary = primary.clone();
    if !primary.is_detached {
        match docs.get_block(row_id) {
            Ok(Some(node)) => {
                if let Some(block) = primary.payload.block_mut() {
                    block.content = node.content;
                }
            }
            Ok(None) => return None,
            Err(err) => warn!(
                "event=av_render module=render status=degraded av_id={} row_id={row_id} error={err}",
                av.id
            ),
        }
    }

    let cells = av
        .key_values
        .iter()
        .map(|kv| {
            let mut value = if kv.key.key_type() == KeyType::Block {
                primary.clone()
            } else {
                kv.value(row_id)
                    .cloned()
                    .unwrap_or_else(|| placeholder(&kv.key.id, row_id, kv.key.key_type()))
            };
            if let Some(number) = value.payload.number_payload_mut() {
                number.apply_format(kv.key.number_format());
            }
            TableCell::new(value)
        })
        .collect();
    Some(TableRow {
        id: row_id.to_string(),
        cells,
    })
}

fn record_relations(av: &AttributeView, relations: Option<&RelationIndex>) {
    let Some(index) = relations else {
        return;
    };
    for kv in &av.key_values {
        if let Some(relation) = kv.key.relation() {
            index.upsert(&av.id, &relation.av_id);
        }
    }
}

fn passes_filters(view: &View, row: &TableRow) -> bool {
    view.table.filters.iter().all(|view_filter| {
        row.payload(&view_filter.column)
            .map(|payload| filter::matches(view_filter, payload))
            .unwrap_or(true)
    })
}

fn columns_for(av: &AttributeView, view: &View, rows: &[TableRow]) -> Vec<TableColumn> {
    view.table
        .columns
        .iter()
        .filter_map(|column| {
            let key = av.key(&column.id).ok()?;
            let calc_result = column
                .calc
                .filter(|calc| calc.operator != CalcOperator::None)
                .and_then(|calc| {
                    let payloads: Vec<_> = rows
                        .iter()
                        .filter_map(|row| row.payload(&column.id))
                        .collect();
                    calc::aggregate(calc.operator, &payloads, key.number_format())
                });
            Some(TableColumn {
                key: key.clone(),
                wrap: column.wrap,
                hidden: column.hidden,
                pin: column.pin,
                width: column.width.clone(),
                calc: column.calc,
                calc_result,
            })
        })
        .collect()
}

/// Reorders each row's cells to the view's column order, dropping cells of
/// keys the view does not show.
fn project(rows: &mut [TableRow], columns: &[TableColumn]) {
    for row in rows {
        let mut cells = std::mem::take(&mut row.cells);
        row.cells = columns
            .iter()
            .filter_map(|column| {
                let index = cells.iter().position(|cell| cell.key_id() == column.key.id)?;
                Some(cells.swap_remove(index))
            })
            .collect();
    }
}

/// Renders one view of `av`.
///
/// `av` is repaired in place; `RenderOutcome::changed` reports whether it
/// needs saving.
pub fn render_view(
    av: &mut AttributeView,
    ctx: &RenderContext<'_>,
    request: &RenderRequest,
) -> RenderResult<RenderOutcome> {
    let mut changed = prepare(av);
    let view_id = av
        .resolve_view_id(request.view_id.as_deref())
        .ok_or_else(|| AvError::ViewNotFound(request.view_id.clone().unwrap_or_default()))?;
    if av.active_view_id != view_id {
        av.active_view_id = view_id.clone();
        changed = true;
    }

    let av: &AttributeView = av;
    let view = av.view(&view_id)?;
    record_relations(av, ctx.relations);

    let mut rows: Vec<TableRow> = av
        .row_ids()
        .iter()
        .filter_map(|row_id| build_row(av, ctx.docs, row_id))
        .collect();
    let related = load_related(av, ctx.store);
    let sources = DerivedSources {
        av,
        related: &related,
        docs: ctx.docs,
    };
    resolve_rows(&sources, &mut rows);

    rows.retain(|row| passes_filters(view, row));
    sort::sort_rows(&mut rows, &view.table.sorts, &view.table.row_ids);
    let columns = columns_for(av, view, &rows);

    let row_count = rows.len();
    let page_size = if request.unpaged {
        row_count.max(1)
    } else {
        request
            .page_size
            .filter(|size| *size > 0)
            .or(Some(view.table.page_size).filter(|size| *size > 0))
            .unwrap_or(ctx.default_page_size.max(1))
    };
    let start = request.page.max(1).saturating_sub(1).saturating_mul(page_size);
    let mut rows: Vec<TableRow> = rows.into_iter().skip(start).take(page_size).collect();
    project(&mut rows, &columns);

    info!(
        "event=av_render module=render status=ok av_id={} view_id={view_id} rows={} row_count={row_count}",
        av.id,
        rows.len()
    );
    Ok(RenderOutcome {
        table: Table {
            av_id: av.id.clone(),
            av_name: av.name.clone(),
            view_id: view.id.clone(),
            name: view.name.clone(),
            icon: view.icon.clone(),
            views: av
                .views
                .iter()
                .map(|view| ViewSummary {
                    id: view.id.clone(),
                    name: view.name.clone(),
                    icon: view.icon.clone(),
                })
                .collect(),
            columns,
            rows,
            filters: view.table.filters.clone(),
            sorts: view.table.sorts.clone(),
            row_count,
            page_size,
        },
        changed,
    })
}

/// Resolved cells of one row over every key (no view projection).
pub fn render_row(av: &AttributeView, ctx: &RenderContext<'_>, row_id: &str) -> Option<TableRow> {
    let mut row = build_row(av, ctx.docs, row_id)?;
    let related = load_related(av, ctx.store);
    let sources = DerivedSources {
        av,
        related: &related,
        docs: ctx.docs,
    };
    derived::resolve_row(&sources, &mut row);
    Some(row)
}
