//! Row and cell operations.
//!
//! # Responsibility
//! - Insert, remove, reorder and re-bind rows.
//! - Edit cells, keeping document bindings and two-way relations in step.
//!
//! # Invariants
//! - Every bound row's block carries the attribute view ID in `custom-avs`.
//!   Those writes are queued on the working set and land after the commit.
//! - A row's cells share its detached flag.

use crate::event::InvalidationReason;
use crate::model::id::now_millis;
use crate::model::value::BlockPayload;
use crate::model::{AttributeView, AvError, KeyType, RelationConfig, Value, ValuePayload};
use crate::relation::{self, RelationError, RelationIndex, WorkingSet};
use crate::render::filter::affect_value;
use crate::render::{render_view, RenderContext, RenderRequest};
use crate::repo::av_store::{AvStore, StoreError};
use crate::repo::document::DocumentTree;
use crate::service::error::{TxContext, TxError, TxErrorKind, TxResult};
use crate::service::operation::RowSource;
use crate::service::schema_ops::{register_options, resolve_view_id};
use log::{debug, warn};
use std::collections::BTreeSet;

/// Collaborators of row operations.
pub(crate) struct RowEnv<'a> {
    pub docs: &'a dyn DocumentTree,
    pub store: &'a dyn AvStore,
    pub relations: &'a RelationIndex,
    pub default_page_size: usize,
}

pub(crate) fn load<'w>(ws: &'w mut WorkingSet<'_>, av_id: &str) -> TxResult<&'w mut AttributeView> {
    ws.load(av_id).for_av(av_id)
}

fn block_not_found(av_id: &str, block_id: &str) -> TxError {
    TxError::new(
        TxErrorKind::NotFound,
        av_id,
        format!("block not found: {block_id}"),
    )
}

fn primary_key_id(av: &AttributeView) -> TxResult<String> {
    av.primary_key()
        .map(|key| key.id.clone())
        .ok_or_else(|| TxError::invariant(&av.id, "attribute view has no primary column"))
}

fn notify_dependents(ws: &mut WorkingSet<'_>, relations: &RelationIndex, av_id: &str) {
    for dependent in relations.sources_of(av_id) {
        if dependent != av_id {
            ws.notify(&dependent, InvalidationReason::CellChanged);
        }
    }
}

/// Cells a new row inherits so it stays visible under the view's filters
/// and near its neighbours under the view's sorts.
///
/// Values come from the last rendered row that was edited after creation;
/// without such a row, from what each filter would accept.
fn inherited_values(env: &RowEnv<'_>, av: &AttributeView, view_id: &str) -> Inherited {
    let mut inherited = Inherited::default();
    let Ok(view) = av.view(view_id) else {
        return inherited;
    };
    if view.table.filters.is_empty() && view.table.sorts.is_empty() {
        return inherited;
    }
    let mut columns: Vec<&str> = Vec::new();
    for column in view
        .table
        .filters
        .iter()
        .map(|filter| filter.column.as_str())
        .chain(view.table.sorts.iter().map(|sort| sort.column.as_str()))
    {
        if !columns.contains(&column) {
            columns.push(column);
        }
    }

    let mut scratch = av.clone();
    let ctx = RenderContext {
        docs: env.docs,
        store: env.store,
        relations: None,
        default_page_size: env.default_page_size,
    };
    let request = RenderRequest {
        view_id: Some(view_id.to_string()),
        unpaged: true,
        ..RenderRequest::default()
    };
    let table = match render_view(&mut scratch, &ctx, &request) {
        Ok(outcome) => outcome.table,
        Err(err) => {
            warn!(
                "event=av_insert_rows module=service status=degraded av_id={} reason=donor_render_failed error={err}",
                av.id
            );
            return inherited;
        }
    };
    let primary = av.primary_key().map(|key| key.id.clone()).unwrap_or_default();
    let donor = table.rows.iter().rev().find(|row| {
        row.payload(&primary)
            .and_then(ValuePayload::block)
            .map(|block| block.created != block.updated)
            .unwrap_or(false)
    });

    for column in columns {
        let Ok(key) = av.key(column) else {
            continue;
        };
        let key_type = key.key_type();
        if key_type.is_derived() || key_type == KeyType::Relation {
            continue;
        }
        if let Some(donor) = donor {
            if let Some(payload) = donor.payload(column).filter(|payload| !payload.is_empty()) {
                inherited.push(column, key_type, payload.clone());
            }
            continue;
        }
        let affected = view
            .table
            .filters
            .iter()
            .filter(|filter| filter.column == column)
            .find_map(affect_value);
        match affected {
            Some(payload) if key_type == KeyType::Block => {
                inherited.primary_content = Some(payload.to_text());
            }
            Some(payload) if payload.key_type() == key_type => {
                inherited.cells.push((column.to_string(), payload));
            }
            _ => {}
        }
    }
    inherited
}

/// What a new row copies from its neighbours.
#[derive(Debug, Default)]
struct Inherited {
    cells: Vec<(String, ValuePayload)>,
    /// Primary content for detached rows inserted without any.
    primary_content: Option<String>,
}

impl Inherited {
    fn push(&mut self, column: &str, key_type: KeyType, payload: ValuePayload) {
        if key_type == KeyType::Block {
            self.primary_content = payload.block().map(|block| block.content.clone());
        } else {
            self.cells.push((column.to_string(), payload));
        }
    }
}

fn insert_row_id(row_ids: &mut Vec<String>, row_id: &str, after: Option<&str>) {
    row_ids.retain(|id| id != row_id);
    let at = after
        .and_then(|previous| row_ids.iter().position(|id| id == previous))
        .map(|index| index + 1)
        .unwrap_or(0);
    row_ids.insert(at, row_id.to_string());
}

/// Inserts rows after `previous_id` (or at the top) in every view.
///
/// Rows already present are skipped. Bound rows must reference an existing
/// block and get bound to the attribute view.
pub(crate) fn insert_rows(
    env: &RowEnv<'_>,
    ws: &mut WorkingSet<'_>,
    av_id: &str,
    view_id: Option<&str>,
    previous_id: Option<&str>,
    rows: &[RowSource],
) -> TxResult<()> {
    let inherited = {
        let av = ws.load_or_create(av_id).for_av(av_id)?;
        av.ensure_default_view();
        let view_id = resolve_view_id(av, view_id)?;
        inherited_values(env, av, &view_id)
    };

    let mut anchor = previous_id.map(str::to_string);
    for source in rows {
        if source.id.is_empty() {
            return Err(TxError::invariant(av_id, "row id must not be empty"));
        }
        if load(ws, av_id)?.has_row(&source.id) {
            debug!(
                "event=av_insert_rows module=service status=ok av_id={av_id} row_id={} reason=already_present",
                source.id
            );
            continue;
        }
        let content = if source.is_detached {
            match &inherited.primary_content {
                Some(content) if source.content.is_empty() => content.clone(),
                _ => source.content.clone(),
            }
        } else {
            env.docs
                .get_block(&source.id)
                .for_av(av_id)?
                .ok_or_else(|| block_not_found(av_id, &source.id))?
                .content
        };

        let av = load(ws, av_id)?;
        let primary_id = primary_key_id(av)?;
        let now = now_millis();
        let mut primary = Value::new(
            primary_id.clone(),
            source.id.clone(),
            ValuePayload::Block {
                block: BlockPayload {
                    id: source.id.clone(),
                    icon: String::new(),
                    content,
                    created: now,
                    updated: now,
                },
            },
        );
        primary.is_detached = source.is_detached;
        av.key_values_mut(&primary_id).for_av(av_id)?.values.push(primary);
        for (key_id, payload) in &inherited.cells {
            if let Ok(kv) = av.key_values_mut(key_id) {
                let mut value = Value::new(key_id.clone(), source.id.clone(), payload.clone());
                value.is_detached = source.is_detached;
                kv.values.push(value);
            }
        }
        for view in &mut av.views {
            insert_row_id(&mut view.table.row_ids, &source.id, anchor.as_deref());
        }
        anchor = Some(source.id.clone());

        if !source.is_detached {
            ws.bind(&source.id, av_id);
        }
    }
    notify_dependents(ws, env.relations, av_id);
    Ok(())
}

/// Removes rows with all their cells, unbinding bound blocks and clearing
/// two-way back references.
pub(crate) fn remove_rows(
    env: &RowEnv<'_>,
    ws: &mut WorkingSet<'_>,
    av_id: &str,
    row_ids: &[String],
) -> TxResult<()> {
    let ids: BTreeSet<String> = row_ids.iter().cloned().collect();
    relation::sever_rows(ws, av_id, &ids).for_av(av_id)?;

    let av = load(ws, av_id)?;
    let bound: Vec<String> = ids
        .iter()
        .filter(|id| {
            av.block_key_values()
                .and_then(|kv| kv.value(id))
                .map(|value| !value.is_detached)
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    av.remove_row_values(&ids);
    for view in &mut av.views {
        view.table.row_ids.retain(|id| !ids.contains(id));
    }
    for block_id in &bound {
        ws.unbind(block_id, av_id);
    }
    notify_dependents(ws, env.relations, av_id);
    Ok(())
}

/// Two-way relation cells of `row_id`: the relation and the rows it points
/// at.
fn two_way_links(av: &AttributeView, row_id: &str) -> Vec<(RelationConfig, Vec<String>)> {
    av.key_values
        .iter()
        .filter_map(|kv| {
            let config = kv.key.relation().filter(|config| config.is_two_way)?;
            let relation = kv.value(row_id)?.payload.relation_payload()?;
            Some((config.clone(), relation.block_ids.clone()))
        })
        .collect()
}

/// Re-keys row `old_id` to `new_id` and sets its detached flag.
///
/// With equal IDs this only toggles between bound and detached.
pub(crate) fn replace_block(
    env: &RowEnv<'_>,
    ws: &mut WorkingSet<'_>,
    av_id: &str,
    old_id: &str,
    new_id: &str,
    is_detached: bool,
) -> TxResult<()> {
    if new_id.is_empty() {
        return Err(TxError::invariant(av_id, "row id must not be empty"));
    }
    let (was_detached, links) = {
        let av = load(ws, av_id)?;
        let was_detached = av
            .block_key_values()
            .and_then(|kv| kv.value(old_id))
            .map(|value| value.is_detached)
            .ok_or_else(|| AvError::RowNotFound(old_id.to_string()))
            .for_av(av_id)?;
        if old_id != new_id && av.has_row(new_id) {
            return Err(TxError::invariant(
                av_id,
                format!("row {new_id} already exists"),
            ));
        }
        (was_detached, two_way_links(av, old_id))
    };
    if old_id == new_id && was_detached == is_detached {
        return Ok(());
    }
    let content = if is_detached {
        None
    } else {
        let node = env
            .docs
            .get_block(new_id)
            .for_av(av_id)?
            .ok_or_else(|| block_not_found(av_id, new_id))?;
        Some(node.content)
    };

    let av = load(ws, av_id)?;
    let now = now_millis();
    for kv in &mut av.key_values {
        for value in kv.values.iter_mut().filter(|value| value.block_id == old_id) {
            value.block_id = new_id.to_string();
            value.is_detached = is_detached;
            if let Some(block) = value.payload.block_mut() {
                block.id = new_id.to_string();
                if let Some(content) = &content {
                    block.content = content.clone();
                }
                block.updated = now;
            }
        }
    }
    for view in &mut av.views {
        for id in view.table.row_ids.iter_mut().filter(|id| id.as_str() == old_id) {
            *id = new_id.to_string();
        }
    }

    if !was_detached && (old_id != new_id || is_detached) {
        ws.unbind(old_id, av_id);
    }
    if !is_detached && (old_id != new_id || was_detached) {
        ws.bind(new_id, av_id);
    }

    if old_id != new_id {
        for (config, related) in links {
            let dest = match ws.load(&config.av_id) {
                Ok(dest) => dest,
                Err(RelationError::Store(StoreError::NotFound(_))) => continue,
                Err(err) => return Err(err).for_av(av_id),
            };
            for target_row in &related {
                relation::unlink(dest, &config.back_key_id, target_row, old_id)
                    .for_av(&config.av_id)?;
                relation::link(dest, &config.back_key_id, target_row, new_id)
                    .for_av(&config.av_id)?;
            }
            ws.mark_dirty(&config.av_id);
            if config.av_id != av_id {
                ws.notify(&config.av_id, InvalidationReason::BackRelationChanged);
            }
        }
    }
    notify_dependents(ws, env.relations, av_id);
    Ok(())
}

/// Primary-column edit: detach, rename a detached row, or re-bind.
fn update_primary(
    env: &RowEnv<'_>,
    ws: &mut WorkingSet<'_>,
    av_id: &str,
    row_id: &str,
    block: &BlockPayload,
) -> TxResult<()> {
    let (primary_id, is_detached, current_id) = {
        let av = load(ws, av_id)?;
        let primary_id = primary_key_id(av)?;
        let value = av
            .value(&primary_id, row_id)
            .ok_or_else(|| AvError::RowNotFound(row_id.to_string()))
            .for_av(av_id)?;
        let current_id = value
            .payload
            .block()
            .map(|block| block.id.clone())
            .unwrap_or_else(|| row_id.to_string());
        (primary_id, value.is_detached, current_id)
    };

    if !block.id.is_empty() && block.id != current_id {
        return replace_block(env, ws, av_id, row_id, &block.id, false);
    }
    if !is_detached && block.id == current_id {
        debug!("event=av_update_cell module=service status=ok av_id={av_id} row_id={row_id} reason=unchanged_binding");
        return Ok(());
    }
    if !is_detached {
        ws.unbind(&current_id, av_id);
    }
    let av = load(ws, av_id)?;
    for kv in &mut av.key_values {
        for value in kv.values.iter_mut().filter(|value| value.block_id == row_id) {
            value.is_detached = true;
        }
    }
    if let Some(primary) = av
        .value_mut(&primary_id, row_id)
        .and_then(|value| value.payload.block_mut())
    {
        primary.id = current_id;
        primary.content = block.content.clone();
    }
    Ok(())
}

fn set_plain_value(
    av: &mut AttributeView,
    key_id: &str,
    row_id: &str,
    mut payload: ValuePayload,
) -> TxResult<()> {
    let av_id = av.id.clone();
    let is_detached = av
        .block_key_values()
        .and_then(|kv| kv.value(row_id))
        .map(|value| value.is_detached)
        .unwrap_or(false);
    let kv = av.key_values_mut(key_id).for_av(&av_id)?;
    if let Some(number) = payload.number_payload_mut() {
        number.apply_format(kv.key.number_format());
    }
    if let ValuePayload::Select { items } = &mut payload {
        items.truncate(1);
    }
    if let Some(items) = payload.select_items_mut() {
        register_options(&mut kv.key, items);
    }
    match kv.value_mut(row_id) {
        Some(value) => value.payload = payload,
        None => {
            let mut value = Value::new(key_id, row_id, payload);
            value.is_detached = is_detached;
            kv.values.push(value);
        }
    }
    Ok(())
}

fn touch_row(av: &mut AttributeView, row_id: &str) {
    let Some(primary_id) = av.primary_key().map(|key| key.id.clone()) else {
        return;
    };
    if let Some(block) = av
        .value_mut(&primary_id, row_id)
        .and_then(|value| value.payload.block_mut())
    {
        block.updated = now_millis();
    }
}

/// Writes one cell. The payload type must match the column type; computed
/// columns are read-only.
pub(crate) fn update_cell(
    env: &RowEnv<'_>,
    ws: &mut WorkingSet<'_>,
    av_id: &str,
    key_id: &str,
    row_id: &str,
    value: &ValuePayload,
) -> TxResult<()> {
    let key_type = {
        let av = load(ws, av_id)?;
        let key_type = av.key(key_id).for_av(av_id)?.key_type();
        if value.key_type() != key_type {
            return Err(AvError::TypeMismatch {
                expected: key_type,
                actual: value.key_type(),
            })
            .for_av(av_id);
        }
        if key_type.is_derived() {
            return Err(TxError::invariant(
                av_id,
                format!("column {key_id} is computed and cannot be edited"),
            ));
        }
        if !av.has_row(row_id) {
            return Err(AvError::RowNotFound(row_id.to_string())).for_av(av_id);
        }
        key_type
    };

    match key_type {
        KeyType::Block => {
            let block = value.block().cloned().unwrap_or_default();
            update_primary(env, ws, av_id, row_id, &block)?;
            let row = if block.id.is_empty() { row_id } else { block.id.as_str() };
            touch_row(load(ws, av_id)?, row);
            notify_dependents(ws, env.relations, av_id);
            return Ok(());
        }
        KeyType::Relation => {
            let block_ids = value
                .relation_payload()
                .map(|relation| relation.block_ids.clone())
                .unwrap_or_default();
            relation::update_relation_cell(ws, env.relations, av_id, key_id, row_id, block_ids)
                .for_av(av_id)?;
        }
        _ => {
            set_plain_value(load(ws, av_id)?, key_id, row_id, value.clone())?;
            notify_dependents(ws, env.relations, av_id);
        }
    }
    touch_row(load(ws, av_id)?, row_id);
    Ok(())
}
