//! Attribute-view use-case service.
//!
//! # Responsibility
//! - Apply `Operation`s: load, mutate, persist, then emit invalidation events.
//! - Serve read APIs (render, history render, key search, attribute panel).
//!
//! # Invariants
//! - A failing operation persists no attribute view and writes no block
//!   attribute.
//! - Read APIs wait for the sync barrier before loading.

use crate::config::EngineConfig;
use crate::event::{EventSink, InvalidationEvent, InvalidationReason, NoopEventSink};
use crate::model::key::RollupCalc;
use crate::model::{AttributeView, Key, KeyType, RollupConfig, Value, ViewFilter, ViewSort};
use crate::relation::{self, BindingChange, Committed, RelationIndex, RelationSpec, WorkingSet};
use crate::render::table::Table;
use crate::render::{render_row, render_view, RenderContext, RenderRequest};
use crate::repo::av_store::{validate_av_id, AvStore, StoreError};
use crate::repo::document::{bind_block, block_av_ids, unbind_block, DocumentTree};
use crate::repo::history::{load_from_snapshot, HistoryArchive, SnapshotRepository};
use crate::service::error::{TxContext, TxError, TxErrorKind, TxResult};
use crate::service::operation::{Action, Operation};
use crate::service::row_ops::{self, load, RowEnv};
use crate::service::schema_ops;
use crate::sync::{SyncBarrier, MAX_SYNC_WAIT};
use log::{error, info, warn};
use std::sync::Arc;

/// What one applied operation persisted and announced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Saved attribute views in save order.
    pub saved: Vec<String>,
    pub events: Vec<InvalidationEvent>,
}

/// Filters and sorts of an attribute view's active view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FiltersAndSorts {
    pub filters: Vec<ViewFilter>,
    pub sorts: Vec<ViewSort>,
}

/// One column of a block's attribute panel.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockKeyValue {
    pub key: Key,
    pub value: Value,
}

/// A block's row in one attribute view.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockAttributeView {
    pub av_id: String,
    pub av_name: String,
    pub key_values: Vec<BlockKeyValue>,
}

/// Entry point for attribute-view mutations and reads.
pub struct AttributeViewService<S: AvStore, D: DocumentTree> {
    store: S,
    docs: D,
    config: EngineConfig,
    relations: Arc<RelationIndex>,
    events: Arc<dyn EventSink>,
    sync: Arc<SyncBarrier>,
}

impl<S: AvStore, D: DocumentTree> AttributeViewService<S, D> {
    pub fn new(store: S, docs: D, config: EngineConfig) -> Self {
        Self {
            store,
            docs,
            config,
            relations: Arc::new(RelationIndex::new()),
            events: Arc::new(NoopEventSink),
            sync: Arc::new(SyncBarrier::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Shares a back-reference index between services.
    pub fn with_relation_index(mut self, relations: Arc<RelationIndex>) -> Self {
        self.relations = relations;
        self
    }

    pub fn with_sync_barrier(mut self, sync: Arc<SyncBarrier>) -> Self {
        self.sync = sync;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn docs(&self) -> &D {
        &self.docs
    }

    pub fn relation_index(&self) -> &RelationIndex {
        &self.relations
    }

    pub fn sync_barrier(&self) -> &SyncBarrier {
        &self.sync
    }

    /// Rebuilds the back-reference index from every stored attribute view.
    pub fn rebuild_relation_index(&self) -> TxResult<usize> {
        self.relations.rebuild(&self.store).for_av("")
    }

    fn row_env(&self) -> RowEnv<'_> {
        RowEnv {
            docs: &self.docs,
            store: &self.store,
            relations: &self.relations,
            default_page_size: self.config.default_page_size,
        }
    }

    fn render_context(&self) -> RenderContext<'_> {
        RenderContext {
            docs: &self.docs,
            store: &self.store,
            relations: Some(&self.relations),
            default_page_size: self.config.default_page_size,
        }
    }

    /// Applies one operation.
    ///
    /// Every attribute view the operation touched is saved only after the
    /// whole change succeeded; events are emitted after saving.
    pub fn apply(&self, op: &Operation) -> TxResult<ApplyReport> {
        let action = op.action.name();
        validate_av_id(&op.av_id).for_av(&op.av_id)?;
        let mut ws = WorkingSet::new(&self.store);
        if let Err(err) = self.dispatch(&mut ws, &op.av_id, &op.action) {
            error!(
                "event=av_apply module=service status=error action={action} av_id={} kind={} error={}",
                op.av_id,
                err.kind.as_str(),
                err.message
            );
            return Err(err);
        }
        let committed = ws.commit().for_av(&op.av_id).map_err(|err| {
            error!(
                "event=av_apply module=service status=error action={action} av_id={} kind={} error={}",
                op.av_id,
                err.kind.as_str(),
                err.message
            );
            err
        })?;
        self.flush_bindings(&op.av_id, &committed.bindings)?;
        let Committed { saved, events, .. } = committed;
        for event in &events {
            self.events.emit(event.clone());
        }
        info!(
            "event=av_apply module=service status=ok action={action} av_id={} saved={} events={}",
            op.av_id,
            saved.len(),
            events.len()
        );
        Ok(ApplyReport { saved, events })
    }

    /// Writes queued `custom-avs` changes once the attribute views are saved.
    fn flush_bindings(&self, av_id: &str, bindings: &[BindingChange]) -> TxResult<()> {
        for change in bindings {
            let (block_id, result) = match change {
                BindingChange::Bind { block_id, av_id: target } => {
                    (block_id, bind_block(&self.docs, block_id, target))
                }
                BindingChange::Unbind { block_id, av_id: target } => {
                    (block_id, unbind_block(&self.docs, block_id, target))
                }
            };
            if let Err(err) = result {
                error!(
                    "event=av_bind module=service status=error av_id={av_id} block_id={block_id} error={err}"
                );
                return Err(err).for_av(av_id);
            }
        }
        Ok(())
    }

    /// Applies operations in order, stopping at the first failure; earlier
    /// operations stay persisted.
    pub fn apply_all(&self, ops: &[Operation]) -> TxResult<Vec<ApplyReport>> {
        ops.iter().map(|op| self.apply(op)).collect()
    }

    fn dispatch(&self, ws: &mut WorkingSet<'_>, av_id: &str, action: &Action) -> TxResult<()> {
        let env = self.row_env();
        match action {
            Action::SetName { name } => load(ws, av_id)?.name = name.trim().to_string(),
            Action::AddColumn {
                key_id,
                name,
                key_type,
                icon,
                previous_key_id,
            } => schema_ops::add_column(
                load(ws, av_id)?,
                key_id,
                name,
                *key_type,
                icon,
                previous_key_id.as_deref(),
            )?,
            Action::RemoveColumn { key_id } => {
                let key_type = load(ws, av_id)?.key(key_id).for_av(av_id)?.key_type();
                if key_type == KeyType::Block {
                    return Err(TxError::invariant(av_id, "the primary column cannot be removed"));
                }
                if key_type == KeyType::Relation {
                    relation::remove_relation_column(ws, &self.relations, av_id, key_id)
                        .for_av(av_id)?;
                } else {
                    load(ws, av_id)?.remove_key(key_id).for_av(av_id)?;
                }
                for dependent in self.relations.sources_of(av_id) {
                    if dependent != av_id {
                        ws.notify(&dependent, InvalidationReason::ColumnRemoved);
                    }
                }
            }
            Action::SortColumn {
                view_id,
                key_id,
                previous_key_id,
            } => schema_ops::sort_column(
                load(ws, av_id)?,
                view_id.as_deref(),
                key_id,
                previous_key_id.as_deref(),
            )?,
            Action::RenameColumn { key_id, name } => {
                schema_ops::rename_column(load(ws, av_id)?, key_id, name)?
            }
            Action::RetypeColumn { key_id, key_type } => {
                let current = load(ws, av_id)?.key(key_id).for_av(av_id)?.key_type();
                if current == KeyType::Relation && *key_type != KeyType::Relation {
                    relation::sever_relation_column(ws, &self.relations, av_id, key_id)
                        .for_av(av_id)?;
                }
                schema_ops::retype_column(load(ws, av_id)?, key_id, *key_type)?;
            }
            Action::SetColumnIcon { key_id, icon } => {
                schema_ops::set_column_icon(load(ws, av_id)?, key_id, icon)?
            }
            Action::SetTemplate { key_id, template } => {
                schema_ops::set_template(load(ws, av_id)?, key_id, template)?
            }
            Action::SetNumberFormat { key_id, format } => {
                schema_ops::set_number_format(load(ws, av_id)?, key_id, *format)?
            }
            Action::UpdateRelation {
                key_id,
                target_av_id,
                is_two_way,
                back_key_name,
            } => {
                validate_av_id(target_av_id).for_av(av_id)?;
                let spec = RelationSpec {
                    target_av_id: target_av_id.clone(),
                    is_two_way: *is_two_way,
                    back_key_name: back_key_name.clone(),
                };
                relation::update_relation_column(ws, &self.relations, av_id, key_id, &spec)
                    .for_av(av_id)?;
            }
            Action::UpdateRollup {
                key_id,
                relation_key_id,
                target_key_id,
                calc,
            } => {
                let target_av_id = {
                    let av = load(ws, av_id)?;
                    let relation_key = av.key(relation_key_id).for_av(av_id)?;
                    if relation_key.key_type() != KeyType::Relation {
                        return Err(TxError::new(
                            TxErrorKind::TypeMismatch,
                            av_id,
                            format!("column {relation_key_id} is not a relation"),
                        ));
                    }
                    relation_key
                        .relation()
                        .map(|config| config.av_id.clone())
                        .ok_or_else(|| {
                            TxError::invariant(
                                av_id,
                                format!("relation column {relation_key_id} has no target"),
                            )
                        })?
                };
                load(ws, &target_av_id)?
                    .key(target_key_id)
                    .for_av(&target_av_id)?;
                let config = RollupConfig {
                    relation_key_id: relation_key_id.clone(),
                    key_id: target_key_id.clone(),
                    calc: calc.map(|operator| RollupCalc { operator }),
                };
                schema_ops::set_rollup(load(ws, av_id)?, key_id, config)?;
            }
            Action::SetOptions { key_id, options } => {
                schema_ops::set_options(load(ws, av_id)?, key_id, options)?
            }
            Action::RemoveOption { key_id, name } => {
                schema_ops::remove_option(load(ws, av_id)?, key_id, name)?
            }
            Action::UpdateOption {
                key_id,
                old_name,
                new_name,
                color,
            } => schema_ops::update_option(load(ws, av_id)?, key_id, old_name, new_name, color)?,

            Action::SetColumnWidth {
                view_id,
                key_id,
                width,
            } => schema_ops::set_column_width(load(ws, av_id)?, view_id.as_deref(), key_id, width)?,
            Action::SetColumnWrap {
                view_id,
                key_id,
                wrap,
            } => schema_ops::set_column_wrap(load(ws, av_id)?, view_id.as_deref(), key_id, *wrap)?,
            Action::SetColumnHidden {
                view_id,
                key_id,
                hidden,
            } => schema_ops::set_column_hidden(
                load(ws, av_id)?,
                view_id.as_deref(),
                key_id,
                *hidden,
            )?,
            Action::SetColumnPin {
                view_id,
                key_id,
                pin,
            } => schema_ops::set_column_pin(load(ws, av_id)?, view_id.as_deref(), key_id, *pin)?,
            Action::SetColumnCalc {
                view_id,
                key_id,
                operator,
            } => schema_ops::set_column_calc(
                load(ws, av_id)?,
                view_id.as_deref(),
                key_id,
                *operator,
            )?,

            Action::AddView { view_id, name } => {
                schema_ops::add_view(load(ws, av_id)?, view_id, name)?
            }
            Action::RemoveView { view_id } => schema_ops::remove_view(load(ws, av_id)?, view_id)?,
            Action::DuplicateView {
                view_id,
                new_view_id,
            } => schema_ops::duplicate_view(load(ws, av_id)?, view_id, new_view_id)?,
            Action::SortView {
                view_id,
                previous_view_id,
            } => schema_ops::sort_view(load(ws, av_id)?, view_id, previous_view_id.as_deref())?,
            Action::RenameView { view_id, name } => {
                schema_ops::rename_view(load(ws, av_id)?, view_id, name)?
            }
            Action::SetViewIcon { view_id, icon } => {
                schema_ops::set_view_icon(load(ws, av_id)?, view_id, icon)?
            }
            Action::SetFilters { view_id, filters } => {
                schema_ops::set_filters(load(ws, av_id)?, view_id.as_deref(), filters)?
            }
            Action::SetSorts { view_id, sorts } => {
                schema_ops::set_sorts(load(ws, av_id)?, view_id.as_deref(), sorts)?
            }
            Action::SetPageSize { view_id, page_size } => {
                schema_ops::set_page_size(load(ws, av_id)?, view_id.as_deref(), *page_size)?
            }

            Action::InsertRows {
                view_id,
                previous_id,
                rows,
            } => row_ops::insert_rows(
                &env,
                ws,
                av_id,
                view_id.as_deref(),
                previous_id.as_deref(),
                rows,
            )?,
            Action::RemoveRows { row_ids } => row_ops::remove_rows(&env, ws, av_id, row_ids)?,
            Action::SortRow {
                view_id,
                row_id,
                previous_id,
            } => schema_ops::sort_row(
                load(ws, av_id)?,
                view_id.as_deref(),
                row_id,
                previous_id.as_deref(),
            )?,
            Action::ReplaceBlock {
                old_id,
                new_id,
                is_detached,
            } => row_ops::replace_block(&env, ws, av_id, old_id, new_id, *is_detached)?,
            Action::UpdateCell {
                key_id,
                row_id,
                value,
            } => row_ops::update_cell(&env, ws, av_id, key_id, row_id, value)?,
        }
        ws.mark_dirty(av_id);
        Ok(())
    }

    fn wait_for_sync(&self, read: &str) {
        if !self.sync.wait_quiescent(MAX_SYNC_WAIT) {
            warn!("event={read} module=service status=degraded reason=sync_wait_timeout");
        }
    }

    /// Renders one page of a view, creating the attribute view when absent.
    ///
    /// Repairs made while rendering and a switch of the active view are
    /// persisted.
    pub fn render(&self, av_id: &str, request: &RenderRequest) -> TxResult<Table> {
        self.wait_for_sync("av_render");
        let (av, created) = self.store.load_or_create(av_id).for_av(av_id)?;
        self.render_loaded(av, created, request)
    }

    /// Like [`Self::render`], but a missing attribute view is `NotFound`
    /// instead of being created.
    pub fn render_stored(&self, av_id: &str, request: &RenderRequest) -> TxResult<Table> {
        self.wait_for_sync("av_render");
        let av = self.store.load(av_id).for_av(av_id).map_err(|err| {
            warn!(
                "event=av_render module=service status=error av_id={av_id} error_code={} error={err}",
                err.kind.as_str()
            );
            err
        })?;
        self.render_loaded(av, false, request)
    }

    fn render_loaded(
        &self,
        mut av: AttributeView,
        created: bool,
        request: &RenderRequest,
    ) -> TxResult<Table> {
        let av_id = av.id.clone();
        let outcome = render_view(&mut av, &self.render_context(), request).for_av(&av_id)?;
        if created || outcome.changed {
            self.store.save(&av).for_av(&av_id)?;
        }
        Ok(outcome.table)
    }

    fn render_detached(&self, mut av: AttributeView) -> TxResult<Table> {
        let av_id = av.id.clone();
        let ctx = RenderContext {
            relations: None,
            ..self.render_context()
        };
        Ok(render_view(&mut av, &ctx, &RenderRequest::unpaged())
            .for_av(&av_id)?
            .table)
    }

    /// Renders the attribute view as archived at `created_unix`.
    pub fn render_history(&self, av_id: &str, created_unix: i64) -> TxResult<Table> {
        self.wait_for_sync("av_render_history");
        let archive = HistoryArchive::new(
            self.config.history_dir.clone(),
            self.config.data_dir.clone(),
        );
        let av = archive.load(av_id, created_unix).for_av(av_id)?;
        self.render_detached(av)
    }

    /// Renders the attribute view stored in snapshot `index_id`.
    pub fn render_snapshot(
        &self,
        repo: &dyn SnapshotRepository,
        index_id: &str,
        av_id: &str,
    ) -> TxResult<Table> {
        self.wait_for_sync("av_render_snapshot");
        let av = load_from_snapshot(repo, index_id, av_id).for_av(av_id)?;
        self.render_detached(av)
    }

    fn search_keys(
        &self,
        av_id: &str,
        keyword: &str,
        accept: impl Fn(KeyType) -> bool,
    ) -> TxResult<Vec<Key>> {
        self.wait_for_sync("av_search_keys");
        let av = self.store.load(av_id).for_av(av_id)?;
        let keyword = keyword.trim().to_lowercase();
        Ok(av
            .key_values
            .into_iter()
            .map(|kv| kv.key)
            .filter(|key| accept(key.key_type()))
            .filter(|key| keyword.is_empty() || key.name.to_lowercase().contains(&keyword))
            .collect())
    }

    /// Keys usable as plain columns (no relation, rollup, template or
    /// timestamp keys) whose name contains `keyword`.
    pub fn search_non_relation_keys(&self, av_id: &str, keyword: &str) -> TxResult<Vec<Key>> {
        self.search_keys(av_id, keyword, |key_type| {
            !matches!(
                key_type,
                KeyType::Relation
                    | KeyType::Rollup
                    | KeyType::Template
                    | KeyType::Created
                    | KeyType::Updated
            )
        })
    }

    pub fn search_relation_keys(&self, av_id: &str, keyword: &str) -> TxResult<Vec<Key>> {
        self.search_keys(av_id, keyword, |key_type| key_type == KeyType::Relation)
    }

    pub fn filters_and_sorts(&self, av_id: &str) -> TxResult<FiltersAndSorts> {
        self.wait_for_sync("av_filters_and_sorts");
        let av = self.store.load(av_id).for_av(av_id)?;
        let Some(view) = av
            .resolve_view_id(None)
            .and_then(|view_id| av.view(&view_id).ok().cloned())
        else {
            return Ok(FiltersAndSorts::default());
        };
        Ok(FiltersAndSorts {
            filters: view.table.filters,
            sorts: view.table.sorts,
        })
    }

    /// Attribute panel of a block: its row in every attribute view it is
    /// bound to, in active-view column order without the primary column.
    pub fn block_attribute_view_keys(&self, block_id: &str) -> TxResult<Vec<BlockAttributeView>> {
        self.wait_for_sync("av_block_keys");
        let av_ids = block_av_ids(&self.docs, block_id).for_av("")?;
        let mut panels = Vec::new();
        for av_id in av_ids {
            let mut av = match self.store.load(&av_id) {
                Ok(av) => av,
                Err(StoreError::NotFound(_)) => {
                    warn!(
                        "event=av_block_keys module=service status=degraded av_id={av_id} block_id={block_id} reason=av_missing"
                    );
                    continue;
                }
                Err(err) => return Err(err).for_av(&av_id),
            };
            if !av.has_row(block_id) {
                continue;
            }
            av.ensure_default_view();
            let Some(row) = render_row(&av, &self.render_context(), block_id) else {
                continue;
            };

            let mut order: Vec<String> = av
                .resolve_view_id(None)
                .and_then(|view_id| av.view(&view_id).ok())
                .map(|view| view.table.columns.iter().map(|column| column.id.clone()).collect())
                .unwrap_or_default();
            for kv in &av.key_values {
                if !order.contains(&kv.key.id) {
                    order.push(kv.key.id.clone());
                }
            }
            let key_values = order
                .iter()
                .filter_map(|key_id| {
                    let key = av.key(key_id).ok()?;
                    if key.key_type() == KeyType::Block {
                        return None;
                    }
                    let cell = row.cell(key_id)?;
                    Some(BlockKeyValue {
                        key: key.clone(),
                        value: cell.value.clone(),
                    })
                })
                .collect();
            panels.push(BlockAttributeView {
                av_id: av.id.clone(),
                av_name: av.name.clone(),
                key_values,
            });
        }
        Ok(panels)
    }
}
