//! Derived cells: created/updated stamps, relation display text, rollups and
//! templates.
//!
//! # Invariants
//! - Derived payloads are recomputed on every render and never persisted.
//! - Templates are evaluated last so they can read every other cell.
//! - Resolution never fails a render; problems degrade to empty cells.

use crate::model::id::{millis_to_local, now_millis, parse_compact_time, parse_id_time};
use crate::model::value::{RelationPayload, RollupPayload, TextPayload, TimestampPayload};
use crate::model::{AttributeView, CalcOperator, Key, KeyType, Value, ValuePayload};
use crate::render::calc;
use crate::render::table::TableRow;
use crate::repo::av_store::{AvStore, StoreError};
use crate::repo::document::{DocumentTree, NODE_ATTR_UPDATED};
use crate::template::{render_template, TemplateContext, TemplateScalar};
use log::warn;
use std::collections::BTreeMap;

/// Cell placeholder for a (key, row) pair without a stored value.
///
/// The empty ID marks it as synthesized.
pub fn placeholder(key_id: &str, row_id: &str, key_type: KeyType) -> Value {
    let mut value = Value::default_for(key_id, row_id, key_type);
    value.id = String::new();
    value
}

/// Loads the targets of every relation column of `av` (except `av` itself).
///
/// Missing or unreadable targets are skipped.
pub fn load_related(av: &AttributeView, store: &dyn AvStore) -> BTreeMap<String, AttributeView> {
    let mut related = BTreeMap::new();
    for kv in &av.key_values {
        let Some(relation) = kv.key.relation() else {
            continue;
        };
        if relation.av_id == av.id || related.contains_key(&relation.av_id) {
            continue;
        }
        match store.load(&relation.av_id) {
            Ok(target) => {
                related.insert(relation.av_id.clone(), target);
            }
            Err(StoreError::NotFound(_)) => warn!(
                "event=av_render module=render status=degraded av_id={} target_av_id={} reason=relation_target_missing",
                av.id, relation.av_id
            ),
            Err(err) => warn!(
                "event=av_render module=render status=degraded av_id={} target_av_id={} error={err}",
                av.id, relation.av_id
            ),
        }
    }
    related
}

/// Everything derived resolution reads besides the row itself.
pub struct DerivedSources<'a> {
    pub av: &'a AttributeView,
    pub related: &'a BTreeMap<String, AttributeView>,
    pub docs: &'a dyn DocumentTree,
}

impl<'a> DerivedSources<'a> {
    fn target(&self, av_id: &str) -> Option<&'a AttributeView> {
        if av_id == self.av.id {
            Some(self.av)
        } else {
            self.related.get(av_id)
        }
    }

    fn attrs(&self, av: &AttributeView, row_id: &str) -> BTreeMap<String, String> {
        let detached = av
            .block_key_values()
            .and_then(|kv| kv.value(row_id))
            .map(|value| value.is_detached)
            .unwrap_or(true);
        if detached {
            return BTreeMap::new();
        }
        self.docs.get_block_attrs(row_id).unwrap_or_else(|err| {
            warn!(
                "event=av_render module=render status=degraded av_id={} row_id={row_id} error={err}",
                av.id
            );
            BTreeMap::new()
        })
    }
}

fn created_millis(row_id: &str) -> i64 {
    match parse_id_time(row_id) {
        Some(time) => time.timestamp_millis(),
        None => {
            warn!("event=av_render module=render status=degraded row_id={row_id} reason=created_unparsable");
            now_millis()
        }
    }
}

fn updated_millis(av: &AttributeView, row_id: &str, attrs: &BTreeMap<String, String>) -> i64 {
    if let Some(time) = attrs
        .get(NODE_ATTR_UPDATED)
        .and_then(|value| parse_compact_time(value))
    {
        return time.timestamp_millis();
    }
    av.block_key_values()
        .and_then(|kv| kv.value(row_id))
        .and_then(|value| value.payload.block())
        .map(|block| block.updated)
        .filter(|updated| *updated != 0)
        .unwrap_or_else(now_millis)
}

fn created_payload(row_id: &str) -> ValuePayload {
    ValuePayload::Created {
        created: TimestampPayload::new(created_millis(row_id), true),
    }
}

fn updated_payload(av: &AttributeView, row_id: &str, attrs: &BTreeMap<String, String>) -> ValuePayload {
    ValuePayload::Updated {
        updated: TimestampPayload::new(updated_millis(av, row_id, attrs), true),
    }
}

fn relation_payload(sources: &DerivedSources<'_>, key: &Key, stored: &ValuePayload) -> ValuePayload {
    let block_ids = stored
        .relation_payload()
        .map(|relation| relation.block_ids.clone())
        .unwrap_or_default();
    let target = key.relation().and_then(|config| sources.target(&config.av_id));
    let contents = block_ids
        .iter()
        .map(|id| target.map(|target| target.row_text(id)).unwrap_or_default())
        .collect();
    ValuePayload::Relation {
        relation: RelationPayload {
            block_ids,
            contents,
        },
    }
}

/// One rollup element: the target cell of a related row.
fn rollup_element(sources: &DerivedSources<'_>, target: &AttributeView, key: &Key, row_id: &str) -> Value {
    let mut value = match key.key_type() {
        KeyType::Created => {
            let mut value = placeholder(&key.id, row_id, KeyType::Created);
            value.payload = created_payload(row_id);
            value
        }
        KeyType::Updated => {
            let attrs = sources.attrs(target, row_id);
            let mut value = placeholder(&key.id, row_id, KeyType::Updated);
            value.payload = updated_payload(target, row_id, &attrs);
            value
        }
        KeyType::Relation => {
            let stored = target
                .value(&key.id, row_id)
                .map(|value| value.payload.clone())
                .unwrap_or_else(|| ValuePayload::default_for(KeyType::Relation));
            let mut value = placeholder(&key.id, row_id, KeyType::Relation);
            value.payload = relation_payload(sources, key, &stored);
            value
        }
        kind => target
            .value(&key.id, row_id)
            .cloned()
            .unwrap_or_else(|| placeholder(&key.id, row_id, kind)),
    };
    if let Some(number) = value.payload.number_payload_mut() {
        number.apply_format(key.number_format());
    }
    value
}

fn rollup_payload(sources: &DerivedSources<'_>, key: &Key, row_id: &str) -> ValuePayload {
    let empty = ValuePayload::Rollup {
        rollup: RollupPayload::default(),
    };
    let Some(config) = key.rollup() else {
        return empty;
    };
    let Ok(relation_key) = sources.av.key(&config.relation_key_id) else {
        return empty;
    };
    let Some(target) = relation_key
        .relation()
        .and_then(|relation| sources.target(&relation.av_id))
    else {
        return empty;
    };
    let Ok(target_key) = target.key(&config.key_id) else {
        return empty;
    };
    let related_ids = sources
        .av
        .value(&relation_key.id, row_id)
        .and_then(|value| value.payload.relation_payload())
        .map(|relation| relation.block_ids.clone())
        .unwrap_or_default();

    let mut contents: Vec<Value> = related_ids
        .iter()
        .map(|id| rollup_element(sources, target, target_key, id))
        .collect();

    let operator = config
        .calc
        .map(|calc| calc.operator)
        .unwrap_or(CalcOperator::None);
    let payloads: Vec<&ValuePayload> = contents.iter().map(|value| &value.payload).collect();
    if let Some(result) = calc::aggregate(operator, &payloads, target_key.number_format()) {
        let mut value = placeholder(&target_key.id, row_id, result.key_type());
        value.payload = result;
        contents = vec![value];
    }
    ValuePayload::Rollup {
        rollup: RollupPayload { contents },
    }
}

fn template_context(
    sources: &DerivedSources<'_>,
    row: &TableRow,
    attrs: &BTreeMap<String, String>,
) -> TemplateContext {
    let mut columns = BTreeMap::new();
    for cell in &row.cells {
        let Ok(key) = sources.av.key(cell.key_id()) else {
            continue;
        };
        let payload = &cell.value.payload;
        let scalar = match key.key_type() {
            KeyType::Template => continue,
            KeyType::Number => match payload.as_number() {
                Some(number) => TemplateScalar::Number(number),
                None => TemplateScalar::Text(String::new()),
            },
            KeyType::Date | KeyType::Created | KeyType::Updated => match payload.as_millis() {
                Some(millis) => TemplateScalar::Date(millis_to_local(millis)),
                None => TemplateScalar::Text(String::new()),
            },
            _ => TemplateScalar::Text(payload.to_text()),
        };
        columns.insert(key.name.clone(), scalar);
    }
    TemplateContext {
        id: row.id.clone(),
        created: parse_id_time(&row.id),
        updated: Some(millis_to_local(updated_millis(sources.av, &row.id, attrs))),
        attrs: attrs.clone(),
        columns,
    }
}

/// Replaces every derived cell of `row` with its computed payload.
pub fn resolve_row(sources: &DerivedSources<'_>, row: &mut TableRow) {
    let attrs = sources.attrs(sources.av, &row.id);
    let mut templates: Vec<(usize, String)> = Vec::new();

    for (index, cell) in row.cells.iter_mut().enumerate() {
        let Ok(key) = sources.av.key(cell.key_id()) else {
            continue;
        };
        let payload = match key.key_type() {
            KeyType::Created => created_payload(&row.id),
            KeyType::Updated => updated_payload(sources.av, &row.id, &attrs),
            KeyType::Relation => relation_payload(sources, key, &cell.value.payload),
            KeyType::Rollup => rollup_payload(sources, key, &row.id),
            KeyType::Template => {
                templates.push((index, key.template().unwrap_or_default().to_string()));
                continue;
            }
            _ => continue,
        };
        cell.value.payload = payload;
        cell.value_type = cell.value.key_type();
    }

    if templates.is_empty() {
        return;
    }
    let ctx = template_context(sources, row, &attrs);
    for (index, source) in templates {
        let content = render_template(&source, &ctx).unwrap_or_else(|err| {
            warn!(
                "event=av_render module=render status=degraded av_id={} row_id={} error={err}",
                sources.av.id, row.id
            );
            String::new()
        });
        if let Some(cell) = row.cells.get_mut(index) {
            cell.value.payload = ValuePayload::Template {
                template: TextPayload::new(content),
            };
            cell.value_type = KeyType::Template;
        }
    }
}

/// Resolves every row in place.
pub fn resolve_rows(sources: &DerivedSources<'_>, rows: &mut [TableRow]) {
    for row in rows {
        resolve_row(sources, row);
    }
}
