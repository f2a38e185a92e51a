//! Column and view operations on one in-memory attribute view.

use crate::model::attribute_view::DEFAULT_VIEW_NAME;
use crate::model::key::KeyConfig;
use crate::model::value::{AssetItem, AssetKind, DatePayload, SelectItem, TextPayload};
use crate::model::view::move_after;
use crate::model::{
    AttributeView, AvError, CalcOperator, ColumnCalc, Key, KeyType, NumberFormat, RollupConfig,
    SelectOption, ValuePayload, View, ViewColumn, ViewFilter, ViewSort,
};
use crate::service::error::{TxContext, TxError, TxErrorKind, TxResult};
use std::collections::BTreeSet;

const OPTION_COLORS: usize = 14;

/// Palette color for the option at `index`.
pub(crate) fn option_color(index: usize) -> String {
    (index % OPTION_COLORS + 1).to_string()
}

fn not_found(av_id: &str, message: String) -> TxError {
    TxError::new(TxErrorKind::NotFound, av_id, message)
}

fn mismatch(av_id: &str, expected: KeyType, actual: KeyType) -> TxError {
    TxError::new(
        TxErrorKind::TypeMismatch,
        av_id,
        AvError::TypeMismatch { expected, actual }.to_string(),
    )
}

/// Adds options for unknown item names and fills item colors from the
/// palette.
pub(crate) fn register_options(key: &mut Key, items: &mut [SelectItem]) {
    let Some(options) = key.options_mut() else {
        return;
    };
    for item in items.iter_mut() {
        match options.iter().find(|option| option.name == item.content) {
            Some(option) => item.color = option.color.clone(),
            None => {
                if item.color.is_empty() {
                    item.color = option_color(options.len());
                }
                options.push(SelectOption {
                    name: item.content.clone(),
                    color: item.color.clone(),
                });
            }
        }
    }
}

/// Explicit view (must exist) or the resolved active view.
pub(crate) fn resolve_view_id(av: &AttributeView, requested: Option<&str>) -> TxResult<String> {
    match requested {
        Some(view_id) => av.view(view_id).map(|view| view.id.clone()).for_av(&av.id),
        None => av
            .resolve_view_id(None)
            .ok_or_else(|| not_found(&av.id, "attribute view has no views".to_string())),
    }
}

fn view_for_update<'a>(av: &'a mut AttributeView, requested: Option<&str>) -> TxResult<&'a mut View> {
    av.ensure_default_view();
    let view_id = resolve_view_id(av, requested)?;
    let av_id = av.id.clone();
    av.view_mut(&view_id).for_av(&av_id)
}

fn column_for_update<'a>(
    av: &'a mut AttributeView,
    view_id: Option<&str>,
    key_id: &str,
) -> TxResult<&'a mut ViewColumn> {
    let av_id = av.id.clone();
    view_for_update(av, view_id)?
        .table
        .column_mut(key_id)
        .ok_or_else(|| not_found(&av_id, format!("column not in view: {key_id}")))
}

pub(crate) fn add_column(
    av: &mut AttributeView,
    key_id: &str,
    name: &str,
    key_type: KeyType,
    icon: &str,
    previous_key_id: Option<&str>,
) -> TxResult<()> {
    let av_id = av.id.clone();
    if !KeyType::CREATABLE.contains(&key_type) {
        return Err(TxError::invariant(
            &av_id,
            format!("column type {key_type} cannot be created"),
        ));
    }
    if key_id.is_empty() {
        return Err(TxError::invariant(&av_id, "column id must not be empty"));
    }
    av.add_key(Key::new(key_id, name.trim(), icon, key_type))
        .for_av(&av_id)?;
    if av.ensure_default_view() {
        return Ok(());
    }
    for view in &mut av.views {
        let column = ViewColumn::new(key_id);
        let at = previous_key_id.and_then(|previous| {
            view.table
                .columns
                .iter()
                .position(|column| column.id == previous)
        });
        match at {
            Some(index) => view.table.columns.insert(index + 1, column),
            None => view.table.columns.push(column),
        }
    }
    Ok(())
}

pub(crate) fn sort_column(
    av: &mut AttributeView,
    view_id: Option<&str>,
    key_id: &str,
    previous_key_id: Option<&str>,
) -> TxResult<()> {
    let av_id = av.id.clone();
    let columns = &mut view_for_update(av, view_id)?.table.columns;
    let from = columns
        .iter()
        .position(|column| column.id == key_id)
        .ok_or_else(|| not_found(&av_id, format!("column not in view: {key_id}")))?;
    let matcher = |column: &ViewColumn| Some(column.id.as_str()) == previous_key_id;
    let previous = previous_key_id.map(|_| &matcher as &dyn Fn(&ViewColumn) -> bool);
    if !move_after(columns, from, previous) {
        return Err(not_found(
            &av_id,
            format!("column not in view: {}", previous_key_id.unwrap_or_default()),
        ));
    }
    Ok(())
}

pub(crate) fn rename_column(av: &mut AttributeView, key_id: &str, name: &str) -> TxResult<()> {
    let av_id = av.id.clone();
    av.key_mut(key_id).for_av(&av_id)?.name = name.trim().to_string();
    Ok(())
}

pub(crate) fn set_column_icon(av: &mut AttributeView, key_id: &str, icon: &str) -> TxResult<()> {
    let av_id = av.id.clone();
    av.key_mut(key_id).for_av(&av_id)?.icon = icon.to_string();
    Ok(())
}

/// Converts a stored cell for a retyped column; `None` drops the cell.
fn convert_payload(old: &ValuePayload, key_type: KeyType) -> Option<ValuePayload> {
    if key_type.is_derived() || matches!(key_type, KeyType::Relation | KeyType::Block) {
        return None;
    }
    if old.is_empty() {
        return None;
    }
    let text = old.to_text();
    let payload = match key_type {
        KeyType::Text => ValuePayload::text(text),
        KeyType::Url => ValuePayload::Url {
            url: TextPayload::new(text),
        },
        KeyType::Email => ValuePayload::Email {
            email: TextPayload::new(text),
        },
        KeyType::Phone => ValuePayload::Phone {
            phone: TextPayload::new(text),
        },
        KeyType::Number => {
            ValuePayload::number(old.as_number().or_else(|| text.trim().parse().ok())?)
        }
        KeyType::Date => ValuePayload::Date {
            date: DatePayload::new(old.as_millis()?),
        },
        KeyType::Select | KeyType::MSelect => {
            let mut items: Vec<SelectItem> = match old.select_items() {
                Some(items) => items.to_vec(),
                None => text
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(|name| SelectItem {
                        content: name.to_string(),
                        color: String::new(),
                    })
                    .collect(),
            };
            if key_type == KeyType::Select {
                items.truncate(1);
                ValuePayload::Select { items }
            } else {
                ValuePayload::MSelect { items }
            }
        }
        KeyType::Checkbox => ValuePayload::checkbox(true),
        KeyType::MAsset => ValuePayload::MAsset {
            assets: vec![AssetItem {
                kind: AssetKind::File,
                name: String::new(),
                content: text,
            }],
        },
        _ => return None,
    };
    Some(payload)
}

/// Changes a column's type, converting stored cells where a conversion
/// exists and dropping the rest.
pub(crate) fn retype_column(av: &mut AttributeView, key_id: &str, key_type: KeyType) -> TxResult<()> {
    let av_id = av.id.clone();
    if !KeyType::CREATABLE.contains(&key_type) {
        return Err(TxError::invariant(
            &av_id,
            format!("column type {key_type} cannot be created"),
        ));
    }
    let kv = av.key_values_mut(key_id).for_av(&av_id)?;
    if kv.key.key_type() == KeyType::Block {
        return Err(TxError::invariant(&av_id, "the primary column cannot be retyped"));
    }
    if kv.key.key_type() == key_type {
        return Ok(());
    }
    kv.key.retype(key_type);
    let values = std::mem::take(&mut kv.values);
    kv.values = values
        .into_iter()
        .filter_map(|mut value| {
            value.payload = convert_payload(&value.payload, key_type)?;
            Some(value)
        })
        .collect();
    for value in &mut kv.values {
        if let Some(items) = value.payload.select_items_mut() {
            register_options(&mut kv.key, items);
        }
    }
    Ok(())
}

pub(crate) fn set_template(av: &mut AttributeView, key_id: &str, source: &str) -> TxResult<()> {
    let av_id = av.id.clone();
    let key = av.key_mut(key_id).for_av(&av_id)?;
    match &mut key.config {
        KeyConfig::Template { template } => {
            *template = source.to_string();
            Ok(())
        }
        other => Err(mismatch(&av_id, KeyType::Template, other.key_type())),
    }
}

pub(crate) fn set_number_format(
    av: &mut AttributeView,
    key_id: &str,
    format: NumberFormat,
) -> TxResult<()> {
    let av_id = av.id.clone();
    let kv = av.key_values_mut(key_id).for_av(&av_id)?;
    match &mut kv.key.config {
        KeyConfig::Number { number_format } => *number_format = format,
        other => return Err(mismatch(&av_id, KeyType::Number, other.key_type())),
    }
    for value in &mut kv.values {
        if let Some(number) = value.payload.number_payload_mut() {
            number.apply_format(format);
        }
    }
    Ok(())
}

pub(crate) fn set_rollup(av: &mut AttributeView, key_id: &str, config: RollupConfig) -> TxResult<()> {
    let av_id = av.id.clone();
    let key = av.key_mut(key_id).for_av(&av_id)?;
    match &mut key.config {
        KeyConfig::Rollup { rollup } => {
            *rollup = Some(config);
            Ok(())
        }
        other => Err(mismatch(&av_id, KeyType::Rollup, other.key_type())),
    }
}

fn options_of<'a>(key: &'a mut Key, av_id: &str) -> TxResult<&'a mut Vec<SelectOption>> {
    let actual = key.key_type();
    key.options_mut()
        .ok_or_else(|| mismatch(av_id, KeyType::Select, actual))
}

pub(crate) fn set_options(
    av: &mut AttributeView,
    key_id: &str,
    options: &[SelectOption],
) -> TxResult<()> {
    let av_id = av.id.clone();
    let palette = options_of(av.key_mut(key_id).for_av(&av_id)?, &av_id)?;
    let mut seen = BTreeSet::new();
    *palette = options
        .iter()
        .filter(|option| !option.name.is_empty() && seen.insert(option.name.clone()))
        .cloned()
        .collect();
    Ok(())
}

pub(crate) fn remove_option(av: &mut AttributeView, key_id: &str, name: &str) -> TxResult<()> {
    let av_id = av.id.clone();
    let kv = av.key_values_mut(key_id).for_av(&av_id)?;
    options_of(&mut kv.key, &av_id)?.retain(|option| option.name != name);
    for value in &mut kv.values {
        if let Some(items) = value.payload.select_items_mut() {
            items.retain(|item| item.content != name);
        }
    }
    Ok(())
}

pub(crate) fn update_option(
    av: &mut AttributeView,
    key_id: &str,
    old_name: &str,
    new_name: &str,
    color: &str,
) -> TxResult<()> {
    let av_id = av.id.clone();
    let new_name = new_name.trim();
    if new_name.is_empty() {
        return Err(TxError::invariant(&av_id, "option name must not be empty"));
    }
    let kv = av.key_values_mut(key_id).for_av(&av_id)?;
    let options = options_of(&mut kv.key, &av_id)?;
    if new_name != old_name && options.iter().any(|option| option.name == new_name) {
        return Err(TxError::invariant(
            &av_id,
            format!("option {new_name} already exists"),
        ));
    }
    let option = options
        .iter_mut()
        .find(|option| option.name == old_name)
        .ok_or_else(|| not_found(&av_id, format!("option not found: {old_name}")))?;
    option.name = new_name.to_string();
    option.color = color.to_string();
    for value in &mut kv.values {
        if let Some(items) = value.payload.select_items_mut() {
            for item in items.iter_mut().filter(|item| item.content == old_name) {
                item.content = new_name.to_string();
                item.color = color.to_string();
            }
        }
    }
    Ok(())
}

pub(crate) fn set_column_width(
    av: &mut AttributeView,
    view_id: Option<&str>,
    key_id: &str,
    width: &str,
) -> TxResult<()> {
    column_for_update(av, view_id, key_id)?.width = width.to_string();
    Ok(())
}

pub(crate) fn set_column_wrap(
    av: &mut AttributeView,
    view_id: Option<&str>,
    key_id: &str,
    wrap: bool,
) -> TxResult<()> {
    column_for_update(av, view_id, key_id)?.wrap = wrap;
    Ok(())
}

pub(crate) fn set_column_hidden(
    av: &mut AttributeView,
    view_id: Option<&str>,
    key_id: &str,
    hidden: bool,
) -> TxResult<()> {
    column_for_update(av, view_id, key_id)?.hidden = hidden;
    Ok(())
}

pub(crate) fn set_column_pin(
    av: &mut AttributeView,
    view_id: Option<&str>,
    key_id: &str,
    pin: bool,
) -> TxResult<()> {
    column_for_update(av, view_id, key_id)?.pin = pin;
    Ok(())
}

pub(crate) fn set_column_calc(
    av: &mut AttributeView,
    view_id: Option<&str>,
    key_id: &str,
    operator: CalcOperator,
) -> TxResult<()> {
    column_for_update(av, view_id, key_id)?.calc =
        (operator != CalcOperator::None).then_some(ColumnCalc { operator });
    Ok(())
}

/// Adds a view copying the first view's columns and row order and makes it
/// active.
pub(crate) fn add_view(av: &mut AttributeView, view_id: &str, name: &str) -> TxResult<()> {
    let av_id = av.id.clone();
    if view_id.is_empty() || av.view(view_id).is_ok() {
        return Err(TxError::invariant(
            &av_id,
            format!("view id `{view_id}` is empty or already used"),
        ));
    }
    let (columns, row_ids) = match av.views.first() {
        Some(first) => (
            first
                .table
                .columns
                .iter()
                .map(|column| ViewColumn::new(column.id.clone()))
                .collect(),
            first.table.row_ids.clone(),
        ),
        None => {
            let mut keys: Vec<&Key> = av.key_values.iter().map(|kv| &kv.key).collect();
            keys.sort_by_key(|key| key.key_type() != KeyType::Block);
            (
                keys.into_iter()
                    .map(|key| ViewColumn::new(key.id.clone()))
                    .collect(),
                av.row_ids(),
            )
        }
    };
    let name = match name.trim() {
        "" => DEFAULT_VIEW_NAME,
        name => name,
    };
    let mut view = View::new_table(name);
    view.id = view_id.to_string();
    view.table.columns = columns;
    view.table.row_ids = row_ids;
    av.active_view_id = view.id.clone();
    av.views.push(view);
    Ok(())
}

/// Removes a view; the last view can never be removed.
pub(crate) fn remove_view(av: &mut AttributeView, view_id: &str) -> TxResult<()> {
    let av_id = av.id.clone();
    let index = av.view_index(view_id).for_av(&av_id)?;
    if av.views.len() <= 1 {
        return Err(TxError::invariant(&av_id, "the last view cannot be removed"));
    }
    av.views.remove(index);
    if av.view(&av.active_view_id).is_err() {
        av.active_view_id = av.views[index.saturating_sub(1)].id.clone();
    }
    Ok(())
}

pub(crate) fn duplicate_view(av: &mut AttributeView, view_id: &str, new_view_id: &str) -> TxResult<()> {
    let av_id = av.id.clone();
    if new_view_id.is_empty() || av.view(new_view_id).is_ok() {
        return Err(TxError::invariant(
            &av_id,
            format!("view id `{new_view_id}` is empty or already used"),
        ));
    }
    let index = av.view_index(view_id).for_av(&av_id)?;
    let mut copy = av.views[index].clone();
    copy.id = new_view_id.to_string();
    copy.name = av.duplicate_view_name(&av.views[index].name);
    av.active_view_id = copy.id.clone();
    av.views.insert(index + 1, copy);
    Ok(())
}

pub(crate) fn sort_view(
    av: &mut AttributeView,
    view_id: &str,
    previous_view_id: Option<&str>,
) -> TxResult<()> {
    let av_id = av.id.clone();
    let from = av.view_index(view_id).for_av(&av_id)?;
    let matcher = |view: &View| Some(view.id.as_str()) == previous_view_id;
    let previous = previous_view_id.map(|_| &matcher as &dyn Fn(&View) -> bool);
    if !move_after(&mut av.views, from, previous) {
        return Err(not_found(
            &av_id,
            format!("view not found: {}", previous_view_id.unwrap_or_default()),
        ));
    }
    Ok(())
}

pub(crate) fn rename_view(av: &mut AttributeView, view_id: &str, name: &str) -> TxResult<()> {
    let av_id = av.id.clone();
    av.view_mut(view_id).for_av(&av_id)?.name = name.trim().to_string();
    Ok(())
}

pub(crate) fn set_view_icon(av: &mut AttributeView, view_id: &str, icon: &str) -> TxResult<()> {
    let av_id = av.id.clone();
    av.view_mut(view_id).for_av(&av_id)?.icon = icon.to_string();
    Ok(())
}

/// Replaces a view's filters; every filter must reference an existing key and
/// carry operands typed to it.
pub(crate) fn set_filters(
    av: &mut AttributeView,
    view_id: Option<&str>,
    filters: &[ViewFilter],
) -> TxResult<()> {
    let av_id = av.id.clone();
    for filter in filters {
        let key_type = av.key(&filter.column).for_av(&av_id)?.key_type();
        if key_type == KeyType::Rollup {
            continue;
        }
        for operand in [&filter.value, &filter.value2].into_iter().flatten() {
            if operand.key_type() != key_type {
                return Err(mismatch(&av_id, key_type, operand.key_type()));
            }
        }
    }
    view_for_update(av, view_id)?.table.filters = filters.to_vec();
    Ok(())
}

pub(crate) fn set_sorts(
    av: &mut AttributeView,
    view_id: Option<&str>,
    sorts: &[ViewSort],
) -> TxResult<()> {
    let av_id = av.id.clone();
    for sort in sorts {
        av.key(&sort.column).for_av(&av_id)?;
    }
    view_for_update(av, view_id)?.table.sorts = sorts.to_vec();
    Ok(())
}

pub(crate) fn set_page_size(
    av: &mut AttributeView,
    view_id: Option<&str>,
    page_size: usize,
) -> TxResult<()> {
    if page_size == 0 {
        return Err(TxError::invariant(&av.id, "page size must be greater than zero"));
    }
    view_for_update(av, view_id)?.table.page_size = page_size;
    Ok(())
}

/// Moves a row in a view's custom order, after `previous_id` or to the top.
pub(crate) fn sort_row(
    av: &mut AttributeView,
    view_id: Option<&str>,
    row_id: &str,
    previous_id: Option<&str>,
) -> TxResult<()> {
    let av_id = av.id.clone();
    for id in std::iter::once(row_id).chain(previous_id) {
        if !av.has_row(id) {
            return Err(AvError::RowNotFound(id.to_string())).for_av(&av_id);
        }
    }
    let all_rows = av.row_ids();
    let row_ids = &mut view_for_update(av, view_id)?.table.row_ids;
    for id in all_rows {
        if !row_ids.contains(&id) {
            row_ids.push(id);
        }
    }
    let from = row_ids
        .iter()
        .position(|id| id == row_id)
        .ok_or_else(|| not_found(&av_id, format!("row not found: {row_id}")))?;
    let matcher = |id: &String| Some(id.as_str()) == previous_id;
    let previous = previous_id.map(|_| &matcher as &dyn Fn(&String) -> bool);
    move_after(row_ids, from, previous);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        add_column, add_view, duplicate_view, remove_option, remove_view, retype_column,
        set_filters, sort_column, update_option,
    };
    use crate::model::value::SelectItem;
    use crate::model::{
        AttributeView, FilterOperator, KeyType, SelectOption, Value, ValuePayload, ViewFilter,
    };
    use crate::service::error::TxErrorKind;

    fn av_with_view() -> AttributeView {
        let mut av = AttributeView::new("av1");
        av.ensure_default_view();
        av
    }

    #[test]
    fn add_and_sort_columns() {
        let mut av = av_with_view();
        add_column(&mut av, "a", "A", KeyType::Text, "", None).unwrap();
        add_column(&mut av, "b", "B", KeyType::Number, "", None).unwrap();
        let primary = av.primary_key().unwrap().id.clone();
        add_column(&mut av, "c", "C", KeyType::Date, "", Some(&primary)).unwrap();
        let ids = |av: &AttributeView| -> Vec<String> {
            av.views[0].table.columns.iter().map(|c| c.id.clone()).collect()
        };
        assert_eq!(ids(&av), vec![primary.clone(), "c".into(), "a".into(), "b".into()]);

        sort_column(&mut av, None, "b", Some("c")).unwrap();
        assert_eq!(ids(&av), vec![primary.clone(), "c".into(), "b".into(), "a".into()]);
        sort_column(&mut av, None, "a", None).unwrap();
        assert_eq!(ids(&av)[0], "a");

        let err = add_column(&mut av, "x", "X", KeyType::Block, "", None).unwrap_err();
        assert_eq!(err.kind, TxErrorKind::InvariantViolation);
    }

    #[test]
    fn last_view_cannot_be_removed() {
        let mut av = av_with_view();
        let only = av.views[0].id.clone();
        let before = av.clone();
        let err = remove_view(&mut av, &only).unwrap_err();
        assert_eq!(err.kind, TxErrorKind::InvariantViolation);
        assert_eq!(av, before);
    }

    #[test]
    fn duplicate_then_remove_moves_active_view_back() {
        let mut av = av_with_view();
        let first = av.views[0].id.clone();
        duplicate_view(&mut av, &first, "v2").unwrap();
        assert_eq!(av.views[1].name, "Table (1)");
        assert_eq!(av.active_view_id, "v2");
        add_view(&mut av, "v3", "").unwrap();
        assert_eq!(av.views[2].table.columns.len(), av.views[0].table.columns.len());
        remove_view(&mut av, "v3").unwrap();
        assert_eq!(av.active_view_id, "v2");
    }

    #[test]
    fn option_edits_update_values() {
        let mut av = av_with_view();
        add_column(&mut av, "tags", "Tags", KeyType::MSelect, "", None).unwrap();
        av.key_mut("tags").unwrap().options_mut().unwrap().extend([
            SelectOption { name: "a".into(), color: "1".into() },
            SelectOption { name: "b".into(), color: "2".into() },
        ]);
        av.key_values_mut("tags").unwrap().values.push(Value::new(
            "tags",
            "r1",
            ValuePayload::MSelect {
                items: vec![
                    SelectItem { content: "a".into(), color: "1".into() },
                    SelectItem { content: "b".into(), color: "2".into() },
                ],
            },
        ));
        update_option(&mut av, "tags", "a", "alpha", "5").unwrap();
        remove_option(&mut av, "tags", "b").unwrap();
        let value = av.value("tags", "r1").unwrap();
        assert_eq!(value.to_text(), "alpha");
        assert_eq!(av.key("tags").unwrap().options().len(), 1);
    }

    #[test]
    fn retype_converts_text_to_number() {
        let mut av = av_with_view();
        add_column(&mut av, "n", "N", KeyType::Text, "", None).unwrap();
        let values = &mut av.key_values_mut("n").unwrap().values;
        values.push(Value::new("n", "r1", ValuePayload::text("42")));
        values.push(Value::new("n", "r2", ValuePayload::text("not a number")));
        retype_column(&mut av, "n", KeyType::Number).unwrap();
        let kv = av.key_values("n").unwrap();
        assert_eq!(kv.values.len(), 1);
        assert_eq!(kv.values[0].payload.as_number(), Some(42.0));

        let primary = av.primary_key().unwrap().id.clone();
        let err = retype_column(&mut av, &primary, KeyType::Text).unwrap_err();
        assert_eq!(err.kind, TxErrorKind::InvariantViolation);
    }

    #[test]
    fn filters_must_match_column_type() {
        let mut av = av_with_view();
        add_column(&mut av, "n", "N", KeyType::Number, "", None).unwrap();
        let filter = ViewFilter {
            column: "n".into(),
            operator: FilterOperator::Eq,
            value: Some(ValuePayload::text("1")),
            value2: None,
        };
        let err = set_filters(&mut av, None, &[filter]).unwrap_err();
        assert_eq!(err.kind, TxErrorKind::TypeMismatch);
    }
}
