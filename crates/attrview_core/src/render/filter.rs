//! Filter predicates over rendered cells.
//!
//! # Invariants
//! - A filter without a required operand matches every row.
//! - Comparisons fall back to display text when the operand type differs from
//!   the cell type.

use crate::model::id::millis_to_local;
use crate::model::value::{DatePayload, NumberPayload, ValuePayload};
use crate::model::{FilterOperator, ViewFilter};
use chrono::NaiveDate;
use std::cmp::Ordering;

const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// Whether `cell` satisfies `filter`.
pub fn matches(filter: &ViewFilter, cell: &ValuePayload) -> bool {
    match filter.operator {
        FilterOperator::IsEmpty => return cell.is_empty(),
        FilterOperator::IsNotEmpty => return !cell.is_empty(),
        FilterOperator::IsTrue => return is_checked(cell),
        FilterOperator::IsFalse => return !is_checked(cell),
        _ => {}
    }
    let Some(operand) = filter.value.as_ref() else {
        return true;
    };

    match cell {
        ValuePayload::Rollup { rollup } => {
            let mut results = rollup
                .contents
                .iter()
                .map(|value| matches_single(filter, operand, &value.payload));
            if is_negation(filter.operator) {
                results.all(|matched| matched)
            } else {
                results.any(|matched| matched)
            }
        }
        _ => matches_single(filter, operand, cell),
    }
}

fn is_negation(operator: FilterOperator) -> bool {
    matches!(operator, FilterOperator::Ne | FilterOperator::DoesNotContain)
}

fn is_checked(cell: &ValuePayload) -> bool {
    matches!(cell, ValuePayload::Checkbox { checkbox } if checkbox.checked)
}

fn matches_single(filter: &ViewFilter, operand: &ValuePayload, cell: &ValuePayload) -> bool {
    if let (Some(left), Some(right)) = (cell.as_number(), operand.as_number()) {
        let upper = filter.value2.as_ref().and_then(ValuePayload::as_number);
        return compare_ordered(filter.operator, left.total_cmp(&right), || {
            upper.map(|upper| left >= right && left <= upper)
        });
    }
    if let (Some(left), ValuePayload::Date { date }) = (cell.as_millis(), operand) {
        return matches_date(filter.operator, left, date);
    }
    match (cell, operand) {
        (ValuePayload::Select { items } | ValuePayload::MSelect { items }, _)
            if operand.select_items().is_some() =>
        {
            let cell_names: Vec<&str> = items.iter().map(|item| item.content.as_str()).collect();
            let wanted: Vec<&str> = operand
                .select_items()
                .unwrap_or_default()
                .iter()
                .map(|item| item.content.as_str())
                .collect();
            matches_select(filter.operator, &cell_names, &wanted)
        }
        (ValuePayload::Number { .. }, _) if !cell_number_present(cell) => {
            filter.operator == FilterOperator::Ne
        }
        _ => matches_text(filter.operator, &cell.to_text(), &operand.to_text()),
    }
}

fn cell_number_present(cell: &ValuePayload) -> bool {
    cell.as_number().is_some()
}

fn compare_ordered(
    operator: FilterOperator,
    ordering: Ordering,
    between: impl FnOnce() -> Option<bool>,
) -> bool {
    match operator {
        FilterOperator::Eq => ordering == Ordering::Equal,
        FilterOperator::Ne => ordering != Ordering::Equal,
        FilterOperator::Gt => ordering == Ordering::Greater,
        FilterOperator::Ge => ordering != Ordering::Less,
        FilterOperator::Lt => ordering == Ordering::Less,
        FilterOperator::Le => ordering != Ordering::Greater,
        FilterOperator::IsBetween => between().unwrap_or(ordering != Ordering::Less),
        _ => true,
    }
}

fn local_day(millis: i64) -> NaiveDate {
    millis_to_local(millis).date_naive()
}

fn matches_date(operator: FilterOperator, cell_millis: i64, operand: &DatePayload) -> bool {
    if !operand.is_not_empty {
        return true;
    }
    let day = local_day(cell_millis);
    let start = local_day(operand.content);
    compare_ordered(operator, day.cmp(&start), || {
        (operand.has_end_date && operand.is_not_empty2)
            .then(|| day >= start && day <= local_day(operand.content2))
    })
}

fn matches_select(operator: FilterOperator, cell: &[&str], wanted: &[&str]) -> bool {
    match operator {
        FilterOperator::Eq => cell == wanted,
        FilterOperator::Ne => cell != wanted,
        FilterOperator::Contains => wanted.iter().all(|name| cell.contains(name)),
        FilterOperator::DoesNotContain => !wanted.iter().any(|name| cell.contains(name)),
        _ => matches_text(operator, &cell.join(", "), &wanted.join(", ")),
    }
}

fn matches_text(operator: FilterOperator, cell: &str, operand: &str) -> bool {
    match operator {
        FilterOperator::Eq => cell == operand,
        FilterOperator::Ne => cell != operand,
        FilterOperator::Gt => cell > operand,
        FilterOperator::Ge => cell >= operand,
        FilterOperator::Lt => cell < operand,
        FilterOperator::Le => cell <= operand,
        FilterOperator::Contains => cell.contains(operand),
        FilterOperator::DoesNotContain => !cell.contains(operand),
        FilterOperator::StartsWith => cell.starts_with(operand),
        FilterOperator::EndsWith => cell.ends_with(operand),
        _ => true,
    }
}

/// Value a newly inserted row should take so that it satisfies `filter`, or
/// `None` when no single value is implied.
pub fn affect_value(filter: &ViewFilter) -> Option<ValuePayload> {
    match filter.operator {
        FilterOperator::IsTrue => return Some(ValuePayload::checkbox(true)),
        FilterOperator::IsFalse => return Some(ValuePayload::checkbox(false)),
        FilterOperator::IsEmpty
        | FilterOperator::IsNotEmpty
        | FilterOperator::Ne
        | FilterOperator::DoesNotContain => return None,
        _ => {}
    }
    let operand = filter.value.as_ref()?;
    let shift = match filter.operator {
        FilterOperator::Gt => 1,
        FilterOperator::Lt => -1,
        _ => 0,
    };
    let value = match operand {
        ValuePayload::Number { number } if shift != 0 => {
            let mut shifted = NumberPayload::new(number.content + shift as f64);
            shifted.apply_format(number.format);
            ValuePayload::Number { number: shifted }
        }
        ValuePayload::Date { date } if shift != 0 => {
            let mut shifted = date.clone();
            shifted.content += shift * DAY_MILLIS;
            ValuePayload::Date { date: shifted }
        }
        other => other.clone(),
    };
    Some(value)
}
