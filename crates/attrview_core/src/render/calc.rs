//! Aggregations shared by column calculations and rollups.

use crate::model::key::NumberFormat;
use crate::model::value::{DatePayload, NumberPayload, ValuePayload};
use crate::model::CalcOperator;
use std::collections::BTreeSet;

/// Numeric reading of a cell; single-valued rollups count as their content.
fn numeric(payload: &ValuePayload) -> Option<f64> {
    match payload {
        ValuePayload::Rollup { rollup } if rollup.contents.len() == 1 => {
            numeric(&rollup.contents[0].payload)
        }
        other => other.as_number(),
    }
}

fn millis(payload: &ValuePayload) -> Option<i64> {
    match payload {
        ValuePayload::Rollup { rollup } if rollup.contents.len() == 1 => {
            millis(&rollup.contents[0].payload)
        }
        other => other.as_millis(),
    }
}

fn checked(payload: &ValuePayload) -> Option<bool> {
    match payload {
        ValuePayload::Checkbox { checkbox } => Some(checkbox.checked),
        _ => None,
    }
}

fn count(n: usize) -> ValuePayload {
    ValuePayload::number(n as f64)
}

fn percent(part: usize, total: usize) -> ValuePayload {
    let ratio = if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    };
    formatted(ratio, NumberFormat::Percent)
}

fn formatted(value: f64, format: NumberFormat) -> ValuePayload {
    let mut number = NumberPayload::new(value);
    number.apply_format(format);
    ValuePayload::Number { number }
}

fn empty_number() -> ValuePayload {
    ValuePayload::Number {
        number: NumberPayload::default(),
    }
}

fn median(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Applies `operator` over `values`.
///
/// Returns `None` for `CalcOperator::None`. Numeric results carry
/// `number_format`; counts are unformatted; percentages use the percent
/// format.
pub fn aggregate(
    operator: CalcOperator,
    values: &[&ValuePayload],
    number_format: NumberFormat,
) -> Option<ValuePayload> {
    let total = values.len();
    let non_empty = values.iter().filter(|value| !value.is_empty()).count();

    let result = match operator {
        CalcOperator::None => return None,
        CalcOperator::CountAll => count(total),
        CalcOperator::CountValues | CalcOperator::CountNotEmpty => count(non_empty),
        CalcOperator::CountUniqueValues => {
            let unique: BTreeSet<String> = values
                .iter()
                .filter(|value| !value.is_empty())
                .map(|value| value.to_text())
                .collect();
            count(unique.len())
        }
        CalcOperator::CountEmpty => count(total - non_empty),
        CalcOperator::PercentEmpty => percent(total - non_empty, total),
        CalcOperator::PercentNotEmpty => percent(non_empty, total),
        CalcOperator::Sum
        | CalcOperator::Average
        | CalcOperator::Median
        | CalcOperator::Min
        | CalcOperator::Max
        | CalcOperator::Range => {
            let mut numbers: Vec<f64> = values.iter().filter_map(|value| numeric(value)).collect();
            if numbers.is_empty() {
                return Some(if operator == CalcOperator::Sum {
                    formatted(0.0, number_format)
                } else {
                    empty_number()
                });
            }
            numbers.sort_by(f64::total_cmp);
            let first = numbers[0];
            let last = numbers[numbers.len() - 1];
            let sum: f64 = numbers.iter().sum();
            let value = match operator {
                CalcOperator::Sum => sum,
                CalcOperator::Average => sum / numbers.len() as f64,
                CalcOperator::Median => median(&numbers),
                CalcOperator::Min => first,
                CalcOperator::Max => last,
                _ => last - first,
            };
            formatted(value, number_format)
        }
        CalcOperator::Earliest | CalcOperator::Latest => {
            let stamps = values.iter().filter_map(|value| millis(value));
            let picked = if operator == CalcOperator::Earliest {
                stamps.min()
            } else {
                stamps.max()
            };
            ValuePayload::Date {
                date: picked.map(DatePayload::new).unwrap_or_default(),
            }
        }
        CalcOperator::Checked | CalcOperator::Unchecked => {
            let want = operator == CalcOperator::Checked;
            count(
                values
                    .iter()
                    .filter(|value| checked(value) == Some(want))
                    .count(),
            )
        }
        CalcOperator::PercentChecked | CalcOperator::PercentUnchecked => {
            let want = operator == CalcOperator::PercentChecked;
            let hits = values
                .iter()
                .filter(|value| checked(value) == Some(want))
                .count();
            percent(hits, total)
        }
    };
    Some(result)
}
