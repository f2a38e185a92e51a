//! Row ordering: column sorts, custom row order, row-ID tie-break.
//!
//! # Invariants
//! - Empty cells sort last in both directions.
//! - The final tie-break is the row ID string, so ordering is total.

use crate::model::value::ValuePayload;
use crate::model::{SortOrder, ViewSort};
use crate::render::table::TableRow;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Compares two non-empty cells of the same column.
pub fn compare_values(a: &ValuePayload, b: &ValuePayload) -> Ordering {
    if let (Some(left), Some(right)) = (a.as_number(), b.as_number()) {
        return left.total_cmp(&right);
    }
    if let (Some(left), Some(right)) = (a.as_millis(), b.as_millis()) {
        return left.cmp(&right);
    }
    match (a, b) {
        (ValuePayload::Checkbox { checkbox: left }, ValuePayload::Checkbox { checkbox: right }) => {
            left.checked.cmp(&right.checked)
        }
        _ => a.to_text().cmp(&b.to_text()),
    }
}

fn compare_for_sort(
    a: Option<&ValuePayload>,
    b: Option<&ValuePayload>,
    order: SortOrder,
) -> Ordering {
    let a = a.filter(|value| !value.is_empty());
    let b = b.filter(|value| !value.is_empty());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let ordering = compare_values(a, b);
            match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        }
    }
}

/// Sorts by `sorts` in order, then by position in `custom_order` (unlisted
/// rows last), then by row ID.
pub fn sort_rows(rows: &mut [TableRow], sorts: &[ViewSort], custom_order: &[String]) {
    let position: HashMap<&str, usize> = custom_order
        .iter()
        .enumerate()
        .map(|(index, id)| (id.as_str(), index))
        .collect();
    let rank = |row: &TableRow| position.get(row.id.as_str()).copied().unwrap_or(usize::MAX);

    rows.sort_by(|a, b| {
        sorts
            .iter()
            .map(|sort| {
                compare_for_sort(
                    a.payload(&sort.column),
                    b.payload(&sort.column),
                    sort.order,
                )
            })
            .find(|ordering| *ordering != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
            .then_with(|| rank(a).cmp(&rank(b)))
            .then_with(|| a.id.cmp(&b.id))
    });
}
