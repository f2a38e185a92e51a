//! Attribute-view schema and value model.
//!
//! # Responsibility
//! - Define keys (typed columns), values (typed cells), views and the
//!   attribute view aggregate.
//! - Keep per-type payloads as tagged variants so a cell can only carry the
//!   payload of its own type.
//!
//! # Invariants
//! - Persisted JSON shape: type-tagged keys and values, nested relation and
//!   rollup configuration.

pub mod attribute_view;
pub mod id;
pub mod key;
pub mod value;
pub mod view;

pub use attribute_view::{AttributeView, AvError, AvResult, KeyValues};
pub use key::{Key, KeyConfig, KeyType, NumberFormat, RelationConfig, RollupConfig, SelectOption};
pub use value::{Value, ValuePayload};
pub use view::{
    CalcOperator, ColumnCalc, FilterOperator, LayoutType, SortOrder, View, ViewColumn,
    ViewFilter, ViewSort,
};
