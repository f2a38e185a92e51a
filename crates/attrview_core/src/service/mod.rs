//! Attribute-view use-case services.
//!
//! # Responsibility
//! - Turn `Operation`s into load, mutate and persist cycles.
//! - Keep hosts decoupled from storage and document details.

pub mod av_service;
pub mod error;
pub mod operation;
mod row_ops;
mod schema_ops;

pub use av_service::{
    ApplyReport, AttributeViewService, BlockAttributeView, BlockKeyValue, FiltersAndSorts,
};
pub use error::{TxError, TxErrorKind, TxResult};
pub use operation::{Action, Operation, RowSource};
