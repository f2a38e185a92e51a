//! Typed transaction failure returned by mutation entry points.

use crate::model::AvError;
use crate::relation::RelationError;
use crate::render::RenderError;
use crate::repo::av_store::StoreError;
use crate::repo::document::DocError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type TxResult<T> = Result<T, TxError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxErrorKind {
    NotFound,
    TypeMismatch,
    MalformedPayload,
    Io,
    InvariantViolation,
}

impl TxErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::TypeMismatch => "type_mismatch",
            Self::MalformedPayload => "malformed_payload",
            Self::Io => "io",
            Self::InvariantViolation => "invariant_violation",
        }
    }
}

/// Failure of one operation, tagged with the attribute view it concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxError {
    pub kind: TxErrorKind,
    pub av_id: String,
    pub message: String,
}

impl TxError {
    pub fn new(kind: TxErrorKind, av_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            av_id: av_id.into(),
            message: message.into(),
        }
    }

    pub fn invariant(av_id: &str, message: impl Into<String>) -> Self {
        Self::new(TxErrorKind::InvariantViolation, av_id, message)
    }
}

impl Display for TxError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "transaction failed ({}) on attribute view {}: {}",
            self.kind.as_str(),
            self.av_id,
            self.message
        )
    }
}

impl Error for TxError {}

fn av_kind(err: &AvError) -> TxErrorKind {
    match err {
        AvError::KeyNotFound(_) | AvError::ViewNotFound(_) | AvError::RowNotFound(_) => {
            TxErrorKind::NotFound
        }
        AvError::TypeMismatch { .. } => TxErrorKind::TypeMismatch,
        AvError::InvariantViolation(_) => TxErrorKind::InvariantViolation,
    }
}

fn store_kind(err: &StoreError) -> TxErrorKind {
    match err {
        StoreError::NotFound(_) => TxErrorKind::NotFound,
        StoreError::InvalidId(_) | StoreError::Malformed { .. } => TxErrorKind::MalformedPayload,
        StoreError::Io { .. } | StoreError::Db(_) => TxErrorKind::Io,
    }
}

/// Converts a layer error into a `TxError` for `av_id`.
pub trait TxContext<T> {
    fn for_av(self, av_id: &str) -> TxResult<T>;
}

impl<T> TxContext<T> for Result<T, AvError> {
    fn for_av(self, av_id: &str) -> TxResult<T> {
        self.map_err(|err| TxError::new(av_kind(&err), av_id, err.to_string()))
    }
}

impl<T> TxContext<T> for Result<T, StoreError> {
    fn for_av(self, av_id: &str) -> TxResult<T> {
        self.map_err(|err| TxError::new(store_kind(&err), av_id, err.to_string()))
    }
}

impl<T> TxContext<T> for Result<T, DocError> {
    fn for_av(self, av_id: &str) -> TxResult<T> {
        self.map_err(|err| TxError::new(TxErrorKind::Io, av_id, err.to_string()))
    }
}

impl<T> TxContext<T> for Result<T, RelationError> {
    fn for_av(self, av_id: &str) -> TxResult<T> {
        self.map_err(|err| match &err {
            RelationError::Av(inner) => TxError::new(av_kind(inner), av_id, err.to_string()),
            RelationError::Store(inner) => TxError::new(store_kind(inner), av_id, err.to_string()),
        })
    }
}

impl<T> TxContext<T> for Result<T, RenderError> {
    fn for_av(self, av_id: &str) -> TxResult<T> {
        self.map_err(|err| match &err {
            RenderError::Av(inner) => TxError::new(av_kind(inner), av_id, err.to_string()),
            RenderError::Store(inner) => TxError::new(store_kind(inner), av_id, err.to_string()),
        })
    }
}
