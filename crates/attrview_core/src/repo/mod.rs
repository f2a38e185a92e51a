//! Persistence boundaries used by the engine.
//!
//! # Responsibility
//! - `av_store`: load/create/save attribute views (JSON files or SQLite).
//! - `document`: the document-tree collaborator and row binding attributes.
//! - `history`: archived and snapshot copies of attribute views.
//!
//! # Invariants
//! - The engine reaches storage only through these traits.

pub mod av_store;
pub mod document;
pub mod history;

pub use av_store::{AvStore, JsonFileAvStore, SqliteAvStore, StoreError, StoreResult};
pub use document::{BlockKind, BlockNode, DocError, DocResult, DocumentTree, SqliteDocumentTree};
pub use history::{HistoryArchive, SnapshotRepository};
