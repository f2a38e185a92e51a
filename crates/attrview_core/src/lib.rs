//! Attribute-view engine: typed table schema, rendering, relations and
//! transactional mutations over JSON-persisted attribute views.
//! This crate is the single source of truth for attribute-view invariants.

pub mod config;
pub mod db;
pub mod event;
pub mod logging;
pub mod model;
pub mod relation;
pub mod render;
pub mod repo;
pub mod search;
pub mod service;
pub mod sync;
pub mod template;

pub use config::{ConfigError, EngineConfig};
pub use event::{
    ChannelEventSink, EventSink, InvalidationEvent, InvalidationReason, NoopEventSink,
    RecordingEventSink,
};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::{AttributeView, AvError, AvResult, Key, KeyType, Value, ValuePayload, View};
pub use relation::RelationIndex;
pub use render::table::Table;
pub use render::{render_view, RenderContext, RenderError, RenderRequest};
pub use repo::{
    AvStore, BlockKind, BlockNode, DocumentTree, JsonFileAvStore, SqliteAvStore,
    SqliteDocumentTree, StoreError, StoreResult,
};
pub use search::fts::{search_attribute_views, AvSearchHit, SearchError, SearchResult};
pub use service::{
    Action, ApplyReport, AttributeViewService, Operation, RowSource, TxError, TxErrorKind,
    TxResult,
};
pub use sync::SyncBarrier;

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
