//! Attribute-view search entry points.
//!
//! # Responsibility
//! - Find attribute views through the FTS5 index of their embedding blocks.
//! - Keep search result shaping inside core.

pub mod fts;
