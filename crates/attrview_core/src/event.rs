//! Typed invalidation events for attribute views.
//!
//! # Responsibility
//! - Describe which attribute view must be re-rendered and why.
//! - Deliver events to a host-provided sink.
//!
//! # Invariants
//! - Delivery is fire-and-forget: sinks never fail the emitting operation.

use log::debug;
use serde::Serialize;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InvalidationReason {
    /// A relation column pointing at this view was added or re-pointed.
    RelationChanged,
    /// A back-relation cell or column of this view changed.
    BackRelationChanged,
    /// A cell this view depends on changed.
    CellChanged,
    /// A column this view depends on was removed.
    ColumnRemoved,
}

impl InvalidationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RelationChanged => "relation_changed",
            Self::BackRelationChanged => "back_relation_changed",
            Self::CellChanged => "cell_changed",
            Self::ColumnRemoved => "column_removed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationEvent {
    #[serde(rename = "avID")]
    pub av_id: String,
    pub reason: InvalidationReason,
}

impl InvalidationEvent {
    pub fn new(av_id: impl Into<String>, reason: InvalidationReason) -> Self {
        Self {
            av_id: av_id.into(),
            reason,
        }
    }
}

/// Receiver of invalidation events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: InvalidationEvent);
}

/// Drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: InvalidationEvent) {}
}

/// Forwards events over an `mpsc` channel; a closed receiver is ignored.
#[derive(Debug)]
pub struct ChannelEventSink {
    sender: Mutex<Sender<InvalidationEvent>>,
}

impl ChannelEventSink {
    pub fn new(sender: Sender<InvalidationEvent>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: InvalidationEvent) {
        let av_id = event.av_id.clone();
        let delivered = match self.sender.lock() {
            Ok(sender) => sender.send(event).is_ok(),
            Err(_) => false,
        };
        if !delivered {
            debug!("event=av_invalidate module=event status=dropped av_id={av_id}");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<InvalidationEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns and clears the recorded events.
    pub fn take(&self) -> Vec<InvalidationEvent> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: InvalidationEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    fn emit(&self, event: InvalidationEvent) {
        (**self).emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ChannelEventSink, EventSink, InvalidationEvent, InvalidationReason, RecordingEventSink,
    };
    use std::sync::mpsc;

    #[test]
    fn channel_sink_delivers_and_survives_closed_receiver() {
        let (tx, rx) = mpsc::channel();
        let sink = ChannelEventSink::new(tx);
        sink.emit(InvalidationEvent::new("av1", InvalidationReason::CellChanged));
        assert_eq!(
            rx.recv().unwrap(),
            InvalidationEvent::new("av1", InvalidationReason::CellChanged)
        );
        drop(rx);
        sink.emit(InvalidationEvent::new("av2", InvalidationReason::ColumnRemoved));
    }

    #[test]
    fn recording_sink_take_drains() {
        let sink = RecordingEventSink::new();
        sink.emit(InvalidationEvent::new("av1", InvalidationReason::RelationChanged));
        assert_eq!(sink.take().len(), 1);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn event_serializes_with_typed_reason() {
        let json = serde_json::to_value(InvalidationEvent::new(
            "av1",
            InvalidationReason::BackRelationChanged,
        ))
        .unwrap();
        assert_eq!(json["avID"], "av1");
        assert_eq!(json["reason"], "backRelationChanged");
    }
}
