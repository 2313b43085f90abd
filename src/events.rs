//! Structured observability events and the emitter contract.
//!
//! Grounded on `weavegraph::event_bus::{event, emitter, hub}`: a broadcast
//! hub backing an `EventEmitter` trait, with dropped-event accounting and
//! ordering guarantees for a single node's events (spec.md §5, §6).

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::envelope::Value;
use crate::node::NodeKind;

/// The four event kinds named in spec.md §6.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NodeOutputDelta,
    NodeOutputFinal,
    ToolCall,
    ToolResult,
}

/// A single structured event (spec.md §6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub run_id: String,
    pub node_id: String,
    pub node_behavior: String,
    pub payload: FxHashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, run_id: impl Into<String>, node: &NodeKind, behavior: impl Into<String>) -> Self {
        Self {
            kind,
            run_id: run_id.into(),
            node_id: node.as_str().to_string(),
            node_behavior: behavior.into(),
            payload: FxHashMap::default(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

/// Errors returned when an event cannot be delivered.
#[derive(Debug, Error)]
pub enum EmitterError {
    #[error("event hub is closed")]
    Closed,
}

/// Trait implemented by anything nodes can emit events through.
pub trait EventEmitter: Send + Sync + std::fmt::Debug {
    fn emit(&self, event: Event) -> Result<(), EmitterError>;
}

/// Snapshot of hub health: buffered capacity and events dropped because a
/// subscriber fell behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHubMetrics {
    pub capacity: usize,
    pub dropped: usize,
}

/// Broadcast-backed event hub. Cheap to clone (wraps an `Arc`); every
/// `NodeContext` holds one via the `EventEmitter` trait object.
#[derive(Debug)]
pub struct EventHub {
    sender: broadcast::Sender<Event>,
    dropped: AtomicUsize,
    capacity: usize,
}

impl EventHub {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Arc::new(Self {
            sender,
            dropped: AtomicUsize::new(0),
            capacity,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn metrics(&self) -> EventHubMetrics {
        EventHubMetrics {
            capacity: self.capacity,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl EventEmitter for EventHub {
    fn emit(&self, event: Event) -> Result<(), EmitterError> {
        match self.sender.send(event) {
            Ok(_) => Ok(()),
            Err(_no_subscribers) => {
                // No active subscriber is not an error condition for a
                // fire-and-forget observability bus.
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }
}

/// Emitter that records every event in-memory; used by tests that need to
/// assert on event ordering (spec.md §8 scenario 2, 4).
#[derive(Debug, Default)]
pub struct MemoryEmitter {
    events: parking_lot::Mutex<Vec<Event>>,
}

impl MemoryEmitter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind.clone()).collect()
    }
}

impl EventEmitter for MemoryEmitter {
    fn emit(&self, event: Event) -> Result<(), EmitterError> {
        self.events.lock().push(event);
        Ok(())
    }
}
