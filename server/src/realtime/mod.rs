//! The realtime delivery engine: per-connection I/O loops, the connection
//! registry with lifecycle callbacks, and the single-consumer event router.
//!
//! Dataflow: a connection decodes an inbound frame into an [`Event`] stamped
//! with its username and pushes it into the manager's inbound channel; the
//! router consumes that channel, dispatches to the registered handler, and
//! handlers re-emit through the [`Emitter`], which fans out to the named
//! users' connections.

pub mod connection;
pub mod manager;
pub mod router;

use serde::{Deserialize, Serialize};

pub use manager::ConnManager;
pub use router::{Emitter, EventRouter};

/// A routable event. On the wire this is exactly `{"type": ..., "payload":
/// ...}`; the dispatcher is stamped server-side from the authenticated
/// connection and never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip)]
    pub dispatcher: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            dispatcher: None,
            payload,
        }
    }
}
