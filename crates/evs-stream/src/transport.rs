//! The event-messaging transport that streams are multiplexed over.

use std::sync::Arc;

use crate::error::TransportError;
use crate::value::Value;

/// Default name of the application multiplex event.
pub const DEFAULT_EVENT: &str = "$stream";

/// Raised by the transport when the connection is gone.
pub const DISCONNECT_EVENT: &str = "disconnect";

/// Raised by the transport on connection-level failures.
pub const ERROR_EVENT: &str = "error";

pub const NEW_LISTENER_EVENT: &str = "newListener";
pub const REMOVE_LISTENER_EVENT: &str = "removeListener";

/// Handler invoked with the arguments of an inbound event.
pub type EventHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// A bidirectional, reliable and ordered named-event channel.
///
/// A trailing `Value::Ack` argument asks the receiving side for a reply.
pub trait Transport: Send + Sync {
    /// Send an event to the peer.
    fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), TransportError>;

    /// Subscribe to inbound events with the given name.
    fn on(&self, event: &str, handler: EventHandler);
}

/// How an event name is routed at the dispatch boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// Dispatched to local listeners only, never sent.
    Local,
    /// Encoded and carried over the multiplex event.
    Multiplexed,
}

impl EventKind {
    pub fn classify(event: &str) -> Self {
        match event {
            ERROR_EVENT | NEW_LISTENER_EVENT | REMOVE_LISTENER_EVENT => EventKind::Local,
            _ => EventKind::Multiplexed,
        }
    }
}

/// Wire event names derived from the multiplex event name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireNames {
    pub event: String,
    pub read: String,
    pub write: String,
    pub end: String,
    pub error: String,
}

impl WireNames {
    pub fn new(base: &str) -> Self {
        Self {
            event: base.to_string(),
            read: format!("{base}-read"),
            write: format!("{base}-write"),
            end: format!("{base}-end"),
            error: format!("{base}-error"),
        }
    }
}

impl Default for WireNames {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT)
    }
}
