//! Testing utilities for transport implementations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{EventHandler, Transport, DISCONNECT_EVENT};
use crate::value::{Ack, Value};

type Handlers = Arc<Mutex<HashMap<String, Vec<EventHandler>>>>;

fn handlers_for(handlers: &Handlers, event: &str) -> Vec<EventHandler> {
    handlers.lock().get(event).cloned().unwrap_or_default()
}

/// An event emitted through a [`MockTransport`].
#[derive(Clone, Debug)]
pub struct RecordedEvent {
    pub event: String,
    pub args: Vec<Value>,
}

/// Mock transport for testing
///
/// Records emitted events; inbound events are injected by the test and
/// delivered synchronously.
pub struct MockTransport {
    sent: Mutex<Vec<RecordedEvent>>,
    handlers: Handlers,
    connected: AtomicBool,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            handlers: Arc::new(Mutex::new(HashMap::new())),
            connected: AtomicBool::new(true),
        }
    }

    /// Deliver an inbound event to the subscribed handlers
    pub fn inject(&self, event: &str, args: Vec<Value>) {
        for handler in handlers_for(&self.handlers, event) {
            handler(args.clone());
        }
    }

    /// Get sent events
    pub fn get_sent(&self) -> Vec<RecordedEvent> {
        self.sent.lock().clone()
    }

    /// Clear sent events
    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// Simulate disconnect
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.inject(DISCONNECT_EVENT, Vec::new());
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockTransport {
    fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.sent.lock().push(RecordedEvent {
            event: event.to_string(),
            args,
        });
        Ok(())
    }

    fn on(&self, event: &str, handler: EventHandler) {
        self.handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }
}

enum Delivery {
    Event(String, Vec<Value>),
    Reply(Ack, Vec<Value>),
}

/// Loopback transport for local testing
///
/// Each end delivers its inbound events one at a time on its own task, so
/// handlers never run concurrently for one end. Acks are proxied so that the
/// reply runs on the end that asked for it.
pub struct LoopbackTransport {
    handlers: Handlers,
    inbox: mpsc::UnboundedSender<Delivery>,
    peer: mpsc::UnboundedSender<Delivery>,
    connected: Arc<AtomicBool>,
}

impl LoopbackTransport {
    /// Create connected pair. Must be called within a tokio runtime.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let connected = Arc::new(AtomicBool::new(true));
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();

        let transport1 = Arc::new(Self {
            handlers: Arc::new(Mutex::new(HashMap::new())),
            inbox: tx1.clone(),
            peer: tx2.clone(),
            connected: connected.clone(),
        });
        let transport2 = Arc::new(Self {
            handlers: Arc::new(Mutex::new(HashMap::new())),
            inbox: tx2,
            peer: tx1,
            connected,
        });

        Self::spawn_pump(transport1.handlers.clone(), rx1);
        Self::spawn_pump(transport2.handlers.clone(), rx2);
        (transport1, transport2)
    }

    fn spawn_pump(handlers: Handlers, mut rx: mpsc::UnboundedReceiver<Delivery>) {
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match delivery {
                    Delivery::Event(event, args) => {
                        for handler in handlers_for(&handlers, &event) {
                            handler(args.clone());
                        }
                    }
                    Delivery::Reply(ack, args) => ack.call(args),
                }
            }
        });
    }

    /// Simulate the connection dropping: both ends see `disconnect`.
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self
                .inbox
                .send(Delivery::Event(DISCONNECT_EVENT.to_string(), Vec::new()));
            let _ = self
                .peer
                .send(Delivery::Event(DISCONNECT_EVENT.to_string(), Vec::new()));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Transport for LoopbackTransport {
    fn emit(&self, event: &str, args: Vec<Value>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }

        let args = args
            .into_iter()
            .map(|arg| match arg {
                Value::Ack(ack) => {
                    let back = self.inbox.clone();
                    Value::Ack(Ack::new(move |reply| {
                        let _ = back.send(Delivery::Reply(ack.clone(), reply));
                    }))
                }
                other => other,
            })
            .collect();

        self.peer
            .send(Delivery::Event(event.to_string(), args))
            .map_err(|_| TransportError::Disconnected)
    }

    fn on(&self, event: &str, handler: EventHandler) {
        self.handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_transport() {
        let transport = MockTransport::new();
        transport.emit("hello", vec![Value::from("world")]).unwrap();

        let sent = transport.get_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].event, "hello");
        assert_eq!(sent[0].args, vec![Value::from("world")]);

        transport.clear_sent();
        transport.disconnect();
        assert!(transport.emit("hello", Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_loopback_transport() {
        let (transport1, transport2) = LoopbackTransport::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport2.on(
            "ping",
            Arc::new(move |args| {
                let _ = tx.send(args);
            }),
        );

        transport1.emit("ping", vec![Value::from(1u64)]).unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![Value::from(1u64)]);
    }

    #[tokio::test]
    async fn test_loopback_ack_runs_on_sender() {
        let (transport1, transport2) = LoopbackTransport::pair();
        transport2.on(
            "ask",
            Arc::new(|args| {
                if let Some(ack) = args.last().and_then(Value::as_ack) {
                    ack.call(vec![Value::from("answer")]);
                }
            }),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ack = Ack::new(move |args| {
            let _ = tx.send(args);
        });
        transport1.emit("ask", vec![Value::Ack(ack)]).unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![Value::from("answer")]);
    }

    #[tokio::test]
    async fn test_loopback_disconnect() {
        let (transport1, transport2) = LoopbackTransport::pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tx2 = tx.clone();
        transport1.on(DISCONNECT_EVENT, Arc::new(move |_| {
            let _ = tx.send(1);
        }));
        transport2.on(DISCONNECT_EVENT, Arc::new(move |_| {
            let _ = tx2.send(2);
        }));

        transport1.disconnect();
        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort();
        assert_eq!(seen, vec![1, 2]);
        assert!(transport2.emit("late", Vec::new()).is_err());
    }
}
