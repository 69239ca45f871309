//! Stream multiplexing over a named-event transport.
//!
//! One [`Multiplexer`] exists per logical connection. It owns the registry of
//! live streams, carries application events through the payload codec and
//! translates the four stream signals to and from transport events.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::codec;
use crate::error::{MuxError, ProtocolError, TransportError};
use crate::stream::{DuplexStream, StreamId, BINARY_ENCODING};
use crate::transport::{
    EventHandler, EventKind, Transport, WireNames, DEFAULT_EVENT, DISCONNECT_EVENT, ERROR_EVENT,
    NEW_LISTENER_EVENT, REMOVE_LISTENER_EVENT,
};
use crate::value::{Ack, Value};

/// Wire encoding label of base64 text chunks.
pub const BASE64_ENCODING: &str = "base64";

/// Multiplexer configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Send binary chunks as base64 text.
    pub force_base64: bool,
    /// Name of the application multiplex event; signal names derive from it.
    pub event: String,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            force_base64: false,
            event: DEFAULT_EVENT.to_string(),
        }
    }
}

type Listener = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

pub(crate) struct MuxShared {
    transport: Arc<dyn Transport>,
    config: MuxConfig,
    names: WireNames,
    registry: DashMap<StreamId, DuplexStream>,
    listeners: RwLock<HashMap<String, Vec<Listener>>>,
    weak_self: Weak<MuxShared>,
}

/// Registry and transport adapter for the streams of one connection.
///
/// Transport handlers only hold a weak reference; keep a handle alive for as
/// long as the connection is in use.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

impl Multiplexer {
    /// Create a multiplexer and subscribe it to the transport's events.
    pub fn new(transport: Arc<dyn Transport>, config: MuxConfig) -> Self {
        let names = WireNames::new(&config.event);
        let shared = Arc::new_cyclic(|weak_self| MuxShared {
            transport,
            config,
            names,
            registry: DashMap::new(),
            listeners: RwLock::new(HashMap::new()),
            weak_self: weak_self.clone(),
        });
        shared.bind();
        Self { shared }
    }

    /// Emit an application event. Streams anywhere in `args` are registered
    /// and travel as references.
    pub fn emit(&self, event: &str, mut args: Vec<Value>) -> Result<(), MuxError> {
        if EventKind::classify(event) == EventKind::Local {
            self.shared.dispatch_local(event, args);
            return Ok(());
        }

        debug!(event, "sending event");

        if let Some(Value::Ack(ack)) = args.last().cloned() {
            let weak = self.shared.weak_self.clone();
            if let Some(last) = args.last_mut() {
                *last = Value::Ack(Ack::new(move |reply| match weak.upgrade() {
                    Some(mux) => ack.call(mux.decode_args(reply)),
                    None => debug!("multiplexer dropped, reply discarded"),
                }));
            }
        }

        let (encoded, streams) = self.shared.encode_args(args)?;
        let mut wire = Vec::with_capacity(encoded.len() + 1);
        wire.push(Value::from(event));
        wire.extend(encoded);
        if let Err(e) = self.shared.transport.emit(&self.shared.names.event, wire) {
            self.shared.rollback(&streams);
            return Err(e.into());
        }
        self.shared.activate(&streams);
        Ok(())
    }

    /// Listen for an event. Listeners of multiplexed events receive decoded
    /// arguments; a trailing ack encodes its reply arguments.
    pub fn on<F>(&self, event: &str, listener: F)
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.shared
            .dispatch_local(NEW_LISTENER_EVENT, vec![Value::from(event)]);
        self.shared
            .listeners
            .write()
            .entry(event.to_string())
            .or_default()
            .push(Arc::new(listener));
    }

    /// Remove every listener of an event.
    pub fn off(&self, event: &str) {
        let removed = self.shared.listeners.write().remove(event);
        if removed.is_some() {
            self.shared
                .dispatch_local(REMOVE_LISTENER_EVENT, vec![Value::from(event)]);
        }
    }

    /// Register a stream under its id.
    pub fn register(&self, stream: &DuplexStream) -> Result<(), ProtocolError> {
        self.shared.register(stream)
    }

    /// Forget a stream id. Idempotent.
    pub fn cleanup(&self, id: &StreamId) {
        self.shared.cleanup(id);
    }

    pub fn get(&self, id: &StreamId) -> Option<DuplexStream> {
        self.shared.lookup(id)
    }

    pub fn contains(&self, id: &StreamId) -> bool {
        self.shared.registry.contains_key(id)
    }

    /// Number of live streams.
    pub fn len(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.registry.is_empty()
    }

    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }

    pub fn ptr_eq(&self, other: &Multiplexer) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

static MULTIPLEXERS: OnceLock<DashMap<usize, Weak<MuxShared>>> = OnceLock::new();

/// Return the multiplexer bound to `transport`, creating it on first use.
pub fn lookup<T>(transport: &Arc<T>, config: MuxConfig) -> Multiplexer
where
    T: Transport + 'static,
{
    let key = cache_key(transport);
    let muxes = MULTIPLEXERS.get_or_init(DashMap::new);
    muxes.retain(|_, shared| shared.strong_count() > 0);
    match muxes.entry(key) {
        Entry::Occupied(mut slot) => {
            if let Some(shared) = slot.get().upgrade() {
                return Multiplexer { shared };
            }
            let mux = Multiplexer::new(transport.clone(), config);
            slot.insert(Arc::downgrade(&mux.shared));
            mux
        }
        Entry::Vacant(slot) => {
            let mux = Multiplexer::new(transport.clone(), config);
            slot.insert(Arc::downgrade(&mux.shared));
            mux
        }
    }
}

fn cache_key<T>(transport: &Arc<T>) -> usize {
    Arc::as_ptr(transport) as *const () as usize
}

impl MuxShared {
    fn bind(&self) {
        let names = self.names.clone();
        self.subscribe(&names.event, MuxShared::on_event);
        self.subscribe(&names.read, MuxShared::on_read);
        self.subscribe(&names.write, MuxShared::on_write);
        self.subscribe(&names.end, MuxShared::on_end);
        self.subscribe(&names.error, MuxShared::on_error);
        self.subscribe(ERROR_EVENT, |mux, args| mux.dispatch_local(ERROR_EVENT, args));
        self.subscribe(DISCONNECT_EVENT, |mux, _| mux.on_disconnect());
    }

    fn subscribe(&self, event: &str, handler: fn(&MuxShared, Vec<Value>)) {
        let weak = self.weak_self.clone();
        let handler: EventHandler = Arc::new(move |args| {
            if let Some(mux) = weak.upgrade() {
                handler(&mux, args);
            }
        });
        self.transport.on(event, handler);
    }

    fn dispatch_local(&self, event: &str, args: Vec<Value>) {
        let listeners = match self.listeners.read().get(event) {
            Some(listeners) => listeners.clone(),
            None => return,
        };
        for listener in listeners {
            listener(args.clone());
        }
    }

    fn lookup(&self, id: &StreamId) -> Option<DuplexStream> {
        self.registry.get(id).map(|entry| entry.value().clone())
    }

    pub(crate) fn register(&self, stream: &DuplexStream) -> Result<(), ProtocolError> {
        let id = stream.id().clone();
        let inserted = match self.registry.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                stream.attach(self.weak_self.clone())?;
                slot.insert(stream.clone());
                true
            }
        };

        if !inserted {
            let err = ProtocolError::DuplicateId(id.clone());
            warn!(stream = %id, "rejecting duplicate stream id");
            if let Err(e) = self.send_error(&id, &err.to_string()) {
                debug!(stream = %id, error = %e, "could not report duplicate id");
            }
            return Err(err);
        }

        debug!(stream = %id, "stream registered");
        stream.resume_pull();
        Ok(())
    }

    pub(crate) fn cleanup(&self, id: &StreamId) {
        if self.registry.remove(id).is_some() {
            debug!(stream = %id, "stream cleaned up");
        }
    }

    /// Encode outbound arguments and attach every stream they carry.
    /// Either all streams are attached or none is; a stream may appear only
    /// once per payload.
    fn encode_args(
        &self,
        args: Vec<Value>,
    ) -> Result<(Vec<Value>, Vec<DuplexStream>), ProtocolError> {
        let mut found: Vec<DuplexStream> = Vec::new();
        let mut repeated: Option<StreamId> = None;
        let encoded = codec::encode_args(args, &mut |stream| {
            if found.iter().any(|seen| seen.ptr_eq(stream)) {
                repeated.get_or_insert_with(|| stream.id().clone());
            } else {
                found.push(stream.clone());
            }
        });
        if let Some(id) = repeated {
            warn!(stream = %id, "stream repeated in one payload");
            return Err(ProtocolError::AlreadySent(id));
        }

        let mut attached = Vec::with_capacity(found.len());
        for stream in found {
            if let Err(e) = self.attach_outbound(&stream) {
                warn!(stream = %stream.id(), error = %e, "stream cannot be sent");
                self.rollback(&attached);
                return Err(e);
            }
            attached.push(stream);
        }
        Ok((encoded, attached))
    }

    fn attach_outbound(&self, stream: &DuplexStream) -> Result<(), ProtocolError> {
        match self.registry.entry(stream.id().clone()) {
            Entry::Occupied(slot) if slot.get().ptr_eq(stream) => {
                Err(ProtocolError::AlreadySent(stream.id().clone()))
            }
            Entry::Occupied(_) => Err(ProtocolError::DuplicateId(stream.id().clone())),
            Entry::Vacant(slot) => {
                stream.attach(self.weak_self.clone())?;
                slot.insert(stream.clone());
                Ok(())
            }
        }
    }

    /// Undo `attach_outbound` for streams that were never sent.
    fn rollback(&self, streams: &[DuplexStream]) {
        for stream in streams {
            self.registry.remove(stream.id());
            stream.detach();
        }
    }

    /// Streams went out with their event: send any pull issued before.
    fn activate(&self, streams: &[DuplexStream]) {
        for stream in streams {
            debug!(stream = %stream.id(), "stream registered");
            stream.resume_pull();
        }
    }

    /// Decode inbound arguments, registering every stream stub they carry.
    fn decode_args(&self, args: Vec<Value>) -> Vec<Value> {
        let mut found: Vec<DuplexStream> = Vec::new();
        let decoded = codec::decode_args(args, &mut |stream| found.push(stream.clone()));
        for stream in &found {
            if let Err(e) = self.register(stream) {
                warn!(stream = %stream.id(), error = %e, "decoded stream not registered");
            }
        }
        decoded
    }

    fn on_event(&self, args: Vec<Value>) {
        let mut args = args.into_iter();
        let event = match args.next() {
            Some(Value::String(event)) => event,
            _ => {
                debug!("event: missing event name");
                return;
            }
        };
        if EventKind::classify(&event) == EventKind::Local {
            debug!(event, "event: ignoring reserved name from peer");
            return;
        }

        let listeners = match self.listeners.read().get(&event) {
            Some(listeners) => listeners.clone(),
            None => {
                debug!(event, "event: no listeners");
                return;
            }
        };

        debug!(event, "new streams");
        let mut args: Vec<Value> = args.collect();
        let reply = match args.last() {
            Some(Value::Ack(ack)) => Some(ack.clone()),
            _ => None,
        };
        if reply.is_some() {
            args.pop();
        }

        let mut args = self.decode_args(args);
        if let Some(ack) = reply {
            let weak = self.weak_self.clone();
            args.push(Value::Ack(Ack::new(move |reply| {
                let Some(mux) = weak.upgrade() else {
                    return;
                };
                match mux.encode_args(reply) {
                    Ok((encoded, streams)) => {
                        ack.call(encoded);
                        mux.activate(&streams);
                    }
                    Err(e) => warn!(error = %e, "reply not sent"),
                }
            })));
        }

        for listener in listeners {
            listener(args.clone());
        }
    }

    fn on_read(&self, args: Vec<Value>) {
        let Some(id) = stream_id(&args) else {
            debug!("read: missing stream id");
            return;
        };
        debug!(stream = %id, "read");
        match self.lookup(&id) {
            Some(stream) => stream.on_read_request(),
            None => debug!(stream = %id, "read: ignoring invalid stream id"),
        }
    }

    fn on_write(&self, args: Vec<Value>) {
        let mut args = args.into_iter();
        let id = match args.next() {
            Some(Value::String(id)) => StreamId::from(id),
            _ => {
                debug!("write: missing stream id");
                return;
            }
        };
        let chunk = args.next().unwrap_or(Value::Null);
        let encoding = match args.next() {
            Some(Value::String(encoding)) => encoding,
            _ => BINARY_ENCODING.to_string(),
        };
        let ack = match args.next() {
            Some(Value::Ack(ack)) => Some(ack),
            _ => None,
        };

        debug!(stream = %id, "write");
        let Some(stream) = self.lookup(&id) else {
            debug!(stream = %id, "write: invalid stream id");
            if let Some(ack) = ack {
                ack.call(vec![Value::String(format!("invalid stream id {id}"))]);
            }
            return;
        };

        match chunk_from_wire(chunk, &encoding) {
            Ok(chunk) => stream.on_write(chunk, ack),
            Err(message) => {
                warn!(stream = %id, error = %message, "write: undecodable chunk");
                stream.error(message);
            }
        }
    }

    fn on_end(&self, args: Vec<Value>) {
        let Some(id) = stream_id(&args) else {
            debug!("end: missing stream id");
            return;
        };
        debug!(stream = %id, "end");
        match self.lookup(&id) {
            Some(stream) => stream.on_end(),
            None => debug!(stream = %id, "end: ignore non-existent stream"),
        }
    }

    fn on_error(&self, args: Vec<Value>) {
        let Some(id) = stream_id(&args) else {
            debug!("error: missing stream id");
            return;
        };
        let message = match args.get(1) {
            Some(Value::String(message)) => message.clone(),
            Some(other) => other
                .to_json()
                .map(|json| json.to_string())
                .unwrap_or_default(),
            None => String::new(),
        };
        debug!(stream = %id, error = %message, "error");
        match self.lookup(&id) {
            Some(stream) => stream.on_remote_error(message),
            None => debug!(stream = %id, "error: invalid stream id"),
        }
    }

    fn on_disconnect(&self) {
        let streams: Vec<DuplexStream> = self
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        debug!(count = streams.len(), "transport disconnected, aborting streams");
        for stream in streams {
            stream.abort();
        }
    }

    pub(crate) fn send_read(&self, id: &StreamId, size: usize) -> Result<(), TransportError> {
        self.transport.emit(
            &self.names.read,
            vec![Value::from(id.as_str()), Value::from(size as u64)],
        )
    }

    pub(crate) fn send_write(
        &self,
        id: &StreamId,
        chunk: Bytes,
        encoding: &str,
        ack: Ack,
    ) -> Result<(), TransportError> {
        let (chunk, encoding) = chunk_to_wire(chunk, encoding, self.config.force_base64);
        self.transport.emit(
            &self.names.write,
            vec![
                Value::from(id.as_str()),
                chunk,
                Value::String(encoding),
                Value::Ack(ack),
            ],
        )
    }

    pub(crate) fn send_end(&self, id: &StreamId) -> Result<(), TransportError> {
        self.transport
            .emit(&self.names.end, vec![Value::from(id.as_str())])
    }

    pub(crate) fn send_error(&self, id: &StreamId, message: &str) -> Result<(), TransportError> {
        self.transport.emit(
            &self.names.error,
            vec![Value::from(id.as_str()), Value::from(message)],
        )
    }
}

fn stream_id(args: &[Value]) -> Option<StreamId> {
    args.first().and_then(Value::as_str).map(StreamId::from)
}

/// Convert an outbound chunk to its wire form.
pub(crate) fn chunk_to_wire(chunk: Bytes, encoding: &str, force_base64: bool) -> (Value, String) {
    if encoding == BINARY_ENCODING {
        if force_base64 {
            return (
                Value::String(B64.encode(&chunk)),
                BASE64_ENCODING.to_string(),
            );
        }
        return (Value::Bytes(chunk), encoding.to_string());
    }
    (
        Value::String(String::from_utf8_lossy(&chunk).into_owned()),
        encoding.to_string(),
    )
}

/// Convert an inbound chunk back to bytes. `None` ends the read direction.
pub(crate) fn chunk_from_wire(chunk: Value, encoding: &str) -> Result<Option<Bytes>, String> {
    match chunk {
        Value::Null => Ok(None),
        Value::Bytes(bytes) => Ok(Some(bytes)),
        Value::String(text) if encoding == BASE64_ENCODING => B64
            .decode(text.as_bytes())
            .map(|bytes| Some(Bytes::from(bytes)))
            .map_err(|e| format!("invalid base64 chunk: {e}")),
        Value::String(text) => Ok(Some(Bytes::from(text))),
        _ => Err("unsupported chunk type".to_string()),
    }
}
