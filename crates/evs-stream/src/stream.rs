//! Flow-controlled duplex stream endpoint.
//!
//! Each direction is paced by explicit permission from the peer. The read side
//! asks for data with a read-request and accepts at most one chunk per request;
//! the write side only sends a chunk after the peer granted credit. Chunks that
//! arrive before they were asked for, and writes issued before credit exists,
//! wait in FIFO queues until the matching signal drains them.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

use crate::error::{ProtocolError, StreamError};
use crate::mux::MuxShared;
use crate::value::{Ack, Value};

/// Default number of bytes requested per pull.
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// Upper bound on the high-water mark, applied to options from the wire.
pub const MAX_HIGH_WATER_MARK: usize = 16 * 1024 * 1024;

/// Wire encoding label for raw binary chunks.
pub const BINARY_ENCODING: &str = "buffer";

/// Stream identifier, unique for the lifetime of a connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Per-stream options. Travels with the encoded reference, unknown keys
/// included.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamOptions {
    /// Keep the other direction open after one direction ended.
    #[serde(alias = "allow_half_open")]
    pub allow_half_open: bool,
    /// Bytes requested per pull and the local read buffer limit.
    #[serde(alias = "high_water_mark")]
    pub high_water_mark: usize,
    /// Encoding label used by `write_str`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            allow_half_open: false,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            encoding: None,
            extra: BTreeMap::new(),
        }
    }
}

impl StreamOptions {
    pub(crate) fn to_value(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(json) => Value::from(json),
            Err(_) => Value::Null,
        }
    }

    /// Options carried by a reference; the high-water mark is clamped to
    /// `1..=MAX_HIGH_WATER_MARK`.
    pub(crate) fn from_value(value: Option<&Value>) -> Self {
        let mut options: Self = value
            .and_then(Value::to_json)
            .and_then(|json| serde_json::from_value(json).ok())
            .unwrap_or_default();
        options.high_water_mark = options.buffer_size();
        options
    }

    pub(crate) fn buffer_size(&self) -> usize {
        self.high_water_mark.clamp(1, MAX_HIGH_WATER_MARK)
    }
}

/// Lifecycle notifications delivered to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// The consumer reached end of stream.
    End,
    /// The local write direction finished.
    Finish,
    Error(StreamError),
    Close,
}

/// Outbound signal produced by a state transition.
pub(crate) enum Signal {
    Read { size: usize },
    Write { chunk: Bytes, encoding: String, seq: u64 },
    End,
    Error { message: String },
}

/// Side effect run once the state lock is released.
enum Effect {
    Send(Weak<MuxShared>, Signal),
    Ack(Ack),
    Cleanup(Weak<MuxShared>),
}

/// A chunk (or the end marker) received before the consumer asked for it.
enum Delivery {
    Chunk { chunk: Bytes, ack: Option<Ack> },
    End { ack: Option<Ack> },
}

/// A local write waiting for credit.
struct PendingWrite {
    chunk: Bytes,
    encoding: String,
    done: oneshot::Sender<Result<(), StreamError>>,
}

struct StreamState {
    allow_half_open: bool,
    high_water_mark: usize,

    /// PULL_OUTSTANDING when set.
    readable: bool,
    /// CREDIT_AVAILABLE when set.
    writable: bool,

    pending_push: VecDeque<Delivery>,
    pending_write: VecDeque<PendingWrite>,
    in_flight: BTreeMap<u64, oneshot::Sender<Result<(), StreamError>>>,
    next_seq: u64,

    buffer: VecDeque<Bytes>,
    buffered: usize,

    read_ended: bool,
    end_emitted: bool,
    finish_requested: bool,
    write_finished: bool,

    owner: Option<Weak<MuxShared>>,
    attached: bool,
    destroyed: bool,
    error: Option<StreamError>,

    subscribers: Vec<mpsc::UnboundedSender<StreamEvent>>,
}

impl StreamState {
    fn new(options: &StreamOptions) -> Self {
        Self {
            allow_half_open: options.allow_half_open,
            high_water_mark: options.buffer_size(),
            readable: false,
            writable: false,
            pending_push: VecDeque::new(),
            pending_write: VecDeque::new(),
            in_flight: BTreeMap::new(),
            next_seq: 0,
            buffer: VecDeque::new(),
            buffered: 0,
            read_ended: false,
            end_emitted: false,
            finish_requested: false,
            write_finished: false,
            owner: None,
            attached: false,
            destroyed: false,
            error: None,
            subscribers: Vec::new(),
        }
    }

    fn send(&self, fx: &mut Vec<Effect>, signal: Signal) {
        if let Some(owner) = &self.owner {
            fx.push(Effect::Send(owner.clone(), signal));
        }
    }

    fn emit(&mut self, event: StreamEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Local pull: drain deferred deliveries or ask the peer for data.
    fn pull(&mut self, fx: &mut Vec<Effect>, notify: &Notify) {
        if self.destroyed {
            return;
        }

        if !self.pending_push.is_empty() {
            while let Some(delivery) = self.pending_push.pop_front() {
                if !self.deliver(delivery, fx, notify) {
                    break;
                }
            }
            return;
        }

        if !self.readable {
            self.readable = true;
            let size = self.high_water_mark;
            self.send(fx, Signal::Read { size });
        }
    }

    /// Hand a delivery to the consumer. Returns false once the consumer
    /// buffer is full or the read direction ended.
    fn deliver(&mut self, delivery: Delivery, fx: &mut Vec<Effect>, notify: &Notify) -> bool {
        self.readable = false;
        match delivery {
            Delivery::Chunk { chunk, ack } => {
                if !chunk.is_empty() {
                    self.buffered += chunk.len();
                    self.buffer.push_back(chunk);
                }
                if let Some(ack) = ack {
                    fx.push(Effect::Ack(ack));
                }
                notify.notify_waiters();
                self.buffered < self.high_water_mark
            }
            Delivery::End { ack } => {
                if let Some(ack) = ack {
                    fx.push(Effect::Ack(ack));
                }
                self.end_read(fx, notify);
                false
            }
        }
    }

    /// Inbound write-chunk.
    fn on_write(&mut self, chunk: Option<Bytes>, ack: Option<Ack>, fx: &mut Vec<Effect>, notify: &Notify) {
        if self.destroyed || self.read_ended {
            return;
        }

        let delivery = match chunk {
            Some(chunk) => Delivery::Chunk { chunk, ack },
            None => Delivery::End { ack },
        };

        if self.readable {
            self.deliver(delivery, fx, notify);
        } else {
            self.pending_push.push_back(delivery);
        }
    }

    /// Inbound end: conclude the read direction once deferred deliveries drain.
    fn on_end(&mut self, fx: &mut Vec<Effect>, notify: &Notify) {
        if self.destroyed || self.read_ended {
            return;
        }
        self.close_read(fx, notify);
    }

    fn close_read(&mut self, fx: &mut Vec<Effect>, notify: &Notify) {
        if self.pending_push.is_empty() {
            self.deliver(Delivery::End { ack: None }, fx, notify);
        } else {
            self.pending_push.push_back(Delivery::End { ack: None });
        }
    }

    fn end_read(&mut self, fx: &mut Vec<Effect>, notify: &Notify) {
        if self.read_ended {
            return;
        }
        self.read_ended = true;
        self.readable = false;
        notify.notify_waiters();

        if self.write_finished {
            self.destroy(fx, notify);
            return;
        }

        if !self.allow_half_open {
            self.request_finish(fx, notify);
        }
    }

    /// Inbound read-request: spend the credit on the oldest queued write,
    /// or keep it for the next one.
    fn on_read_request(&mut self, fx: &mut Vec<Effect>) {
        if self.destroyed {
            return;
        }

        if let Some(write) = self.pending_write.pop_front() {
            self.dispatch(write, fx);
        } else if !self.write_finished {
            self.writable = true;
        }
    }

    fn push(
        &mut self,
        chunk: Bytes,
        encoding: String,
        fx: &mut Vec<Effect>,
    ) -> Result<oneshot::Receiver<Result<(), StreamError>>, StreamError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.destroyed {
            return Err(StreamError::Destroyed);
        }
        if self.finish_requested || self.write_finished {
            return Err(StreamError::WriteAfterEnd);
        }

        let (done, rx) = oneshot::channel();
        let write = PendingWrite { chunk, encoding, done };
        if self.writable {
            self.dispatch(write, fx);
        } else {
            self.pending_write.push_back(write);
        }
        Ok(rx)
    }

    fn dispatch(&mut self, write: PendingWrite, fx: &mut Vec<Effect>) {
        self.writable = false;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.in_flight.insert(seq, write.done);
        self.send(
            fx,
            Signal::Write {
                chunk: write.chunk,
                encoding: write.encoding,
                seq,
            },
        );
    }

    fn on_write_ack(&mut self, seq: u64, failure: Option<String>, fx: &mut Vec<Effect>, notify: &Notify) {
        let Some(done) = self.in_flight.remove(&seq) else {
            return;
        };

        match failure {
            None => {
                let _ = done.send(Ok(()));
                self.maybe_finish(fx, notify);
            }
            Some(message) => {
                let err = StreamError::Remote(message);
                let _ = done.send(Err(err.clone()));
                self.fail(err, fx, notify);
            }
        }
    }

    fn request_finish(&mut self, fx: &mut Vec<Effect>, notify: &Notify) {
        if self.destroyed || self.finish_requested {
            return;
        }
        self.finish_requested = true;
        self.maybe_finish(fx, notify);
    }

    fn maybe_finish(&mut self, fx: &mut Vec<Effect>, notify: &Notify) {
        if self.finish_requested
            && !self.write_finished
            && self.pending_write.is_empty()
            && self.in_flight.is_empty()
        {
            self.on_finish(fx, notify);
        }
    }

    fn on_finish(&mut self, fx: &mut Vec<Effect>, notify: &Notify) {
        self.write_finished = true;
        self.writable = false;
        self.send(fx, Signal::End);
        self.emit(StreamEvent::Finish);

        if self.read_ended {
            self.destroy(fx, notify);
            return;
        }

        if !self.allow_half_open {
            self.close_read(fx, notify);
        }
    }

    fn fail(&mut self, err: StreamError, fx: &mut Vec<Effect>, notify: &Notify) {
        if self.destroyed {
            return;
        }

        if !err.is_remote() {
            self.send(
                fx,
                Signal::Error {
                    message: err.to_string(),
                },
            );
        }

        if self.error.is_none() {
            self.error = Some(err.clone());
        }
        self.emit(StreamEvent::Error(err));
        self.destroy(fx, notify);
    }

    fn destroy(&mut self, fx: &mut Vec<Effect>, notify: &Notify) {
        if self.destroyed {
            return;
        }

        self.destroyed = true;
        self.readable = false;
        self.writable = false;
        self.pending_push.clear();

        let err = self.error.clone().unwrap_or(StreamError::Destroyed);
        for write in self.pending_write.drain(..) {
            let _ = write.done.send(Err(err.clone()));
        }
        for (_, done) in std::mem::take(&mut self.in_flight) {
            let _ = done.send(Err(err.clone()));
        }

        if let Some(owner) = self.owner.take() {
            fx.push(Effect::Cleanup(owner));
        }

        notify.notify_waiters();
        self.emit(StreamEvent::Close);
    }
}

struct StreamInner {
    id: StreamId,
    options: StreamOptions,
    state: Mutex<StreamState>,
    readable: Notify,
}

/// One endpoint of a multiplexed duplex byte stream.
///
/// Cloning yields another handle to the same endpoint.
#[derive(Clone)]
pub struct DuplexStream {
    inner: Arc<StreamInner>,
}

impl fmt::Debug for DuplexStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexStream")
            .field("id", &self.inner.id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl DuplexStream {
    /// Create a stream with a fresh id.
    pub fn new(options: StreamOptions) -> Self {
        Self::with_id(StreamId::generate(), options)
    }

    /// Create a stream stub for an id chosen by the peer.
    pub(crate) fn with_id(id: StreamId, options: StreamOptions) -> Self {
        let state = StreamState::new(&options);
        Self {
            inner: Arc::new(StreamInner {
                id,
                options,
                state: Mutex::new(state),
                readable: Notify::new(),
            }),
        }
    }

    pub fn id(&self) -> &StreamId {
        &self.inner.id
    }

    pub fn options(&self) -> &StreamOptions {
        &self.inner.options
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    /// Whether this stream has ever been registered with a multiplexer.
    pub fn is_attached(&self) -> bool {
        self.inner.state.lock().attached
    }

    pub fn ptr_eq(&self, other: &DuplexStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Subscribe to lifecycle events raised from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.state.lock().subscribers.push(tx);
        rx
    }

    /// Pull the next chunk. `Ok(None)` marks the end of the stream.
    pub async fn read(&self) -> Result<Option<Bytes>, StreamError> {
        loop {
            let notified = self.inner.readable.notified();
            let mut fx = Vec::new();
            {
                let mut st = self.inner.state.lock();
                if let Some(chunk) = st.buffer.pop_front() {
                    st.buffered -= chunk.len();
                    return Ok(Some(chunk));
                }
                if st.read_ended {
                    if !st.end_emitted {
                        st.end_emitted = true;
                        st.emit(StreamEvent::End);
                    }
                    return Ok(None);
                }
                if let Some(err) = &st.error {
                    return Err(err.clone());
                }
                if st.destroyed {
                    return Err(StreamError::Destroyed);
                }
                st.pull(&mut fx, &self.inner.readable);
            }
            self.run(fx);
            notified.await;
        }
    }

    /// Read until end of stream.
    pub async fn read_to_end(&self) -> Result<Vec<u8>, StreamError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Push a binary chunk. Resolves once the peer acknowledged it.
    pub async fn write(&self, chunk: impl Into<Bytes>) -> Result<(), StreamError> {
        self.write_encoded(chunk.into(), BINARY_ENCODING.to_string()).await
    }

    /// Push a text chunk labelled with the stream's default encoding.
    pub async fn write_str(&self, text: &str) -> Result<(), StreamError> {
        let encoding = self
            .inner
            .options
            .encoding
            .clone()
            .unwrap_or_else(|| "utf8".to_string());
        self.write_encoded(Bytes::copy_from_slice(text.as_bytes()), encoding)
            .await
    }

    async fn write_encoded(&self, chunk: Bytes, encoding: String) -> Result<(), StreamError> {
        let mut fx = Vec::new();
        let rx = self.inner.state.lock().push(chunk, encoding, &mut fx);
        self.run(fx);
        match rx?.await {
            Ok(result) => result,
            Err(_) => Err(StreamError::Destroyed),
        }
    }

    /// End the local write direction once queued writes complete.
    pub fn finish(&self) {
        self.with_state(|st, fx, notify| st.request_finish(fx, notify));
    }

    /// Raise a local error: forwarded to the peer, then the stream is destroyed.
    pub fn error(&self, message: impl Into<String>) {
        let err = StreamError::Local(message.into());
        self.with_state(|st, fx, notify| st.fail(err, fx, notify));
    }

    /// Tear the stream down. Safe to call any number of times.
    pub fn destroy(&self) {
        self.with_state(|st, fx, notify| st.destroy(fx, notify));
    }

    /// Copy everything from `reader` into this stream, then finish it.
    pub async fn pipe_from<R>(&self, mut reader: R) -> Result<u64, StreamError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; self.inner.options.buffer_size()];
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    self.error(e.to_string());
                    return Err(StreamError::Local(e.to_string()));
                }
            };
            if n == 0 {
                break;
            }
            self.write(Bytes::copy_from_slice(&buf[..n])).await?;
            total += n as u64;
        }
        self.finish();
        Ok(total)
    }

    /// Copy everything read from this stream into `writer`.
    pub async fn pipe_to<W>(&self, mut writer: W) -> Result<u64, StreamError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut total = 0u64;
        while let Some(chunk) = self.read().await? {
            if let Err(e) = writer.write_all(&chunk).await {
                self.error(e.to_string());
                return Err(StreamError::Local(e.to_string()));
            }
            total += chunk.len() as u64;
        }
        writer
            .flush()
            .await
            .map_err(|e| StreamError::Local(e.to_string()))?;
        Ok(total)
    }

    /// Bind to a multiplexer. A stream is attached at most once in its life.
    pub(crate) fn attach(&self, owner: Weak<MuxShared>) -> Result<(), ProtocolError> {
        let mut st = self.inner.state.lock();
        if st.destroyed {
            return Err(ProtocolError::Destroyed(self.inner.id.clone()));
        }
        if st.attached {
            return Err(ProtocolError::AlreadySent(self.inner.id.clone()));
        }
        st.attached = true;
        st.owner = Some(owner);
        Ok(())
    }

    /// Release a binding whose event was never sent.
    pub(crate) fn detach(&self) {
        let mut st = self.inner.state.lock();
        st.attached = false;
        st.owner = None;
    }

    /// Send the read-request of a pull issued before the stream had an owner.
    pub(crate) fn resume_pull(&self) {
        self.with_state(|st, fx, _| {
            if st.readable && !st.destroyed {
                let size = st.high_water_mark;
                st.send(fx, Signal::Read { size });
            }
        });
    }

    pub(crate) fn on_read_request(&self) {
        self.with_state(|st, fx, _| st.on_read_request(fx));
    }

    pub(crate) fn on_write(&self, chunk: Option<Bytes>, ack: Option<Ack>) {
        self.with_state(|st, fx, notify| st.on_write(chunk, ack, fx, notify));
    }

    pub(crate) fn on_end(&self) {
        self.with_state(|st, fx, notify| st.on_end(fx, notify));
    }

    pub(crate) fn on_remote_error(&self, message: String) {
        let err = StreamError::Remote(message);
        self.with_state(|st, fx, notify| st.fail(err, fx, notify));
    }

    /// Transport went away: destroy, then raise close and aborted.
    pub(crate) fn abort(&self) {
        self.with_state(|st, fx, notify| {
            if st.destroyed {
                return;
            }
            if st.error.is_none() {
                st.error = Some(StreamError::Aborted);
            }
            st.destroy(fx, notify);
            st.emit(StreamEvent::Error(StreamError::Aborted));
        });
    }

    fn on_write_ack(&self, seq: u64, args: Vec<Value>) {
        let failure = match args.into_iter().next() {
            None | Some(Value::Null) => None,
            Some(Value::String(message)) => Some(message),
            Some(other) => Some(
                other
                    .to_json()
                    .map(|json| json.to_string())
                    .unwrap_or_else(|| "write rejected".to_string()),
            ),
        };
        self.with_state(|st, fx, notify| st.on_write_ack(seq, failure, fx, notify));
    }

    fn write_ack(&self, seq: u64) -> Ack {
        let weak = Arc::downgrade(&self.inner);
        Ack::new(move |args| {
            if let Some(inner) = weak.upgrade() {
                DuplexStream { inner }.on_write_ack(seq, args);
            }
        })
    }

    fn with_state<F>(&self, f: F)
    where
        F: FnOnce(&mut StreamState, &mut Vec<Effect>, &Notify),
    {
        let mut fx = Vec::new();
        {
            let mut st = self.inner.state.lock();
            f(&mut *st, &mut fx, &self.inner.readable);
        }
        self.run(fx);
    }

    fn run(&self, fx: Vec<Effect>) {
        let id = &self.inner.id;
        for effect in fx {
            match effect {
                Effect::Send(owner, signal) => {
                    let Some(mux) = owner.upgrade() else {
                        debug!(stream = %id, "owner gone, signal dropped");
                        continue;
                    };
                    let result = match signal {
                        Signal::Read { size } => mux.send_read(id, size),
                        Signal::Write { chunk, encoding, seq } => {
                            mux.send_write(id, chunk, &encoding, self.write_ack(seq))
                        }
                        Signal::End => mux.send_end(id),
                        Signal::Error { message } => mux.send_error(id, &message),
                    };
                    if let Err(e) = result {
                        warn!(stream = %id, error = %e, "failed to send stream signal");
                        self.with_state(|st, fx, notify| st.fail(StreamError::Transport(e), fx, notify));
                    }
                }
                Effect::Ack(ack) => ack.call(Vec::new()),
                Effect::Cleanup(owner) => {
                    if let Some(mux) = owner.upgrade() {
                        mux.cleanup(id);
                    }
                }
            }
        }
    }
}
