//! Flow-controlled duplex byte streams multiplexed over an event-messaging
//! connection.
//!
//! Streams can be placed anywhere inside the arguments of an application
//! event. The [`Multiplexer`] replaces them with references on the wire,
//! rebuilds them on the receiving side and carries the read, write, end and
//! error signals that pace each stream.

pub mod blob;
pub mod codec;
pub mod config;
pub mod error;
pub mod mux;
pub mod stream;
pub mod testing;
pub mod transport;
pub mod value;

pub use blob::{Blob, BlobReader};
pub use config::Config;
pub use error::{ConfigError, MuxError, ProtocolError, StreamError, TransportError};
pub use mux::{lookup, Multiplexer, MuxConfig};
pub use stream::{DuplexStream, StreamEvent, StreamId, StreamOptions, MAX_HIGH_WATER_MARK};
pub use transport::{EventHandler, Transport};
pub use value::{Ack, Value};

/// Create a new stream endpoint with a fresh id.
pub fn create_stream(options: StreamOptions) -> DuplexStream {
    DuplexStream::new(options)
}
