//! Error types shared by the codec, streams and multiplexer.

use thiserror::Error;

use crate::stream::StreamId;

/// Message raised on every live stream when the transport goes away.
pub const ABORTED_MESSAGE: &str = "Connection aborted";

/// Violations of the multiplexing protocol.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Decoded stream already exists: {0}")]
    DuplicateId(StreamId),

    #[error("stream has already been sent: {0}")]
    AlreadySent(StreamId),

    #[error("stream has been destroyed: {0}")]
    Destroyed(StreamId),
}

/// Transport error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport disconnected")]
    Disconnected,

    #[error("Other error: {0}")]
    Other(String),
}

/// Errors surfaced on a single stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Error reported by the peer through the error signal.
    #[error("{0}")]
    Remote(String),

    #[error("{}", ABORTED_MESSAGE)]
    Aborted,

    #[error("stream destroyed")]
    Destroyed,

    #[error("write after end")]
    WriteAfterEnd,

    #[error("{0}")]
    Local(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl StreamError {
    /// Remote errors are never forwarded back to the peer.
    pub fn is_remote(&self) -> bool {
        matches!(self, StreamError::Remote(_))
    }
}

/// Multiplexer error
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
