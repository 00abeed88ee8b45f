//! Error taxonomy for the event-stream client

use alarm_stream_shared::CodecError;
use thiserror::Error;

/// Errors raised by a single channel instance
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel is not open")]
    NotOpen,

    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Connection to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Channel closed")]
    Closed,
}

/// Failures reported by the connection manager to its hooks
///
/// Only `Connect` and `TransportFault` drive state transitions; the rest are
/// local and never affect the channel.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Connect error: {0}")]
    Connect(ChannelError),

    #[error("Transport fault: {0}")]
    TransportFault(ChannelError),

    #[error("Decode error: {0}")]
    Decode(#[from] CodecError),

    #[error("Observer {observer} panicked: {message}")]
    ObserverFault { observer: u64, message: String },

    #[error("Gave up after {attempts} reconnect attempts")]
    ExhaustedRetries { attempts: u32 },
}
