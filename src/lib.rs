//! Resilient client for the alarm push channel
//!
//! A [`ConnectionManager`] keeps one logical subscription alive across
//! network faults, decodes every JSON frame once and fans it out to the
//! registered observers.

pub mod connection;
pub mod error;
pub mod transport;

pub use alarm_stream_shared::{defaults, ConnectionState, Frame, ReconnectPolicy};
pub use connection::{
    ConnectionManager, EndpointConfig, ListenerHandle, Observer, StreamConfig, StreamHooks,
};
pub use error::{ChannelError, StreamError};
pub use transport::{ChannelConnector, CloseReason, EventChannel, MemoryConnector, WebSocketConnector};
