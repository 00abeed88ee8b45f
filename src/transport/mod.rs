pub mod memory;
pub mod traits;
pub mod websocket;

pub use memory::{MemoryChannel, MemoryConnector, MemoryPeer, OpenOutcome};
pub use traits::{
    ChannelConnector, ChannelId, ChannelMessage, ChannelSignal, CloseReason, EventChannel,
    SignalSink,
};
pub use websocket::{WebSocketChannel, WebSocketConnector};
