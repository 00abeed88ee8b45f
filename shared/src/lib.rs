//! Alarm Stream Shared Types
//!
//! This crate provides the pieces shared by the alarm stream client and the
//! alarm hub: the connection state machine, the reconnect policy and the
//! JSON frame codec.

pub mod codec;
pub mod policy;
pub mod state_machine;

pub use codec::{CodecError, Frame, FrameDecoder};
pub use policy::{ReconnectDecision, ReconnectPolicy};
pub use state_machine::{
    ConnectionState, Directive, SessionEvent, SessionStateMachine, TransitionResult,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Protocol defaults for the alarm push channel
pub mod defaults {
    /// Well-known path of the alarm push endpoint
    pub const ALARM_CHANNEL_PATH: &str = "/channel/analysis/alarm";

    /// Host used when no transport context is configured
    pub const DEFAULT_HOST: &str = "127.0.0.1:18080";

    /// Delay unit for linear reconnect backoff
    pub const RECONNECT_BASE_DELAY_MS: u64 = 3000;

    /// Consecutive reconnect attempts before giving up
    pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

    /// Upper bound for the opening handshake
    pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// Upper bound for a graceful close before the channel is torn down
    pub const CLOSE_TIMEOUT_MS: u64 = 2_000;

    /// Largest frame accepted by the decoder (1 MiB)
    pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

    /// Close code sent by the hub when a client writes to the push-only endpoint
    /// (RFC 6455 "message too big")
    pub const PUSH_ONLY_CLOSE_CODE: u16 = 1009;

    /// Close reason sent alongside [`PUSH_ONLY_CLOSE_CODE`]
    pub const PUSH_ONLY_CLOSE_REASON: &str = "this endpoint accepts no client messages";
}
