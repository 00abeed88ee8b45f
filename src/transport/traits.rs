//! Channel trait abstraction for pluggable event-stream backends

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alarm_stream_shared::Frame;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ChannelError;

/// Identifies one opened channel instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a channel closed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseReason {
    /// Close code, when the peer sent one
    pub code: Option<u16>,
    pub reason: String,
    /// Closed by our own `close()` call
    pub local: bool,
}

impl CloseReason {
    pub fn local() -> Self {
        Self {
            code: None,
            reason: "closed locally".into(),
            local: true,
        }
    }

    pub fn remote(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            local: false,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({})", self.reason, code),
            None => f.write_str(&self.reason),
        }
    }
}

/// Lifecycle signal reported by a channel to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    Opened,
    Frame(Frame),
    /// Terminal: the channel failed (implies close)
    Error(ChannelError),
    /// Terminal: the channel closed
    Closed(CloseReason),
}

impl ChannelSignal {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelSignal::Error(_) | ChannelSignal::Closed(_))
    }
}

/// A signal tagged with the channel instance that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    pub channel: ChannelId,
    pub signal: ChannelSignal,
}

/// Reporting side handed to a channel when it is opened
///
/// Enforces the terminal-once contract: after the first `error` or `closed`
/// nothing else is delivered, whichever clone of the sink reports it.
#[derive(Debug, Clone)]
pub struct SignalSink {
    id: ChannelId,
    tx: mpsc::UnboundedSender<ChannelMessage>,
    terminated: Arc<AtomicBool>,
}

impl SignalSink {
    pub fn new(id: ChannelId, tx: mpsc::UnboundedSender<ChannelMessage>) -> Self {
        Self {
            id,
            tx,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn opened(&self) {
        self.emit(ChannelSignal::Opened);
    }

    pub fn frame(&self, frame: Frame) {
        self.emit(ChannelSignal::Frame(frame));
    }

    /// Report a failure; returns false if a terminal signal was already sent
    pub fn error(&self, error: ChannelError) -> bool {
        self.emit(ChannelSignal::Error(error))
    }

    /// Report closure; returns false if a terminal signal was already sent
    pub fn closed(&self, reason: CloseReason) -> bool {
        self.emit(ChannelSignal::Closed(reason))
    }

    /// Deliver `signal` unless a terminal signal went out before it
    fn emit(&self, signal: ChannelSignal) -> bool {
        let suppressed = if signal.is_terminal() {
            self.terminated.swap(true, Ordering::SeqCst)
        } else {
            self.is_terminated()
        };
        if suppressed {
            return false;
        }

        // The owner may already be gone; nothing left to tell
        let _ = self.tx.send(ChannelMessage {
            channel: self.id,
            signal,
        });
        true
    }
}

/// One physical connection attempt
#[async_trait]
pub trait EventChannel: Send {
    /// Instance id, used by the owner to discard stale signals
    fn id(&self) -> ChannelId;

    /// True while the handshake has completed and the channel is not closed
    fn is_open(&self) -> bool;

    /// Queue an outbound frame
    fn send(&self, frame: Frame) -> Result<(), ChannelError>;

    /// Request graceful shutdown and wait until the connection is released
    async fn close(&mut self);
}

/// Factory for opening channels
pub trait ChannelConnector: Send + Sync + 'static {
    /// Start opening a channel to `url`
    ///
    /// Returns immediately; the outcome is reported through `sink`. A URL
    /// that cannot even be attempted fails synchronously.
    fn open(&self, url: &str, sink: SignalSink) -> Result<Box<dyn EventChannel>, ChannelError>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
