//! In-memory transport
//!
//! A scripted connector whose channels are driven by [`MemoryPeer`] handles
//! instead of a network. Used to exercise the connection manager
//! deterministically and to embed the client in-process.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use alarm_stream_shared::Frame;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::ChannelError;
use crate::transport::traits::{ChannelConnector, ChannelId, CloseReason, EventChannel, SignalSink};

/// How the next `open` call behaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Complete the handshake immediately
    Accept,
    /// Start the attempt, then report a connect error
    Refuse(String),
    /// Fail synchronously without creating a channel
    Reject(String),
    /// Start the attempt and wait for [`MemoryPeer::accept`]
    Pending,
}

#[derive(Debug)]
struct ConnectorState {
    script: VecDeque<OpenOutcome>,
    default_outcome: OpenOutcome,
    peers: Vec<MemoryPeer>,
    attempts: Vec<(String, Instant)>,
    live: usize,
    max_live: usize,
}

/// Scripted in-memory connector
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    /// Connector that accepts every channel
    pub fn new() -> Self {
        Self::with_default(OpenOutcome::Accept)
    }

    /// Connector that refuses every channel
    pub fn refusing(reason: impl Into<String>) -> Self {
        Self::with_default(OpenOutcome::Refuse(reason.into()))
    }

    pub fn with_default(default_outcome: OpenOutcome) -> Self {
        Self {
            state: Arc::new(Mutex::new(ConnectorState {
                script: VecDeque::new(),
                default_outcome,
                peers: Vec::new(),
                attempts: Vec::new(),
                live: 0,
                max_live: 0,
            })),
        }
    }

    /// Queue the outcome of the next unscripted `open`
    pub fn push_outcome(&self, outcome: OpenOutcome) {
        self.state.lock().script.push_back(outcome);
    }

    pub fn set_default_outcome(&self, outcome: OpenOutcome) {
        self.state.lock().default_outcome = outcome;
    }

    /// Number of `open` calls so far
    pub fn open_count(&self) -> usize {
        self.state.lock().attempts.len()
    }

    /// URLs passed to `open`, in order
    pub fn urls(&self) -> Vec<String> {
        self.state.lock().attempts.iter().map(|(url, _)| url.clone()).collect()
    }

    /// When each `open` call happened
    pub fn opened_at(&self) -> Vec<Instant> {
        self.state.lock().attempts.iter().map(|(_, at)| *at).collect()
    }

    pub fn last_peer(&self) -> Option<MemoryPeer> {
        self.state.lock().peers.last().cloned()
    }

    /// Channels created and not yet closed
    pub fn live_channels(&self) -> usize {
        self.state.lock().live
    }

    /// Highest number of simultaneously live channels ever observed
    pub fn max_live_channels(&self) -> usize {
        self.state.lock().max_live
    }
}

impl ChannelConnector for MemoryConnector {
    fn open(&self, url: &str, sink: SignalSink) -> Result<Box<dyn EventChannel>, ChannelError> {
        let mut state = self.state.lock();
        state.attempts.push((url.to_string(), Instant::now()));

        let outcome = state
            .script
            .pop_front()
            .unwrap_or_else(|| state.default_outcome.clone());

        if let OpenOutcome::Reject(reason) = outcome {
            return Err(ChannelError::Connect {
                url: url.to_string(),
                reason,
            });
        }

        state.live += 1;
        state.max_live = state.max_live.max(state.live);

        let shared = Arc::new(ChannelShared {
            open: AtomicBool::new(false),
            released: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            connector: Arc::downgrade(&self.state),
        });
        let peer = MemoryPeer {
            url: url.to_string(),
            sink: sink.clone(),
            shared: shared.clone(),
        };
        state.peers.push(peer.clone());
        drop(state);

        match outcome {
            OpenOutcome::Accept => peer.accept(),
            OpenOutcome::Refuse(reason) => peer.refuse(reason),
            OpenOutcome::Pending | OpenOutcome::Reject(_) => {}
        }

        Ok(Box::new(MemoryChannel { sink, shared }))
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}

#[derive(Debug)]
struct ChannelShared {
    open: AtomicBool,
    released: AtomicBool,
    sent: Mutex<Vec<Frame>>,
    connector: Weak<Mutex<ConnectorState>>,
}

impl ChannelShared {
    /// Mark the channel closed; counted once
    fn release(&self) {
        self.open.store(false, Ordering::SeqCst);
        if !self.released.swap(true, Ordering::SeqCst) {
            if let Some(connector) = self.connector.upgrade() {
                let mut state = connector.lock();
                state.live = state.live.saturating_sub(1);
            }
        }
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Client side of an in-memory channel
pub struct MemoryChannel {
    sink: SignalSink,
    shared: Arc<ChannelShared>,
}

#[async_trait]
impl EventChannel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.sink.id()
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        self.shared.sent.lock().push(frame);
        Ok(())
    }

    async fn close(&mut self) {
        self.shared.release();
        self.sink.closed(CloseReason::local());
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// Server side of an in-memory channel
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    url: String,
    sink: SignalSink,
    shared: Arc<ChannelShared>,
}

impl MemoryPeer {
    pub fn id(&self) -> ChannelId {
        self.sink.id()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_released()
    }

    /// Complete a pending handshake
    pub fn accept(&self) {
        if self.is_closed() {
            return;
        }
        self.shared.open.store(true, Ordering::SeqCst);
        self.sink.opened();
    }

    /// Fail a pending handshake
    pub fn refuse(&self, reason: impl Into<String>) {
        self.shared.release();
        self.sink.error(ChannelError::Connect {
            url: self.url.clone(),
            reason: reason.into(),
        });
    }

    /// Push a frame to the client
    pub fn push(&self, frame: Frame) {
        if self.is_open() {
            self.sink.frame(frame);
        }
    }

    pub fn push_text(&self, text: &str) {
        self.push(Frame::from(text));
    }

    /// Close the channel from the server side
    pub fn close_remotely(&self, code: u16, reason: &str) {
        self.shared.release();
        self.sink.closed(CloseReason::remote(Some(code), reason));
    }

    /// Simulate a network fault
    pub fn fail(&self, reason: &str) {
        self.shared.release();
        self.sink.error(ChannelError::Transport(reason.to_string()));
    }

    /// Frames the client sent on this channel
    pub fn sent(&self) -> Vec<Frame> {
        self.shared.sent.lock().clone()
    }
}
