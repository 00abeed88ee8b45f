//! Connection manager with a persistent channel and automatic reconnection
//!
//! All transitions run on one actor task. Callers talk to it through an
//! unbounded command mailbox; channels report through a separate signal
//! mailbox tagged with their [`ChannelId`], so signals from a superseded
//! channel are recognised and dropped.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use alarm_stream_shared::{
    ConnectionState, Directive, Frame, FrameDecoder, SessionEvent, SessionStateMachine,
    TransitionResult,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tracing::{debug, error, info, warn};

use crate::connection::config::StreamConfig;
use crate::connection::registry::{
    dispatch_to, panic_message, ListenerHandle, ListenerRegistry, Observer,
};
use crate::error::StreamError;
use crate::transport::{
    ChannelConnector, ChannelId, ChannelMessage, ChannelSignal, CloseReason, EventChannel,
    SignalSink, WebSocketConnector,
};

type Hook<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Optional lifecycle callbacks supplied at construction
#[derive(Clone, Default)]
pub struct StreamHooks {
    /// Channel opened; receives the session URL
    pub on_open: Option<Hook<str>>,
    /// Every decoded event, before observers run
    pub on_message: Option<Hook<Value>>,
    /// Channel closed, by either side
    pub on_close: Option<Hook<CloseReason>>,
    /// Any reported failure, including the final give-up
    pub on_error: Option<Hook<StreamError>>,
}

impl StreamHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(hook));
        self
    }

    pub fn on_message(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(hook));
        self
    }

    pub fn on_close(mut self, hook: impl Fn(&CloseReason) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&StreamError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for StreamHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHooks")
            .field("on_open", &self.on_open.is_some())
            .field("on_message", &self.on_message.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Run a hook, containing any panic
fn call_hook<T: ?Sized>(name: &str, hook: &Option<Hook<T>>, arg: &T) {
    if let Some(hook) = hook {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(arg))) {
            error!(
                "[STREAM] {} hook panicked: {}",
                name,
                panic_message(payload.as_ref())
            );
        }
    }
}

#[derive(Debug)]
enum Command {
    Connect { url: Option<String> },
    /// Observers registered before `mark` are removed
    Disconnect { mark: ListenerHandle },
}

/// Owns one logical subscription to the alarm channel
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    registry: Arc<Mutex<ListenerRegistry>>,
    state_rx: watch::Receiver<ConnectionState>,
    connected: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
    _task: JoinHandle<()>,
}

impl ConnectionManager {
    /// Create a manager and start its actor task
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        config: StreamConfig,
        connector: Arc<dyn ChannelConnector>,
        hooks: StreamHooks,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let registry = Arc::new(Mutex::new(ListenerRegistry::new()));
        let connected = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicU32::new(0));

        let actor = StreamActor {
            machine: SessionStateMachine::new(config.policy),
            decoder: FrameDecoder::new(config.max_frame_bytes),
            config,
            connector,
            hooks,
            registry: registry.clone(),
            session_url: None,
            requested_url: None,
            clear_mark: None,
            channel: None,
            next_channel_id: 0,
            pending_reconnect: None,
            signal_tx,
            state_tx,
            connected: connected.clone(),
            attempts: attempts.clone(),
        };
        let task = tokio::spawn(actor.run(command_rx, signal_rx));

        Self {
            commands: command_tx,
            registry,
            state_rx,
            connected,
            attempts,
            _task: task,
        }
    }

    /// Create a manager that talks WebSocket
    pub fn websocket(config: StreamConfig, hooks: StreamHooks) -> Self {
        let connector = WebSocketConnector::new(config.connect_timeout, config.close_timeout);
        Self::new(config, Arc::new(connector), hooks)
    }

    /// Start a session
    ///
    /// Without a URL the endpoint is derived from the configured transport
    /// context. A no-op while a session is already Connecting, Open or
    /// Reconnecting.
    pub fn connect(&self, url: Option<&str>) {
        let url = url.map(str::to_string);
        if self.commands.send(Command::Connect { url }).is_err() {
            warn!("[STREAM] connect() after the manager shut down");
        }
    }

    /// Stop the session, cancel any pending reconnect and drop all observers
    ///
    /// Safe to call from any state, any number of times. Observers registered
    /// after this call returns are kept.
    pub fn disconnect(&self) {
        let registry = self.registry.lock();
        let mark = registry.mark();
        self.connected.store(false, Ordering::SeqCst);
        if self.commands.send(Command::Disconnect { mark }).is_err() {
            debug!("[STREAM] disconnect() after the manager shut down");
        }
    }

    /// Register an observer for every decoded event
    pub fn register<F>(&self, observer: F) -> ListenerHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.registry.lock().register(observer)
    }

    pub fn register_shared(&self, observer: Observer) -> ListenerHandle {
        self.registry.lock().register_shared(observer)
    }

    /// Remove an observer; unknown handles are ignored
    pub fn unregister(&self, handle: ListenerHandle) -> bool {
        self.registry.lock().unregister(handle)
    }

    /// True while the session is Open
    ///
    /// Updated by the actor when it handles the channel's signals. After the
    /// socket drops, this keeps returning true until the actor has processed
    /// the resulting Closed or Error signal.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every published state
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Consecutive failures since the last successful open
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn listener_count(&self) -> usize {
        self.registry.lock().len()
    }
}

/// Actor state; lives on the spawned task
struct StreamActor {
    config: StreamConfig,
    connector: Arc<dyn ChannelConnector>,
    hooks: StreamHooks,
    registry: Arc<Mutex<ListenerRegistry>>,
    machine: SessionStateMachine,
    decoder: FrameDecoder,
    /// URL of the current session, reused by every reconnect
    session_url: Option<String>,
    /// URL passed to the `connect` being processed
    requested_url: Option<String>,
    /// Mark of the `disconnect` being processed
    clear_mark: Option<ListenerHandle>,
    channel: Option<Box<dyn EventChannel>>,
    next_channel_id: u64,
    pending_reconnect: Option<Pin<Box<Sleep>>>,
    signal_tx: mpsc::UnboundedSender<ChannelMessage>,
    state_tx: watch::Sender<ConnectionState>,
    connected: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
}

impl StreamActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut signals: mpsc::UnboundedReceiver<ChannelMessage>,
    ) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                Some(message) = signals.recv() => self.handle_signal(message).await,

                _ = reconnect_elapsed(&mut self.pending_reconnect) => {
                    self.pending_reconnect = None;
                    self.apply(SessionEvent::TimerFired).await;
                }
            }
        }

        debug!("[STREAM] Manager dropped, releasing channel");
        self.pending_reconnect = None;
        self.release_channel().await;
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { url } => {
                self.requested_url = url;
                self.apply(SessionEvent::Connect).await;
                self.requested_url = None;
            }
            Command::Disconnect { mark } => {
                info!("[STREAM] Disconnect requested in state {}", self.machine.state());
                self.clear_mark = Some(mark);
                self.apply(SessionEvent::Disconnect).await;
                self.clear_mark = None;
            }
        }
    }

    async fn handle_signal(&mut self, message: ChannelMessage) {
        let live = self.channel.as_ref().map(|channel| channel.id());
        if live != Some(message.channel) {
            debug!(
                "[STREAM] Ignoring signal from stale channel {} (live: {:?})",
                message.channel, live
            );
            return;
        }

        match message.signal {
            ChannelSignal::Opened => self.apply(SessionEvent::ChannelOpened).await,
            ChannelSignal::Frame(frame) => self.on_frame(&frame),
            ChannelSignal::Error(error) => {
                let error = if self.machine.state() == ConnectionState::Connecting {
                    StreamError::Connect(error)
                } else {
                    StreamError::TransportFault(error)
                };
                warn!("[STREAM] Channel {} failed: {}", message.channel, error);
                let reason = CloseReason::remote(None, error.to_string());
                self.report(error);
                call_hook("on_close", &self.hooks.on_close, &reason);
                self.channel_lost().await;
            }
            ChannelSignal::Closed(reason) => {
                info!("[STREAM] Channel {} closed: {}", message.channel, reason);
                call_hook("on_close", &self.hooks.on_close, &reason);
                self.channel_lost().await;
            }
        }
    }

    fn on_frame(&mut self, frame: &Frame) {
        if self.machine.state() != ConnectionState::Open {
            debug!("[STREAM] Dropping frame received while {}", self.machine.state());
            return;
        }

        match self.decoder.decode_next(frame) {
            Ok(event) => self.deliver(&event),
            Err(e) => {
                warn!(
                    "[STREAM] Dropping undecodable frame ({} bytes): {}",
                    frame.len(),
                    e
                );
                self.report(StreamError::Decode(e));
            }
        }
    }

    /// Fan an event out to the hook and every observer
    fn deliver(&self, event: &Value) {
        call_hook("on_message", &self.hooks.on_message, event);

        // Observers run without the registry lock so they may (un)register
        let listeners = self.registry.lock().snapshot();
        let report = dispatch_to(&listeners, event);

        for fault in report.faults {
            error!("[STREAM] Observer {} panicked: {}", fault.handle, fault.message);
            self.report(StreamError::ObserverFault {
                observer: fault.handle.id(),
                message: fault.message,
            });
        }
    }

    fn report(&self, error: StreamError) {
        call_hook("on_error", &self.hooks.on_error, &error);
    }

    async fn channel_lost(&mut self) {
        debug!(
            "[STREAM] Session so far: {} events decoded, {} frames rejected",
            self.decoder.decoded(),
            self.decoder.rejected()
        );
        self.connected.store(false, Ordering::SeqCst);
        self.release_channel().await;
        self.apply(SessionEvent::ChannelLost).await;
    }

    /// Feed an event through the state machine and carry out its directives
    async fn apply(&mut self, event: SessionEvent) {
        let mut queue = VecDeque::from([event]);

        while let Some(event) = queue.pop_front() {
            match self.machine.process_event(event) {
                TransitionResult::Applied {
                    from,
                    to,
                    directives,
                } => {
                    debug!("[STREAM] {:?}: {} -> {}", event, from, to);
                    self.publish(to);
                    for directive in directives {
                        if let Some(next) = self.execute(directive).await {
                            queue.push_back(next);
                        }
                    }
                }
                TransitionResult::Ignored { state, event } => {
                    debug!("[STREAM] {:?} ignored while {}", event, state);
                }
                TransitionResult::Invalid { from, event } => {
                    debug!("[STREAM] Discarding {:?} in state {}", event, from);
                }
            }
        }
    }

    async fn execute(&mut self, directive: Directive) -> Option<SessionEvent> {
        match directive {
            Directive::BeginSession => {
                let url = self
                    .requested_url
                    .take()
                    .unwrap_or_else(|| self.config.endpoint.url());
                info!("[STREAM] Starting session for {}", url);
                self.session_url = Some(url);
                self.decoder.reset();
                None
            }
            Directive::OpenChannel => self.open_channel().await,
            Directive::CloseChannel => {
                self.release_channel().await;
                call_hook("on_close", &self.hooks.on_close, &CloseReason::local());
                Some(SessionEvent::ChannelReleased)
            }
            Directive::ScheduleReconnect { attempt, delay } => {
                info!(
                    "[STREAM] Reconnecting in {}ms (attempt {}/{})",
                    delay.as_millis(),
                    attempt,
                    self.machine.policy().max_attempts
                );
                self.pending_reconnect = Some(Box::pin(sleep(delay)));
                None
            }
            Directive::CancelReconnect => {
                if self.pending_reconnect.take().is_some() {
                    debug!("[STREAM] Pending reconnect cancelled");
                }
                None
            }
            Directive::ClearObservers => {
                self.clear_observers();
                None
            }
            Directive::NotifyOpened => {
                let url = self.session_url.clone().unwrap_or_default();
                info!("[STREAM] Connected to {}", url);
                call_hook("on_open", &self.hooks.on_open, url.as_str());
                None
            }
            Directive::GiveUp { attempts } => {
                error!("[STREAM] Giving up after {} reconnect attempts", attempts);
                self.report(StreamError::ExhaustedRetries { attempts });
                None
            }
        }
    }

    async fn open_channel(&mut self) -> Option<SessionEvent> {
        // At most one live channel
        self.release_channel().await;

        let url = self
            .session_url
            .clone()
            .unwrap_or_else(|| self.config.endpoint.url());
        self.next_channel_id += 1;
        let sink = SignalSink::new(ChannelId(self.next_channel_id), self.signal_tx.clone());

        debug!(
            "[STREAM] Opening channel {} to {} via {}",
            sink.id(),
            url,
            self.connector.name()
        );

        match self.connector.open(&url, sink) {
            Ok(channel) => {
                self.channel = Some(channel);
                None
            }
            Err(e) => {
                warn!("[STREAM] Failed to open channel to {}: {}", url, e);
                self.report(StreamError::Connect(e));
                Some(SessionEvent::ChannelLost)
            }
        }
    }

    async fn release_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            debug!("[STREAM] Releasing channel {}", channel.id());
            channel.close().await;
        }
    }

    fn clear_observers(&self) {
        let mut registry = self.registry.lock();
        let removed = match self.clear_mark {
            Some(mark) => registry.clear_before(mark),
            None => {
                let count = registry.len();
                registry.clear();
                count
            }
        };
        debug!("[STREAM] Cleared {} observers", removed);
    }

    fn publish(&self, state: ConnectionState) {
        let open = state == ConnectionState::Open
            && self.channel.as_ref().is_some_and(|channel| channel.is_open());
        self.connected.store(open, Ordering::SeqCst);
        self.attempts.store(self.machine.attempts(), Ordering::SeqCst);
        self.state_tx.send_replace(state);
    }
}

/// Resolves when the pending reconnect timer fires; never without one
async fn reconnect_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}
