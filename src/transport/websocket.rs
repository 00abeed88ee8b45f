//! WebSocket transport built on tokio-tungstenite

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alarm_stream_shared::{defaults, Frame};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use crate::error::ChannelError;
use crate::transport::traits::{ChannelConnector, ChannelId, CloseReason, EventChannel, SignalSink};

/// Opens WebSocket channels
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
    close_timeout: Duration,
}

impl Default for WebSocketConnector {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            Duration::from_millis(defaults::CLOSE_TIMEOUT_MS),
        )
    }
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration, close_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            close_timeout,
        }
    }
}

impl ChannelConnector for WebSocketConnector {
    fn open(&self, url: &str, sink: SignalSink) -> Result<Box<dyn EventChannel>, ChannelError> {
        let request = url
            .into_client_request()
            .map_err(|e| ChannelError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let open = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(run_channel(
            request,
            url.to_string(),
            self.connect_timeout,
            sink.clone(),
            outbound_rx,
            shutdown_rx,
            open.clone(),
        ));

        Ok(Box::new(WebSocketChannel {
            id: sink.id(),
            sink,
            outbound_tx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
            open,
            close_timeout: self.close_timeout,
        }))
    }

    fn name(&self) -> &'static str {
        "WebSocket"
    }
}

/// Handle to one WebSocket connection task
pub struct WebSocketChannel {
    id: ChannelId,
    sink: SignalSink,
    outbound_tx: mpsc::UnboundedSender<Frame>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    open: Arc<AtomicBool>,
    close_timeout: Duration,
}

#[async_trait]
impl EventChannel for WebSocketChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        self.outbound_tx
            .send(frame)
            .map_err(|_| ChannelError::Closed)
    }

    async fn close(&mut self) {
        if let Some(shutdown) = self.shutdown_tx.take() {
            let _ = shutdown.send(());
        }

        if let Some(mut task) = self.task.take() {
            if timeout(self.close_timeout, &mut task).await.is_err() {
                warn!(
                    "[WS] Channel {} did not close within {:?}, aborting",
                    self.id, self.close_timeout
                );
                task.abort();
            }
        }

        self.open.store(false, Ordering::SeqCst);
        // No-op when the task already reported its terminal signal
        self.sink.closed(CloseReason::local());
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Connection task: handshake, then pump frames until closed
async fn run_channel(
    request: Request,
    url: String,
    connect_timeout: Duration,
    sink: SignalSink,
    mut outbound_rx: mpsc::UnboundedReceiver<Frame>,
    mut shutdown_rx: oneshot::Receiver<()>,
    open: Arc<AtomicBool>,
) {
    let ws = tokio::select! {
        _ = &mut shutdown_rx => {
            sink.closed(CloseReason::local());
            return;
        }
        result = timeout(connect_timeout, tokio_tungstenite::connect_async(request)) => match result {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(e)) => {
                sink.error(ChannelError::Connect { url, reason: e.to_string() });
                return;
            }
            Err(_) => {
                sink.error(ChannelError::Timeout {
                    url,
                    timeout_ms: connect_timeout.as_millis() as u64,
                });
                return;
            }
        }
    };

    debug!("[WS] Channel {} connected to {}", sink.id(), url);
    open.store(true, Ordering::SeqCst);
    sink.opened();

    let (mut writer, mut reader) = ws.split();

    let reason = loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                if let Err(e) = writer.send(Message::Close(None)).await {
                    debug!("[WS] Close frame not sent on {}: {}", sink.id(), e);
                }
                break CloseReason::local();
            }

            Some(frame) = outbound_rx.recv() => {
                let message = match frame {
                    Frame::Text(text) => Message::Text(text.into()),
                    Frame::Binary(bytes) => Message::Binary(bytes),
                };
                if let Err(e) = writer.send(message).await {
                    open.store(false, Ordering::SeqCst);
                    sink.error(ChannelError::Transport(e.to_string()));
                    return;
                }
            }

            message = reader.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    sink.frame(Frame::Text(text.as_str().to_string()));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    sink.frame(Frame::Binary(bytes));
                }
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => CloseReason::remote(
                            Some(u16::from(frame.code)),
                            frame.reason.as_str(),
                        ),
                        None => CloseReason::remote(None, "server closed connection"),
                    };
                }
                // Ping/pong are answered by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    open.store(false, Ordering::SeqCst);
                    sink.error(ChannelError::Transport(e.to_string()));
                    return;
                }
                None => break CloseReason::remote(None, "stream ended"),
            }
        }
    };

    open.store(false, Ordering::SeqCst);
    sink.closed(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::traits::{ChannelMessage, ChannelSignal};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    fn sink(id: u64) -> (SignalSink, mpsc::UnboundedReceiver<ChannelMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SignalSink::new(ChannelId(id), tx), rx)
    }

    async fn next_signal(rx: &mut mpsc::UnboundedReceiver<ChannelMessage>) -> ChannelSignal {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("signal timed out")
            .expect("sink dropped")
            .signal
    }

    #[test]
    fn test_connector_name() {
        assert_eq!(WebSocketConnector::default().name(), "WebSocket");
    }

    #[tokio::test]
    async fn test_invalid_url_fails_synchronously() {
        let (sink, _rx) = sink(1);
        let result = WebSocketConnector::default().open("not a url", sink);
        assert!(matches!(result, Err(ChannelError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_refused_connection_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (sink, mut rx) = sink(2);
        let _channel = WebSocketConnector::default()
            .open(&format!("ws://{}/channel/analysis/alarm", addr), sink)
            .expect("open should not fail synchronously");

        assert!(matches!(
            next_signal(&mut rx).await,
            ChannelSignal::Error(ChannelError::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_receives_frames_and_remote_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(r#"{"type":"alarm","id":1}"#.into()))
                .await
                .unwrap();
            ws.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "restarting".into(),
            })))
            .await
            .unwrap();
            // Drain until the client acknowledges the close
            while let Some(Ok(_)) = ws.next().await {}
        });

        let (sink, mut rx) = sink(3);
        let mut channel = WebSocketConnector::default()
            .open(&format!("ws://{}/channel/analysis/alarm", addr), sink)
            .unwrap();

        assert_eq!(next_signal(&mut rx).await, ChannelSignal::Opened);
        assert_eq!(
            next_signal(&mut rx).await,
            ChannelSignal::Frame(Frame::from(r#"{"type":"alarm","id":1}"#))
        );
        assert_eq!(
            next_signal(&mut rx).await,
            ChannelSignal::Closed(CloseReason::remote(Some(1001), "restarting"))
        );

        channel.close().await;
        assert!(!channel.is_open());
        assert!(rx.try_recv().is_err(), "no signal after the terminal one");
    }

    #[tokio::test]
    async fn test_local_close_and_send() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, mut received_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                let _ = received_tx.send(message);
            }
        });

        let (sink, mut rx) = sink(4);
        let mut channel = WebSocketConnector::default()
            .open(&format!("ws://{}/", addr), sink)
            .unwrap();

        assert_eq!(channel.send(Frame::from("early")), Err(ChannelError::NotOpen));
        assert_eq!(next_signal(&mut rx).await, ChannelSignal::Opened);
        assert!(channel.is_open());

        channel.send(Frame::from("ping")).unwrap();
        let echoed = timeout(Duration::from_secs(5), received_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, Message::Text("ping".into()));

        channel.close().await;
        assert_eq!(
            next_signal(&mut rx).await,
            ChannelSignal::Closed(CloseReason::local())
        );
        assert_eq!(channel.send(Frame::from("late")), Err(ChannelError::NotOpen));
    }

    #[tokio::test]
    async fn test_stalled_handshake_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            // Hold the TCP connection but never answer the upgrade
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let connector =
            WebSocketConnector::new(Duration::from_millis(200), Duration::from_millis(200));
        let (sink, mut rx) = sink(5);
        let started = tokio::time::Instant::now();
        let mut channel = connector
            .open(&format!("ws://{}/channel/analysis/alarm", addr), sink)
            .unwrap();

        match next_signal(&mut rx).await {
            ChannelSignal::Error(ChannelError::Timeout { timeout_ms, .. }) => {
                assert_eq!(timeout_ms, 200);
            }
            other => panic!("expected a handshake timeout, got {:?}", other),
        }
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(!channel.is_open());

        channel.close().await;
        assert!(rx.try_recv().is_err(), "no signal after the terminal one");
    }

    #[tokio::test]
    async fn test_close_completes_when_peer_never_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Upgrade, then never read again
            let _ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            std::future::pending::<()>().await;
        });

        let close_timeout = Duration::from_millis(300);
        let connector = WebSocketConnector::new(Duration::from_secs(5), close_timeout);
        let (sink, mut rx) = sink(6);
        let mut channel = connector
            .open(&format!("ws://{}/channel/analysis/alarm", addr), sink)
            .unwrap();
        assert_eq!(next_signal(&mut rx).await, ChannelSignal::Opened);

        let started = tokio::time::Instant::now();
        channel.close().await;

        assert!(started.elapsed() < close_timeout + Duration::from_millis(500));
        assert!(!channel.is_open());
        assert_eq!(
            next_signal(&mut rx).await,
            ChannelSignal::Closed(CloseReason::local())
        );
    }
}
