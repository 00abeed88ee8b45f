//! Individual subscriber session handling

use std::net::SocketAddr;
use std::time::Duration;

use alarm_stream_shared::{defaults, now_ms};
use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

pub type SessionId = u64;

/// How long to wait for the client's close reply
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Frames buffered per subscriber before it counts as stalled
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Handle to push frames to one subscriber
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub addr: SocketAddr,
    pub connected_at_ms: u64,
    outbound: mpsc::Sender<Message>,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        addr: SocketAddr,
        outbound: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            id,
            addr,
            connected_at_ms: now_ms(),
            outbound,
        }
    }

    /// Queue a text frame for this subscriber without waiting
    ///
    /// Fails when the session is gone or its queue is full.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.outbound
            .try_send(Message::Text(text.into()))
            .map_err(|e| match e {
                TrySendError::Full(_) => anyhow!("session {} is not draining its queue", self.id),
                TrySendError::Closed(_) => anyhow!("session {} is closed", self.id),
            })
    }
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed or dropped the connection
    ClientClosed,
    /// The client sent data and was disconnected
    Rejected,
    /// The hub stopped feeding the session
    HubClosed,
}

/// Active subscriber session
pub struct AlarmSession {
    handle: SessionHandle,
    ws: WebSocketStream<TcpStream>,
    outbound_rx: mpsc::Receiver<Message>,
}

impl AlarmSession {
    /// Complete the WebSocket handshake, answering 404 for any other path
    pub async fn accept(
        stream: TcpStream,
        addr: SocketAddr,
        id: SessionId,
        path: &str,
    ) -> Result<Self> {
        let expected = path.to_string();
        let callback = move |request: &Request, response: Response| {
            if request.uri().path() == expected {
                Ok(response)
            } else {
                let mut rejection: ErrorResponse =
                    ErrorResponse::new(Some(format!("no endpoint at {}", request.uri().path())));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        Ok(Self {
            handle: SessionHandle::new(id, addr, outbound_tx),
            ws,
            outbound_rx,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Pump queued frames to the client until the session ends
    pub async fn run(self) -> Result<SessionEnd> {
        let AlarmSession {
            handle,
            ws,
            mut outbound_rx,
        } = self;
        // Only the manager's handles keep the session fed
        let SessionHandle { id, addr, .. } = handle;
        let (mut writer, mut reader) = ws.split();

        loop {
            tokio::select! {
                outgoing = outbound_rx.recv() => match outgoing {
                    Some(message) => writer.send(message).await?,
                    None => {
                        let _ = writer.send(Message::Close(None)).await;
                        return Ok(SessionEnd::HubClosed);
                    }
                },

                incoming = reader.next() => match incoming {
                    Some(Ok(Message::Text(_))) | Some(Ok(Message::Binary(_))) => {
                        warn!(
                            "[HUB] Session {} ({}) sent data to a push-only endpoint, closing",
                            id, addr
                        );
                        writer
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(defaults::PUSH_ONLY_CLOSE_CODE),
                                reason: defaults::PUSH_ONLY_CLOSE_REASON.into(),
                            })))
                            .await?;
                        // Wait for the client's close reply
                        let drain = async { while let Some(Ok(_)) = reader.next().await {} };
                        let _ = tokio::time::timeout(CLOSE_DRAIN_TIMEOUT, drain).await;
                        return Ok(SessionEnd::Rejected);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("[HUB] Session {} closed by client: {:?}", id, frame);
                        return Ok(SessionEnd::ClientClosed);
                    }
                    // Ping/pong are answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(SessionEnd::ClientClosed),
                }
            }
        }
    }
}
