//! Accept loop and broadcast feed for the alarm endpoint

use std::net::SocketAddr;
use std::sync::Arc;

use alarm_stream_shared::now_ms;
use anyhow::Result;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::session::{AlarmSession, SessionManager};

pub struct Hub {
    config: HubConfig,
    sessions: Arc<SessionManager>,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(SessionManager::new()),
        }
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(
            "[HUB] Listening on {} at {}",
            listener.local_addr()?,
            self.config.path
        );
        Ok(listener)
    }

    /// Accept subscribers until the listener fails
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            let sessions = self.sessions.clone();
            let path = self.config.path.clone();
            tokio::spawn(async move {
                handle_connection(stream, addr, &path, sessions).await;
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    path: &str,
    sessions: Arc<SessionManager>,
) {
    let id = sessions.next_id();
    let session = match AlarmSession::accept(stream, addr, id, path).await {
        Ok(session) => session,
        Err(e) => {
            warn!("[HUB] Handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let handle = session.handle();
    let connected_at_ms = handle.connected_at_ms;
    let count = sessions.register(handle).await;
    info!("[HUB] Session {} opened from {}, {} connected", id, addr, count);

    let end = session.run().await;
    let count = sessions.unregister(id).await;
    let lifetime_ms = now_ms().saturating_sub(connected_at_ms);
    match end {
        Ok(end) => info!(
            "[HUB] Session {} ended after {}ms ({:?}), {} connected",
            id, lifetime_ms, end, count
        ),
        Err(e) => warn!(
            "[HUB] Session {} failed after {}ms: {}, {} connected",
            id, lifetime_ms, e, count
        ),
    }
}

/// Broadcast every valid JSON line of `input`; returns how many were sent
pub async fn feed_lines<R>(input: R, sessions: &SessionManager) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut sent = 0;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Err(e) = serde_json::from_str::<Value>(line) {
            warn!("[HUB] Rejecting invalid alarm line: {}", e);
            continue;
        }

        let report = sessions.broadcast(line).await;
        debug!(
            "[HUB] Broadcast to {} sessions ({} failed)",
            report.delivered,
            report.failed.len()
        );
        sent += 1;
    }

    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionHandle;
    use alarm_stream_shared::defaults;
    use futures::{SinkExt, StreamExt};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::protocol::Message;

    async fn start_hub() -> (Arc<SessionManager>, SocketAddr) {
        let hub = Hub::new(HubConfig {
            bind: "127.0.0.1:0".into(),
            ..Default::default()
        });
        let listener = hub.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sessions = hub.sessions();
        tokio::spawn(async move { hub.serve(listener).await });
        (sessions, addr)
    }

    async fn wait_for_count(sessions: &SessionManager, expected: usize) {
        timeout(Duration::from_secs(5), async {
            while sessions.connection_count().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session count never reached");
    }

    #[tokio::test]
    async fn test_feed_skips_invalid_lines() {
        let sessions = SessionManager::new();
        let (tx, mut rx) = mpsc::channel(8);
        let addr = "127.0.0.1:40000".parse().unwrap();
        sessions.register(SessionHandle::new(1, addr, tx)).await;

        let input: &[u8] = b"{\"type\":\"alarm\",\"id\":1}\n\nnot json\n  {\"id\":2}  \n";
        let sent = feed_lines(input, &sessions).await.unwrap();

        assert_eq!(sent, 2);
        assert_eq!(
            rx.try_recv().unwrap(),
            Message::Text(r#"{"type":"alarm","id":1}"#.into())
        );
        assert_eq!(rx.try_recv().unwrap(), Message::Text(r#"{"id":2}"#.into()));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscriber_receives_broadcast() {
        let (sessions, addr) = start_hub().await;
        let url = format!("ws://{}{}", addr, defaults::ALARM_CHANNEL_PATH);
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        wait_for_count(&sessions, 1).await;

        let report = sessions.broadcast(r#"{"type":"alarm","id":7}"#).await;
        assert_eq!(report.delivered, 1);

        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message, Message::Text(r#"{"type":"alarm","id":7}"#.into()));

        ws.close(None).await.unwrap();
        wait_for_count(&sessions, 0).await;
    }

    #[tokio::test]
    async fn test_client_message_closes_session() {
        let (sessions, addr) = start_hub().await;
        let url = format!("ws://{}{}", addr, defaults::ALARM_CHANNEL_PATH);
        let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        wait_for_count(&sessions, 1).await;

        ws.send(Message::Text("hello".into())).await.unwrap();

        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match message {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), defaults::PUSH_ONLY_CLOSE_CODE);
                assert_eq!(frame.reason.as_str(), defaults::PUSH_ONLY_CLOSE_REASON);
            }
            other => panic!("expected close frame, got {:?}", other),
        }
        wait_for_count(&sessions, 0).await;
    }

    #[tokio::test]
    async fn test_unknown_path_is_rejected() {
        let (sessions, addr) = start_hub().await;
        let url = format!("ws://{}/somewhere/else", addr);

        assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());
        assert_eq!(sessions.connection_count().await, 0);
    }
}
