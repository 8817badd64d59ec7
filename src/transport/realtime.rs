//! WebSocket adapter for the realtime conversation endpoint
//!
//! Owns the connection lifecycle: handshake with session negotiation,
//! a background receive task that parses and forwards server events,
//! and clean teardown. The whole handshake (socket open,
//! `session.created`, configuration, `session.updated`) runs under a
//! single bounded timeout; past it the attempt is failed and closed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use super::protocol::{ClientFrame, ServerEvent, SessionConfig, REALTIME_API_URL};
use super::{Credentials, DuplexConversationTransport, TransportError, TransportEvent};

/// Hard bound on the complete handshake (connect through session ack)
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

type WsWrite =
    futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsRead = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct ActiveSession {
    write: WsWrite,
    session_id: String,
    receiver_task: tokio::task::JoinHandle<()>,
    shutdown: CancellationToken,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        // Ensure the receive task dies even without an explicit disconnect
        self.receiver_task.abort();
    }
}

/// Duplex transport over a tokio-tungstenite WebSocket.
pub struct RealtimeTransport {
    url: String,
    session_config: SessionConfig,
    inner: Mutex<Option<ActiveSession>>,
    open: Arc<AtomicBool>,
    /// Monotonic sequence for outgoing frames, stamped as `event_id`
    sequence: AtomicU64,
}

impl RealtimeTransport {
    pub fn new(session_config: SessionConfig) -> Self {
        Self::with_url(REALTIME_API_URL, session_config)
    }

    pub fn with_url(url: impl Into<String>, session_config: SessionConfig) -> Self {
        Self {
            url: url.into(),
            session_config,
            inner: Mutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
            sequence: AtomicU64::new(0),
        }
    }

    /// Single handshake attempt, no outer timeout.
    async fn try_connect(
        &self,
        credentials: &Credentials,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::NetworkFailed(e.to_string()))?;

        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", credentials.api_key))
                .map_err(|e| TransportError::AuthFailed(e.to_string()))?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        log::info!("Connecting to conversation endpoint...");

        let (ws_stream, _response) = connect_async_with_config(
            request, None, false, // disable_nagle (we want low latency)
        )
        .await
        .map_err(|e| match e {
            WsError::Http(response) if response.status().as_u16() == 401 => {
                TransportError::AuthFailed("endpoint rejected credentials".to_string())
            }
            WsError::Http(response) if response.status().as_u16() == 403 => {
                TransportError::AuthFailed("endpoint refused access".to_string())
            }
            other => TransportError::NetworkFailed(other.to_string()),
        })?;

        log::info!("Channel open, waiting for session negotiation...");

        let (mut write, mut read) = ws_stream.split();

        // Session negotiation: the remote announces the session first
        let session_id = wait_for_session_created(&mut read).await?;
        log::info!("Session created: {}", session_id);

        // Push our configuration and wait for the ack
        let config_frame = ClientFrame::session_update(self.session_config.clone());
        let json = serde_json::to_string(&config_frame)
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        write
            .send(Message::Text(json))
            .await
            .map_err(|e| TransportError::NetworkFailed(e.to_string()))?;

        wait_for_session_updated(&mut read).await?;
        log::info!("Session configured");

        // Hand the read half to the background receive task
        let shutdown = CancellationToken::new();
        let receiver_task = tokio::spawn(run_receiver(
            read,
            events,
            self.open.clone(),
            shutdown.clone(),
        ));

        let mut guard = self.inner.lock().await;
        *guard = Some(ActiveSession {
            write,
            session_id,
            receiver_task,
            shutdown,
        });
        self.open.store(true, Ordering::SeqCst);

        Ok(())
    }
}

#[async_trait::async_trait]
impl DuplexConversationTransport for RealtimeTransport {
    async fn connect(
        &self,
        credentials: &Credentials,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        // One session per controller: tear down any prior channel first
        self.disconnect().await;

        match timeout(HANDSHAKE_TIMEOUT, self.try_connect(credentials, events)).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "Handshake did not complete within {:?}, closing attempt",
                    HANDSHAKE_TIMEOUT
                );
                self.disconnect().await;
                Err(TransportError::Timeout)
            }
        }
    }

    async fn send(&self, frame: ClientFrame) {
        let mut guard = self.inner.lock().await;

        let session = match guard.as_mut() {
            Some(session) if self.open.load(Ordering::SeqCst) => session,
            _ => {
                log::debug!("Channel not open, dropping {} frame", frame.kind());
                return;
            }
        };

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut value = match serde_json::to_value(&frame) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Failed to serialize {} frame: {}", frame.kind(), e);
                return;
            }
        };
        if let Some(object) = value.as_object_mut() {
            object.insert(
                "event_id".to_string(),
                serde_json::Value::String(format!("evt_{}", sequence)),
            );
        }

        if let Err(e) = session.write.send(Message::Text(value.to_string())).await {
            log::warn!("Send of {} frame failed: {}", frame.kind(), e);
            self.open.store(false, Ordering::SeqCst);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(mut session) = guard.take() {
            self.open.store(false, Ordering::SeqCst);
            session.shutdown.cancel();

            if let Err(e) = session.write.close().await {
                log::debug!("Error closing channel: {}", e);
            }
            log::info!("Disconnected (session {})", session.session_id);
        }
    }
}

async fn wait_for_session_created(read: &mut WsRead) -> Result<String, TransportError> {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(ServerEvent::SessionCreated { session }) => return Ok(session.id),
                Ok(ServerEvent::Error { error }) => {
                    return Err(TransportError::AuthFailed(error.message));
                }
                Ok(_) => {
                    log::debug!("Ignoring event while waiting for session.created");
                }
                Err(e) => {
                    log::warn!("Failed to parse handshake message: {}", e);
                }
            },
            Ok(Message::Close(_)) => {
                return Err(TransportError::Disconnected(
                    "closed before session created".to_string(),
                ));
            }
            Err(e) => return Err(TransportError::NetworkFailed(e.to_string())),
            _ => {} // Ignore ping/pong/binary
        }
    }
    Err(TransportError::Disconnected("stream ended".to_string()))
}

async fn wait_for_session_updated(read: &mut WsRead) -> Result<(), TransportError> {
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(ServerEvent::SessionUpdated { .. }) => return Ok(()),
                Ok(ServerEvent::Error { error }) => {
                    return Err(TransportError::ProtocolError(error.message));
                }
                Ok(_) => {
                    log::debug!("Ignoring event while waiting for session.updated");
                }
                Err(e) => {
                    log::warn!("Failed to parse handshake message: {}", e);
                }
            },
            Ok(Message::Close(_)) => {
                return Err(TransportError::Disconnected(
                    "closed during configuration".to_string(),
                ));
            }
            Err(e) => return Err(TransportError::NetworkFailed(e.to_string())),
            _ => {}
        }
    }
    Err(TransportError::Disconnected("stream ended".to_string()))
}

/// Parses incoming messages and forwards them in receipt order until
/// the channel closes or the session shuts down.
async fn run_receiver(
    mut read: WsRead,
    events: mpsc::Sender<TransportEvent>,
    open: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                log::debug!("Receiver task shutting down");
                break;
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(ServerEvent::Unknown) => {
                            log::debug!("Ignoring unknown event type");
                        }
                        Ok(event) => {
                            if events.send(TransportEvent::Server(event)).await.is_err() {
                                log::debug!("Event consumer gone, receiver exiting");
                                break;
                            }
                        }
                        Err(e) => {
                            log::warn!("Failed to parse server event: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    open.store(false, Ordering::SeqCst);
                    log::info!("Channel closed by remote");
                    let _ = events
                        .send(TransportEvent::ConnectionLost("closed by remote".to_string()))
                        .await;
                    break;
                }
                Some(Err(e)) => {
                    open.store(false, Ordering::SeqCst);
                    log::warn!("Channel error: {}", e);
                    let _ = events
                        .send(TransportEvent::ConnectionLost(e.to_string()))
                        .await;
                    break;
                }
                _ => {} // Ignore ping/pong/binary
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_before_connect_is_a_no_op() {
        let transport = RealtimeTransport::new(SessionConfig::default());
        assert!(!transport.is_open());

        // Must not panic or error
        transport.send(ClientFrame::AudioCommit).await;
        transport.send(ClientFrame::audio_append("AAAA".into())).await;
    }

    #[tokio::test]
    async fn test_disconnect_when_closed_is_safe() {
        let transport = RealtimeTransport::new(SessionConfig::default());
        transport.disconnect().await;
        transport.disconnect().await;
        assert!(!transport.is_open());
    }

    #[tokio::test]
    #[ignore] // Requires network and a valid API key
    async fn test_realtime_handshake() {
        let credentials = Credentials::from_env().expect("OPENAI_API_KEY required");
        let transport = RealtimeTransport::new(SessionConfig::default());
        let (tx, _rx) = mpsc::channel(64);

        transport
            .connect(&credentials, tx)
            .await
            .expect("handshake failed");
        assert!(transport.is_open());

        transport.disconnect().await;
        assert!(!transport.is_open());
    }
}
