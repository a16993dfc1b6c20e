//! WebSocket link to the sync server.
//!
//! One WebSocket per document session. The handshake carries the bearer
//! credential plus the document and session ids as headers; the server answers
//! 401/403 to refuse the credential. After the upgrade every frame is a
//! bincode-encoded `ClientMessage`/`ServerMessage`.
//!
//! Plain `ws://` only; terminate TLS in front of the sync server.

use async_trait::async_trait;
use collab_core::protocol::{ClientMessage, ServerMessage, MAX_MESSAGE_SIZE};
use collab_core::transport::{ConnectRequest, ProviderLink, Result, SyncProvider, TransportError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

pub const DOCUMENT_HEADER: &str = "x-collab-document";
pub const SESSION_HEADER: &str = "x-collab-session";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Inbox = mpsc::UnboundedReceiver<Result<ServerMessage>>;

/// Connects to a sync server over WebSocket.
#[derive(Debug, Clone)]
pub struct WsProvider {
    url: String,
}

impl WsProvider {
    /// `url` is the server's sync endpoint, e.g. `ws://127.0.0.1:8080/sync`.
    ///
    /// `wss://` URLs are refused at connect time.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn header(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| TransportError::ConnectionFailed(format!("Invalid header value: {}", e)))
}

#[async_trait]
impl SyncProvider for WsProvider {
    async fn connect(&self, request: &ConnectRequest) -> Result<Box<dyn ProviderLink>> {
        let mut upgrade = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        if upgrade.uri().scheme_str() == Some("wss") {
            return Err(TransportError::ConnectionFailed(format!(
                "TLS is not supported for {}; use a ws:// URL",
                self.url
            )));
        }
        let headers = upgrade.headers_mut();
        headers.insert(
            AUTHORIZATION,
            header(&format!("Bearer {}", request.credential.token()))?,
        );
        headers.insert(DOCUMENT_HEADER, header(&request.document_id)?);
        headers.insert(SESSION_HEADER, header(&request.session.to_string())?);

        let (ws_stream, _) = connect_async(upgrade).await.map_err(|e| match e {
            WsError::Http(response)
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
            {
                TransportError::AuthRejected(format!("HTTP {}", response.status()))
            }
            other => TransportError::ConnectionFailed(other.to_string()),
        })?;
        info!(
            "Connected to {} for {} (session {})",
            self.url, request.document_id, request.session
        );

        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let label = format!("{}/{}", self.url, request.document_id);
        let read_task = tokio::spawn(read_loop(label, read, tx));

        Ok(Box::new(WsLink {
            write: Mutex::new(write),
            inbox: Mutex::new(rx),
            read_task,
        }))
    }
}

/// Read loop that decodes frames into the link's inbox.
async fn read_loop(
    label: String,
    mut read: SplitStream<WsStream>,
    inbox: mpsc::UnboundedSender<Result<ServerMessage>>,
) {
    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                let data = match msg {
                    Message::Binary(data) => data.to_vec(),
                    Message::Text(text) => text.to_string().into_bytes(),
                    Message::Ping(_) | Message::Pong(_) => continue,
                    Message::Close(_) => {
                        debug!("Received close frame from {}", label);
                        break;
                    }
                    Message::Frame(_) => continue,
                };

                if data.len() > MAX_MESSAGE_SIZE {
                    warn!(
                        "Message from {} exceeds max size ({} > {}), dropping",
                        label,
                        data.len(),
                        MAX_MESSAGE_SIZE
                    );
                    continue;
                }

                match ServerMessage::decode(&data) {
                    Ok(message) => {
                        if inbox.send(Ok(message)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Undecodable message from {}: {}", label, e),
                }
            }
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Connection {} closed", label);
                    }
                    _ => {
                        error!("WebSocket error on {}: {}", label, e);
                        let _ = inbox.send(Err(TransportError::ReceiveFailed(e.to_string())));
                    }
                }
                break;
            }
            None => {
                debug!("Connection {} stream ended", label);
                break;
            }
        }
    }
}

/// Established WebSocket link.
pub struct WsLink {
    write: Mutex<SplitSink<WsStream, Message>>,
    inbox: Mutex<Inbox>,
    read_task: JoinHandle<()>,
}

#[async_trait]
impl ProviderLink for WsLink {
    async fn send(&self, message: ClientMessage) -> Result<()> {
        let data = message
            .encode()
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.write
            .lock()
            .await
            .send(Message::Binary(data.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Result<ServerMessage> {
        match self.inbox.lock().await.recv().await {
            Some(result) => result,
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<()> {
        let _ = self.write.lock().await.send(Message::Close(None)).await;
        self.read_task.abort();
        Ok(())
    }
}

impl Drop for WsLink {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}
