use std::time::Duration;

use async_trait::async_trait;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{net::TcpStream, sync::Mutex, time::sleep};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// One inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message { kind: MessageKind, bytes: Vec<u8> },
    Close(Option<String>),
    /// Ping, pong and raw frames.
    Control,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed dialing to '{url}': {source}")]
    Dial {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("invalid header '{0}'")]
    Header(String),
    #[error("not connected")]
    NotConnected,
    #[error("websocket closed by server, reason: '{0}'")]
    ClosedByServer(String),
    #[error("connection closed")]
    Closed,
    #[error("websocket error: {0}")]
    Websocket(#[from] tungstenite::Error),
}

/// A bidirectional message channel to the notification server.
///
/// All methods take `&self`: reads and pings run concurrently on the same
/// connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, headers: &[(String, String)]) -> Result<(), TransportError>;
    async fn read_message(&self) -> Result<Frame, TransportError>;
    async fn write_ping(&self) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

/// Websocket transport over tokio-tungstenite.
///
/// A dial rejected during the handshake flips the scheme between `ws` and
/// `wss` before the next attempt; the flipped URL is kept for later dials.
pub struct WebsocketTransport {
    url: Mutex<String>,
    writer: Mutex<Option<SplitSink<WsStream, Message>>>,
    reader: Mutex<Option<SplitStream<WsStream>>>,
    dial_retries: u32,
    dial_retry_delay: Duration,
}

impl WebsocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Mutex::new(url.into()),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            dial_retries: 2,
            dial_retry_delay: Duration::from_secs(5),
        }
    }

    /// Extra dial attempts made inside one `connect` call.
    pub fn with_dial_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.dial_retries = retries;
        self.dial_retry_delay = delay;
        self
    }

    pub async fn url(&self) -> String {
        self.url.lock().await.clone()
    }

    async fn dial(url: &str, headers: &[(String, String)]) -> Result<WsStream, TransportError> {
        let mut request = url.into_client_request()?;
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::Header(name.clone()))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| TransportError::Header(name.to_string()))?;
            request.headers_mut().insert(name, value);
        }
        let (ws, _) = connect_async(request)
            .await
            .map_err(|source| TransportError::Dial {
                url: url.to_string(),
                source,
            })?;
        Ok(ws)
    }
}

#[async_trait]
impl Transport for WebsocketTransport {
    async fn connect(&self, headers: &[(String, String)]) -> Result<(), TransportError> {
        let mut url = self.url.lock().await;
        let mut attempt = 0;
        loop {
            info!(url = %*url, attempt, "connecting websocket");
            match Self::dial(&url, headers).await {
                Ok(ws) => {
                    let (writer, reader) = ws.split();
                    *self.writer.lock().await = Some(writer);
                    *self.reader.lock().await = Some(reader);
                    return Ok(());
                }
                Err(e) if attempt < self.dial_retries => {
                    attempt += 1;
                    if is_handshake_rejection(&e) {
                        let flipped = flip_scheme(&url);
                        warn!(from = %*url, to = %flipped, "handshake rejected; switching scheme");
                        *url = flipped;
                    }
                    warn!(error = %e, attempt, "dial failed; retrying in {:?}", self.dial_retry_delay);
                    sleep(self.dial_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_message(&self) -> Result<Frame, TransportError> {
        let mut reader = self.reader.lock().await;
        let stream = reader.as_mut().ok_or(TransportError::NotConnected)?;
        match stream.next().await {
            Some(Ok(Message::Text(text))) => Ok(Frame::Message {
                kind: MessageKind::Text,
                bytes: text.into_bytes(),
            }),
            Some(Ok(Message::Binary(bytes))) => Ok(Frame::Message {
                kind: MessageKind::Binary,
                bytes,
            }),
            Some(Ok(Message::Close(frame))) => {
                Ok(Frame::Close(frame.map(|f| f.reason.to_string())))
            }
            Some(Ok(_)) => Ok(Frame::Control),
            Some(Err(e)) => Err(e.into()),
            None => Err(TransportError::Closed),
        }
    }

    async fn write_ping(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.reader.lock().await.take();
        match self.writer.lock().await.take() {
            Some(mut sink) => sink.close().await.map_err(Into::into),
            None => Ok(()),
        }
    }
}

fn is_handshake_rejection(err: &TransportError) -> bool {
    matches!(
        err,
        TransportError::Dial {
            source: tungstenite::Error::Http(_),
            ..
        }
    )
}

/// Swap `ws://` and `wss://`; other URLs are returned unchanged.
pub fn flip_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("wss://") {
        format!("ws://{rest}")
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("wss://{rest}")
    } else {
        url.to_string()
    }
}
