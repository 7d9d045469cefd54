//! Streaming transport.
//!
//! A [`StreamConnector`] opens one session: an outbound sender of
//! [`ClientMessage`]s and an inbound receiver of [`ServerMessage`]s. The
//! inbound channel closing means the session dropped. The connection
//! manager only ever sees this seam, so tests substitute an in-memory
//! connector for the WebSocket one.

use std::time::Duration;

use async_trait::async_trait;
use brand_audit_protocol::ClientMessage;
use brand_audit_protocol::ServerMessage;
use futures::SinkExt;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;
use url::Url;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid stream url: {0}")]
    InvalidUrl(String),

    #[error("failed to connect: {0}")]
    Connect(String),

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("stream closed")]
    Closed,
}

/// One live streaming session. Dropping it tears the session down.
#[derive(Debug)]
pub struct StreamSession {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    inbound: mpsc::UnboundedReceiver<ServerMessage>,
    _guard: Option<DropGuard>,
}

impl StreamSession {
    pub fn new(
        outbound: mpsc::UnboundedSender<ClientMessage>,
        inbound: mpsc::UnboundedReceiver<ServerMessage>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            _guard: None,
        }
    }

    /// Cancels `guard`'s token when the session is dropped.
    pub fn with_guard(mut self, guard: DropGuard) -> Self {
        self._guard = Some(guard);
        self
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    /// `None` once the session has dropped.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.inbound.recv().await
    }
}

#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self) -> Result<StreamSession, TransportError>;
}

/// WebSocket connector. Frames are JSON text `{"type": ..., "data": ...}`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Result<Self, TransportError> {
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(TransportError::InvalidUrl(format!(
                "{url}: unsupported scheme '{other}'"
            ))),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self) -> Result<StreamSession, TransportError> {
        let (socket, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(url = %self.url, "websocket connected");

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    message = out_rx.recv() => {
                        let Some(message) = message else { break };
                        let text = match serde_json::to_string(&message) {
                            Ok(text) => text,
                            Err(err) => {
                                tracing::warn!("failed to encode stream message: {err}");
                                continue;
                            }
                        };
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            tracing::debug!("websocket write failed: {err}");
                            break;
                        }
                    }
                }
            }
            if let Err(err) = sink.close().await {
                tracing::trace!("websocket close: {err}");
            }
        });

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = stream.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ServerMessage>(&text) {
                                Ok(message) => {
                                    if in_tx.send(message).is_err() {
                                        break;
                                    }
                                }
                                Err(err) => tracing::warn!("dropping unparsable stream frame: {err}"),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::debug!(?frame, "websocket closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::debug!("websocket read failed: {err}");
                            break;
                        }
                        None => break,
                    }
                }
            }
            // Stop the writer too; dropping `in_tx` signals the drop upstream.
            reader_cancel.cancel();
        });

        Ok(StreamSession::new(out_tx, in_rx).with_guard(cancel.drop_guard()))
    }
}
