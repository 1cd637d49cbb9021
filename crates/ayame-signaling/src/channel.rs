use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage, error::ProtocolError};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_with_config};
use url::Url;

use crate::error::{SignalingError, SignalingResult};
use crate::message::Message;

/// Bound on the websocket dial and upgrade handshake.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
pub const READ_TIMEOUT: Duration = Duration::from_secs(90);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Largest inbound frame accepted from the relay.
pub const READ_LIMIT: usize = 1024 * 1024;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Write half of the relay websocket. Closing is idempotent.
pub struct SignalingChannel {
    sink: AsyncMutex<Option<SplitSink<WsStream, WsMessage>>>,
    shutdown: watch::Sender<bool>,
}

/// Read half, consumed by the connection's read task.
pub struct ChannelReader {
    stream: SplitStream<WsStream>,
    shutdown: watch::Receiver<bool>,
}

/// Why the read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEnd {
    Closed,
    Shutdown,
    Timeout,
    Failed,
    ConsumerGone,
}

impl SignalingChannel {
    pub async fn open(signaling_url: &str) -> SignalingResult<(Self, ChannelReader)> {
        let url = websocket_url(signaling_url)?;
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(READ_LIMIT);
        config.max_frame_size = Some(READ_LIMIT);

        tracing::debug!(target = "ayame", url = %url, "connecting to relay");
        let (ws_stream, _) = timeout(
            OPEN_TIMEOUT,
            connect_async_with_config(url.as_str(), Some(config), false),
        )
        .await
        .map_err(|_| SignalingError::OpenTimeout)?
        .map_err(SignalingError::ChannelOpen)?;
        tracing::debug!(target = "ayame", url = %url, "relay websocket connected");

        let (sink, stream) = ws_stream.split();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok((
            Self {
                sink: AsyncMutex::new(Some(sink)),
                shutdown: shutdown_tx,
            },
            ChannelReader {
                stream,
                shutdown: shutdown_rx,
            },
        ))
    }

    /// Writes one frame. Sending on a closed channel is a silent no-op.
    pub async fn send(&self, message: &Message) -> SignalingResult<()> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            tracing::trace!(target = "ayame", kind = message.kind(), "channel closed, dropping send");
            return Ok(());
        };
        let text = message.encode()?;
        tracing::trace!(target = "ayame", event = "ws_out", kind = message.kind(), len = text.len());
        match timeout(WRITE_TIMEOUT, sink.send(WsMessage::Text(text))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                tracing::debug!(target = "ayame", kind = message.kind(), error = %err, "failed to send");
                Err(SignalingError::ChannelWrite(err))
            }
            Err(_) => Err(SignalingError::WriteTimeout),
        }
    }

    /// Sends a normal-closure frame best-effort and releases the socket.
    pub async fn close(&self) {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return;
        };
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        match timeout(WRITE_TIMEOUT, sink.send(WsMessage::Close(Some(frame)))).await {
            Ok(Ok(())) => tracing::trace!(target = "ayame", "sent close frame"),
            Ok(Err(err)) => tracing::trace!(target = "ayame", error = %err, "failed to send close frame"),
            Err(_) => tracing::trace!(target = "ayame", "close frame timed out"),
        }
        let _ = self.shutdown.send(true);
    }
}

impl ChannelReader {
    /// Reads frames into `frames` until the socket ends, a read times out,
    /// the channel is closed locally, or the consumer drops the queue.
    pub async fn run(mut self, frames: mpsc::Sender<Vec<u8>>) -> ReadEnd {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.changed() => return ReadEnd::Shutdown,
                next = timeout(READ_TIMEOUT, self.stream.next()) => next,
            };
            let frame = match next {
                Err(_) => {
                    tracing::debug!(target = "ayame", "relay read timed out");
                    return ReadEnd::Timeout;
                }
                Ok(None) => return ReadEnd::Closed,
                Ok(Some(Err(err))) => {
                    log_read_error(&err);
                    return ReadEnd::Failed;
                }
                Ok(Some(Ok(message))) => match message {
                    WsMessage::Text(text) => text.into_bytes(),
                    WsMessage::Binary(data) => data,
                    WsMessage::Close(_) => return ReadEnd::Closed,
                    _ => continue,
                },
            };
            tracing::trace!(target = "ayame", event = "ws_in", len = frame.len());
            if frames.send(frame).await.is_err() {
                return ReadEnd::ConsumerGone;
            }
        }
    }
}

fn log_read_error(err: &WsError) {
    match err {
        WsError::ConnectionClosed
        | WsError::AlreadyClosed
        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            tracing::debug!(target = "ayame", "relay websocket closed: {err}");
        }
        _ => {
            tracing::warn!(target = "ayame", "relay websocket error: {err}");
        }
    }
}

/// Normalizes a relay address into a websocket url.
pub fn websocket_url(signaling_url: &str) -> SignalingResult<Url> {
    let invalid = |reason: String| SignalingError::InvalidUrl {
        url: signaling_url.to_string(),
        reason,
    };
    let mut url = Url::parse(signaling_url).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid("invalid websocket scheme".into()))?;
    url.set_fragment(None);
    Ok(url)
}
