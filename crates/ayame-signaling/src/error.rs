use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("connection already exists")]
    AlreadyConnected,
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to open signaling channel: {0}")]
    ChannelOpen(#[source] tungstenite::Error),
    #[error("signaling channel open timed out")]
    OpenTimeout,
    #[error("connection closed while connecting")]
    ConnectAborted,
    #[error("signaling channel write failed: {0}")]
    ChannelWrite(#[source] tungstenite::Error),
    #[error("signaling channel write timed out")]
    WriteTimeout,
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid message type: {0:?}")]
    InvalidMessageType(Option<String>),
    #[error("unsupported video codec: {0}")]
    UnsupportedCodec(String),
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unsupported video codec: {0}")]
    UnsupportedCodec(String),
    #[error("media engine error: {0}")]
    Engine(#[from] webrtc::Error),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("inbound track failed: {0}")]
    TrackRead(String),
    #[error("session closed")]
    Closed,
}

impl From<toml::de::Error> for SignalingError {
    fn from(value: toml::de::Error) -> Self {
        SignalingError::InvalidOptions(value.to_string())
    }
}

pub type SignalingResult<T> = Result<T, SignalingError>;
