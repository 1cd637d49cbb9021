use serde::{Deserialize, Serialize};

use crate::error::{SignalingError, SignalingResult};
use crate::message::IceServer;

/// The only video codec the session engine is configured for.
pub const SUPPORTED_VIDEO_CODEC: &str = "VP8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    #[default]
    RecvOnly,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioOptions {
    pub enabled: bool,
    pub direction: MediaDirection,
}

impl Default for AudioOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            direction: MediaDirection::RecvOnly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoOptions {
    pub enabled: bool,
    pub direction: MediaDirection,
    pub codec: String,
}

impl Default for VideoOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            direction: MediaDirection::RecvOnly,
            codec: SUPPORTED_VIDEO_CODEC.to_string(),
        }
    }
}

/// Negotiation options for a [`crate::Connection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionOptions {
    pub audio: AudioOptions,
    pub video: VideoOptions,
    /// Registered client id; a random one is generated per connect when unset.
    pub client_id: Option<String>,
    /// Used unless the relay supplies its own servers on accept.
    pub fallback_relay_servers: Vec<IceServer>,
    /// Required by rooms that demand authentication.
    pub signaling_key: Option<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            audio: AudioOptions::default(),
            video: VideoOptions::default(),
            client_id: None,
            fallback_relay_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }],
            signaling_key: None,
        }
    }
}

impl ConnectionOptions {
    pub fn from_toml_str(raw: &str) -> SignalingResult<Self> {
        let options: ConnectionOptions = toml::from_str(raw)?;
        options.validate()?;
        Ok(options)
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_signaling_key(mut self, key: impl Into<String>) -> Self {
        self.signaling_key = Some(key.into());
        self
    }

    pub fn with_fallback_relay_servers(mut self, servers: Vec<IceServer>) -> Self {
        self.fallback_relay_servers = servers;
        self
    }

    pub fn with_audio(mut self, enabled: bool, direction: MediaDirection) -> Self {
        self.audio = AudioOptions { enabled, direction };
        self
    }

    pub fn with_video(mut self, enabled: bool, direction: MediaDirection) -> Self {
        self.video.enabled = enabled;
        self.video.direction = direction;
        self
    }

    pub fn with_video_codec(mut self, codec: impl Into<String>) -> Self {
        self.video.codec = codec.into();
        self
    }

    pub fn validate(&self) -> SignalingResult<()> {
        if !self.video.codec.eq_ignore_ascii_case(SUPPORTED_VIDEO_CODEC) {
            return Err(SignalingError::UnsupportedCodec(self.video.codec.clone()));
        }
        if self
            .fallback_relay_servers
            .iter()
            .any(|server| server.urls.is_empty())
        {
            return Err(SignalingError::InvalidOptions(
                "fallback relay server without urls".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn signaling_key(&self) -> Option<String> {
        self.signaling_key.clone().filter(|key| !key.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_receive_only_vp8() {
        let options = ConnectionOptions::default();
        assert!(options.audio.enabled);
        assert_eq!(options.audio.direction, MediaDirection::RecvOnly);
        assert_eq!(options.video.codec, "VP8");
        assert_eq!(options.fallback_relay_servers.len(), 1);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn loads_from_toml_with_partial_keys() {
        let options = ConnectionOptions::from_toml_str(
            r#"
            clientId = "viewer-1"
            signalingKey = "secret"

            [video]
            direction = "sendrecv"

            [[fallbackRelayServers]]
            urls = ["turn:turn.example:3478"]
            username = "user"
            credential = "pass"
            "#,
        )
        .expect("parse options");
        assert_eq!(options.client_id.as_deref(), Some("viewer-1"));
        assert_eq!(options.signaling_key(), Some("secret".to_string()));
        assert_eq!(options.video.direction, MediaDirection::SendRecv);
        assert_eq!(options.video.codec, "VP8");
        assert!(options.audio.enabled);
        assert_eq!(options.fallback_relay_servers[0].username, "user");
    }

    #[test]
    fn rejects_unsupported_codec() {
        let err = ConnectionOptions::default()
            .with_video_codec("H264")
            .validate()
            .unwrap_err();
        assert!(matches!(err, SignalingError::UnsupportedCodec(codec) if codec == "H264"));

        let err = ConnectionOptions::from_toml_str("[video]\ncodec = \"AV1\"").unwrap_err();
        assert!(matches!(err, SignalingError::UnsupportedCodec(_)));
    }

    #[test]
    fn empty_signaling_key_is_not_sent() {
        let options = ConnectionOptions::default().with_signaling_key("");
        assert_eq!(options.signaling_key(), None);
    }
}
