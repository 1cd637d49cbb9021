//! Wire messages exchanged with the Ayame relay.
//!
//! Every frame is a JSON object carrying a `type` discriminator. Decoding
//! reads the discriminator first and then parses the concrete shape, so an
//! unknown tag and a malformed body are reported differently.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalingError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Register(Register),
    Accept(Accept),
    Reject(Reject),
    Ping,
    Pong,
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(Candidate),
    Bye,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Register {
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authn_metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signaling_key: Option<String>,
    pub ayame_client: String,
    pub environment: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accept {
    #[serde(default)]
    pub connection_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authz_metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_servers: Option<Vec<IceServerEntry>>,
    #[serde(default, alias = "isExistClient")]
    pub is_exist_user: bool,
}

impl Accept {
    /// Relay-supplied servers, empty when the relay sent none.
    pub fn relay_servers(&self) -> Vec<IceServer> {
        self.ice_servers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(IceServer::from)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceServerEntry {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Fallback relay-candidate server with optional fields collapsed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl From<&IceServerEntry> for IceServer {
    fn from(entry: &IceServerEntry) -> Self {
        Self {
            urls: entry.urls.clone(),
            username: entry.username.clone().unwrap_or_default(),
            credential: entry.credential.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Reject {
    /// The relay's reason, or `REJECTED` when absent or empty.
    pub fn reason_or_default(&self) -> String {
        match self.reason.as_deref() {
            Some(reason) if !reason.is_empty() => reason.to_string(),
            _ => crate::reason::REJECTED.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice: Option<IceCandidate>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Deserialize)]
struct Discriminator {
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Register(_) => "register",
            Message::Accept(_) => "accept",
            Message::Reject(_) => "reject",
            Message::Ping => "ping",
            Message::Pong => "pong",
            Message::Offer(_) => "offer",
            Message::Answer(_) => "answer",
            Message::Candidate(_) => "candidate",
            Message::Bye => "bye",
        }
    }

    pub fn encode(&self) -> Result<String, SignalingError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, SignalingError> {
        let Discriminator { kind } = serde_json::from_slice(raw)?;
        let message = match kind.as_deref() {
            Some("register") => Message::Register(serde_json::from_slice(raw)?),
            Some("accept") => Message::Accept(serde_json::from_slice(raw)?),
            Some("reject") => Message::Reject(serde_json::from_slice(raw)?),
            Some("ping") => Message::Ping,
            Some("pong") => Message::Pong,
            Some("offer") => Message::Offer(serde_json::from_slice(raw)?),
            Some("answer") => Message::Answer(serde_json::from_slice(raw)?),
            Some("candidate") => Message::Candidate(serde_json::from_slice(raw)?),
            Some("bye") => Message::Bye,
            _ => return Err(SignalingError::InvalidMessageType(kind)),
        };
        Ok(message)
    }
}
