//! Client for the Ayame signaling relay.
//!
//! A [`Connection`] registers with a room on the relay, negotiates a single
//! peer-to-peer media session through it and reports progress through
//! consumer callbacks.

mod callbacks;
pub mod channel;
pub mod connection;
pub mod error;
pub mod message;
mod negotiation;
pub mod options;
pub mod session;

pub use callbacks::{
    ByeHandler, ConnectHandler, DisconnectHandler, OpenHandler, TrackPacketHandler,
};
pub use connection::{Connection, ConnectionBuilder};
pub use error::{SessionError, SignalingError, SignalingResult};
pub use message::{IceCandidate, IceServer, Message};
pub use negotiation::NegotiationPhase;
pub use options::{AudioOptions, ConnectionOptions, MediaDirection, VideoOptions};
pub use session::{IcePhase, TrackInfo, TrackPacket, WebRtcEngine};

/// Reason strings handed to the disconnect callback.
pub mod reason {
    pub const REJECTED: &str = "REJECTED";
    pub const EXIT_RECV: &str = "EXIT-RECV";
    pub const ICE_CONNECTION_STATE_FAILED: &str = "ICE-CONNECTION-STATE-FAILED";
    pub const CREATE_OFFER_ERROR: &str = "CREATE-OFFER-ERROR";
    pub const CREATE_ANSWER_ERROR: &str = "CREATE-ANSWER-ERROR";
    pub const READ_RTP_ERROR: &str = "READ-RTP-ERROR";
    pub const CREATE_SESSION_ERROR: &str = "CREATE-SESSION-ERROR";
    pub const SEND_OFFER_ERROR: &str = "SEND-OFFER-ERROR";
    pub const INVALID_MESSAGE: &str = "INVALID-MESSAGE";
}
