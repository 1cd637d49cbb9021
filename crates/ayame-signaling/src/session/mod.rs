//! Boundary to the media-session engine.
//!
//! The signaling layer only drives sessions through [`MediaSession`] and
//! listens through [`SessionObserver`]; [`peer::WebRtcEngine`] is the
//! production engine.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SessionError;
use crate::message::{IceCandidate, IceServer, SessionDescription};
use crate::options::{AudioOptions, VideoOptions};

pub mod peer;

pub use peer::WebRtcEngine;
pub use webrtc::rtp::packet::Packet as RtpPacket;

/// Parameters for one session instance.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServer>,
    pub audio: AudioOptions,
    pub video: VideoOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl RemoteDescription {
    pub fn offer(description: SessionDescription) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: description.sdp,
        }
    }

    pub fn answer(description: SessionDescription) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: description.sdp,
        }
    }
}

/// Network-peer connectivity phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IcePhase {
    #[default]
    New,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    pub ssrc: u32,
    pub payload_type: u8,
    pub mime_type: String,
}

/// One RTP packet delivered on an inbound track.
#[derive(Debug, Clone)]
pub struct TrackPacket {
    pub track: Arc<TrackInfo>,
    pub packet: RtpPacket,
}

/// State changes reported by a session. They are funnelled through the
/// connection's ordered dispatch path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    IceStateChanged(IcePhase),
    LocalCandidate(IceCandidate),
    TrackReadFailed(String),
}

#[async_trait]
pub trait SessionObserver: Send + Sync {
    /// Queue a state change for ordered processing.
    fn notify(&self, event: SessionEvent);

    /// Hand a remote packet to the consumer.
    async fn deliver_packet(&self, packet: TrackPacket);
}

#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Creates an offer and installs it as the local description.
    async fn create_local_offer(&self) -> Result<SessionDescription, SessionError>;

    /// Creates an answer and installs it as the local description.
    async fn create_local_answer(&self) -> Result<SessionDescription, SessionError>;

    async fn apply_remote_description(
        &self,
        description: RemoteDescription,
    ) -> Result<(), SessionError>;

    async fn apply_remote_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError>;

    /// True while our own offer is waiting for an answer.
    fn has_local_offer_pending(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// Releases the session. Idempotent; returns once the engine reports
    /// the session closed or a bounded wait elapses.
    async fn close(&self);
}

#[async_trait]
pub trait SessionEngine: Send + Sync {
    async fn create_session(
        &self,
        config: SessionConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Arc<dyn MediaSession>, SessionError>;
}
