use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, interval, sleep};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtcp::packet::Packet as RtcpPacket;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use super::{
    IcePhase, MediaKind, MediaSession, RemoteDescription, SdpKind, SessionConfig, SessionEngine,
    SessionEvent, SessionObserver, TrackInfo, TrackPacket,
};
use crate::error::SessionError;
use crate::message::{IceCandidate, IceServer, SessionDescription};
use crate::options::{MediaDirection, SUPPORTED_VIDEO_CODEC};

/// Interval between picture-loss indications sent for each inbound video track.
pub const KEYFRAME_REQUEST_INTERVAL: Duration = Duration::from_secs(3);
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(400);
const CLOSE_WAIT: Duration = Duration::from_secs(5);

/// Session engine backed by a webrtc-rs peer connection, configured for
/// VP8 video and Opus audio.
#[derive(Debug, Default, Clone)]
pub struct WebRtcEngine;

impl WebRtcEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SessionEngine for WebRtcEngine {
    async fn create_session(
        &self,
        config: SessionConfig,
        observer: Arc<dyn SessionObserver>,
    ) -> Result<Arc<dyn MediaSession>, SessionError> {
        if !config.video.codec.eq_ignore_ascii_case(SUPPORTED_VIDEO_CODEC) {
            return Err(SessionError::UnsupportedCodec(config.video.codec.clone()));
        }

        let mut media_engine = media_engine()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        };
        tracing::trace!(
            target = "ayame",
            ice_servers = rtc_config.ice_servers.len(),
            "creating peer connection"
        );
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);

        if config.audio.enabled {
            add_transceiver(&peer_connection, RTPCodecType::Audio, config.audio.direction).await?;
        }
        if config.video.enabled {
            add_transceiver(&peer_connection, RTPCodecType::Video, config.video.direction).await?;
        }

        let session = Arc::new(WebRtcSession {
            peer_connection,
            closed: Arc::new(AtomicBool::new(false)),
        });
        session.install_handlers(observer);
        Ok(session as Arc<dyn MediaSession>)
    }
}

fn media_engine() -> Result<MediaEngine, SessionError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            payload_type: 96,
            ..Default::default()
        },
        RTPCodecType::Video,
    )?;
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            payload_type: 111,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;
    Ok(media_engine)
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone(),
        credential: server.credential.clone(),
        ..Default::default()
    }
}

async fn add_transceiver(
    peer_connection: &RTCPeerConnection,
    kind: RTPCodecType,
    direction: MediaDirection,
) -> Result<(), SessionError> {
    let direction = match direction {
        MediaDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
        MediaDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
        MediaDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
        // webrtc-rs cannot create an inactive transceiver from a kind.
        MediaDirection::Inactive => return Ok(()),
    };
    peer_connection
        .add_transceiver_from_kind(
            kind,
            Some(RTCRtpTransceiverInit {
                direction,
                send_encodings: vec![],
            }),
        )
        .await?;
    Ok(())
}

fn ice_phase(state: RTCIceConnectionState) -> Option<IcePhase> {
    match state {
        RTCIceConnectionState::New | RTCIceConnectionState::Checking => Some(IcePhase::New),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            Some(IcePhase::Connected)
        }
        RTCIceConnectionState::Disconnected => Some(IcePhase::Disconnected),
        RTCIceConnectionState::Failed => Some(IcePhase::Failed),
        _ => None,
    }
}

pub struct WebRtcSession {
    peer_connection: Arc<RTCPeerConnection>,
    closed: Arc<AtomicBool>,
}

impl WebRtcSession {
    fn install_handlers(&self, observer: Arc<dyn SessionObserver>) {
        let closed = Arc::clone(&self.closed);
        let state_observer = Arc::clone(&observer);
        self.peer_connection
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                tracing::trace!(target = "ayame", state = %state, "ice connection state changed");
                if !closed.load(Ordering::SeqCst) {
                    if let Some(phase) = ice_phase(state) {
                        state_observer.notify(SessionEvent::IceStateChanged(phase));
                    }
                }
                Box::pin(async {})
            }));

        self.peer_connection
            .on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
                tracing::trace!(target = "ayame", state = %state, "signaling state changed");
                Box::pin(async {})
            }));

        let candidate_observer = Arc::clone(&observer);
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let observer = Arc::clone(&candidate_observer);
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => observer.notify(SessionEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        })),
                        Err(err) => {
                            tracing::trace!(target = "ayame", error = %err, "unserializable local candidate")
                        }
                    }
                })
            }));

        let closed = Arc::clone(&self.closed);
        let weak_pc = Arc::downgrade(&self.peer_connection);
        self.peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let codec = track.codec();
                let info = Arc::new(TrackInfo {
                    id: track.id(),
                    stream_id: track.stream_id(),
                    kind: match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        _ => MediaKind::Video,
                    },
                    ssrc: track.ssrc(),
                    payload_type: track.payload_type(),
                    mime_type: codec.capability.mime_type.clone(),
                });
                tracing::debug!(
                    target = "ayame",
                    track = %info.id,
                    payload_type = info.payload_type,
                    codec = %info.mime_type,
                    "remote track started"
                );
                if info.kind == MediaKind::Video {
                    tokio::spawn(request_keyframes(
                        weak_pc.clone(),
                        info.ssrc,
                        Arc::clone(&closed),
                    ));
                }
                tokio::spawn(read_track(
                    track,
                    info,
                    Arc::clone(&closed),
                    Arc::clone(&observer),
                ));
                Box::pin(async {})
            },
        ));
    }

    fn reported_closed(&self) -> bool {
        self.peer_connection.signaling_state() == RTCSignalingState::Closed
            || self.peer_connection.connection_state() == RTCPeerConnectionState::Closed
    }

    async fn wait_closed(&self) {
        let deadline = Instant::now() + CLOSE_WAIT;
        while !self.reported_closed() {
            if Instant::now() >= deadline {
                tracing::warn!(target = "ayame", "peer connection did not report closed in time");
                return;
            }
            sleep(CLOSE_POLL_INTERVAL).await;
        }
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn create_local_offer(&self) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        let offer = self.peer_connection.create_offer(None).await?;
        self.peer_connection.set_local_description(offer).await?;
        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| SessionError::InvalidDescription("no local offer installed".into()))?;
        Ok(SessionDescription { sdp: local.sdp })
    }

    async fn create_local_answer(&self) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        let answer = self.peer_connection.create_answer(None).await?;
        self.peer_connection.set_local_description(answer).await?;
        let local = self
            .peer_connection
            .local_description()
            .await
            .ok_or_else(|| SessionError::InvalidDescription("no local answer installed".into()))?;
        Ok(SessionDescription { sdp: local.sdp })
    }

    async fn apply_remote_description(
        &self,
        description: RemoteDescription,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        let description = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        };
        self.peer_connection
            .set_remote_description(description)
            .await?;
        Ok(())
    }

    async fn apply_remote_candidate(&self, candidate: IceCandidate) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    fn has_local_offer_pending(&self) -> bool {
        self.peer_connection.signaling_state() == RTCSignalingState::HaveLocalOffer
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.reported_closed()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            // Another close is in flight; wait for it to land.
            self.wait_closed().await;
            return;
        }
        if let Err(err) = self.peer_connection.close().await {
            tracing::debug!(target = "ayame", error = %err, "peer connection close failed");
        }
        self.wait_closed().await;
    }
}

async fn read_track(
    track: Arc<TrackRemote>,
    info: Arc<TrackInfo>,
    closed: Arc<AtomicBool>,
    observer: Arc<dyn SessionObserver>,
) {
    loop {
        match track.read_rtp().await {
            Ok((packet, _attributes)) => {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                observer
                    .deliver_packet(TrackPacket {
                        track: Arc::clone(&info),
                        packet,
                    })
                    .await;
            }
            Err(err) => {
                if closed.load(Ordering::SeqCst) || is_end_of_stream(&err) {
                    tracing::trace!(target = "ayame", track = %info.id, "remote track ended");
                    return;
                }
                tracing::debug!(target = "ayame", track = %info.id, error = %err, "read rtp failed");
                observer.notify(SessionEvent::TrackReadFailed(err.to_string()));
                return;
            }
        }
    }
}

fn is_end_of_stream(err: &webrtc::Error) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("eof") || text.contains("closed")
}

async fn request_keyframes(
    peer_connection: Weak<RTCPeerConnection>,
    media_ssrc: u32,
    closed: Arc<AtomicBool>,
) {
    let mut ticker = interval(KEYFRAME_REQUEST_INTERVAL);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if closed.load(Ordering::SeqCst) {
            return;
        }
        let Some(peer_connection) = peer_connection.upgrade() else {
            return;
        };
        if peer_connection.signaling_state() == RTCSignalingState::Closed {
            return;
        }
        let packets: Vec<Box<dyn RtcpPacket + Send + Sync>> = vec![Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        })];
        if let Err(err) = peer_connection.write_rtcp(&packets).await {
            tracing::trace!(target = "ayame", ssrc = media_ssrc, error = %err, "failed to write keyframe request");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{AudioOptions, VideoOptions};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<SessionEvent>>,
    }

    #[async_trait]
    impl SessionObserver for RecordingObserver {
        fn notify(&self, event: SessionEvent) {
            self.events.lock().unwrap().push(event);
        }

        async fn deliver_packet(&self, _packet: TrackPacket) {}
    }

    fn config() -> SessionConfig {
        SessionConfig {
            ice_servers: vec![],
            audio: AudioOptions::default(),
            video: VideoOptions::default(),
        }
    }

    #[test]
    fn maps_ice_states_onto_phases() {
        assert_eq!(ice_phase(RTCIceConnectionState::Checking), Some(IcePhase::New));
        assert_eq!(
            ice_phase(RTCIceConnectionState::Completed),
            Some(IcePhase::Connected)
        );
        assert_eq!(
            ice_phase(RTCIceConnectionState::Disconnected),
            Some(IcePhase::Disconnected)
        );
        assert_eq!(ice_phase(RTCIceConnectionState::Failed), Some(IcePhase::Failed));
        assert_eq!(ice_phase(RTCIceConnectionState::Closed), None);
    }

    #[tokio::test]
    async fn unsupported_codec_fails_before_creating_a_peer_connection() {
        let mut config = config();
        config.video.codec = "H264".into();
        let result = WebRtcEngine::new()
            .create_session(config, Arc::new(RecordingObserver::default()))
            .await;
        assert!(matches!(result, Err(SessionError::UnsupportedCodec(codec)) if codec == "H264"));
    }

    #[tokio::test]
    async fn local_offer_is_pending_until_closed() {
        let session = WebRtcEngine::new()
            .create_session(config(), Arc::new(RecordingObserver::default()))
            .await
            .expect("create session");
        assert!(!session.has_local_offer_pending());

        let offer = session.create_local_offer().await.expect("create offer");
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("VP8"));
        assert!(session.has_local_offer_pending());

        session.close().await;
        assert!(session.is_closed());
        // Second close is a no-op.
        session.close().await;
        assert!(matches!(
            session.create_local_offer().await,
            Err(SessionError::Closed)
        ));
    }
}
