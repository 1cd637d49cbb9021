//! Offer/answer negotiation driven by relay frames and session events.
//!
//! Everything here runs under the connection lock. Handlers return a
//! [`Transition`] describing the consumer notices to fire and whether the
//! connection must be torn down; the caller fires them after unlocking.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::callbacks::Notice;
use crate::channel::SignalingChannel;
use crate::error::{SessionError, SignalingError, SignalingResult};
use crate::message::{Accept, Candidate, IceServer, Message, SessionDescription};
use crate::options::ConnectionOptions;
use crate::reason;
use crate::session::{
    IcePhase, MediaSession, RemoteDescription, SessionConfig, SessionEngine, SessionEvent,
    SessionObserver,
};

/// Where a connection is in the register/accept/offer/answer flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationPhase {
    #[default]
    Idle,
    Registering,
    Negotiating,
    Established,
    /// Torn down by the relay, the peer or a failure. A consumer
    /// `disconnect` returns to `Idle` instead.
    Closed,
}

/// Outbound half of the relay, as seen by the negotiation.
#[async_trait]
pub(crate) trait Outbound: Send + Sync {
    async fn send(&self, message: &Message) -> SignalingResult<()>;
}

#[async_trait]
impl Outbound for SignalingChannel {
    async fn send(&self, message: &Message) -> SignalingResult<()> {
        SignalingChannel::send(self, message).await
    }
}

pub(crate) type ObserverFactory = dyn Fn(u64) -> Arc<dyn SessionObserver> + Send + Sync;

pub(crate) struct NegotiationContext<'a> {
    pub outbound: &'a dyn Outbound,
    pub engine: &'a dyn SessionEngine,
    pub options: &'a ConnectionOptions,
    /// Builds the observer for a session of the given generation.
    pub observer_for: &'a ObserverFactory,
    pub debug: bool,
}

/// Outcome of handling one input.
#[derive(Debug, Default)]
pub(crate) struct Transition {
    pub notices: Vec<Notice>,
    pub teardown: Option<Teardown>,
}

#[derive(Debug, Default)]
pub(crate) struct Teardown {
    /// `None` tears down without invoking the disconnect handler.
    pub disconnect: Option<(String, Option<SignalingError>)>,
}

impl Transition {
    fn notify(notice: Notice) -> Self {
        Self {
            notices: vec![notice],
            teardown: None,
        }
    }

    pub fn disconnect(reason: impl Into<String>, error: Option<SignalingError>) -> Self {
        Self::default().then_disconnect(reason, error)
    }

    fn then_disconnect(mut self, reason: impl Into<String>, error: Option<SignalingError>) -> Self {
        self.teardown = Some(Teardown::disconnect(reason, error));
        self
    }
}

impl Teardown {
    pub fn disconnect(reason: impl Into<String>, error: Option<SignalingError>) -> Self {
        Self {
            disconnect: Some((reason.into(), error)),
        }
    }
}

pub(crate) struct ActiveSession {
    pub generation: u64,
    pub handle: Arc<dyn MediaSession>,
}

pub(crate) struct Negotiation {
    pub phase: NegotiationPhase,
    pub connection_id: Option<String>,
    pub authz_metadata: Option<Value>,
    pub is_offer: bool,
    pub is_exist_user: bool,
    pub ice_phase: IcePhase,
    pub ice_servers: Vec<IceServer>,
    session: Option<ActiveSession>,
    next_generation: u64,
}

impl Negotiation {
    pub fn new(fallback_relay_servers: &[IceServer]) -> Self {
        Self {
            phase: NegotiationPhase::Idle,
            connection_id: None,
            authz_metadata: None,
            is_offer: false,
            is_exist_user: false,
            ice_phase: IcePhase::New,
            ice_servers: fallback_relay_servers.to_vec(),
            session: None,
            next_generation: 1,
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_generation(&self) -> Option<u64> {
        self.session.as_ref().map(|active| active.generation)
    }

    pub fn take_session(&mut self) -> Option<ActiveSession> {
        self.session.take()
    }

    pub fn begin_registration(&mut self) {
        self.phase = NegotiationPhase::Registering;
    }

    /// Clears everything derived from the relay, back to `Idle`. Generations
    /// keep counting so events from sessions of earlier connects stay stale.
    pub fn reset(&mut self, fallback_relay_servers: &[IceServer]) {
        let next_generation = self.next_generation;
        *self = Self::new(fallback_relay_servers);
        self.next_generation = next_generation;
    }

    /// Decodes and handles one relay frame. Errors are protocol violations
    /// that end the connection.
    pub async fn handle_frame(
        &mut self,
        ctx: &NegotiationContext<'_>,
        raw: &[u8],
    ) -> Result<Transition, SignalingError> {
        let message = match Message::decode(raw) {
            Ok(message) => message,
            Err(err) => {
                if ctx.debug {
                    tracing::debug!(
                        target = "ayame",
                        error = %err,
                        payload = %String::from_utf8_lossy(raw),
                        "undecodable relay frame"
                    );
                } else {
                    tracing::debug!(target = "ayame", error = %err, len = raw.len(), "undecodable relay frame");
                }
                return Err(err);
            }
        };
        if ctx.debug {
            tracing::debug!(
                target = "ayame",
                event = "recv",
                payload = %String::from_utf8_lossy(raw)
            );
        } else {
            tracing::trace!(target = "ayame", event = "recv", kind = message.kind());
        }
        self.handle_message(ctx, message).await
    }

    pub async fn handle_message(
        &mut self,
        ctx: &NegotiationContext<'_>,
        message: Message,
    ) -> Result<Transition, SignalingError> {
        let transition = match message {
            Message::Ping => {
                self.send(ctx, &Message::Pong).await;
                Transition::default()
            }
            Message::Bye => Transition {
                notices: vec![Notice::Bye],
                teardown: Some(Teardown::default()),
            },
            Message::Accept(accept) => self.on_accept(ctx, accept).await,
            Message::Reject(reject) => {
                let reason = reject.reason_or_default();
                tracing::info!(target = "ayame", reason = %reason, "registration rejected");
                Transition::disconnect(reason, None)
            }
            Message::Offer(description) => self.on_offer(ctx, description).await,
            Message::Answer(description) => {
                self.on_answer(description).await;
                Transition::default()
            }
            Message::Candidate(candidate) => {
                self.on_candidate(candidate).await;
                Transition::default()
            }
            Message::Pong => Transition::default(),
            Message::Register(_) => {
                return Err(SignalingError::InvalidMessageType(Some("register".into())));
            }
        };
        Ok(transition)
    }

    /// Handles a change reported by a session. Events from any session other
    /// than the current one are dropped.
    pub async fn handle_engine_event(
        &mut self,
        ctx: &NegotiationContext<'_>,
        generation: u64,
        event: SessionEvent,
    ) -> Transition {
        if self.session_generation() != Some(generation) {
            tracing::trace!(target = "ayame", generation, ?event, "dropping stale session event");
            return Transition::default();
        }
        match event {
            SessionEvent::IceStateChanged(phase) => {
                if phase == self.ice_phase {
                    return Transition::default();
                }
                tracing::debug!(target = "ayame", from = ?self.ice_phase, to = ?phase, "ice phase changed");
                self.ice_phase = phase;
                match phase {
                    IcePhase::Connected => {
                        self.is_offer = false;
                        self.phase = NegotiationPhase::Established;
                        Transition::notify(Notice::Connected)
                    }
                    IcePhase::Disconnected | IcePhase::Failed => {
                        Transition::disconnect(reason::ICE_CONNECTION_STATE_FAILED, None)
                    }
                    IcePhase::New => Transition::default(),
                }
            }
            SessionEvent::LocalCandidate(candidate) => {
                self.send(ctx, &Message::Candidate(Candidate { ice: Some(candidate) }))
                    .await;
                Transition::default()
            }
            SessionEvent::TrackReadFailed(err) => Transition::disconnect(
                reason::READ_RTP_ERROR,
                Some(SessionError::TrackRead(err).into()),
            ),
        }
    }

    async fn on_accept(&mut self, ctx: &NegotiationContext<'_>, accept: Accept) -> Transition {
        if self.phase != NegotiationPhase::Registering {
            tracing::warn!(target = "ayame", phase = ?self.phase, "ignoring accept outside registration");
            return Transition::default();
        }
        self.connection_id = Some(accept.connection_id.clone()).filter(|id| !id.is_empty());
        self.authz_metadata = accept.authz_metadata.clone();
        let relay_servers = accept.relay_servers();
        if !relay_servers.is_empty() {
            self.ice_servers = relay_servers;
        }
        self.is_exist_user = accept.is_exist_user;
        self.phase = NegotiationPhase::Negotiating;
        tracing::info!(
            target = "ayame",
            connection_id = ?self.connection_id,
            is_exist_user = self.is_exist_user,
            ice_servers = self.ice_servers.len(),
            "registration accepted"
        );

        if let Err(err) = self.open_session(ctx).await {
            tracing::warn!(target = "ayame", error = %err, "failed to create session");
            return Transition::disconnect(reason::CREATE_SESSION_ERROR, Some(err.into()));
        }
        let transition = Transition::notify(Notice::Open(self.authz_metadata.clone()));
        if self.is_exist_user {
            if let Err(err) = self.send_offer(ctx).await {
                tracing::warn!(target = "ayame", error = %err, "failed to send offer");
                return transition.then_disconnect(reason::SEND_OFFER_ERROR, Some(err));
            }
        }
        transition
    }

    async fn on_offer(
        &mut self,
        ctx: &NegotiationContext<'_>,
        description: SessionDescription,
    ) -> Transition {
        let Some(active) = &self.session else {
            tracing::debug!(target = "ayame", "ignoring offer before accept");
            return Transition::default();
        };
        if active.handle.has_local_offer_pending() {
            tracing::debug!(target = "ayame", "offer collided with our own, recreating session");
            if let Err(err) = self.open_session(ctx).await {
                return Transition::disconnect(reason::CREATE_SESSION_ERROR, Some(err.into()));
            }
            self.is_offer = false;
        }
        let Some(handle) = self.session.as_ref().map(|active| Arc::clone(&active.handle)) else {
            return Transition::default();
        };

        self.log_sdp(ctx, "remote offer", &description);
        if let Err(err) = handle
            .apply_remote_description(RemoteDescription::offer(description))
            .await
        {
            tracing::warn!(target = "ayame", error = %err, "failed to apply remote offer");
            return Transition::disconnect(reason::CREATE_OFFER_ERROR, Some(err.into()));
        }
        match handle.create_local_answer().await {
            Ok(answer) => {
                self.log_sdp(ctx, "local answer", &answer);
                self.send(ctx, &Message::Answer(answer)).await;
                Transition::default()
            }
            Err(err) => {
                tracing::warn!(target = "ayame", error = %err, "failed to create answer");
                Transition::disconnect(reason::CREATE_ANSWER_ERROR, Some(err.into()))
            }
        }
    }

    async fn on_answer(&self, description: SessionDescription) {
        let Some(active) = &self.session else {
            tracing::debug!(target = "ayame", "ignoring answer without a session");
            return;
        };
        if let Err(err) = active
            .handle
            .apply_remote_description(RemoteDescription::answer(description))
            .await
        {
            tracing::debug!(target = "ayame", error = %err, "remote answer not applied");
        }
    }

    async fn on_candidate(&self, candidate: Candidate) {
        let Some(ice) = candidate.ice else {
            return;
        };
        let Some(active) = &self.session else {
            tracing::trace!(target = "ayame", "ignoring candidate without a session");
            return;
        };
        if let Err(err) = active.handle.apply_remote_candidate(ice).await {
            tracing::debug!(target = "ayame", error = %err, "remote candidate not applied");
        }
    }

    /// Replaces any current session with a fresh one built from the current
    /// relay servers.
    async fn open_session(&mut self, ctx: &NegotiationContext<'_>) -> Result<(), SessionError> {
        if let Some(previous) = self.session.take() {
            previous.handle.close().await;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let config = SessionConfig {
            ice_servers: self.ice_servers.clone(),
            audio: ctx.options.audio.clone(),
            video: ctx.options.video.clone(),
        };
        let handle = ctx
            .engine
            .create_session(config, (ctx.observer_for)(generation))
            .await?;
        tracing::debug!(target = "ayame", generation, "session created");
        self.session = Some(ActiveSession { generation, handle });
        self.ice_phase = IcePhase::New;
        Ok(())
    }

    async fn send_offer(&mut self, ctx: &NegotiationContext<'_>) -> Result<(), SignalingError> {
        let Some(active) = &self.session else {
            return Ok(());
        };
        let offer = active.handle.create_local_offer().await?;
        self.log_sdp(ctx, "local offer", &offer);
        ctx.outbound.send(&Message::Offer(offer)).await?;
        self.is_offer = true;
        Ok(())
    }

    async fn send(&self, ctx: &NegotiationContext<'_>, message: &Message) {
        if let Err(err) = ctx.outbound.send(message).await {
            tracing::warn!(target = "ayame", kind = message.kind(), error = %err, "failed to send");
        }
    }

    fn log_sdp(&self, ctx: &NegotiationContext<'_>, label: &str, description: &SessionDescription) {
        if ctx.debug {
            tracing::debug!(target = "ayame", sdp = %description.sdp, "{label}");
        }
    }
}
