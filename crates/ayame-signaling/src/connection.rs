//! Connection lifecycle: connect, the read and dispatch tasks, teardown.
//!
//! All mutable state sits behind one async lock. Relay frames and session
//! events are funnelled through a single dispatch task so they are handled
//! strictly in order, and consumer handlers always run with the lock
//! released.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::callbacks::{Callbacks, Notice};
use crate::channel::{ChannelReader, SignalingChannel};
use crate::error::{SignalingError, SignalingResult};
use crate::message::{Message, Register};
use crate::negotiation::{Negotiation, NegotiationContext, NegotiationPhase, Teardown, Transition};
use crate::options::ConnectionOptions;
use crate::reason;
use crate::session::{
    IcePhase, SessionEngine, SessionEvent, SessionObserver, TrackPacket, WebRtcEngine,
};

/// Frames buffered between the read task and the dispatch task.
pub const FRAME_QUEUE_CAPACITY: usize = 100;

const AYAME_CLIENT: &str = concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"));

pub struct ConnectionBuilder {
    signaling_url: String,
    room_id: String,
    options: ConnectionOptions,
    authn_metadata: Option<Value>,
    debug: bool,
    engine: Option<Arc<dyn SessionEngine>>,
}

impl ConnectionBuilder {
    pub fn new(signaling_url: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            room_id: room_id.into(),
            options: ConnectionOptions::default(),
            authn_metadata: None,
            debug: false,
            engine: None,
        }
    }

    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Opaque value forwarded to the relay on register.
    pub fn authn_metadata(mut self, metadata: Value) -> Self {
        self.authn_metadata = Some(metadata);
        self
    }

    /// Logs full frames and session descriptions at debug level.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Replaces the default webrtc-rs engine.
    pub fn engine(mut self, engine: Arc<dyn SessionEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> Connection {
        let span = tracing::info_span!(
            target: "ayame",
            "ayame_connection",
            room_id = %self.room_id,
            url = %self.signaling_url
        );
        let negotiation = Negotiation::new(&self.options.fallback_relay_servers);
        Connection {
            inner: Arc::new(Inner {
                engine: self
                    .engine
                    .unwrap_or_else(|| Arc::new(WebRtcEngine::new()) as Arc<dyn SessionEngine>),
                signaling_url: self.signaling_url,
                room_id: self.room_id,
                options: self.options,
                authn_metadata: self.authn_metadata,
                debug: self.debug,
                span,
                state: AsyncMutex::new(State {
                    epoch: 0,
                    channel: None,
                    events: None,
                    negotiation,
                    callbacks: Callbacks::default(),
                }),
            }),
        }
    }
}

/// A client of one room on an Ayame relay.
///
/// At most one relay channel and one media session exist at a time. After
/// a disconnect, by the consumer or the relay, the connection can be
/// connected again.
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    signaling_url: String,
    room_id: String,
    options: ConnectionOptions,
    authn_metadata: Option<Value>,
    debug: bool,
    engine: Arc<dyn SessionEngine>,
    span: tracing::Span,
    state: AsyncMutex<State>,
}

struct State {
    /// Bumped on every connect and disconnect so tasks and dials of an
    /// earlier channel stand down.
    epoch: u64,
    channel: Option<Arc<SignalingChannel>>,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
    negotiation: Negotiation,
    callbacks: Callbacks,
}

impl State {
    fn is_active(&self) -> bool {
        self.channel.is_some() || self.negotiation.has_session()
    }
}

#[derive(Debug)]
struct EngineEvent {
    generation: u64,
    event: SessionEvent,
}

enum Input {
    Frame(Vec<u8>),
    Engine(EngineEvent),
}

impl Connection {
    pub fn new(
        signaling_url: impl Into<String>,
        room_id: impl Into<String>,
        options: ConnectionOptions,
    ) -> Self {
        ConnectionBuilder::new(signaling_url, room_id)
            .options(options)
            .build()
    }

    pub fn builder(signaling_url: impl Into<String>, room_id: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder::new(signaling_url, room_id)
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn signaling_url(&self) -> &str {
        &self.inner.signaling_url
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Opens the relay channel and registers with the room.
    ///
    /// Returns once the register frame is written; the rest of the
    /// negotiation is reported through the handlers. The dial runs without
    /// the state lock, so `disconnect` during it returns at once and makes
    /// this call fail with [`SignalingError::ConnectAborted`].
    pub async fn connect(&self) -> SignalingResult<()> {
        let inner = &self.inner;
        let dial_epoch = {
            let state = inner.state.lock().await;
            if state.is_active() {
                tracing::debug!(parent: &inner.span, target = "ayame", "connection already exists");
                return Err(SignalingError::AlreadyConnected);
            }
            inner.options.validate()?;
            state.epoch
        };

        let (channel, reader) = SignalingChannel::open(&inner.signaling_url)
            .instrument(inner.span.clone())
            .await?;
        let channel = Arc::new(channel);

        let mut state = inner.state.lock().await;
        if state.is_active() {
            tracing::debug!(parent: &inner.span, target = "ayame", "lost connect race, closing dialed channel");
            channel.close().await;
            return Err(SignalingError::AlreadyConnected);
        }
        if state.epoch != dial_epoch {
            tracing::debug!(parent: &inner.span, target = "ayame", "disconnected while dialing");
            channel.close().await;
            return Err(SignalingError::ConnectAborted);
        }
        state.epoch += 1;
        let epoch = state.epoch;
        let (frames_tx, frames_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        state.channel = Some(Arc::clone(&channel));
        state.events = Some(events_tx);
        state
            .negotiation
            .reset(&inner.options.fallback_relay_servers);
        state.negotiation.begin_registration();

        let dispatch = tokio::spawn(
            Arc::clone(inner)
                .dispatch_loop(epoch, frames_rx, events_rx)
                .instrument(inner.span.clone()),
        );
        tokio::spawn(
            Arc::clone(inner)
                .read_loop(epoch, reader, frames_tx, dispatch)
                .instrument(inner.span.clone()),
        );

        let register = inner.register_message();
        tracing::debug!(
            parent: &inner.span,
            target = "ayame",
            client_id = ?register.client_id,
            "registering"
        );
        if let Err(err) = channel.send(&Message::Register(register)).await {
            tracing::warn!(parent: &inner.span, target = "ayame", error = %err, "failed to send register");
            // The caller sees the error; handlers stay installed and silent.
            let callbacks = teardown_locked(&mut state, &inner.options).await;
            state.callbacks = callbacks;
            return Err(err);
        }
        Ok(())
    }

    /// Closes the session and the relay channel and resets every handler to
    /// a no-op. The disconnect handler is not invoked. Safe to call at any
    /// time, including repeatedly, and aborts a `connect` still dialing.
    pub async fn disconnect(&self) {
        let mut state = self.inner.state.lock().await;
        let was_active = state.is_active();
        state.epoch += 1;
        let _ = teardown_locked(&mut state, &self.inner.options).await;
        if was_active {
            tracing::info!(parent: &self.inner.span, target = "ayame", "disconnected");
        }
    }

    pub async fn on_open<F>(&self, handler: F)
    where
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        self.inner.state.lock().await.callbacks.on_open = Arc::new(handler);
    }

    pub async fn on_connect<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.state.lock().await.callbacks.on_connect = Arc::new(handler);
    }

    pub async fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(&str, Option<&SignalingError>) + Send + Sync + 'static,
    {
        self.inner.state.lock().await.callbacks.on_disconnect = Arc::new(handler);
    }

    pub async fn on_track_packet<F>(&self, handler: F)
    where
        F: Fn(&TrackPacket) + Send + Sync + 'static,
    {
        self.inner.state.lock().await.callbacks.on_track_packet = Arc::new(handler);
    }

    pub async fn on_bye<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.state.lock().await.callbacks.on_bye = Arc::new(handler);
    }

    /// Relay-assigned id of the current registration.
    pub async fn connection_id(&self) -> Option<String> {
        self.inner.state.lock().await.negotiation.connection_id.clone()
    }

    pub async fn authz_metadata(&self) -> Option<Value> {
        self.inner.state.lock().await.negotiation.authz_metadata.clone()
    }

    pub async fn phase(&self) -> NegotiationPhase {
        self.inner.state.lock().await.negotiation.phase
    }

    pub async fn ice_phase(&self) -> IcePhase {
        self.inner.state.lock().await.negotiation.ice_phase
    }
}

impl Inner {
    fn register_message(&self) -> Register {
        let client_id = self
            .options
            .client_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Register {
            room_id: self.room_id.clone(),
            client_id: Some(client_id),
            authn_metadata: self.authn_metadata.clone(),
            signaling_key: self.options.signaling_key(),
            ayame_client: AYAME_CLIENT.to_string(),
            environment: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        epoch: u64,
        reader: ChannelReader,
        frames: mpsc::Sender<Vec<u8>>,
        dispatch: JoinHandle<()>,
    ) {
        let end = reader.run(frames).await;
        tracing::debug!(target = "ayame", ?end, "relay read loop finished");
        // Let already queued frames drain before the channel is declared gone.
        if let Err(err) = dispatch.await {
            tracing::warn!(target = "ayame", error = %err, "dispatch task failed");
        }
        self.teardown(epoch, Teardown::disconnect(reason::EXIT_RECV, None))
            .await;
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        epoch: u64,
        mut frames: mpsc::Receiver<Vec<u8>>,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        loop {
            let input = tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => Input::Frame(frame),
                    None => break,
                },
                Some(event) = events.recv() => Input::Engine(event),
                else => break,
            };

            let (transition, callbacks) = {
                let mut state = self.state.lock().await;
                if state.epoch != epoch {
                    break;
                }
                let (Some(channel), Some(events_tx)) = (state.channel.clone(), state.events.clone())
                else {
                    break;
                };
                let inner = Arc::downgrade(&self);
                let observer_for = move |generation: u64| -> Arc<dyn SessionObserver> {
                    Arc::new(ConnectionObserver {
                        inner: inner.clone(),
                        generation,
                        events: events_tx.clone(),
                    })
                };
                let ctx = NegotiationContext {
                    outbound: channel.as_ref(),
                    engine: self.engine.as_ref(),
                    options: &self.options,
                    observer_for: &observer_for,
                    debug: self.debug,
                };
                let transition = match input {
                    Input::Frame(raw) => state
                        .negotiation
                        .handle_frame(&ctx, &raw)
                        .await
                        .unwrap_or_else(|err| {
                            tracing::warn!(target = "ayame", error = %err, "protocol error, closing connection");
                            Transition::disconnect(reason::INVALID_MESSAGE, Some(err))
                        }),
                    Input::Engine(EngineEvent { generation, event }) => {
                        state
                            .negotiation
                            .handle_engine_event(&ctx, generation, event)
                            .await
                    }
                };
                (transition, state.callbacks.clone())
            };

            // Notices such as bye fire while the relay channel is still up.
            for notice in transition.notices {
                callbacks.dispatch(notice);
            }
            if let Some(teardown) = transition.teardown {
                self.teardown(epoch, teardown).await;
                break;
            }
        }
        tracing::trace!(target = "ayame", "dispatch loop finished");
    }

    /// Tears down the connection of `epoch` unless it is already gone, then
    /// reports the reason, if any, to the handler installed at that moment.
    async fn teardown(&self, epoch: u64, teardown: Teardown) {
        let callbacks = {
            let mut state = self.state.lock().await;
            if state.epoch != epoch || !state.is_active() {
                return;
            }
            let callbacks = teardown_locked(&mut state, &self.options).await;
            state.negotiation.phase = NegotiationPhase::Closed;
            callbacks
        };
        match teardown.disconnect {
            Some((reason, error)) => {
                tracing::info!(target = "ayame", reason = %reason, "connection closed");
                callbacks.dispatch(Notice::Disconnected { reason, error });
            }
            None => tracing::info!(target = "ayame", "connection closed by peer"),
        }
    }
}

/// Closes the session, then the channel, and resets the negotiation and
/// the handlers. Returns the handlers that were installed.
async fn teardown_locked(state: &mut State, options: &ConnectionOptions) -> Callbacks {
    if let Some(active) = state.negotiation.take_session() {
        active.handle.close().await;
    }
    if let Some(channel) = state.channel.take() {
        channel.close().await;
    }
    state.events = None;
    state.negotiation.reset(&options.fallback_relay_servers);
    std::mem::take(&mut state.callbacks)
}

/// Bridges one session generation back into the connection.
struct ConnectionObserver {
    inner: Weak<Inner>,
    generation: u64,
    events: mpsc::UnboundedSender<EngineEvent>,
}

#[async_trait]
impl SessionObserver for ConnectionObserver {
    fn notify(&self, event: SessionEvent) {
        let _ = self.events.send(EngineEvent {
            generation: self.generation,
            event,
        });
    }

    async fn deliver_packet(&self, packet: TrackPacket) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let handler = {
            let state = inner.state.lock().await;
            if state.negotiation.session_generation() != Some(self.generation) {
                return;
            }
            Arc::clone(&state.callbacks.on_track_packet)
        };
        handler(&packet);
    }
}
