use std::sync::Arc;

use serde_json::Value;

use crate::error::SignalingError;
use crate::session::TrackPacket;

pub type OpenHandler = Arc<dyn Fn(Option<&Value>) + Send + Sync>;
pub type ConnectHandler = Arc<dyn Fn() + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn(&str, Option<&SignalingError>) + Send + Sync>;
pub type TrackPacketHandler = Arc<dyn Fn(&TrackPacket) + Send + Sync>;
pub type ByeHandler = Arc<dyn Fn() + Send + Sync>;

/// Consumer handlers. Every slot holds a no-op until replaced.
#[derive(Clone)]
pub(crate) struct Callbacks {
    pub on_open: OpenHandler,
    pub on_connect: ConnectHandler,
    pub on_disconnect: DisconnectHandler,
    pub on_track_packet: TrackPacketHandler,
    pub on_bye: ByeHandler,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            on_open: Arc::new(|_: Option<&Value>| {}),
            on_connect: Arc::new(|| {}),
            on_disconnect: Arc::new(|_: &str, _: Option<&SignalingError>| {}),
            on_track_packet: Arc::new(|_: &TrackPacket| {}),
            on_bye: Arc::new(|| {}),
        }
    }
}

/// A consumer-visible event produced while handling a frame or engine event.
#[derive(Debug)]
pub(crate) enum Notice {
    Open(Option<Value>),
    Connected,
    Bye,
    Disconnected {
        reason: String,
        error: Option<SignalingError>,
    },
}

impl Callbacks {
    /// Runs the matching handler. Called without the connection lock held.
    pub fn dispatch(&self, notice: Notice) {
        match notice {
            Notice::Open(metadata) => (self.on_open)(metadata.as_ref()),
            Notice::Connected => (self.on_connect)(),
            Notice::Bye => (self.on_bye)(),
            Notice::Disconnected { reason, error } => (self.on_disconnect)(&reason, error.as_ref()),
        }
    }
}
