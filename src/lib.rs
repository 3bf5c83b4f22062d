pub mod config;
pub mod dispatcher;
pub mod error;
pub mod logger;
pub mod negotiation;
pub mod peer;
pub mod polling;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::CallConfig;
pub use error::{CallError, Result};
pub use logger::{CallObserver, LogObserver};
pub use peer::connection::{PeerTransport, RtcTransportFactory, SignalSender, TransportFactory, TransportSignal};
pub use peer::state::CallState;
pub use peer::types::{
    ConnectionState, IceCandidate, IceServer, LocalMedia, MediaKind, MediaStatus, Participant,
    Room, TrackHandle,
};
pub use session::CallSession;
pub use signaling::{
    Endpoint, HttpMethod, HttpSignaling, ServerEvent, SignalingChannel, SignalingResponse,
};
