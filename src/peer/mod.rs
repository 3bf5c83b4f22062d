pub mod connection;
pub mod ice;
pub mod registry;
pub mod state;
pub mod types;

pub use connection::{PeerTransport, RtcTransportFactory, TransportFactory, TransportSignal};
pub use ice::EarlyArrivals;
pub use registry::{PeerRegistry, PeerSession, LOCAL_SLOT};
pub use state::{CallContext, CallState, SessionState};
pub use types::{
    ConnectionState, IceCandidate, IceServer, LocalMedia, MediaKind, MediaStatus, Participant,
    Room, TrackHandle,
};
