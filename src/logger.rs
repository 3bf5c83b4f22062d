use crate::config::DEFAULT_LOG_FILTER;
use crate::peer::types::{IceCandidate, MediaKind, TrackHandle};
use log::{debug, info};
use std::sync::Arc;

/// Installs `env_logger`, honouring `RUST_LOG`. Safe to call more than once.
pub fn init() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(DEFAULT_LOG_FILTER),
    )
    .format_timestamp_millis()
    .try_init();
}

/// Trickle-ICE trace.
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?}",
        cand.candidate, cand.sdp_mid, cand.sdp_mline_index
    );
}

/// UI and diagnostic callbacks. Every method defaults to a no-op.
pub trait CallObserver: Send + Sync {
    fn on_render_remote_view(&self, _track: &TrackHandle, _slot: u32, _display_name: &str, _muted: bool) {}

    fn on_render_local_view(&self, _track: &TrackHandle) {}

    fn on_remove_remote_view(&self, _track: &TrackHandle, _slot: u32) {}

    fn on_media_status_changed(&self, _slot: u32, _kind: MediaKind, _status: bool) {}

    fn on_connected(&self, _connected: bool) {}

    fn on_users_left(&self, _slots: &[u32]) {}

    fn on_peer_connected(&self, _participant_id: &str, _slot: u32) {}

    fn on_session_destroyed(&self) {}
}

/// Observer that only logs.
pub struct LogObserver;

impl CallObserver for LogObserver {}

/// Logs every callback before handing it to the observer.
#[derive(Clone)]
pub struct Emitter {
    observer: Arc<dyn CallObserver>,
}

impl Emitter {
    pub fn new(observer: Arc<dyn CallObserver>) -> Self {
        Self { observer }
    }

    pub fn render_remote_view(&self, track: &TrackHandle, slot: u32, display_name: &str, muted: bool) {
        info!(
            "emit render_remote_view: track={} slot={} name={:?} muted={}",
            track.id, slot, display_name, muted
        );
        self.observer
            .on_render_remote_view(track, slot, display_name, muted);
    }

    pub fn render_local_view(&self, track: &TrackHandle) {
        info!("emit render_local_view: track={}", track.id);
        self.observer.on_render_local_view(track);
    }

    pub fn remove_remote_view(&self, track: &TrackHandle, slot: u32) {
        info!("emit remove_remote_view: track={} slot={}", track.id, slot);
        self.observer.on_remove_remote_view(track, slot);
    }

    pub fn media_status_changed(&self, slot: u32, kind: MediaKind, status: bool) {
        info!(
            "emit media_status_changed: slot={} kind={} status={}",
            slot, kind, status
        );
        self.observer.on_media_status_changed(slot, kind, status);
    }

    pub fn connected(&self, connected: bool) {
        info!("emit connected: {}", connected);
        self.observer.on_connected(connected);
    }

    pub fn users_left(&self, slots: &[u32]) {
        if slots.is_empty() {
            return;
        }
        info!("emit users_left: {:?}", slots);
        self.observer.on_users_left(slots);
    }

    pub fn peer_connected(&self, participant_id: &str, slot: u32) {
        info!("emit peer_connected: {} slot={}", participant_id, slot);
        self.observer.on_peer_connected(participant_id, slot);
    }

    pub fn session_destroyed(&self) {
        info!("emit session_destroyed");
        self.observer.on_session_destroyed();
    }
}
