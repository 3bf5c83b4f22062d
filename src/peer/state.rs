use crate::config::CallConfig;
use crate::error::{CallError, Result};
use crate::logger::Emitter;
use crate::peer::connection::{SignalSender, TransportFactory, TransportSignal};
use crate::peer::ice::{assemble_ice_servers, EarlyArrivals};
use crate::peer::registry::PeerRegistry;
use crate::peer::types::{IceServer, LocalMedia, Participant, TrackHandle};
use crate::signaling::{Endpoint, HttpMethod, SignalingChannel, SignalingResponse};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Local call progress. Diagnostic only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallState {
    #[default]
    NoCall,
    ProcessingCall,
    InCall,
}

/// Everything one Session owns. Guarded by a single lock that is never held
/// across an await point.
#[derive(Debug)]
pub struct SessionState {
    pub local_user: Option<Participant>,
    pub session_id: Option<String>,
    pub call_state: CallState,
    /// Monotonic for the lifetime of a Session.
    pub publisher_ready: bool,
    pub connected: bool,
    pub registry: PeerRegistry,
    pub early: EarlyArrivals,
    /// TURN credentials fetched for the local user.
    pub turn_servers: Vec<IceServer>,
    pub local_media: Option<LocalMedia>,
    /// Remote tracks by participant id.
    pub remote_tracks: HashMap<String, Vec<TrackHandle>>,
}

impl SessionState {
    pub fn new(max_early_candidates: usize) -> Self {
        Self {
            local_user: None,
            session_id: None,
            call_state: CallState::NoCall,
            publisher_ready: false,
            connected: false,
            registry: PeerRegistry::new(),
            early: EarlyArrivals::new(max_early_candidates),
            turn_servers: Vec::new(),
            local_media: None,
            remote_tracks: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> Option<&str> {
        self.local_user
            .as_ref()
            .map(|u| u.id.as_str())
            .filter(|id| !id.is_empty())
    }

    pub fn is_local(&self, participant_id: &str) -> bool {
        self.local_id() == Some(participant_id)
    }

    /// Session id and local id, both required by every in-call request.
    pub fn call_ids(&self) -> Result<(String, String)> {
        let session_id = self
            .session_id
            .clone()
            .ok_or_else(|| CallError::InvalidState("no active session".into()))?;
        let local_id = self
            .local_id()
            .map(str::to_owned)
            .ok_or_else(|| CallError::InvalidState("local user is not set".into()))?;
        Ok((session_id, local_id))
    }

    /// Flips publisher-ready and returns the join backlog, only on the
    /// first transition.
    pub fn mark_publisher_ready(&mut self) -> Option<Vec<Participant>> {
        if self.publisher_ready {
            return None;
        }
        self.publisher_ready = true;
        Some(self.early.flush_all())
    }

    /// Resets per-Session state for a fresh join.
    pub fn begin_session(&mut self, session_id: String) {
        self.session_id = Some(session_id);
        self.publisher_ready = false;
        self.early.clear();
        let local_id = self.local_id().map(str::to_owned);
        self.registry.set_local_id(local_id);
    }

    pub fn end_session(&mut self) {
        self.session_id = None;
        self.publisher_ready = false;
        self.connected = false;
        self.early.clear();
        self.call_state = CallState::NoCall;
    }
}

/// Shared by the public facade, the polling task and the transport signal pump.
pub struct CallContext {
    pub config: CallConfig,
    pub signaling: Arc<dyn SignalingChannel>,
    pub transports: Arc<dyn TransportFactory>,
    pub emitter: Emitter,
    pub state: Mutex<SessionState>,
    pub stop: AtomicBool,
    pub poll_task: Mutex<Option<JoinHandle<()>>>,
    pub signal_tx: SignalSender,
    pub signal_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportSignal>>>,
}

impl CallContext {
    pub fn new(
        config: CallConfig,
        signaling: Arc<dyn SignalingChannel>,
        transports: Arc<dyn TransportFactory>,
        emitter: Emitter,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let state = SessionState::new(config.max_early_candidates);
        Self {
            config,
            signaling,
            transports,
            emitter,
            state: Mutex::new(state),
            stop: AtomicBool::new(true),
            poll_task: Mutex::new(None),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
        }
    }

    pub async fn send(
        &self,
        endpoint: Endpoint,
        payload: Option<Value>,
        method: HttpMethod,
    ) -> Result<SignalingResponse> {
        self.signaling.send(&endpoint, payload, method).await
    }

    pub fn call_ids(&self) -> Result<(String, String)> {
        self.state.lock().call_ids()
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        let state = self.state.lock();
        assemble_ice_servers(&self.config.ice_servers, &state.turn_servers)
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn set_stopped(&self, stopped: bool) {
        self.stop.store(stopped, Ordering::SeqCst);
    }

    /// Aborts the pending fetch, if any.
    pub fn cancel_polling(&self) {
        self.set_stopped(true);
        if let Some(handle) = self.poll_task.lock().take() {
            handle.abort();
        }
    }
}
