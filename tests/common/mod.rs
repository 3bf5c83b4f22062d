use async_trait::async_trait;
use parking_lot::Mutex;
use roomcall::{
    CallConfig, CallError, CallObserver, CallSession, ConnectionState, Endpoint, HttpMethod,
    IceCandidate, IceServer, LocalMedia, MediaKind, Participant, PeerTransport, Result,
    SignalSender, SignalingChannel, SignalingResponse, TrackHandle, TransportFactory,
    TransportSignal,
};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub const SESSION_ID: &str = "sess-1";
pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Request {
    pub endpoint: Endpoint,
    pub payload: Option<Value>,
    pub method: HttpMethod,
}

pub enum Fetch {
    Batch(Vec<String>),
    Fail,
}

/// In-memory signaling server. Event fetches are served from a script;
/// once it runs dry every fetch returns an empty batch.
#[derive(Default)]
pub struct FakeSignaling {
    requests: Mutex<Vec<Request>>,
    fetches: Mutex<VecDeque<Fetch>>,
    rejected_offers: Mutex<HashSet<String>>,
    fail_next_join: Mutex<bool>,
}

impl FakeSignaling {
    pub fn push_batch(&self, events: &[Value]) {
        let encoded = events.iter().map(Value::to_string).collect();
        self.fetches.lock().push_back(Fetch::Batch(encoded));
    }

    pub fn push_raw_batch(&self, events: Vec<String>) {
        self.fetches.lock().push_back(Fetch::Batch(events));
    }

    pub fn push_failures(&self, count: usize) {
        let mut fetches = self.fetches.lock();
        for _ in 0..count {
            fetches.push_back(Fetch::Fail);
        }
    }

    /// Offers addressed to `callee` fail until `accept_offers_for`.
    pub fn reject_offers_for(&self, callee: &str) {
        self.rejected_offers.lock().insert(callee.to_owned());
    }

    pub fn accept_offers_for(&self, callee: &str) {
        self.rejected_offers.lock().remove(callee);
    }

    pub fn fail_next_join(&self) {
        *self.fail_next_join.lock() = true;
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn requests_matching(&self, pred: impl Fn(&Request) -> bool) -> Vec<Request> {
        self.requests.lock().iter().filter(|r| pred(r)).cloned().collect()
    }

    pub fn event_fetches(&self) -> usize {
        self.requests_matching(|r| {
            matches!(r.endpoint, Endpoint::Events { .. }) && r.method == HttpMethod::Get
        })
        .len()
    }

    pub fn offers(&self) -> Vec<Value> {
        self.requests_matching(|r| r.endpoint == Endpoint::Offer)
            .into_iter()
            .filter_map(|r| r.payload)
            .collect()
    }
}

#[async_trait]
impl SignalingChannel for FakeSignaling {
    async fn send(
        &self,
        endpoint: &Endpoint,
        payload: Option<Value>,
        method: HttpMethod,
    ) -> Result<SignalingResponse> {
        let callee = payload
            .as_ref()
            .and_then(|p| p["calleeUserId"].as_str())
            .map(str::to_owned);
        self.requests.lock().push(Request {
            endpoint: endpoint.clone(),
            payload,
            method,
        });

        let body = match endpoint {
            Endpoint::Join { .. } => {
                if std::mem::take(&mut *self.fail_next_join.lock()) {
                    return Err(CallError::NetworkFailure("join refused".into()));
                }
                SESSION_ID.to_owned()
            }
            Endpoint::Offer
                if callee
                    .as_deref()
                    .is_some_and(|c| self.rejected_offers.lock().contains(c)) =>
            {
                return Err(CallError::NetworkFailure("offer refused".into()));
            }
            Endpoint::Events { .. } if method == HttpMethod::Get => {
                match self.fetches.lock().pop_front() {
                    Some(Fetch::Fail) => {
                        return Err(CallError::NetworkFailure("scripted failure".into()))
                    }
                    Some(Fetch::Batch(events)) => serde_json::to_string(&events)?,
                    None => "[]".to_owned(),
                }
            }
            Endpoint::CreateUser => json!({ "id": "me", "login": "alice" }).to_string(),
            Endpoint::TurnCredentials { .. } => json!({
                "uris": ["turn:10.0.0.1:3478?transport=udp"],
                "username": "1652113421:me",
                "password": "secret",
                "ttl": 86400
            })
            .to_string(),
            Endpoint::CreateRoom => json!({
                "id": "r1",
                "uuid": "room-42",
                "userLogin": "alice",
                "creatorToken": "tok-1",
                "ttl": 2592000
            })
            .to_string(),
            _ => String::new(),
        };
        Ok(SignalingResponse::new(200, body))
    }
}

pub struct FakeTransport {
    pub participant_id: String,
    signals: SignalSender,
    state: Mutex<ConnectionState>,
    calls: Mutex<Vec<String>>,
    candidates: Mutex<Vec<String>>,
    failures: Arc<Mutex<HashSet<&'static str>>>,
}

impl FakeTransport {
    /// Fails `op` if the factory armed it, consuming the arm.
    fn check(&self, op: &'static str) -> Result<()> {
        if self.failures.lock().remove(op) {
            return Err(CallError::TransportFailure(format!("{op} rejected")));
        }
        Ok(())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Candidate lines applied to this transport, in order.
    pub fn applied_candidates(&self) -> Vec<String> {
        self.candidates.lock().clone()
    }

    /// Changes the state without reporting it.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    /// Changes the state and reports it, as a real transport would.
    pub fn report_state(&self, state: ConnectionState) {
        self.set_state(state);
        let _ = self.signals.send(TransportSignal::StateChanged {
            participant_id: self.participant_id.clone(),
            state,
        });
    }

    pub fn end_remote_track(&self, track_id: &str) {
        let _ = self.signals.send(TransportSignal::RemoteTrackRemoved {
            participant_id: self.participant_id.clone(),
            track: TrackHandle {
                id: track_id.to_owned(),
                kind: MediaKind::Video,
            },
        });
    }

    pub fn gather_candidate(&self, line: &str) {
        let _ = self.signals.send(TransportSignal::LocalCandidate {
            participant_id: self.participant_id.clone(),
            candidate: IceCandidate {
                candidate: line.to_owned(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        });
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<()> {
        self.calls
            .lock()
            .push(format!("add_local_media:{}", media.stream_id));
        Ok(())
    }

    async fn add_receive_only(&self, kind: MediaKind) -> Result<()> {
        self.calls.lock().push(format!("recvonly:{kind}"));
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        self.check("create_offer")?;
        self.calls.lock().push("create_offer".into());
        Ok(format!("offer-for-{}", self.participant_id))
    }

    async fn set_local_offer(&self, sdp: &str) -> Result<()> {
        self.check("set_local_offer")?;
        self.calls.lock().push(format!("set_local_offer:{sdp}"));
        Ok(())
    }

    /// Accepting the answer surfaces the remote video track.
    async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
        self.check("set_remote_answer")?;
        self.calls.lock().push(format!("set_remote_answer:{sdp}"));
        let _ = self.signals.send(TransportSignal::RemoteTrack {
            participant_id: self.participant_id.clone(),
            track: TrackHandle {
                id: format!("{}-video", self.participant_id),
                kind: MediaKind::Video,
            },
        });
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.candidates.lock().push(candidate.candidate.clone());
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<()> {
        *self.state.lock() = ConnectionState::Closed;
        self.calls.lock().push("close".into());
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    transports: Mutex<HashMap<String, Vec<Arc<FakeTransport>>>>,
    ice_servers: Mutex<Vec<Vec<IceServer>>>,
    track_flags: Mutex<Vec<(String, bool)>>,
    released: Mutex<Vec<String>>,
    failures: Arc<Mutex<HashSet<&'static str>>>,
}

impl FakeFactory {
    /// The next call to `op` on any transport fails with `TransportFailure`.
    pub fn fail_next(&self, op: &'static str) {
        self.failures.lock().insert(op);
    }

    /// Most recently created transport for the participant.
    pub fn transport(&self, participant_id: &str) -> Option<Arc<FakeTransport>> {
        self.transports
            .lock()
            .get(participant_id)
            .and_then(|all| all.last().cloned())
    }

    pub fn created(&self, participant_id: &str) -> usize {
        self.transports
            .lock()
            .get(participant_id)
            .map_or(0, Vec::len)
    }

    pub fn last_ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers.lock().last().cloned().unwrap_or_default()
    }

    pub fn track_flags(&self) -> Vec<(String, bool)> {
        self.track_flags.lock().clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create_transport(
        &self,
        participant_id: &str,
        ice_servers: &[IceServer],
        signals: SignalSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = Arc::new(FakeTransport {
            participant_id: participant_id.to_owned(),
            signals,
            state: Mutex::new(ConnectionState::New),
            calls: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            failures: self.failures.clone(),
        });
        self.ice_servers.lock().push(ice_servers.to_vec());
        self.transports
            .lock()
            .entry(participant_id.to_owned())
            .or_default()
            .push(transport.clone());
        Ok(transport)
    }

    async fn acquire_local_media(&self, stream_id: &str) -> Result<LocalMedia> {
        Ok(LocalMedia {
            stream_id: stream_id.to_owned(),
            audio: Some(TrackHandle {
                id: format!("{stream_id}-audio0"),
                kind: MediaKind::Audio,
            }),
            video: Some(TrackHandle {
                id: format!("{stream_id}-video0"),
                kind: MediaKind::Video,
            }),
            audio_enabled: true,
            video_enabled: true,
        })
    }

    fn set_track_enabled(&self, track: &TrackHandle, enabled: bool) {
        self.track_flags.lock().push((track.id.clone(), enabled));
    }

    async fn release_local_media(&self, media: &LocalMedia) {
        self.released.lock().push(media.stream_id.clone());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    RenderRemote {
        track_id: String,
        slot: u32,
        name: String,
        muted: bool,
    },
    RenderLocal(String),
    RemoveRemote {
        track_id: String,
        slot: u32,
    },
    MediaStatus {
        slot: u32,
        kind: MediaKind,
        status: bool,
    },
    Connected(bool),
    UsersLeft(Vec<u32>),
    PeerConnected {
        participant_id: String,
        slot: u32,
    },
    SessionDestroyed,
}

pub struct RecordingObserver {
    tx: mpsc::UnboundedSender<Observed>,
}

impl CallObserver for RecordingObserver {
    fn on_render_remote_view(&self, track: &TrackHandle, slot: u32, display_name: &str, muted: bool) {
        let _ = self.tx.send(Observed::RenderRemote {
            track_id: track.id.clone(),
            slot,
            name: display_name.to_owned(),
            muted,
        });
    }

    fn on_render_local_view(&self, track: &TrackHandle) {
        let _ = self.tx.send(Observed::RenderLocal(track.id.clone()));
    }

    fn on_remove_remote_view(&self, track: &TrackHandle, slot: u32) {
        let _ = self.tx.send(Observed::RemoveRemote {
            track_id: track.id.clone(),
            slot,
        });
    }

    fn on_media_status_changed(&self, slot: u32, kind: MediaKind, status: bool) {
        let _ = self.tx.send(Observed::MediaStatus { slot, kind, status });
    }

    fn on_connected(&self, connected: bool) {
        let _ = self.tx.send(Observed::Connected(connected));
    }

    fn on_users_left(&self, slots: &[u32]) {
        let _ = self.tx.send(Observed::UsersLeft(slots.to_vec()));
    }

    fn on_peer_connected(&self, participant_id: &str, slot: u32) {
        let _ = self.tx.send(Observed::PeerConnected {
            participant_id: participant_id.to_owned(),
            slot,
        });
    }

    fn on_session_destroyed(&self) {
        let _ = self.tx.send(Observed::SessionDestroyed);
    }
}

pub struct Harness {
    pub session: CallSession,
    pub signaling: Arc<FakeSignaling>,
    pub transports: Arc<FakeFactory>,
    pub observed: mpsc::UnboundedReceiver<Observed>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CallConfig {
            poll_interval_ms: 2,
            ..CallConfig::new("calls.test", Some("token-1".into()))
        })
    }

    pub fn with_config(config: CallConfig) -> Self {
        let signaling = Arc::new(FakeSignaling::default());
        let transports = Arc::new(FakeFactory::default());
        let (tx, observed) = mpsc::unbounded_channel();
        let session = CallSession::new(
            config,
            signaling.clone(),
            transports.clone(),
            Arc::new(RecordingObserver { tx }),
        );
        session.set_local_user(Participant::new("me").with_user_name("alice"));
        Self {
            session,
            signaling,
            transports,
            observed,
        }
    }

    /// Joins "room-42" and publishes, leaving the publisher ready.
    pub async fn in_call() -> Self {
        let harness = Self::new();
        harness.session.join("room-42").await.unwrap();
        harness.session.publish().await.unwrap();
        harness
    }

    /// Waits for the first observed callback matching `pred`, skipping others.
    pub async fn wait_for(&mut self, pred: impl Fn(&Observed) -> bool) -> Observed {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.observed.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("observer channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for callback")
    }

    /// Everything observed so far, without waiting.
    pub fn drain_observed(&mut self) -> Vec<Observed> {
        let mut seen = Vec::new();
        while let Ok(event) = self.observed.try_recv() {
            seen.push(event);
        }
        seen
    }
}

/// Polls `cond` until it holds or the wait budget runs out.
pub async fn eventually(cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

pub fn candidate_event(participant_id: &str, n: u32) -> Value {
    json!({
        "typeMessage": "ICE_CANDIDATE",
        "calleeUserId": participant_id,
        "candidate": candidate_line(n),
        "sdpMid": "0",
        "sdpMLineIndex": 0
    })
}

pub fn candidate_line(n: u32) -> String {
    format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host")
}

pub fn remote_candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: candidate_line(n),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
    }
}
