use crate::error::{CallError, Result};
use crate::logger::dump_candidate;
use crate::peer::types::{
    ConnectionState, IceCandidate, IceServer, LocalMedia, MediaKind, TrackHandle,
};
use crate::utils::{add_ice_url_scheme, random_id};
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Asynchronous feedback from a transport, tagged with the participant it belongs to.
#[derive(Debug, Clone)]
pub enum TransportSignal {
    LocalCandidate {
        participant_id: String,
        candidate: IceCandidate,
    },
    StateChanged {
        participant_id: String,
        state: ConnectionState,
    },
    RemoteTrack {
        participant_id: String,
        track: TrackHandle,
    },
    RemoteTrackRemoved {
        participant_id: String,
        track: TrackHandle,
    },
}

pub type SignalSender = mpsc::UnboundedSender<TransportSignal>;

/// One offer/answer negotiation channel. SDP is treated as opaque text.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attaches local capture tracks for sending.
    async fn add_local_media(&self, media: &LocalMedia) -> Result<()>;

    /// Declares a receive-only intent for one media kind.
    async fn add_receive_only(&self, kind: MediaKind) -> Result<()>;

    async fn create_offer(&self) -> Result<String>;

    async fn set_local_offer(&self, sdp: &str) -> Result<()>;

    async fn set_remote_answer(&self, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;

    fn connection_state(&self) -> ConnectionState;

    async fn close(&self) -> Result<()>;
}

/// Creates transports and owns local capture.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Feedback for the new transport must be sent on `signals`.
    async fn create_transport(
        &self,
        participant_id: &str,
        ice_servers: &[IceServer],
        signals: SignalSender,
    ) -> Result<Arc<dyn PeerTransport>>;

    async fn acquire_local_media(&self, stream_id: &str) -> Result<LocalMedia>;

    fn set_track_enabled(&self, track: &TrackHandle, enabled: bool);

    async fn release_local_media(&self, media: &LocalMedia);
}

/// Transport factory backed by the `webrtc` crate.
pub struct RtcTransportFactory {
    api: API,
    local_tracks: Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>,
    disabled_tracks: Mutex<HashSet<String>>,
}

impl RtcTransportFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            local_tracks: Arc::new(Mutex::new(HashMap::new())),
            disabled_tracks: Mutex::new(HashSet::new()),
        })
    }

    /// Sample sink for a local track; capture code writes media into it.
    pub fn local_track(&self, id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().get(id).cloned()
    }

    /// Capture code should skip writing samples for disabled tracks.
    pub fn is_track_enabled(&self, id: &str) -> bool {
        !self.disabled_tracks.lock().contains(id)
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create_transport(
        &self,
        participant_id: &str,
        ice_servers: &[IceServer],
        signals: SignalSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        let pc = Arc::new(self.api.new_peer_connection(rtc_config(ice_servers)).await?);

        let id = participant_id.to_owned();
        let tx = signals.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            let participant_id = id.clone();
            Box::pin(async move {
                let Some(c) = cand else {
                    debug!("ICE gathering completed for {}", participant_id);
                    return;
                };
                match c.to_json() {
                    Ok(init) => {
                        let candidate = IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        };
                        dump_candidate("LOCAL", &candidate);
                        let _ = tx.send(TransportSignal::LocalCandidate {
                            participant_id,
                            candidate,
                        });
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {:?}", e),
                }
            })
        }));

        let id = participant_id.to_owned();
        let tx = signals.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            debug!("Peer connection {} state changed to: {:?}", id, st);
            let _ = tx.send(TransportSignal::StateChanged {
                participant_id: id.clone(),
                state: map_state(st),
            });
            Box::pin(async {})
        }));

        let id = participant_id.to_owned();
        let tx = signals;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                let _ = tx.send(TransportSignal::RemoteTrack {
                    participant_id: id.clone(),
                    track: TrackHandle {
                        id: track.id(),
                        kind,
                    },
                });
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(RtcTransport {
            pc,
            local_tracks: self.local_tracks.clone(),
        }))
    }

    async fn acquire_local_media(&self, stream_id: &str) -> Result<LocalMedia> {
        let audio = TrackHandle {
            id: format!("{stream_id}-audio-{}", random_id()),
            kind: MediaKind::Audio,
        };
        let video = TrackHandle {
            id: format!("{stream_id}-video-{}", random_id()),
            kind: MediaKind::Video,
        };

        let mut tracks = self.local_tracks.lock();
        for (handle, mime) in [(&audio, MIME_TYPE_OPUS), (&video, MIME_TYPE_VP8)] {
            let track = TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime.to_owned(),
                    ..Default::default()
                },
                handle.id.clone(),
                stream_id.to_owned(),
            );
            tracks.insert(handle.id.clone(), Arc::new(track));
        }

        Ok(LocalMedia {
            stream_id: stream_id.to_owned(),
            audio: Some(audio),
            video: Some(video),
            audio_enabled: true,
            video_enabled: true,
        })
    }

    fn set_track_enabled(&self, track: &TrackHandle, enabled: bool) {
        let mut disabled = self.disabled_tracks.lock();
        if enabled {
            disabled.remove(&track.id);
        } else {
            disabled.insert(track.id.clone());
        }
    }

    async fn release_local_media(&self, media: &LocalMedia) {
        let mut tracks = self.local_tracks.lock();
        let mut disabled = self.disabled_tracks.lock();
        for track in media.tracks() {
            tracks.remove(&track.id);
            disabled.remove(&track.id);
        }
    }
}

struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    local_tracks: Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn add_local_media(&self, media: &LocalMedia) -> Result<()> {
        for handle in media.tracks() {
            let track = self
                .local_tracks
                .lock()
                .get(&handle.id)
                .cloned()
                .ok_or_else(|| CallError::InvalidMedia(format!("unknown track {}", handle.id)))?;
            let track: Arc<dyn TrackLocal + Send + Sync> = track;
            self.pc
                .add_transceiver_from_track(
                    track,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
        }
        Ok(())
    }

    async fn add_receive_only(&self, kind: MediaKind) -> Result<()> {
        let codec_type = match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        };
        self.pc
            .add_transceiver_from_kind(
                codec_type,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        Ok(self.pc.create_offer(None).await?.sdp)
    }

    async fn set_local_offer(&self, sdp: &str) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp.to_owned())?;
        self.pc.set_local_description(offer).await?;
        Ok(())
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_owned())?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        map_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn rtc_config(servers: &[IceServer]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: rtc_ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server
                .urls
                .iter()
                .map(|url| add_ice_url_scheme(server, url))
                .collect(),
            username: server.username.clone(),
            credential: server.credential.clone(),
            ..Default::default()
        })
        .collect()
}
