//! Session lifecycle: the public facade over one call.

use crate::config::CallConfig;
use crate::dispatcher::{self, remove_peers};
use crate::error::{CallError, Result};
use crate::logger::{CallObserver, Emitter};
use crate::negotiation::{self, send_local_candidate};
use crate::peer::connection::{RtcTransportFactory, TransportFactory, TransportSignal};
use crate::peer::state::{CallContext, CallState};
use crate::peer::types::{
    ConnectionState, IceCandidate, IceServer, MediaKind, MediaStatus, Participant, Room,
};
use crate::polling;
use crate::signaling::{
    parse_session_id, Endpoint, HttpMethod, HttpSignaling, MediaStatusMessage, ServerEvent,
    SignalingChannel,
};
use log::{debug, info, warn};
use serde_json::json;
use std::sync::{Arc, Weak};

/// One call client. Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct CallSession {
    ctx: Arc<CallContext>,
}

impl CallSession {
    pub fn new(
        config: CallConfig,
        signaling: Arc<dyn SignalingChannel>,
        transports: Arc<dyn TransportFactory>,
        observer: Arc<dyn CallObserver>,
    ) -> Self {
        Self {
            ctx: Arc::new(CallContext::new(
                config,
                signaling,
                transports,
                Emitter::new(observer),
            )),
        }
    }

    /// HTTP signaling and `webrtc` transports.
    pub fn connect(config: CallConfig, observer: Arc<dyn CallObserver>) -> Result<Self> {
        let signaling = Arc::new(HttpSignaling::from_config(&config));
        let transports = Arc::new(RtcTransportFactory::new()?);
        Ok(Self::new(config, signaling, transports, observer))
    }

    pub fn config(&self) -> &CallConfig {
        &self.ctx.config
    }

    pub fn set_local_user(&self, user: Participant) {
        let mut state = self.ctx.state.lock();
        state.registry.set_local_id(Some(user.id.clone()));
        state.local_user = Some(user);
    }

    pub fn local_user(&self) -> Option<Participant> {
        self.ctx.state.lock().local_user.clone()
    }

    /// Creates a user on the server, adopts it as the local identity and
    /// fetches its TURN credentials.
    pub async fn create_user(&self, login: &str) -> Result<Participant> {
        let response = self
            .ctx
            .send(Endpoint::CreateUser, Some(json!({ "login": login })), HttpMethod::Post)
            .await?;
        let user: Participant = response
            .json()?
            .ok_or_else(|| CallError::NetworkFailure("empty create-user response".into()))?;
        if user.id.is_empty() {
            return Err(CallError::NetworkFailure("created user has no id".into()));
        }
        info!("Created user {} ({})", user.id, login);
        self.set_local_user(user.clone());

        if let Err(e) = self.fetch_turn_servers().await {
            warn!("TURN credentials unavailable for {}: {}", user.id, e);
        }
        Ok(user)
    }

    /// Fetches TURN credentials for the local user and adds them to the ICE
    /// list used by new transports.
    pub async fn fetch_turn_servers(&self) -> Result<Option<IceServer>> {
        let user_id = self.local_id()?;
        let response = self
            .ctx
            .send(Endpoint::TurnCredentials { user_id }, None, HttpMethod::Get)
            .await?;
        let server: Option<IceServer> = response.json()?;
        if let Some(server) = &server {
            debug!("TURN servers: {:?}", server.urls);
            let mut state = self.ctx.state.lock();
            if !state.turn_servers.contains(server) {
                state.turn_servers.push(server.clone());
            }
        }
        Ok(server)
    }

    pub async fn create_room(&self) -> Result<Room> {
        let user_id = self.local_id()?;
        let body = json!({
            "userId": user_id,
            "permanent": false,
            "ttl": self.ctx.config.room_ttl_secs,
            "record": false,
        });
        let response = self
            .ctx
            .send(Endpoint::CreateRoom, Some(body), HttpMethod::Post)
            .await?;
        response
            .json()?
            .ok_or_else(|| CallError::NetworkFailure("empty create-room response".into()))
    }

    /// Creates a room and joins it; the returned room carries the session id.
    pub async fn create_room_and_join(&self) -> Result<Room> {
        let mut room = self.create_room().await?;
        let session_id = self.join(&room.uuid).await?;
        room.session_id = Some(session_id);
        Ok(room)
    }

    pub async fn delete_room(&self, room_id: &str) -> Result<()> {
        self.ctx
            .send(
                Endpoint::DeleteRoom {
                    room_id: room_id.to_owned(),
                },
                None,
                HttpMethod::Delete,
            )
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, room_id: &str, creator_token: Option<&str>) -> Result<()> {
        self.ctx
            .send(
                Endpoint::DeleteSession {
                    room_id: room_id.to_owned(),
                    creator_token: creator_token.map(str::to_owned),
                },
                None,
                HttpMethod::Delete,
            )
            .await?;
        Ok(())
    }

    /// Joins the session behind `room_hash` and starts polling for events.
    /// Returns the session id issued by the server.
    pub async fn join(&self, room_hash: &str) -> Result<String> {
        let room_hash = room_hash.trim();
        if room_hash.is_empty() {
            return Err(CallError::InvalidState("missing room hash".into()));
        }
        let user_id = self.local_id()?;

        let response = self
            .ctx
            .send(
                Endpoint::Join {
                    room_hash: room_hash.to_owned(),
                },
                Some(json!({ "userId": user_id })),
                HttpMethod::Post,
            )
            .await?;
        let session_id = parse_session_id(&response.text())
            .ok_or_else(|| CallError::NetworkFailure("join returned no session id".into()))?;
        info!("Joined {} as {}, session {}", room_hash, user_id, session_id);
        // A failed join-notify leaves the previous session polling.
        self.ctx.cancel_polling();
        self.ctx.state.lock().begin_session(session_id.clone());

        let added = self
            .ctx
            .send(
                Endpoint::AddParticipant,
                Some(json!({ "userId": user_id, "roomUuid": room_hash })),
                HttpMethod::Post,
            )
            .await;
        if let Err(e) = added {
            self.ctx.state.lock().end_session();
            return Err(e);
        }

        let setup = self
            .ctx
            .send(
                Endpoint::Events {
                    session_id: session_id.clone(),
                    user_id,
                },
                Some(json!({})),
                HttpMethod::Post,
            )
            .await;
        let connected = match setup {
            Ok(_) => true,
            Err(e) => {
                warn!("Event setup failed: {}", e);
                false
            }
        };
        self.ctx.state.lock().connected = connected;
        self.ctx.emitter.connected(connected);

        self.spawn_signal_pump();
        self.ctx.set_stopped(false);
        let handle = polling::spawn(self.ctx.clone());
        *self.ctx.poll_task.lock() = Some(handle);
        Ok(session_id)
    }

    /// Join, capture local media, publish, then announce video as unmuted.
    pub async fn start_call(&self, room_hash: &str) -> Result<String> {
        let session_id = self.join(room_hash).await?;
        self.publish().await?;
        self.change_media_status(MediaKind::Video, false).await?;
        Ok(session_id)
    }

    pub async fn publish(&self) -> Result<()> {
        negotiation::publish(&self.ctx).await
    }

    pub async fn subscribe(&self, participant: Participant) -> Result<()> {
        negotiation::subscribe(&self.ctx, participant).await
    }

    pub async fn apply_answer(&self, participant_id: &str, sdp: &str) -> Result<()> {
        negotiation::apply_answer(&self.ctx, participant_id, sdp).await
    }

    pub async fn apply_candidate(&self, participant_id: &str, candidate: IceCandidate) -> Result<()> {
        negotiation::apply_candidate(&self.ctx, participant_id, candidate).await
    }

    pub async fn dispatch(&self, event: ServerEvent) -> Result<()> {
        dispatcher::dispatch(&self.ctx, event).await
    }

    pub async fn dispatch_batch(&self, events: Vec<Result<ServerEvent>>) -> Vec<Result<()>> {
        dispatcher::dispatch_batch(&self.ctx, events).await
    }

    /// Stops polling, releases local media and tells the server. Peer
    /// sessions are left in place.
    pub async fn leave(&self) -> Result<()> {
        let (session_id, user_id) = self.ctx.call_ids()?;
        self.ctx.cancel_polling();

        let media = {
            let mut state = self.ctx.state.lock();
            state.end_session();
            state.local_media.take()
        };
        if let Some(media) = media {
            self.ctx.transports.release_local_media(&media).await;
        }
        info!("Leaving session {}", session_id);

        self.ctx
            .send(
                Endpoint::Leave {
                    session_id,
                    user_id,
                },
                None,
                HttpMethod::Delete,
            )
            .await?;
        Ok(())
    }

    /// Leave, then drop every peer session whether or not leaving succeeded.
    pub async fn disconnect(&self) -> Result<()> {
        let left = self.leave().await;
        remove_all_peers(&self.ctx).await;
        left
    }

    pub async fn teardown(&self) {
        teardown(&self.ctx).await;
    }

    /// Mutes or unmutes a local track and reports the new status.
    pub async fn change_media_status(&self, kind: MediaKind, mute: bool) -> Result<()> {
        set_local_media_enabled(&self.ctx, kind, !mute).await
    }

    /// Flips the mute state of a local track. Returns whether it is now muted.
    pub async fn toggle_mute(&self, kind: MediaKind) -> Result<bool> {
        let muted = {
            let state = self.ctx.state.lock();
            let media = state
                .local_media
                .as_ref()
                .ok_or_else(|| CallError::InvalidMedia("no local media".into()))?;
            !media.is_enabled(kind)
        };
        let mute = !muted;
        info!("Toggle {} {}", if mute { "mute" } else { "unmute" }, kind);
        self.change_media_status(kind, mute).await?;
        Ok(mute)
    }

    /// Without local media, or without a track of that kind, counts as muted.
    pub fn is_muted(&self, kind: MediaKind) -> bool {
        let state = self.ctx.state.lock();
        match &state.local_media {
            Some(media) => media.track(kind).is_none() || !media.is_enabled(kind),
            None => true,
        }
    }

    /// Asks the server to mute every other participant.
    pub async fn mute_all_users(&self) -> Result<()> {
        let (session_id, user_id) = self.ctx.call_ids()?;
        self.ctx
            .send(
                Endpoint::MuteAll {
                    session_id,
                    user_id,
                },
                None,
                HttpMethod::Post,
            )
            .await?;
        Ok(())
    }

    pub fn session_id(&self) -> Option<String> {
        self.ctx.state.lock().session_id.clone()
    }

    pub fn call_state(&self) -> CallState {
        self.ctx.state.lock().call_state
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.state.lock().connected
    }

    pub fn is_publisher_ready(&self) -> bool {
        self.ctx.state.lock().publisher_ready
    }

    pub fn remote_slots(&self) -> Vec<u32> {
        self.ctx.state.lock().registry.remote_slots()
    }

    pub fn slot_of(&self, participant_id: &str) -> Option<u32> {
        self.ctx
            .state
            .lock()
            .registry
            .get(participant_id)
            .map(|s| s.slot)
    }

    pub fn media_status(&self, participant_id: &str) -> Option<MediaStatus> {
        self.ctx.state.lock().registry.media_status(participant_id)
    }

    pub fn pending_candidates(&self, participant_id: &str) -> usize {
        self.ctx.state.lock().early.pending_candidates(participant_id)
    }

    pub fn pending_joins(&self) -> usize {
        self.ctx.state.lock().early.pending_joins()
    }

    fn local_id(&self) -> Result<String> {
        self.ctx
            .state
            .lock()
            .local_id()
            .map(str::to_owned)
            .ok_or_else(|| CallError::InvalidState("local user is not set".into()))
    }

    /// Starts the transport feedback pump on first join.
    fn spawn_signal_pump(&self) {
        let Some(mut rx) = self.ctx.signal_rx.lock().take() else {
            return;
        };
        let weak: Weak<CallContext> = Arc::downgrade(&self.ctx);
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let Some(ctx) = weak.upgrade() else {
                    break;
                };
                handle_signal(&ctx, signal).await;
            }
            debug!("Transport signal pump stopped");
        });
    }
}

/// Same as leave, without the server call, plus removal of every peer
/// session. Never aborts the poll task, which may be the caller.
pub async fn teardown(ctx: &CallContext) {
    ctx.set_stopped(true);
    let media = {
        let mut state = ctx.state.lock();
        state.end_session();
        state.local_media.take()
    };
    if let Some(media) = media {
        ctx.transports.release_local_media(&media).await;
    }
    remove_all_peers(ctx).await;
    info!("Session torn down");
}

async fn remove_all_peers(ctx: &CallContext) {
    let ids = ctx.state.lock().registry.ids();
    remove_peers(ctx, ids.iter().map(String::as_str)).await;
}

/// Enables or disables a local track, records it and reports it to the server.
pub async fn set_local_media_enabled(ctx: &CallContext, kind: MediaKind, enabled: bool) -> Result<()> {
    let track = {
        let mut state = ctx.state.lock();
        let local_id = state.local_id().map(str::to_owned);
        let media = state
            .local_media
            .as_mut()
            .ok_or_else(|| CallError::InvalidMedia("no local media".into()))?;
        let track = media
            .track(kind)
            .cloned()
            .ok_or_else(|| CallError::InvalidMedia(format!("no local {kind} track")))?;
        media.set_enabled(kind, enabled);
        if let Some(local_id) = local_id {
            state.registry.media_status_mut(&local_id).set(kind, enabled);
        }
        track
    };
    ctx.transports.set_track_enabled(&track, enabled);

    let (session_id, user_id) = ctx.call_ids()?;
    let message = MediaStatusMessage {
        user_id,
        media_type: kind,
        new_status: enabled,
    };
    ctx.send(
        Endpoint::MediaStatus { session_id },
        Some(serde_json::to_value(&message)?),
        HttpMethod::Post,
    )
    .await?;
    Ok(())
}

async fn handle_signal(ctx: &CallContext, signal: TransportSignal) {
    match signal {
        TransportSignal::LocalCandidate {
            participant_id,
            candidate,
        } => {
            if ctx.state.lock().session_id.is_none() {
                debug!("Dropping local candidate for {} outside a session", participant_id);
                return;
            }
            if let Err(e) = send_local_candidate(ctx, &participant_id, &candidate).await {
                warn!("Sending local candidate for {} failed: {}", participant_id, e);
            }
        }
        TransportSignal::StateChanged {
            participant_id,
            state,
        } => on_state_changed(ctx, &participant_id, state).await,
        TransportSignal::RemoteTrack {
            participant_id,
            track,
        } => {
            let view = {
                let mut state = ctx.state.lock();
                let view = state.registry.get(&participant_id).map(|s| {
                    (s.slot, s.participant.display_name())
                });
                if view.is_some() {
                    state
                        .remote_tracks
                        .entry(participant_id.clone())
                        .or_default()
                        .push(track.clone());
                }
                let muted = state
                    .registry
                    .media_status(&participant_id)
                    .and_then(|m| m.get(MediaKind::Audio))
                    .is_some_and(|enabled| !enabled);
                view.map(|(slot, name)| (slot, name, muted))
            };
            match view {
                Some((slot, name, muted)) => {
                    ctx.emitter.render_remote_view(&track, slot, &name, muted)
                }
                None => debug!("Remote track for unknown participant {}", participant_id),
            }
        }
        TransportSignal::RemoteTrackRemoved {
            participant_id,
            track,
        } => {
            let slot = {
                let mut state = ctx.state.lock();
                if let Some(tracks) = state.remote_tracks.get_mut(&participant_id) {
                    tracks.retain(|t| t != &track);
                }
                state.registry.get(&participant_id).map(|s| s.slot)
            };
            if let Some(slot) = slot {
                ctx.emitter.remove_remote_view(&track, slot);
                ctx.emitter.users_left(&[slot]);
            }
        }
    }
}

async fn on_state_changed(ctx: &CallContext, participant_id: &str, reported: ConnectionState) {
    // Act only while the registered transport is still in the reported state.
    let (session, is_local) = {
        let state = ctx.state.lock();
        let session = state
            .registry
            .get(participant_id)
            .map(|s| (s.slot, s.transport.connection_state()));
        (session, state.is_local(participant_id))
    };
    let Some((slot, current)) = session else {
        return;
    };
    if current != reported {
        debug!(
            "Ignoring stale {:?} for {} (now {:?})",
            reported, participant_id, current
        );
        return;
    }

    match current {
        ConnectionState::Connected => {
            ctx.state.lock().call_state = CallState::InCall;
            ctx.emitter.peer_connected(participant_id, slot);
        }
        ConnectionState::Disconnected if is_local => {
            warn!("Publish connection lost, tearing the call down");
            teardown(ctx).await;
        }
        ConnectionState::Failed | ConnectionState::Closed => {
            info!("Connection to {} is {:?}, removing it", participant_id, current);
            remove_peers(ctx, [participant_id]).await;
        }
        _ => {}
    }
}
