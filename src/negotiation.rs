//! Offer/answer/candidate exchange for the publish (self) and subscribe
//! (remote) roles.

use crate::error::{CallError, Result};
use crate::logger::dump_candidate;
use crate::peer::connection::PeerTransport;
use crate::peer::ice::analyze_candidates;
use crate::peer::registry::{PeerSession, LOCAL_SLOT};
use crate::peer::state::{CallContext, CallState};
use crate::peer::types::{IceCandidate, LocalMedia, MediaKind, Participant};
use crate::signaling::{CandidateMessage, Endpoint, HttpMethod, JoinedNotice, OfferMessage};
use futures_util::future::join_all;
use log::{debug, info, warn};
use std::sync::Arc;

fn same_transport(a: &Arc<dyn PeerTransport>, b: &Arc<dyn PeerTransport>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Returns the local capture, acquiring it on first use.
pub async fn ensure_local_media(ctx: &CallContext) -> Result<LocalMedia> {
    let (existing, local_id) = {
        let state = ctx.state.lock();
        (state.local_media.clone(), state.local_id().map(str::to_owned))
    };
    if let Some(media) = existing {
        return Ok(media);
    }
    let local_id =
        local_id.ok_or_else(|| CallError::InvalidState("local user is not set".into()))?;

    let media = ctx.transports.acquire_local_media(&local_id).await?;
    ctx.state.lock().local_media = Some(media.clone());
    if let Some(track) = media.track(MediaKind::Video) {
        ctx.emitter.render_local_view(track);
    }
    Ok(media)
}

/// Drops the session for `participant_id` if it still holds `transport`,
/// then closes the transport.
async fn discard(ctx: &CallContext, participant_id: &str, transport: &Arc<dyn PeerTransport>) {
    {
        let mut state = ctx.state.lock();
        let owned = state
            .registry
            .get(participant_id)
            .is_some_and(|s| same_transport(&s.transport, transport));
        if owned {
            state.registry.remove(participant_id);
        }
    }
    if let Err(e) = transport.close().await {
        debug!("Closing failed transport for {}: {}", participant_id, e);
    }
}

/// Closes a superseded or removed session and takes down its views.
pub async fn retire(ctx: &CallContext, session: PeerSession) {
    let tracks = ctx
        .state
        .lock()
        .remote_tracks
        .remove(session.id())
        .unwrap_or_default();
    for track in &tracks {
        ctx.emitter.remove_remote_view(track, session.slot);
    }
    if let Err(e) = session.transport.close().await {
        debug!("Closing transport for {}: {}", session.id(), e);
    }
}

/// Publishes local media on slot 0. On success the publisher becomes ready
/// and the join backlog is subscribed.
pub async fn publish(ctx: &CallContext) -> Result<()> {
    let (session_id, local_id) = ctx.call_ids()?;
    let local_user = ctx
        .state
        .lock()
        .local_user
        .clone()
        .unwrap_or_else(|| Participant::new(local_id.clone()));
    let media = ensure_local_media(ctx).await?;

    let transport = ctx
        .transports
        .create_transport(&local_id, &ctx.ice_servers(), ctx.signal_tx.clone())
        .await?;

    let superseded = {
        let mut state = ctx.state.lock();
        let previous = state.registry.put(
            &local_id,
            PeerSession::new(local_user.clone(), LOCAL_SLOT, transport.clone()),
        );
        let status = state.registry.media_status_mut(&local_id);
        status.set(MediaKind::Audio, media.audio_enabled);
        status.set(MediaKind::Video, media.video_enabled);
        state.call_state = CallState::ProcessingCall;
        previous
    };
    if let Some(previous) = superseded {
        retire(ctx, previous).await;
    }

    let negotiated = async {
        transport.add_local_media(&media).await?;
        let offer = transport.create_offer().await?;
        transport.set_local_offer(&offer).await?;

        let mut message = OfferMessage::new(offer, &local_id, &local_id, &session_id);
        message.user = Some(local_user);
        ctx.send(
            Endpoint::Offer,
            Some(serde_json::to_value(&message)?),
            HttpMethod::Post,
        )
        .await?;
        Ok::<_, CallError>(())
    }
    .await;

    if let Err(e) = negotiated {
        warn!("Publish for {} failed: {}", local_id, e);
        discard(ctx, &local_id, &transport).await;
        return Err(e);
    }

    info!("Published local media for {}", local_id);
    on_publisher_ready(ctx).await;
    Ok(())
}

/// Flips publisher-ready and subscribes to every buffered join. Only the
/// first call per Session does any work.
pub async fn on_publisher_ready(ctx: &CallContext) {
    let Some(backlog) = ctx.state.lock().mark_publisher_ready() else {
        return;
    };
    if backlog.is_empty() {
        return;
    }

    info!("Publisher ready, subscribing to {} buffered joins", backlog.len());
    let results = join_all(backlog.into_iter().map(|participant| async move {
        let id = participant.id.clone();
        (id, welcome(ctx, participant).await)
    }))
    .await;

    for (id, result) in results {
        match result {
            Ok(()) | Err(CallError::DuplicateSubscription(_)) => {}
            Err(e) => warn!("Subscribing to buffered join {} failed: {}", id, e),
        }
    }
}

/// Tells a remote participant that the local user is present.
pub async fn announce_presence(ctx: &CallContext, participant_id: &str) -> Result<()> {
    let (session_id, local_id) = ctx.call_ids()?;
    let user = ctx
        .state
        .lock()
        .local_user
        .clone()
        .unwrap_or_else(|| Participant::new(local_id));
    let notice = JoinedNotice { session_id, user };
    ctx.send(
        Endpoint::Joined {
            user_id: participant_id.to_owned(),
        },
        Some(serde_json::to_value(&notice)?),
        HttpMethod::Post,
    )
    .await?;
    Ok(())
}

/// Announce, then subscribe.
pub async fn welcome(ctx: &CallContext, participant: Participant) -> Result<()> {
    announce_presence(ctx, &participant.id).await?;
    subscribe(ctx, participant).await
}

/// Removes any session for `participant_id`, live or not.
pub async fn drop_stale(ctx: &CallContext, participant_id: &str) {
    let stale = ctx.state.lock().registry.remove(participant_id);
    if let Some(stale) = stale {
        debug!("Dropping stale session for {} on slot {}", participant_id, stale.slot);
        retire(ctx, stale).await;
    }
}

fn ensure_not_live(ctx: &CallContext, participant_id: &str) -> Result<()> {
    let state = ctx.state.lock();
    match state.registry.get(participant_id) {
        Some(existing) if existing.transport.connection_state().is_live() => Err(
            CallError::DuplicateSubscription(participant_id.to_owned()),
        ),
        _ => Ok(()),
    }
}

/// Subscribes to a remote participant's media on the lowest free slot. A
/// failed or closed session for the same participant is replaced.
pub async fn subscribe(ctx: &CallContext, participant: Participant) -> Result<()> {
    let (session_id, local_id) = ctx.call_ids()?;
    let remote_id = participant.id.clone();
    if remote_id == local_id {
        return Err(CallError::InvalidState(
            "cannot subscribe to the local user".into(),
        ));
    }
    ensure_not_live(ctx, &remote_id)?;

    let transport = ctx
        .transports
        .create_transport(&remote_id, &ctx.ice_servers(), ctx.signal_tx.clone())
        .await?;

    // The guard runs again under the same lock that registers the session.
    let registered = {
        let mut guard = ctx.state.lock();
        let state = &mut *guard;
        match state.registry.get(&remote_id) {
            Some(existing) if existing.transport.connection_state().is_live() => {
                Err(CallError::DuplicateSubscription(remote_id.clone()))
            }
            _ => {
                let stale = state.registry.remove(&remote_id);
                let slot = state.registry.next_free_slot();
                state
                    .registry
                    .put(&remote_id, PeerSession::new(participant, slot, transport.clone()));
                Ok((slot, stale))
            }
        }
    };
    let (slot, stale) = match registered {
        Ok(registered) => registered,
        Err(e) => {
            let _ = transport.close().await;
            return Err(e);
        }
    };
    if let Some(stale) = stale {
        debug!("Re-subscribing {}, replacing slot {}", remote_id, stale.slot);
        retire(ctx, stale).await;
    }
    debug!("Subscribing to {} on slot {}", remote_id, slot);

    let negotiated = async {
        if ctx.config.enable_audio {
            transport.add_receive_only(MediaKind::Audio).await?;
        }
        if ctx.config.enable_video {
            transport.add_receive_only(MediaKind::Video).await?;
        }
        let offer = transport.create_offer().await?;
        transport.set_local_offer(&offer).await?;

        let message = OfferMessage::new(offer, &local_id, &remote_id, &session_id);
        ctx.send(
            Endpoint::Offer,
            Some(serde_json::to_value(&message)?),
            HttpMethod::Post,
        )
        .await?;
        Ok::<_, CallError>(())
    }
    .await;

    if let Err(e) = negotiated {
        warn!("Subscribe to {} failed: {}", remote_id, e);
        discard(ctx, &remote_id, &transport).await;
        return Err(e);
    }
    Ok(())
}

/// Applies the remote answer, then every candidate that arrived before it,
/// oldest first.
pub async fn apply_answer(ctx: &CallContext, participant_id: &str, sdp: &str) -> Result<()> {
    let transport = ctx
        .state
        .lock()
        .registry
        .get(participant_id)
        .map(|s| s.transport.clone())
        .ok_or_else(|| CallError::UnknownPeer(participant_id.to_owned()))?;

    transport.set_remote_answer(sdp).await?;

    let pending = {
        let mut state = ctx.state.lock();
        let current = match state.registry.get_mut(participant_id) {
            Some(session) if same_transport(&session.transport, &transport) => {
                session.has_remote_description = true;
                true
            }
            _ => false,
        };
        if current {
            state.early.flush(participant_id)
        } else {
            Vec::new()
        }
    };

    debug!(
        "Answer applied for {}, {} early candidates to apply",
        participant_id,
        pending.len()
    );
    analyze_candidates(participant_id, &pending);
    for candidate in &pending {
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn!("Early candidate for {} rejected: {}", participant_id, e);
        }
    }
    Ok(())
}

/// Applies a remote candidate, or buffers it until the session has a
/// remote description.
pub async fn apply_candidate(
    ctx: &CallContext,
    participant_id: &str,
    candidate: IceCandidate,
) -> Result<()> {
    dump_candidate("REMOTE", &candidate);
    let ready = {
        let mut guard = ctx.state.lock();
        let state = &mut *guard;
        match state.registry.get(participant_id) {
            Some(session) if session.has_remote_description => Some(session.transport.clone()),
            _ => {
                state.early.buffer_candidate(participant_id, candidate.clone());
                None
            }
        }
    };
    if let Some(transport) = ready {
        transport.add_ice_candidate(&candidate).await?;
    }
    Ok(())
}

/// Trickles a locally gathered candidate to the server.
pub async fn send_local_candidate(
    ctx: &CallContext,
    participant_id: &str,
    candidate: &IceCandidate,
) -> Result<()> {
    let (session_id, local_id) = ctx.call_ids()?;
    let message = CandidateMessage::new(candidate, &local_id, participant_id, &session_id);
    ctx.send(
        Endpoint::IceCandidates,
        Some(serde_json::to_value(&message)?),
        HttpMethod::Post,
    )
    .await?;
    Ok(())
}
