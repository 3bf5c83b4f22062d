//! Routes decoded server events to protocol actions.

use crate::error::{CallError, Result};
use crate::negotiation::{
    announce_presence, apply_answer, apply_candidate, drop_stale, on_publisher_ready, retire,
    subscribe, welcome,
};
use crate::peer::registry::LOCAL_SLOT;
use crate::peer::state::CallContext;
use crate::peer::types::{MediaKind, Participant};
use crate::session::{set_local_media_enabled, teardown};
use crate::signaling::ServerEvent;
use futures_util::future::join_all;
use log::{debug, info, warn};

/// Handles one event. Every failure stays local to the event.
pub async fn dispatch(ctx: &CallContext, event: ServerEvent) -> Result<()> {
    if ctx.state.lock().session_id.is_none() {
        return Err(CallError::InvalidState(format!(
            "{} received outside a session",
            event.type_tag()
        )));
    }
    debug!("Dispatching {}", event.type_tag());

    match event {
        ServerEvent::Answer {
            participant_id,
            sdp,
        } => apply_answer(ctx, &participant_id, &sdp).await,
        ServerEvent::IceCandidate {
            participant_id,
            candidate,
        } => apply_candidate(ctx, &participant_id, candidate).await,
        ServerEvent::Join(participant) => on_join(ctx, participant).await,
        ServerEvent::Joined(participant) => on_joined(ctx, participant).await,
        ServerEvent::Reconnect(participant) => on_reconnect(ctx, participant).await,
        ServerEvent::CloseSession => {
            info!("Server closed the session");
            teardown(ctx).await;
            ctx.emitter.session_destroyed();
            Ok(())
        }
        ServerEvent::CloseConnection { participant_ids } => {
            remove_peers(ctx, participant_ids.iter().map(String::as_str)).await;
            Ok(())
        }
        ServerEvent::UpdateUserMediaStatus {
            participant_id,
            kind,
            status,
        } => {
            on_media_status(ctx, &participant_id, kind, status);
            Ok(())
        }
        ServerEvent::MuteAllUsersAudio { participant_ids } => {
            on_mute_all(ctx, &participant_ids).await
        }
    }
}

/// Dispatches a fetched batch in server order. Handlers run concurrently, so
/// completion order is not guaranteed; one failure never blocks its siblings.
pub async fn dispatch_batch(ctx: &CallContext, events: Vec<Result<ServerEvent>>) -> Vec<Result<()>> {
    let results = join_all(events.into_iter().map(|event| async move {
        match event {
            Ok(event) => dispatch(ctx, event).await,
            Err(e) => Err(e),
        }
    }))
    .await;

    for result in &results {
        match result {
            Err(e) if e.is_informational() => debug!("{}", e),
            Err(e) => warn!("Event handling failed: {}", e),
            Ok(()) => {}
        }
    }
    results
}

async fn on_join(ctx: &CallContext, participant: Participant) -> Result<()> {
    let (is_local, ready) = {
        let mut state = ctx.state.lock();
        let is_local = state.is_local(&participant.id);
        let ready = state.publisher_ready;
        if !is_local && !ready {
            state.early.buffer_join(participant.clone());
        }
        (is_local, ready)
    };

    if is_local {
        on_publisher_ready(ctx).await;
        return Ok(());
    }
    if !ready {
        return Err(CallError::PublisherNotReady(participant.id));
    }
    welcome(ctx, participant).await
}

async fn on_joined(ctx: &CallContext, participant: Participant) -> Result<()> {
    if ctx.state.lock().is_local(&participant.id) {
        return Ok(());
    }
    drop_stale(ctx, &participant.id).await;
    subscribe(ctx, participant).await
}

async fn on_reconnect(ctx: &CallContext, participant: Participant) -> Result<()> {
    if ctx.state.lock().is_local(&participant.id) {
        return Ok(());
    }
    info!("{} reconnected, resubscribing", participant.id);
    announce_presence(ctx, &participant.id).await?;
    drop_stale(ctx, &participant.id).await;
    subscribe(ctx, participant).await
}

/// Only participants with a session or an existing status entry are tracked.
fn on_media_status(ctx: &CallContext, participant_id: &str, kind: MediaKind, status: bool) {
    let (known, slot) = {
        let mut state = ctx.state.lock();
        let slot = state.registry.get(participant_id).map(|s| s.slot);
        let known = slot.is_some() || state.registry.media_status(participant_id).is_some();
        if known {
            state.registry.media_status_mut(participant_id).set(kind, status);
        }
        (known, slot)
    };
    match slot {
        Some(slot) => ctx.emitter.media_status_changed(slot, kind, status),
        None if known => debug!("Media status for {} recorded without a session", participant_id),
        None => debug!("Ignoring media status for unknown participant {}", participant_id),
    }
}

async fn on_mute_all(ctx: &CallContext, participant_ids: &[String]) -> Result<()> {
    let others_listed = {
        let state = ctx.state.lock();
        participant_ids.iter().any(|id| !state.is_local(id))
    };
    if !others_listed {
        return Ok(());
    }
    info!("Muted by the server");
    set_local_media_enabled(ctx, MediaKind::Audio, false).await
}

/// Removes the named sessions and reports their remote slots as left.
/// Unknown ids are skipped.
pub async fn remove_peers<'a, I>(ctx: &CallContext, participant_ids: I) -> Vec<u32>
where
    I: IntoIterator<Item = &'a str>,
{
    let removed = ctx.state.lock().registry.remove_many(participant_ids);

    let mut slots = Vec::with_capacity(removed.len());
    for session in removed {
        if session.slot != LOCAL_SLOT {
            slots.push(session.slot);
        }
        retire(ctx, session).await;
    }
    slots.sort_unstable();
    ctx.emitter.users_left(&slots);
    slots
}
