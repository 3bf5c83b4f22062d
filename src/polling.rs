//! Back-to-back event fetching with a bounded failure budget.

use crate::dispatcher::dispatch_batch;
use crate::error::{CallError, Result};
use crate::peer::state::CallContext;
use crate::session::teardown;
use crate::signaling::{decode_events, Endpoint, HttpMethod, ServerEvent};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub fn spawn(ctx: Arc<CallContext>) -> JoinHandle<()> {
    tokio::spawn(run(ctx))
}

/// Fetches one batch. An empty body is an empty batch.
pub async fn fetch_events(ctx: &CallContext) -> Result<Vec<Result<ServerEvent>>> {
    let (session_id, user_id) = ctx.call_ids()?;
    let response = ctx
        .send(
            Endpoint::Events {
                session_id,
                user_id,
            },
            None,
            HttpMethod::Get,
        )
        .await?;
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    decode_events(&response.body)
}

async fn run(ctx: Arc<CallContext>) {
    let mut failures: u32 = 0;
    info!("Event polling started");

    loop {
        if ctx.is_stopped() {
            break;
        }

        let fetched = fetch_events(&ctx).await;
        if ctx.is_stopped() {
            break;
        }

        match fetched {
            Ok(events) => {
                failures = 0;
                let newly_connected = {
                    let mut state = ctx.state.lock();
                    !std::mem::replace(&mut state.connected, true)
                };
                if newly_connected {
                    ctx.emitter.connected(true);
                }
                if !events.is_empty() {
                    debug!("Fetched {} events", events.len());
                    // Detached: aborting the poll must not cancel a handler midway.
                    let batch_ctx = ctx.clone();
                    tokio::spawn(async move {
                        dispatch_batch(&batch_ctx, events).await;
                    });
                }
            }
            Err(e) => {
                failures += 1;
                warn!(
                    "Event fetch failed ({}/{}): {}",
                    failures, ctx.config.max_fetch_failures, e
                );
                if failures >= ctx.config.max_fetch_failures {
                    error!("{} after {} failed fetches", CallError::ConnectionLost, failures);
                    ctx.state.lock().connected = false;
                    ctx.emitter.connected(false);
                    teardown(&ctx).await;
                    break;
                }
            }
        }

        if ctx.is_stopped() {
            break;
        }
        tokio::time::sleep(ctx.config.poll_interval()).await;
    }

    info!("Event polling stopped");
}
