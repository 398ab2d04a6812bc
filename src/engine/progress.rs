// ── Progress router ────────────────────────────────────────────────────────
// Glue between the job engine and the session hub: every job progress event
// is forwarded into the `job:<owner>:<session>` room. Events without a
// session, or for rooms nobody joined, are dropped. No state.

use crate::atoms::types::{JobProgressEvent, ServerEvent};
use crate::engine::hub::{job_room, SessionHub};
use crate::engine::jobs::JobEngine;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

pub fn forward(hub: &SessionHub, event: &JobProgressEvent) {
    let Some(session_id) = &event.session_id else {
        return;
    };
    hub.broadcast(
        &job_room(&event.owner_user_id, session_id),
        ServerEvent::JobProgress {
            session_id: session_id.clone(),
            stage: event.stage,
            total: event.total,
            message: event.message.clone(),
            data: event.data.clone(),
        },
        None,
    );
}

/// Subscribe to the engine's progress channel and forward until `stop`.
pub async fn run_router(engine: Arc<JobEngine>, hub: Arc<SessionHub>, stop: Arc<AtomicBool>) {
    let mut rx = engine.subscribe_progress();
    info!("[progress] Router started");
    while !stop.load(Ordering::Relaxed) {
        match rx.recv().await {
            Ok(event) => forward(&hub, &event),
            Err(RecvError::Lagged(skipped)) => {
                // Best-effort delivery: lagging just drops events.
                debug!("[progress] Dropped {skipped} event(s) while lagging");
            }
            Err(RecvError::Closed) => break,
        }
    }
    info!("[progress] Router stopped");
}
