// ── Job engine ─────────────────────────────────────────────────────────────
// Durable FIFO+priority queue over the store, with at-least-once delivery:
// claims take a 5-minute lease that Progress renews; leases that expire are
// reclaimed, so handlers must be idempotent keyed on the job id. Progress
// updates fan out over a broadcast channel (best-effort) that the
// ProgressRouter forwards into hub rooms.

pub mod character_gen;
pub mod credit_grants;
pub mod image_dataset;
pub mod translation;
pub mod worker;

use crate::atoms::constants::{
    JOB_BACKOFF_BASE_MS, JOB_BACKOFF_CAP_MS, JOB_DEFAULT_MAX_ATTEMPTS, JOB_LEASE_SECS,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Job, JobError, JobProgress, JobProgressEvent, JobState};
use crate::engine::clock::SharedClock;
use crate::engine::store::Store;
use chrono::Duration;
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub job_type: String,
    pub payload: Value,
    pub owner_user_id: String,
    pub session_id: Option<String>,
    pub priority: i64,
    pub max_attempts: i64,
    /// Delay before the job becomes claimable.
    pub delay_secs: i64,
    /// Re-enqueueing an identical key while a live job exists returns the
    /// existing job instead of queueing a duplicate.
    pub dedup_key: Option<String>,
}

impl EnqueueRequest {
    pub fn new(job_type: impl Into<String>, payload: Value, owner_user_id: impl Into<String>) -> Self {
        EnqueueRequest {
            job_type: job_type.into(),
            payload,
            owner_user_id: owner_user_id.into(),
            session_id: None,
            priority: 0,
            max_attempts: JOB_DEFAULT_MAX_ATTEMPTS,
            delay_secs: 0,
            dedup_key: None,
        }
    }
}

pub struct JobEngine {
    store: Arc<Store>,
    clock: SharedClock,
    progress_tx: broadcast::Sender<JobProgressEvent>,
}

impl JobEngine {
    pub fn new(store: Arc<Store>, clock: SharedClock) -> Self {
        let (progress_tx, _) = broadcast::channel(256);
        JobEngine {
            store,
            clock,
            progress_tx,
        }
    }

    /// Subscribe to progress events. Best-effort: lagging receivers drop
    /// events, never block publishers.
    pub fn subscribe_progress(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.progress_tx.subscribe()
    }

    pub fn enqueue(&self, req: EnqueueRequest) -> EngineResult<Job> {
        if let Some(key) = &req.dedup_key {
            if let Some(existing) = self.store.find_job_by_dedup(key)? {
                debug!("[jobs] Dedup hit for '{key}' → {}", existing.id);
                return Ok(existing);
            }
        }

        let now = self.clock.now();
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: req.job_type,
            payload: req.payload,
            state: JobState::Queued,
            attempts: 0,
            max_attempts: req.max_attempts,
            priority: req.priority,
            not_before: now + Duration::seconds(req.delay_secs),
            lease_until: None,
            owner_user_id: req.owner_user_id,
            session_id: req.session_id,
            dedup_key: req.dedup_key,
            cancel_requested: false,
            progress: JobProgress::default(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_job(&job)?;
        info!("[jobs] Enqueued {} ({})", job.id, job.job_type);
        Ok(job)
    }

    /// Claim the next due job of one of `types`, or None when the queue is
    /// empty. Bumps attempts and takes the visibility lease.
    pub fn claim(&self, worker_id: &str, types: &[String]) -> EngineResult<Option<Job>> {
        let claimed = self
            .store
            .claim_next_job(types, self.clock.now(), JOB_LEASE_SECS)?;
        if let Some(job) = &claimed {
            debug!(
                "[jobs] {} claimed {} ({}) attempt {}",
                worker_id, job.id, job.job_type, job.attempts
            );
        }
        Ok(claimed)
    }

    /// Record progress, renew the lease, and publish the event.
    pub fn progress(&self, job_id: &str, progress: JobProgress) -> EngineResult<()> {
        self.store
            .update_job_progress(job_id, &progress, self.clock.now(), JOB_LEASE_SECS)?;

        if let Some(job) = self.store.get_job(job_id)? {
            let event = JobProgressEvent {
                job_id: job_id.to_string(),
                owner_user_id: job.owner_user_id,
                session_id: job.session_id,
                stage: progress.stage,
                total: progress.total,
                message: progress.message,
                data: progress.data,
            };
            // Fire-and-forget: no subscribers is fine.
            let _ = self.progress_tx.send(event);
        }
        Ok(())
    }

    pub fn complete(&self, job_id: &str, result: Value) -> EngineResult<()> {
        self.store
            .mark_job_succeeded(job_id, &serde_json::to_string(&result)?, self.clock.now())?;
        info!("[jobs] {job_id} succeeded");
        Ok(())
    }

    /// Fail the current attempt. Retryable errors requeue with capped
    /// exponential backoff until max_attempts; the rest (and exhaustion)
    /// transition to FAILED. Returns the resulting state.
    pub fn fail(&self, job_id: &str, error: JobError) -> EngineResult<JobState> {
        let job = self
            .store
            .get_job(job_id)?
            .ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))?;
        let error_json = serde_json::to_string(&error)?;
        let now = self.clock.now();

        if error.retryable && job.attempts < job.max_attempts {
            let delay = backoff_delay(job.attempts, &job.id);
            self.store
                .requeue_job(job_id, now + delay, &error_json, now)?;
            warn!(
                "[jobs] {job_id} attempt {} failed ({}), retrying in {}s",
                job.attempts,
                error.code,
                delay.num_seconds()
            );
            Ok(JobState::Queued)
        } else {
            self.store.mark_job_failed(job_id, &error_json, now)?;
            warn!(
                "[jobs] {job_id} failed terminally after {} attempt(s): {}",
                job.attempts, error.code
            );
            Ok(JobState::Failed)
        }
    }

    /// Request cancellation. Queued jobs cancel immediately; running jobs
    /// are flagged and observe the flag at their next safe checkpoint.
    pub fn cancel(&self, job_id: &str) -> EngineResult<JobState> {
        self.store.request_job_cancel(job_id, self.clock.now())
    }

    /// Safe-checkpoint poll for running handlers.
    pub fn is_cancel_requested(&self, job_id: &str) -> EngineResult<bool> {
        Ok(self
            .store
            .get_job(job_id)?
            .map(|j| j.cancel_requested)
            .unwrap_or(false))
    }

    /// Transition a flagged running job to CANCELLED (called by the worker
    /// once the handler acknowledges the checkpoint).
    pub fn acknowledge_cancel(&self, job_id: &str) -> EngineResult<()> {
        self.store.mark_job_cancelled(job_id, self.clock.now())
    }

    /// Requeue jobs whose lease expired (crashed worker).
    pub fn reclaim_leases(&self) -> EngineResult<usize> {
        let reclaimed = self.store.reclaim_expired_leases(self.clock.now())?;
        if reclaimed > 0 {
            warn!("[jobs] Reclaimed {reclaimed} expired lease(s)");
        }
        Ok(reclaimed)
    }

    pub fn get(&self, job_id: &str) -> EngineResult<Option<Job>> {
        self.store.get_job(job_id)
    }
}

/// min(cap, base × 2^attempts × jitter). Jitter is derived from the job id
/// so retries are spread but reproducible.
fn backoff_delay(attempts: i64, job_id: &str) -> Duration {
    let exp = attempts.clamp(0, 16) as u32;
    let base = JOB_BACKOFF_BASE_MS.saturating_mul(2u64.saturating_pow(exp));
    let hash: u64 = job_id.bytes().fold(0u64, |acc, b| {
        acc.wrapping_mul(31).wrapping_add(b as u64)
    });
    // Jitter in [1.0, 1.5).
    let jitter = 1.0 + (hash % 500) as f64 / 1000.0;
    let delayed = ((base as f64) * jitter) as u64;
    Duration::milliseconds(delayed.min(JOB_BACKOFF_CAP_MS) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn engine() -> (Arc<JobEngine>, Arc<ManualClock>) {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let store = Arc::new(Store::open_in_memory().unwrap());
        (Arc::new(JobEngine::new(store, clock.clone())), clock)
    }

    fn work_types() -> Vec<String> {
        vec!["work".to_string()]
    }

    #[test]
    fn enqueue_dedup_returns_existing() {
        let (engine, _clock) = engine();
        let mut req = EnqueueRequest::new("work", json!({}), "u1");
        req.dedup_key = Some("u1:s1".into());

        let first = engine.enqueue(req.clone()).unwrap();
        let second = engine.enqueue(req).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn fail_retryable_requeues_with_backoff() {
        let (engine, clock) = engine();
        engine
            .enqueue(EnqueueRequest::new("work", json!({}), "u1"))
            .unwrap();

        let job = engine.claim("w1", &work_types()).unwrap().unwrap();
        let state = engine
            .fail(
                &job.id,
                JobError {
                    code: "upstream_timeout".into(),
                    message: "image backend 503".into(),
                    retryable: true,
                },
            )
            .unwrap();
        assert_eq!(state, JobState::Queued);

        // Not claimable until the backoff elapses.
        assert!(engine.claim("w1", &work_types()).unwrap().is_none());
        clock.advance(Duration::seconds(120));
        let retried = engine.claim("w1", &work_types()).unwrap().unwrap();
        assert_eq!(retried.id, job.id);
        assert_eq!(retried.attempts, 2);
    }

    #[test]
    fn fail_non_retryable_is_terminal() {
        let (engine, _clock) = engine();
        engine
            .enqueue(EnqueueRequest::new("work", json!({}), "u1"))
            .unwrap();
        let job = engine.claim("w1", &work_types()).unwrap().unwrap();

        let state = engine
            .fail(
                &job.id,
                JobError {
                    code: "validation".into(),
                    message: "bad payload".into(),
                    retryable: false,
                },
            )
            .unwrap();
        assert_eq!(state, JobState::Failed);
        assert!(engine.claim("w1", &work_types()).unwrap().is_none());
    }

    #[test]
    fn attempts_exhaustion_fails_even_when_retryable() {
        let (engine, clock) = engine();
        let mut req = EnqueueRequest::new("work", json!({}), "u1");
        req.max_attempts = 2;
        engine.enqueue(req).unwrap();

        let transient = || JobError {
            code: "t".into(),
            message: "m".into(),
            retryable: true,
        };

        let job = engine.claim("w1", &work_types()).unwrap().unwrap();
        assert_eq!(engine.fail(&job.id, transient()).unwrap(), JobState::Queued);

        clock.advance(Duration::seconds(600));
        let job = engine.claim("w1", &work_types()).unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        assert_eq!(engine.fail(&job.id, transient()).unwrap(), JobState::Failed);
    }

    #[test]
    fn progress_publishes_events() {
        let (engine, _clock) = engine();
        let mut req = EnqueueRequest::new("work", json!({}), "u1");
        req.session_id = Some("sess-9".into());
        engine.enqueue(req).unwrap();
        let job = engine.claim("w1", &work_types()).unwrap().unwrap();

        let mut rx = engine.subscribe_progress();
        engine
            .progress(
                &job.id,
                JobProgress {
                    stage: 2,
                    total: 4,
                    message: "jobs.image_dataset.stage_front".into(),
                    data: None,
                },
            )
            .unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.job_id, job.id);
        assert_eq!(event.session_id.as_deref(), Some("sess-9"));
        assert_eq!(event.stage, 2);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let d0 = backoff_delay(0, "job-a");
        let d3 = backoff_delay(3, "job-a");
        let d20 = backoff_delay(20, "job-a");
        assert!(d0 < d3);
        assert!(d3 <= Duration::milliseconds(JOB_BACKOFF_CAP_MS as i64));
        assert_eq!(d20, Duration::milliseconds(JOB_BACKOFF_CAP_MS as i64));
        // Deterministic per job id.
        assert_eq!(backoff_delay(2, "job-a"), backoff_delay(2, "job-a"));
    }
}
