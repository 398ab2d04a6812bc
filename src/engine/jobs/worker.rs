// ── Job workers ────────────────────────────────────────────────────────────
// Handlers register by job type; a worker loop claims due jobs, dispatches,
// and settles the outcome. Cancellation is cooperative: handlers return
// `Outcome::Cancelled` when they observe the flag at a safe checkpoint.

use crate::atoms::constants::JOB_POLL_INTERVAL_MS;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Job, JobError};
use async_trait::async_trait;
use log::{error, info};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::JobEngine;

/// What a handler run produced.
#[derive(Debug)]
pub enum Outcome {
    Success(Value),
    /// The handler observed the cancel flag and stopped at a checkpoint.
    Cancelled,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &'static str;
    async fn run(&self, job: &Job, engine: &JobEngine) -> EngineResult<Outcome>;
}

fn job_error_from(e: &EngineError) -> JobError {
    JobError {
        code: e.code().to_string(),
        message: e.to_string(),
        retryable: e.is_retryable(),
    }
}

pub struct WorkerPool {
    engine: Arc<JobEngine>,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl WorkerPool {
    pub fn new(engine: Arc<JobEngine>) -> Self {
        WorkerPool {
            engine,
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers
            .insert(handler.job_type().to_string(), handler);
    }

    pub fn engine(&self) -> &Arc<JobEngine> {
        &self.engine
    }

    fn handled_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Claim and process at most one job. Returns true when a job ran.
    pub async fn run_once(&self, worker_id: &str) -> EngineResult<bool> {
        let Some(job) = self.engine.claim(worker_id, &self.handled_types())? else {
            return Ok(false);
        };

        let Some(handler) = self.handlers.get(&job.job_type).cloned() else {
            // Claim filter and registry agree by construction; a miss here
            // is a programming error, not a reason to wedge the queue.
            self.engine.fail(
                &job.id,
                JobError {
                    code: "internal_error".into(),
                    message: format!("no handler registered for {}", job.job_type),
                    retryable: false,
                },
            )?;
            return Ok(true);
        };

        match handler.run(&job, &self.engine).await {
            Ok(Outcome::Success(result)) => {
                self.engine.complete(&job.id, result)?;
            }
            Ok(Outcome::Cancelled) => {
                info!("[jobs] {} cancelled at checkpoint", job.id);
                self.engine.acknowledge_cancel(&job.id)?;
            }
            Err(e) => {
                self.engine.fail(&job.id, job_error_from(&e))?;
            }
        }
        Ok(true)
    }

    /// Worker loop: claim-dispatch until `stop`, reclaiming expired leases
    /// opportunistically while idle.
    pub async fn run(self: Arc<Self>, worker_id: String, stop: Arc<AtomicBool>) {
        info!("[jobs] Worker {worker_id} started ({:?})", self.handled_types());
        while !stop.load(Ordering::Relaxed) {
            match self.run_once(&worker_id).await {
                Ok(true) => continue,
                Ok(false) => {
                    self.engine.reclaim_leases().ok();
                    tokio::time::sleep(std::time::Duration::from_millis(JOB_POLL_INTERVAL_MS))
                        .await;
                }
                Err(e) => {
                    error!("[jobs] Worker {worker_id} error: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(JOB_POLL_INTERVAL_MS))
                        .await;
                }
            }
        }
        info!("[jobs] Worker {worker_id} stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::{JobProgress, JobState};
    use crate::engine::clock::ManualClock;
    use crate::engine::jobs::EnqueueRequest;
    use crate::engine::store::Store;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct CountingHandler {
        runs: Arc<AtomicBool>,
        fail_first: AtomicBool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        fn job_type(&self) -> &'static str {
            "counting"
        }

        async fn run(&self, job: &Job, engine: &JobEngine) -> EngineResult<Outcome> {
            engine.progress(
                &job.id,
                JobProgress {
                    stage: 1,
                    total: 1,
                    message: "working".into(),
                    data: None,
                },
            )?;
            if self.fail_first.swap(false, Ordering::SeqCst) {
                return Err(EngineError::Transient("flaky backend".into()));
            }
            self.runs.store(true, Ordering::SeqCst);
            Ok(Outcome::Success(json!({"ok": true})))
        }
    }

    fn pool_with(handler: Arc<dyn JobHandler>) -> (Arc<WorkerPool>, Arc<ManualClock>) {
        let clock = ManualClock::at(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = Arc::new(JobEngine::new(store, clock.clone()));
        let mut pool = WorkerPool::new(engine);
        pool.register(handler);
        (Arc::new(pool), clock)
    }

    #[tokio::test]
    async fn run_once_processes_and_completes() {
        let runs = Arc::new(AtomicBool::new(false));
        let (pool, _clock) = pool_with(Arc::new(CountingHandler {
            runs: runs.clone(),
            fail_first: AtomicBool::new(false),
        }));

        let job = pool
            .engine()
            .enqueue(EnqueueRequest::new("counting", json!({}), "u1"))
            .unwrap();

        assert!(pool.run_once("w1").await.unwrap());
        assert!(runs.load(Ordering::SeqCst));
        let done = pool.engine().get(&job.id).unwrap().unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        assert_eq!(done.result, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn transient_failure_retries_to_success() {
        let runs = Arc::new(AtomicBool::new(false));
        let (pool, clock) = pool_with(Arc::new(CountingHandler {
            runs: runs.clone(),
            fail_first: AtomicBool::new(true),
        }));

        let job = pool
            .engine()
            .enqueue(EnqueueRequest::new("counting", json!({}), "u1"))
            .unwrap();

        assert!(pool.run_once("w1").await.unwrap());
        assert_eq!(
            pool.engine().get(&job.id).unwrap().unwrap().state,
            JobState::Queued
        );

        clock.advance(chrono::Duration::seconds(300));
        assert!(pool.run_once("w1").await.unwrap());
        assert_eq!(
            pool.engine().get(&job.id).unwrap().unwrap().state,
            JobState::Succeeded
        );
    }

    #[tokio::test]
    async fn idle_pool_reports_no_work() {
        let (pool, _clock) = pool_with(Arc::new(CountingHandler {
            runs: Arc::new(AtomicBool::new(false)),
            fail_first: AtomicBool::new(false),
        }));
        assert!(!pool.run_once("w1").await.unwrap());
    }
}
