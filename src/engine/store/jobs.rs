// Queue-of-record for the job engine. Claims are atomic because every
// access serializes through the store connection; the conditional UPDATE is
// still guarded on state so a future multi-connection deployment stays
// correct.

use super::{opt_ts, parse_ts, ts, Store};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{Job, JobProgress, JobState};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};

const JOB_COLS: &str = "id, job_type, payload_json, state, attempts, max_attempts, priority, \
                        not_before, lease_until, owner_user_id, session_id, dedup_key, \
                        cancel_requested, progress_json, result_json, error_json, \
                        created_at, updated_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        job_type: row.get(1)?,
        payload_json: row.get(2)?,
        state: row.get(3)?,
        attempts: row.get(4)?,
        max_attempts: row.get(5)?,
        priority: row.get(6)?,
        not_before: row.get(7)?,
        lease_until: row.get(8)?,
        owner_user_id: row.get(9)?,
        session_id: row.get(10)?,
        dedup_key: row.get(11)?,
        cancel_requested: row.get::<_, i64>(12)? != 0,
        progress_json: row.get(13)?,
        result_json: row.get(14)?,
        error_json: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

struct RawJob {
    id: String,
    job_type: String,
    payload_json: String,
    state: String,
    attempts: i64,
    max_attempts: i64,
    priority: i64,
    not_before: String,
    lease_until: Option<String>,
    owner_user_id: String,
    session_id: Option<String>,
    dedup_key: Option<String>,
    cancel_requested: bool,
    progress_json: Option<String>,
    result_json: Option<String>,
    error_json: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawJob {
    fn into_job(self) -> EngineResult<Job> {
        Ok(Job {
            state: JobState::parse(&self.state)
                .ok_or_else(|| EngineError::Internal(format!("bad job state {}", self.state)))?,
            payload: serde_json::from_str(&self.payload_json)?,
            progress: self
                .progress_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?
                .unwrap_or_default(),
            result: self
                .result_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            error: self
                .error_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            not_before: parse_ts(&self.not_before),
            lease_until: opt_ts(self.lease_until),
            created_at: parse_ts(&self.created_at),
            updated_at: parse_ts(&self.updated_at),
            id: self.id,
            job_type: self.job_type,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            priority: self.priority,
            owner_user_id: self.owner_user_id,
            session_id: self.session_id,
            dedup_key: self.dedup_key,
            cancel_requested: self.cancel_requested,
        })
    }
}

impl Store {
    pub fn insert_job(&self, job: &Job) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO jobs
                (id, job_type, payload_json, state, attempts, max_attempts, priority,
                 not_before, owner_user_id, session_id, dedup_key, progress_json,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                job.id,
                job.job_type,
                serde_json::to_string(&job.payload)?,
                job.state.as_str(),
                job.attempts,
                job.max_attempts,
                job.priority,
                ts(job.not_before),
                job.owner_user_id,
                job.session_id,
                job.dedup_key,
                serde_json::to_string(&job.progress)?,
                ts(job.created_at),
                ts(job.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, job_id: &str) -> EngineResult<Option<Job>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {JOB_COLS} FROM jobs WHERE id = ?1"),
                params![job_id],
                job_from_row,
            )
            .optional()?;
        drop(conn);
        raw.map(RawJob::into_job).transpose()
    }

    /// Live (non-terminal) job carrying this dedup key, if any.
    pub fn find_job_by_dedup(&self, dedup_key: &str) -> EngineResult<Option<Job>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLS} FROM jobs
                     WHERE dedup_key = ?1 AND state IN ('queued', 'running')
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![dedup_key],
                job_from_row,
            )
            .optional()?;
        drop(conn);
        raw.map(RawJob::into_job).transpose()
    }

    /// Atomically move the best queued job of one of `types` to RUNNING:
    /// highest priority first, then FIFO by not_before, then job id.
    pub fn claim_next_job(
        &self,
        types: &[String],
        now: DateTime<Utc>,
        lease_secs: i64,
    ) -> EngineResult<Option<Job>> {
        if types.is_empty() {
            return Ok(None);
        }
        let placeholders = (0..types.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let candidate: Option<String> = {
            let sql = format!(
                "SELECT id FROM jobs
                 WHERE state = 'queued' AND not_before <= ?1 AND job_type IN ({placeholders})
                 ORDER BY priority DESC, not_before ASC, id ASC LIMIT 1"
            );
            let now_s = ts(now);
            let mut stmt = tx.prepare(&sql)?;
            let mut sql_params: Vec<&dyn rusqlite::ToSql> = vec![&now_s];
            for t in types {
                sql_params.push(t);
            }
            stmt.query_row(sql_params.as_slice(), |row| row.get(0))
                .optional()?
        };

        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let claimed = tx.execute(
            "UPDATE jobs
             SET state = 'running', attempts = attempts + 1,
                 lease_until = ?2, updated_at = ?3
             WHERE id = ?1 AND state = 'queued'",
            params![job_id, ts(now + Duration::seconds(lease_secs)), ts(now)],
        )?;
        if claimed == 0 {
            // Lost the race to another claimer between SELECT and UPDATE.
            return Ok(None);
        }

        let raw = tx.query_row(
            &format!("SELECT {JOB_COLS} FROM jobs WHERE id = ?1"),
            params![job_id],
            job_from_row,
        )?;
        tx.commit()?;
        raw.into_job().map(Some)
    }

    /// Update progress and renew the lease. Only meaningful while RUNNING.
    pub fn update_job_progress(
        &self,
        job_id: &str,
        progress: &JobProgress,
        now: DateTime<Utc>,
        lease_secs: i64,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE jobs SET progress_json = ?2, lease_until = ?3, updated_at = ?4
             WHERE id = ?1 AND state = 'running'",
            params![
                job_id,
                serde_json::to_string(progress)?,
                ts(now + Duration::seconds(lease_secs)),
                ts(now),
            ],
        )?;
        if updated == 0 {
            return Err(EngineError::Conflict(format!(
                "job {job_id} is not running"
            )));
        }
        Ok(())
    }

    pub fn mark_job_succeeded(
        &self,
        job_id: &str,
        result_json: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.transition(
            job_id,
            "UPDATE jobs SET state = 'succeeded', result_json = ?2, lease_until = NULL,
                    updated_at = ?3
             WHERE id = ?1 AND state = 'running'",
            params![job_id, result_json, ts(now)],
        )
    }

    pub fn mark_job_failed(
        &self,
        job_id: &str,
        error_json: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.transition(
            job_id,
            "UPDATE jobs SET state = 'failed', error_json = ?2, lease_until = NULL,
                    updated_at = ?3
             WHERE id = ?1 AND state = 'running'",
            params![job_id, error_json, ts(now)],
        )
    }

    /// Put a failed-but-retryable job back on the queue with a delay.
    pub fn requeue_job(
        &self,
        job_id: &str,
        not_before: DateTime<Utc>,
        error_json: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.transition(
            job_id,
            "UPDATE jobs SET state = 'queued', not_before = ?2, error_json = ?3,
                    lease_until = NULL, updated_at = ?4
             WHERE id = ?1 AND state = 'running'",
            params![job_id, ts(not_before), error_json, ts(now)],
        )
    }

    pub fn mark_job_cancelled(&self, job_id: &str, now: DateTime<Utc>) -> EngineResult<()> {
        self.transition(
            job_id,
            "UPDATE jobs SET state = 'cancelled', lease_until = NULL, updated_at = ?2
             WHERE id = ?1 AND state IN ('queued', 'running')",
            params![job_id, ts(now)],
        )
    }

    /// Set the cancellation flag. A queued job cancels immediately; a
    /// running one keeps the flag for the worker's next safe checkpoint.
    pub fn request_job_cancel(&self, job_id: &str, now: DateTime<Utc>) -> EngineResult<JobState> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE jobs SET cancel_requested = 1, updated_at = ?2
             WHERE id = ?1 AND state IN ('queued', 'running')",
            params![job_id, ts(now)],
        )?;
        conn.execute(
            "UPDATE jobs SET state = 'cancelled', updated_at = ?2
             WHERE id = ?1 AND state = 'queued'",
            params![job_id, ts(now)],
        )?;
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        let state = state.ok_or_else(|| EngineError::NotFound(format!("job {job_id}")))?;
        JobState::parse(&state)
            .ok_or_else(|| EngineError::Internal(format!("bad job state {state}")))
    }

    /// Requeue RUNNING jobs whose lease expired (worker crash). Returns the
    /// number of reclaimed jobs.
    pub fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let reclaimed = conn.execute(
            "UPDATE jobs SET state = 'queued', lease_until = NULL, updated_at = ?1
             WHERE state = 'running' AND lease_until IS NOT NULL AND lease_until <= ?1",
            params![ts(now)],
        )?;
        Ok(reclaimed)
    }

    fn transition(
        &self,
        job_id: &str,
        sql: &str,
        sql_params: impl rusqlite::Params,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(sql, sql_params)?;
        if updated == 0 {
            return Err(EngineError::Conflict(format!(
                "job {job_id} not in a state that allows this transition"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn job(id: &str, job_type: &str, priority: i64, at: DateTime<Utc>) -> Job {
        Job {
            id: id.into(),
            job_type: job_type.into(),
            payload: json!({}),
            state: JobState::Queued,
            attempts: 0,
            max_attempts: 3,
            priority,
            not_before: at,
            lease_until: None,
            owner_user_id: "u1".into(),
            session_id: Some("s1".into()),
            dedup_key: None,
            cancel_requested: false,
            progress: JobProgress::default(),
            result: None,
            error: None,
            created_at: at,
            updated_at: at,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn claim_respects_priority_then_fifo() {
        let store = Store::open_in_memory().unwrap();
        let base = t0();
        store.insert_job(&job("j-low", "work", 0, base)).unwrap();
        store
            .insert_job(&job("j-high", "work", 5, base + Duration::seconds(1)))
            .unwrap();
        store
            .insert_job(&job("j-low2", "work", 0, base + Duration::seconds(2)))
            .unwrap();

        let now = base + Duration::seconds(10);
        let types = vec!["work".to_string()];
        let first = store.claim_next_job(&types, now, 300).unwrap().unwrap();
        assert_eq!(first.id, "j-high");
        assert_eq!(first.state, JobState::Running);
        assert_eq!(first.attempts, 1);

        let second = store.claim_next_job(&types, now, 300).unwrap().unwrap();
        assert_eq!(second.id, "j-low");
        let third = store.claim_next_job(&types, now, 300).unwrap().unwrap();
        assert_eq!(third.id, "j-low2");
        assert!(store.claim_next_job(&types, now, 300).unwrap().is_none());
    }

    #[test]
    fn not_before_defers_claims() {
        let store = Store::open_in_memory().unwrap();
        let base = t0();
        let mut deferred = job("j1", "work", 0, base);
        deferred.not_before = base + Duration::seconds(100);
        store.insert_job(&deferred).unwrap();

        let types = vec!["work".to_string()];
        assert!(store.claim_next_job(&types, base, 300).unwrap().is_none());
        assert!(store
            .claim_next_job(&types, base + Duration::seconds(100), 300)
            .unwrap()
            .is_some());
    }

    #[test]
    fn expired_lease_is_reclaimed() {
        let store = Store::open_in_memory().unwrap();
        let base = t0();
        store.insert_job(&job("j1", "work", 0, base)).unwrap();

        let types = vec!["work".to_string()];
        store.claim_next_job(&types, base, 300).unwrap().unwrap();
        assert_eq!(store.reclaim_expired_leases(base).unwrap(), 0);

        let after_lease = base + Duration::seconds(301);
        assert_eq!(store.reclaim_expired_leases(after_lease).unwrap(), 1);

        let again = store
            .claim_next_job(&types, after_lease, 300)
            .unwrap()
            .unwrap();
        assert_eq!(again.id, "j1");
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn cancel_queued_is_immediate_running_is_flagged() {
        let store = Store::open_in_memory().unwrap();
        let base = t0();
        store.insert_job(&job("j1", "work", 0, base)).unwrap();
        store.insert_job(&job("j2", "work", 0, base)).unwrap();

        let types = vec!["work".to_string()];
        let running = store.claim_next_job(&types, base, 300).unwrap().unwrap();
        assert_eq!(running.id, "j1");

        assert_eq!(
            store.request_job_cancel("j1", base).unwrap(),
            JobState::Running
        );
        assert!(store.get_job("j1").unwrap().unwrap().cancel_requested);

        assert_eq!(
            store.request_job_cancel("j2", base).unwrap(),
            JobState::Cancelled
        );
    }

    #[test]
    fn dedup_lookup_ignores_terminal_jobs() {
        let store = Store::open_in_memory().unwrap();
        let base = t0();
        let mut j = job("j1", "work", 0, base);
        j.dedup_key = Some("u1:s1".into());
        store.insert_job(&j).unwrap();

        assert!(store.find_job_by_dedup("u1:s1").unwrap().is_some());

        let types = vec!["work".to_string()];
        store.claim_next_job(&types, base, 300).unwrap();
        store.mark_job_succeeded("j1", "{}", base).unwrap();
        assert!(store.find_job_by_dedup("u1:s1").unwrap().is_none());
    }
}
