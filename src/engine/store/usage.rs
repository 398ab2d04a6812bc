use super::{parse_ts, ts, Store};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::UsageRecord;
use rusqlite::{params, Row};

fn usage_from_row(row: &Row<'_>) -> rusqlite::Result<UsageRecord> {
    Ok(UsageRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        service_key: row.get(2)?,
        provider: row.get(3)?,
        model: row.get(4)?,
        input_tokens: row.get(5)?,
        output_tokens: row.get(6)?,
        chars: row.get(7)?,
        units: row.get(8)?,
        raw_cost_usd: row.get(9)?,
        credits_charged: row.get(10)?,
        failed_insufficient_credits: row.get::<_, i64>(11)? != 0,
        unknown_service: row.get::<_, i64>(12)? != 0,
        metadata: row
            .get::<_, Option<String>>(13)?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(serde_json::Value::Null),
        created_at: parse_ts(&row.get::<_, String>(14)?),
    })
}

const USAGE_COLS: &str = "id, user_id, service_key, provider, model, input_tokens, \
                          output_tokens, chars, units, raw_cost_usd, credits_charged, \
                          failed_insufficient_credits, unknown_service, metadata_json, created_at";

impl Store {
    pub fn insert_usage_record(&self, record: &UsageRecord) -> EngineResult<()> {
        let metadata_json = if record.metadata.is_null() {
            None
        } else {
            Some(serde_json::to_string(&record.metadata)?)
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO usage_records
                (id, user_id, service_key, provider, model, input_tokens, output_tokens,
                 chars, units, raw_cost_usd, credits_charged, failed_insufficient_credits,
                 unknown_service, metadata_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                record.id,
                record.user_id,
                record.service_key,
                record.provider,
                record.model,
                record.input_tokens,
                record.output_tokens,
                record.chars,
                record.units,
                record.raw_cost_usd,
                record.credits_charged,
                record.failed_insufficient_credits as i64,
                record.unknown_service as i64,
                metadata_json,
                ts(record.created_at),
            ],
        )?;
        Ok(())
    }

    /// Oldest unpriced records, one per user at most, so per-user FIFO holds
    /// while the pricing worker runs records from different users in parallel.
    pub fn next_unpriced_usage(&self, limit: i64) -> EngineResult<Vec<UsageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USAGE_COLS} FROM usage_records
             WHERE credits_charged IS NULL
               AND NOT EXISTS (
                   SELECT 1 FROM usage_records prior
                   WHERE prior.user_id = usage_records.user_id
                     AND prior.credits_charged IS NULL
                     AND (prior.created_at < usage_records.created_at
                          OR (prior.created_at = usage_records.created_at
                              AND prior.id < usage_records.id))
               )
             ORDER BY created_at ASC, id ASC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit], usage_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Price a record exactly once; a second write for the same id fails.
    pub fn mark_usage_priced(
        &self,
        usage_id: &str,
        credits_charged: i64,
        failed_insufficient_credits: bool,
        unknown_service: bool,
    ) -> EngineResult<()> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE usage_records
             SET credits_charged = ?2,
                 failed_insufficient_credits = ?3,
                 unknown_service = ?4
             WHERE id = ?1 AND credits_charged IS NULL",
            params![
                usage_id,
                credits_charged,
                failed_insufficient_credits as i64,
                unknown_service as i64,
            ],
        )?;
        if updated == 0 {
            return Err(EngineError::Conflict(format!(
                "usage record {usage_id} already priced or missing"
            )));
        }
        Ok(())
    }

    pub fn get_usage_record(&self, usage_id: &str) -> EngineResult<Option<UsageRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USAGE_COLS} FROM usage_records WHERE id = ?1"
        ))?;
        let mut rows = stmt
            .query_map(params![usage_id], usage_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.pop())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn record(id: &str, user: &str, offset_secs: i64) -> UsageRecord {
        UsageRecord {
            id: id.into(),
            user_id: user.into(),
            service_key: "chat.completion".into(),
            provider: Some("openai".into()),
            model: Some("gpt-4o-mini".into()),
            input_tokens: Some(900),
            output_tokens: Some(400),
            chars: None,
            units: None,
            raw_cost_usd: None,
            credits_charged: None,
            failed_insufficient_credits: false,
            unknown_service: false,
            metadata: serde_json::Value::Null,
            created_at: Utc::now() + Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn unpriced_fetch_is_fifo_per_user() {
        let store = Store::open_in_memory().unwrap();
        store.insert_usage_record(&record("a2", "u1", 2)).unwrap();
        store.insert_usage_record(&record("a1", "u1", 1)).unwrap();
        store.insert_usage_record(&record("b1", "u2", 3)).unwrap();

        let batch = store.next_unpriced_usage(10).unwrap();
        let ids: Vec<&str> = batch.iter().map(|r| r.id.as_str()).collect();
        // One record per user, and u1's is its oldest.
        assert_eq!(ids, vec!["a1", "b1"]);
    }

    #[test]
    fn pricing_is_write_once() {
        let store = Store::open_in_memory().unwrap();
        store.insert_usage_record(&record("a1", "u1", 0)).unwrap();

        store.mark_usage_priced("a1", 2, false, false).unwrap();
        let err = store.mark_usage_priced("a1", 5, false, false).unwrap_err();
        assert_eq!(err.code(), "conflict");

        let loaded = store.get_usage_record("a1").unwrap().unwrap();
        assert_eq!(loaded.credits_charged, Some(2));
    }
}
