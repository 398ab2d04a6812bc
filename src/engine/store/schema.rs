// Database schema and migrations for the core store.
// Called once at startup by Store::open().
// Adding a new table or column: append an idempotent CREATE TABLE IF NOT
// EXISTS or ALTER TABLE … ADD COLUMN (errors swallowed) at the end of
// run_migrations() — never modify existing SQL to keep upgrade paths clean.

use crate::atoms::error::EngineResult;
use rusqlite::Connection;

pub(crate) fn run_migrations(conn: &Connection) -> EngineResult<()> {
    // ── Core tables ──────────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            preferred_language TEXT NOT NULL DEFAULT 'en',
            role TEXT NOT NULL DEFAULT 'free',
            max_age_rating TEXT NOT NULL DEFAULT 'teen',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            owner_user_id TEXT NOT NULL,
            is_multi_user INTEGER NOT NULL DEFAULT 0,
            max_users INTEGER NOT NULL DEFAULT 1,
            allow_user_invites INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            last_message_at TEXT
        );

        CREATE TABLE IF NOT EXISTS memberships (
            conversation_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'member',
            can_write INTEGER NOT NULL DEFAULT 1,
            can_invite INTEGER NOT NULL DEFAULT 0,
            can_moderate INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            invited_by TEXT,
            joined_at TEXT NOT NULL,
            PRIMARY KEY (conversation_id, user_id),
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS participants (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            user_id TEXT,
            represented_character_id TEXT,
            display_name TEXT NOT NULL,
            llm_profile_json TEXT,
            config_override_json TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_participants_conv
            ON participants(conversation_id, created_at);

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            sender_kind TEXT NOT NULL,
            sender_ref TEXT NOT NULL,
            content_json TEXT NOT NULL,
            attachments_json TEXT,
            metadata_json TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conv
            ON messages(conversation_id, created_at, id);
    ",
    )?;

    // ── Ledger ───────────────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS credit_transactions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            amount INTEGER NOT NULL,
            notes TEXT NOT NULL DEFAULT '',
            related_usage_id TEXT,
            related_plan_id TEXT,
            reward_day TEXT,
            grant_period TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tx_user_time
            ON credit_transactions(user_id, created_at, id);

        -- Daily reward: one row per (user, kind, UTC day); double claims
        -- collide here instead of double-granting.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tx_reward_day
            ON credit_transactions(user_id, kind, reward_day)
            WHERE reward_day IS NOT NULL;

        -- Monthly plan grant: one row per (user, plan, billing period).
        CREATE UNIQUE INDEX IF NOT EXISTS idx_tx_grant_period
            ON credit_transactions(user_id, related_plan_id, grant_period)
            WHERE grant_period IS NOT NULL;

        CREATE TABLE IF NOT EXISTS monthly_snapshots (
            user_id TEXT NOT NULL,
            month_start TEXT NOT NULL,
            starting_balance INTEGER NOT NULL,
            PRIMARY KEY (user_id, month_start)
        );

        CREATE TABLE IF NOT EXISTS reservations (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            expires_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_reservations_user
            ON reservations(user_id, expires_at);
    ",
    )?;

    // ── Usage pipeline ───────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS usage_records (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            service_key TEXT NOT NULL,
            provider TEXT,
            model TEXT,
            input_tokens INTEGER,
            output_tokens INTEGER,
            chars INTEGER,
            units REAL,
            raw_cost_usd REAL,
            credits_charged INTEGER,
            failed_insufficient_credits INTEGER NOT NULL DEFAULT 0,
            unknown_service INTEGER NOT NULL DEFAULT 0,
            metadata_json TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_usage_user_time
            ON usage_records(user_id, created_at);

        CREATE INDEX IF NOT EXISTS idx_usage_unpriced
            ON usage_records(created_at)
            WHERE credits_charged IS NULL;
    ",
    )?;

    // ── Job queue ────────────────────────────────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            job_type TEXT NOT NULL,
            payload_json TEXT NOT NULL DEFAULT '{}',
            state TEXT NOT NULL DEFAULT 'queued',
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            priority INTEGER NOT NULL DEFAULT 0,
            not_before TEXT NOT NULL,
            lease_until TEXT,
            owner_user_id TEXT NOT NULL,
            session_id TEXT,
            dedup_key TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            progress_json TEXT,
            result_json TEXT,
            error_json TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON jobs(state, priority DESC, not_before ASC, id ASC)
            WHERE state = 'queued';

        CREATE INDEX IF NOT EXISTS idx_jobs_lease
            ON jobs(lease_until)
            WHERE state = 'running';

        CREATE INDEX IF NOT EXISTS idx_jobs_dedup
            ON jobs(dedup_key)
            WHERE dedup_key IS NOT NULL;
    ",
    )?;

    // ── Plans, costs, characters, translations ───────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS plans (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            monthly_credits INTEGER NOT NULL DEFAULT 0,
            price_usd REAL NOT NULL DEFAULT 0.0,
            features_json TEXT NOT NULL DEFAULT '{}',
            is_active INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS user_plans (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            plan_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            start_date TEXT NOT NULL,
            end_date TEXT,
            current_period_start TEXT NOT NULL,
            current_period_end TEXT NOT NULL,
            last_credits_granted_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_user_plans_user
            ON user_plans(user_id, status);

        CREATE TABLE IF NOT EXISTS service_costs (
            service_key TEXT PRIMARY KEY,
            credits_per_unit INTEGER NOT NULL,
            unit TEXT NOT NULL,
            notes TEXT
        );

        CREATE TABLE IF NOT EXISTS characters (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            persona TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS character_images (
            id TEXT PRIMARY KEY,
            character_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            stage TEXT NOT NULL DEFAULT '',
            path TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        -- One row per (character, kind, stage); re-runs of a crashed job
        -- stage upsert instead of duplicating.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_character_images_stage
            ON character_images(character_id, kind, stage);

        CREATE TABLE IF NOT EXISTS translations (
            message_id TEXT NOT NULL,
            lang TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (message_id, lang)
        );
    ",
    )?;

    seed_service_costs(conn)?;

    Ok(())
}

/// Seed the cost table with the platform defaults. INSERT OR IGNORE so
/// operator edits survive restarts; hot reload reads straight from the table.
fn seed_service_costs(conn: &Connection) -> EngineResult<()> {
    let seeds: &[(&str, i64, &str, &str)] = &[
        ("chat.completion", 1, "per 1k total tokens", "streamed character replies"),
        ("chat.tool_call", 1, "per request", "web search and other tool hops"),
        ("image.generation", 5, "per image", "single image render"),
        ("image.character_dataset", 20, "per character", "4-stage reference dataset"),
        ("character.autogeneration", 10, "per character", "LLM-built character profile"),
        ("tts.synthesis", 1, "per 1000 characters", "speech synthesis"),
        ("translation.message", 1, "per 1000 characters", "message translation"),
        ("story.generation", 15, "per story", ""),
    ];

    for (key, credits, unit, notes) in seeds {
        conn.execute(
            "INSERT OR IGNORE INTO service_costs (service_key, credits_per_unit, unit, notes)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![key, credits, unit, notes],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn in_memory_db() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn migrations_run_cleanly() {
        let conn = in_memory_db();
        let result = run_migrations(&conn);
        assert!(result.is_ok(), "First migration run failed: {:?}", result);
    }

    #[test]
    fn migrations_idempotent() {
        let conn = in_memory_db();
        run_migrations(&conn).unwrap();
        let result = run_migrations(&conn);
        assert!(result.is_ok(), "Second migration run failed: {:?}", result);
    }

    #[test]
    fn core_tables_created() {
        let conn = in_memory_db();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        for required in [
            "users",
            "conversations",
            "memberships",
            "participants",
            "messages",
            "credit_transactions",
            "monthly_snapshots",
            "reservations",
            "usage_records",
            "jobs",
            "service_costs",
        ] {
            assert!(tables.contains(&required.to_string()), "missing {required}");
        }
    }

    #[test]
    fn cost_table_seeded() {
        let conn = in_memory_db();
        run_migrations(&conn).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM service_costs", [], |r| r.get(0))
            .unwrap();
        assert!(count >= 8);
    }
}
