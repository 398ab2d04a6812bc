// ── CharHub Atoms: Constants ───────────────────────────────────────────────
// All named constants for the crate live here.
// Collecting them in one place eliminates magic numbers and keeps every
// layer's code self-documenting.

// ── LLM broker ─────────────────────────────────────────────────────────────
// Per-request ceiling for a single LLM call. Overridable per request.
pub const LLM_REQUEST_TIMEOUT_SECS: u64 = 120;
// Transient provider errors (429 / 5xx / network) are retried this many times.
pub const LLM_MAX_RETRIES: u32 = 3;
pub const LLM_INITIAL_RETRY_DELAY_MS: u64 = 1000;
// Tool-execution loop depth when auto_execute is on.
pub const TOOL_LOOP_MAX_DEPTH: u32 = 3;
pub const TOOL_EXECUTION_TIMEOUT_SECS: u64 = 30;

// ── Tool registry rate limiting / caching ─────────────────────────────────
pub const TOOL_BUCKET_CAPACITY: f64 = 10.0;
pub const TOOL_BUCKET_REFILL_PER_SEC: f64 = 1.0;
pub const TOOL_CACHE_TTL_SECS: i64 = 3600;

// ── Job engine ─────────────────────────────────────────────────────────────
// A claimed job must report progress or complete within the lease, or it is
// handed to another worker.
pub const JOB_LEASE_SECS: i64 = 300;
pub const JOB_DEFAULT_MAX_ATTEMPTS: i64 = 3;
pub const JOB_BACKOFF_BASE_MS: u64 = 1000;
pub const JOB_BACKOFF_CAP_MS: u64 = 60_000;
// Idle workers poll the queue at this interval.
pub const JOB_POLL_INTERVAL_MS: u64 = 500;

// ── Ledger / policy ────────────────────────────────────────────────────────
pub const RESERVATION_TTL_SECS: i64 = 60;
pub const BALANCE_CACHE_TTL_SECS: i64 = 10;
pub const DAILY_REWARD_CREDITS: i64 = 50;

// ── Usage pipeline ─────────────────────────────────────────────────────────
// Cross-user pricing parallelism; within one user records stay strict FIFO.
pub const USAGE_MAX_PARALLEL: usize = 4;
pub const USAGE_POLL_INTERVAL_MS: u64 = 500;

// ── Membership ─────────────────────────────────────────────────────────────
pub const INVITE_TOKEN_TTL_DAYS: i64 = 7;
pub const CONVERSATION_MAX_USERS_CAP: i64 = 4;

// ── Session hub ────────────────────────────────────────────────────────────
// Messages fed to the orchestrator / LLM context window.
pub const RECENT_MESSAGES_WINDOW: i64 = 20;
// Outbound per-socket buffer; a slow consumer past this is disconnected.
pub const SOCKET_SEND_BUFFER: usize = 256;

// ── Cache key prefixes (KV store) ─────────────────────────────────────────
pub const KV_BALANCE_PREFIX: &str = "balance:";
pub const KV_RATE_PREFIX: &str = "rate:";
pub const KV_WEBSEARCH_PREFIX: &str = "tool.websearch:";
