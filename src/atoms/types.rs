// ── CharHub Atoms: Pure Data Types ─────────────────────────────────────────
// Plain struct/enum definitions that flow through the entire engine.
// Ids are opaque UUID strings; credits are integer units; timestamps are
// UTC RFC 3339 strings at the storage boundary and `DateTime<Utc>` in memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Users ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Free,
    Premium,
    Admin,
}

/// Content / preference age rating, ordered from most to least restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeRating {
    Everyone,
    Teen,
    Mature,
    Adult,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Free => "free",
            UserRole::Premium => "premium",
            UserRole::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "free" => UserRole::Free,
            "premium" => UserRole::Premium,
            "admin" => UserRole::Admin,
            _ => return None,
        })
    }
}

impl AgeRating {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgeRating::Everyone => "everyone",
            AgeRating::Teen => "teen",
            AgeRating::Mature => "mature",
            AgeRating::Adult => "adult",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "everyone" => AgeRating::Everyone,
            "teen" => AgeRating::Teen,
            "mature" => AgeRating::Mature,
            "adult" => AgeRating::Adult,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub preferred_language: String,
    pub role: UserRole,
    /// Highest age rating this user may interact with.
    pub max_age_rating: AgeRating,
    pub created_at: DateTime<Utc>,
}

// ── Conversations & membership ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub owner_user_id: String,
    pub is_multi_user: bool,
    pub max_users: i64,
    pub allow_user_invites: bool,
    pub created_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipRole {
    Owner,
    Moderator,
    Member,
    Viewer,
}

impl MembershipRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipRole::Owner => "owner",
            MembershipRole::Moderator => "moderator",
            MembershipRole::Member => "member",
            MembershipRole::Viewer => "viewer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "owner" => MembershipRole::Owner,
            "moderator" => MembershipRole::Moderator,
            "member" => MembershipRole::Member,
            "viewer" => MembershipRole::Viewer,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub conversation_id: String,
    pub user_id: String,
    pub role: MembershipRole,
    pub can_write: bool,
    pub can_invite: bool,
    pub can_moderate: bool,
    pub is_active: bool,
    pub invited_by: Option<String>,
    pub joined_at: DateTime<Utc>,
}

/// A non-human (or human) seat in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    User,
    CharacterDirect,
    Assistant,
}

impl ParticipantKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantKind::User => "user",
            ParticipantKind::CharacterDirect => "character_direct",
            ParticipantKind::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "user" => ParticipantKind::User,
            "character_direct" => ParticipantKind::CharacterDirect,
            "assistant" => ParticipantKind::Assistant,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub conversation_id: String,
    pub kind: ParticipantKind,
    /// Bound user id when kind = User.
    pub user_id: Option<String>,
    /// Bound character id when kind = CharacterDirect or Assistant.
    pub represented_character_id: Option<String>,
    /// Name shown in the room; what `@mentions` match against.
    pub display_name: String,
    pub llm_profile: Option<LlmProfile>,
    pub config_override: Option<Value>,
    pub created_at: DateTime<Utc>,
}

impl Participant {
    pub fn is_ai(&self) -> bool {
        self.kind != ParticipantKind::User
    }
}

/// Which model a non-human participant speaks through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmProfile {
    pub provider: ProviderKind,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

// ── Messages ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    User,
    Character,
    Assistant,
    System,
}

impl SenderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SenderKind::User => "user",
            SenderKind::Character => "character",
            SenderKind::Assistant => "assistant",
            SenderKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "user" => SenderKind::User,
            "character" => SenderKind::Character,
            "assistant" => SenderKind::Assistant,
            "system" => SenderKind::System,
            _ => return None,
        })
    }
}

/// Message content: plain text or structured JSON (e.g. rich cards).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Text(String),
    Structured(Value),
}

impl MessageBody {
    pub fn as_text(&self) -> String {
        match self {
            MessageBody::Text(s) => s.clone(),
            MessageBody::Structured(v) => v
                .get("text")
                .and_then(|t| t.as_str())
                .map(|s| s.to_string())
                .unwrap_or_else(|| v.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// An immutable, ordered utterance in a conversation. Append-only; ordering
/// is strict per conversation by (created_at, id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_kind: SenderKind,
    /// User id, participant id, or "system" depending on sender_kind.
    pub sender_ref: String,
    pub content: MessageBody,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

// ── Plans & credit ledger ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub monthly_credits: i64,
    pub price_usd: f64,
    pub features: Value,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserPlanStatus {
    Active,
    Cancelled,
    Expired,
    Suspended,
}

impl UserPlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserPlanStatus::Active => "active",
            UserPlanStatus::Cancelled => "cancelled",
            UserPlanStatus::Expired => "expired",
            UserPlanStatus::Suspended => "suspended",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "active" => UserPlanStatus::Active,
            "cancelled" => UserPlanStatus::Cancelled,
            "expired" => UserPlanStatus::Expired,
            "suspended" => UserPlanStatus::Suspended,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPlan {
    pub id: String,
    pub user_id: String,
    pub plan_id: String,
    pub status: UserPlanStatus,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub last_credits_granted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    GrantInitial,
    GrantPlan,
    Purchase,
    Consumption,
    AdjustmentAdd,
    AdjustmentRemove,
    Refund,
    Expiration,
    SystemReward,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::GrantInitial => "grant_initial",
            TransactionKind::GrantPlan => "grant_plan",
            TransactionKind::Purchase => "purchase",
            TransactionKind::Consumption => "consumption",
            TransactionKind::AdjustmentAdd => "adjustment_add",
            TransactionKind::AdjustmentRemove => "adjustment_remove",
            TransactionKind::Refund => "refund",
            TransactionKind::Expiration => "expiration",
            TransactionKind::SystemReward => "system_reward",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "grant_initial" => TransactionKind::GrantInitial,
            "grant_plan" => TransactionKind::GrantPlan,
            "purchase" => TransactionKind::Purchase,
            "consumption" => TransactionKind::Consumption,
            "adjustment_add" => TransactionKind::AdjustmentAdd,
            "adjustment_remove" => TransactionKind::AdjustmentRemove,
            "refund" => TransactionKind::Refund,
            "expiration" => TransactionKind::Expiration,
            "system_reward" => TransactionKind::SystemReward,
            _ => return None,
        })
    }
}

/// Append-only ledger row. Positive amounts grant, negative amounts debit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: String,
    pub user_id: String,
    pub kind: TransactionKind,
    pub amount: i64,
    pub notes: String,
    pub related_usage_id: Option<String>,
    pub related_plan_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Cached starting balance at the first instant of a UTC month.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlySnapshot {
    pub user_id: String,
    pub month_start: DateTime<Utc>,
    pub starting_balance: i64,
}

/// A short-lived hold on credits pending an action's outcome. Counted
/// against balance reads while unexpired; never written as consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub user_id: String,
    pub amount: i64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ── Usage records ──────────────────────────────────────────────────────────

/// One metered unit of delivered service. `credits_charged` is written
/// exactly once by the pricing worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub user_id: String,
    pub service_key: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub chars: Option<i64>,
    pub units: Option<f64>,
    pub raw_cost_usd: Option<f64>,
    pub credits_charged: Option<i64>,
    pub failed_insufficient_credits: bool,
    pub unknown_service: bool,
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// Billable quantity attached to a usage record; the cost table decides
/// which dimension prices the service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostUnit {
    PerThousandTokens,
    PerImage,
    PerThousandChars,
    PerRequest,
    PerMinute,
    PerStory,
    PerTurn,
    PerCharacter,
    PerPrompt,
}

impl CostUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            CostUnit::PerThousandTokens => "per 1k total tokens",
            CostUnit::PerImage => "per image",
            CostUnit::PerThousandChars => "per 1000 characters",
            CostUnit::PerRequest => "per request",
            CostUnit::PerMinute => "per minute",
            CostUnit::PerStory => "per story",
            CostUnit::PerTurn => "per turn",
            CostUnit::PerCharacter => "per character",
            CostUnit::PerPrompt => "per prompt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "per 1k total tokens" => CostUnit::PerThousandTokens,
            "per image" => CostUnit::PerImage,
            "per 1000 characters" => CostUnit::PerThousandChars,
            "per request" => CostUnit::PerRequest,
            "per minute" => CostUnit::PerMinute,
            "per story" => CostUnit::PerStory,
            "per turn" => CostUnit::PerTurn,
            "per character" => CostUnit::PerCharacter,
            "per prompt" => CostUnit::PerPrompt,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCost {
    pub service_key: String,
    pub credits_per_unit: i64,
    pub unit: CostUnit,
    pub notes: Option<String>,
}

// ── Jobs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => JobState::Queued,
            "running" => JobState::Running,
            "succeeded" => JobState::Succeeded,
            "failed" => JobState::Failed,
            "cancelled" => JobState::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProgress {
    pub stage: i64,
    pub total: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// A durable unit of asynchronous work. Delivery is at-least-once; handlers
/// must be idempotent keyed on the job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub payload: Value,
    pub state: JobState,
    pub attempts: i64,
    pub max_attempts: i64,
    pub priority: i64,
    pub not_before: DateTime<Utc>,
    pub lease_until: Option<DateTime<Utc>>,
    pub owner_user_id: String,
    pub session_id: Option<String>,
    pub dedup_key: Option<String>,
    pub cancel_requested: bool,
    pub progress: JobProgress,
    pub result: Option<Value>,
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Progress event published on every `progress()` call, routed into
/// `job:<owner>:<session>` hub rooms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgressEvent {
    pub job_id: String,
    pub owner_user_id: String,
    pub session_id: Option<String>,
    pub stage: i64,
    pub total: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// ── LLM broker types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    OpenRouter,
    Custom,
}

impl ProviderKind {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
            ProviderKind::Custom => "",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub kind: ProviderKind,
    pub api_key: String,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        PromptMessage {
            role: ChatRole::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        PromptMessage {
            role: ChatRole::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        PromptMessage {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object.
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub output: String,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    None,
    Required,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub provider: Option<String>,
    pub model: String,
    pub messages: Vec<PromptMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub allow_browsing: bool,
    /// Per-request override of the default 120 s timeout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<PromptMessage>) -> Self {
        CompletionRequest {
            provider: None,
            model: model.into(),
            messages,
            system_prompt: None,
            tools: vec![],
            tool_choice: ToolChoice::None,
            temperature: None,
            max_tokens: None,
            allow_browsing: false,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn merge(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One frame of a lazy, finite, non-restartable response stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamFrame {
    Chunk { delta: String },
    ToolCall { call: ToolCall },
    End {
        finish_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

// ── Session hub wire events ────────────────────────────────────────────────
// Frames on /api/v1/ws are JSON objects {type, payload, id?}; these enums are
// the payload vocabulary for both directions.

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinConversation {
        conversation_id: String,
    },
    LeaveConversation {
        conversation_id: String,
    },
    SendMessage {
        conversation_id: String,
        content: MessageBody,
        #[serde(default)]
        attachments: Vec<Attachment>,
        #[serde(default)]
        metadata: Option<Value>,
        #[serde(default)]
        target_participant_id: Option<String>,
    },
    TypingStart {
        conversation_id: String,
    },
    TypingStop {
        conversation_id: String,
    },
    JoinJobProgress {
        session_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived {
        message: ChatMessage,
    },
    UserJoined {
        user_id: String,
    },
    UserLeft {
        user_id: String,
    },
    UserTypingStart {
        user_id: String,
    },
    UserTypingStop {
        user_id: String,
    },
    PresenceUpdate {
        online_user_ids: Vec<String>,
    },
    AiResponseStart {
        participant_id: String,
        message_id: String,
    },
    AiResponseChunk {
        participant_id: String,
        message_id: String,
        delta: String,
    },
    AiResponseComplete {
        participant_id: String,
        message_id: String,
    },
    AiResponseError {
        participant_id: String,
        reason: String,
    },
    JobProgress {
        session_id: String,
        stage: i64,
        total: i64,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Error {
        code: String,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_body_untagged_roundtrip() {
        let text: MessageBody = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(text.as_text(), "hello");

        let structured: MessageBody =
            serde_json::from_str(r#"{"text":"hi","card":"x"}"#).unwrap();
        assert_eq!(structured.as_text(), "hi");
    }

    #[test]
    fn client_event_frames_parse() {
        let ev: ClientEvent = serde_json::from_str(
            r#"{"type":"send_message","payload":{"conversation_id":"c1","content":"hi"}}"#,
        )
        .unwrap();
        match ev {
            ClientEvent::SendMessage {
                conversation_id,
                content,
                ..
            } => {
                assert_eq!(conversation_id, "c1");
                assert_eq!(content.as_text(), "hi");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn job_state_terminality() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn cost_unit_strings_roundtrip() {
        for unit in [
            CostUnit::PerThousandTokens,
            CostUnit::PerImage,
            CostUnit::PerThousandChars,
            CostUnit::PerRequest,
            CostUnit::PerMinute,
            CostUnit::PerStory,
            CostUnit::PerTurn,
            CostUnit::PerCharacter,
            CostUnit::PerPrompt,
        ] {
            assert_eq!(CostUnit::parse(unit.as_str()), Some(unit));
        }
    }
}
