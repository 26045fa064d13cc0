//! Data model (spec.md §3). Storage representation is a repository
//! concern; these are the in-process shapes the core manipulates. Shaped
//! after the teacher's `#[derive(FromRow)]` row structs in `database.rs`,
//! generalized from session/channel rows to the task/conversation domain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type TaskId = i64;
pub type ConversationId = i64;
pub type ExecutionLogId = i64;
pub type ProjectId = i64;
pub type DevEnvironmentId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    /// The source never transitions a task to `Done` from this core — see
    /// DESIGN.md's Open Question decision. Kept as a variant because the
    /// data model allows it upstream; this core simply never writes it.
    Done,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ConversationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConversationStatus::Success | ConversationStatus::Failed | ConversationStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DevEnvironmentType {
    ClaudeCode,
    Opencode,
    GeminiCli,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    Password,
    Token,
    SshKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub dev_environment_id: DevEnvironmentId,
    pub title: String,
    pub start_branch: String,
    pub work_branch: String,
    /// Relative to the WorkspaceManager's `base_dir`. Empty until a
    /// workspace has been created for this task.
    pub workspace_path: String,
    pub session_id: Option<String>,
    pub status: TaskStatus,
    pub created_by: String,
}

/// Small key/value mapping carried on a conversation: `model`,
/// `is_plan_mode`, as loosely-typed JSON values (spec.md §3).
pub type EnvParams = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub task_id: TaskId,
    pub content: String,
    pub env_params: EnvParams,
    pub status: ConversationStatus,
    pub execution_time: Option<DateTime<Utc>>,
    pub commit_hash: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn model(&self) -> Option<&str> {
        self.env_params.get("model").and_then(|v| v.as_str())
    }

    pub fn is_plan_mode(&self) -> bool {
        self.env_params
            .get("is_plan_mode")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: ExecutionLogId,
    pub conversation_id: ConversationId,
    pub execution_logs: String,
    pub docker_command: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Whitelisted fields for [`crate::repositories::ExecutionLogRepository::update_metadata`].
/// `execution_logs` is never part of this — it is append-only via `append_log`.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLogMetadata {
    pub error_message: Option<Option<String>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub docker_command: Option<Option<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationResult {
    pub conversation_id: ConversationId,
    #[serde(rename = "type")]
    pub result_type: String,
    pub subtype: String,
    pub is_error: bool,
    pub session_id: String,
    pub duration_ms: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub repo_url: String,
    pub credential: Option<Credential>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevEnvironment {
    pub id: DevEnvironmentId,
    #[serde(rename = "type")]
    pub env_type: DevEnvironmentType,
    pub docker_image: String,
    pub cpu_limit: f64,
    pub memory_limit_mb: u64,
    /// JSON-encoded small mapping of env name -> secret value, as stored.
    pub env_vars: String,
    pub session_dir: Option<String>,
    pub system_prompt: Option<String>,
}

impl DevEnvironment {
    /// Decode `env_vars` as a flat string->string mapping. An empty or
    /// unparsable blob yields an empty map rather than an error — the
    /// container still launches with no extra env vars.
    pub fn parsed_env_vars(&self) -> HashMap<String, String> {
        serde_json::from_str(&self.env_vars).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub kind: CredentialKind,
    pub username: Option<String>,
    /// Decrypted secret material: password, token, or PEM private key text.
    pub secret: String,
}

/// A transitive closure of everything a single driver attempt needs,
/// loaded up front so downstream phases never navigate references
/// (spec.md §9 "arena+index" note).
#[derive(Debug, Clone)]
pub struct ConversationContext {
    pub conversation: Conversation,
    pub task: Task,
    pub project: Project,
    pub dev_environment: DevEnvironment,
}
