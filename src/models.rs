use crate::constants::AUTO_AGENT_ID_PREFIX;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Mechanism that runs commands for an agent.
///
/// `ClaudeCode` drives the Claude Code CLI as a long-lived child
/// process; `Simulated` is an in-process stand-in used by tests and
/// local development.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectorType {
    ClaudeCode,
    Simulated,
}

impl ConnectorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorType::ClaudeCode => "claude-code",
            ConnectorType::Simulated => "simulated",
        }
    }
}

impl fmt::Display for ConnectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude-code" => Ok(ConnectorType::ClaudeCode),
            "simulated" => Ok(ConnectorType::Simulated),
            _ => Err(format!("Unknown connector type: {s}")),
        }
    }
}

/// Task priority levels, ordered: Critical > High > Normal > Low.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Critical and High share the dedicated high-priority worker pool;
    /// Normal and Low go through the default pool.
    pub fn is_high_pool(&self) -> bool {
        matches!(self, Priority::High | Priority::Critical)
    }
}

/// Agent presence states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AgentState {
    Idle,
    Busy,
    Error,
    Offline,
}

impl AgentState {
    /// The legal agent transition graph. Everything not listed here is
    /// rejected and leaves state unchanged.
    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Idle, Busy)
                | (Idle, Offline)
                | (Idle, Error)
                | (Busy, Idle)
                | (Busy, Error)
                | (Busy, Offline)
                | (Error, Idle)
                | (Error, Offline)
                | (Offline, Idle)
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Idle => "idle",
            AgentState::Busy => "busy",
            AgentState::Error => "error",
            AgentState::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Task lifecycle states. Completed, Failed, and Cancelled are sinks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Assigned, InProgress)
                | (Assigned, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Assigned => "assigned",
            TaskState::InProgress => "in_progress",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A registered logical worker tied to a repository path and a
/// connector type. Persisted; survives restarts; removed only via
/// soft-delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub name: String,
    pub connector: ConnectorType,
    pub repository_path: String,
    pub status: AgentState,
    pub last_heartbeat: chrono::DateTime<chrono::Utc>,
    pub current_task_id: Option<String>,
    pub session_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub soft_deleted: bool,
}

impl AgentRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        connector: ConnectorType,
        repository_path: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            connector,
            repository_path: repository_path.into(),
            status: AgentState::Idle,
            last_heartbeat: now,
            current_task_id: None,
            session_id: None,
            created_at: now,
            updated_at: now,
            soft_deleted: false,
        }
    }

    /// Auto-provisioned agent for a repository nobody serves yet.
    pub fn provisioned(repository_path: impl Into<String>, connector: ConnectorType) -> Self {
        let short = Uuid::new_v4().simple().to_string();
        let id = format!("{AUTO_AGENT_ID_PREFIX}{}", &short[..8]);
        let name = id.clone();
        Self::new(id, name, connector, repository_path)
    }

    pub fn is_provisioned(&self) -> bool {
        self.id.starts_with(AUTO_AGENT_ID_PREFIX)
    }

    pub fn heartbeat_age(&self) -> chrono::Duration {
        chrono::Utc::now() - self.last_heartbeat
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now();
    }
}

/// A single command submitted for execution against some repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub command: String,
    pub repository_path: String,
    pub priority: Priority,
    pub status: TaskState,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub assigned_agent_id: Option<String>,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    /// Id of the task this one retries, when the dispatcher re-enqueued
    /// a failed run as a fresh row.
    pub retry_of: Option<String>,
    pub origin_subscriber_id: Option<Uuid>,
}

impl Task {
    pub fn new(
        command: impl Into<String>,
        repository_path: impl Into<String>,
        priority: Priority,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command: command.into(),
            repository_path: repository_path.into(),
            priority,
            status: TaskState::Pending,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_agent_id: None,
            result: None,
            error_message: None,
            retry_count: 0,
            retry_of: None,
            origin_subscriber_id: None,
        }
    }

    pub fn with_origin(mut self, subscriber_id: Uuid) -> Self {
        self.origin_subscriber_id = Some(subscriber_id);
        self
    }

    /// Fresh Pending row for the next attempt of a failed task. The
    /// failed row stays terminal; the copy carries the attempt count.
    pub fn retry_of(failed: &Task) -> Self {
        let mut next = Task::new(
            failed.command.clone(),
            failed.repository_path.clone(),
            failed.priority,
        );
        next.retry_count = failed.retry_count + 1;
        next.retry_of = Some(failed.retry_of.clone().unwrap_or_else(|| failed.id.clone()));
        next.origin_subscriber_id = failed.origin_subscriber_id;
        next
    }
}

/// A source-code working directory agents attach to. Created on first
/// registration for its path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub path: String,
    pub active: bool,
}

impl Repository {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = path
            .rsplit(['/', '\\'])
            .find(|s| !s.is_empty())
            .unwrap_or(&path)
            .to_string();
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            path,
            active: true,
        }
    }
}

/// Canonical form used for repository path comparison: forward slashes,
/// lowercase, no trailing separator.
pub fn normalize_repo_path(path: &str) -> String {
    let mut normalized = path.trim().replace('\\', "/").to_lowercase();
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Repository affinity rule: normalized paths match when equal or when
/// either is a subdirectory of the other.
pub fn repo_paths_match(a: &str, b: &str) -> bool {
    let a = normalize_repo_path(a);
    let b = normalize_repo_path(b);
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    let is_prefix = |parent: &str, child: &str| {
        child.starts_with(parent)
            && (parent.ends_with('/') || child[parent.len()..].starts_with('/'))
    };
    is_prefix(&a, &b) || is_prefix(&b, &a)
}
