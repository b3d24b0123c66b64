//! Durable persistence of agents, tasks, and repositories.
//!
//! The contract is a narrow set of atomic operations; any engine that
//! satisfies it is acceptable. Two engines ship here: `MemoryStore`
//! (reference semantics, used heavily by tests) and `JsonStore`
//! (memory semantics plus an atomically-replaced snapshot file).

use crate::models::{AgentRecord, Repository, Task, TaskState};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

mod data;
mod json;
mod memory;


pub use json::JsonStore;
pub use memory::MemoryStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Persistence failures split by how callers must react: `Unavailable`
/// is transient and retryable with backoff, `Constraint` aborts the
/// current action.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("constraint violation: {0}")]
    Constraint(String),
}

impl From<StoreError> for crate::ForemanError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) => crate::ForemanError::StorageUnavailable(msg),
            StoreError::Constraint(msg) => crate::ForemanError::ConstraintViolation(msg),
        }
    }
}

/// Optional fields written together with a task status transition.
#[derive(Debug, Default, Clone)]
pub struct TaskUpdate {
    pub assigned_agent_id: Option<String>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub result: Option<String>,
    pub error_message: Option<String>,
}

impl TaskUpdate {
    pub fn started_now() -> Self {
        Self {
            started_at: Some(chrono::Utc::now()),
            ..Self::default()
        }
    }

    pub fn completed(result: impl Into<String>) -> Self {
        Self {
            completed_at: Some(chrono::Utc::now()),
            result: Some(result.into()),
            ..Self::default()
        }
    }

    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            completed_at: Some(chrono::Utc::now()),
            error_message: Some(error_message.into()),
            ..Self::default()
        }
    }
}

/// Transactional persistence surface. All operations are atomic with
/// respect to each other.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or update an agent by id; bumps `updated_at`.
    async fn upsert_agent(&self, agent: AgentRecord) -> StoreResult<()>;

    /// Set the tombstone flag. A later registration with the same id
    /// restores the record.
    async fn soft_delete_agent(&self, id: &str) -> StoreResult<()>;

    async fn get_agent(&self, id: &str) -> StoreResult<Option<AgentRecord>>;

    /// Consistent snapshot of all agents.
    async fn list_agents(&self, include_deleted: bool) -> StoreResult<Vec<AgentRecord>>;

    /// Insert the repository if its (normalized) path is new.
    async fn upsert_repository(&self, repository: Repository) -> StoreResult<()>;

    async fn list_repositories(&self) -> StoreResult<Vec<Repository>>;

    /// Insert a task with status Pending.
    async fn enqueue_task(&self, task: Task) -> StoreResult<()>;

    /// Atomically fetch the oldest highest-priority Pending task whose
    /// repository matches the agent (empty task path matches any agent)
    /// and mark it Assigned to the agent. Two concurrent claims can
    /// never return the same task.
    async fn claim_next_task(&self, agent: &AgentRecord) -> StoreResult<Option<Task>>;

    /// Transition a task, writing `update`'s fields. Rejects illegal
    /// transitions (defense in depth; primary enforcement is in the
    /// dispatcher). Returns the stored row after the update.
    async fn update_task_status(
        &self,
        task_id: &str,
        new_state: TaskState,
        update: TaskUpdate,
    ) -> StoreResult<Task>;

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>>;

    async fn list_tasks_by_repository(&self, repository_path: &str) -> StoreResult<Vec<Task>>;

    async fn list_tasks_by_status(&self, status: TaskState) -> StoreResult<Vec<Task>>;

    async fn count_tasks_by_status(&self) -> StoreResult<HashMap<TaskState, usize>>;

    async fn count_pending(&self) -> StoreResult<usize>;
}
