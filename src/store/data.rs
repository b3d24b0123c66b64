//! Shared row logic for the in-process store engines. Everything here
//! runs under the owning engine's mutex, so each method is one atomic
//! transaction.

use super::{StoreError, StoreResult, TaskUpdate};
use crate::models::{
    normalize_repo_path, repo_paths_match, AgentRecord, Repository, Task, TaskState,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(super) struct StoreData {
    pub agents: HashMap<String, AgentRecord>,
    pub tasks: HashMap<String, Task>,
    /// Keyed by normalized path.
    pub repositories: HashMap<String, Repository>,
}

impl StoreData {
    pub fn upsert_agent(&mut self, mut agent: AgentRecord) {
        agent.touch();
        self.agents.insert(agent.id.clone(), agent);
    }

    pub fn soft_delete_agent(&mut self, id: &str) -> StoreResult<()> {
        let agent = self
            .agents
            .get_mut(id)
            .ok_or_else(|| StoreError::Constraint(format!("unknown agent: {id}")))?;
        agent.soft_deleted = true;
        agent.touch();
        Ok(())
    }

    pub fn list_agents(&self, include_deleted: bool) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self
            .agents
            .values()
            .filter(|a| include_deleted || !a.soft_deleted)
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        agents
    }

    pub fn upsert_repository(&mut self, repository: Repository) {
        let key = normalize_repo_path(&repository.path);
        self.repositories.entry(key).or_insert(repository);
    }

    pub fn enqueue_task(&mut self, mut task: Task) {
        task.status = TaskState::Pending;
        self.tasks.insert(task.id.clone(), task);
    }

    /// The claim predicate and ordering: Pending, repository match (or
    /// empty task path), priority descending, then FIFO by creation
    /// time.
    pub fn claim_next_task(&mut self, agent: &AgentRecord) -> Option<Task> {
        let candidate_id = self
            .tasks
            .values()
            .filter(|t| t.status == TaskState::Pending)
            .filter(|t| {
                t.repository_path.is_empty()
                    || repo_paths_match(&t.repository_path, &agent.repository_path)
            })
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|t| t.id.clone())?;

        let task = self.tasks.get_mut(&candidate_id)?;
        task.status = TaskState::Assigned;
        task.assigned_agent_id = Some(agent.id.clone());
        Some(task.clone())
    }

    pub fn update_task_status(
        &mut self,
        task_id: &str,
        new_state: TaskState,
        update: TaskUpdate,
    ) -> StoreResult<Task> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::Constraint(format!("unknown task: {task_id}")))?;

        if !task.status.can_transition_to(new_state) {
            return Err(StoreError::Constraint(format!(
                "illegal task transition {} -> {} for {task_id}",
                task.status, new_state
            )));
        }

        task.status = new_state;
        if let Some(agent_id) = update.assigned_agent_id {
            task.assigned_agent_id = Some(agent_id);
        }
        if let Some(started_at) = update.started_at {
            task.started_at = Some(started_at.max(task.created_at));
        }
        if let Some(completed_at) = update.completed_at {
            let floor = task.started_at.unwrap_or(task.created_at);
            task.completed_at = Some(completed_at.max(floor));
        }
        if update.result.is_some() {
            task.result = update.result;
        }
        if update.error_message.is_some() {
            task.error_message = update.error_message;
        }
        Ok(task.clone())
    }

    pub fn list_tasks_by_repository(&self, repository_path: &str) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| repo_paths_match(&t.repository_path, repository_path))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    pub fn list_tasks_by_status(&self, status: TaskState) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    pub fn count_tasks_by_status(&self) -> HashMap<TaskState, usize> {
        let mut counts = HashMap::new();
        for task in self.tasks.values() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn count_pending(&self) -> usize {
        self.tasks
            .values()
            .filter(|t| t.status == TaskState::Pending)
            .count()
    }
}
