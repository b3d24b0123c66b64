use super::data::StoreData;
use super::{StateStore, StoreResult, TaskUpdate};
use crate::models::{AgentRecord, Repository, Task, TaskState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// In-memory store engine. One mutex over the row maps makes every
/// operation a serialized transaction.
#[derive(Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<StoreData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn upsert_agent(&self, agent: AgentRecord) -> StoreResult<()> {
        self.data.lock().await.upsert_agent(agent);
        Ok(())
    }

    async fn soft_delete_agent(&self, id: &str) -> StoreResult<()> {
        self.data.lock().await.soft_delete_agent(id)
    }

    async fn get_agent(&self, id: &str) -> StoreResult<Option<AgentRecord>> {
        Ok(self.data.lock().await.agents.get(id).cloned())
    }

    async fn list_agents(&self, include_deleted: bool) -> StoreResult<Vec<AgentRecord>> {
        Ok(self.data.lock().await.list_agents(include_deleted))
    }

    async fn upsert_repository(&self, repository: Repository) -> StoreResult<()> {
        self.data.lock().await.upsert_repository(repository);
        Ok(())
    }

    async fn list_repositories(&self) -> StoreResult<Vec<Repository>> {
        Ok(self.data.lock().await.repositories.values().cloned().collect())
    }

    async fn enqueue_task(&self, task: Task) -> StoreResult<()> {
        self.data.lock().await.enqueue_task(task);
        Ok(())
    }

    async fn claim_next_task(&self, agent: &AgentRecord) -> StoreResult<Option<Task>> {
        Ok(self.data.lock().await.claim_next_task(agent))
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        new_state: TaskState,
        update: TaskUpdate,
    ) -> StoreResult<Task> {
        self.data
            .lock()
            .await
            .update_task_status(task_id, new_state, update)
    }

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<Task>> {
        Ok(self.data.lock().await.tasks.get(task_id).cloned())
    }

    async fn list_tasks_by_repository(&self, repository_path: &str) -> StoreResult<Vec<Task>> {
        Ok(self
            .data
            .lock()
            .await
            .list_tasks_by_repository(repository_path))
    }

    async fn list_tasks_by_status(&self, status: TaskState) -> StoreResult<Vec<Task>> {
        Ok(self.data.lock().await.list_tasks_by_status(status))
    }

    async fn count_tasks_by_status(&self) -> StoreResult<HashMap<TaskState, usize>> {
        Ok(self.data.lock().await.count_tasks_by_status())
    }

    async fn count_pending(&self) -> StoreResult<usize> {
        Ok(self.data.lock().await.count_pending())
    }
}
