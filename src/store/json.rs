use super::data::StoreData;
use super::{StateStore, StoreError, StoreResult, TaskUpdate};
use crate::models::{AgentRecord, Repository, Task, TaskState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Snapshot-file store engine: memory semantics, with the full state
/// serialized to JSON after every mutation. The snapshot is written to
/// a sibling temp file and renamed into place, so a crash never leaves
/// a torn state file.
#[derive(Clone)]
pub struct JsonStore {
    data: Arc<Mutex<StoreData>>,
    path: PathBuf,
}

impl JsonStore {
    /// Open the store, rehydrating from `path` when it exists.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let data: StoreData = serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Unavailable(format!("corrupt state file: {e}")))?;
                info!(
                    agents = data.agents.len(),
                    tasks = data.tasks.len(),
                    "Rehydrated state from {}",
                    path.display()
                );
                data
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "cannot read state file {}: {e}",
                    path.display()
                )))
            }
        };

        Ok(Self {
            data: Arc::new(Mutex::new(data)),
            path,
        })
    }

    /// Persist while still holding the data lock, so the snapshot always
    /// reflects exactly one transaction boundary.
    async fn persist(&self, data: &StoreData) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(data)
            .map_err(|e| StoreError::Unavailable(format!("serialize state: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| StoreError::Unavailable(format!("write state file: {e}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Unavailable(format!("replace state file: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonStore {
    async fn upsert_agent(&self, agent: AgentRecord) -> StoreResult<()> {
        let mut data = self.data.lock().await;
        data.upsert_agent(agent);
        self.persist(&data).await
    }

    async fn soft_delete_agent(&self, id: &str) -> StoreResult<()> {
        let mut data = self.data.lock().await;
        data.soft_delete_agent(id)?;
        self.persist(&data).await
    }

    async fn get_agent(&self, id: &str) -> StoreResult<Option<AgentRecord>> {
        Ok(self.data.lock().await.agents.get(id).cloned())
    }

    async fn list_agents(&self, include_deleted: bool) -> StoreResult<Vec<AgentRecord>> {
        Ok(self.data.lock().await.list_agents(include_deleted))
    }

    async fn upsert_repository(&self, repository: Repository) -> StoreResult<()> {
        let mut data = self.data.lock().await;
        data.upsert_repository(repository);
        self.persist(&data).await
    }

    async fn list_repositories(&self) -> StoreResult<Vec<Repository>> {
        Ok(self.data.lock().await.repositories.values().cloned().collect())
    }

    async fn enqueue_task(&self, task: Task) -> StoreResult<()> {
        let mut data = self.data.lock().await;
        data.enqueue_task(task);
        self.persist(&data).await
    }

    async fn claim_next_task(&self, agent: &AgentRecord) -> StoreResult<Option<Task>> {
        let mut data = self.data.lock().await;
        match data.claim_next_task(agent) {
            Some(task) => {
                self.persist(&data).await?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn update_task_status(
        &self,
        task_id: &str,
        new_state: TaskState,
        update: TaskUpdate,
    ) -> StoreResult<Task> {
        let mut data = self.data.lock().await;
        let task = data.update_task_status(task_id, new_state, update)?;
        self.persist(&data).await?;
        Ok(task)
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
