//! Read-only operator introspection over the queue, registry, bus, and
//! dispatcher. Tests observe the system through this view instead of
//! reaching into private storage.

use crate::bus::EventBus;
use crate::connector::SessionInfo;
use crate::dispatcher::Dispatcher;
use crate::models::TaskState;
use crate::registry::AgentRegistry;
use crate::store::StateStore;
use crate::Result;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct AgentDiagnostics {
    pub id: String,
    pub name: String,
    pub status: String,
    pub repository_path: String,
    pub heartbeat_age_secs: i64,
    pub current_task_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Serialize)]
pub struct DiagnosticsReport {
    pub agents: Vec<AgentDiagnostics>,
    pub tasks: TaskCounts,
    pub in_flight: usize,
    pub dispatcher_stalled: bool,
    pub active_sessions: Vec<SessionInfo>,
    pub bus_groups: usize,
    pub bus_subscribers: usize,
}

pub struct DiagnosticsView {
    store: Arc<dyn StateStore>,
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    dispatcher: Arc<Dispatcher>,
}

impl DiagnosticsView {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<AgentRegistry>,
        bus: Arc<EventBus>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            store,
            registry,
            bus,
            dispatcher,
        }
    }

    /// Per-task status lookup for the control surface.
    pub async fn get_task(&self, task_id: &str) -> Result<Option<crate::models::Task>> {
        Ok(self.store.get_task(task_id).await?)
    }

    pub async fn report(&self) -> Result<DiagnosticsReport> {
        let agents = self
            .registry
            .list()
            .await
            .into_iter()
            .map(|a| AgentDiagnostics {
                id: a.id.clone(),
                name: a.name.clone(),
                status: a.status.to_string(),
                repository_path: a.repository_path.clone(),
                heartbeat_age_secs: a.heartbeat_age().num_seconds(),
                current_task_id: a.current_task_id.clone(),
            })
            .collect();

        let counts = self.store.count_tasks_by_status().await?;
        let count = |state: TaskState| counts.get(&state).copied().unwrap_or(0);
        let tasks = TaskCounts {
            pending: count(TaskState::Pending),
            assigned: count(TaskState::Assigned),
            in_progress: count(TaskState::InProgress),
            completed: count(TaskState::Completed),
            failed: count(TaskState::Failed),
            cancelled: count(TaskState::Cancelled),
        };

        Ok(DiagnosticsReport {
            agents,
            tasks,
            in_flight: self.dispatcher.in_flight_count(),
            dispatcher_stalled: self.dispatcher.is_stalled(),
            active_sessions: self.dispatcher.session_infos().await,
            bus_groups: self.bus.group_count(),
            bus_subscribers: self.bus.subscriber_count(),
        })
    }
}
