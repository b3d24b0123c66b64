//! Connector cold-start amortization.
//!
//! The first invocation against a freshly spawned CLI child is far
//! slower than steady state. At startup, one Low-priority no-op command
//! is enqueued per connector type that has at least one registered
//! agent, so the cost is paid out of band instead of by the first real
//! task.

use crate::constants::WARMUP_COMMAND;
use crate::models::{ConnectorType, Priority, Task};
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

pub struct WarmupCoordinator {
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
}

impl WarmupCoordinator {
    pub fn new(registry: Arc<AgentRegistry>, queue: Arc<TaskQueue>) -> Self {
        Self { registry, queue }
    }

    /// Enqueue the warmup no-ops. Failures are logged and never
    /// retried; warmup is purely opportunistic. Returns the number of
    /// warmup tasks enqueued.
    pub async fn run(&self) -> usize {
        let agents = self.registry.list().await;
        let mut warmed: HashSet<ConnectorType> = HashSet::new();
        let mut enqueued = 0;

        for agent in agents {
            if warmed.contains(&agent.connector) {
                continue;
            }
            let task = Task::new(
                WARMUP_COMMAND,
                agent.repository_path.clone(),
                Priority::Low,
            );
            match self.queue.enqueue(task).await {
                Ok(task_id) => {
                    info!(
                        connector = %agent.connector,
                        agent_id = %agent.id,
                        task_id = %task_id,
                        "Warmup task enqueued"
                    );
                    warmed.insert(agent.connector);
                    enqueued += 1;
                }
                Err(e) => {
                    warn!(connector = %agent.connector, "Warmup enqueue failed (not retried): {e}");
                    warmed.insert(agent.connector);
                }
            }
        }
        enqueued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::models::ConnectorType;
    use crate::store::{MemoryStore, StateStore};
    use crate::config::Config;

    async fn harness() -> (Arc<AgentRegistry>, Arc<TaskQueue>) {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(16));
        let registry = Arc::new(AgentRegistry::new(
            store.clone(),
            bus.clone(),
            Config::default().registry,
            1,
        ));
        let queue = Arc::new(TaskQueue::new(store, bus, 100));
        (registry, queue)
    }

    #[tokio::test]
    async fn one_warmup_task_per_connector_type() {
        let (registry, queue) = harness().await;
        registry
            .register("a1", "one", ConnectorType::Simulated, "/r1")
            .await
            .unwrap();
        registry
            .register("a2", "two", ConnectorType::Simulated, "/r2")
            .await
            .unwrap();

        let warmup = WarmupCoordinator::new(registry, queue.clone());
        assert_eq!(warmup.run().await, 1);

        let pending = queue.snapshot_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].priority, Priority::Low);
        assert_eq!(pending[0].command, WARMUP_COMMAND);
    }

    #[tokio::test]
    async fn no_agents_means_no_warmup() {
        let (registry, queue) = harness().await;
        let warmup = WarmupCoordinator::new(registry, queue.clone());
        assert_eq!(warmup.run().await, 0);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }
}
