//! Shared wiring for end-to-end tests: the full dispatch stack over an
//! in-memory store and a simulated connector, with timings tightened so
//! suites finish quickly.

use crate::bus::EventBus;
use crate::config::Config;
use crate::connector::{ConnectorFactory, ConnectorKind, SimulatedSpec};
use crate::dispatcher::Dispatcher;
use crate::hub::ClientSessionHub;
use crate::models::{AgentRecord, AgentState, ConnectorType, Priority, Task, TaskState};
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;
use crate::store::{MemoryStore, StateStore};
use std::sync::Arc;
use std::time::Duration;

/// Hands every agent a clone of one scripted spec; the clones share
/// recorders, so `spec.sent_commands()` observes global execution
/// order.
pub struct SimFactory {
    pub spec: SimulatedSpec,
}

impl ConnectorFactory for SimFactory {
    fn kind_for(&self, _agent: &AgentRecord) -> crate::Result<ConnectorKind> {
        Ok(ConnectorKind::Simulated(self.spec.clone()))
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<AgentRegistry>,
    pub queue: Arc<TaskQueue>,
    pub dispatcher: Arc<Dispatcher>,
    pub hub: Arc<ClientSessionHub>,
    pub spec: SimulatedSpec,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Harness {
    pub async fn start() -> Self {
        Self::custom(SimulatedSpec::echo(), |_| {}).await
    }

    pub async fn with_spec(spec: SimulatedSpec) -> Self {
        Self::custom(spec, |_| {}).await
    }

    pub async fn custom(spec: SimulatedSpec, tweak: impl FnOnce(&mut Config)) -> Self {
        let mut config = Config::default();
        config.dispatcher.tick_interval = Duration::from_millis(10);
        config.connector.command_timeout = Duration::from_secs(5);
        // The sweeper never fires unless a test asks for it.
        config.registry.sweep_interval = Duration::from_secs(3600);
        tweak(&mut config);

        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(config.bus.subscriber_outbound_buffer));
        let registry = Arc::new(AgentRegistry::new(
            store.clone() as Arc<dyn StateStore>,
            bus.clone(),
            config.registry.clone(),
            config.connector.max_concurrent,
        ));
        let queue = Arc::new(TaskQueue::new(
            store.clone() as Arc<dyn StateStore>,
            bus.clone(),
            config.queue.max_pending_tasks,
        ));
        let dispatcher = Dispatcher::new(
            store.clone() as Arc<dyn StateStore>,
            registry.clone(),
            queue.clone(),
            bus.clone(),
            Arc::new(SimFactory { spec: spec.clone() }),
            config.dispatcher.clone(),
            config.connector.clone(),
        );
        let hub = Arc::new(ClientSessionHub::new(
            bus.clone(),
            queue.clone(),
            registry.clone(),
            dispatcher.clone(),
        ));

        let handles = dispatcher.start().await.unwrap();

        Self {
            store,
            bus,
            registry,
            queue,
            dispatcher,
            hub,
            spec,
            handles,
        }
    }

    pub async fn register_sim_agent(&self, id: &str, repo: &str) -> AgentRecord {
        self.registry
            .register(id, id, ConnectorType::Simulated, repo)
            .await
            .unwrap()
    }

    pub async fn enqueue(&self, command: &str, repo: &str, priority: Priority) -> String {
        self.queue
            .enqueue(Task::new(command, repo, priority))
            .await
            .unwrap()
    }

    /// Poll until the task reaches `state` or the timeout expires.
    pub async fn wait_for_task(&self, task_id: &str, state: TaskState, timeout: Duration) -> Task {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.store.get_task(task_id).await.unwrap() {
                if task.status == state {
                    return task;
                }
                if tokio::time::Instant::now() >= deadline {
                    panic!(
                        "task {task_id} stuck in {:?} waiting for {state:?} (error: {:?})",
                        task.status, task.error_message
                    );
                }
            } else if tokio::time::Instant::now() >= deadline {
                panic!("task {task_id} never appeared");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_agent(
        &self,
        agent_id: &str,
        state: AgentState,
        timeout: Duration,
    ) -> AgentRecord {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(agent) = self.registry.get(agent_id).await {
                if agent.status == state {
                    return agent;
                }
                if tokio::time::Instant::now() >= deadline {
                    panic!("agent {agent_id} stuck in {} waiting for {state}", agent.status);
                }
            } else if tokio::time::Instant::now() >= deadline {
                panic!("agent {agent_id} never appeared");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until some live agent matches the predicate.
    pub async fn wait_for_agent_where(
        &self,
        predicate: impl Fn(&AgentRecord) -> bool,
        timeout: Duration,
    ) -> AgentRecord {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(agent) = self.registry.list().await.into_iter().find(|a| predicate(a)) {
                return agent;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("no agent matched the predicate in time");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(self) {
        self.dispatcher.shutdown().await;
        for handle in self.handles {
            handle.abort();
        }
    }
}
