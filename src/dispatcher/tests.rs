use super::*;
use crate::bus::EventBus;
use crate::config::Config;
use crate::connector::{ConnectorKind, SimulatedSpec, SubprocessSpec};
use crate::models::{AgentState, ConnectorType, Priority};
use crate::store::MemoryStore;
use crate::tests::test_helpers::{Harness, SimFactory};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// Factory whose subprocess spec points at a binary that cannot exist,
/// so every connect is a spawn failure.
struct BrokenSpawnFactory;

impl ConnectorFactory for BrokenSpawnFactory {
    fn kind_for(&self, _agent: &AgentRecord) -> Result<ConnectorKind> {
        Ok(ConnectorKind::Subprocess(SubprocessSpec {
            program: "/nonexistent/never-a-binary".to_string(),
            args: vec![],
        }))
    }
}

fn quick_config() -> Config {
    let mut config = Config::default();
    config.dispatcher.tick_interval = Duration::from_millis(10);
    config.registry.sweep_interval = Duration::from_secs(3600);
    config
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached in time");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn startup_recovers_tasks_left_mid_flight() {
    let config = quick_config();
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(64));
    let registry = Arc::new(AgentRegistry::new(
        store.clone() as Arc<dyn StateStore>,
        bus.clone(),
        config.registry.clone(),
        1,
    ));
    let queue = Arc::new(TaskQueue::new(
        store.clone() as Arc<dyn StateStore>,
        bus.clone(),
        100,
    ));

    // Simulate a previous process dying mid-execution.
    let agent = AgentRecord::new("a1", "one", ConnectorType::Simulated, "/r1");
    let task = Task::new("interrupted work", "/r1", Priority::Normal);
    store.enqueue_task(task.clone()).await.unwrap();
    store.claim_next_task(&agent).await.unwrap().unwrap();
    store
        .update_task_status(&task.id, TaskState::InProgress, TaskUpdate::started_now())
        .await
        .unwrap();

    let dispatcher = Dispatcher::new(
        store.clone() as Arc<dyn StateStore>,
        registry,
        queue,
        bus,
        Arc::new(SimFactory {
            spec: SimulatedSpec::echo(),
        }),
        config.dispatcher.clone(),
        config.connector.clone(),
    );
    let handles = dispatcher.start().await.unwrap();

    let original = store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(original.status, TaskState::Cancelled);

    let pending = store.list_tasks_by_status(TaskState::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_of.as_deref(), Some(task.id.as_str()));
    assert_eq!(pending[0].command, "interrupted work");

    dispatcher.shutdown().await;
    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn spawn_failure_errors_the_agent_and_requeues_once() {
    let config = quick_config();
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(64));
    let registry = Arc::new(AgentRegistry::new(
        store.clone() as Arc<dyn StateStore>,
        bus.clone(),
        config.registry.clone(),
        1,
    ));
    let queue = Arc::new(TaskQueue::new(
        store.clone() as Arc<dyn StateStore>,
        bus.clone(),
        100,
    ));
    let dispatcher = Dispatcher::new(
        store.clone() as Arc<dyn StateStore>,
        registry.clone(),
        queue.clone(),
        bus,
        Arc::new(BrokenSpawnFactory),
        config.dispatcher.clone(),
        config.connector.clone(),
    );
    let handles = dispatcher.start().await.unwrap();

    registry
        .register("a1", "one", ConnectorType::ClaudeCode, "/r1")
        .await
        .unwrap();
    let task_id = queue
        .enqueue(Task::new("build it", "/r1", Priority::Normal))
        .await
        .unwrap();

    // First attempt fails to spawn: task Failed, agent Error, and one
    // replacement row queued.
    wait_until(|| {
        let store = store.clone();
        let task_id = task_id.clone();
        async move {
            store
                .get_task(&task_id)
                .await
                .unwrap()
                .is_some_and(|t| t.status == TaskState::Failed)
        }
    })
    .await;

    let agent = registry.get("a1").await.unwrap();
    assert_eq!(agent.status, AgentState::Error);

    let pending = store.list_tasks_by_status(TaskState::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].retry_of.as_deref(), Some(task_id.as_str()));
    assert_eq!(pending[0].retry_count, 1);

    // The errored agent takes no further work, so the replacement stays
    // Pending rather than being lost.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let pending = store.list_tasks_by_status(TaskState::Pending).await.unwrap();
    assert_eq!(pending.len(), 1);

    dispatcher.shutdown().await;
    for handle in handles {
        handle.abort();
    }
}

#[tokio::test]
async fn shutdown_drains_in_flight_work_before_disconnecting() {
    let spec = SimulatedSpec::new(
        vec!["chunk 1".to_string(), "chunk 2".to_string(), "chunk 3".to_string()],
        crate::connector::SimulatedOutcome::Success("done".to_string()),
    )
    .with_line_delay(Duration::from_millis(50));

    let harness = Harness::with_spec(spec).await;
    harness.register_sim_agent("a1", "/r1").await;

    let task_id = harness.enqueue("slow job", "/r1", Priority::Normal).await;
    harness
        .wait_for_task(&task_id, TaskState::InProgress, WAIT)
        .await;

    // Drain completes the running task instead of cancelling it.
    harness.dispatcher.shutdown().await;
    let done = harness.store.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskState::Completed);

    // And the queue refuses new work once draining.
    let err = harness
        .queue
        .enqueue(Task::new("late", "/r1", Priority::Normal))
        .await
        .unwrap_err();
    assert!(matches!(err, ForemanError::Cancelled(_)));
}

#[tokio::test]
async fn one_agent_is_provisioned_per_unserved_repository() {
    let harness = Harness::start().await;

    let first = harness.enqueue("task one", "/fresh-repo", Priority::Normal).await;
    let second = harness.enqueue("task two", "/fresh-repo", Priority::Normal).await;

    harness
        .wait_for_task(&first, TaskState::Completed, WAIT)
        .await;
    harness
        .wait_for_task(&second, TaskState::Completed, WAIT)
        .await;

    let provisioned: Vec<AgentRecord> = harness
        .registry
        .list()
        .await
        .into_iter()
        .filter(|a| a.is_provisioned())
        .collect();
    assert_eq!(provisioned.len(), 1, "exactly one agent for the repository");

    harness.shutdown().await;
}

#[tokio::test]
async fn high_priority_work_flows_through_the_dedicated_pool() {
    let harness = Harness::start().await;
    harness.register_sim_agent("a1", "/r1").await;

    let critical = harness.enqueue("urgent", "/r1", Priority::Critical).await;
    let done = harness
        .wait_for_task(&critical, TaskState::Completed, WAIT)
        .await;
    assert_eq!(done.priority, Priority::Critical);
    assert!(done.priority.is_high_pool());

    harness.shutdown().await;
}
