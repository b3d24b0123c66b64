use super::*;
use crate::bus::Event;
use crate::config::Config;
use crate::store::MemoryStore;
use std::time::Duration;
use uuid::Uuid;

fn test_registry() -> (Arc<AgentRegistry>, Arc<EventBus>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(64));
    let config = Config::default().registry;
    let registry = Arc::new(AgentRegistry::new(store.clone(), bus.clone(), config, 1));
    (registry, bus, store)
}

fn short_timeout_registry(timeout: Duration) -> (Arc<AgentRegistry>, Arc<EventBus>) {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(64));
    let mut config = Config::default().registry;
    config.heartbeat_timeout = timeout;
    let registry = Arc::new(AgentRegistry::new(store, bus.clone(), config, 1));
    (registry, bus)
}

#[tokio::test]
async fn register_is_idempotent_and_emits_once() {
    let (registry, bus, _) = test_registry();
    let observer = Uuid::new_v4();
    bus.register_subscriber(observer);

    let first = registry
        .register("a1", "builder", ConnectorType::Simulated, "/r1")
        .await
        .unwrap();
    let second = registry
        .register("a1", "builder", ConnectorType::Simulated, "/r1")
        .await
        .unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.status, AgentState::Idle);
    assert_eq!(registry.list().await.len(), 1);

    // Exactly one AgentRegistered was broadcast.
    let event = bus.next_event(observer).await.unwrap();
    assert!(matches!(event, Event::AgentRegistered { ref agent_id, .. } if agent_id == "a1"));
    bus.unregister_subscriber(observer);
    assert_eq!(bus.next_event(observer).await, None);
}

#[tokio::test]
async fn register_restores_a_soft_deleted_agent() {
    let (registry, _, store) = test_registry();

    registry
        .register("a1", "builder", ConnectorType::Simulated, "/r1")
        .await
        .unwrap();
    registry.soft_delete("a1").await.unwrap();
    assert!(registry.get("a1").await.is_none());

    let restored = registry
        .register("a1", "builder", ConnectorType::Simulated, "/r2")
        .await
        .unwrap();
    assert!(!restored.soft_deleted);
    assert_eq!(restored.repository_path, "/r2");
    assert_eq!(restored.status, AgentState::Idle);

    let persisted = store.get_agent("a1").await.unwrap().unwrap();
    assert!(!persisted.soft_deleted);
}

#[tokio::test]
async fn reregistering_an_offline_agent_publishes_the_recovery() {
    let (registry, bus, _) = test_registry();
    registry
        .register("a1", "builder", ConnectorType::Simulated, "/r1")
        .await
        .unwrap();
    registry.mark_offline("a1").await.unwrap();

    let observer = Uuid::new_v4();
    bus.register_subscriber(observer);
    bus.join_group(observer, &crate::bus::agent_group("a1"));

    let record = registry
        .register("a1", "builder", ConnectorType::Simulated, "/r1")
        .await
        .unwrap();
    assert_eq!(record.status, AgentState::Idle);

    // The live agent is not re-announced, but its Offline -> Idle
    // recovery reaches group subscribers.
    match bus.next_event(observer).await.unwrap() {
        Event::AgentStatusChanged {
            agent_id,
            from,
            to,
            ..
        } => {
            assert_eq!(agent_id, "a1");
            assert_eq!(from, AgentState::Offline);
            assert_eq!(to, AgentState::Idle);
        }
        other => panic!("expected AgentStatusChanged, got {other:?}"),
    }
    bus.unregister_subscriber(observer);
    assert_eq!(bus.next_event(observer).await, None);
}

#[tokio::test]
async fn registration_creates_the_repository_row() {
    let (registry, _, store) = test_registry();
    registry
        .register("a1", "builder", ConnectorType::Simulated, "/r1")
        .await
        .unwrap();

    let repos = store.list_repositories().await.unwrap();
    assert_eq!(repos.len(), 1);
    assert_eq!(repos[0].path, "/r1");
    assert!(repos[0].active);
}

#[tokio::test]
async fn heartbeat_rejects_illegal_transition_without_mutating() {
    let (registry, _, _) = test_registry();
    registry
        .register("a1", "builder", ConnectorType::Simulated, "/r1")
        .await
        .unwrap();
    registry.mark_busy("a1", "t1").await.unwrap();
    registry.mark_offline("a1").await.unwrap();

    // Offline -> Busy is not in the graph.
    let err = registry
        .heartbeat("a1", AgentState::Busy, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ForemanError::InvalidTransition(_)));

    let agent = registry.get("a1").await.unwrap();
    assert_eq!(agent.status, AgentState::Offline);
}

#[tokio::test]
async fn heartbeat_with_same_status_refreshes_timestamp() {
    let (registry, _, _) = test_registry();
    let before = registry
        .register("a1", "builder", ConnectorType::Simulated, "/r1")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let after = registry
        .heartbeat("a1", AgentState::Idle, None)
        .await
        .unwrap();
    assert!(after.last_heartbeat > before.last_heartbeat);
}

#[tokio::test]
async fn find_available_prefers_repository_match_then_oldest_heartbeat() {
    let (registry, _, _) = test_registry();
    registry
        .register("a1", "one", ConnectorType::Simulated, "/r1")
        .await
        .unwrap();
    registry
        .register("a2", "two", ConnectorType::Simulated, "/r2")
        .await
        .unwrap();

    let chosen = registry.find_available_for_repository("/r2").await.unwrap();
    assert_eq!(chosen.id, "a2");

    // No match for /r9: any attached agent is acceptable; a1 has the
    // oldest heartbeat.
    let fallback = registry.find_available_for_repository("/r9").await.unwrap();
    assert_eq!(fallback.id, "a1");
}

#[tokio::test]
async fn busy_agents_are_not_available_by_default() {
    let (registry, _, _) = test_registry();
    registry
        .register("a1", "one", ConnectorType::Simulated, "/r1")
        .await
        .unwrap();
    registry.mark_busy("a1", "t1").await.unwrap();

    assert!(registry.find_available_for_repository("/r1").await.is_none());
}

#[tokio::test]
async fn busy_agents_are_available_when_concurrency_allows() {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(64));
    let registry = AgentRegistry::new(store, bus, Config::default().registry, 2);

    registry
        .register("a1", "one", ConnectorType::Simulated, "/r1")
        .await
        .unwrap();
    registry.mark_busy("a1", "t1").await.unwrap();

    let chosen = registry.find_available_for_repository("/r1").await.unwrap();
    assert_eq!(chosen.id, "a1");
}

#[tokio::test]
async fn provision_creates_prefixed_idle_agent() {
    let (registry, _, store) = test_registry();
    let agent = registry.provision("/r3").await.unwrap();

    assert!(agent.is_provisioned());
    assert_eq!(agent.repository_path, "/r3");
    assert_eq!(agent.status, AgentState::Idle);
    assert!(store.get_agent(&agent.id).await.unwrap().is_some());
}

#[tokio::test]
async fn stale_idle_agent_flips_offline_at_sweep() {
    let (registry, bus) = short_timeout_registry(Duration::from_millis(50));
    let observer = Uuid::new_v4();
    bus.register_subscriber(observer);

    registry
        .register("a1", "one", ConnectorType::Simulated, "/r1")
        .await
        .unwrap();

    // Not yet stale.
    assert!(registry.sweep_stale_heartbeats().await.is_empty());

    tokio::time::sleep(Duration::from_millis(80)).await;
    let marked = registry.sweep_stale_heartbeats().await;
    assert_eq!(marked, vec!["a1".to_string()]);
    assert_eq!(registry.get("a1").await.unwrap().status, AgentState::Offline);

    // Second sweep is a no-op; already Offline.
    assert!(registry.sweep_stale_heartbeats().await.is_empty());
}

#[tokio::test]
async fn idle_agents_are_ordered_by_oldest_heartbeat() {
    let (registry, _, _) = test_registry();
    registry
        .register("a1", "one", ConnectorType::Simulated, "/r1")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    registry
        .register("a2", "two", ConnectorType::Simulated, "/r1")
        .await
        .unwrap();
    // a2 heartbeats again, so a1 is the stalest.
    tokio::time::sleep(Duration::from_millis(5)).await;
    registry
        .heartbeat("a2", AgentState::Idle, None)
        .await
        .unwrap();

    let idle = registry.idle_agents().await;
    assert_eq!(idle.len(), 2);
    assert_eq!(idle[0].id, "a1");
}

#[tokio::test]
async fn hydrate_restores_agents_from_the_store() {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::new(64));
    store
        .upsert_agent(AgentRecord::new(
            "a1",
            "one",
            ConnectorType::Simulated,
            "/r1",
        ))
        .await
        .unwrap();

    let registry = AgentRegistry::new(store, bus, Config::default().registry, 1);
    registry.hydrate().await.unwrap();
    assert_eq!(registry.list().await.len(), 1);
    assert!(registry.get("a1").await.is_some());
}

#[tokio::test]
async fn busy_agent_tracks_its_current_task() {
    let (registry, _, _) = test_registry();
    registry
        .register("a1", "one", ConnectorType::Simulated, "/r1")
        .await
        .unwrap();

    let busy = registry.mark_busy("a1", "task-9").await.unwrap();
    assert_eq!(busy.current_task_id.as_deref(), Some("task-9"));
    assert_eq!(busy.status, AgentState::Busy);

    let idle = registry.mark_idle("a1").await.unwrap();
    assert!(idle.current_task_id.is_none());
}
