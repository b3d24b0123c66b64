//! End-to-end lifecycle scenarios over the full dispatch stack with
//! simulated connectors.

use super::test_helpers::Harness;
use crate::bus::Event;
use crate::connector::{SimulatedOutcome, SimulatedSpec};
use crate::models::{AgentState, Priority, TaskState};
use crate::store::StateStore;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn registered_agent_runs_a_task_to_completion() {
    let harness = Harness::start().await;
    harness.register_sim_agent("a1", "/r1").await;

    let task_id = harness.enqueue("echo hi", "/r1", Priority::Normal).await;
    let done = harness
        .wait_for_task(&task_id, TaskState::Completed, WAIT)
        .await;

    assert!(done.result.as_deref().unwrap_or("").contains("hi"));
    assert_eq!(done.assigned_agent_id.as_deref(), Some("a1"));
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    assert!(done.created_at <= done.started_at.unwrap());
    assert!(done.started_at.unwrap() <= done.completed_at.unwrap());

    harness.wait_for_agent("a1", AgentState::Idle, WAIT).await;
    harness.shutdown().await;
}

#[tokio::test]
async fn repository_affinity_picks_the_matching_agent() {
    let harness = Harness::start().await;
    harness.register_sim_agent("a1", "/r1").await;
    harness.register_sim_agent("a2", "/r2").await;

    let task_id = harness.enqueue("list files", "/r2", Priority::Normal).await;
    let done = harness
        .wait_for_task(&task_id, TaskState::Completed, WAIT)
        .await;

    assert_eq!(done.assigned_agent_id.as_deref(), Some("a2"));
    harness.shutdown().await;
}

#[tokio::test]
async fn priorities_execute_critical_then_normal_then_low() {
    let harness = Harness::custom(SimulatedSpec::echo(), |config| {
        // A wider debounce window so all three tasks land before the
        // first claim.
        config.dispatcher.tick_interval = Duration::from_millis(50);
    })
    .await;
    harness.register_sim_agent("a1", "/r1").await;

    let low = harness.enqueue("task low", "/r1", Priority::Low).await;
    let critical = harness
        .enqueue("task critical", "/r1", Priority::Critical)
        .await;
    let normal = harness.enqueue("task normal", "/r1", Priority::Normal).await;

    for id in [&low, &critical, &normal] {
        harness.wait_for_task(id, TaskState::Completed, WAIT).await;
    }

    assert_eq!(
        harness.spec.sent_commands(),
        vec!["task critical", "task normal", "task low"]
    );
    harness.shutdown().await;
}

#[tokio::test]
async fn silent_connector_times_out_and_frees_the_agent() {
    let harness = Harness::custom(SimulatedSpec::never_replies(), |config| {
        config.connector.command_timeout = Duration::from_millis(150);
        config.dispatcher.retry_max_attempts = 1;
    })
    .await;
    harness.register_sim_agent("a1", "/r1").await;

    let task_id = harness.enqueue("hang forever", "/r1", Priority::Normal).await;
    let failed = harness.wait_for_task(&task_id, TaskState::Failed, WAIT).await;

    let error = failed.error_message.unwrap_or_default().to_lowercase();
    assert!(error.contains("timeout"), "error was: {error}");

    harness.wait_for_agent("a1", AgentState::Idle, WAIT).await;
    harness.shutdown().await;
}

#[tokio::test]
async fn unserved_repository_provisions_an_agent_automatically() {
    let harness = Harness::start().await;

    let task_id = harness.enqueue("echo hi", "/r3", Priority::Normal).await;

    let provisioned = harness
        .wait_for_agent_where(|a| a.is_provisioned(), WAIT)
        .await;
    assert_eq!(provisioned.repository_path, "/r3");

    let done = harness
        .wait_for_task(&task_id, TaskState::Completed, WAIT)
        .await;
    assert_eq!(done.assigned_agent_id.as_deref(), Some(provisioned.id.as_str()));
    harness.shutdown().await;
}

#[tokio::test]
async fn subscriber_sees_started_chunks_in_order_then_completed() {
    let spec = SimulatedSpec::new(
        vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()],
        SimulatedOutcome::Success("did the thing".to_string()),
    );
    let harness = Harness::with_spec(spec).await;
    harness.register_sim_agent("a1", "/r1").await;

    let subscriber = harness.hub.on_connect("test-client");
    harness.hub.join_agent(subscriber, "a1").unwrap();

    let request_id = harness
        .hub
        .send_command_to_agent(subscriber, "a1", "do the thing")
        .await
        .unwrap();

    // Collect frames until the terminal event for this task.
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let frame = tokio::time::timeout_at(deadline, harness.hub.next_frame(subscriber))
            .await
            .expect("frame stream stalled")
            .expect("frame stream closed");
        let terminal = matches!(&frame, Event::TaskCompleted { task_id, .. } if *task_id == request_id);
        seen.push(frame);
        if terminal {
            break;
        }
    }

    let positions: Vec<usize> = seen
        .iter()
        .enumerate()
        .filter_map(|(index, event)| match event {
            Event::TaskStarted { task_id, .. } if *task_id == request_id => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(positions.len(), 1, "exactly one TaskStarted");
    let started_at = positions[0];

    let chunks: Vec<(usize, String)> = seen
        .iter()
        .enumerate()
        .filter_map(|(index, event)| match event {
            Event::OutputChunk { task_id, line, .. } if *task_id == request_id => {
                Some((index, line.clone()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        chunks.iter().map(|(_, line)| line.as_str()).collect::<Vec<_>>(),
        vec!["alpha", "beta", "gamma"]
    );
    assert!(chunks.iter().all(|(index, _)| *index > started_at));

    let completed: Vec<usize> = seen
        .iter()
        .enumerate()
        .filter_map(|(index, event)| match event {
            Event::TaskCompleted { task_id, .. } if *task_id == request_id => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(completed.len(), 1, "exactly one TaskCompleted, no duplicates");
    assert!(completed[0] > chunks.last().unwrap().0);

    harness.hub.on_disconnect(subscriber);
    harness.shutdown().await;
}

#[tokio::test]
async fn failed_task_is_retried_as_a_new_row() {
    let harness = Harness::custom(SimulatedSpec::failing("tool exploded"), |config| {
        config.dispatcher.retry_max_attempts = 2;
        config.dispatcher.retry_base_backoff = Duration::from_millis(20);
    })
    .await;
    harness.register_sim_agent("a1", "/r1").await;

    let task_id = harness.enqueue("doomed", "/r1", Priority::Normal).await;
    harness.wait_for_task(&task_id, TaskState::Failed, WAIT).await;

    // The retry lands as a fresh row referencing the original and
    // fails too, exhausting the budget of 2 attempts.
    let deadline = tokio::time::Instant::now() + WAIT;
    let retry = loop {
        let failed = harness
            .store
            .list_tasks_by_status(TaskState::Failed)
            .await
            .unwrap();
        if let Some(retry) = failed.iter().find(|t| t.retry_of.as_deref() == Some(task_id.as_str()))
        {
            break retry.clone();
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("retry row never appeared/failed");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(retry.retry_count, 1);
    assert_ne!(retry.id, task_id);

    // Budget exhausted: no third row.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let all_failed = harness
        .store
        .list_tasks_by_status(TaskState::Failed)
        .await
        .unwrap();
    assert_eq!(all_failed.len(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn empty_repository_task_is_claimed_by_any_agent() {
    let harness = Harness::start().await;
    harness.register_sim_agent("a1", "/r1").await;

    let task_id = harness.enqueue("anywhere is fine", "", Priority::Normal).await;
    let done = harness
        .wait_for_task(&task_id, TaskState::Completed, WAIT)
        .await;
    assert_eq!(done.assigned_agent_id.as_deref(), Some("a1"));
    harness.shutdown().await;
}

#[tokio::test]
async fn intervention_reaches_the_live_connector() {
    let spec = SimulatedSpec::never_replies();
    let probe = spec.clone();
    let harness = Harness::custom(spec, |config| {
        config.connector.command_timeout = Duration::from_secs(30);
        config.dispatcher.retry_max_attempts = 1;
        // Shutdown must not wait out the deliberately hung command.
        config.dispatcher.shutdown_grace = Duration::from_millis(100);
    })
    .await;
    harness.register_sim_agent("a1", "/r1").await;

    let subscriber = harness.hub.on_connect("operator");
    let task_id = harness.enqueue("long running", "/r1", Priority::Normal).await;
    harness
        .wait_for_task(&task_id, TaskState::InProgress, WAIT)
        .await;

    harness
        .hub
        .send_intervention_response(
            subscriber,
            "a1",
            serde_json::json!({"approve": true}),
        )
        .await
        .unwrap();

    assert_eq!(probe.interventions().len(), 1);
    harness.shutdown().await;
}
