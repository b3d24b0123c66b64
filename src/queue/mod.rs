//! Prioritized, persistent task queue with reservation semantics.
//!
//! The queue itself is thin: ordering and claim atomicity live in the
//! StateStore, and this wrapper adds validation, backpressure, the
//! dispatcher wake-up signal, and enqueue events.

use crate::bus::{now, Event, EventBus};
use crate::models::{AgentRecord, Task, TaskState};
use crate::store::StateStore;
use crate::validation::InputValidator;
use crate::{ForemanError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Group carrying queue-level events (enqueues) for operators and
/// origin subscribers.
pub const TASKS_GROUP: &str = "tasks";

/// Private per-subscriber group used to route a task's terminal events
/// back to whoever submitted it.
pub fn subscriber_group(subscriber_id: uuid::Uuid) -> String {
    format!("subscriber_{subscriber_id}")
}

pub struct TaskQueue {
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    validator: InputValidator,
    max_pending: usize,
    enqueue_signal: Arc<Notify>,
    accepting: AtomicBool,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn StateStore>, bus: Arc<EventBus>, max_pending: usize) -> Self {
        Self {
            store,
            bus,
            validator: InputValidator::new(),
            max_pending,
            enqueue_signal: Arc::new(Notify::new()),
            accepting: AtomicBool::new(true),
        }
    }

    /// Signalled on every successful enqueue; the dispatcher's tick
    /// driver listens on this.
    pub fn enqueue_signal(&self) -> Arc<Notify> {
        self.enqueue_signal.clone()
    }

    /// Shutdown hook: reject new work while in-flight tasks drain.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        info!("Task queue stopped accepting new work");
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Validate, apply backpressure, persist as Pending, wake the
    /// dispatcher. Returns the task id.
    pub async fn enqueue(&self, task: Task) -> Result<String> {
        if !self.is_accepting() {
            return Err(ForemanError::Cancelled(
                "queue is draining for shutdown".to_string(),
            ));
        }
        self.validator.validate_task_command(&task.command)?;

        let pending = self.store.count_pending().await?;
        if pending >= self.max_pending {
            debug!(pending, max = self.max_pending, "Enqueue rejected: queue full");
            return Err(ForemanError::QueueFull);
        }

        let task_id = task.id.clone();
        let event = Event::TaskEnqueued {
            timestamp: now(),
            task_id: task_id.clone(),
            repository_path: task.repository_path.clone(),
            priority: task.priority,
        };
        let origin = task.origin_subscriber_id;

        self.store.enqueue_task(task).await?;
        info!(task_id = %task_id, "Task enqueued (position {})", pending + 1);

        self.bus.publish(TASKS_GROUP, event.clone());
        if let Some(subscriber_id) = origin {
            self.bus.publish(&subscriber_group(subscriber_id), event);
        }
        self.enqueue_signal.notify_one();
        Ok(task_id)
    }

    /// Atomic select-and-reserve for one agent. The store guarantees no
    /// two agents ever receive the same task; tasks with an empty
    /// repository path match any agent.
    pub async fn claim_for_agent(&self, agent: &AgentRecord) -> Result<Option<Task>> {
        let claimed = self.store.claim_next_task(agent).await?;
        if let Some(task) = &claimed {
            debug!(task_id = %task.id, agent_id = %agent.id, "Task claimed");
        }
        Ok(claimed)
    }

    /// Terminal bookkeeping for a finished reservation. The row is
    /// already terminal in the store; this drops it from the active
    /// scan path and leaves it for history queries.
    pub async fn ack(&self, task_id: &str, outcome: TaskState) -> Result<()> {
        debug_assert!(outcome.is_terminal());
        debug!(task_id, outcome = %outcome, "Task acknowledged");
        Ok(())
    }

    pub async fn pending_count(&self) -> Result<usize> {
        Ok(self.store.count_pending().await?)
    }

    pub async fn snapshot_pending(&self) -> Result<Vec<Task>> {
        Ok(self.store.list_tasks_by_status(TaskState::Pending).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectorType, Priority};
    use crate::store::MemoryStore;

    fn queue_with_capacity(max_pending: usize) -> TaskQueue {
        let store = Arc::new(MemoryStore::new());
        let bus = Arc::new(EventBus::new(16));
        TaskQueue::new(store, bus, max_pending)
    }

    #[tokio::test]
    async fn enqueue_persists_and_signals() {
        let queue = queue_with_capacity(10);
        let signal = queue.enqueue_signal();

        let id = queue
            .enqueue(Task::new("echo hi", "/r1", Priority::Normal))
            .await
            .unwrap();
        assert!(!id.is_empty());
        assert_eq!(queue.pending_count().await.unwrap(), 1);

        // The permit from enqueue is already stored.
        tokio::time::timeout(std::time::Duration::from_millis(100), signal.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backpressure_rejects_with_queue_full() {
        let queue = queue_with_capacity(2);
        for i in 0..2 {
            queue
                .enqueue(Task::new(format!("cmd {i}"), "/r1", Priority::Normal))
                .await
                .unwrap();
        }

        let err = queue
            .enqueue(Task::new("overflow", "/r1", Priority::Normal))
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::QueueFull));
    }

    #[tokio::test]
    async fn oversized_command_is_invalid_input() {
        let queue = queue_with_capacity(10);
        let err = queue
            .enqueue(Task::new("x".repeat(5001), "/r1", Priority::Normal))
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn draining_queue_rejects_new_work() {
        let queue = queue_with_capacity(10);
        queue.stop_accepting();

        let err = queue
            .enqueue(Task::new("late", "/r1", Priority::Normal))
            .await
            .unwrap_err();
        assert!(matches!(err, ForemanError::Cancelled(_)));
    }

    #[tokio::test]
    async fn empty_queue_claim_returns_nothing() {
        let queue = queue_with_capacity(10);
        let agent = AgentRecord::new("a1", "one", ConnectorType::Simulated, "/r1");
        assert!(queue.claim_for_agent(&agent).await.unwrap().is_none());
    }
}
