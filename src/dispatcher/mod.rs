//! The scheduling loop.
//!
//! A tick runs whenever a task is enqueued, an agent becomes Idle, or a
//! periodic timer fires, debounced to a minimum interval. Each tick
//! matches Idle agents against the queue's atomic claim, hands the
//! resulting assignments to priority worker pools, and auto-provisions
//! agents for repositories nobody serves.

use crate::bus::{agent_group, now, Event, EventBus};
use crate::config::{ConnectorConfig, DispatcherConfig};
use crate::connector::{Connector, ConnectorFactory, SessionInfo, SessionState};
use crate::models::{AgentRecord, Task, TaskState};
use crate::queue::{subscriber_group, TaskQueue};
use crate::registry::AgentRegistry;
use crate::store::{StateStore, TaskUpdate};
use crate::{ForemanError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

mod retry;

#[cfg(test)]
mod tests;

struct Assignment {
    task: Task,
    agent: AgentRecord,
}

pub struct Dispatcher {
    store: Arc<dyn StateStore>,
    registry: Arc<AgentRegistry>,
    queue: Arc<TaskQueue>,
    bus: Arc<EventBus>,
    factory: Arc<dyn ConnectorFactory>,
    config: DispatcherConfig,
    connector_config: ConnectorConfig,
    connectors: Mutex<HashMap<String, Arc<Connector>>>,
    high_tx: mpsc::UnboundedSender<Assignment>,
    default_tx: mpsc::UnboundedSender<Assignment>,
    high_rx: Mutex<Option<mpsc::UnboundedReceiver<Assignment>>>,
    default_rx: Mutex<Option<mpsc::UnboundedReceiver<Assignment>>>,
    shutting_down: AtomicBool,
    stalled: AtomicBool,
    storage_failures: AtomicU32,
    in_flight: Arc<AtomicUsize>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn StateStore>,
        registry: Arc<AgentRegistry>,
        queue: Arc<TaskQueue>,
        bus: Arc<EventBus>,
        factory: Arc<dyn ConnectorFactory>,
        config: DispatcherConfig,
        connector_config: ConnectorConfig,
    ) -> Arc<Self> {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (default_tx, default_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            registry,
            queue,
            bus,
            factory,
            config,
            connector_config,
            connectors: Mutex::new(HashMap::new()),
            high_tx,
            default_tx,
            high_rx: Mutex::new(Some(high_rx)),
            default_rx: Mutex::new(Some(default_rx)),
            shutting_down: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            storage_failures: AtomicU32::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Spawn the tick driver and both worker pools. Also re-enqueues
    /// work that a previous process left mid-flight.
    pub async fn start(self: &Arc<Self>) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        self.recover_interrupted().await?;

        let mut handles = Vec::new();

        let high_rx = self
            .high_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ForemanError::Internal(anyhow::anyhow!("dispatcher already started")))?;
        let default_rx = self
            .default_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| ForemanError::Internal(anyhow::anyhow!("dispatcher already started")))?;

        handles.extend(self.spawn_workers("high", self.config.high_pool_workers, high_rx));
        handles.extend(self.spawn_workers(
            "default",
            self.config.default_pool_workers,
            default_rx,
        ));

        let driver = {
            let dispatcher = self.clone();
            tokio::spawn(async move { dispatcher.run_tick_driver().await })
        };
        handles.push(driver);

        info!(
            high_workers = self.config.high_pool_workers,
            default_workers = self.config.default_pool_workers,
            "Dispatcher started"
        );
        Ok(handles)
    }

    /// At-least-once across restarts: Assigned/InProgress rows from a
    /// dead process are cancelled and re-enqueued as fresh Pending
    /// copies.
    async fn recover_interrupted(&self) -> Result<()> {
        let mut interrupted = self.store.list_tasks_by_status(TaskState::Assigned).await?;
        interrupted.extend(self.store.list_tasks_by_status(TaskState::InProgress).await?);

        for task in interrupted {
            warn!(task_id = %task.id, "Recovering task interrupted by restart");
            let cancelled = self
                .store
                .update_task_status(
                    &task.id,
                    TaskState::Cancelled,
                    TaskUpdate::failed("interrupted by orchestrator restart"),
                )
                .await;
            if let Err(e) = cancelled {
                warn!(task_id = %task.id, "Could not cancel interrupted task: {e}");
                continue;
            }
            let replacement = Task::retry_of(&task);
            self.store.enqueue_task(replacement).await?;
        }
        Ok(())
    }

    async fn run_tick_driver(self: Arc<Self>) {
        let enqueue_signal = self.queue.enqueue_signal();
        let idle_signal = self.registry.idle_signal();
        // Periodic fallback so a missed signal can only delay, never
        // strand, a pending task.
        let fallback = self.config.tick_interval.max(Duration::from_millis(50)) * 20;

        loop {
            tokio::select! {
                _ = enqueue_signal.notified() => {}
                _ = idle_signal.notified() => {}
                _ = tokio::time::sleep(fallback) => {}
            }
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            // Debounce: signals landing in this window coalesce into
            // the single tick that follows.
            tokio::time::sleep(self.config.tick_interval).await;
            self.tick().await;
        }
        debug!("Dispatcher tick driver stopped");
    }

    /// One scheduling pass.
    pub async fn tick(&self) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let idle = self.registry.idle_agents().await;
        for agent in idle {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            match self.queue.claim_for_agent(&agent).await {
                Ok(Some(task)) => {
                    self.storage_recovered();
                    self.dispatch_claim(task, agent).await;
                }
                Ok(None) => {
                    self.storage_recovered();
                }
                Err(e) if e.is_retryable() => {
                    self.storage_stalled(&e).await;
                    return;
                }
                Err(e) => {
                    error!(agent_id = %agent.id, "Claim failed: {e}");
                }
            }
        }

        if let Err(e) = self.provision_for_unserved_repositories().await {
            if e.is_retryable() {
                self.storage_stalled(&e).await;
            } else {
                error!("Auto-provisioning failed: {e}");
            }
        }
    }

    /// A claimed task becomes an assignment: the agent goes Busy and
    /// the pair is handed to the pool matching the task's priority.
    async fn dispatch_claim(&self, task: Task, agent: AgentRecord) {
        match self.registry.mark_busy(&agent.id, &task.id).await {
            Ok(busy_agent) => {
                self.publish_task_event(
                    &task,
                    Event::TaskAssigned {
                        timestamp: now(),
                        task_id: task.id.clone(),
                        agent_id: agent.id.clone(),
                    },
                );
                let assignment = Assignment {
                    task,
                    agent: busy_agent,
                };
                let sent = if assignment.task.priority.is_high_pool() {
                    self.high_tx.send(assignment)
                } else {
                    self.default_tx.send(assignment)
                };
                if sent.is_err() {
                    error!("Worker pool channel closed; dispatcher shutting down?");
                }
            }
            Err(e) => {
                // The agent changed state between the snapshot and the
                // claim (heartbeat or sweeper). The claimed row cannot
                // go back to Pending, so cancel it and re-enqueue a
                // fresh copy.
                warn!(
                    task_id = %task.id,
                    agent_id = %agent.id,
                    "Agent unavailable after claim ({e}); re-enqueueing"
                );
                self.cancel_and_reenqueue(&task, "agent became unavailable after claim")
                    .await;
            }
        }
    }

    async fn cancel_and_reenqueue(&self, task: &Task, reason: &str) {
        let cancelled = self
            .store
            .update_task_status(&task.id, TaskState::Cancelled, TaskUpdate::failed(reason))
            .await;
        match cancelled {
            Ok(_) => {
                let mut replacement = Task::retry_of(task);
                // Not a failed attempt; the copy keeps the original's
                // attempt budget.
                replacement.retry_count = task.retry_count;
                if let Err(e) = self.store.enqueue_task(replacement).await {
                    error!(task_id = %task.id, "Could not re-enqueue after cancel: {e}");
                }
            }
            Err(e) => error!(task_id = %task.id, "Could not cancel claimed task: {e}"),
        }
    }

    /// Pending work for a repository no live agent serves triggers
    /// auto-provisioning; the new Idle agent is picked up next tick.
    async fn provision_for_unserved_repositories(&self) -> Result<()> {
        if !self.registry.auto_provision_enabled() {
            return Ok(());
        }
        let pending = self.queue.snapshot_pending().await?;
        let agents = self.registry.list().await;

        let mut provisioned: HashSet<String> = HashSet::new();
        for task in pending {
            if task.repository_path.is_empty() {
                continue;
            }
            let key = crate::models::normalize_repo_path(&task.repository_path);
            if provisioned.contains(&key) {
                continue;
            }
            let served = agents.iter().any(|a| {
                crate::models::repo_paths_match(&a.repository_path, &task.repository_path)
            });
            if served {
                continue;
            }
            self.registry.provision(&task.repository_path).await?;
            provisioned.insert(key);
        }
        Ok(())
    }

    fn spawn_workers(
        self: &Arc<Self>,
        pool: &'static str,
        count: usize,
        rx: mpsc::UnboundedReceiver<Assignment>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        (0..count.max(1))
            .map(|worker| {
                let dispatcher = self.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let assignment = { rx.lock().await.recv().await };
                        match assignment {
                            Some(assignment) => {
                                debug!(pool, worker, task_id = %assignment.task.id, "Worker picked assignment");
                                dispatcher.execute_assignment(assignment).await;
                            }
                            None => break,
                        }
                    }
                    debug!(pool, worker, "Worker stopped");
                })
            })
            .collect()
    }

    /// Drive one assignment to a terminal state: InProgress, command
    /// execution with output forwarding, then Completed/Failed plus the
    /// retry policy.
    async fn execute_assignment(&self, assignment: Assignment) {
        let Assignment { task, agent } = assignment;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = self.run_task_on_agent(&task, &agent).await;
        if let Err(e) = outcome {
            error!(task_id = %task.id, "Assignment execution error: {e}");
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    async fn run_task_on_agent(&self, task: &Task, agent: &AgentRecord) -> Result<()> {
        let task = self
            .store
            .update_task_status(&task.id, TaskState::InProgress, TaskUpdate::started_now())
            .await?;
        self.publish_task_event(
            &task,
            Event::TaskStarted {
                timestamp: now(),
                task_id: task.id.clone(),
                agent_id: agent.id.clone(),
            },
        );

        let connector = match self.ensure_connected(agent).await {
            Ok(connector) => connector,
            Err(e) => {
                return self.handle_spawn_failure(&task, agent, e).await;
            }
        };

        let handle = connector
            .execute(&task.command, self.connector_config.command_timeout)
            .await;
        let mut handle = match handle {
            Ok(handle) => handle,
            Err(ForemanError::Busy(msg)) => {
                // No free slot after all; put the work back.
                debug!(task_id = %task.id, "Connector busy: {msg}");
                self.cancel_and_reenqueue(&task, "connector busy").await;
                return Ok(());
            }
            Err(e) => {
                return self.fail_task(&task, agent, &e.to_string()).await;
            }
        };

        let group = agent_group(&agent.id);
        while let Some(line) = handle.next_line().await {
            self.bus.publish(
                &group,
                Event::OutputChunk {
                    timestamp: now(),
                    task_id: task.id.clone(),
                    agent_id: agent.id.clone(),
                    line,
                },
            );
        }

        match handle.await_result().await {
            Ok(reply) if !reply.is_error => {
                let done = self
                    .store
                    .update_task_status(
                        &task.id,
                        TaskState::Completed,
                        TaskUpdate::completed(reply.result.clone()),
                    )
                    .await?;
                self.queue.ack(&done.id, TaskState::Completed).await?;
                self.return_agent_to_idle(agent).await;
                info!(task_id = %task.id, agent_id = %agent.id, "Task completed");
                self.publish_task_event(
                    &done,
                    Event::TaskCompleted {
                        timestamp: now(),
                        task_id: done.id.clone(),
                        agent_id: agent.id.clone(),
                        result: reply.result,
                    },
                );
                Ok(())
            }
            Ok(reply) => self.fail_task(&task, agent, &reply.result).await,
            Err(ForemanError::Cancelled(reason)) => {
                let cancelled = self
                    .store
                    .update_task_status(
                        &task.id,
                        TaskState::Cancelled,
                        TaskUpdate::failed(reason.clone()),
                    )
                    .await?;
                self.queue.ack(&cancelled.id, TaskState::Cancelled).await?;
                self.return_agent_to_idle(agent).await;
                info!(task_id = %task.id, "Task cancelled: {reason}");
                Ok(())
            }
            Err(e) => self.fail_task(&task, agent, &e.to_string()).await,
        }
    }

    /// Failure path shared by timeouts, error envelopes, and connector
    /// faults: terminal Failed row, agent back to Idle, TaskFailed on
    /// the bus, then the retry policy.
    async fn fail_task(&self, task: &Task, agent: &AgentRecord, error_message: &str) -> Result<()> {
        let failed = self
            .store
            .update_task_status(
                &task.id,
                TaskState::Failed,
                TaskUpdate::failed(error_message),
            )
            .await?;
        self.queue.ack(&failed.id, TaskState::Failed).await?;
        self.return_agent_to_idle(agent).await;
        warn!(task_id = %task.id, agent_id = %agent.id, "Task failed: {error_message}");
        self.publish_task_event(
            &failed,
            Event::TaskFailed {
                timestamp: now(),
                task_id: failed.id.clone(),
                agent_id: agent.id.clone(),
                error: error_message.to_string(),
            },
        );

        if retry::should_retry(failed.retry_count, self.config.retry_max_attempts) {
            self.schedule_retry(&failed);
        } else if failed.retry_count > 0 {
            info!(task_id = %failed.id, attempts = failed.retry_count + 1, "Retry budget exhausted");
        }
        Ok(())
    }

    /// Spawn failures are their own policy: the agent goes to Error and
    /// the task is re-queued once before failing for good.
    async fn handle_spawn_failure(
        &self,
        task: &Task,
        agent: &AgentRecord,
        error: ForemanError,
    ) -> Result<()> {
        warn!(agent_id = %agent.id, "Connector spawn failed: {error}");
        if let Err(e) = self.registry.mark_error(&agent.id, &error.to_string()).await {
            warn!(agent_id = %agent.id, "Could not mark agent Error: {e}");
        }

        let failed = self
            .store
            .update_task_status(
                &task.id,
                TaskState::Failed,
                TaskUpdate::failed(error.to_string()),
            )
            .await?;
        self.queue.ack(&failed.id, TaskState::Failed).await?;
        self.publish_task_event(
            &failed,
            Event::TaskFailed {
                timestamp: now(),
                task_id: failed.id.clone(),
                agent_id: agent.id.clone(),
                error: error.to_string(),
            },
        );

        if failed.retry_count == 0 {
            let replacement = Task::retry_of(&failed);
            if let Err(e) = self.store.enqueue_task(replacement).await {
                error!(task_id = %failed.id, "Could not re-queue after spawn failure: {e}");
            } else {
                self.queue.enqueue_signal().notify_one();
            }
        }
        Ok(())
    }

    fn schedule_retry(&self, failed: &Task) {
        let backoff = retry::backoff_for(
            self.config.retry_base_backoff,
            failed.priority,
            failed.retry_count,
        );
        let replacement = Task::retry_of(failed);
        let store = self.store.clone();
        let signal = self.queue.enqueue_signal();
        let task_id = failed.id.clone();
        info!(task_id = %task_id, backoff_ms = backoff.as_millis() as u64, "Scheduling retry");
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            match store.enqueue_task(replacement).await {
                Ok(()) => signal.notify_one(),
                Err(e) => error!(task_id = %task_id, "Retry enqueue failed: {e}"),
            }
        });
    }

    async fn return_agent_to_idle(&self, agent: &AgentRecord) {
        if let Err(e) = self.registry.mark_idle(&agent.id).await {
            // Heartbeats or the sweeper may have moved the agent
            // elsewhere; that state wins.
            debug!(agent_id = %agent.id, "Agent not returned to Idle: {e}");
        }
    }

    /// Get or lazily create the agent's connector, connecting it if the
    /// session is down. A session left in Error is torn down first.
    async fn ensure_connected(&self, agent: &AgentRecord) -> Result<Arc<Connector>> {
        let connector = {
            let mut connectors = self.connectors.lock().await;
            match connectors.get(&agent.id) {
                Some(connector) => connector.clone(),
                None => {
                    let kind = self.factory.kind_for(agent)?;
                    let connector = Arc::new(Connector::new(
                        agent.id.clone(),
                        kind,
                        self.bus.clone(),
                        self.connector_config.disconnect_grace,
                    ));
                    connectors.insert(agent.id.clone(), connector.clone());
                    connector
                }
            }
        };

        connector.reset_if_errored().await;
        if connector.state().await != SessionState::Connected {
            connector.connect(&agent.repository_path).await?;
        }
        Ok(connector)
    }

    /// Out-of-band control frame for a specific agent's live session.
    pub async fn intervene(&self, agent_id: &str, payload: serde_json::Value) -> Result<()> {
        let connector = {
            let connectors = self.connectors.lock().await;
            connectors.get(agent_id).cloned()
        };
        match connector {
            Some(connector) => connector.send_intervention(payload).await,
            None => Err(ForemanError::NotFound(format!(
                "no live connector for agent {agent_id}"
            ))),
        }
    }

    /// Drain: stop intake, let in-flight work finish within the grace
    /// window, then force-disconnect every connector.
    pub async fn shutdown(&self) {
        info!("Dispatcher shutting down");
        self.shutting_down.store(true, Ordering::SeqCst);
        self.queue.stop_accepting();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining = self.in_flight.load(Ordering::SeqCst),
                    "Shutdown grace expired with tasks still in flight"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let connectors: Vec<Arc<Connector>> = {
            let connectors = self.connectors.lock().await;
            connectors.values().cloned().collect()
        };
        for connector in connectors {
            connector.disconnect().await;
        }
        info!("Dispatcher shutdown complete");
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn session_infos(&self) -> Vec<SessionInfo> {
        let connectors = self.connectors.lock().await;
        connectors
            .values()
            .filter_map(|c| c.session_info())
            .collect()
    }

    fn publish_task_event(&self, task: &Task, event: Event) {
        if let Some(agent_id) = &task.assigned_agent_id {
            self.bus.publish(&agent_group(agent_id), event.clone());
        }
        // Route a copy to whoever submitted the task, unless they are
        // already watching the agent group.
        if let Some(origin) = task.origin_subscriber_id {
            let already_member = task
                .assigned_agent_id
                .as_ref()
                .is_some_and(|agent_id| self.bus.is_member(origin, &agent_group(agent_id)));
            if !already_member {
                self.bus.publish(&subscriber_group(origin), event);
            }
        }
    }

    async fn storage_stalled(&self, error: &ForemanError) {
        let failures = self.storage_failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.stalled.store(true, Ordering::SeqCst);
        let backoff = Duration::from_millis(100) * 2u32.saturating_pow(failures.min(8));
        error!(failures, "Storage unavailable, dispatcher backing off {backoff:?}: {error}");
        tokio::time::sleep(backoff).await;
    }

    fn storage_recovered(&self) {
        if self.stalled.swap(false, Ordering::SeqCst) {
            info!("Storage recovered, dispatcher resuming");
        }
        self.storage_failures.store(0, Ordering::SeqCst);
    }
}
