//! Single source of truth for agent presence and health.
//!
//! The in-memory map is authoritative and guarded by one mutex with
//! CPU-bounded critical sections; the StateStore is the durable mirror,
//! written after the lock is released and rolled back in memory if the
//! write fails.

use crate::bus::{agent_group, now, Event, EventBus};
use crate::config::RegistryConfig;
use crate::models::{AgentRecord, AgentState, ConnectorType, Repository};
use crate::store::StateStore;
use crate::{ForemanError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

pub struct AgentRegistry {
    agents: Mutex<HashMap<String, AgentRecord>>,
    store: Arc<dyn StateStore>,
    bus: Arc<EventBus>,
    config: RegistryConfig,
    /// Connector command concurrency; Busy agents become claimable only
    /// when this exceeds 1.
    max_concurrent: usize,
    /// Signalled whenever an agent becomes Idle; the dispatcher's tick
    /// driver listens on this.
    idle_signal: Arc<Notify>,
}

impl AgentRegistry {
    pub fn new(
        store: Arc<dyn StateStore>,
        bus: Arc<EventBus>,
        config: RegistryConfig,
        max_concurrent: usize,
    ) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            store,
            bus,
            config,
            max_concurrent: max_concurrent.max(1),
            idle_signal: Arc::new(Notify::new()),
        }
    }

    pub fn idle_signal(&self) -> Arc<Notify> {
        self.idle_signal.clone()
    }

    /// Load the durable agent set into memory. Called once on startup,
    /// before the dispatcher starts ticking.
    pub async fn hydrate(&self) -> Result<()> {
        let stored = self.store.list_agents(true).await?;
        let mut agents = self.agents.lock().await;
        for agent in stored {
            agents.insert(agent.id.clone(), agent);
        }
        info!("Hydrated {} agents from the state store", agents.len());
        Ok(())
    }

    /// Idempotent registration. A soft-deleted agent with the same id is
    /// restored; a live one gets its name/connector/repository updated
    /// and is returned as-is. AgentRegistered is emitted only when the
    /// agent is created or restored.
    pub async fn register(
        &self,
        id: &str,
        name: &str,
        connector: ConnectorType,
        repository_path: &str,
    ) -> Result<AgentRecord> {
        let (record, previous, newly_registered, changed_from) = {
            let mut agents = self.agents.lock().await;
            match agents.get_mut(id) {
                Some(existing) => {
                    let previous = existing.clone();
                    let restored = existing.soft_deleted;
                    existing.soft_deleted = false;
                    existing.name = name.to_string();
                    existing.connector = connector;
                    existing.repository_path = repository_path.to_string();
                    existing.last_heartbeat = chrono::Utc::now();
                    // A returning agent is reachable again; Busy stays
                    // Busy, everything else settles at Idle.
                    if restored || matches!(existing.status, AgentState::Offline | AgentState::Error)
                    {
                        existing.status = AgentState::Idle;
                        existing.current_task_id = None;
                    }
                    existing.touch();
                    let changed_from =
                        (existing.status != previous.status).then_some(previous.status);
                    (existing.clone(), Some(previous), restored, changed_from)
                }
                None => {
                    let record =
                        AgentRecord::new(id.to_string(), name.to_string(), connector, repository_path);
                    agents.insert(id.to_string(), record.clone());
                    (record, None, true, None)
                }
            }
        };

        if let Err(e) = self.persist(record.clone(), previous).await {
            return Err(e);
        }

        if !record.repository_path.is_empty() {
            // First registration for a path creates its repository row.
            self.store
                .upsert_repository(Repository::new(record.repository_path.clone()))
                .await?;
        }

        if newly_registered {
            info!(agent_id = %record.id, repo = %record.repository_path, "Agent registered");
            self.bus.broadcast_all(Event::AgentRegistered {
                timestamp: now(),
                agent_id: record.id.clone(),
                name: record.name.clone(),
                repository_path: record.repository_path.clone(),
            });
        } else {
            debug!(agent_id = %record.id, "Agent re-registered (no-op)");
        }
        if let Some(from) = changed_from {
            self.publish_status_change(&record, from);
        }

        if record.status == AgentState::Idle {
            self.idle_signal.notify_one();
        }
        Ok(record)
    }

    /// Record a heartbeat. An illegal reported transition is rejected
    /// without mutating anything; reporting the current status is
    /// always legal.
    pub async fn heartbeat(
        &self,
        id: &str,
        reported_status: AgentState,
        current_task: Option<String>,
    ) -> Result<AgentRecord> {
        let (record, previous, changed_from) = {
            let mut agents = self.agents.lock().await;
            let agent = agents
                .get_mut(id)
                .filter(|a| !a.soft_deleted)
                .ok_or_else(|| ForemanError::NotFound(format!("agent {id}")))?;

            if agent.status != reported_status && !agent.status.can_transition_to(reported_status) {
                warn!(
                    agent_id = id,
                    from = %agent.status,
                    to = %reported_status,
                    "Rejected illegal heartbeat transition"
                );
                return Err(ForemanError::InvalidTransition(format!(
                    "agent {id}: {} -> {reported_status}",
                    agent.status
                )));
            }

            let previous = agent.clone();
            let changed_from =
                (agent.status != reported_status).then_some(agent.status);
            agent.status = reported_status;
            agent.last_heartbeat = chrono::Utc::now();
            agent.current_task_id = current_task;
            agent.touch();
            (agent.clone(), previous, changed_from)
        };

        self.persist(record.clone(), Some(previous)).await?;

        if let Some(from) = changed_from {
            self.publish_status_change(&record, from);
            if record.status == AgentState::Idle {
                self.idle_signal.notify_one();
            }
        }
        Ok(record)
    }

    /// Selection order: Idle agents first (Busy only when the connector
    /// allows concurrent commands), exact repository matches preferred,
    /// ties broken by oldest heartbeat.
    pub async fn find_available_for_repository(&self, path: &str) -> Option<AgentRecord> {
        let agents = self.agents.lock().await;
        let busy_capable = self.max_concurrent > 1;

        let mut candidates: Vec<&AgentRecord> = agents
            .values()
            .filter(|a| !a.soft_deleted)
            .filter(|a| match a.status {
                AgentState::Idle => true,
                AgentState::Busy => busy_capable,
                _ => false,
            })
            .filter(|a| !a.repository_path.is_empty())
            .collect();

        // Repository matches sort ahead of non-matches; a non-match is
        // still acceptable when nothing better exists. Ties go to the
        // agent idle the longest.
        candidates.sort_by(|a, b| {
            let a_match = crate::models::repo_paths_match(&a.repository_path, path);
            let b_match = crate::models::repo_paths_match(&b.repository_path, path);
            b_match
                .cmp(&a_match)
                .then_with(|| a.last_heartbeat.cmp(&b.last_heartbeat))
        });

        candidates.first().map(|a| (*a).clone())
    }

    /// Idle agents in oldest-heartbeat order, the dispatcher's per-tick
    /// working set.
    pub async fn idle_agents(&self) -> Vec<AgentRecord> {
        let agents = self.agents.lock().await;
        let mut idle: Vec<AgentRecord> = agents
            .values()
            .filter(|a| !a.soft_deleted && a.status == AgentState::Idle)
            .cloned()
            .collect();
        idle.sort_by(|a, b| a.last_heartbeat.cmp(&b.last_heartbeat));
        idle
    }

    /// Auto-create an agent of the default connector type for a
    /// repository nobody serves.
    pub async fn provision(&self, repository_path: &str) -> Result<AgentRecord> {
        let record = AgentRecord::provisioned(repository_path, self.config.default_connector);
        {
            let mut agents = self.agents.lock().await;
            agents.insert(record.id.clone(), record.clone());
        }
        if let Err(e) = self.persist(record.clone(), None).await {
            return Err(e);
        }
        if !repository_path.is_empty() {
            self.store
                .upsert_repository(Repository::new(repository_path))
                .await?;
        }

        info!(agent_id = %record.id, repo = repository_path, "Provisioned agent");
        self.bus.broadcast_all(Event::AgentRegistered {
            timestamp: now(),
            agent_id: record.id.clone(),
            name: record.name.clone(),
            repository_path: record.repository_path.clone(),
        });
        self.idle_signal.notify_one();
        Ok(record)
    }

    pub async fn mark_busy(&self, id: &str, task_id: &str) -> Result<AgentRecord> {
        self.transition(id, AgentState::Busy, Some(task_id.to_string()))
            .await
    }

    pub async fn mark_idle(&self, id: &str) -> Result<AgentRecord> {
        self.transition(id, AgentState::Idle, None).await
    }

    pub async fn mark_error(&self, id: &str, message: &str) -> Result<AgentRecord> {
        let record = self.transition(id, AgentState::Error, None).await?;
        self.bus.publish(
            &agent_group(id),
            Event::AgentError {
                timestamp: now(),
                agent_id: id.to_string(),
                message: message.to_string(),
            },
        );
        Ok(record)
    }

    /// Sweeper entry point: flip one stale agent Offline.
    pub async fn mark_offline(&self, id: &str) -> Result<AgentRecord> {
        let record = self.transition(id, AgentState::Offline, None).await?;
        self.bus.broadcast_all(Event::AgentOffline {
            timestamp: now(),
            agent_id: id.to_string(),
        });
        Ok(record)
    }

    pub async fn soft_delete(&self, id: &str) -> Result<()> {
        {
            let mut agents = self.agents.lock().await;
            let agent = agents
                .get_mut(id)
                .ok_or_else(|| ForemanError::NotFound(format!("agent {id}")))?;
            agent.soft_deleted = true;
            agent.touch();
        }
        self.store.soft_delete_agent(id).await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<AgentRecord> {
        let agents = self.agents.lock().await;
        agents.get(id).filter(|a| !a.soft_deleted).cloned()
    }

    pub async fn list(&self) -> Vec<AgentRecord> {
        let agents = self.agents.lock().await;
        let mut list: Vec<AgentRecord> = agents
            .values()
            .filter(|a| !a.soft_deleted)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    /// One pass over the map: every agent whose heartbeat is older than
    /// the timeout and that is not already Offline goes Offline.
    pub async fn sweep_stale_heartbeats(&self) -> Vec<String> {
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));
        let stale: Vec<String> = {
            let agents = self.agents.lock().await;
            agents
                .values()
                .filter(|a| !a.soft_deleted)
                .filter(|a| a.status != AgentState::Offline)
                .filter(|a| a.heartbeat_age() > timeout)
                .map(|a| a.id.clone())
                .collect()
        };

        let mut marked = Vec::new();
        for id in stale {
            match self.mark_offline(&id).await {
                Ok(_) => {
                    warn!(agent_id = %id, "Agent heartbeat timed out; marked Offline");
                    marked.push(id);
                }
                Err(e) => warn!(agent_id = %id, "Failed to mark agent offline: {e}"),
            }
        }
        marked
    }

    /// Background sweeper driving `sweep_stale_heartbeats` forever.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let interval = registry.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep_stale_heartbeats().await;
            }
        })
    }

    pub fn auto_provision_enabled(&self) -> bool {
        self.config.auto_provision
    }

    async fn transition(
        &self,
        id: &str,
        to: AgentState,
        current_task: Option<String>,
    ) -> Result<AgentRecord> {
        let (record, previous, from) = {
            let mut agents = self.agents.lock().await;
            let agent = agents
                .get_mut(id)
                .filter(|a| !a.soft_deleted)
                .ok_or_else(|| ForemanError::NotFound(format!("agent {id}")))?;

            if !agent.status.can_transition_to(to) {
                warn!(agent_id = id, from = %agent.status, to = %to, "Rejected illegal transition");
                return Err(ForemanError::InvalidTransition(format!(
                    "agent {id}: {} -> {to}",
                    agent.status
                )));
            }

            let previous = agent.clone();
            let from = agent.status;
            agent.status = to;
            agent.current_task_id = current_task;
            agent.touch();
            (agent.clone(), previous, from)
        };

        self.persist(record.clone(), Some(previous)).await?;

        self.publish_status_change(&record, from);
        if record.status == AgentState::Idle {
            self.idle_signal.notify_one();
        }
        Ok(record)
    }

    fn publish_status_change(&self, record: &AgentRecord, from: AgentState) {
        self.bus.publish(
            &agent_group(&record.id),
            Event::AgentStatusChanged {
                timestamp: now(),
                agent_id: record.id.clone(),
                from,
                to: record.status,
            },
        );
    }

    /// Durable mirror write. The in-memory mutation already happened;
    /// if the store rejects it, the map is rolled back so memory and
    /// disk never diverge.
    async fn persist(&self, record: AgentRecord, previous: Option<AgentRecord>) -> Result<()> {
        match self.store.upsert_agent(record.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut agents = self.agents.lock().await;
                match previous {
                    Some(prev) => {
                        agents.insert(prev.id.clone(), prev);
                    }
                    None => {
                        agents.remove(&record.id);
                    }
                }
                Err(e.into())
            }
        }
    }
}
