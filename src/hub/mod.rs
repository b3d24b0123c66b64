//! Per-client session state and fan-out.
//!
//! The transport (WebSocket handler, tests) talks to the hub; the hub
//! owns subscriber identity, group membership, and the command ingress
//! path into the queue. A disconnect drops the client's frames without
//! touching the underlying tasks; results still land in the store.

use crate::bus::{agent_group, Event, EventBus};
use crate::dispatcher::Dispatcher;
use crate::models::{Priority, Task};
use crate::queue::{subscriber_group, TaskQueue};
use crate::registry::AgentRegistry;
use crate::validation::InputValidator;
use crate::{ForemanError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SubscriberInfo {
    client_id: String,
    agent_groups: HashSet<String>,
}

pub struct ClientSessionHub {
    bus: Arc<EventBus>,
    queue: Arc<TaskQueue>,
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<Dispatcher>,
    validator: InputValidator,
    subscribers: StdMutex<HashMap<Uuid, SubscriberInfo>>,
}

impl ClientSessionHub {
    pub fn new(
        bus: Arc<EventBus>,
        queue: Arc<TaskQueue>,
        registry: Arc<AgentRegistry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            bus,
            queue,
            registry,
            dispatcher,
            validator: InputValidator::new(),
            subscribers: StdMutex::new(HashMap::new()),
        }
    }

    /// New subscriber for a connected client. The subscriber is
    /// immediately a member of its own private group so task events it
    /// originates can be routed back.
    pub fn on_connect(&self, client_id: &str) -> Uuid {
        let subscriber_id = Uuid::new_v4();
        self.bus.register_subscriber(subscriber_id);
        self.bus
            .join_group(subscriber_id, &subscriber_group(subscriber_id));
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                subscriber_id,
                SubscriberInfo {
                    client_id: client_id.to_string(),
                    agent_groups: HashSet::new(),
                },
            );
        info!(client_id, %subscriber_id, "Client session connected");
        subscriber_id
    }

    /// Remove all memberships and close the outbound stream. In-flight
    /// tasks this subscriber originated keep running; their results
    /// stay queryable through the store.
    pub fn on_disconnect(&self, subscriber_id: Uuid) {
        let removed = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&subscriber_id);
        self.bus.unregister_subscriber(subscriber_id);
        if let Some(info) = removed {
            info!(client_id = %info.client_id, %subscriber_id, "Client session disconnected");
        }
    }

    pub fn join_agent(&self, subscriber_id: Uuid, agent_id: &str) -> Result<()> {
        let group = agent_group(agent_id);
        {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            let info = subscribers
                .get_mut(&subscriber_id)
                .ok_or_else(|| ForemanError::NotFound(format!("subscriber {subscriber_id}")))?;
            info.agent_groups.insert(group.clone());
        }
        self.bus.join_group(subscriber_id, &group);
        debug!(%subscriber_id, agent_id, "Subscriber joined agent group");
        Ok(())
    }

    pub fn leave_agent(&self, subscriber_id: Uuid, agent_id: &str) -> Result<()> {
        let group = agent_group(agent_id);
        {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            let info = subscribers
                .get_mut(&subscriber_id)
                .ok_or_else(|| ForemanError::NotFound(format!("subscriber {subscriber_id}")))?;
            info.agent_groups.remove(&group);
        }
        self.bus.leave_group(subscriber_id, &group);
        Ok(())
    }

    /// Validate and enqueue a command against a specific agent's
    /// repository. Returns the request (task) id.
    pub async fn send_command_to_agent(
        &self,
        subscriber_id: Uuid,
        agent_id: &str,
        command: &str,
    ) -> Result<String> {
        self.validator.validate_client_command(command)?;
        {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            if !subscribers.contains_key(&subscriber_id) {
                return Err(ForemanError::NotFound(format!(
                    "subscriber {subscriber_id}"
                )));
            }
        }
        let agent = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| ForemanError::NotFound(format!("agent {agent_id}")))?;

        let task = Task::new(command, agent.repository_path.clone(), Priority::Normal)
            .with_origin(subscriber_id);
        let request_id = self.queue.enqueue(task).await?;
        debug!(%subscriber_id, agent_id, request_id, "Command enqueued for agent");
        Ok(request_id)
    }

    /// Forward a small control message to the agent's live connector as
    /// an out-of-band frame.
    pub async fn send_intervention_response(
        &self,
        subscriber_id: Uuid,
        agent_id: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            if !subscribers.contains_key(&subscriber_id) {
                return Err(ForemanError::NotFound(format!(
                    "subscriber {subscriber_id}"
                )));
            }
        }
        self.dispatcher.intervene(agent_id, payload).await
    }

    /// The transport's pull surface: next ordered frame for this
    /// subscriber, None once disconnected.
    pub async fn next_frame(&self, subscriber_id: Uuid) -> Option<Event> {
        self.bus.next_event(subscriber_id).await
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
