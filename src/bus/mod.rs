//! In-process group-scoped publish/subscribe.
//!
//! Groups are named fan-out channels (typically one per agent session).
//! Delivery is best-effort per subscriber: a slow subscriber's bounded
//! buffer drops its oldest frame on overflow and a single `Lagged`
//! marker is surfaced in its place. Publishers never block.

use crate::models::{AgentState, Priority};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::trace;
use uuid::Uuid;

/// Everything the core announces to subscribers. Each event carries its
/// publish timestamp; encoding for a particular transport is the
/// transport's business.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    AgentRegistered {
        timestamp: chrono::DateTime<chrono::Utc>,
        agent_id: String,
        name: String,
        repository_path: String,
    },
    AgentStatusChanged {
        timestamp: chrono::DateTime<chrono::Utc>,
        agent_id: String,
        from: AgentState,
        to: AgentState,
    },
    AgentError {
        timestamp: chrono::DateTime<chrono::Utc>,
        agent_id: String,
        message: String,
    },
    AgentOffline {
        timestamp: chrono::DateTime<chrono::Utc>,
        agent_id: String,
    },
    SessionCreated {
        timestamp: chrono::DateTime<chrono::Utc>,
        agent_id: String,
        session_id: String,
    },
    SessionDisconnected {
        timestamp: chrono::DateTime<chrono::Utc>,
        agent_id: String,
        session_id: String,
    },
    SessionError {
        timestamp: chrono::DateTime<chrono::Utc>,
        agent_id: String,
        message: String,
    },
    TaskEnqueued {
        timestamp: chrono::DateTime<chrono::Utc>,
        task_id: String,
        repository_path: String,
        priority: Priority,
    },
    TaskAssigned {
        timestamp: chrono::DateTime<chrono::Utc>,
        task_id: String,
        agent_id: String,
    },
    TaskStarted {
        timestamp: chrono::DateTime<chrono::Utc>,
        task_id: String,
        agent_id: String,
    },
    OutputChunk {
        timestamp: chrono::DateTime<chrono::Utc>,
        task_id: String,
        agent_id: String,
        line: String,
    },
    TaskCompleted {
        timestamp: chrono::DateTime<chrono::Utc>,
        task_id: String,
        agent_id: String,
        result: String,
    },
    TaskFailed {
        timestamp: chrono::DateTime<chrono::Utc>,
        task_id: String,
        agent_id: String,
        error: String,
    },
    Lagged {
        timestamp: chrono::DateTime<chrono::Utc>,
        dropped: u64,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::AgentRegistered { .. } => "agent_registered",
            Event::AgentStatusChanged { .. } => "agent_status_changed",
            Event::AgentError { .. } => "agent_error",
            Event::AgentOffline { .. } => "agent_offline",
            Event::SessionCreated { .. } => "session_created",
            Event::SessionDisconnected { .. } => "session_disconnected",
            Event::SessionError { .. } => "session_error",
            Event::TaskEnqueued { .. } => "task_enqueued",
            Event::TaskAssigned { .. } => "task_assigned",
            Event::TaskStarted { .. } => "task_started",
            Event::OutputChunk { .. } => "output_chunk",
            Event::TaskCompleted { .. } => "task_completed",
            Event::TaskFailed { .. } => "task_failed",
            Event::Lagged { .. } => "lagged",
        }
    }
}

/// The group every event about one agent's session is published to.
pub fn agent_group(agent_id: &str) -> String {
    format!("agent_{agent_id}")
}

#[derive(Default)]
struct MailboxState {
    queue: VecDeque<Event>,
    /// Frames dropped since the consumer last drained. All dropped
    /// frames are strictly older than anything still queued, so one
    /// marker emitted before the next frame preserves order.
    dropped: u64,
    closed: bool,
}

struct Mailbox {
    state: Mutex<MailboxState>,
    notify: Notify,
    capacity: usize,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(MailboxState::default()),
            notify: Notify::new(),
            capacity,
        }
    }

    fn push(&self, event: Event) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return;
            }
            if state.queue.len() >= self.capacity {
                state.queue.pop_front();
                state.dropped += 1;
            }
            state.queue.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
        }
        self.notify.notify_one();
    }
}

#[derive(Default)]
struct BusInner {
    groups: HashMap<String, HashSet<Uuid>>,
    mailboxes: HashMap<Uuid, Arc<Mailbox>>,
}

/// Group membership is guarded by one short-lived lock; delivery goes
/// through per-subscriber mailboxes so one slow consumer never stalls
/// another.
pub struct EventBus {
    inner: Mutex<BusInner>,
    capacity: usize,
}

impl EventBus {
    pub fn new(subscriber_buffer: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner::default()),
            capacity: subscriber_buffer.max(1),
        }
    }

    /// Create the subscriber's mailbox. Must precede any `join_group`.
    pub fn register_subscriber(&self, subscriber_id: Uuid) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .mailboxes
            .entry(subscriber_id)
            .or_insert_with(|| Arc::new(Mailbox::new(self.capacity)));
    }

    /// Drop all memberships and close the mailbox; a blocked
    /// `next_event` call returns None.
    pub fn unregister_subscriber(&self, subscriber_id: Uuid) {
        let mailbox = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            for members in inner.groups.values_mut() {
                members.remove(&subscriber_id);
            }
            inner.groups.retain(|_, members| !members.is_empty());
            inner.mailboxes.remove(&subscriber_id)
        };
        if let Some(mailbox) = mailbox {
            mailbox.close();
        }
    }

    pub fn join_group(&self, subscriber_id: Uuid, group: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.mailboxes.contains_key(&subscriber_id) {
            trace!("join_group for unknown subscriber {subscriber_id}");
            return;
        }
        inner
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(subscriber_id);
    }

    pub fn leave_group(&self, subscriber_id: Uuid, group: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(members) = inner.groups.get_mut(group) {
            members.remove(&subscriber_id);
            if members.is_empty() {
                inner.groups.remove(group);
            }
        }
    }

    /// Deliver to all current members of the group. Never blocks.
    pub fn publish(&self, group: &str, event: Event) {
        let targets: Vec<Arc<Mailbox>> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.groups.get(group) {
                Some(members) => members
                    .iter()
                    .filter_map(|id| inner.mailboxes.get(id).cloned())
                    .collect(),
                None => Vec::new(),
            }
        };
        trace!(group, kind = event.kind(), members = targets.len(), "publish");
        for mailbox in targets {
            mailbox.push(event.clone());
        }
    }

    /// Health events go to every connected subscriber regardless of
    /// group membership.
    pub fn broadcast_all(&self, event: Event) {
        let targets: Vec<Arc<Mailbox>> = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.mailboxes.values().cloned().collect()
        };
        for mailbox in targets {
            mailbox.push(event.clone());
        }
    }

    /// Pull the subscriber's next frame. Returns None once the
    /// subscriber is unregistered and its buffer is drained.
    pub async fn next_event(&self, subscriber_id: Uuid) -> Option<Event> {
        let mailbox = {
            let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.mailboxes.get(&subscriber_id).cloned()
        }?;

        loop {
            {
                let mut state = mailbox.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.dropped > 0 {
                    let dropped = state.dropped;
                    state.dropped = 0;
                    return Some(Event::Lagged {
                        timestamp: chrono::Utc::now(),
                        dropped,
                    });
                }
                if let Some(event) = state.queue.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            mailbox.notify.notified().await;
        }
    }

    pub fn group_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .groups
            .len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .mailboxes
            .len()
    }

    pub fn is_member(&self, subscriber_id: Uuid, group: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .groups
            .get(group)
            .is_some_and(|members| members.contains(&subscriber_id))
    }
}

pub(crate) fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}
