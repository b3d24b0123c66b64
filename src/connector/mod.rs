//! Connectors run commands on behalf of agents.
//!
//! A connector owns at most one live session. The `Subprocess` kind
//! drives a CLI child process over stdio with a framed reply protocol;
//! the `Simulated` kind is an in-process stand-in with scripted
//! behavior, used by tests and local development. Both expose the same
//! `execute(command, timeout)` surface: a lazy ordered stream of output
//! lines plus one final reply envelope.

use crate::bus::{agent_group, now, Event, EventBus};
use crate::config::ConnectorConfig;
use crate::models::{AgentRecord, ConnectorType};
use crate::{ForemanError, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

mod command_builder;
mod simulated;
mod subprocess;


pub use command_builder::ClaudeCommandBuilder;
pub use simulated::{SimulatedOutcome, SimulatedSpec};
pub use subprocess::SubprocessSpec;

/// Connector session lifecycle. Only `connect` may leave Disconnected;
/// only Connected accepts commands; `disconnect` and fatal errors are
/// valid from any non-Disconnected state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

/// The final reply envelope a connector emits for each command. On the
/// wire this is one JSON line whose first characters are
/// `{"type":"result"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliReply {
    #[serde(rename = "type")]
    pub reply_type: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permission_denials: Vec<serde_json::Value>,
}

impl CliReply {
    pub fn success(result: impl Into<String>) -> Self {
        Self {
            reply_type: "result".to_string(),
            subtype: "success".to_string(),
            is_error: false,
            result: result.into(),
            session_id: String::new(),
            duration_ms: 0,
            total_cost_usd: None,
            permission_denials: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            reply_type: "result".to_string(),
            subtype: "error".to_string(),
            is_error: true,
            result: message.into(),
            session_id: String::new(),
            duration_ms: 0,
            total_cost_usd: None,
            permission_denials: Vec::new(),
        }
    }
}

/// What actually executes commands for one agent.
#[derive(Clone)]
pub enum ConnectorKind {
    Subprocess(SubprocessSpec),
    Simulated(SimulatedSpec),
}

impl ConnectorKind {
    pub fn type_name(&self) -> ConnectorType {
        match self {
            ConnectorKind::Subprocess(_) => ConnectorType::ClaudeCode,
            ConnectorKind::Simulated(_) => ConnectorType::Simulated,
        }
    }
}

/// Maps an agent's declared connector type onto a concrete kind.
pub trait ConnectorFactory: Send + Sync {
    fn kind_for(&self, agent: &AgentRecord) -> Result<ConnectorKind>;
}

/// Production factory: claude-code agents get a subprocess spec built
/// from the connector config; simulated agents get the echo script.
pub struct DefaultConnectorFactory {
    config: ConnectorConfig,
}

impl DefaultConnectorFactory {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }
}

impl ConnectorFactory for DefaultConnectorFactory {
    fn kind_for(&self, agent: &AgentRecord) -> Result<ConnectorKind> {
        match agent.connector {
            ConnectorType::ClaudeCode => Ok(ConnectorKind::Subprocess(
                SubprocessSpec::claude_code(&self.config)?,
            )),
            ConnectorType::Simulated => Ok(ConnectorKind::Simulated(SimulatedSpec::echo())),
        }
    }
}

/// Caller's view of one in-flight command: drain the line stream, then
/// take the final reply.
#[derive(Debug)]
pub struct ExecutionHandle {
    lines: mpsc::Receiver<String>,
    result: oneshot::Receiver<Result<CliReply>>,
}

impl ExecutionHandle {
    /// Next forwarded output line; None once the command finished and
    /// the stream drained.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    pub async fn await_result(self) -> Result<CliReply> {
        match self.result.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ForemanError::Cancelled(
                "connector closed before replying".to_string(),
            )),
        }
    }
}

/// Channel ends the executing side fills in.
pub(crate) struct InFlight {
    pub line_tx: mpsc::Sender<String>,
    pub done: CompletionSlot,
}

/// Exactly one of the supervisor, the watchdog, or the disconnect path
/// completes a command; whoever takes the sender first wins.
pub(crate) type CompletionSlot = Arc<StdMutex<Option<oneshot::Sender<Result<CliReply>>>>>;

pub(crate) fn complete(slot: &CompletionSlot, outcome: Result<CliReply>) -> bool {
    let sender = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
    match sender {
        Some(tx) => tx.send(outcome).is_ok(),
        None => false,
    }
}

/// Identity of one live connector session, surfaced to diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub agent_id: String,
    pub connector: ConnectorType,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub state: SessionState,
}

enum Backend {
    Idle,
    Subprocess(subprocess::SubprocessSession),
    Simulated(simulated::SimulatedSession),
}

/// One connector per running agent session. Owns the child process (or
/// the simulated script), the command send slot, and the supervisor
/// task; nobody else touches the child.
pub struct Connector {
    agent_id: String,
    kind: ConnectorKind,
    bus: Arc<EventBus>,
    disconnect_grace: Duration,
    /// Shared with the supervisor and watchdog tasks, which flip it on
    /// fatal errors.
    state: Arc<Mutex<SessionState>>,
    backend: Mutex<Backend>,
    session: StdMutex<Option<SessionInfo>>,
    /// Busy gate: the command currently in flight.
    in_flight: Arc<StdMutex<Option<InFlight>>>,
}

impl Connector {
    pub fn new(
        agent_id: impl Into<String>,
        kind: ConnectorKind,
        bus: Arc<EventBus>,
        disconnect_grace: Duration,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind,
            bus,
            disconnect_grace,
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
            backend: Mutex::new(Backend::Idle),
            session: StdMutex::new(None),
            in_flight: Arc::new(StdMutex::new(None)),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Disconnected -> Connecting -> Connected. Spawns the child (or
    /// arms the script) with the working directory set to the agent's
    /// repository path.
    pub async fn connect(&self, repository_path: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state != SessionState::Disconnected {
                return Err(ForemanError::Connector {
                    message: format!(
                        "connect is only valid from Disconnected (agent {}, state {:?})",
                        self.agent_id, *state
                    ),
                });
            }
            *state = SessionState::Connecting;
        }

        let session_id = Uuid::new_v4().to_string();
        let started = match &self.kind {
            ConnectorKind::Subprocess(spec) => subprocess::SubprocessSession::spawn(
                spec,
                repository_path,
                self.agent_id.clone(),
                session_id.clone(),
                self.bus.clone(),
                self.in_flight.clone(),
                self.state_handle(),
            )
            .await
            .map(Backend::Subprocess),
            ConnectorKind::Simulated(spec) => {
                Ok(Backend::Simulated(simulated::SimulatedSession::new(
                    spec.clone(),
                    self.in_flight.clone(),
                )))
            }
        };

        match started {
            Ok(backend) => {
                *self.backend.lock().await = backend;
                *self.state.lock().await = SessionState::Connected;
                let info = SessionInfo {
                    id: session_id.clone(),
                    agent_id: self.agent_id.clone(),
                    connector: self.kind.type_name(),
                    started_at: chrono::Utc::now(),
                    state: SessionState::Connected,
                };
                *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(info);
                info!(agent_id = %self.agent_id, session_id = %session_id, "Connector session created");
                self.bus.publish(
                    &agent_group(&self.agent_id),
                    Event::SessionCreated {
                        timestamp: now(),
                        agent_id: self.agent_id.clone(),
                        session_id,
                    },
                );
                Ok(())
            }
            Err(e) => {
                *self.state.lock().await = SessionState::Disconnected;
                self.bus.publish(
                    &agent_group(&self.agent_id),
                    Event::SessionError {
                        timestamp: now(),
                        agent_id: self.agent_id.clone(),
                        message: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Run one command. The returned handle streams output lines and
    /// resolves to the final reply; the deadline covers the whole
    /// exchange, and on expiry the child's process tree is killed.
    pub async fn execute(&self, command: &str, timeout: Duration) -> Result<ExecutionHandle> {
        if self.state().await != SessionState::Connected {
            return Err(ForemanError::Connector {
                message: format!("agent {} connector is not connected", self.agent_id),
            });
        }

        let (line_tx, line_rx) = mpsc::channel(1024);
        let (done_tx, done_rx) = oneshot::channel();
        let done: CompletionSlot = Arc::new(StdMutex::new(Some(done_tx)));

        {
            let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                return Err(ForemanError::Busy(format!(
                    "agent {} already has a command in flight",
                    self.agent_id
                )));
            }
            *slot = Some(InFlight {
                line_tx,
                done: done.clone(),
            });
        }

        let dispatch = {
            let backend = self.backend.lock().await;
            match &*backend {
                Backend::Subprocess(session) => session.send_command(command).await,
                Backend::Simulated(session) => {
                    session.start_command(command);
                    Ok(())
                }
                Backend::Idle => Err(ForemanError::Connector {
                    message: format!("agent {} has no live session", self.agent_id),
                }),
            }
        };
        if let Err(e) = dispatch {
            self.in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            return Err(e);
        }

        self.spawn_watchdog(timeout, done);
        debug!(agent_id = %self.agent_id, "Command dispatched to connector");
        Ok(ExecutionHandle {
            lines: line_rx,
            result: done_rx,
        })
    }

    /// Out-of-band control frame, written ahead of the next queued
    /// command's input.
    pub async fn send_intervention(&self, payload: serde_json::Value) -> Result<()> {
        if self.state().await != SessionState::Connected {
            return Err(ForemanError::Connector {
                message: format!("agent {} connector is not connected", self.agent_id),
            });
        }
        let backend = self.backend.lock().await;
        match &*backend {
            Backend::Subprocess(session) => session.send_raw_line(&payload.to_string()).await,
            Backend::Simulated(session) => {
                session.record_intervention(payload);
                Ok(())
            }
            Backend::Idle => Err(ForemanError::Connector {
                message: format!("agent {} has no live session", self.agent_id),
            }),
        }
    }

    /// Orderly teardown: close stdin, give the child the grace period,
    /// then kill its process group. Pending callers get Cancelled.
    pub async fn disconnect(&self) {
        {
            let mut state = self.state.lock().await;
            if matches!(*state, SessionState::Disconnected | SessionState::Disconnecting) {
                return;
            }
            *state = SessionState::Disconnecting;
        }

        let backend = {
            let mut backend = self.backend.lock().await;
            std::mem::replace(&mut *backend, Backend::Idle)
        };
        match backend {
            Backend::Subprocess(session) => session.shutdown(self.disconnect_grace).await,
            Backend::Simulated(session) => session.shutdown(),
            Backend::Idle => {}
        }

        if let Some(in_flight) = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            complete(
                &in_flight.done,
                Err(ForemanError::Cancelled(format!(
                    "agent {} connector disconnected",
                    self.agent_id
                ))),
            );
        }

        *self.state.lock().await = SessionState::Disconnected;
        let session_id = {
            let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
            session.take().map(|s| s.id).unwrap_or_default()
        };
        info!(agent_id = %self.agent_id, "Connector session disconnected");
        self.bus.publish(
            &agent_group(&self.agent_id),
            Event::SessionDisconnected {
                timestamp: now(),
                agent_id: self.agent_id.clone(),
                session_id,
            },
        );
    }

    fn spawn_watchdog(&self, timeout: Duration, done: CompletionSlot) {
        let in_flight = self.in_flight.clone();
        let state = self.state_handle();
        let bus = self.bus.clone();
        let agent_id = self.agent_id.clone();
        let child_pid = self.backend_pid_probe();

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = complete(
                &done,
                Err(ForemanError::Timeout {
                    message: format!("command timed out after {}s", timeout.as_secs()),
                }),
            );
            if !expired {
                return;
            }

            warn!(agent_id = %agent_id, "Command deadline expired; tearing the session down");
            in_flight.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(pid) = child_pid {
                subprocess::kill_process_group(pid);
            }
            {
                let mut state = state.lock().await;
                if *state == SessionState::Connected {
                    *state = SessionState::Error;
                }
            }
            bus.publish(
                &agent_group(&agent_id),
                Event::SessionError {
                    timestamp: now(),
                    agent_id: agent_id.clone(),
                    message: "command deadline expired".to_string(),
                },
            );
        });
    }

    fn backend_pid_probe(&self) -> Option<u32> {
        // Read synchronously; the watchdog may not be able to await the
        // backend lock while a disconnect is in progress.
        match self.backend.try_lock() {
            Ok(backend) => match &*backend {
                Backend::Subprocess(session) => session.pid(),
                _ => None,
            },
            Err(_) => None,
        }
    }

    /// A session in Error still holds a dead child; reset lets the
    /// dispatcher lazily reconnect on the next assignment.
    pub async fn reset_if_errored(&self) {
        let errored = { *self.state.lock().await == SessionState::Error };
        if errored {
            let backend = {
                let mut backend = self.backend.lock().await;
                std::mem::replace(&mut *backend, Backend::Idle)
            };
            match backend {
                Backend::Subprocess(session) => session.shutdown(Duration::from_millis(100)).await,
                Backend::Simulated(session) => session.shutdown(),
                Backend::Idle => {}
            }
            *self.state.lock().await = SessionState::Disconnected;
            *self.session.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }
    }

    fn state_handle(&self) -> Arc<Mutex<SessionState>> {
        self.state.clone()
    }
}
