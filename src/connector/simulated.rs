//! Scripted in-process connector. Tests and local development drive
//! the full dispatch path through this kind without spawning real
//! children.

use super::{complete, CliReply, InFlight};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

/// What a simulated command run does after emitting its scripted lines.
#[derive(Debug, Clone)]
pub enum SimulatedOutcome {
    /// Reply successfully with the command text as the result.
    EchoCommand,
    Success(String),
    /// Reply with an `is_error` envelope.
    Error(String),
    /// Emit lines but never send a result frame; the caller's deadline
    /// decides.
    NeverReplies,
}

#[derive(Clone)]
pub struct SimulatedSpec {
    pub lines: Vec<String>,
    pub line_delay: Duration,
    pub outcome: SimulatedOutcome,
    sent_commands: Arc<StdMutex<Vec<String>>>,
    interventions: Arc<StdMutex<Vec<serde_json::Value>>>,
}

impl SimulatedSpec {
    pub fn new(lines: Vec<String>, outcome: SimulatedOutcome) -> Self {
        Self {
            lines,
            line_delay: Duration::from_millis(1),
            outcome,
            sent_commands: Arc::new(StdMutex::new(Vec::new())),
            interventions: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// Default behavior: no output lines, echo the command back as the
    /// successful result.
    pub fn echo() -> Self {
        Self::new(Vec::new(), SimulatedOutcome::EchoCommand)
    }

    pub fn never_replies() -> Self {
        Self::new(Vec::new(), SimulatedOutcome::NeverReplies)
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::new(Vec::new(), SimulatedOutcome::Error(message.into()))
    }

    pub fn with_line_delay(mut self, delay: Duration) -> Self {
        self.line_delay = delay;
        self
    }

    /// Commands this connector has been asked to run, oldest first.
    pub fn sent_commands(&self) -> Vec<String> {
        self.sent_commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Out-of-band frames received so far.
    pub fn interventions(&self) -> Vec<serde_json::Value> {
        self.interventions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

pub(super) struct SimulatedSession {
    spec: SimulatedSpec,
    in_flight: Arc<StdMutex<Option<InFlight>>>,
    runners: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SimulatedSession {
    pub(super) fn new(spec: SimulatedSpec, in_flight: Arc<StdMutex<Option<InFlight>>>) -> Self {
        Self {
            spec,
            in_flight,
            runners: StdMutex::new(Vec::new()),
        }
    }

    pub(super) fn start_command(&self, command: &str) {
        self.spec
            .sent_commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.to_string());

        let command = command.to_string();
        let lines = self.spec.lines.clone();
        let delay = self.spec.line_delay;
        let outcome = self.spec.outcome.clone();
        let in_flight = self.in_flight.clone();

        let runner = tokio::spawn(async move {
            let line_tx = in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_ref()
                .map(|flight| flight.line_tx.clone());
            let Some(line_tx) = line_tx else { return };

            for line in lines {
                tokio::time::sleep(delay).await;
                if line_tx.send(line).await.is_err() {
                    return;
                }
            }

            let reply = match outcome {
                SimulatedOutcome::EchoCommand => CliReply::success(command),
                SimulatedOutcome::Success(result) => CliReply::success(result),
                SimulatedOutcome::Error(message) => CliReply::error(message),
                SimulatedOutcome::NeverReplies => return,
            };

            let taken = in_flight.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(flight) = taken {
                complete(&flight.done, Ok(reply));
            }
        });

        self.runners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(runner);
    }

    pub(super) fn record_intervention(&self, payload: serde_json::Value) {
        self.spec
            .interventions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload);
    }

    pub(super) fn shutdown(self) {
        for runner in self
            .runners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            runner.abort();
        }
    }
}
