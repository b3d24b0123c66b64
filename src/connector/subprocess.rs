//! The subprocess side of a connector: one long-lived CLI child per
//! session, commands written to stdin one per line, replies framed on
//! stdout.

use super::{complete, CliReply, InFlight, SessionState};
use crate::bus::{agent_group, now, Event, EventBus};
use crate::config::ConnectorConfig;
use crate::constants::{KEEPALIVE_SENTINEL, RESULT_FRAME_PREFIX};
use crate::{ForemanError, Result};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Executable and argument layout for one connector type.
#[derive(Debug, Clone)]
pub struct SubprocessSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl SubprocessSpec {
    /// The claude-code invocation: streaming text framing, the
    /// configured tool allow-list, long-lived stdin.
    pub fn claude_code(config: &ConnectorConfig) -> Result<Self> {
        let binary = config
            .claude_binary_path
            .clone()
            .unwrap_or_else(|| "claude".to_string());
        let builder = super::ClaudeCommandBuilder::new(binary)
            .with_text_output()
            .with_allowed_tools(config.allowed_tools.clone())
            .long_lived();
        builder
            .validate()
            .map_err(ForemanError::ConfigurationError)?;
        let (program, args) = builder.build();
        Ok(Self { program, args })
    }

    /// Arbitrary shell one-liner; the framing tests drive the real
    /// session machinery through `/bin/sh`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.into()],
        }
    }
}

pub(super) struct SubprocessSession {
    child: Arc<Mutex<Child>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    pid: Option<u32>,
    supervisor: tokio::task::JoinHandle<()>,
    stderr_reader: Option<tokio::task::JoinHandle<()>>,
}

impl SubprocessSession {
    /// Spawn the child with cwd set to the agent's repository and start
    /// the stdout supervisor. The child goes into its own process group
    /// so the whole tree can be killed later.
    pub(super) async fn spawn(
        spec: &SubprocessSpec,
        repository_path: &str,
        agent_id: String,
        session_id: String,
        bus: Arc<EventBus>,
        in_flight: Arc<StdMutex<Option<InFlight>>>,
        state: Arc<Mutex<SessionState>>,
    ) -> Result<Self> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !repository_path.is_empty() {
            command.current_dir(repository_path);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| ForemanError::ConnectorSpawn {
            message: format!("failed to launch {}: {e}", spec.program),
        })?;

        let pid = child.id();
        let stdout = child.stdout.take().ok_or_else(|| ForemanError::ConnectorSpawn {
            message: "child stdout was not captured".to_string(),
        })?;
        let stderr = child.stderr.take();
        let stdin = child.stdin.take().ok_or_else(|| ForemanError::ConnectorSpawn {
            message: "child stdin was not captured".to_string(),
        })?;

        let child = Arc::new(Mutex::new(child));

        let stderr_reader = stderr.map(|stderr| {
            let agent_id = agent_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(agent_id = %agent_id, "child stderr: {line}");
                }
            })
        });

        let supervisor = {
            let child = child.clone();
            let in_flight = in_flight.clone();
            tokio::spawn(async move {
                supervise_stdout(stdout, child, in_flight, state, bus, agent_id, session_id).await;
            })
        };

        Ok(Self {
            child,
            stdin: Arc::new(Mutex::new(Some(stdin))),
            pid,
            supervisor,
            stderr_reader,
        })
    }

    pub(super) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Command text, newline, flush. UTF-8 in both directions.
    pub(super) async fn send_command(&self, command: &str) -> Result<()> {
        self.send_raw_line(command).await
    }

    pub(super) async fn send_raw_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| ForemanError::Connector {
            message: "child stdin is closed".to_string(),
        })?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ForemanError::Connector {
                message: format!("failed to write to child stdin: {e}"),
            })?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| ForemanError::Connector {
                message: format!("failed to write to child stdin: {e}"),
            })?;
        stdin.flush().await.map_err(|e| ForemanError::Connector {
            message: format!("failed to flush child stdin: {e}"),
        })?;
        Ok(())
    }

    /// Close stdin, give the child the grace period to exit on its own,
    /// then kill its process group.
    pub(super) async fn shutdown(self, grace: Duration) {
        {
            let mut stdin = self.stdin.lock().await;
            stdin.take();
        }

        let deadline = tokio::time::Instant::now() + grace;
        let mut exited = false;
        loop {
            {
                let mut child = self.child.lock().await;
                match child.try_wait() {
                    Ok(Some(_)) => {
                        exited = true;
                        break;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("try_wait on child failed: {e}");
                        break;
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if !exited {
            if let Some(pid) = self.pid {
                warn!(pid, "Child did not exit within grace period; killing process group");
                kill_process_group(pid);
            }
            let mut child = self.child.lock().await;
            let _ = child.kill().await;
        }

        self.supervisor.abort();
        if let Some(stderr_reader) = self.stderr_reader {
            stderr_reader.abort();
        }
    }
}

/// Read stdout line by line. A line opening with the result sentinel is
/// the final reply for the in-flight command; keepalives are swallowed;
/// everything else is forwarded untouched.
async fn supervise_stdout(
    stdout: tokio::process::ChildStdout,
    child: Arc<Mutex<Child>>,
    in_flight: Arc<StdMutex<Option<InFlight>>>,
    state: Arc<Mutex<SessionState>>,
    bus: Arc<EventBus>,
    agent_id: String,
    session_id: String,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim() == KEEPALIVE_SENTINEL {
                    continue;
                }
                if line.starts_with(RESULT_FRAME_PREFIX) {
                    let taken = in_flight.lock().unwrap_or_else(|e| e.into_inner()).take();
                    let Some(flight) = taken else {
                        debug!(agent_id = %agent_id, "Result frame with no command in flight");
                        continue;
                    };
                    match serde_json::from_str::<CliReply>(&line) {
                        Ok(reply) => {
                            complete(&flight.done, Ok(reply));
                        }
                        Err(e) => {
                            complete(
                                &flight.done,
                                Err(ForemanError::Connector {
                                    message: format!("malformed result frame: {e}"),
                                }),
                            );
                        }
                    }
                    continue;
                }

                // Forwarded verbatim. The sender is cloned out so the
                // slot lock is not held across the await.
                let tx = in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_ref()
                    .map(|flight| flight.line_tx.clone());
                if let Some(tx) = tx {
                    let _ = tx.send(line).await;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(agent_id = %agent_id, "Error reading child stdout: {e}");
                break;
            }
        }
    }

    // Stdout closed: the child is gone or going. Reap it, fail any
    // pending caller, and surface the session error unless this is an
    // orderly disconnect.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let exit_status = {
        let mut child = child.lock().await;
        child.try_wait().ok().flatten()
    };

    let taken = in_flight.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(flight) = taken {
        let message = match exit_status {
            Some(status) => format!("child exited ({status}) before replying"),
            None => "child stdout closed before replying".to_string(),
        };
        complete(&flight.done, Err(ForemanError::Connector { message }));
    }

    let was_connected = {
        let mut state = state.lock().await;
        if *state == SessionState::Connected {
            *state = SessionState::Error;
            true
        } else {
            false
        }
    };
    if was_connected {
        let message = match exit_status {
            Some(status) if status.success() => "child exited".to_string(),
            Some(status) => format!("child exited abnormally ({status})"),
            None => "child stdout closed".to_string(),
        };
        warn!(agent_id = %agent_id, session_id = %session_id, "{message}");
        bus.publish(
            &agent_group(&agent_id),
            Event::SessionError {
                timestamp: now(),
                agent_id: agent_id.clone(),
                message,
            },
        );
    }
}

/// Kill the child's whole process tree. The child was spawned as its
/// own process group leader, so one signal reaches every descendant.
pub(crate) fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!(pid, "killpg failed (process may already be gone): {e}");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}
