//! System-wide default values. Anything here can be overridden through
//! the environment; see `config`.

use std::time::Duration;

/// Heartbeats older than this flip an agent to Offline at the next sweep.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(90);

/// How often the heartbeat sweeper wakes up.
pub const HEARTBEAT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Minimum interval between dispatcher ticks. Enqueues and idle-agent
/// signals inside the window coalesce into one tick.
pub const DEFAULT_DISPATCHER_TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Backpressure bound on the pending-task count.
pub const DEFAULT_MAX_PENDING_TASKS: usize = 10_000;

/// Deadline for a single command against one agent.
pub const DEFAULT_PER_AGENT_COMMAND_TIMEOUT: Duration = Duration::from_secs(600);

/// How long shutdown lets in-flight tasks run before force-cancel.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Maximum execution attempts for a task (first run + retries).
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Base of the exponential retry backoff.
pub const DEFAULT_RETRY_BASE_BACKOFF: Duration = Duration::from_secs(2);

/// Frames buffered per subscriber before old frames are dropped.
pub const DEFAULT_SUBSCRIBER_OUTBOUND_BUFFER: usize = 256;

/// Grace period between closing a child's stdin and killing its
/// process group.
pub const DEFAULT_CONNECTOR_GRACE: Duration = Duration::from_secs(2);

/// In-flight commands allowed per connector. Agents are Busy-capable
/// for claims only when this exceeds 1.
pub const DEFAULT_MAX_CONCURRENT_COMMANDS: usize = 1;

/// Workers draining the Critical/High assignment pool.
pub const HIGH_POOL_WORKERS: usize = 1;

/// Workers draining the Normal/Low assignment pool.
pub const DEFAULT_POOL_WORKERS: usize = 1;

/// Upper bound on a task command.
pub const MAX_TASK_COMMAND_LENGTH: usize = 5000;

/// Upper bound on a command submitted through a client session. Tighter
/// than the task bound because interactive commands are typed, not
/// templated.
pub const MAX_CLIENT_COMMAND_LENGTH: usize = 2000;

/// Prefix for auto-provisioned agent ids.
pub const AUTO_AGENT_ID_PREFIX: &str = "auto-";

/// Command sent once per connector kind at startup to pay cold-start
/// cost out of band.
pub const WARMUP_COMMAND: &str = "Reply with the single word: ready";

/// Sentinel line the connector swallows instead of forwarding.
pub const KEEPALIVE_SENTINEL: &str = "[KEEPALIVE]";

/// Prefix that marks the connector's final reply line.
pub const RESULT_FRAME_PREFIX: &str = "{\"type\":\"result\"";
