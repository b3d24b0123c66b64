//! # Foreman Core
//!
//! Foreman Core is an orchestrator for long-lived AI coding agents: it
//! accepts command requests over HTTP and WebSocket, persists them as
//! prioritized tasks, matches them to registered agents by repository
//! affinity, supervises the CLI subprocesses that execute them, and
//! streams output back to subscribed clients.
//!
//! ## Architecture
//!
//! - **Dispatcher**: the scheduling loop matching tasks to agents,
//!   driving retries and auto-provisioning
//! - **Agent Registry**: authoritative in-memory view of agent presence
//!   and health, mirrored to the state store
//! - **Task Queue**: persistent priority queue with atomic claims
//! - **Subprocess Connector**: one supervised CLI child per agent
//!   session, multiplexed over stdio with a framed reply protocol
//! - **Event Bus / Session Hub**: group-scoped pub/sub fanning progress
//!   and output out to connected clients
//!
//! Execution is at-least-once: tasks interrupted by a crash are
//! re-enqueued on the next start, and failed runs retry with
//! priority-scaled backoff.

/// HTTP API server and WebSocket event stream
pub mod api;
/// Authentication middleware
pub mod auth;
/// Group-scoped pub/sub event fabric
pub mod bus;
/// System configuration
pub mod config;
/// Agent subprocess connectors
pub mod connector;
/// System-wide constants
pub mod constants;
/// Read-only operator introspection
pub mod diagnostics;
/// The scheduling loop
pub mod dispatcher;
/// Per-client session state and fan-out
pub mod hub;
/// Core data models
pub mod models;
/// Persistent prioritized task queue
pub mod queue;
/// Agent presence and health
pub mod registry;
/// Durable persistence engines
pub mod store;
/// Input validation
pub mod validation;
/// Connector cold-start amortization
pub mod warmup;

/// Error types and handling
pub mod error;

#[cfg(test)]
mod tests;

pub use error::{ForemanError, Result};
