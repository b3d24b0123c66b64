//! Input validation for the inbound control surface.
//!
//! Commands arrive from untrusted clients and are length-checked here
//! before they reach the queue. Agent ids are opaque strings and pass
//! through untouched.

use crate::constants::{MAX_CLIENT_COMMAND_LENGTH, MAX_TASK_COMMAND_LENGTH};
use crate::{ForemanError, Result};

#[derive(Debug, Clone, Default)]
pub struct InputValidator;

impl InputValidator {
    pub fn new() -> Self {
        Self
    }

    /// A command enqueued as a task. Bound: 5000 chars.
    pub fn validate_task_command(&self, command: &str) -> Result<()> {
        if command.trim().is_empty() {
            return Err(ForemanError::InvalidInput(
                "Command cannot be empty".to_string(),
            ));
        }
        if command.chars().count() > MAX_TASK_COMMAND_LENGTH {
            return Err(ForemanError::InvalidInput(format!(
                "Command exceeds maximum length of {MAX_TASK_COMMAND_LENGTH} characters"
            )));
        }
        Ok(())
    }

    /// A command typed through a client session. Tighter bound: 2000
    /// chars.
    pub fn validate_client_command(&self, command: &str) -> Result<()> {
        if command.trim().is_empty() {
            return Err(ForemanError::InvalidInput(
                "Command cannot be empty".to_string(),
            ));
        }
        if command.chars().count() > MAX_CLIENT_COMMAND_LENGTH {
            return Err(ForemanError::InvalidInput(format!(
                "Command exceeds maximum length of {MAX_CLIENT_COMMAND_LENGTH} characters"
            )));
        }
        Ok(())
    }
}
