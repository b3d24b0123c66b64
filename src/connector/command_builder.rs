//! Fluent construction of the Claude Code CLI invocation.
//!
//! The CLI has a wide flag surface; the builder keeps the combinations
//! the orchestrator actually uses type-checked and testable.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct ClaudeCommandBuilder {
    binary_path: String,
    output_format: OutputFormat,
    permission_mode: PermissionMode,
    allowed_tools: Vec<String>,
    additional_dirs: Vec<PathBuf>,
    long_lived: bool,
}

/// How the CLI frames its replies on stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputFormat {
    /// Free-form text lines terminated by one JSON result line.
    Text,
    /// One JSON object per message.
    Json,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PermissionMode {
    Standard,
    BypassPermissions,
}

impl ClaudeCommandBuilder {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            output_format: OutputFormat::Text,
            permission_mode: PermissionMode::Standard,
            allowed_tools: Vec::new(),
            additional_dirs: Vec::new(),
            long_lived: false,
        }
    }

    pub fn with_text_output(mut self) -> Self {
        self.output_format = OutputFormat::Text;
        self
    }

    pub fn with_json_output(mut self) -> Self {
        self.output_format = OutputFormat::Json;
        self
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub fn with_allowed_tools(mut self, tools: Vec<impl Into<String>>) -> Self {
        self.allowed_tools = tools.into_iter().map(|t| t.into()).collect();
        self
    }

    pub fn add_allowed_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.additional_dirs.push(path.into());
        self
    }

    /// Keep stdin open and accept one command per line instead of
    /// exiting after the first reply.
    pub fn long_lived(mut self) -> Self {
        self.long_lived = true;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.binary_path.is_empty() {
            return Err("Binary path cannot be empty".to_string());
        }
        for tool in &self.allowed_tools {
            if tool.is_empty() {
                return Err("Tool name cannot be empty".to_string());
            }
        }
        Ok(())
    }

    /// Final `(program, args)` pair. Spawning (cwd, stdio, process
    /// group) is the session's business.
    pub fn build(self) -> (String, Vec<String>) {
        let mut args = vec!["--print".to_string()];

        args.push("--output-format".to_string());
        args.push(
            match self.output_format {
                OutputFormat::Text => "text",
                OutputFormat::Json => "json",
            }
            .to_string(),
        );

        args.push("--permission-mode".to_string());
        args.push(
            match self.permission_mode {
                PermissionMode::Standard => "default",
                PermissionMode::BypassPermissions => "bypassPermissions",
            }
            .to_string(),
        );

        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.allowed_tools.join(","));
        }

        for dir in &self.additional_dirs {
            args.push("--add-dir".to_string());
            args.push(dir.to_string_lossy().to_string());
        }

        if self.long_lived {
            args.push("--input-format".to_string());
            args.push("text".to_string());
        }

        (self.binary_path, args)
    }
}
