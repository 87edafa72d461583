//! Wire protocol shared by the controller and the launcher.
//!
//! Messages travel as single-line UTF-8 JSON, one message per line. Every
//! message is self-describing through its `kind` field. Stdio content is
//! always text; producers convert captured bytes with UTF-8 replacement
//! before a message is built, so a decoded message never carries binary.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure to encode or decode a wire message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed wire message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("empty wire frame")]
    EmptyFrame,
}

/// One observed command call.
///
/// The launcher populates everything up to `env`; `stdout`, `stderr`,
/// `exit_code` and `timestamp` are filled in by the controller once the
/// response is determined, immediately before the journal append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub invocation_id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Invocation {
    pub fn new(
        invocation_id: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        stdin: String,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            command: command.into(),
            args,
            stdin,
            env,
            stdout: None,
            stderr: None,
            exit_code: None,
            timestamp: None,
        }
    }

    /// Tuple-like rendering used throughout diagnostics: `git('clone', 'repo')`.
    pub fn display_call(&self) -> String {
        format_call(&self.command, &self.args)
    }
}

/// Render a command and its arguments in the tuple-like diagnostic form.
pub fn format_call(command: &str, args: &[String]) -> String {
    let rendered: Vec<String> = args.iter().map(|arg| format!("'{arg}'")).collect();
    format!("{command}({})", rendered.join(", "))
}

/// Instruction to a launcher to run the real executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassthroughRequest {
    pub invocation_id: String,
    /// PATH-like string to search for the real binary (the original PATH
    /// minus the shim directory).
    pub lookup_path: String,
    #[serde(default)]
    pub extra_env: BTreeMap<String, String>,
    /// Wall-clock budget for the real execution, in seconds.
    pub timeout: f64,
}

impl PassthroughRequest {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.max(0.0))
    }
}

/// What a launcher observed when running the real executable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassthroughResult {
    pub invocation_id: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    pub exit_code: i32,
}

/// Behavior the launcher applies after a round-trip.
///
/// Either a static reply (write `stdout`/`stderr`, merge `env`, exit with
/// `exit_code`) or a `passthrough` instruction, never both.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passthrough: Option<PassthroughRequest>,
}

impl CommandResponse {
    pub fn text(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            ..Self::default()
        }
    }

    /// Failure reply used when the controller cannot honor a request.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::text("", message.into(), 1)
    }
}

/// Every message kind that crosses the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WireMessage {
    /// Launcher → controller: a fresh command call.
    Invocation(Invocation),
    /// Launcher → controller: outcome of a passthrough execution.
    PassthroughResult(PassthroughResult),
    /// Controller → launcher: behavior to apply.
    Response(CommandResponse),
}

impl WireMessage {
    /// Encode as one newline-terminated JSON line.
    pub fn encode_line(&self) -> Result<String, ProtocolError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode a single line; surrounding whitespace is tolerated.
    pub fn decode_line(line: &str) -> Result<Self, ProtocolError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }
        Ok(serde_json::from_str(trimmed)?)
    }
}
