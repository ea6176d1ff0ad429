//! JSON Output for block execution
//!
//! Provides structured JSON output for step status, console messages and
//! errors that can be consumed by an editor front end or other tooling.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use crate::policy::CommandFamily;

/// Get current timestamp as f64 seconds since UNIX epoch with consistent precision
pub fn current_timestamp() -> f64 {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();

    // Round to 6 decimal places for consistent formatting
    (timestamp * 1_000_000.0).round() / 1_000_000.0
}

/// Step execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Sent,
    /// Returned without a completion wait
    Completed,
    Acknowledged,
    TimedOut,
    Skipped,
    Failed,
}

/// Step status event output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatusEvent {
    pub timestamp: f64,
    /// Event type for JSON parsing
    #[serde(rename = "type")]
    pub event_type: String,
    pub run_id: String,
    /// Sequence number of the step within the run
    pub step_id: u32,
    pub status: StepStatus,
    pub message: String,
    /// Human-readable command (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<CommandFamily>,
}

/// Error event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Associated step if applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<u32>,
    pub error: String,
}

/// Text printed by a script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Finished,
    Stopped,
    Failed,
}

/// Start and end of a script run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub timestamp: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub run_id: String,
    pub status: RunStatus,
    /// Steps executed so far
    pub steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StepStatusEvent {
    pub fn new(run_id: &str, step_id: u32, status: StepStatus, message: &str) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "step_status".to_string(),
            run_id: run_id.to_string(),
            step_id,
            status,
            message: message.to_string(),
            command: None,
            family: None,
        }
    }

    pub fn with_command(mut self, command: &str, family: CommandFamily) -> Self {
        self.command = Some(command.to_string());
        self.family = Some(family);
        self
    }
}

impl ErrorEvent {
    /// Create a new error event
    pub fn new(error: &str, step_id: Option<u32>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "error".to_string(),
            step_id,
            error: error.to_string(),
        }
    }
}

impl ConsoleEvent {
    pub fn new(text: &str) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "console".to_string(),
            text: text.to_string(),
        }
    }
}

impl RunEvent {
    pub fn new(run_id: &str, status: RunStatus, steps: u32, message: Option<String>) -> Self {
        Self {
            timestamp: current_timestamp(),
            event_type: "run".to_string(),
            run_id: run_id.to_string(),
            status,
            steps,
            message,
        }
    }
}

/// Output a JSON event to stdout
pub fn output_event<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        println!("{}", json);
    }
}

/// Output a JSON event to stdout, indented
pub fn output_event_pretty<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string_pretty(event) {
        println!("{}", json);
    }
}

/// Convenience functions for outputting specific event types
pub mod output {
    use super::*;

    /// Output an encoded command for the `encode` subcommand
    pub fn encoded(command: &str, wire: &str, base64: &str) {
        output_event(&serde_json::json!({
            "timestamp": current_timestamp(),
            "type": "encoded",
            "command": command,
            "wire": wire,
            "base64": base64,
        }));
    }

    /// Output a decoded response for the `decode` subcommand
    pub fn decoded(shape: &str, value: serde_json::Value) {
        output_event(&serde_json::json!({
            "timestamp": current_timestamp(),
            "type": "decoded",
            "shape": shape,
            "value": value,
        }));
    }

    /// Output an error not tied to a step
    pub fn error(error_msg: &str) {
        output_event(&ErrorEvent::new(error_msg, None));
    }
}
