//! Telemetry abstraction for block execution
//!
//! Provides trait-based interface for publishing execution events
//! to any sink (stdout, an editor front end, tests).

use async_trait::async_trait;
use std::sync::Mutex;
use crate::json_output::{self, ConsoleEvent, ErrorEvent, RunEvent, StepStatusEvent};

/// Trait for publishing execution events
///
/// This allows the executor to be embedded behind any front end
/// without being coupled to a specific output channel.
#[async_trait]
pub trait TelemetryPublisher: Send + Sync {
    /// Publish a step status change
    async fn publish_step(&self, event: &StepStatusEvent) -> anyhow::Result<()>;

    /// Publish an error
    async fn publish_error(&self, event: &ErrorEvent) -> anyhow::Result<()>;

    /// Publish a line printed by the script
    async fn publish_console(&self, event: &ConsoleEvent) -> anyhow::Result<()>;

    /// Optional: Publish run start and end
    async fn publish_run(&self, event: &RunEvent) -> anyhow::Result<()> {
        // Default implementation does nothing
        let _ = event;
        Ok(())
    }
}

/// No-operation telemetry publisher
///
/// Default implementation that discards all events.
#[derive(Debug, Clone)]
pub struct NoOpTelemetry;

#[async_trait]
impl TelemetryPublisher for NoOpTelemetry {
    async fn publish_step(&self, _event: &StepStatusEvent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn publish_error(&self, _event: &ErrorEvent) -> anyhow::Result<()> {
        Ok(())
    }

    async fn publish_console(&self, _event: &ConsoleEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Console telemetry publisher
///
/// Prints every event to stdout as one JSON document.
#[derive(Debug, Clone)]
pub struct ConsoleTelemetry {
    pub pretty_print: bool,
}

impl ConsoleTelemetry {
    pub fn new() -> Self {
        Self { pretty_print: false }
    }

    pub fn pretty() -> Self {
        Self { pretty_print: true }
    }

    fn emit<T: serde::Serialize>(&self, event: &T) {
        if self.pretty_print {
            json_output::output_event_pretty(event);
        } else {
            json_output::output_event(event);
        }
    }
}

impl Default for ConsoleTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetryPublisher for ConsoleTelemetry {
    async fn publish_step(&self, event: &StepStatusEvent) -> anyhow::Result<()> {
        self.emit(event);
        Ok(())
    }

    async fn publish_error(&self, event: &ErrorEvent) -> anyhow::Result<()> {
        self.emit(event);
        Ok(())
    }

    async fn publish_console(&self, event: &ConsoleEvent) -> anyhow::Result<()> {
        self.emit(event);
        Ok(())
    }

    async fn publish_run(&self, event: &RunEvent) -> anyhow::Result<()> {
        self.emit(event);
        Ok(())
    }
}

/// Keeps every event in memory as JSON, for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    events: Mutex<Vec<serde_json::Value>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    fn record<T: serde::Serialize>(&self, event: &T) -> anyhow::Result<()> {
        let value = serde_json::to_value(event)?;
        self.events
            .lock()
            .map_err(|e| anyhow::anyhow!("telemetry lock poisoned: {}", e))?
            .push(value);
        Ok(())
    }

    pub fn events(&self) -> Vec<serde_json::Value> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Events of one `type`
    pub fn of_type(&self, event_type: &str) -> Vec<serde_json::Value> {
        self.events()
            .into_iter()
            .filter(|e| e["type"] == event_type)
            .collect()
    }

    /// Statuses of all step events, in order
    pub fn step_statuses(&self) -> Vec<String> {
        self.of_type("step_status")
            .iter()
            .filter_map(|e| e["status"].as_str().map(str::to_string))
            .collect()
    }

    /// Text of all console events, in order
    pub fn console_lines(&self) -> Vec<String> {
        self.of_type("console")
            .iter()
            .filter_map(|e| e["text"].as_str().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl TelemetryPublisher for MemoryTelemetry {
    async fn publish_step(&self, event: &StepStatusEvent) -> anyhow::Result<()> {
        self.record(event)
    }

    async fn publish_error(&self, event: &ErrorEvent) -> anyhow::Result<()> {
        self.record(event)
    }

    async fn publish_console(&self, event: &ConsoleEvent) -> anyhow::Result<()> {
        self.record(event)
    }

    async fn publish_run(&self, event: &RunEvent) -> anyhow::Result<()> {
        self.record(event)
    }
}
