//! Contracts for the collaborators that talk to the robot
//!
//! The execution core never opens sockets or serial ports itself. It drives a
//! `Transport`, waits for completion tokens through a `TokenWaiter` and reads
//! mirrored sensor frames from a `FrameSource`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;
use crate::{
    codec::WireCommand,
    policy::CompletionOutcome,
    response::{CameraFrame, GestureFrame},
    serial_log::SerialLog,
    BlockError, Result,
};

/// How the robot is attached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Request/response link; a request returns once the device has finished
    Network,
    /// Streaming link; a request returns as soon as the bytes are written
    Serial,
}

impl std::str::FromStr for TransportMode {
    type Err = BlockError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "network" | "wifi" => Ok(TransportMode::Network),
            "serial" => Ok(TransportMode::Serial),
            other => Err(BlockError::Config(format!("Unknown transport mode: {}", other))),
        }
    }
}

/// Request-based link to the robot
#[async_trait]
pub trait Transport: Send + Sync {
    fn mode(&self) -> TransportMode;

    /// Send one command and return the device reply (or an acknowledgement text)
    async fn send(&self, command: &WireCommand, timeout: Duration, expect_response: bool) -> Result<String>;

    /// Establish a connection to the given address
    async fn connect(&self, address: &str) -> Result<bool> {
        let _ = address;
        Ok(true)
    }
}

/// Waits for completion token lines on a streaming link
#[async_trait]
pub trait TokenWaiter: Send + Sync {
    /// Position to pass to `wait_for_token`, taken before a command is sent
    fn mark(&self) -> u64;

    /// Wait for a line consisting of `token` that arrived after `after`
    async fn wait_for_token(&self, token: char, after: u64, timeout: Duration) -> CompletionOutcome;
}

/// Opaque marker of one captured sensor frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameKey(pub u64);

/// Sensor frames mirrored from the device by an asynchronous listener
#[async_trait]
pub trait FrameSource: Send + Sync {
    fn latest_camera_key(&self) -> Option<FrameKey>;

    fn latest_gesture_key(&self) -> Option<FrameKey>;

    /// Wait for a camera frame whose key differs from `previous`
    async fn wait_for_new_camera_frame(
        &self,
        previous: Option<FrameKey>,
        timeout: Duration,
    ) -> Option<(CameraFrame, FrameKey)>;

    /// Wait for a gesture frame whose key differs from `previous`
    async fn wait_for_new_gesture(
        &self,
        previous: Option<FrameKey>,
        timeout: Duration,
    ) -> Option<(GestureFrame, FrameKey)>;
}

/// Stand-in robot for dry runs and tests.
///
/// Replies follow the firmware simulator: `?` answers with a model name,
/// input reads answer `123`, everything else `0`. Scripted replies, failures
/// and serial echo lines can be layered on top by command prefix.
pub struct MockTransport {
    mode: TransportMode,
    responses: Vec<(String, String)>,
    failures: Vec<String>,
    echoes: Vec<(String, String)>,
    log: Option<Arc<SerialLog>>,
    sent: Mutex<Vec<WireCommand>>,
    connections: Mutex<Vec<String>>,
}

impl MockTransport {
    pub fn new(mode: TransportMode) -> Self {
        Self {
            mode,
            responses: Vec::new(),
            failures: Vec::new(),
            echoes: Vec::new(),
            log: None,
            sent: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Reply with `response` to commands starting with `prefix`
    pub fn respond(mut self, prefix: &str, response: &str) -> Self {
        self.responses.push((prefix.to_string(), response.to_string()));
        self
    }

    /// Fail every command starting with `prefix`
    pub fn fail(mut self, prefix: &str) -> Self {
        self.failures.push(prefix.to_string());
        self
    }

    /// Append `line` to the serial log after sending a command starting with `prefix`
    pub fn echo(mut self, prefix: &str, line: &str) -> Self {
        self.echoes.push((prefix.to_string(), line.to_string()));
        self
    }

    pub fn with_log(mut self, log: Arc<SerialLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Everything sent so far, in order
    pub fn sent(&self) -> Vec<WireCommand> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Sent commands in their transport text form
    pub fn sent_text(&self) -> Vec<String> {
        self.sent().iter().map(|c| c.to_string()).collect()
    }

    pub fn connections(&self) -> Vec<String> {
        self.connections.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Key used for prefix matching; binary frames match on their raw characters
    fn match_key(command: &WireCommand) -> String {
        match command {
            WireCommand::Text(text) => text.clone(),
            WireCommand::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    fn default_reply(key: &str) -> &'static str {
        if key == "?" {
            "PetoiModel-v1.0"
        } else if key.starts_with("Ra") || key.starts_with("Rd") || key.starts_with("i ") || key.contains(" ?") {
            "123"
        } else {
            "0"
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn mode(&self) -> TransportMode {
        self.mode
    }

    async fn send(&self, command: &WireCommand, _timeout: Duration, expect_response: bool) -> Result<String> {
        let key = Self::match_key(command);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(command.clone());
        }
        debug!("[MOCK] {}", command);

        if self.failures.iter().any(|prefix| key.starts_with(prefix.as_str())) {
            return Err(BlockError::Transport(format!("Simulated failure for {}", command)));
        }

        if let Some(log) = &self.log {
            for (prefix, line) in &self.echoes {
                if key.starts_with(prefix.as_str()) {
                    log.append(&format!("{}\n", line));
                }
            }
        }

        if !expect_response {
            return Ok(String::new());
        }
        let reply = self
            .responses
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| Self::default_reply(&key).to_string());
        Ok(reply)
    }

    async fn connect(&self, address: &str) -> Result<bool> {
        if let Ok(mut connections) = self.connections.lock() {
            connections.push(address.to_string());
        }
        Ok(!self.failures.iter().any(|prefix| address.starts_with(prefix.as_str())))
    }
}
