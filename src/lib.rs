//! Petoi Blocks - block program execution core for OpenCat robots
//!
//! This library turns block programs (gait, posture, joint, sound, sensor
//! and IO blocks with loops and variables) into firmware commands and runs
//! them over a request-based transport, waiting for the device's completion
//! tokens on a serial link and staying responsive to a stop request.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use petoi_blocks::{BlockExecutor, Config, Interpreter, MockTransport, Program, TransportMode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_from_path("config/default_config.yaml")?;
//!     let transport = Arc::new(MockTransport::new(TransportMode::Network));
//!     let executor = BlockExecutor::new(transport, config)?;
//!
//!     let program = Program::from_json(r#"{"blocks": [{"block": "posture", "command": "ksit"}]}"#)?;
//!     Interpreter::new(executor).run(&program).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **codec / response**: command encoding and reply decoding
//! - **resolver**: relative joint edits against the device's joint state
//! - **policy**: completion token and timeouts per command family
//! - **plan**: block to step planning
//! - **BlockExecutor**: check, send, wait, delay
//! - **Interpreter**: statements, loops, variables and value blocks
//! - **SerialLog**: shared serial output for token waits and sensor frames
//! - **TelemetryPublisher**: transport-agnostic event sink

pub mod block_executor;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod error;
pub mod interpreter;
pub mod json_output;
pub mod plan;
pub mod policy;
pub mod resolver;
pub mod response;
pub mod script;
pub mod serial_log;
pub mod skills;
pub mod telemetry;
pub mod transport;

// High-level exports for easy usage
pub use block_executor::{BlockExecutor, StepOutcome};
pub use cancel::ExecutionContext;
pub use config::Config;
pub use error::{BlockError, Result};
pub use interpreter::Interpreter;
pub use script::{Expr, Program, Statement, Value};
pub use serial_log::SerialLog;
pub use telemetry::{ConsoleTelemetry, MemoryTelemetry, NoOpTelemetry, TelemetryPublisher};
pub use transport::{FrameKey, FrameSource, MockTransport, TokenWaiter, Transport, TransportMode};

// Core component exports for advanced usage
pub use codec::{decode_envelope, encode, Command, Encoding, WireCommand};
pub use json_output::{ConsoleEvent, ErrorEvent, RunEvent, RunStatus, StepStatus, StepStatusEvent};
pub use plan::{Action, Step};
pub use policy::{CommandFamily, CompletionOutcome, FamilyPolicy, WaitPolicy};
pub use resolver::{JointEdit, JointState, ResolveMode};
pub use response::{CameraFrame, FrameDecoder, GestureFrame};
pub use skills::{Skill, SkillRegistry};
