//! BlockExecutor - Mediates blocking step execution semantics
//!
//! Every command block runs the same sequence: cancellation checkpoint, send,
//! completion wait (serial link only), then the interruptible post-command
//! delay. Value blocks go through the same transport and hand a decoded
//! [`Value`] back to the interpreter.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use crate::{
    cancel::ExecutionContext,
    codec::WireCommand,
    config::Config,
    json_output::{ConsoleEvent, ErrorEvent, RunEvent, RunStatus, StepStatus, StepStatusEvent},
    plan::{self, Action, Step},
    policy::CompletionOutcome,
    resolver::{has_relative, resolve, JointEdit, JointState, ResolveMode},
    response::{parse_joint_angles, parse_scalar, FrameDecoder, GESTURE_UNKNOWN},
    script::Value,
    serial_log::SerialLog,
    skills::SkillRegistry,
    telemetry::{NoOpTelemetry, TelemetryPublisher},
    transport::{FrameKey, FrameSource, TokenWaiter, Transport, TransportMode},
    BlockError, Result,
};

/// How long a camera read waits for a frame newer than the last one seen
const CAMERA_FRAME_TIMEOUT: Duration = Duration::from_millis(1_000);
/// How long a gesture read waits for a new frame before reporting -1
const GESTURE_FRAME_TIMEOUT: Duration = Duration::from_millis(500);

/// Terminal state of one executed step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Sent and returned; no completion wait applied
    Completed,
    Acknowledged,
    /// Completion token did not arrive in time; execution continued
    TimedOut,
    Skipped,
    /// Send failed and the step was dropped
    Failed,
}

/// Per-run device mode state
#[derive(Debug, Default)]
struct SessionState {
    camera_activated: bool,
    camera_polled: bool,
    gesture_activated: bool,
    gesture_polled: bool,
    last_camera_key: Option<FrameKey>,
    last_gesture_key: Option<FrameKey>,
}

/// BlockExecutor handles blocking execution semantics for planned steps and reads
pub struct BlockExecutor {
    transport: Arc<dyn Transport>,
    waiter: Option<Arc<dyn TokenWaiter>>,
    frames: Option<Arc<dyn FrameSource>>,
    telemetry: Arc<dyn TelemetryPublisher>,
    config: Config,
    skills: SkillRegistry,
    ctx: ExecutionContext,
    decoder: FrameDecoder,
    session: SessionState,
    run_id: String,
    step_count: u32,
}

impl BlockExecutor {
    /// Create an executor driving `transport`
    pub fn new(transport: Arc<dyn Transport>, config: Config) -> Result<Self> {
        let ctx = ExecutionContext::with_check_interval(config.execution.check_interval());
        Ok(Self {
            transport,
            waiter: None,
            frames: None,
            telemetry: Arc::new(NoOpTelemetry),
            config,
            skills: SkillRegistry::new(),
            ctx,
            decoder: FrameDecoder::new()?,
            session: SessionState::default(),
            run_id: Uuid::new_v4().to_string(),
            step_count: 0,
        })
    }

    /// Use the shared serial log for completion tokens and sensor frames
    pub fn with_serial_log(mut self, log: Arc<SerialLog>) -> Self {
        self.waiter = Some(log.clone());
        self.frames = Some(log);
        self
    }

    pub fn with_token_waiter(mut self, waiter: Arc<dyn TokenWaiter>) -> Self {
        self.waiter = Some(waiter);
        self
    }

    pub fn with_frame_source(mut self, frames: Arc<dyn FrameSource>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn with_skills(mut self, skills: SkillRegistry) -> Self {
        self.skills = skills;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryPublisher>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Share an externally owned stop flag
    pub fn with_context(mut self, ctx: ExecutionContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn skills(&self) -> &SkillRegistry {
        &self.skills
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn steps_executed(&self) -> u32 {
        self.step_count
    }

    fn is_serial(&self) -> bool {
        self.transport.mode() == TransportMode::Serial
    }

    /// Reset per-run state before a new script starts, including an earlier stop request
    pub async fn begin_run(&mut self) {
        self.ctx.reset();
        self.session = SessionState::default();
        self.run_id = Uuid::new_v4().to_string();
        self.step_count = 0;
        info!("Starting run {} ({:?} transport)", self.run_id, self.transport.mode());
        let event = RunEvent::new(&self.run_id, RunStatus::Started, 0, None);
        if let Err(e) = self.telemetry.publish_run(&event).await {
            warn!("Failed to publish run event: {}", e);
        }
    }

    /// Report how a run ended
    pub async fn end_run(&mut self, result: &Result<()>) {
        let (status, message) = match result {
            Ok(()) => (RunStatus::Finished, None),
            Err(e) if e.is_cancelled() => (RunStatus::Stopped, Some(e.to_string())),
            Err(e) => (RunStatus::Failed, Some(e.to_string())),
        };
        info!("Run {} ended: {:?} after {} steps", self.run_id, status, self.step_count);
        let event = RunEvent::new(&self.run_id, status, self.step_count, message);
        if let Err(e) = self.telemetry.publish_run(&event).await {
            warn!("Failed to publish run event: {}", e);
        }
    }

    async fn publish_step(&self, event: StepStatusEvent) {
        if let Err(e) = self.telemetry.publish_step(&event).await {
            warn!("Failed to publish step event: {}", e);
        }
    }

    async fn publish_error(&self, step_id: Option<u32>, message: &str) {
        if let Err(e) = self.telemetry.publish_error(&ErrorEvent::new(message, step_id)).await {
            warn!("Failed to publish error event: {}", e);
        }
    }

    /// Print a line to the script console
    pub async fn console(&self, text: &str) {
        info!("[console] {}", text);
        if let Err(e) = self.telemetry.publish_console(&ConsoleEvent::new(text)).await {
            warn!("Failed to publish console event: {}", e);
        }
    }

    fn step_event(&self, id: u32, step: &Step, status: StepStatus, message: &str) -> StepStatusEvent {
        StepStatusEvent::new(&self.run_id, id, status, message).with_command(&step.label, step.family)
    }

    /// Execute one planned step: check, send, wait, delay
    pub async fn execute_step(&mut self, step: &Step) -> Result<StepOutcome> {
        self.ctx.check()?;
        self.step_count += 1;
        let id = self.step_count;
        debug!("Step {}: {} ({:?})", id, step.label, step.family);

        let outcome = match &step.action {
            Action::Send(command) => self.send_and_wait(id, step, command).await?,
            Action::SendWithFallback { primary, fallback } => {
                self.send_with_fallback(id, step, primary, fallback).await?
            }
            Action::JointMove { token, edits, mode } => self.joint_move(id, step, token, edits, *mode).await?,
            Action::Connect(address) => self.connect(id, step, address).await?,
            Action::Delay => {
                info!("Delaying {}ms", step.delay.as_millis());
                self.publish_step(self.step_event(id, step, StepStatus::Completed, "Delay")).await;
                StepOutcome::Completed
            }
            Action::Skip(reason) => {
                info!("Skipping step {}: {}", id, reason);
                self.console(reason).await;
                self.publish_step(self.step_event(id, step, StepStatus::Skipped, reason)).await;
                StepOutcome::Skipped
            }
        };

        if outcome != StepOutcome::Failed {
            self.ctx.sleep(step.delay).await?;
        }
        Ok(outcome)
    }

    /// Report a failed send. Only aborts the run when configured to.
    async fn send_failed(&self, id: u32, step: &Step, e: BlockError) -> Result<StepOutcome> {
        error!("Step {} ({}) failed: {}", id, step.label, e);
        self.publish_step(self.step_event(id, step, StepStatus::Failed, &e.to_string())).await;
        self.publish_error(Some(id), &e.to_string()).await;
        if self.config.execution.abort_on_send_failure() {
            return Err(e);
        }
        Ok(StepOutcome::Failed)
    }

    async fn send_and_wait(&mut self, id: u32, step: &Step, command: &WireCommand) -> Result<StepOutcome> {
        self.ctx.check()?;
        // Cursor taken before the send so an earlier echo of the token cannot satisfy the wait
        let mark = self.waiter.as_ref().map(|w| w.mark());

        self.publish_step(self.step_event(id, step, StepStatus::Sent, "Command sent")).await;
        if let Err(e) = self.transport.send(command, step.policy.send_timeout, true).await {
            return self.send_failed(id, step, e).await;
        }
        self.await_completion(id, step, mark).await
    }

    async fn await_completion(&self, id: u32, step: &Step, mark: Option<u64>) -> Result<StepOutcome> {
        let (Some(wait), Some(waiter), Some(mark)) = (step.policy.wait, &self.waiter, mark) else {
            self.publish_step(self.step_event(id, step, StepStatus::Completed, "Command returned")).await;
            return Ok(StepOutcome::Completed);
        };
        if !self.is_serial() {
            self.publish_step(self.step_event(id, step, StepStatus::Completed, "Command returned")).await;
            return Ok(StepOutcome::Completed);
        }

        debug!("Waiting up to {}ms for '{}'", wait.timeout.as_millis(), wait.token);
        let outcome = self
            .ctx
            .guard(waiter.wait_for_token(wait.token, mark, wait.timeout))
            .await?;
        match outcome {
            CompletionOutcome::Acknowledged => {
                let message = format!("Completion token '{}' received", wait.token);
                self.publish_step(self.step_event(id, step, StepStatus::Acknowledged, &message)).await;
                Ok(StepOutcome::Acknowledged)
            }
            CompletionOutcome::TimedOut => {
                let message = format!(
                    "No completion token '{}' within {}ms",
                    wait.token,
                    wait.timeout.as_millis()
                );
                warn!("Step {} ({}): {}", id, step.label, message);
                self.publish_step(self.step_event(id, step, StepStatus::TimedOut, &message)).await;
                Ok(StepOutcome::TimedOut)
            }
        }
    }

    async fn send_with_fallback(
        &mut self,
        id: u32,
        step: &Step,
        primary: &WireCommand,
        fallback: &[WireCommand],
    ) -> Result<StepOutcome> {
        self.ctx.check()?;
        let mark = self.waiter.as_ref().map(|w| w.mark());
        self.publish_step(self.step_event(id, step, StepStatus::Sent, "Command sent")).await;

        match self.transport.send(primary, step.policy.send_timeout, true).await {
            Ok(_) => self.await_completion(id, step, mark).await,
            Err(e) => {
                warn!("Sending {} failed ({}), falling back to {} single notes", step.label, e, fallback.len());
                self.publish_error(Some(id), &format!("Tone list send failed: {}", e)).await;
                for note in fallback {
                    self.ctx.check()?;
                    if let Err(e) = self.transport.send(note, plan::NOTE_TIMEOUT, true).await {
                        return self.send_failed(id, step, e).await;
                    }
                }
                self.publish_step(self.step_event(id, step, StepStatus::Completed, "Sent as single notes")).await;
                Ok(StepOutcome::Completed)
            }
        }
    }

    /// Current joint angles as the baseline for relative edits; zeros when the query fails
    async fn query_joint_state(&self) -> Result<JointState> {
        self.ctx.check()?;
        let timeout = self.config.timeouts.joint_query();
        match self.transport.send(&plan::all_joints_query(), timeout, true).await {
            Ok(reply) => {
                let angles = parse_joint_angles(&reply);
                if angles.is_empty() {
                    warn!("Joint query returned no angles, using zero baseline");
                }
                Ok(JointState::from_angles(&angles))
            }
            Err(e) => {
                warn!("Joint query failed ({}), using zero baseline", e);
                Ok(JointState::default())
            }
        }
    }

    async fn joint_move(
        &mut self,
        id: u32,
        step: &Step,
        token: &str,
        edits: &[JointEdit],
        mode: ResolveMode,
    ) -> Result<StepOutcome> {
        let baseline = if has_relative(edits) {
            self.query_joint_state().await?
        } else {
            JointState::default()
        };
        let pairs = resolve(&baseline, edits, mode);
        if pairs.is_empty() {
            let reason = "No joint within range to move";
            self.publish_step(self.step_event(id, step, StepStatus::Skipped, reason)).await;
            return Ok(StepOutcome::Skipped);
        }

        let command = plan::joint_move_command(token, &pairs);
        info!("Joint move: {}", command);
        let resolved = Step {
            label: command.to_string(),
            ..step.clone()
        };
        self.send_and_wait(id, &resolved, &command.encode()).await
    }

    async fn connect(&mut self, id: u32, step: &Step, address: &str) -> Result<StepOutcome> {
        self.ctx.check()?;
        match self.transport.connect(address).await {
            Ok(true) => {
                info!("Connected to {}", address);
                self.console(&format!("Connected to {}", address)).await;
                self.publish_step(self.step_event(id, step, StepStatus::Completed, "Connected")).await;
                Ok(StepOutcome::Completed)
            }
            Ok(false) => {
                warn!("Connection to {} failed", address);
                self.console(&format!("Connection to {} failed", address)).await;
                self.publish_step(self.step_event(id, step, StepStatus::Failed, "Connection failed")).await;
                Ok(StepOutcome::Failed)
            }
            Err(e) => self.send_failed(id, step, e).await,
        }
    }

    /// Send a query and return its reply; `None` when the send failed and the run continues
    async fn query(&mut self, command: &WireCommand, timeout: Duration) -> Result<Option<String>> {
        self.ctx.check()?;
        match self.transport.send(command, timeout, true).await {
            Ok(reply) => Ok(Some(reply)),
            Err(e) => {
                error!("Query {} failed: {}", command, e);
                self.publish_error(None, &format!("Query {} failed: {}", command, e)).await;
                if self.config.execution.abort_on_send_failure() {
                    return Err(e);
                }
                Ok(None)
            }
        }
    }

    async fn debug_print(&self, value: &Value) {
        if self.config.execution.debug() {
            self.console(&value.to_string()).await;
        }
    }

    /// Read a single number; a failed query reads as 0
    pub async fn read_scalar(&mut self, command: &WireCommand) -> Result<Value> {
        let timeout = self.config.timeouts.sensor();
        let value = match self.query(command, timeout).await? {
            Some(reply) => parse_scalar(&reply),
            None => 0,
        };
        let value = Value::Number(value as f64);
        self.debug_print(&value).await;
        Ok(value)
    }

    /// Read all joint angles as a list
    pub async fn read_all_joints(&mut self) -> Result<Value> {
        let timeout = self.config.timeouts.sensor();
        let angles = match self.query(&plan::all_joints_query(), timeout).await? {
            Some(reply) => parse_joint_angles(&reply),
            None => Vec::new(),
        };
        let value = Value::from_ints(&angles);
        self.debug_print(&value).await;
        Ok(value)
    }

    /// Read the camera target as `[x, y, w, h]`, or `[]` when no new frame arrives
    pub async fn read_camera(&mut self) -> Result<Value> {
        self.ctx.check()?;
        let timeout = self.config.timeouts.sensor();
        if !self.session.camera_activated {
            self.query(&plan::mode_query("XCr"), timeout).await?;
            self.session.camera_activated = true;
        }
        self.ctx.check()?;

        let Some(frames) = self.frames.clone() else {
            // Without a mirrored stream the poll reply carries the frame
            let frame = self
                .query(&plan::mode_query("XCP"), timeout)
                .await?
                .and_then(|reply| self.decoder.parse_camera_frame(&reply));
            return Ok(frame.map(|f| Value::from_floats(&f.to_vec())).unwrap_or(Value::List(Vec::new())));
        };

        let previous = self.session.last_camera_key.or_else(|| frames.latest_camera_key());
        if !self.session.camera_polled {
            self.query(&plan::mode_query("XCP"), timeout).await?;
            self.session.camera_polled = true;
        }

        let found = self
            .ctx
            .guard(frames.wait_for_new_camera_frame(previous, CAMERA_FRAME_TIMEOUT))
            .await?;
        match found {
            Some((frame, key)) => {
                self.session.last_camera_key = Some(key);
                let value = Value::from_floats(&frame.to_vec());
                self.debug_print(&value).await;
                Ok(value)
            }
            None => {
                debug!("No new camera frame within {}ms", CAMERA_FRAME_TIMEOUT.as_millis());
                Ok(Value::List(Vec::new()))
            }
        }
    }

    /// Read the recognised gesture, 0..=3, or -1
    pub async fn read_gesture(&mut self) -> Result<Value> {
        self.ctx.check()?;
        let timeout = self.config.timeouts.sensor();
        if !self.session.gesture_activated {
            self.query(&plan::mode_query("XGr"), timeout).await?;
            self.session.gesture_activated = true;
        }
        self.ctx.check()?;

        let Some(frames) = self.frames.clone() else {
            let code = self
                .query(&plan::mode_query("XGP"), timeout)
                .await?
                .map(|reply| self.decoder.parse_gesture(&reply))
                .unwrap_or(GESTURE_UNKNOWN);
            return Ok(Value::Number(code as f64));
        };

        let previous = self.session.last_gesture_key.or_else(|| frames.latest_gesture_key());
        if !self.session.gesture_polled {
            self.query(&plan::mode_query("XGP"), timeout).await?;
            self.session.gesture_polled = true;
        }

        let found = self
            .ctx
            .guard(frames.wait_for_new_gesture(previous, GESTURE_FRAME_TIMEOUT))
            .await?;
        let code = match found {
            Some((frame, key)) => {
                self.session.last_gesture_key = Some(key);
                frame.code()
            }
            None => GESTURE_UNKNOWN,
        };
        let value = Value::Number(code as f64);
        self.debug_print(&value).await;
        Ok(value)
    }
}
