//! Script interpreter
//!
//! Walks a [`Program`] in order, evaluating value blocks and handing command
//! blocks to the [`BlockExecutor`] as planned steps. Loops observe the stop
//! request once per iteration, before the body runs.

use futures::future::{BoxFuture, FutureExt};
use rand::Rng;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use crate::{
    block_executor::{BlockExecutor, StepOutcome},
    plan,
    policy::CommandFamily,
    script::{flat_params, joint_edits, ArithOp, CompareOp, Expr, LogicOp, LoopMode, Program, Statement, Value},
    BlockError, Result,
};

/// Default analog output level when the value block is empty
const DEFAULT_ANALOG_VALUE: i64 = 128;

/// Runs block programs against one executor
pub struct Interpreter {
    executor: BlockExecutor,
    variables: HashMap<String, Value>,
}

impl Interpreter {
    pub fn new(executor: BlockExecutor) -> Self {
        Self {
            executor,
            variables: HashMap::new(),
        }
    }

    pub fn executor(&self) -> &BlockExecutor {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut BlockExecutor {
        &mut self.executor
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Run a whole program. Returns `Err(BlockError::Cancelled)` when stopped.
    pub async fn run(&mut self, program: &Program) -> Result<()> {
        self.variables.clear();
        self.executor.begin_run().await;
        if let Some(name) = &program.name {
            info!("Running program '{}' ({} blocks)", name, program.blocks.len());
        }
        let result = self.exec_block(&program.blocks).await;
        match &result {
            Err(e) if e.is_cancelled() => info!("Execution stopped by user"),
            Err(e) => warn!("Execution failed: {}", e),
            Ok(()) => debug!("Program finished"),
        }
        self.executor.end_run(&result).await;
        result
    }

    fn exec_block<'a>(&'a mut self, statements: &'a [Statement]) -> BoxFuture<'a, Result<()>> {
        async move {
            for statement in statements {
                self.exec(statement).await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Run a loop body after the per-iteration stop check
    async fn iteration(&mut self, body: &[Statement]) -> Result<()> {
        self.executor.context().check_in_loop().await?;
        self.exec_block(body).await
    }

    async fn step(&mut self, step: plan::Step) -> Result<StepOutcome> {
        self.executor.execute_step(&step).await
    }

    fn exec<'a>(&'a mut self, statement: &'a Statement) -> BoxFuture<'a, Result<()>> {
        async move {
            let timeouts = self.executor.config().timeouts.clone();
            match statement {
                Statement::Gait { command, delay } => {
                    self.step(plan::skill_command(CommandFamily::Gait, command, *delay, &timeouts)).await?;
                }
                Statement::Posture { command, delay } => {
                    self.step(plan::skill_command(CommandFamily::Posture, command, *delay, &timeouts)).await?;
                }
                Statement::AcrobaticMoves { command, delay } => {
                    self.step(plan::skill_command(CommandFamily::AcrobaticMove, command, *delay, &timeouts))
                        .await?;
                }
                Statement::ArmAction { command, delay } => {
                    self.step(plan::skill_command(CommandFamily::ArmAction, command, *delay, &timeouts)).await?;
                }
                Statement::PlayToneList { tones, delay } => {
                    self.step(plan::tone_list(tones, *delay, &timeouts)).await?;
                }
                Statement::PlayNote { note, duration } => {
                    self.step(plan::note(*note, *duration)).await?;
                }
                Statement::PlayMelody { notes, delay } => {
                    self.step(plan::melody(notes, *delay, &timeouts)).await?;
                }
                Statement::DelayMs { delay } => {
                    self.executor.context().check()?;
                    self.executor.console(&format!("Delay {} seconds", delay)).await;
                    self.step(plan::delay(*delay)).await?;
                }
                Statement::GyroControl { enabled } => {
                    self.step(plan::gyro(*enabled, &timeouts)).await?;
                }
                Statement::SendCustomCommand { command, delay } => {
                    let command = self.eval(command).await?.to_string();
                    self.step(plan::custom(&command, *delay, &timeouts)).await?;
                }
                Statement::SetJointsAngleSeq { joints, delay } | Statement::SetJointAngle { joints, delay } => {
                    let edits = joint_edits(&self.eval(joints).await?);
                    self.step(plan::joint_move(CommandFamily::JointSequence, edits, *delay, &timeouts))
                        .await?;
                }
                Statement::SetJointsAngleSim { joints, delay } => {
                    let edits = joint_edits(&self.eval(joints).await?);
                    self.step(plan::joint_move(CommandFamily::JointSimultaneous, edits, *delay, &timeouts))
                        .await?;
                }
                Statement::SetJointsAngleSimRaw { joints, delay } => {
                    let params = flat_params(&self.eval(joints).await?);
                    self.step(plan::joint_raw(params, *delay, &timeouts)).await?;
                }
                Statement::ActionSkillFile { file, delay } => {
                    let step = plan::skill_file(file, self.executor.skills(), *delay, &timeouts);
                    self.step(step).await?;
                }
                Statement::MakeConnection { address } => {
                    self.step(plan::connect(address)).await?;
                }
                Statement::SetAnalogOutput { pin, value } => {
                    let value = self.eval(value).await?.as_int().unwrap_or(DEFAULT_ANALOG_VALUE);
                    self.step(plan::analog_output(*pin, value, &timeouts)).await?;
                }
                Statement::SetDigitalOutput { pin, state } => {
                    self.step(plan::digital_output(*pin, *state, &timeouts)).await?;
                }
                Statement::ConsoleLog { value } => {
                    let value = self.eval(value).await?;
                    self.executor.console(&value.to_string()).await;
                }
                Statement::SetVariable { name, value } => {
                    let value = self.eval(value).await?;
                    debug!("{} = {}", name, value);
                    self.variables.insert(name.clone(), value);
                }
                Statement::Evaluate { value } => {
                    self.eval(value).await?;
                }
                Statement::Repeat { times, body } => {
                    let times = self.eval(times).await?.as_int().unwrap_or(0).max(0);
                    for _ in 0..times {
                        self.iteration(body).await?;
                    }
                }
                Statement::WhileUntil { mode, condition, body } => loop {
                    let holds = self.eval(condition).await?.truthy();
                    let keep_going = match mode {
                        LoopMode::While => holds,
                        LoopMode::Until => !holds,
                    };
                    if !keep_going {
                        break;
                    }
                    self.iteration(body).await?;
                },
                Statement::For { var, from, to, by, body } => {
                    let from = self.eval(from).await?.as_number().unwrap_or(0.0);
                    let to = self.eval(to).await?.as_number().unwrap_or(0.0);
                    let by = match by {
                        Some(by) => self.eval(by).await?.as_number().unwrap_or(1.0),
                        None => 1.0,
                    };
                    if by == 0.0 || !by.is_finite() {
                        return Err(BlockError::Script(format!("Loop over '{}' has step {}", var, by)));
                    }
                    let mut current = from;
                    while (by > 0.0 && current <= to) || (by < 0.0 && current >= to) {
                        self.variables.insert(var.clone(), Value::Number(current));
                        self.iteration(body).await?;
                        current += by;
                    }
                }
                Statement::ForEach { var, list, body } => {
                    let items = match self.eval(list).await? {
                        Value::List(items) => items,
                        Value::Null => Vec::new(),
                        other => {
                            warn!("for-each over a non-list value: {}", other);
                            Vec::new()
                        }
                    };
                    for item in items {
                        self.variables.insert(var.clone(), item);
                        self.iteration(body).await?;
                    }
                }
                Statement::If { condition, then, otherwise } => {
                    if self.eval(condition).await?.truthy() {
                        self.exec_block(then).await?;
                    } else {
                        self.exec_block(otherwise).await?;
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    /// Evaluate a value block
    pub fn eval<'a>(&'a mut self, expr: &'a Expr) -> BoxFuture<'a, Result<Value>> {
        async move {
            let value = match expr {
                Expr::Number(n) => Value::Number(*n),
                Expr::Text(t) => Value::Text(t.clone()),
                Expr::Bool(b) => Value::Bool(*b),
                Expr::Var(name) => match self.variables.get(name) {
                    Some(value) => value.clone(),
                    None => {
                        warn!("Variable '{}' is not set", name);
                        Value::Null
                    }
                },
                Expr::List(items) => {
                    let mut values = Vec::with_capacity(items.len());
                    for item in items {
                        values.push(self.eval(item).await?);
                    }
                    Value::List(values)
                }
                Expr::Join(parts) => {
                    let mut text = String::new();
                    for part in parts {
                        text.push_str(&self.eval(part).await?.to_string());
                    }
                    Value::Text(text)
                }
                Expr::Length(inner) => match self.eval(inner).await? {
                    Value::List(items) => Value::Number(items.len() as f64),
                    Value::Text(text) => Value::Number(text.chars().count() as f64),
                    _ => Value::Number(0.0),
                },
                Expr::Arith { op, left, right } => {
                    let a = self.eval(left).await?.as_number().unwrap_or(0.0);
                    let b = self.eval(right).await?.as_number().unwrap_or(0.0);
                    Value::Number(arith(*op, a, b))
                }
                Expr::Compare { op, left, right } => {
                    let a = self.eval(left).await?;
                    let b = self.eval(right).await?;
                    Value::Bool(compare(*op, &a, &b))
                }
                Expr::Logic { op, left, right } => {
                    let a = self.eval(left).await?.truthy();
                    let result = match op {
                        LogicOp::And => a && self.eval(right).await?.truthy(),
                        LogicOp::Or => a || self.eval(right).await?.truthy(),
                    };
                    Value::Bool(result)
                }
                Expr::Not(inner) => Value::Bool(!self.eval(inner).await?.truthy()),
                Expr::Random { from, to, integer } => random(*from, *to, *integer),
                Expr::JointAbsolute { joint, angle } => {
                    let angle = self.eval(angle).await?;
                    Value::List(vec![Value::Number(*joint as f64), angle])
                }
                Expr::JointRelative { joint, sign, angle } => {
                    let angle = self.eval(angle).await?;
                    Value::List(vec![Value::Number(*joint as f64), Value::Number(*sign as f64), angle])
                }
                Expr::SensorInput { sensor } => self.executor.read_scalar(&plan::sensor_query(sensor)).await?,
                Expr::JointAngle { joint } => self.executor.read_scalar(&plan::joint_angle_query(*joint)).await?,
                Expr::AllJointAngles => self.executor.read_all_joints().await?,
                Expr::DigitalInput { pin } => self.executor.read_scalar(&plan::digital_input_query(*pin)).await?,
                Expr::AnalogInput { pin } => self.executor.read_scalar(&plan::analog_input_query(*pin)).await?,
                Expr::Ultrasonic { trig_pin, echo_pin } => {
                    self.executor
                        .read_scalar(&plan::ultrasonic_query(*trig_pin, *echo_pin))
                        .await?
                }
                Expr::CameraCoordinate => self.executor.read_camera().await?,
                Expr::Gesture => self.executor.read_gesture().await?,
            };
            Ok(value)
        }
        .boxed()
    }
}

fn arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Mod => a % b,
    }
}

fn compare(op: CompareOp, a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (number_of(a), number_of(b)) {
        return match op {
            CompareOp::Eq => x == y,
            CompareOp::Ne => x != y,
            CompareOp::Lt => x < y,
            CompareOp::Le => x <= y,
            CompareOp::Gt => x > y,
            CompareOp::Ge => x >= y,
        };
    }
    let (x, y) = (a.to_string(), b.to_string());
    match op {
        CompareOp::Eq => a == b,
        CompareOp::Ne => a != b,
        CompareOp::Lt => x < y,
        CompareOp::Le => x <= y,
        CompareOp::Gt => x > y,
        CompareOp::Ge => x >= y,
    }
}

/// Numbers and booleans compare numerically; text only when both sides are numeric text
fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::List(_) | Value::Null => None,
        other => other.as_number(),
    }
}

/// Integer in `[from, to]` or float in `[from, to)`
fn random(from: f64, to: f64, integer: bool) -> Value {
    if !from.is_finite() || !to.is_finite() {
        warn!("Random bounds must be finite, got {} and {}", from, to);
        return Value::Number(0.0);
    }
    let (lo, hi) = if from <= to { (from, to) } else { (to, from) };
    let mut rng = rand::thread_rng();
    if integer {
        let (lo, hi) = (lo.round() as i64, hi.round() as i64);
        Value::Number(rng.gen_range(lo..=hi) as f64)
    } else if lo < hi {
        Value::Number(rng.gen_range(lo..hi))
    } else {
        Value::Number(lo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::serial_log::SerialLog;
    use crate::telemetry::MemoryTelemetry;
    use crate::transport::{MockTransport, TransportMode};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    fn interpreter(mock: Arc<MockTransport>) -> (Interpreter, Arc<MemoryTelemetry>) {
        let telemetry = Arc::new(MemoryTelemetry::new());
        let executor = BlockExecutor::new(mock, Config::default())
            .unwrap()
            .with_telemetry(telemetry.clone());
        (Interpreter::new(executor), telemetry)
    }

    fn program(json: &str) -> Program {
        Program::from_json(json).unwrap()
    }

    #[tokio::test]
    async fn test_commands_run_in_order() {
        let mock = Arc::new(MockTransport::new(TransportMode::Network));
        let (mut interpreter, _) = interpreter(mock.clone());
        let program = program(
            r#"{"blocks": [
                {"block": "posture", "command": "kbalance"},
                {"block": "gyro_control", "enabled": false},
                {"block": "play_note", "note": 14, "duration": 4},
                {"block": "set_digital_output", "pin": 4, "state": 1},
                {"block": "send_custom_command", "command": {"join": [{"text": "m 0 "}, {"number": 30}]}}
            ]}"#,
        );
        interpreter.run(&program).await.unwrap();
        assert_eq!(
            mock.sent_text(),
            vec!["kbalance", "gu", "b 14 4", "bytes:[87,100,4,1,126]", "m 0 30"]
        );
    }

    #[tokio::test]
    async fn test_repeat_and_variables() {
        let mock = Arc::new(MockTransport::new(TransportMode::Network));
        let (mut interpreter, telemetry) = interpreter(mock.clone());
        let program = program(
            r#"{"blocks": [
                {"block": "set_variable", "name": "n", "value": {"number": 0}},
                {"block": "repeat", "times": {"number": 3}, "body": [
                    {"block": "set_variable", "name": "n", "value": {"arith": {"op": "add", "left": {"var": "n"}, "right": {"number": 1.5}}}},
                    {"block": "gait", "command": "kwkF"}
                ]},
                {"block": "console_log", "value": {"var": "n"}}
            ]}"#,
        );
        interpreter.run(&program).await.unwrap();
        assert_eq!(mock.sent().len(), 3);
        assert_eq!(interpreter.variable("n"), Some(&Value::Number(4.5)));
        assert_eq!(telemetry.console_lines(), vec!["4.5"]);
    }

    #[tokio::test]
    async fn test_for_and_for_each() {
        let mock = Arc::new(MockTransport::new(TransportMode::Network));
        let (mut interpreter, telemetry) = interpreter(mock);
        let program = program(
            r#"{"blocks": [
                {"block": "for", "var": "i", "from": {"number": 1}, "to": {"number": 5}, "by": {"number": 2}, "body": [
                    {"block": "console_log", "value": {"var": "i"}}
                ]},
                {"block": "for_each", "var": "x", "list": {"list": [{"text": "a"}, {"text": "b"}]}, "body": [
                    {"block": "console_log", "value": {"var": "x"}}
                ]}
            ]}"#,
        );
        interpreter.run(&program).await.unwrap();
        assert_eq!(telemetry.console_lines(), vec!["1", "3", "5", "a", "b"]);
    }

    #[tokio::test]
    async fn test_while_until_and_if() {
        let mock = Arc::new(MockTransport::new(TransportMode::Network));
        let (mut interpreter, telemetry) = interpreter(mock);
        let program = program(
            r#"{"blocks": [
                {"block": "set_variable", "name": "n", "value": {"number": 0}},
                {"block": "while_until", "mode": "until", "condition": {"compare": {"op": "ge", "left": {"var": "n"}, "right": {"number": 2}}}, "body": [
                    {"block": "set_variable", "name": "n", "value": {"arith": {"op": "add", "left": {"var": "n"}, "right": {"number": 1}}}}
                ]},
                {"block": "if", "condition": {"compare": {"op": "eq", "left": {"var": "n"}, "right": {"number": 2}}},
                 "then": [{"block": "console_log", "value": {"text": "two"}}],
                 "else": [{"block": "console_log", "value": {"text": "other"}}]}
            ]}"#,
        );
        interpreter.run(&program).await.unwrap();
        assert_eq!(telemetry.console_lines(), vec!["two"]);
    }

    #[tokio::test]
    async fn test_joint_blocks() {
        let reply = "=\n0\t1\t2\n0, 0, 20, 0\nj\n";
        let mock = Arc::new(MockTransport::new(TransportMode::Network).respond("j", reply));
        let (mut interpreter, _) = interpreter(mock.clone());
        let program = program(
            r#"{"blocks": [
                {"block": "set_joints_angle_seq", "joints": {"list": [
                    {"joint_relative": {"joint": 2, "sign": 1, "angle": {"number": 10}}},
                    {"joint_relative": {"joint": 2, "sign": 1, "angle": {"number": 5}}}
                ]}},
                {"block": "set_joints_angle_sim", "joints": {"list": [
                    {"joint_absolute": {"joint": 0, "angle": {"number": 30}}},
                    {"joint_absolute": {"joint": 1, "angle": {"number": -15}}}
                ]}},
                {"block": "set_joints_angle_sim_raw", "joints": {"list": [{"number": 8}, {"number": 20}]}}
            ]}"#,
        );
        interpreter.run(&program).await.unwrap();
        assert_eq!(
            mock.sent_text(),
            vec!["j", "m 2 30 2 35", "i 0 30 1 -15", "bytes:[76,8,20,126]"]
        );
    }

    #[tokio::test]
    async fn test_reads_flow_into_console() {
        let reply = "=\n0\t1\n10, -4\nj\n";
        let mock = Arc::new(MockTransport::new(TransportMode::Network).respond("j", reply));
        let (mut interpreter, telemetry) = interpreter(mock);
        let program = program(
            r#"{"blocks": [
                {"block": "console_log", "value": "all_joint_angles"},
                {"block": "console_log", "value": {"analog_input": {"pin": 34}}},
                {"block": "console_log", "value": {"length": "all_joint_angles"}}
            ]}"#,
        );
        interpreter.run(&program).await.unwrap();
        assert_eq!(telemetry.console_lines(), vec!["[10,-4]", "123", "2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_infinite_loop() {
        let mock = Arc::new(MockTransport::new(TransportMode::Network));
        let (mut interpreter, telemetry) = interpreter(mock);
        let ctx = interpreter.executor().context().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            ctx.request_stop();
        });
        let program = program(
            r#"{"blocks": [
                {"block": "while_until", "condition": {"bool": true}, "body": [
                    {"block": "gait", "command": "kwkF", "delay": 0.1}
                ]}
            ]}"#,
        );
        let start = Instant::now();
        let result = interpreter.run(&program).await;
        assert!(matches!(result, Err(BlockError::Cancelled)));
        assert!(start.elapsed() < Duration::from_millis(460));
        let runs = telemetry.of_type("run");
        assert_eq!(runs.last().unwrap()["status"], "stopped");
    }

    #[tokio::test(start_paused = true)]
    async fn test_serial_program_waits_per_block() {
        let log = Arc::new(SerialLog::new(4096).unwrap());
        let mock = Arc::new(
            MockTransport::new(TransportMode::Serial)
                .echo("ksit", "k")
                .echo("d", "d")
                .with_log(log.clone()),
        );
        let telemetry = Arc::new(MemoryTelemetry::new());
        let executor = BlockExecutor::new(mock.clone(), Config::default())
            .unwrap()
            .with_serial_log(log)
            .with_telemetry(telemetry.clone());
        let mut interpreter = Interpreter::new(executor);
        let program = program(
            r#"{"blocks": [
                {"block": "posture", "command": "ksit"},
                {"block": "posture", "command": "d"}
            ]}"#,
        );
        interpreter.run(&program).await.unwrap();
        assert_eq!(
            telemetry.step_statuses(),
            vec!["sent", "acknowledged", "sent", "acknowledged"]
        );
    }

    #[test]
    fn test_random_bounds() {
        for _ in 0..100 {
            let Value::Number(n) = random(1.0, 6.0, true) else { panic!() };
            assert!((1.0..=6.0).contains(&n) && n.fract() == 0.0);
            let Value::Number(f) = random(2.0, 0.0, false) else { panic!() };
            assert!((0.0..2.0).contains(&f));
        }
        assert_eq!(random(3.0, 3.0, false), Value::Number(3.0));
    }

    #[test]
    fn test_random_non_finite_bounds() {
        assert_eq!(random(f64::NAN, 5.0, true), Value::Number(0.0));
        assert_eq!(random(0.0, f64::INFINITY, false), Value::Number(0.0));
        assert_eq!(random(f64::NEG_INFINITY, 1.0, true), Value::Number(0.0));
    }

    #[tokio::test]
    async fn test_random_block_with_yaml_nan_does_not_panic() {
        let mock = Arc::new(MockTransport::new(TransportMode::Network));
        let (mut interpreter, _) = interpreter(mock);
        let program = Program::from_yaml(
            r#"
blocks:
  - block: set_variable
    name: r
    value:
      random: {from: .nan, to: 5}
  - block: set_variable
    name: s
    value:
      random: {from: 0, to: .inf, integer: false}
"#,
        )
        .unwrap();
        interpreter.run(&program).await.unwrap();
        assert_eq!(interpreter.variable("r"), Some(&Value::Number(0.0)));
        assert_eq!(interpreter.variable("s"), Some(&Value::Number(0.0)));
    }

    #[test]
    fn test_compare_mixed_values() {
        assert!(compare(CompareOp::Eq, &Value::Text("2".into()), &Value::Number(2.0)));
        assert!(compare(CompareOp::Lt, &Value::Text("a".into()), &Value::Text("b".into())));
        assert!(!compare(CompareOp::Eq, &Value::List(vec![]), &Value::Null));
    }
}
