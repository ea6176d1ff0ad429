//! Block program model
//!
//! A program is the serialised block workspace: statement blocks with their
//! field values, value blocks as expressions, and nested statement slots for
//! loops and conditionals.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::warn;
use crate::{resolver::JointEdit, BlockError, Result};

/// Runtime value flowing between blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(t) => t.trim().parse().ok(),
            _ => None,
        }
    }

    /// Number rounded to an integer command parameter
    pub fn as_int(&self) -> Option<i64> {
        self.as_number().filter(|n| n.is_finite()).map(|n| n.round() as i64)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Text(t) => !t.is_empty(),
            Value::List(_) => true,
        }
    }

    pub fn from_ints(values: &[i64]) -> Self {
        Value::List(values.iter().map(|v| Value::Number(*v as f64)).collect())
    }

    pub fn from_floats(values: &[f64]) -> Self {
        Value::List(values.iter().map(|v| Value::Number(*v)).collect())
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() {
        format!("{}", n as i64)
    } else {
        format!("{:.2}", n)
    }
}

impl fmt::Display for Value {
    /// Console form: lists as `[a,b]`, fractional numbers with two decimals
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Text(t) => write!(f, "{}", t),
            Value::List(items) if items.is_empty() => write!(f, "[ ]"),
            Value::List(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .map(|item| match item {
                        Value::Number(n) => format_number(*n),
                        other => other.to_string(),
                    })
                    .collect();
                write!(f, "[{}]", parts.join(","))
            }
        }
    }
}

/// Interpret a joint value as a batch of edits.
///
/// `[id, angle]` is absolute, `[id, sign, angle]` relative. A flat list of
/// numbers is a single edit; `null` entries are skipped.
pub fn joint_edits(value: &Value) -> Vec<JointEdit> {
    let items: Vec<&Value> = match value {
        Value::List(items) => items.iter().filter(|v| !matches!(v, Value::Null)).collect(),
        _ => return Vec::new(),
    };
    let Some(first) = items.first() else {
        return Vec::new();
    };

    let batch: Vec<&Value> = if matches!(first, Value::Number(_)) {
        vec![value]
    } else {
        items
    };

    batch.into_iter().filter_map(edit_from_value).collect()
}

fn edit_from_value(value: &Value) -> Option<JointEdit> {
    let Value::List(parts) = value else {
        return None;
    };
    let numbers: Vec<i64> = parts.iter().filter_map(Value::as_int).collect();
    if numbers.len() != parts.len() {
        warn!("Ignoring joint edit with non-numeric parts: {}", value);
        return None;
    }
    let joint = usize::try_from(*numbers.first()?).ok()?;
    match numbers[..] {
        [_, angle] => Some(JointEdit::Absolute { joint, angle }),
        [_, sign, magnitude] => Some(JointEdit::Relative { joint, sign, magnitude }),
        _ => {
            warn!("Ignoring joint edit of unexpected length: {}", value);
            None
        }
    }
}

/// Flatten `[[id, angle], ...]` or `[id, angle, ...]` into command parameters
pub fn flat_params(value: &Value) -> Vec<i64> {
    match value {
        Value::List(items) => items
            .iter()
            .flat_map(|item| match item {
                Value::List(inner) => inner.iter().filter_map(Value::as_int).collect::<Vec<_>>(),
                other => other.as_int().into_iter().collect(),
            })
            .collect(),
        other => other.as_int().into_iter().collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicOp {
    And,
    Or,
}

/// Value blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    Number(f64),
    Text(String),
    Bool(bool),
    Var(String),
    List(Vec<Expr>),
    /// Text concatenation
    Join(Vec<Expr>),
    Length(Box<Expr>),
    Arith { op: ArithOp, left: Box<Expr>, right: Box<Expr> },
    Compare { op: CompareOp, left: Box<Expr>, right: Box<Expr> },
    Logic { op: LogicOp, left: Box<Expr>, right: Box<Expr> },
    Not(Box<Expr>),
    Random {
        from: f64,
        to: f64,
        #[serde(default = "default_true")]
        integer: bool,
    },
    JointAbsolute { joint: usize, angle: Box<Expr> },
    JointRelative { joint: usize, sign: i64, angle: Box<Expr> },
    /// Raw firmware query whose reply is a single number
    SensorInput { sensor: String },
    JointAngle { joint: usize },
    AllJointAngles,
    DigitalInput { pin: i64 },
    AnalogInput { pin: i64 },
    Ultrasonic {
        trig_pin: i64,
        #[serde(default = "default_echo_pin")]
        echo_pin: i64,
    },
    CameraCoordinate,
    Gesture,
}

fn default_true() -> bool {
    true
}

fn default_echo_pin() -> i64 {
    -1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    #[default]
    While,
    Until,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub note: i64,
    pub duration: i64,
}

/// Statement blocks, tagged by block type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "block", rename_all = "snake_case")]
pub enum Statement {
    Gait {
        command: String,
        #[serde(default)]
        delay: f64,
    },
    Posture {
        command: String,
        #[serde(default)]
        delay: f64,
    },
    AcrobaticMoves {
        command: String,
        #[serde(default)]
        delay: f64,
    },
    ArmAction {
        command: String,
        #[serde(default)]
        delay: f64,
    },
    PlayToneList {
        tones: String,
        #[serde(default)]
        delay: f64,
    },
    PlayNote {
        note: i64,
        duration: i64,
    },
    PlayMelody {
        notes: Vec<Note>,
        #[serde(default)]
        delay: f64,
    },
    DelayMs {
        delay: f64,
    },
    GyroControl {
        enabled: bool,
    },
    SendCustomCommand {
        command: Expr,
        #[serde(default)]
        delay: f64,
    },
    SetJointsAngleSeq {
        joints: Expr,
        #[serde(default)]
        delay: f64,
    },
    SetJointsAngleSim {
        joints: Expr,
        #[serde(default)]
        delay: f64,
    },
    SetJointsAngleSimRaw {
        joints: Expr,
        #[serde(default)]
        delay: f64,
    },
    SetJointAngle {
        joints: Expr,
        #[serde(default)]
        delay: f64,
    },
    ActionSkillFile {
        file: String,
        #[serde(default)]
        delay: f64,
    },
    MakeConnection {
        address: String,
    },
    SetAnalogOutput {
        pin: i64,
        value: Expr,
    },
    SetDigitalOutput {
        pin: i64,
        state: i64,
    },
    ConsoleLog {
        value: Expr,
    },
    SetVariable {
        name: String,
        value: Expr,
    },
    /// Value block placed in a statement slot, evaluated for its side effect
    Evaluate {
        value: Expr,
    },
    Repeat {
        times: Expr,
        body: Vec<Statement>,
    },
    WhileUntil {
        #[serde(default)]
        mode: LoopMode,
        condition: Expr,
        body: Vec<Statement>,
    },
    For {
        var: String,
        from: Expr,
        to: Expr,
        #[serde(default)]
        by: Option<Expr>,
        body: Vec<Statement>,
    },
    ForEach {
        var: String,
        list: Expr,
        body: Vec<Statement>,
    },
    If {
        condition: Expr,
        then: Vec<Statement>,
        #[serde(default, rename = "else")]
        otherwise: Vec<Statement>,
    },
}

/// A complete block program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub name: Option<String>,
    pub blocks: Vec<Statement>,
}

impl Program {
    pub fn from_json(contents: &str) -> Result<Self> {
        Ok(serde_json::from_str(contents)?)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Load a program file; `.yaml`/`.yml` files are read as YAML, everything else as JSON
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| BlockError::Script(format!("Failed to read {}: {}", path.display(), e)))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            _ => Self::from_json(&contents),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(values: &[f64]) -> Value {
        Value::from_floats(values)
    }

    #[test]
    fn test_joint_edits_from_nested_list() {
        let value = Value::List(vec![list(&[0.0, 30.0]), Value::Null, list(&[2.0, -1.0, 15.0])]);
        assert_eq!(
            joint_edits(&value),
            vec![
                JointEdit::Absolute { joint: 0, angle: 30 },
                JointEdit::Relative { joint: 2, sign: -1, magnitude: 15 },
            ]
        );
    }

    #[test]
    fn test_joint_edits_single_flat_edit() {
        assert_eq!(
            joint_edits(&list(&[8.0, 45.0])),
            vec![JointEdit::Absolute { joint: 8, angle: 45 }]
        );
        assert!(joint_edits(&Value::List(vec![])).is_empty());
        assert!(joint_edits(&Value::Number(3.0)).is_empty());
        assert!(joint_edits(&list(&[1.0, 2.0, 3.0, 4.0])).is_empty());
        assert!(joint_edits(&list(&[-1.0, 20.0])).is_empty());
    }

    #[test]
    fn test_flat_params() {
        let nested = Value::List(vec![list(&[8.0, 20.0]), list(&[9.0, -20.0])]);
        assert_eq!(flat_params(&nested), vec![8, 20, 9, -20]);
        assert_eq!(flat_params(&list(&[1.0, 2.0])), vec![1, 2]);
    }

    #[test]
    fn test_console_format() {
        assert_eq!(list(&[1.0, 2.5, -3.0]).to_string(), "[1,2.50,-3]");
        assert_eq!(Value::List(vec![]).to_string(), "[ ]");
        assert_eq!(Value::Number(4.0).to_string(), "4");
        assert_eq!(Value::Text("hi".into()).to_string(), "hi");
    }

    #[test]
    fn test_demo_program_parses() {
        let program = Program::from_json(include_str!("../demos/wave.json")).unwrap();
        assert_eq!(program.name.as_deref(), Some("wave"));
        assert!(matches!(program.blocks.last(), Some(Statement::Posture { .. })));
    }

    #[test]
    fn test_program_from_json() {
        let json = r#"{
            "name": "wave",
            "blocks": [
                {"block": "posture", "command": "kup", "delay": 0.5},
                {"block": "repeat", "times": {"number": 2}, "body": [
                    {"block": "set_joints_angle_sim", "joints": {"list": [
                        {"joint_relative": {"joint": 8, "sign": 1, "angle": {"number": 20}}},
                        {"joint_absolute": {"joint": 9, "angle": {"number": -20}}}
                    ]}}
                ]},
                {"block": "console_log", "value": "all_joint_angles"}
            ]
        }"#;
        let program = Program::from_json(json).unwrap();
        assert_eq!(program.name.as_deref(), Some("wave"));
        assert_eq!(program.blocks.len(), 3);
        assert!(matches!(program.blocks[1], Statement::Repeat { .. }));
        assert!(matches!(
            program.blocks[2],
            Statement::ConsoleLog { value: Expr::AllJointAngles }
        ));
    }
}
