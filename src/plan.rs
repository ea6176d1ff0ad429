//! Per-block step planning
//!
//! Turns a command block and its field values into a [`Step`]: what to send,
//! which completion rule applies and how long to pause afterwards. Planning is
//! pure; anything needing device state (the joint baseline) is deferred to the
//! executor through [`Action::JointMove`].

use std::time::Duration;
use tracing::warn;
use crate::{
    cancel::delay_from_secs,
    codec::{decode_envelope, Command, WireCommand, BASE64_PREFIX, BYTES_PREFIX},
    config::TimeoutConfig,
    policy::{CommandFamily, FamilyPolicy},
    resolver::{flatten_pairs, JointEdit, ResolveMode},
    response::leading_int,
    script::Note,
    skills::SkillRegistry,
};

/// Timeout for single notes and their tone-list fallback
pub const NOTE_TIMEOUT: Duration = Duration::from_millis(5_000);
/// Duration used when a tone list entry has none
pub const DEFAULT_NOTE_DURATION: i64 = 4;

/// What a step does on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Send one command
    Send(WireCommand),
    /// Send `primary`; if that fails, send each fallback command in turn
    SendWithFallback {
        primary: WireCommand,
        fallback: Vec<WireCommand>,
    },
    /// Resolve the edits against the device's joint state, then send
    JointMove {
        token: &'static str,
        edits: Vec<JointEdit>,
        mode: ResolveMode,
    },
    /// Open a connection to the robot
    Connect(String),
    /// Only the post-command delay
    Delay,
    /// Nothing is sent; the reason is reported
    Skip(String),
}

/// One planned block execution
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Human-readable command form for logs and events
    pub label: String,
    pub family: CommandFamily,
    pub action: Action,
    pub policy: FamilyPolicy,
    pub delay: Duration,
}

impl Step {
    fn send(command: Command, family: CommandFamily, delay: Duration, timeouts: &TimeoutConfig) -> Self {
        Self {
            label: command.to_string(),
            family,
            policy: family.policy(command.lead(), timeouts),
            action: Action::Send(command.encode()),
            delay,
        }
    }

    fn skip(label: &str, reason: String) -> Self {
        Self {
            label: label.to_string(),
            family: CommandFamily::Immediate,
            policy: FamilyPolicy {
                send_timeout: Duration::ZERO,
                wait: None,
            },
            action: Action::Skip(reason),
            delay: Duration::ZERO,
        }
    }

    fn immediate(command: Command, timeout: Duration) -> Self {
        Self {
            label: command.to_string(),
            family: CommandFamily::Immediate,
            policy: FamilyPolicy {
                send_timeout: timeout,
                wait: None,
            },
            action: Action::Send(command.encode()),
            delay: Duration::ZERO,
        }
    }

    /// Whether a completion wait may follow the send
    pub fn waits(&self) -> bool {
        self.policy.wait.is_some()
    }
}

/// Gait, posture, acrobatic move and arm action blocks send the selected skill token
pub fn skill_command(family: CommandFamily, command: &str, delay: f64, timeouts: &TimeoutConfig) -> Step {
    Step::send(Command::token(command.trim()), family, delay_from_secs(delay), timeouts)
}

/// Parse a `"tone,duration,tone,duration"` list. An odd count gets a default
/// duration; unparseable tones become 0 and unparseable durations 4.
pub fn parse_tone_list(tones: &str) -> Vec<(i64, i64)> {
    let mut fields: Vec<&str> = tones.split(',').map(str::trim).collect();
    if fields.len() % 2 != 0 {
        fields.push("4");
    }
    fields
        .chunks(2)
        .map(|pair| {
            let tone = leading_int(pair[0]).unwrap_or(0);
            let duration = leading_int(pair[1])
                .filter(|d| *d != 0)
                .unwrap_or(DEFAULT_NOTE_DURATION);
            (tone, duration)
        })
        .collect()
}

pub fn tone_list(tones: &str, delay: f64, timeouts: &TimeoutConfig) -> Step {
    let notes = parse_tone_list(tones);
    let params: Vec<i64> = notes.iter().flat_map(|(t, d)| [*t, *d]).collect();
    let fallback = notes
        .iter()
        .map(|(tone, duration)| Command::new("b", vec![*tone, *duration]).encode())
        .collect();
    let command = Command::new("B", params);
    let family = CommandFamily::ToneList;
    Step {
        label: command.to_string(),
        family,
        policy: family.policy(command.lead(), timeouts),
        action: Action::SendWithFallback {
            primary: command.encode(),
            fallback,
        },
        delay: delay_from_secs(delay),
    }
}

pub fn note(note: i64, duration: i64) -> Step {
    Step::immediate(Command::new("b", vec![note, duration]), NOTE_TIMEOUT)
}

pub fn melody(notes: &[Note], delay: f64, timeouts: &TimeoutConfig) -> Step {
    let params = notes.iter().flat_map(|n| [n.note, n.duration]).collect();
    Step::send(Command::new("B", params), CommandFamily::Melody, delay_from_secs(delay), timeouts)
}

pub fn delay(seconds: f64) -> Step {
    let delay = delay_from_secs(seconds);
    Step {
        label: format!("delay {}ms", delay.as_millis()),
        family: CommandFamily::Immediate,
        policy: FamilyPolicy {
            send_timeout: Duration::ZERO,
            wait: None,
        },
        action: Action::Delay,
        delay,
    }
}

pub fn gyro(enabled: bool, timeouts: &TimeoutConfig) -> Step {
    let token = if enabled { "gU" } else { "gu" };
    Step::immediate(Command::token(token), timeouts.sensor())
}

/// A custom command is sent as typed; `bytes:[..]` and `b64:` envelopes are
/// unpacked into the binary frame they describe.
pub fn custom(command: &str, delay: f64, timeouts: &TimeoutConfig) -> Step {
    let command = command.trim();
    if command.is_empty() {
        return Step::skip("custom", "Custom command is empty".to_string());
    }
    let family = CommandFamily::CustomCommand;
    if command.starts_with(BYTES_PREFIX) || command.starts_with(BASE64_PREFIX) {
        return match decode_envelope(command) {
            Some(decoded) => Step::send(decoded, family, delay_from_secs(delay), timeouts),
            None => Step::skip(command, format!("Malformed command envelope: {}", command)),
        };
    }
    Step {
        label: command.to_string(),
        family,
        policy: family.policy(command.chars().next(), timeouts),
        action: Action::Send(WireCommand::Text(command.to_string())),
        delay: delay_from_secs(delay),
    }
}

/// Joint move in sequence (`m`) or simultaneous (`i`) form
pub fn joint_move(family: CommandFamily, edits: Vec<JointEdit>, delay: f64, timeouts: &TimeoutConfig) -> Step {
    let (token, mode) = match family {
        CommandFamily::JointSimultaneous => ("i", ResolveMode::Set),
        _ => ("m", ResolveMode::Sequence),
    };
    if edits.is_empty() {
        return Step::skip(token, "No joint angles given".to_string());
    }
    Step {
        label: token.to_string(),
        family,
        policy: family.policy(token.chars().next(), timeouts),
        action: Action::JointMove { token, edits, mode },
        delay: delay_from_secs(delay),
    }
}

/// Wire command for resolved joint pairs
pub fn joint_move_command(token: &str, pairs: &[(usize, i64)]) -> Command {
    Command::new(token, flatten_pairs(pairs))
}

/// Simultaneous move with the pairs sent verbatim as a binary frame
pub fn joint_raw(params: Vec<i64>, delay: f64, timeouts: &TimeoutConfig) -> Step {
    if params.is_empty() {
        return Step::skip("L", "Joint angle list is empty".to_string());
    }
    if params.len() % 2 != 0 {
        warn!("Joint angle list has an odd number of values: {:?}", params);
    }
    Step::send(Command::new("L", params), CommandFamily::JointRaw, delay_from_secs(delay), timeouts)
}

/// Skill file block. A missing skill plans a logged no-op.
pub fn skill_file(name: &str, skills: &SkillRegistry, delay: f64, timeouts: &TimeoutConfig) -> Step {
    let Some(skill) = skills.get(name) else {
        return Step::skip(name, format!("Skill file not found: {}", name));
    };
    let command = Command::new(skill.token.clone(), skill.flatten());
    let family = CommandFamily::SkillFile;
    Step {
        label: format!("{} ({})", name, skill.token),
        family,
        policy: family.policy(skill.completion_token(), timeouts),
        action: Action::Send(command.encode()),
        delay: delay_from_secs(delay),
    }
}

pub fn connect(address: &str) -> Step {
    Step {
        label: format!("connect {}", address),
        family: CommandFamily::Immediate,
        policy: FamilyPolicy {
            send_timeout: Duration::ZERO,
            wait: None,
        },
        action: Action::Connect(address.trim().to_string()),
        delay: Duration::ZERO,
    }
}

pub fn analog_output(pin: i64, value: i64, timeouts: &TimeoutConfig) -> Step {
    Step::immediate(Command::new("Wa", vec![pin, value]), timeouts.sensor())
}

pub fn digital_output(pin: i64, state: i64, timeouts: &TimeoutConfig) -> Step {
    Step::immediate(Command::new("Wd", vec![pin, state]), timeouts.sensor())
}

/// Raw sensor query, sent as typed
pub fn sensor_query(sensor: &str) -> WireCommand {
    WireCommand::Text(sensor.trim().to_string())
}

pub fn joint_angle_query(joint: usize) -> WireCommand {
    Command::new("j", vec![joint as i64]).encode()
}

pub fn all_joints_query() -> WireCommand {
    Command::token("j").encode()
}

pub fn digital_input_query(pin: i64) -> WireCommand {
    Command::new("Rd", vec![pin]).encode()
}

pub fn analog_input_query(pin: i64) -> WireCommand {
    Command::new("Ra", vec![pin]).encode()
}

/// Ultrasonic read; an echo pin of -1 shares the trigger pin
pub fn ultrasonic_query(trig_pin: i64, echo_pin: i64) -> WireCommand {
    let echo_pin = if echo_pin == -1 { trig_pin } else { echo_pin };
    Command::new("XU", vec![trig_pin, echo_pin]).encode()
}

/// Camera and gesture mode switches and polls are sent as plain text
pub fn mode_query(token: &str) -> WireCommand {
    WireCommand::Text(token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::Skill;

    fn timeouts() -> TimeoutConfig {
        TimeoutConfig::default()
    }

    #[test]
    fn test_posture_waits_for_its_own_lead() {
        let step = skill_command(CommandFamily::Posture, "d", 0.0, &timeouts());
        assert_eq!(step.action, Action::Send(WireCommand::Text("d".to_string())));
        assert_eq!(step.policy.wait.unwrap().token, 'd');
        assert_eq!(step.policy.send_timeout, Duration::from_millis(10_000));
        assert_eq!(step.delay, Duration::ZERO);
    }

    #[test]
    fn test_gait_with_delay() {
        let step = skill_command(CommandFamily::Gait, "kwkF", 1.25, &timeouts());
        assert_eq!(step.label, "kwkF");
        assert_eq!(step.policy.wait.unwrap().token, 'k');
        assert_eq!(step.delay, Duration::from_millis(1250));
    }

    #[test]
    fn test_parse_tone_list() {
        assert_eq!(parse_tone_list("14,4,16,8"), vec![(14, 4), (16, 8)]);
        assert_eq!(parse_tone_list("14, 4, 16"), vec![(14, 4), (16, 4)]);
        assert_eq!(parse_tone_list("x,y"), vec![(0, 4)]);
    }

    #[test]
    fn test_tone_list_frame_and_fallback() {
        let step = tone_list("14,4,16", 0.0, &timeouts());
        match step.action {
            Action::SendWithFallback { primary, fallback } => {
                assert_eq!(primary.as_bytes(), &[66, 14, 4, 16, 4, 126]);
                assert_eq!(
                    fallback,
                    vec![
                        WireCommand::Text("b 14 4".to_string()),
                        WireCommand::Text("b 16 4".to_string()),
                    ]
                );
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert_eq!(step.policy.wait.unwrap().token, 'B');
    }

    #[test]
    fn test_melody_frame() {
        let notes = vec![Note { note: 14, duration: 4 }, Note { note: 16, duration: 8 }];
        let step = melody(&notes, 0.5, &timeouts());
        assert_eq!(step.action, Action::Send(WireCommand::Bytes(vec![66, 14, 4, 16, 8, 126])));
        assert_eq!(step.label, "B 14 4 16 8");
        assert_eq!(step.delay, Duration::from_millis(500));
    }

    #[test]
    fn test_gyro_and_outputs() {
        assert_eq!(gyro(true, &timeouts()).action, Action::Send(WireCommand::Text("gU".to_string())));
        assert_eq!(gyro(false, &timeouts()).action, Action::Send(WireCommand::Text("gu".to_string())));
        assert_eq!(
            analog_output(9, 128, &timeouts()).action,
            Action::Send(WireCommand::Bytes(vec![87, 97, 9, 128, 126]))
        );
        assert_eq!(
            digital_output(4, 1, &timeouts()).action,
            Action::Send(WireCommand::Bytes(vec![87, 100, 4, 1, 126]))
        );
    }

    #[test]
    fn test_custom_command() {
        let step = custom("m 0 45", 0.0, &timeouts());
        assert_eq!(step.action, Action::Send(WireCommand::Text("m 0 45".to_string())));
        assert_eq!(step.policy.wait.unwrap().token, 'm');

        let step = custom("b 14 4", 0.0, &timeouts());
        assert!(!step.waits());

        let step = custom("bytes:[88,85,5,6,126]", 0.0, &timeouts());
        assert_eq!(step.action, Action::Send(WireCommand::Bytes(vec![88, 85, 5, 6, 126])));

        assert!(matches!(custom("  ", 0.0, &timeouts()).action, Action::Skip(_)));
    }

    #[test]
    fn test_joint_moves() {
        let edits = vec![JointEdit::Absolute { joint: 0, angle: 30 }];
        let step = joint_move(CommandFamily::JointSimultaneous, edits.clone(), 0.0, &timeouts());
        assert_eq!(
            step.action,
            Action::JointMove { token: "i", edits: edits.clone(), mode: ResolveMode::Set }
        );
        assert_eq!(step.policy.wait.unwrap().token, 'i');

        let step = joint_move(CommandFamily::JointSequence, edits, 0.0, &timeouts());
        assert!(matches!(step.action, Action::JointMove { token: "m", .. }));

        let step = joint_move(CommandFamily::JointSequence, vec![], 0.0, &timeouts());
        assert!(matches!(step.action, Action::Skip(_)));

        assert_eq!(
            joint_move_command("m", &[(2, 20), (2, 25)]).to_string(),
            "m 2 20 2 25"
        );
    }

    #[test]
    fn test_joint_raw_has_no_wait() {
        let step = joint_raw(vec![8, 20, 9, -20], 0.0, &timeouts());
        assert_eq!(step.action, Action::Send(WireCommand::Bytes(vec![76, 8, 20, 9, 236, 126])));
        assert!(!step.waits());
        assert_eq!(step.policy.send_timeout, Duration::from_millis(30_000));
        assert!(matches!(joint_raw(vec![], 0.0, &timeouts()).action, Action::Skip(_)));
    }

    #[test]
    fn test_skill_file() {
        let mut skills = SkillRegistry::new();
        skills.insert(Skill {
            name: "wave".to_string(),
            token: "K".to_string(),
            data: vec![],
        });
        let step = skill_file("wave", &skills, 0.0, &timeouts());
        assert_eq!(step.action, Action::Send(WireCommand::Bytes(vec![75, 126])));
        assert_eq!(step.policy.wait.unwrap().token, 'K');

        let missing = skill_file("jump", &skills, 2.0, &timeouts());
        assert_eq!(missing.action, Action::Skip("Skill file not found: jump".to_string()));
        assert_eq!(missing.delay, Duration::ZERO);
    }

    #[test]
    fn test_read_queries() {
        assert_eq!(ultrasonic_query(8, -1), WireCommand::Bytes(vec![88, 85, 8, 8, 126]));
        assert_eq!(ultrasonic_query(5, 6), WireCommand::Bytes(vec![88, 85, 5, 6, 126]));
        assert_eq!(joint_angle_query(3), WireCommand::Text("j 3".to_string()));
        assert_eq!(all_joints_query(), WireCommand::Text("j".to_string()));
        assert_eq!(analog_input_query(34), WireCommand::Bytes(vec![82, 97, 34, 126]));
        assert_eq!(mode_query("XCP"), WireCommand::Text("XCP".to_string()));
    }

    #[test]
    fn test_delay_step() {
        let step = delay(0.3);
        assert_eq!(step.action, Action::Delay);
        assert_eq!(step.delay, Duration::from_millis(300));
    }
}
