//! Completion-wait policy per command family
//!
//! On the serial link a request returns as soon as the bytes are written, so
//! long-running commands are followed by a wait for the token line the
//! firmware prints when the action finishes. Request/response commands need
//! no extra wait.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use crate::config::TimeoutConfig;

const GAIT_TIMEOUT: Duration = Duration::from_millis(20_000);
const POSTURE_SEND_TIMEOUT: Duration = Duration::from_millis(10_000);
const POSTURE_WAIT_TIMEOUT: Duration = Duration::from_millis(15_000);
const TONE_LIST_TIMEOUT: Duration = Duration::from_millis(15_000);
const JOINT_SEQUENCE_WAIT_TIMEOUT: Duration = Duration::from_millis(15_000);
const JOINT_SIMULTANEOUS_WAIT_TIMEOUT: Duration = Duration::from_millis(30_000);
const JOINT_RAW_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Tokens a custom command may wait for
const CUSTOM_WAIT_TOKENS: &[char] = &['m', 'k', 'd'];

/// Classes of commands sharing one completion-wait rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandFamily {
    Gait,
    Posture,
    ToneList,
    AcrobaticMove,
    Melody,
    JointSequence,
    JointSimultaneous,
    JointRaw,
    SkillFile,
    ArmAction,
    CustomCommand,
    /// Sensor reads, IO writes, single notes: the reply is the synchronisation
    Immediate,
}

/// Wait for a completion token after sending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub token: char,
    pub timeout: Duration,
}

/// Timeouts and completion rule for one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyPolicy {
    pub send_timeout: Duration,
    pub wait: Option<WaitPolicy>,
}

/// Terminal state of a completion wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    Acknowledged,
    TimedOut,
}

impl CommandFamily {
    /// Look up the policy for a command of this family. `lead` is the first
    /// character of the command actually sent.
    pub fn policy(self, lead: Option<char>, timeouts: &TimeoutConfig) -> FamilyPolicy {
        let wait = |token: Option<char>, timeout: Duration| token.map(|token| WaitPolicy { token, timeout });

        match self {
            CommandFamily::Gait => FamilyPolicy {
                send_timeout: GAIT_TIMEOUT,
                wait: wait(Some('k'), GAIT_TIMEOUT),
            },
            CommandFamily::Posture => FamilyPolicy {
                send_timeout: POSTURE_SEND_TIMEOUT,
                wait: wait(lead, POSTURE_WAIT_TIMEOUT),
            },
            CommandFamily::ToneList => FamilyPolicy {
                send_timeout: TONE_LIST_TIMEOUT,
                wait: wait(Some('B'), TONE_LIST_TIMEOUT),
            },
            CommandFamily::AcrobaticMove => FamilyPolicy {
                send_timeout: timeouts.acrobatic_moves(),
                wait: wait(Some('k'), timeouts.acrobatic_moves()),
            },
            CommandFamily::Melody => FamilyPolicy {
                send_timeout: timeouts.long_command(),
                wait: wait(Some('B'), timeouts.long_command()),
            },
            CommandFamily::JointSequence => FamilyPolicy {
                send_timeout: timeouts.default_timeout(),
                wait: wait(Some('m'), JOINT_SEQUENCE_WAIT_TIMEOUT),
            },
            CommandFamily::JointSimultaneous => FamilyPolicy {
                send_timeout: timeouts.default_timeout(),
                wait: wait(Some('i'), JOINT_SIMULTANEOUS_WAIT_TIMEOUT),
            },
            CommandFamily::JointRaw => FamilyPolicy {
                send_timeout: JOINT_RAW_TIMEOUT,
                wait: None,
            },
            CommandFamily::SkillFile | CommandFamily::ArmAction => FamilyPolicy {
                send_timeout: timeouts.long_command(),
                wait: wait(lead, timeouts.long_command()),
            },
            CommandFamily::CustomCommand => FamilyPolicy {
                send_timeout: timeouts.long_command(),
                wait: wait(lead.filter(|c| CUSTOM_WAIT_TOKENS.contains(c)), timeouts.long_command()),
            },
            CommandFamily::Immediate => FamilyPolicy {
                send_timeout: timeouts.sensor(),
                wait: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_of(family: CommandFamily, lead: Option<char>) -> Option<char> {
        family.policy(lead, &TimeoutConfig::default()).wait.map(|w| w.token)
    }

    #[test]
    fn test_completion_tokens() {
        assert_eq!(token_of(CommandFamily::Gait, Some('w')), Some('k'));
        assert_eq!(token_of(CommandFamily::Posture, Some('d')), Some('d'));
        assert_eq!(token_of(CommandFamily::Posture, Some('k')), Some('k'));
        assert_eq!(token_of(CommandFamily::ToneList, Some('B')), Some('B'));
        assert_eq!(token_of(CommandFamily::AcrobaticMove, Some('k')), Some('k'));
        assert_eq!(token_of(CommandFamily::Melody, Some('B')), Some('B'));
        assert_eq!(token_of(CommandFamily::JointSequence, Some('m')), Some('m'));
        assert_eq!(token_of(CommandFamily::JointSimultaneous, Some('i')), Some('i'));
        assert_eq!(token_of(CommandFamily::SkillFile, Some('K')), Some('K'));
        assert_eq!(token_of(CommandFamily::ArmAction, Some('k')), Some('k'));
        assert_eq!(token_of(CommandFamily::JointRaw, Some('L')), None);
        assert_eq!(token_of(CommandFamily::Immediate, Some('R')), None);
    }

    #[test]
    fn test_custom_command_waits_only_for_motion_tokens() {
        assert_eq!(token_of(CommandFamily::CustomCommand, Some('m')), Some('m'));
        assert_eq!(token_of(CommandFamily::CustomCommand, Some('d')), Some('d'));
        assert_eq!(token_of(CommandFamily::CustomCommand, Some('b')), None);
        assert_eq!(token_of(CommandFamily::CustomCommand, None), None);
    }

    #[test]
    fn test_timeouts() {
        let timeouts = TimeoutConfig::default();
        let gait = CommandFamily::Gait.policy(None, &timeouts);
        assert_eq!(gait.send_timeout, Duration::from_millis(20_000));
        assert_eq!(gait.wait.unwrap().timeout, Duration::from_millis(20_000));

        let sim = CommandFamily::JointSimultaneous.policy(None, &timeouts);
        assert_eq!(sim.wait.unwrap().timeout, Duration::from_millis(30_000));

        let melody = CommandFamily::Melody.policy(None, &timeouts);
        assert_eq!(melody.wait.unwrap().timeout, timeouts.long_command());

        let read = CommandFamily::Immediate.policy(None, &timeouts);
        assert_eq!(read.send_timeout, Duration::from_millis(5_000));
    }
}
