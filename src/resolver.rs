//! Relative joint motion resolution
//!
//! Turns a batch of absolute/relative joint edits into the absolute
//! `(joint, angle)` pairs carried by the `m`, `i` and `L` commands.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Number of addressable servo joints
pub const JOINT_COUNT: usize = 16;

/// Mechanical limit applied to relative moves, in degrees
pub const ANGLE_LIMIT: i64 = 125;

/// A single joint edit from a joint block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JointEdit {
    Absolute { joint: usize, angle: i64 },
    Relative { joint: usize, sign: i64, magnitude: i64 },
}

impl JointEdit {
    pub fn joint(&self) -> usize {
        match self {
            JointEdit::Absolute { joint, .. } | JointEdit::Relative { joint, .. } => *joint,
        }
    }

    pub fn is_relative(&self) -> bool {
        matches!(self, JointEdit::Relative { .. })
    }
}

/// How resolved angles are emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// One pair per edit, in edit order; used by timed sequences (`m`)
    Sequence,
    /// One pair per joint, first-touch order, final angle; used by simultaneous moves (`i`)
    Set,
}

/// Last known joint configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JointState(pub [i64; JOINT_COUNT]);

impl Default for JointState {
    fn default() -> Self {
        Self([0; JOINT_COUNT])
    }
}

impl JointState {
    /// Build a state from a queried angle list, zero-padding or truncating to 16 joints
    pub fn from_angles(angles: &[i64]) -> Self {
        let mut state = [0; JOINT_COUNT];
        for (slot, angle) in state.iter_mut().zip(angles) {
            *slot = *angle;
        }
        Self(state)
    }

    fn apply(&mut self, edit: &JointEdit) {
        match *edit {
            JointEdit::Absolute { joint, angle } => self.0[joint] = angle,
            JointEdit::Relative { joint, sign, magnitude } => {
                let updated = self.0[joint].saturating_add(sign.saturating_mul(magnitude));
                self.0[joint] = updated.clamp(-ANGLE_LIMIT, ANGLE_LIMIT);
            }
        }
    }
}

pub fn has_relative(edits: &[JointEdit]) -> bool {
    edits.iter().any(JointEdit::is_relative)
}

/// Resolve edits against a baseline. Each edit composes onto the running
/// value left by earlier edits of the same joint.
pub fn resolve(baseline: &JointState, edits: &[JointEdit], mode: ResolveMode) -> Vec<(usize, i64)> {
    let mut state = *baseline;
    let mut pairs = Vec::with_capacity(edits.len());
    let mut touched: Vec<usize> = Vec::new();

    for edit in edits {
        let joint = edit.joint();
        if joint >= JOINT_COUNT {
            warn!("Ignoring edit for joint {} (only {} joints)", joint, JOINT_COUNT);
            continue;
        }
        state.apply(edit);
        match mode {
            ResolveMode::Sequence => pairs.push((joint, state.0[joint])),
            ResolveMode::Set => {
                if !touched.contains(&joint) {
                    touched.push(joint);
                }
            }
        }
    }

    if mode == ResolveMode::Set {
        pairs.extend(touched.into_iter().map(|joint| (joint, state.0[joint])));
    }
    pairs
}

/// Flatten resolved pairs into a command parameter list
pub fn flatten_pairs(pairs: &[(usize, i64)]) -> Vec<i64> {
    pairs.iter().flat_map(|&(joint, angle)| [joint as i64, angle]).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rel(joint: usize, sign: i64, magnitude: i64) -> JointEdit {
        JointEdit::Relative { joint, sign, magnitude }
    }

    fn abs(joint: usize, angle: i64) -> JointEdit {
        JointEdit::Absolute { joint, angle }
    }

    #[test]
    fn test_repeated_relative_edits_accumulate() {
        let edits = [rel(2, 1, 10), rel(2, 1, 5)];
        let baseline = JointState::default();
        assert_eq!(resolve(&baseline, &edits, ResolveMode::Sequence), vec![(2, 10), (2, 15)]);
        assert_eq!(resolve(&baseline, &edits, ResolveMode::Set), vec![(2, 15)]);
    }

    #[test]
    fn test_set_mode_keeps_first_touch_order() {
        let edits = [abs(8, 30), rel(1, -1, 20), abs(8, -10)];
        let pairs = resolve(&JointState::default(), &edits, ResolveMode::Set);
        assert_eq!(pairs, vec![(8, -10), (1, -20)]);
        assert_eq!(flatten_pairs(&pairs), vec![8, -10, 1, -20]);
    }

    #[test]
    fn test_absolute_only_ignores_baseline() {
        let edits = [abs(0, 15), abs(3, -40), abs(0, 20)];
        let mut busy = [0i64; JOINT_COUNT];
        for (i, slot) in busy.iter_mut().enumerate() {
            *slot = i as i64 * 7 - 50;
        }
        for mode in [ResolveMode::Sequence, ResolveMode::Set] {
            assert_eq!(
                resolve(&JointState::default(), &edits, mode),
                resolve(&JointState(busy), &edits, mode)
            );
        }
        assert!(!has_relative(&edits));
    }

    #[test]
    fn test_relative_edits_saturate() {
        let mut baseline = JointState::default();
        baseline.0[4] = 120;
        baseline.0[5] = -100;
        let edits = [rel(4, 1, 30), rel(4, 1, 30), rel(5, -1, 90), rel(5, -1, i64::MAX)];
        let pairs = resolve(&baseline, &edits, ResolveMode::Sequence);
        assert_eq!(pairs, vec![(4, 125), (4, 125), (5, -125), (5, -125)]);
    }

    #[test]
    fn test_relative_from_queried_baseline() {
        let baseline = JointState::from_angles(&[0, 0, 0, 0, 0, 0, 0, 0, 30, 30]);
        let pairs = resolve(&baseline, &[rel(8, -1, 45), abs(9, 0)], ResolveMode::Sequence);
        assert_eq!(pairs, vec![(8, -15), (9, 0)]);
    }

    #[test]
    fn test_out_of_range_joint_dropped() {
        let pairs = resolve(&JointState::default(), &[abs(16, 10), abs(1, 5)], ResolveMode::Set);
        assert_eq!(pairs, vec![(1, 5)]);
    }

    #[test]
    fn test_state_from_long_query_truncates() {
        let angles: Vec<i64> = (0..20).collect();
        let state = JointState::from_angles(&angles);
        assert_eq!(state.0[15], 15);
    }
}
