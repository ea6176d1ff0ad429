//! Decoding of device responses
//!
//! The firmware does not describe the shape of its replies, so the caller
//! picks the decoder. Every decoder is total: malformed input produces an
//! empty, zero or sentinel value and a warning, never an error.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use crate::Result;

/// Gesture value reported when no gesture was recognised
pub const GESTURE_UNKNOWN: i64 = -1;

/// Parse the leading integer of a string the way the firmware tools do:
/// optional sign followed by digits, trailing garbage ignored.
pub fn leading_int(text: &str) -> Option<i64> {
    let text = text.trim_start();
    let (negative, digits) = match text.as_bytes().first() {
        Some(b'-') => (true, &text[1..]),
        Some(b'+') => (false, &text[1..]),
        _ => (false, text),
    };
    let end = digits.bytes().take_while(|b| b.is_ascii_digit()).count();
    if end == 0 {
        return None;
    }
    let value: i64 = digits[..end].parse().ok()?;
    Some(if negative { -value } else { value })
}

fn normalize(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Single number reply, e.g. `=\n42\n` or `4094 R`
pub fn parse_scalar(raw: &str) -> i64 {
    let text = normalize(raw);
    let lines: Vec<&str> = text.split('\n').collect();
    for (i, line) in lines.iter().enumerate() {
        if line.trim() == "=" {
            if let Some(value) = lines.get(i + 1).and_then(|next| leading_int(next.trim())) {
                return value;
            }
        }
    }

    if let Some(value) = text.split_whitespace().find_map(leading_int) {
        return value;
    }

    if !raw.trim().is_empty() {
        warn!("No numeric value in response: {:?}", raw);
    }
    0
}

/// Joint angle reply terminated by a `j` line.
///
/// Current firmware: `=`, index line, `a, b, c` angle line, `j`.
/// Older firmware: tab separated index line, `a,\tb` angle line, `j`.
pub fn parse_joint_angles(raw: &str) -> Vec<i64> {
    let text = normalize(raw);
    let lines: Vec<&str> = text.split('\n').map(str::trim).collect();

    let Some(j_index) = lines.iter().position(|line| *line == "j") else {
        warn!("Joint angle reply has no end marker");
        return Vec::new();
    };

    if j_index >= 3 && lines[j_index - 3] == "=" {
        let angles: Vec<i64> = lines[j_index - 1]
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .filter_map(leading_int)
            .collect();
        if !angles.is_empty() {
            return angles;
        }
    }

    if j_index >= 2 {
        let angles: Vec<i64> = lines[j_index - 1]
            .split(",\t")
            .filter(|item| !item.is_empty())
            .filter_map(leading_int)
            .collect();
        if !angles.is_empty() {
            return angles;
        }
    }

    warn!("Unable to parse joint angles from reply");
    Vec::new()
}

/// Detected object reported by the camera module
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraFrame {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl CameraFrame {
    pub fn to_vec(&self) -> Vec<f64> {
        vec![self.x, self.y, self.width, self.height]
    }
}

/// Gesture frame with an optional recognised gesture code (0-3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GestureFrame {
    pub value: Option<u8>,
}

impl GestureFrame {
    pub fn code(&self) -> i64 {
        self.value.map(i64::from).unwrap_or(GESTURE_UNKNOWN)
    }
}

/// Decoder for the framed sensor replies (`=` / payload / `X`)
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    camera_block: Regex,
    camera_coords: Regex,
    gesture_block: Regex,
    gesture_empty: Regex,
}

impl FrameDecoder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            camera_block: Regex::new(r"(?i)=\s*\n([^\n]+)\nX")?,
            camera_coords: Regex::new(r"(?i)(-?\d+(?:\.\d+)?)\s+(-?\d+(?:\.\d+)?)\s+size\s*=\s*(\d+)\s+(\d+)")?,
            gesture_block: Regex::new(r"(?i)=\s*\n([0-3])?\s*\nX")?,
            gesture_empty: Regex::new(r"(?i)=\s*\nX")?,
        })
    }

    /// Latest camera frame in the text and the offset where it ends.
    ///
    /// The last `=`/coords/`X` block wins so that stale frames earlier in a
    /// buffer are ignored. Falls back to the legacy tab separated layout.
    pub fn latest_camera_frame(&self, raw: &str) -> Option<(CameraFrame, usize)> {
        let text = normalize(raw);

        let latest = self
            .camera_block
            .captures_iter(&text)
            .filter_map(|block| {
                let end = block.get(0)?.end();
                let frame = self.parse_coords_line(block.get(1)?.as_str())?;
                Some((frame, end))
            })
            .last();
        if latest.is_some() {
            return latest;
        }

        if let Some(found) = self.latest_legacy_frame(&text) {
            return Some(found);
        }

        debug!("No camera frame in {} bytes of text", text.len());
        None
    }

    pub fn parse_camera_frame(&self, raw: &str) -> Option<CameraFrame> {
        self.latest_camera_frame(raw).map(|(frame, _)| frame)
    }

    /// Last tab separated `x y ? ? w h` line followed two lines later by an `X` line.
    /// The offset is where that `X` line ends.
    fn latest_legacy_frame(&self, text: &str) -> Option<(CameraFrame, usize)> {
        let mut lines: Vec<(&str, usize)> = Vec::new();
        let mut start = 0;
        for line in text.split_inclusive('\n') {
            let content = line.trim_end();
            if !content.trim_start().is_empty() {
                lines.push((content.trim_start(), start + content.len()));
            }
            start += line.len();
        }

        (0..lines.len().saturating_sub(2)).rev().find_map(|i| {
            if !lines[i + 2].0.to_ascii_lowercase().contains('x') {
                return None;
            }
            let args: Vec<&str> = lines[i].0.split('\t').filter(|a| !a.is_empty()).collect();
            if args.len() < 6 {
                return None;
            }
            let value = |n: usize| args[n].trim().parse::<f64>().ok();
            let frame = CameraFrame {
                x: value(0)?,
                y: value(1)?,
                width: value(4)?,
                height: value(5)?,
            };
            Some((frame, lines[i + 2].1))
        })
    }

    fn parse_coords_line(&self, line: &str) -> Option<CameraFrame> {
        let caps = self.camera_coords.captures(line)?;
        let value = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<f64>().ok());
        Some(CameraFrame {
            x: value(1)?,
            y: value(2)?,
            width: value(3)?,
            height: value(4)?,
        })
    }

    /// Latest gesture frame in the text and the offset where it ends
    pub fn latest_gesture(&self, raw: &str) -> Option<(GestureFrame, usize)> {
        let text = normalize(raw);

        let with_digit = self.gesture_block.captures_iter(&text).last().and_then(|caps| {
            let end = caps.get(0)?.end();
            let value = caps.get(1).and_then(|m| m.as_str().parse::<u8>().ok());
            Some((GestureFrame { value }, end))
        });
        let empty = self
            .gesture_empty
            .find_iter(&text)
            .last()
            .map(|m| (GestureFrame { value: None }, m.end()));

        match (with_digit, empty) {
            (Some(a), Some(b)) => Some(if b.1 > a.1 { b } else { a }),
            (a, b) => a.or(b),
        }
    }

    /// Gesture code in the text, `-1` when none was reported
    pub fn parse_gesture(&self, raw: &str) -> i64 {
        self.latest_gesture(raw)
            .map(|(frame, _)| frame.code())
            .unwrap_or(GESTURE_UNKNOWN)
    }
}
