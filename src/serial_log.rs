//! Shared log of text received on the serial link
//!
//! A single listener appends everything the device prints; executors read
//! it to wait for completion tokens and to pick up camera and gesture
//! frames. Positions are absolute byte offsets since the log was created, so
//! they keep increasing when old text is dropped and can serve as frame keys.

use async_trait::async_trait;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use crate::{
    policy::CompletionOutcome,
    response::{CameraFrame, FrameDecoder, GestureFrame},
    transport::{FrameKey, FrameSource, TokenWaiter},
    BlockError, Result,
};

#[derive(Debug)]
struct LogInner {
    text: String,
    /// Absolute offset of `text[0]`
    base: u64,
    capacity: usize,
}

/// Single-writer, multi-reader log of serial output
#[derive(Debug)]
pub struct SerialLog {
    inner: RwLock<LogInner>,
    changed: Notify,
    decoder: FrameDecoder,
}

impl SerialLog {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BlockError::Config("Serial log capacity must be positive".to_string()));
        }
        Ok(Self {
            inner: RwLock::new(LogInner {
                text: String::new(),
                base: 0,
                capacity,
            }),
            changed: Notify::new(),
            decoder: FrameDecoder::new()?,
        })
    }

    /// Append received text. Carriage returns are dropped; the oldest whole
    /// lines are discarded once the capacity is exceeded.
    pub fn append(&self, chunk: &str) {
        let cleaned: String = chunk.chars().filter(|c| *c != '\r').collect();
        if cleaned.is_empty() {
            return;
        }
        match self.inner.write() {
            Ok(mut inner) => {
                inner.text.push_str(&cleaned);
                if inner.text.len() > inner.capacity {
                    let mut cut = inner.text.len() - inner.capacity;
                    while !inner.text.is_char_boundary(cut) {
                        cut += 1;
                    }
                    if let Some(newline) = inner.text[cut..].find('\n') {
                        cut += newline + 1;
                    }
                    inner.text.drain(..cut);
                    inner.base += cut as u64;
                }
            }
            Err(e) => {
                warn!("Serial log lock poisoned: {}", e);
                return;
            }
        }
        self.changed.notify_waiters();
    }

    /// Absolute offset just past the last received byte
    pub fn end(&self) -> u64 {
        self.inner
            .read()
            .map(|inner| inner.base + inner.text.len() as u64)
            .unwrap_or(0)
    }

    /// Copy of the retained text
    pub fn snapshot(&self) -> String {
        self.inner.read().map(|inner| inner.text.clone()).unwrap_or_default()
    }

    /// Retained text with its absolute starting offset
    fn snapshot_with_base(&self) -> (u64, String) {
        self.inner
            .read()
            .map(|inner| (inner.base, inner.text.clone()))
            .unwrap_or_default()
    }

    /// Complete lines that start at or after `after`
    fn lines_after(&self, after: u64) -> Vec<String> {
        let (base, text) = self.snapshot_with_base();
        let mut start = after.saturating_sub(base) as usize;
        if start > text.len() {
            return Vec::new();
        }
        while !text.is_char_boundary(start) {
            start += 1;
        }
        let mut tail = &text[start..];
        let mid_line = start > 0 && !text[..start].ends_with('\n');
        if mid_line {
            tail = match tail.find('\n') {
                Some(newline) => &tail[newline + 1..],
                None => "",
            };
        }
        let complete = match tail.rfind('\n') {
            Some(last) => &tail[..last],
            None => return Vec::new(),
        };
        complete.split('\n').map(|line| line.trim().to_string()).collect()
    }

    fn latest_camera(&self) -> Option<(CameraFrame, FrameKey)> {
        let (base, text) = self.snapshot_with_base();
        self.decoder
            .latest_camera_frame(&text)
            .map(|(frame, end)| (frame, FrameKey(base + end as u64)))
    }

    fn latest_gesture(&self) -> Option<(GestureFrame, FrameKey)> {
        let (base, text) = self.snapshot_with_base();
        self.decoder
            .latest_gesture(&text)
            .map(|(frame, end)| (frame, FrameKey(base + end as u64)))
    }

    /// Poll `probe` on every append until it yields a value or the deadline passes
    async fn wait_until<T>(&self, timeout: Duration, probe: impl Fn() -> Option<T>) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(found) = probe() {
                return Some(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return probe();
            }
        }
    }
}

#[async_trait]
impl TokenWaiter for SerialLog {
    fn mark(&self) -> u64 {
        self.end()
    }

    async fn wait_for_token(&self, token: char, after: u64, timeout: Duration) -> CompletionOutcome {
        let expected = token.to_string();
        let found = self
            .wait_until(timeout, || {
                self.lines_after(after).iter().any(|line| *line == expected).then_some(())
            })
            .await;
        match found {
            Some(()) => {
                debug!("Completion token '{}' received", token);
                CompletionOutcome::Acknowledged
            }
            None => CompletionOutcome::TimedOut,
        }
    }
}

#[async_trait]
impl FrameSource for SerialLog {
    fn latest_camera_key(&self) -> Option<FrameKey> {
        self.latest_camera().map(|(_, key)| key)
    }

    fn latest_gesture_key(&self) -> Option<FrameKey> {
        self.latest_gesture().map(|(_, key)| key)
    }

    async fn wait_for_new_camera_frame(
        &self,
        previous: Option<FrameKey>,
        timeout: Duration,
    ) -> Option<(CameraFrame, FrameKey)> {
        self.wait_until(timeout, || {
            self.latest_camera().filter(|(_, key)| Some(*key) != previous)
        })
        .await
    }

    async fn wait_for_new_gesture(
        &self,
        previous: Option<FrameKey>,
        timeout: Duration,
    ) -> Option<(GestureFrame, FrameKey)> {
        self.wait_until(timeout, || {
            self.latest_gesture().filter(|(_, key)| Some(*key) != previous)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_append_and_trim_keeps_absolute_offsets() {
        let log = SerialLog::new(16).unwrap();
        log.append("first line\r\n");
        assert_eq!(log.end(), 11);
        log.append("second line\n");
        assert_eq!(log.end(), 23);
        assert_eq!(log.snapshot(), "second line\n");
    }

    #[test]
    fn test_lines_after_skips_partial_and_old_lines() {
        let log = SerialLog::new(1024).unwrap();
        log.append("k\nksi");
        let mark = log.mark();
        log.append("t\nk\npartial");
        assert_eq!(log.lines_after(mark), vec!["k".to_string()]);
        assert_eq!(log.lines_after(0), vec!["k", "ksit", "k"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_wait_acknowledged() {
        let log = Arc::new(SerialLog::new(1024).unwrap());
        log.append("k\n");
        let mark = log.mark();
        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            writer.append("ksit\n");
            tokio::time::sleep(Duration::from_millis(300)).await;
            writer.append("k\n");
        });
        let outcome = log.wait_for_token('k', mark, Duration::from_secs(2)).await;
        assert_eq!(outcome, CompletionOutcome::Acknowledged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_wait_ignores_earlier_echo() {
        let log = SerialLog::new(1024).unwrap();
        log.append("m\n");
        let outcome = log.wait_for_token('m', log.mark(), Duration::from_millis(500)).await;
        assert_eq!(outcome, CompletionOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_camera_frame_detection() {
        let log = Arc::new(SerialLog::new(4096).unwrap());
        log.append("=\n-23.00 20.00 size = 42 56\nX\n");
        let first = log.latest_camera_key();
        assert!(first.is_some());

        // Same frame is not reported twice
        assert!(log.wait_for_new_camera_frame(first, Duration::from_millis(100)).await.is_none());

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer.append("=\n10.00 -5.00 size = 30 31\nX\n");
        });
        let (frame, key) = log
            .wait_for_new_camera_frame(first, Duration::from_millis(1000))
            .await
            .unwrap();
        assert_eq!(frame.to_vec(), vec![10.0, -5.0, 30.0, 31.0]);
        assert!(Some(key) > first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_legacy_camera_frame_key_is_stable() {
        let log = Arc::new(SerialLog::new(4096).unwrap());
        log.append("12.5\t-3\t0\t0\t40\t30\nok\nX\n");
        let first = log.latest_camera_key();
        assert_eq!(first, Some(FrameKey(22)));

        // Unrelated output does not make the old frame look new
        log.append("unrelated chatter\n");
        assert_eq!(log.latest_camera_key(), first);
        assert!(log.wait_for_new_camera_frame(first, Duration::from_millis(100)).await.is_none());

        log.append("1\t2\t0\t0\t3\t4\nok\nX\n");
        let (frame, key) = log
            .wait_for_new_camera_frame(first, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(frame.to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(Some(key) > first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gesture_frames() {
        let log = SerialLog::new(4096).unwrap();
        log.append("=\n2\nX\n");
        let (frame, key) = log.wait_for_new_gesture(None, Duration::from_millis(100)).await.unwrap();
        assert_eq!(frame.code(), 2);

        log.append("=\nX\n");
        let (frame, _) = log.wait_for_new_gesture(Some(key), Duration::from_millis(100)).await.unwrap();
        assert_eq!(frame.code(), -1);
    }
}
