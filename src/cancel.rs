//! Cooperative cancellation and interruptible delays
//!
//! A stop request is only observed at checkpoints: before a send, at every
//! loop head and between delay chunks. A transport call that is already in
//! flight is never interrupted.

use std::future::Future;
use std::sync::{Arc, atomic::{AtomicBool, Ordering}};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};
use crate::{BlockError, Result};

/// Default spacing of cancellation checkpoints inside a delay
pub const CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Stop flag shared by everything executing one script
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    stop: Arc<AtomicBool>,
    notify: Arc<Notify>,
    check_interval: Duration,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::with_check_interval(CHECK_INTERVAL)
    }

    pub fn with_check_interval(check_interval: Duration) -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            check_interval,
        }
    }

    /// Ask the running script to stop at its next checkpoint
    pub fn request_stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            info!("Stop requested");
        }
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Clear a previous stop request before starting a new run
    pub fn reset(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    /// Checkpoint: fail with `Cancelled` if a stop was requested
    pub fn check(&self) -> Result<()> {
        if self.is_stopped() {
            Err(BlockError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Loop-head checkpoint; also yields so a tight loop cannot starve the stop request
    pub async fn check_in_loop(&self) -> Result<()> {
        self.check()?;
        tokio::task::yield_now().await;
        self.check()
    }

    /// Resolves once a stop has been requested
    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }

    /// Run a future, abandoning it when a stop is requested
    pub async fn guard<F: Future>(&self, future: F) -> Result<F::Output> {
        self.check()?;
        tokio::select! {
            output = future => Ok(output),
            _ = self.stopped() => Err(BlockError::Cancelled),
        }
    }

    /// Interruptible delay.
    ///
    /// Short delays get one checkpoint and one sleep. Longer delays are split
    /// into chunks of at most `check_interval`, with a checkpoint before each.
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        if delay <= self.check_interval {
            self.check()?;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            return Ok(());
        }

        let interval = self.check_interval.as_millis().max(1);
        let total = delay.as_millis();
        let chunks = total.div_ceil(interval);
        debug!("Delaying {}ms in {} chunks", total, chunks);
        for i in 0..chunks {
            self.check()?;
            let chunk = interval.min(total - i * interval);
            tokio::time::sleep(Duration::from_millis(chunk as u64)).await;
        }
        Ok(())
    }
}

/// Convert a block delay in seconds to whole milliseconds
pub fn delay_from_secs(seconds: f64) -> Duration {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_millis((seconds * 1000.0).round() as u64)
}
