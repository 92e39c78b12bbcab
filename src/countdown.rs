//! Pre-capture countdown
//!
//! Purely time-driven: shows `ticks` at start, decrements once per interval,
//! and completes when the count reaches zero. A countdown completes at most once.

use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_TICKS: u32 = 3;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// `tokio::time::interval` rejects a zero period
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CountdownError {
    #[error("countdown cancelled")]
    Cancelled,
    #[error("countdown already completed")]
    AlreadyCompleted,
}

pub struct Countdown {
    ticks: u32,
    interval: Duration,
    completed: bool,
}

impl Countdown {
    pub fn new(ticks: u32, interval: Duration) -> Self {
        Self {
            ticks,
            interval: interval.max(MIN_INTERVAL),
            completed: false,
        }
    }

    /// Run the countdown, calling `on_tick` with each displayed count
    /// (`ticks`, `ticks - 1`, ..., `1`).
    pub async fn run(
        &mut self,
        cancel: &CancellationToken,
        mut on_tick: impl FnMut(u32),
    ) -> Result<(), CountdownError> {
        if self.completed {
            return Err(CountdownError::AlreadyCompleted);
        }
        if cancel.is_cancelled() {
            return Err(CountdownError::Cancelled);
        }

        let mut remaining = self.ticks;
        let mut timer = interval(self.interval);
        // First tick fires immediately
        timer.tick().await;

        while remaining > 0 {
            on_tick(remaining);

            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("Countdown cancelled at {}", remaining);
                    return Err(CountdownError::Cancelled);
                }
                _ = timer.tick() => {}
            }
            remaining -= 1;
        }

        self.completed = true;
        Ok(())
    }
}

impl Default for Countdown {
    fn default() -> Self {
        Self::new(DEFAULT_TICKS, DEFAULT_INTERVAL)
    }
}
