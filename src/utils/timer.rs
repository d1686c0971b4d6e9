//! Timer/timeout utility implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use crate::utils::RelibankError;

use tokio::time::{self, Duration, Instant, Sleep};

/// Timer utility for signalling after a given timeout. Supports reseting with
/// a different duration, or with the same duration for fixed retry waits.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, wrapped in a pinned box to support
    /// await multiple times.
    sleep: Pin<Box<Sleep>>,

    /// Timeout duration used by the last kick-off.
    last_dur: Duration,
}

impl Timer {
    /// Creates a new timer utility that immediately times-out after a
    /// zero-length duration.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            last_dur: Duration::ZERO,
        }
    }

    /// Get the last timeout duration used.
    pub fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Restarts the timer with the given duration.
    pub fn restart(&mut self, dur: Duration) -> Result<(), RelibankError> {
        if dur.is_zero() {
            return Err(RelibankError::msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.last_dur = dur;
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Waits for the timer to timeout. Typically, this should be used as a
    /// branch of a `tokio::select!`.
    pub async fn timeout(&mut self) {
        self.sleep.as_mut().await
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod timer_tests {
    use super::*;
    use tokio::time::{Duration, Instant};

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn timer_new() {
        let timer = Timer::new();
        assert!(timer.get_dur().is_zero());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_initial() -> Result<(), RelibankError> {
        let start = Instant::now();
        let mut timer = Timer::new();
        timer.timeout().await; // should complete immediately
        let finish = Instant::now();
        assert!(finish.duration_since(start) < Duration::from_millis(100));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_restart() -> Result<(), RelibankError> {
        let mut timer = Timer::new();
        assert!(timer.restart(Duration::ZERO).is_err());
        // round 1 with 150ms timeout
        let mut start = Instant::now();
        timer.restart(Duration::from_millis(150))?;
        timer.timeout().await;
        let mut finish = Instant::now();
        assert!(finish.duration_since(start) >= Duration::from_millis(150));
        assert_eq!(timer.get_dur(), Duration::from_millis(150));
        // round 2 restarted with the same fixed duration
        start = Instant::now();
        timer.restart(timer.get_dur())?;
        timer.timeout().await;
        finish = Instant::now();
        assert!(finish.duration_since(start) >= Duration::from_millis(150));
        assert_eq!(timer.get_dur(), Duration::from_millis(150));
        Ok(())
    }
}
