//! Time sources for lock timestamps
//!
//! Lock records carry wall-clock milliseconds so that independent processes
//! can compare them. Tests run on tokio's paused clock, which `Utc::now()`
//! knows nothing about, so the coordinator reads time through [`Clock`].

use chrono::Utc;
use std::fmt;
use tokio::time::Instant;

/// Source of "now" in milliseconds since the Unix epoch
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in epoch milliseconds
    fn now_ms(&self) -> i64;
}

/// Wall clock backed by `chrono::Utc`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock anchored to tokio's time driver
///
/// Reports `origin_ms` plus the tokio time elapsed since construction. Under
/// `tokio::time::pause()` it advances only when the runtime advances time.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin_ms: i64,
    started: Instant,
}

impl TokioClock {
    /// Anchor at the current wall-clock time
    pub fn new() -> Self {
        Self::with_origin(Utc::now().timestamp_millis())
    }

    /// Anchor at a fixed epoch offset
    pub fn with_origin(origin_ms: i64) -> Self {
        Self {
            origin_ms,
            started: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.origin_ms.saturating_add(elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_system_clock_is_recent() {
        let now = SystemClock.now_ms();
        let reference = Utc::now().timestamp_millis();
        assert!((reference - now).abs() < 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::with_origin(0);
        assert_eq!(clock.now_ms(), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(clock.now_ms(), 5_000);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(clock.now_ms(), 5_250);
    }
}
