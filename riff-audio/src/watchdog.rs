//! Render heartbeat watchdog

use crate::error::EngineError;
use std::time::{Duration, Instant};

/// Flags a stall when the heartbeat stops while rendering is expected
#[derive(Debug)]
pub struct Watchdog {
    interval: Duration,
    last_heartbeat: u64,
    last_progress: Option<Instant>,
}

impl Watchdog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_heartbeat: 0,
            last_progress: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start a fresh interval, e.g. after rebuilding the stream
    pub fn reset(&mut self, heartbeat: u64, now: Instant) {
        self.last_heartbeat = heartbeat;
        self.last_progress = Some(now);
    }

    /// `expected` is whether blocks should currently be arriving
    pub fn check(&mut self, heartbeat: u64, expected: bool, now: Instant) -> Result<(), EngineError> {
        let last = *self.last_progress.get_or_insert(now);

        if !expected || heartbeat != self.last_heartbeat {
            self.reset(heartbeat, now);
            return Ok(());
        }

        let stalled_for = now.saturating_duration_since(last);
        if stalled_for >= self.interval {
            return Err(EngineError::EngineStall { stalled_for });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advancing_heartbeat_is_healthy() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(Duration::from_millis(500));
        for i in 0..10u64 {
            let now = start + Duration::from_millis(i * 400);
            assert!(watchdog.check(i, true, now).is_ok());
        }
    }

    #[test]
    fn test_stuck_heartbeat_reports_stall() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(Duration::from_millis(500));
        assert!(watchdog.check(3, true, start).is_ok());
        assert!(watchdog.check(3, true, start + Duration::from_millis(499)).is_ok());

        match watchdog.check(3, true, start + Duration::from_millis(600)) {
            Err(EngineError::EngineStall { stalled_for }) => {
                assert_eq!(stalled_for, Duration::from_millis(600));
            }
            other => panic!("expected stall, got {:?}", other),
        }
    }

    #[test]
    fn test_idle_pipeline_never_stalls() {
        let start = Instant::now();
        let mut watchdog = Watchdog::new(Duration::from_millis(500));
        assert!(watchdog.check(0, false, start).is_ok());
        assert!(watchdog.check(0, false, start + Duration::from_secs(5)).is_ok());
        // Expectation starts a fresh interval
        assert!(watchdog.check(0, true, start + Duration::from_millis(5100)).is_ok());
    }
}
