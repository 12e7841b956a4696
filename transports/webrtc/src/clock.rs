//! Wall clock abstraction used for latency display

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time in seconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> f64;
}

/// System wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_past_2020() {
        assert!(SystemClock.now_secs() > 1_577_836_800.0);
    }
}
