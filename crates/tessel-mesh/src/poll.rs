//! Adaptive poll timeout.

use std::time::Duration;

use crate::config::Config;

/// Poll timeout that doubles while idle and snaps back on activity.
///
/// Idle loops settle at `max`, which bounds CPU use; any activity drops
/// the timeout to `min` so the next message is picked up quickly.
#[derive(Clone, Debug)]
pub struct Backoff {
    current: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            current: min,
            min,
            max,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.poll_min, config.poll_max)
    }

    /// Timeout for the next poll.
    pub fn timeout(&self) -> Duration {
        self.current
    }

    pub fn on_idle(&mut self) {
        self.current = (self.current * 2).min(self.max);
        if self.current.is_zero() {
            self.current = self.max;
        }
    }

    pub fn on_activity(&mut self) {
        self.current = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(10));
        let mut seen = vec![backoff.timeout()];
        for _ in 0..5 {
            backoff.on_idle();
            seen.push(backoff.timeout());
        }
        let ms: Vec<u128> = seen.iter().map(|d| d.as_millis()).collect();
        assert_eq!(ms, vec![1, 2, 4, 8, 10, 10]);

        backoff.on_activity();
        assert_eq!(backoff.timeout(), Duration::from_millis(1));
    }
}
