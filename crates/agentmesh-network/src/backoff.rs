//! Exponential reconnection backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `ceiling`, with up
/// to 20% random jitter subtracted so that agents that lost the bus together do
/// not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    ceiling: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, ceiling: Duration) -> Self {
        Self {
            base: base.max(Duration::from_millis(1)),
            ceiling: ceiling.max(base),
            attempt: 0,
        }
    }

    /// Delay before the next attempt, without jitter.
    pub fn peek(&self) -> Duration {
        let exp = 2u32.saturating_pow(self.attempt.min(31));
        self.base.saturating_mul(exp).min(self.ceiling)
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.peek();
        self.attempt = self.attempt.saturating_add(1);
        let jitter_ms = (delay.as_millis() as u64) / 5;
        if jitter_ms == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        delay.saturating_sub(Duration::from_millis(jitter))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_ceiling() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(700));
        assert_eq!(b.peek(), Duration::from_millis(100));
        b.next_delay();
        assert_eq!(b.peek(), Duration::from_millis(200));
        b.next_delay();
        assert_eq!(b.peek(), Duration::from_millis(400));
        b.next_delay();
        assert_eq!(b.peek(), Duration::from_millis(700));
        for _ in 0..50 {
            b.next_delay();
        }
        assert_eq!(b.peek(), Duration::from_millis(700));
    }

    #[test]
    fn test_jitter_stays_within_twenty_percent() {
        let mut b = Backoff::new(Duration::from_millis(1000), Duration::from_secs(60));
        let delay = b.next_delay();
        assert!(delay <= Duration::from_millis(1000));
        assert!(delay >= Duration::from_millis(800));
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut b = Backoff::new(Duration::from_millis(50), Duration::from_secs(1));
        b.next_delay();
        b.next_delay();
        assert_eq!(b.attempt(), 2);
        b.reset();
        assert_eq!(b.attempt(), 0);
        assert_eq!(b.peek(), Duration::from_millis(50));
    }
}
