//! Shared exponential-backoff-with-full-jitter policy, used by the Helix
//! retry loop (C7) and the WebSocket session's reconnect loop (C8) —
//! spec.md §4.7 and §4.8 specify the same shape for both.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// 500ms doubling, capped at 30s, with full jitter (C7's defaults).
    pub fn helix_default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }

    /// Delay for the next attempt, with full jitter applied, then advances
    /// the internal attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.as_millis().saturating_mul(1u128 << self.attempt.min(20));
        let capped = exp.min(self.cap.as_millis());
        self.attempt += 1;
        let jittered = rand::thread_rng().gen_range(0..=capped.max(1));
        Duration::from_millis(jittered as u64)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_cap() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));
        for _ in 0..10 {
            let d = b.next_delay();
            assert!(d <= Duration::from_secs(30));
        }
    }

    #[test]
    fn attempt_counter_advances() {
        let mut b = Backoff::helix_default();
        assert_eq!(b.attempt(), 0);
        b.next_delay();
        assert_eq!(b.attempt(), 1);
        b.next_delay();
        assert_eq!(b.attempt(), 2);
    }
}
