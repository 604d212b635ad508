//! Retry backoff and per-device retry budgets.

use std::collections::HashMap;
use std::time::Duration;
use vitalsync_types::DeviceId;

/// Exponential backoff: `min(base * 2^attempt, max)` plus optional jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay for attempt zero.
    pub base: Duration,
    /// Upper bound before jitter.
    pub max: Duration,
    /// Upper bound of the random jitter added on top.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: Duration::ZERO,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        // 2^31 already overflows any sane base; clamp the shift
        let factor = 1u32 << attempt.min(31);
        let base = self.base.checked_mul(factor).unwrap_or(self.max).min(self.max);
        base + self.random_jitter()
    }

    fn random_jitter(&self) -> Duration {
        let max_ms = self.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        Duration::from_millis(u64::from_le_bytes(bytes) % (max_ms + 1))
    }
}

/// Caps how many retries one device may consume per window.
///
/// Keeps a flapping peer from monopolizing the queue. Times are ms.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    per_window: u32,
    window_ms: u64,
    usage: HashMap<DeviceId, (u64, u32)>,
}

impl RetryBudget {
    /// Allow `per_window` retries per device every `window`.
    pub fn new(per_window: u32, window: Duration) -> Self {
        Self {
            per_window,
            window_ms: window.as_millis() as u64,
            usage: HashMap::new(),
        }
    }

    /// Consume one retry for `peer`. Returns false when exhausted.
    pub fn try_acquire(&mut self, peer: &DeviceId, now: u64) -> bool {
        let window_ms = self.window_ms;
        let entry = self.usage.entry(*peer).or_insert((now, 0));
        if now.saturating_sub(entry.0) >= window_ms {
            *entry = (now, 0);
        }
        if entry.1 >= self.per_window {
            return false;
        }
        entry.1 += 1;
        true
    }

    /// Retries left for `peer` in the current window.
    pub fn remaining(&self, peer: &DeviceId, now: u64) -> u32 {
        match self.usage.get(peer) {
            Some((start, used)) if now.saturating_sub(*start) < self.window_ms => {
                self.per_window.saturating_sub(*used)
            }
            _ => self.per_window,
        }
    }

    /// When `peer`'s current window ends.
    pub fn window_end(&self, peer: &DeviceId, now: u64) -> u64 {
        match self.usage.get(peer) {
            Some((start, _)) if now.saturating_sub(*start) < self.window_ms => {
                start + self.window_ms
            }
            _ => now,
        }
    }

    /// Forget a device's usage.
    pub fn reset(&mut self, peer: &DeviceId) {
        self.usage.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> DeviceId {
        DeviceId::random()
    }

    // ===== Backoff =====

    #[test]
    fn backoff_doubles_until_cap() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn backoff_jitter_stays_in_bounds() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(2),
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
        };
        for _ in 0..50 {
            let delay = policy.delay(1);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_millis(4_500));
        }
    }

    // ===== Budget =====

    #[test]
    fn budget_exhausts_within_window() {
        let mut budget = RetryBudget::new(2, Duration::from_secs(60));
        let p = peer();

        assert!(budget.try_acquire(&p, 0));
        assert!(budget.try_acquire(&p, 10));
        assert!(!budget.try_acquire(&p, 20));
        assert_eq!(budget.remaining(&p, 20), 0);
        assert_eq!(budget.window_end(&p, 20), 60_000);
    }

    #[test]
    fn budget_refills_next_window() {
        let mut budget = RetryBudget::new(1, Duration::from_secs(1));
        let p = peer();

        assert!(budget.try_acquire(&p, 0));
        assert!(!budget.try_acquire(&p, 500));
        assert!(budget.try_acquire(&p, 1_000));
    }

    #[test]
    fn budgets_are_per_device() {
        let mut budget = RetryBudget::new(1, Duration::from_secs(60));
        let (a, b) = (peer(), peer());

        assert!(budget.try_acquire(&a, 0));
        assert!(budget.try_acquire(&b, 0));
        assert!(!budget.try_acquire(&a, 0));
        budget.reset(&a);
        assert!(budget.try_acquire(&a, 0));
    }
}
