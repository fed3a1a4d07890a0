//! Reconnection backoff and abnormal-close escalation.
//!
//! Backoff: `delay(n) = min(base * 2^(n-1), cap)` for attempt `n >= 1`.
//! With the defaults the sequence is 1s, 2s, 4s, 8s, 16s and then the
//! policy gives up (`should_retry(5) == false`).
//!
//! Escalation is a separate, opt-in limit on abnormal closes inside a
//! trailing window. It lets the host fall back to a non-collaborative mode
//! sooner than the retry budget would.

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Exponential backoff with an attempt budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Retries allowed before giving up
    pub max_attempts: u32,
    /// Multiplicative jitter in `[0, 1)`; 0 disables it
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
            jitter: 0.0,
        }
    }
}

impl ReconnectPolicy {
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 0.99);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let mut delay_ms = base_ms.saturating_mul(1u64 << exponent).min(cap_ms);

        if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            delay_ms = ((delay_ms as f64 * factor) as u64).min(cap_ms);
        }

        Duration::from_millis(delay_ms)
    }

    /// Whether another attempt is allowed after `attempt` retries.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Escalate repeated abnormal closes to a terminal error.
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationPolicy {
    /// Abnormal closes inside `window` that trigger escalation; `None` disables it
    pub abnormal_close_limit: Option<u32>,
    /// Trailing observation window
    pub window: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            abnormal_close_limit: None,
            window: Duration::from_secs(10),
        }
    }
}

impl EscalationPolicy {
    /// Escalate after `limit` abnormal closes within `window`.
    pub fn after(limit: u32, window: Duration) -> Self {
        Self {
            abnormal_close_limit: Some(limit),
            window,
        }
    }
}

/// Timestamps of recent abnormal closes.
#[derive(Debug, Default)]
pub struct AbnormalCloseTracker {
    closes: VecDeque<Instant>,
}

impl AbnormalCloseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an abnormal close at `now`.
    ///
    /// Returns `true` if the policy says to stop retrying.
    pub fn record(&mut self, policy: &EscalationPolicy, now: Instant) -> bool {
        let Some(limit) = policy.abnormal_close_limit else {
            return false;
        };

        self.closes.push_back(now);
        while let Some(&oldest) = self.closes.front() {
            if now.duration_since(oldest) > policy.window {
                self.closes.pop_front();
            } else {
                break;
            }
        }

        self.closes.len() >= limit as usize
    }

    /// Closes currently inside the window.
    pub fn recent(&self) -> usize {
        self.closes.len()
    }

    pub fn reset(&mut self) {
        self.closes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u128> = (1..=5).map(|n| policy.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(6), Duration::from_millis(30_000));
        assert_eq!(policy.delay(40), Duration::from_millis(30_000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(30_000));
    }

    #[test]
    fn test_should_retry_budget() {
        let policy = ReconnectPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!policy.should_retry(6));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = ReconnectPolicy::default().with_jitter(0.5);
        for attempt in 1..=8 {
            let plain = ReconnectPolicy::default().delay(attempt).as_millis() as f64;
            let jittered = policy.delay(attempt).as_millis() as f64;
            assert!(jittered >= plain * 0.5 - 1.0);
            assert!(jittered <= 30_000.0);
        }
    }

    #[test]
    fn test_escalation_disabled_by_default() {
        let policy = EscalationPolicy::default();
        let mut tracker = AbnormalCloseTracker::new();
        let now = Instant::now();
        for _ in 0..100 {
            assert!(!tracker.record(&policy, now));
        }
        assert_eq!(tracker.recent(), 0);
    }

    #[test]
    fn test_escalation_within_window() {
        let policy = EscalationPolicy::after(3, Duration::from_secs(10));
        let mut tracker = AbnormalCloseTracker::new();
        let start = Instant::now();

        assert!(!tracker.record(&policy, start));
        assert!(!tracker.record(&policy, start + Duration::from_secs(2)));
        assert!(tracker.record(&policy, start + Duration::from_secs(4)));
    }

    #[test]
    fn test_escalation_window_slides() {
        let policy = EscalationPolicy::after(3, Duration::from_secs(10));
        let mut tracker = AbnormalCloseTracker::new();
        let start = Instant::now();

        assert!(!tracker.record(&policy, start));
        assert!(!tracker.record(&policy, start + Duration::from_secs(8)));
        // First close has aged out.
        assert!(!tracker.record(&policy, start + Duration::from_secs(15)));
        assert_eq!(tracker.recent(), 2);
    }

    #[test]
    fn test_tracker_reset() {
        let policy = EscalationPolicy::after(2, Duration::from_secs(10));
        let mut tracker = AbnormalCloseTracker::new();
        let now = Instant::now();
        tracker.record(&policy, now);
        tracker.reset();
        assert!(!tracker.record(&policy, now));
    }
}
