use std::time::Duration;

/// Reconnect backoff. `fixed` policies keep the same delay for every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    /// Constant delay regardless of attempt number.
    pub fn fixed(delay_ms: u64) -> Self {
        Self::new(delay_ms, delay_ms)
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        let bounded = calculated.max(hinted).min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }
}

impl Default for RetryPolicy {
    /// The browser client reconnects every 5 s.
    fn default() -> Self {
        Self::fixed(5_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnects_every_five_seconds() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0, None), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(4, None), Duration::from_secs(5));
    }

    #[test]
    fn scales_exponentially_up_to_max() {
        let policy = RetryPolicy::new(100, 1_000);
        assert_eq!(
            policy.delay_for_attempt(3, None),
            Duration::from_millis(800)
        );
        assert_eq!(
            policy.delay_for_attempt(5, None),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn retry_after_hint_is_still_capped() {
        let policy = RetryPolicy::new(500, 20_000);
        assert_eq!(
            policy.delay_for_attempt(1, Some(10_000)),
            Duration::from_millis(10_000)
        );
        assert_eq!(
            policy.delay_for_attempt(1, Some(60_000)),
            Duration::from_millis(20_000)
        );
    }
}
