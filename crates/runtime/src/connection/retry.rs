use std::time::Duration;

/// Linear reconnection backoff: attempt `n` waits `n * base_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
	pub base_delay: Duration,
	/// Reconnection attempts after the initial failure. Zero disables retries.
	pub max_attempts: u32,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_secs(2),
			max_attempts: 5,
		}
	}
}

impl RetryPolicy {
	pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
		Self { base_delay, max_attempts }
	}

	/// Delay before the 1-based `attempt`.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		self.base_delay.saturating_mul(attempt.max(1))
	}

	/// Whether another attempt is allowed after `attempts_made` retries.
	pub fn allows(&self, attempts_made: u32) -> bool {
		attempts_made < self.max_attempts
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_delays_grow_linearly() {
		let policy = RetryPolicy::default();
		assert_eq!(policy.delay_for(1), Duration::from_secs(2));
		assert_eq!(policy.delay_for(3), Duration::from_secs(6));
		assert_eq!(policy.delay_for(5), Duration::from_secs(10));
	}

	#[test]
	fn test_budget_is_bounded() {
		let policy = RetryPolicy::new(Duration::from_millis(10), 2);
		assert!(policy.allows(0));
		assert!(policy.allows(1));
		assert!(!policy.allows(2));
		assert!(!RetryPolicy::new(Duration::ZERO, 0).allows(0));
	}
}
