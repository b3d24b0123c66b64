//! Retry backoff policy for failed tasks.
//!
//! Exponential in the number of prior attempts, scaled down for urgent
//! work, with jitter so synchronized failures do not re-enqueue in
//! lockstep.

use crate::models::Priority;
use rand::Rng;
use std::time::Duration;

/// Priority scaling: urgent work comes back sooner.
fn priority_factor(priority: Priority) -> f64 {
    match priority {
        Priority::Critical => 0.25,
        Priority::High => 0.5,
        Priority::Normal => 1.0,
        Priority::Low => 2.0,
    }
}

/// Backoff before re-enqueueing attempt `retry_count + 1`.
pub fn backoff_for(base: Duration, priority: Priority, retry_count: u32) -> Duration {
    let exp = 2u32.saturating_pow(retry_count.min(16));
    let scaled = base.as_secs_f64() * exp as f64 * priority_factor(priority);
    let jitter = rand::thread_rng().gen_range(0.0..=0.25);
    Duration::from_secs_f64(scaled * (1.0 + jitter))
}

/// Whether a task that just failed gets another run. `retry_count` is
/// the number of prior re-enqueues; the total attempt budget counts the
/// first run.
pub fn should_retry(retry_count: u32, max_attempts: u32) -> bool {
    retry_count + 1 < max_attempts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially() {
        let base = Duration::from_secs(2);
        let first = backoff_for(base, Priority::Normal, 0);
        let second = backoff_for(base, Priority::Normal, 1);
        let third = backoff_for(base, Priority::Normal, 2);

        // Jitter adds at most 25%, so the doubling always dominates.
        assert!(first >= Duration::from_secs(2));
        assert!(first <= Duration::from_secs_f64(2.5));
        assert!(second >= Duration::from_secs(4));
        assert!(third >= Duration::from_secs(8));
    }

    #[test]
    fn critical_retries_come_back_sooner_than_low() {
        let base = Duration::from_secs(2);
        let critical = backoff_for(base, Priority::Critical, 0);
        let low = backoff_for(base, Priority::Low, 0);
        assert!(critical < low);
        assert!(critical <= Duration::from_secs_f64(0.625));
        assert!(low >= Duration::from_secs(4));
    }

    #[test]
    fn attempt_budget_counts_the_first_run() {
        // Default budget of 3: first run plus two retries.
        assert!(should_retry(0, 3));
        assert!(should_retry(1, 3));
        assert!(!should_retry(2, 3));
        assert!(!should_retry(0, 1));
    }

    #[test]
    fn large_retry_counts_do_not_overflow() {
        let backoff = backoff_for(Duration::from_secs(2), Priority::Normal, 40);
        assert!(backoff > Duration::from_secs(1));
    }
}
