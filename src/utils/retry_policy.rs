/// Exponential backoff schedule spread over a fixed total retry budget.
///
/// For `new(3, 10, 1.5)` the per-attempt delays come out to roughly 2s, 3s
/// and 5s, so all retries complete within ~10 seconds.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExponentialBackoff {
    max_retries: u64,
    total_retry_time: u64,
    multiplier: f64,
}

impl ExponentialBackoff {
    pub(crate) fn new(max_retries: u64, total_retry_time: u64, multiplier: f64) -> Self {
        Self {
            max_retries,
            total_retry_time,
            multiplier,
        }
    }

    /// Getter for `max_retries`
    pub(crate) fn max_retries(&self) -> u64 {
        self.max_retries
    }

    /// Delay in seconds before the given attempt (1-based).
    pub(crate) fn get_delay(&self, attempt: u64) -> u64 {
        if self.max_retries == 0 {
            return 0;
        }

        // Scale a geometric series so the delays sum to total_retry_time.
        let geometric_sum = (self.multiplier.powi(self.max_retries as i32) - 1.0)
            / (self.multiplier - 1.0);
        let base = self.total_retry_time as f64 / geometric_sum;
        let exponent = attempt.saturating_sub(1).min(self.max_retries) as i32;

        (base * self.multiplier.powi(exponent)).round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_fill_the_retry_budget() {
        let policy = ExponentialBackoff::new(3, 10, 1.5);
        assert_eq!(policy.get_delay(1), 2);
        assert_eq!(policy.get_delay(2), 3);
        assert_eq!(policy.get_delay(3), 5);
    }

    #[test]
    fn delays_grow_monotonically() {
        let policy = ExponentialBackoff::new(5, 60, 2.0);
        let delays: Vec<u64> = (1..=5).map(|a| policy.get_delay(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }
}
