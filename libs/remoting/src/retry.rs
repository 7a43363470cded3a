//! Retry budget for invocations.

use std::time::Duration;

use remoting_config::InvocationSettings;

/// Interval sequence plus a retry cap.
///
/// Retry `n` (zero based) waits `intervals[n]`; once the sequence is used up
/// the last interval repeats until `max_retries` is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    intervals: Vec<Duration>,
    max_retries: usize,
}

impl RetryPolicy {
    /// `max_retries` defaults to the number of intervals
    pub fn new(intervals: Vec<Duration>, max_retries: Option<usize>) -> Self {
        let max_retries = max_retries.unwrap_or(intervals.len());
        Self {
            intervals,
            max_retries,
        }
    }

    /// Never retry
    pub fn none() -> Self {
        Self::new(Vec::new(), Some(0))
    }

    pub fn from_settings(settings: &InvocationSettings) -> Self {
        Self::new(settings.retry_intervals(), settings.max_retries)
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Wait before retry number `retry`, or `None` when the budget is spent
    pub fn interval(&self, retry: usize) -> Option<Duration> {
        if retry >= self.max_retries {
            return None;
        }
        self.intervals
            .get(retry)
            .or_else(|| self.intervals.last())
            .copied()
            .or(Some(Duration::ZERO))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&InvocationSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    #[test]
    fn test_default_is_one_immediate_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.interval(0), Some(Duration::ZERO));
        assert_eq!(policy.interval(1), None);
    }

    #[test]
    fn test_budget_follows_sequence_length() {
        let policy = RetryPolicy::new(ms(&[0, 1, 10, 1]), None);
        let waits: Vec<_> = (0..5).map(|n| policy.interval(n)).collect();
        assert_eq!(
            waits,
            vec![
                Some(Duration::ZERO),
                Some(Duration::from_millis(1)),
                Some(Duration::from_millis(10)),
                Some(Duration::from_millis(1)),
                None
            ]
        );
    }

    #[test]
    fn test_last_interval_repeats_up_to_max() {
        let policy = RetryPolicy::new(ms(&[5, 50]), Some(4));
        assert_eq!(policy.interval(2), Some(Duration::from_millis(50)));
        assert_eq!(policy.interval(3), Some(Duration::from_millis(50)));
        assert_eq!(policy.interval(4), None);
    }

    #[test]
    fn test_shorter_max_truncates_sequence() {
        let policy = RetryPolicy::new(ms(&[0, 10, 20]), Some(1));
        assert_eq!(policy.interval(0), Some(Duration::ZERO));
        assert_eq!(policy.interval(1), None);
        assert_eq!(RetryPolicy::none().interval(0), None);
    }
}
