use std::time::Duration;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
/// Exponential backoff used for consumer poll retries and dead letter sends.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Duration,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: Duration,
        maximum_interval: Duration,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval: std::cmp::max(initial_interval, maximum_interval),
        }
    }

    /// Time to wait before retrying, given how many attempts already failed (starting at 0).
    pub fn time_until_next_retry(&self, attempt: u32) -> Duration {
        self.backoff_coefficient
            .checked_pow(attempt)
            .and_then(|factor| self.initial_interval.checked_mul(factor))
            .map_or(self.maximum_interval, |candidate| {
                std::cmp::min(candidate, self.maximum_interval)
            })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: Duration::from_secs(1),
            maximum_interval: Duration::from_secs(60),
        }
    }
}

/// What the subscriber poll loop does after the consumer group call returns an error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PollRetry {
    /// Re-enter the consume call straight away.
    Immediate,
    /// Sleep according to the policy; the attempt counter resets after a clean generation.
    Backoff(RetryPolicy),
}

impl PollRetry {
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            PollRetry::Immediate => None,
            PollRetry::Backoff(policy) => Some(policy.time_until_next_retry(attempt)),
        }
    }
}

impl Default for PollRetry {
    fn default() -> Self {
        PollRetry::Backoff(RetryPolicy::default())
    }
}
