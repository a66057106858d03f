//! Exponential backoff with jitter for dequeue pauses.
//!
//! Applied between worker iterations when the queue is empty or erroring.
//! Delivery retry timing is not handled here: failed deliveries go back to
//! the tail of the durable queue with an incremented attempt counter.

use std::time::Duration;

use rand::Rng;

/// Backoff schedule parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay applied after the first empty or failed dequeue.
    pub initial: Duration,

    /// Upper bound the doubling never exceeds.
    pub max: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(10),
            max: Duration::from_secs(5),
            jitter_factor: 0.25, // ±25% randomization
        }
    }
}

/// Mutable backoff state for one worker loop.
///
/// Each call to [`Backoff::next_delay`] returns the current jittered delay
/// and doubles the base for the next one, up to the policy maximum.
/// [`Backoff::reset`] drops back to the initial delay after a successful
/// dequeue.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    /// Creates backoff state starting at the policy's initial delay.
    pub fn new(policy: BackoffPolicy) -> Self {
        let current = policy.initial;
        Self { policy, current }
    }

    /// Returns the delay to sleep now and advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = apply_jitter(self.current, self.policy.jitter_factor);
        self.current = (self.current * 2).min(self.policy.max);
        delay.min(self.policy.max)
    }

    /// Restarts the schedule at the initial delay.
    pub fn reset(&mut self) {
        self.current = self.policy.initial;
    }
}

/// Randomizes a delay by ±`jitter_factor` to avoid workers waking in
/// lockstep.
///
/// The delay is scaled by a factor drawn uniformly from
/// `[1 - jitter_factor, 1 + jitter_factor]`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let spread = jitter_factor.min(1.0);
    let scale = rand::rng().random_range(1.0 - spread..=1.0 + spread);
    duration.mul_f64(scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter_policy() -> BackoffPolicy {
        BackoffPolicy { jitter_factor: 0.0, ..Default::default() }
    }

    #[test]
    fn delay_doubles_each_attempt() {
        let mut backoff = Backoff::new(no_jitter_policy());

        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();

        assert_eq!(delays[0], Duration::from_millis(10));
        assert_eq!(delays[1], Duration::from_millis(20));
        assert_eq!(delays[2], Duration::from_millis(40));
        assert_eq!(delays[3], Duration::from_millis(80));
        assert_eq!(delays[4], Duration::from_millis(160));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let mut backoff = Backoff::new(BackoffPolicy {
            max: Duration::from_millis(50),
            jitter_factor: 0.0,
            ..Default::default()
        });

        for _ in 0..10 {
            backoff.next_delay();
        }

        assert_eq!(backoff.next_delay(), Duration::from_millis(50));
    }

    #[test]
    fn reset_returns_to_initial_delay() {
        let mut backoff = Backoff::new(no_jitter_policy());

        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn jitter_varies_delay_within_bounds() {
        let base = Duration::from_secs(10);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..20 {
            let jittered = apply_jitter(base, 0.5);
            seen.insert(jittered.as_millis());
            assert!(jittered >= Duration::from_millis(5_000), "too small: {jittered:?}");
            assert!(jittered <= Duration::from_millis(15_000), "too large: {jittered:?}");
        }

        assert!(seen.len() > 1, "jitter should create variation");
    }
}
