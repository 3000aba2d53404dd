// Reconnexion - Exponential back-off schedules for MIDI ports and peers

use rand::Rng;
use std::time::{Duration, Instant};

/// How retries are spaced: `base * 2^n`, capped, optionally jittered
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction (0.0 - 1.0) of each delay that may be shaved off at random
    pub jitter: f32,
}

impl BackoffPolicy {
    /// MIDI ports: quick first retry, short ceiling
    pub fn midi() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: 0.0,
        }
    }

    /// Peers: jittered so both sides of a failed link do not retry in lockstep
    pub fn peers(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.25,
        }
    }

    /// Delay before retry number `attempt` (0-based), jitter excluded
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay.max(self.base_delay))
    }

    fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return nominal;
        }
        let shave = rand::thread_rng().gen_range(0.0..=jitter);
        nominal.mul_f32(1.0 - shave)
    }
}

/// What a caller should do on this poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStep {
    Wait,
    /// Try now; carries the 1-based attempt number
    Attempt(u32),
    Exhausted,
}

/// One target's retry state
///
/// A fresh schedule is armed on its first poll. After each attempt the
/// caller either drops the schedule (success) or polls again, which arms the
/// next, longer delay.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    policy: BackoffPolicy,
    attempts: u32,
    due: Option<Instant>,
}

impl RetrySchedule {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            due: None,
        }
    }

    /// First attempt due at `now`, without waiting
    pub fn immediate(policy: BackoffPolicy, now: Instant) -> Self {
        Self {
            policy,
            attempts: 0,
            due: Some(now),
        }
    }

    pub fn poll(&mut self, now: Instant) -> RetryStep {
        match self.due {
            Some(due) if now >= due => {
                self.due = None;
                self.attempts += 1;
                RetryStep::Attempt(self.attempts)
            }
            Some(_) => RetryStep::Wait,
            None if self.attempts >= self.policy.max_attempts => RetryStep::Exhausted,
            None => {
                self.due = Some(now + self.policy.delay(self.attempts));
                RetryStep::Wait
            }
        }
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn due(&self) -> Option<Instant> {
        self.due
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(450),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_nominal_delays_double_then_cap() {
        let policy = steady(10);
        let delays: Vec<u128> = (0..5).map(|n| policy.nominal_delay(n).as_millis()).collect();
        assert_eq!(delays, [100, 200, 400, 450, 450]);
        // No overflow far past the cap
        assert_eq!(policy.nominal_delay(200), Duration::from_millis(450));
    }

    #[test]
    fn test_schedule_runs_to_exhaustion() {
        let start = Instant::now();
        let mut schedule = RetrySchedule::new(steady(2));

        assert_eq!(schedule.poll(start), RetryStep::Wait);
        assert_eq!(schedule.due(), Some(start + Duration::from_millis(100)));
        assert_eq!(schedule.poll(start + Duration::from_millis(50)), RetryStep::Wait);
        assert_eq!(
            schedule.poll(start + Duration::from_millis(100)),
            RetryStep::Attempt(1)
        );

        let t = start + Duration::from_millis(100);
        assert_eq!(schedule.poll(t), RetryStep::Wait);
        assert_eq!(schedule.due(), Some(t + Duration::from_millis(200)));
        assert_eq!(
            schedule.poll(t + Duration::from_millis(200)),
            RetryStep::Attempt(2)
        );

        assert_eq!(schedule.poll(t + Duration::from_secs(10)), RetryStep::Exhausted);
        assert_eq!(schedule.attempts(), 2);
    }

    #[test]
    fn test_immediate_schedule() {
        let now = Instant::now();
        let mut schedule = RetrySchedule::immediate(steady(3), now);
        assert_eq!(schedule.poll(now), RetryStep::Attempt(1));
    }

    #[test]
    fn test_zero_attempts_is_exhausted_at_once() {
        let mut schedule = RetrySchedule::new(steady(0));
        assert_eq!(schedule.poll(Instant::now()), RetryStep::Exhausted);
    }

    #[test]
    fn test_jitter_only_shortens() {
        let policy = BackoffPolicy::peers(5);
        for attempt in 0..5 {
            let nominal = policy.nominal_delay(attempt);
            for _ in 0..20 {
                let delay = policy.delay(attempt);
                assert!(delay <= nominal);
                assert!(delay >= nominal.mul_f32(0.75) - Duration::from_millis(1));
            }
        }
    }
}
