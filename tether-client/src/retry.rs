//! Exponential backoff with multiplicative jitter for reconnect attempts.

use std::time::Duration;

use rand::Rng;

/// Lower bound of the jitter factor.
pub const JITTER_MIN: f64 = 0.75;
/// Upper bound of the jitter factor.
pub const JITTER_MAX: f64 = 1.25;

/// Delay schedule `min(base * 2^attempt, max) * jitter`, with
/// `jitter` drawn uniformly from `[0.75, 1.25]`.
///
/// The jitter is applied after capping, so a delay may exceed `max` by up
/// to 25%. That keeps a fleet of clients that all hit the cap from
/// retrying in lockstep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max:  Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// The un-jittered delay for `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.min(31);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// The jittered delay for `attempt` (0-based).
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        self.ceiling(attempt).mul_f64(rng.gen_range(JITTER_MIN..=JITTER_MAX))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn within_band(b: &Backoff, attempt: u32, rng: &mut StdRng) {
        let ceiling = b.ceiling(attempt);
        for _ in 0..200 {
            let d = b.delay(attempt, rng);
            assert!(d >= ceiling.mul_f64(JITTER_MIN), "attempt {attempt}: {d:?} below band");
            assert!(d <= ceiling.mul_f64(JITTER_MAX), "attempt {attempt}: {d:?} above band");
        }
    }

    #[test]
    fn every_attempt_stays_in_jitter_band() {
        let b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..=10 {
            within_band(&b, attempt, &mut rng);
        }
    }

    #[test]
    fn known_points_of_the_schedule() {
        let b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..200 {
            let d0 = b.delay(0, &mut rng);
            assert!(d0 >= Duration::from_millis(750) && d0 <= Duration::from_millis(1250));
            let d1 = b.delay(1, &mut rng);
            assert!(d1 >= Duration::from_millis(1500) && d1 <= Duration::from_millis(2500));
            let d2 = b.delay(2, &mut rng);
            assert!(d2 >= Duration::from_secs(3) && d2 <= Duration::from_secs(5));
            assert!(b.delay(10, &mut rng) <= Duration::from_millis(37_500));
        }
    }

    #[test]
    fn huge_attempts_saturate_at_max() {
        let b = Backoff::default();
        assert_eq!(b.ceiling(0), Duration::from_secs(2));
        assert_eq!(b.ceiling(7), Duration::from_secs(256));
        assert_eq!(b.ceiling(8), Duration::from_secs(300));
        assert_eq!(b.ceiling(u32::MAX), Duration::from_secs(300));
    }
}
