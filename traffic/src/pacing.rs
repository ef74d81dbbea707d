//! Decide how long to wait before the next transmission.
//!
//! In [Mode::Noise] the delay is drawn from an exponential distribution. In
//! [Mode::Adaptive] it is derived from the predicted bandwidth ratio `r`:
//!
//! ```txt
//! delay = interval * (1 - clamp(r, 0, 1)) ^ exponent
//! ```
//!
//! With the default `interval` of one second and `exponent` of 6, a fully available
//! link (`r = 1`) sends back-to-back while any degradation quickly inflates the delay.
//!
//! The mode is fixed when the [Pacer] is created and no delay exceeds [MAX_DELAY].

use rand::Rng;
use rand_distr::{Distribution, Exp};
use std::time::Duration;

/// Default exponent of the ratio-to-delay transform.
pub const DEFAULT_EXPONENT: u32 = 6;

/// How the generator paces its transmissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Exponentially distributed intervals, independent of feedback.
    Noise,
    /// Intervals derived from the predicted bandwidth ratio.
    Adaptive,
}

/// Longest delay the controller will ever produce.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Compute the adaptive delay for a predicted bandwidth `ratio`.
///
/// `ratio` is clamped to `[0, 1]` (a `NaN` ratio is treated as 0). The result never
/// exceeds `interval`.
pub fn adaptive_delay(ratio: f64, interval: Duration, exponent: u32) -> Duration {
    let ratio = if ratio.is_nan() {
        0.0
    } else {
        ratio.clamp(0.0, 1.0)
    };
    let inverted = 1.0 - ratio;
    let factor = inverted.powi(i32::try_from(exponent).unwrap_or(i32::MAX));
    Duration::try_from_secs_f64(interval.as_secs_f64() * factor)
        .map(|delay| delay.min(interval))
        .unwrap_or(interval)
}

impl Mode {
    /// Mode selected by an interval mean (in seconds): exactly 0 selects
    /// [Mode::Adaptive].
    pub fn from_interval_mean(interval_mean: f64) -> Self {
        if interval_mean == 0.0 {
            Mode::Adaptive
        } else {
            Mode::Noise
        }
    }
}

enum Schedule {
    Noise(Exp<f64>),
    Adaptive,
}

/// Pacing controller.
pub struct Pacer {
    schedule: Schedule,
    interval: Duration,
    exponent: u32,
}

impl Pacer {
    /// Create a controller for the given interval mean (in seconds).
    ///
    /// Fails if a non-zero mean cannot parameterize an exponential distribution.
    pub fn new(
        interval_mean: f64,
        interval: Duration,
        exponent: u32,
    ) -> Result<Self, rand_distr::ExpError> {
        let schedule = match Mode::from_interval_mean(interval_mean) {
            Mode::Adaptive => Schedule::Adaptive,
            Mode::Noise => Schedule::Noise(Exp::new(1.0 / interval_mean)?),
        };
        Ok(Self {
            schedule,
            interval,
            exponent,
        })
    }

    pub fn mode(&self) -> Mode {
        match self.schedule {
            Schedule::Noise(_) => Mode::Noise,
            Schedule::Adaptive => Mode::Adaptive,
        }
    }

    /// Compute the delay before the next transmission (at most [MAX_DELAY]).
    ///
    /// `ratio` is only consulted in [Mode::Adaptive].
    pub fn next_delay<R: Rng + ?Sized>(&self, rng: &mut R, ratio: f64) -> Duration {
        let delay = match &self.schedule {
            Schedule::Noise(exponential) => {
                let seconds = exponential.sample(rng);
                Duration::try_from_secs_f64(seconds).unwrap_or(MAX_DELAY)
            }
            Schedule::Adaptive => adaptive_delay(ratio, self.interval, self.exponent),
        };
        delay.min(MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn test_adaptive_bounds() {
        assert_eq!(adaptive_delay(1.0, SECOND, DEFAULT_EXPONENT), Duration::ZERO);
        assert_eq!(adaptive_delay(0.0, SECOND, DEFAULT_EXPONENT), SECOND);
    }

    #[test]
    fn test_adaptive_clamps() {
        assert_eq!(
            adaptive_delay(1.5, SECOND, DEFAULT_EXPONENT),
            adaptive_delay(1.0, SECOND, DEFAULT_EXPONENT)
        );
        assert_eq!(
            adaptive_delay(-3.0, SECOND, DEFAULT_EXPONENT),
            adaptive_delay(0.0, SECOND, DEFAULT_EXPONENT)
        );
        assert_eq!(adaptive_delay(f64::NAN, SECOND, DEFAULT_EXPONENT), SECOND);
    }

    #[test]
    fn test_adaptive_curve() {
        // 0.5^6 = 1/64
        let delay = adaptive_delay(0.5, SECOND, DEFAULT_EXPONENT);
        assert_eq!(delay, Duration::from_nanos(15_625_000));

        // Convex: the first 10% of degradation costs little, the last 10% a lot
        let high = adaptive_delay(0.9, SECOND, DEFAULT_EXPONENT);
        let low = adaptive_delay(0.1, SECOND, DEFAULT_EXPONENT);
        assert!(high < Duration::from_micros(2));
        assert!(low > Duration::from_millis(500));

        // Tunable exponent and base interval
        assert_eq!(
            adaptive_delay(0.5, Duration::from_secs(2), 1),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_adaptive_exponent_saturates() {
        assert_eq!(adaptive_delay(1.0, SECOND, u32::MAX), Duration::ZERO);
        assert_eq!(adaptive_delay(0.0, SECOND, u32::MAX), SECOND);
        assert_eq!(adaptive_delay(0.5, SECOND, u32::MAX), Duration::ZERO);
        assert_eq!(adaptive_delay(0.0, Duration::MAX, 1), Duration::MAX);
    }

    #[test]
    fn test_mode() {
        let pacer = Pacer::new(0.0, SECOND, DEFAULT_EXPONENT).unwrap();
        assert_eq!(pacer.mode(), Mode::Adaptive);
        let pacer = Pacer::new(1.0, SECOND, DEFAULT_EXPONENT).unwrap();
        assert_eq!(pacer.mode(), Mode::Noise);
        assert!(Pacer::new(-1.0, SECOND, DEFAULT_EXPONENT).is_err());
        assert!(Pacer::new(f64::NAN, SECOND, DEFAULT_EXPONENT).is_err());
    }

    #[test]
    fn test_noise_ignores_ratio() {
        let pacer = Pacer::new(1.0, SECOND, DEFAULT_EXPONENT).unwrap();
        assert_eq!(pacer.mode(), Mode::Noise);

        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for _ in 0..10 {
            assert_eq!(pacer.next_delay(&mut a, 0.0), pacer.next_delay(&mut b, 1.0));
        }
    }

    #[test]
    fn test_noise_capped() {
        let mut rng = StdRng::seed_from_u64(0);
        for mean in [1e300, f64::INFINITY] {
            let pacer = Pacer::new(mean, SECOND, DEFAULT_EXPONENT).unwrap();
            for _ in 0..10 {
                assert!(pacer.next_delay(&mut rng, 0.0) <= MAX_DELAY);
            }
        }
        let pacer = Pacer::new(0.0, Duration::MAX, 1).unwrap();
        assert_eq!(pacer.next_delay(&mut rng, 0.0), MAX_DELAY);
    }

    #[test]
    fn test_noise_mean() {
        let pacer = Pacer::new(0.25, SECOND, DEFAULT_EXPONENT).unwrap();

        let mut rng = StdRng::seed_from_u64(0);
        let samples = 20_000;
        let total: f64 = (0..samples)
            .map(|_| pacer.next_delay(&mut rng, 0.0).as_secs_f64())
            .sum();
        let mean = total / samples as f64;
        assert!((mean - 0.25).abs() < 0.01, "mean = {mean}");
    }
}
