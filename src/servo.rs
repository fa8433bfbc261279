//! PI servo with jump logic.
//!
//! The controller warms up over four samples: the first records a baseline,
//! the next two only advance the state machine, and the fourth estimates the
//! frequency drift from the two recorded points and asks the caller to step
//! the clock once. From then on it runs a plain PI loop around the drift
//! estimate.
//!
//! The caller owns the actuation: a positive offset means the local clock is
//! ahead, so the returned adjustment is negated before it is programmed.

use std::fmt;

/// Proportional and integral gains, tuned for the fixed 1 Hz sample cadence.
const KP: f64 = 0.7;
const KI: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServoState {
    /// Warming up; no adjustment may be applied.
    Unlocked,
    /// The caller must step the clock by the negated offset and program the
    /// negated returned adjustment, before the next sample.
    Jump,
    /// Steady state; program the negated returned adjustment.
    Locked,
    /// Steady state with the adjustment inside a narrow band. Callers treat
    /// this exactly like [`ServoState::Locked`].
    LockedStable,
}

impl fmt::Display for ServoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ServoState::Unlocked => 0,
            ServoState::Jump => 1,
            ServoState::Locked => 2,
            ServoState::LockedStable => 3,
        };
        write!(f, "s{code}")
    }
}

#[derive(Debug)]
pub struct PiServo {
    samples: u32,
    drift: f64,
    saved_offset: i64,
    saved_ts: u64,
    max_frequency: f64,
}

impl PiServo {
    /// Create a servo seeded with the clock's current frequency correction
    /// (callers pass the negated readout) and bounded by `max_frequency_ppb`.
    pub fn new(first_update_ppb: f64, max_frequency_ppb: f64) -> Self {
        let mut servo = PiServo {
            samples: 0,
            drift: 0.0,
            saved_offset: 0,
            saved_ts: 0,
            max_frequency: max_frequency_ppb,
        };
        servo.drift = servo.clamped(first_update_ppb);
        servo
    }

    fn clamped(&self, ppb: f64) -> f64 {
        ppb.clamp(-self.max_frequency, self.max_frequency)
    }

    /// Feed one measurement: the offset of the local clock against the
    /// reference in nanoseconds, and the local timestamp of the measurement.
    ///
    /// Returns the frequency adjustment in ppb and the state that tells the
    /// caller what to do with it. The invariant `|drift| <= max_frequency`
    /// holds after every call.
    pub fn sample(&mut self, offset_ns: i64, local_ts_ns: u64, weight: f64) -> (f64, ServoState) {
        match self.samples {
            0 => {
                self.saved_offset = offset_ns;
                self.saved_ts = local_ts_ns;
                self.samples = 1;
                (0.0, ServoState::Unlocked)
            }
            1 | 2 => {
                self.samples += 1;
                (0.0, ServoState::Unlocked)
            }
            3 => {
                let interval_ns = local_ts_ns.saturating_sub(self.saved_ts).max(1);
                let drift =
                    (offset_ns - self.saved_offset) as f64 * 1e9 / interval_ns as f64;
                self.drift = self.clamped(drift);
                self.samples = 4;
                (self.drift, ServoState::Jump)
            }
            _ => {
                let ki_term = KI * weight * offset_ns as f64;
                let ppb = KP * weight * offset_ns as f64 + self.drift + ki_term;

                // accumulate the integral term only while the output is not
                // saturated, otherwise it winds up without effect
                if ppb < -self.max_frequency {
                    (-self.max_frequency, ServoState::Locked)
                } else if ppb > self.max_frequency {
                    (self.max_frequency, ServoState::Locked)
                } else {
                    self.drift += ki_term;
                    (ppb, ServoState::Locked)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX_FREQ: f64 = 100_000.0;
    const SEC: u64 = 1_000_000_000;

    fn servo() -> PiServo {
        PiServo::new(0.0, MAX_FREQ)
    }

    #[test]
    fn warm_up_is_unlocked() {
        let mut servo = servo();
        for i in 0..3 {
            let (adj, state) = servo.sample(1000, i * SEC, 1.0);
            assert_eq!(adj, 0.0);
            assert_eq!(state, ServoState::Unlocked);
        }
    }

    #[test]
    fn perfect_sync_jumps_with_zero_drift() {
        let mut servo = servo();
        for i in 0..3 {
            servo.sample(0, 100 * SEC + i * SEC, 1.0);
        }
        let (adj, state) = servo.sample(0, 103 * SEC, 1.0);
        assert_eq!(state, ServoState::Jump);
        assert_eq!(adj, 0.0);
    }

    #[test]
    fn constant_skew_jumps_with_zero_drift() {
        let mut servo = servo();
        for i in 0..3 {
            servo.sample(1000, i * SEC, 1.0);
        }
        // same offset on every sample, so the frequency is spot on; the
        // caller corrects the remaining 1000 ns by stepping
        let (adj, state) = servo.sample(1000, 3 * SEC, 1.0);
        assert_eq!(state, ServoState::Jump);
        assert_eq!(adj, 0.0);
    }

    #[test]
    fn linear_drift_is_estimated_on_fourth_sample() {
        let mut servo = servo();
        servo.sample(1000, 0, 1.0);
        servo.sample(2000, SEC, 1.0);
        servo.sample(3000, 2 * SEC, 1.0);
        let (adj, state) = servo.sample(4000, 3 * SEC, 1.0);
        assert_eq!(state, ServoState::Jump);
        assert!((adj - 1000.0).abs() < 1e-6);
    }

    #[test]
    fn steady_state_is_locked_and_clamped() {
        let mut servo = servo();
        for i in 0..4 {
            servo.sample(0, i * SEC, 1.0);
        }
        let (adj, state) = servo.sample(1_000_000_000, 4 * SEC, 1.0);
        assert_eq!(state, ServoState::Locked);
        assert_eq!(adj, MAX_FREQ);

        let (adj, state) = servo.sample(-1_000_000_000, 5 * SEC, 1.0);
        assert_eq!(state, ServoState::Locked);
        assert_eq!(adj, -MAX_FREQ);
    }

    #[test]
    fn integral_term_frozen_while_saturated() {
        let mut servo = servo();
        for i in 0..4 {
            servo.sample(0, i * SEC, 1.0);
        }
        // saturating sample must not move the drift
        servo.sample(1_000_000_000, 4 * SEC, 1.0);
        let (adj, _) = servo.sample(0, 5 * SEC, 1.0);
        assert_eq!(adj, 0.0);

        // an unsaturated sample accumulates KI * offset into the drift
        servo.sample(100, 6 * SEC, 1.0);
        let (adj, _) = servo.sample(0, 7 * SEC, 1.0);
        assert!((adj - 30.0).abs() < 1e-9);
    }

    #[test]
    fn first_update_seed_is_clamped() {
        let mut servo = PiServo::new(1e9, MAX_FREQ);
        for i in 0..4 {
            servo.sample(0, i * SEC, 1.0);
        }
        let (adj, _) = servo.sample(0, 4 * SEC, 1.0);
        assert!(adj <= MAX_FREQ);
    }

    #[test]
    fn never_reenters_warm_up() {
        let mut servo = servo();
        for i in 0..4 {
            servo.sample(0, i * SEC, 1.0);
        }
        for i in 4..40 {
            let (_, state) = servo.sample(50, i * SEC, 1.0);
            assert_eq!(state, ServoState::Locked);
        }
    }

    #[test]
    fn state_log_codes() {
        assert_eq!(ServoState::Unlocked.to_string(), "s0");
        assert_eq!(ServoState::Jump.to_string(), "s1");
        assert_eq!(ServoState::Locked.to_string(), "s2");
        assert_eq!(ServoState::LockedStable.to_string(), "s3");
    }
}
