//! PPS reference sources.
//!
//! A source answers one question: at which TAI second did the reference emit
//! its most recent pulse. Slaves compare their captured edge timestamps
//! against that answer.

use crate::clock::{self, PhcClock, Result};
use crate::phc::{self, PinFunction};
use crate::{Timestamp, NS_PER_SEC};

/// A 1-PPS reference with known time-of-day.
///
/// One instance is created at startup and shared by reference with every
/// slave.
pub trait PpsSource {
    /// The time at which the reference emitted its most recent pulse, in TAI
    /// seconds since the epoch.
    fn pps_time(&self) -> Result<Timestamp>;
}

/// Round to the full second the pulse belongs to. The reference edge is
/// aligned to the top of a second, so the host reading lands within half a
/// second of it on either side.
fn nearest_second(ts: Timestamp) -> Timestamp {
    let mut seconds = ts.seconds;
    if ts.nanos >= NS_PER_SEC as u32 / 2 {
        seconds += 1;
    }
    Timestamp { seconds, nanos: 0 }
}

/// An external 1-PPS without its own time-of-day channel.
///
/// The pulse time is recovered from the host's TAI clock, which therefore has
/// to be within ±0.5 s of true time.
#[derive(Debug, Default)]
pub struct GenericPpsSource;

impl GenericPpsSource {
    pub fn new() -> Self {
        GenericPpsSource
    }
}

impl PpsSource for GenericPpsSource {
    fn pps_time(&self) -> Result<Timestamp> {
        Ok(nearest_second(clock::tai_now()?))
    }
}

/// A local PHC programmed to emit the reference pulse itself.
///
/// Construction arms a periodic output on pin 0, channel 0, with its first
/// edge aligned to a full second two seconds out. The output is left running
/// when the value is dropped.
#[derive(Debug)]
pub struct PhcPpsSource {
    clock: PhcClock,
}

impl PhcPpsSource {
    /// Open `device` and start its periodic output.
    ///
    /// A period of 2 s accommodates hardware like the i210 that timestamps
    /// both edges of the pulse it generates; everything else runs at the
    /// default of 1 s.
    pub fn new(device: &str, period_s: u32) -> Result<Self> {
        let clock = PhcClock::open(device)?;
        phc::set_pin_function(clock.fd(), 0, PinFunction::PeriodicOutput, 0)?;

        let now = clock.now()?;
        let start = Timestamp {
            seconds: now.seconds + 2,
            nanos: 0,
        };
        phc::enable_periodic_output(clock.fd(), 0, start, period_s)?;

        Ok(PhcPpsSource { clock })
    }

    pub fn clock(&self) -> &PhcClock {
        &self.clock
    }
}

impl PpsSource for PhcPpsSource {
    fn pps_time(&self) -> Result<Timestamp> {
        // the output was started on a full second of a clock that tracks TAI,
        // so the host's TAI reading rounds to the pulse second
        Ok(nearest_second(clock::tai_now()?))
    }
}

/// Open the PPS source named on the command line: `generic`, or a PHC by
/// device path or interface name.
pub fn open_source(name: &str, perout_period_s: u32) -> Result<Box<dyn PpsSource>> {
    if name == "generic" {
        Ok(Box::new(GenericPpsSource::new()))
    } else {
        Ok(Box::new(PhcPpsSource::new(name, perout_period_s)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_to_the_pulse_second() {
        let early = Timestamp {
            seconds: 100,
            nanos: 499_999_999,
        };
        assert_eq!(nearest_second(early).seconds, 100);

        let late = Timestamp {
            seconds: 100,
            nanos: 500_000_000,
        };
        assert_eq!(nearest_second(late).seconds, 101);

        assert_eq!(nearest_second(early).nanos, 0);
        assert_eq!(nearest_second(late).nanos, 0);
    }

    #[test]
    fn generic_source_reports_whole_seconds() {
        let source = GenericPpsSource::new();
        let time = source.pps_time().unwrap();
        assert_eq!(time.nanos, 0);
        assert!(time.seconds > 0);
    }

    #[test]
    #[ignore = "requires a PTP hardware clock with a programmable pin"]
    fn phc_source_arms_periodic_output() {
        let source = PhcPpsSource::new("/dev/ptp0", 1).unwrap();
        assert_eq!(source.pps_time().unwrap().nanos, 0);
    }
}
