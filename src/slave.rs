//! One steered PHC.
//!
//! A slave owns its clock handle, its pin configuration and its servo. Every
//! readable EXTTS event is turned into an offset against the shared PPS
//! reference and fed through the servo; the resulting frequency adjustment
//! (and, right after warm-up, a single step) is applied to the clock.

use std::os::fd::RawFd;

use log::{debug, error, info};

use crate::clock::{Error, PhcClock, Result};
use crate::config::SlaveOptions;
use crate::phc::{self, PinFunction, Polarity};
use crate::servo::{PiServo, ServoState};
use crate::source::PpsSource;
use crate::{Timestamp, NS_PER_SEC};

const MAX_FREQUENCY_PPB: f64 = 100_000.0;
const SAMPLE_WEIGHT: f64 = 1.0;

/// Offset of a captured edge against the reference pulse, in nanoseconds.
fn reference_offset(event: Timestamp, reference: Timestamp) -> i64 {
    event.to_nanoseconds() - reference.to_nanoseconds()
}

/// Rejects mid-pulse edges when both edges are being captured.
///
/// With a known pulse width, the two edges that belong to the top of a second
/// land within half a pulse of nanosecond zero; everything in between is the
/// other end of some pulse and would poison the servo.
#[derive(Debug, Clone, Copy)]
struct EdgeFilter {
    enabled: bool,
    ignore_lower: u32,
    ignore_upper: u32,
}

impl EdgeFilter {
    fn new(polarity: Polarity, pulsewidth_ns: u32) -> Self {
        let half = pulsewidth_ns / 2;
        EdgeFilter {
            enabled: polarity.is_both_edges() && pulsewidth_ns != 0,
            ignore_lower: half,
            ignore_upper: NS_PER_SEC as u32 - half,
        }
    }

    fn rejects(&self, event_nanos: u32) -> bool {
        self.enabled && event_nanos > self.ignore_lower && event_nanos < self.ignore_upper
    }
}

pub struct Slave {
    name: String,
    clock: PhcClock,
    channel: u32,
    filter: EdgeFilter,
    servo: PiServo,
    state: ServoState,
}

impl Slave {
    /// Open and configure one slave device.
    ///
    /// Resources acquired before a failing step are released again through
    /// the clock handle's drop.
    pub fn new(options: &SlaveOptions, device: &str) -> Result<Self> {
        let clock = PhcClock::open(device)?;

        let fadj = clock.frequency()?;
        // On older kernels the first read silently yields zero. Writing the
        // value back pins the actual frequency of the clock.
        clock.set_frequency(fadj)?;

        let servo = PiServo::new(-fadj, MAX_FREQUENCY_PPB);

        phc::set_pin_function(
            clock.fd(),
            options.pin_index,
            PinFunction::ExternalTimestamp,
            options.channel,
        )?;
        phc::enable_external_timestamps(clock.fd(), options.channel, options.polarity)?;

        debug!(
            "{device}: pin {} channel {} polarity {:?} armed",
            options.pin_index, options.channel, options.polarity
        );

        Ok(Slave {
            name: device.to_string(),
            clock,
            channel: options.channel,
            filter: EdgeFilter::new(options.polarity, options.pulsewidth_ns),
            servo,
            state: ServoState::Unlocked,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fd(&self) -> RawFd {
        self.clock.fd()
    }

    pub fn state(&self) -> ServoState {
        self.state
    }

    /// Process one readable EXTTS event against the shared reference.
    ///
    /// Errors are reported to the caller for logging; the slave stays usable
    /// and picks up the next pulse.
    pub fn handle_event(&mut self, source: &dyn PpsSource) -> Result<()> {
        let event = phc::read_event(self.clock.fd())?;
        if event.channel != self.channel {
            return Err(Error::UnexpectedChannel {
                expected: self.channel,
                actual: event.channel,
            });
        }

        let reference = source.pps_time()?;
        let offset = reference_offset(event.time, reference);

        debug!(
            "{} extts channel {} at {}.{:09} source {}.{:09} offset {}",
            self.name,
            event.channel,
            event.time.seconds,
            event.time.nanos,
            reference.seconds,
            reference.nanos,
            offset
        );

        if self.filter.rejects(event.time.nanos) {
            return Ok(());
        }

        let local_ts = event.time.to_nanoseconds() as u64;
        let (adj, state) = self.servo.sample(offset, local_ts, SAMPLE_WEIGHT);
        self.state = state;

        info!(
            "{} master offset {offset:>10} {state} freq {adj:+8.0}",
            self.name
        );

        // actuation is best effort; the next pulse arrives in a second
        match state {
            ServoState::Unlocked => {}
            ServoState::Jump => {
                if let Err(err) = self.clock.set_frequency(-adj) {
                    error!("{}: failed to set frequency: {err}", self.name);
                }
                if let Err(err) = self.clock.step(-offset) {
                    error!("{}: failed to step clock: {err}", self.name);
                }
            }
            ServoState::Locked | ServoState::LockedStable => {
                if let Err(err) = self.clock.set_frequency(-adj) {
                    error!("{}: failed to set frequency: {err}", self.name);
                }
            }
        }

        Ok(())
    }
}

impl Drop for Slave {
    fn drop(&mut self) {
        if let Err(err) = phc::disable_external_timestamps(self.clock.fd(), self.channel) {
            error!("{}: disabling external timestamps failed: {err}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_identity() {
        let event = Timestamp {
            seconds: 100,
            nanos: 1000,
        };
        let reference = Timestamp {
            seconds: 100,
            nanos: 0,
        };
        assert_eq!(reference_offset(event, reference), 1000);
        assert_eq!(reference_offset(reference, event), -1000);

        let behind = Timestamp {
            seconds: 99,
            nanos: 999_999_000,
        };
        assert_eq!(reference_offset(behind, reference), -1000);
    }

    #[test]
    fn dual_edge_filter_drops_mid_pulse_edges() {
        // 200 ms pulse: edges belonging to the top of a second land within
        // 100 ms of nanosecond zero
        let both = Polarity::RISING | Polarity::FALLING;
        let filter = EdgeFilter::new(both, 200_000_000);

        assert!(!filter.rejects(0));
        assert!(!filter.rejects(100_000_000));
        assert!(filter.rejects(200_000_001));
        assert!(filter.rejects(500_000_000));
        assert!(!filter.rejects(999_999_999));
        assert!(!filter.rejects(900_000_000));
    }

    #[test]
    fn filter_is_disabled_for_single_edge_capture() {
        let filter = EdgeFilter::new(Polarity::RISING, 200_000_000);
        assert!(!filter.rejects(500_000_000));
    }

    #[test]
    fn filter_is_disabled_without_pulse_width() {
        let both = Polarity::RISING | Polarity::FALLING;
        let filter = EdgeFilter::new(both, 0);
        assert!(!filter.rejects(1));
        assert!(!filter.rejects(500_000_000));
    }

    #[test]
    #[ignore = "requires a PTP hardware clock with an EXTTS pin"]
    fn slave_configures_ptp0() {
        let options = SlaveOptions::default();
        let slave = Slave::new(&options, "/dev/ptp0").unwrap();
        assert_eq!(slave.state(), ServoState::Unlocked);
    }
}
