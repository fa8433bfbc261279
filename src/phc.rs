//! The character-device interface of a PTP hardware clock.
//!
//! Structs mirror `linux/ptp_clock.h` bit for bit; the functions below wrap
//! the ioctls the steering engine needs: pin multiplexing, external-timestamp
//! capture, periodic output, and the capability probe.

use std::os::fd::RawFd;

use bitflags::bitflags;

use crate::clock::{read_raw_record, Result};
use crate::Timestamp;

const PTP_CLK_MAGIC: u8 = b'=';

const PTP_ENABLE_FEATURE: u32 = 1 << 0;
const PTP_RISING_EDGE: u32 = 1 << 1;
const PTP_FALLING_EDGE: u32 = 1 << 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct PtpClockTime {
    sec: i64,
    nsec: u32,
    reserved: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct PtpClockCaps {
    max_adj: i32,
    n_alarm: i32,
    n_ext_ts: i32,
    n_per_out: i32,
    pps: i32,
    n_pins: i32,
    cross_timestamping: i32,
    adjust_phase: i32,
    rsv: [i32; 12],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct PtpExttsRequest {
    index: u32,
    flags: u32,
    rsv: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct PtpPeroutRequest {
    start: PtpClockTime,
    period: PtpClockTime,
    index: u32,
    flags: u32,
    rsv: [u32; 4],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct PtpPinDesc {
    name: [u8; 64],
    index: u32,
    func: u32,
    chan: u32,
    rsv: [u32; 5],
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct PtpExttsEvent {
    t: PtpClockTime,
    index: u32,
    flags: u32,
    rsv: [u32; 2],
}

// the macros generate `pub` functions; the module keeps them crate-internal
mod ioctls {
    use super::{PtpClockCaps, PtpExttsRequest, PtpPeroutRequest, PtpPinDesc, PTP_CLK_MAGIC};

    nix::ioctl_read!(ptp_clock_getcaps, PTP_CLK_MAGIC, 1, PtpClockCaps);
    nix::ioctl_write_ptr!(ptp_extts_request, PTP_CLK_MAGIC, 2, PtpExttsRequest);
    nix::ioctl_write_ptr!(ptp_perout_request, PTP_CLK_MAGIC, 3, PtpPeroutRequest);
    nix::ioctl_write_ptr!(ptp_pin_setfunc, PTP_CLK_MAGIC, 7, PtpPinDesc);
}

use ioctls::{ptp_clock_getcaps, ptp_extts_request, ptp_perout_request, ptp_pin_setfunc};

/// What a programmable pin is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinFunction {
    None,
    ExternalTimestamp,
    PeriodicOutput,
    PhySync,
}

impl PinFunction {
    fn as_raw(self) -> u32 {
        match self {
            PinFunction::None => 0,
            PinFunction::ExternalTimestamp => 1,
            PinFunction::PeriodicOutput => 2,
            PinFunction::PhySync => 3,
        }
    }
}

bitflags! {
    /// Which edges of the input pulse get timestamped.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Polarity: u32 {
        const RISING = 1;
        const FALLING = 2;
    }
}

impl Polarity {
    /// The flags word of an enabling PTP_EXTTS_REQUEST.
    fn enable_flags(self) -> u32 {
        let mut flags = PTP_ENABLE_FEATURE;
        if self.contains(Polarity::RISING) {
            flags |= PTP_RISING_EDGE;
        }
        if self.contains(Polarity::FALLING) {
            flags |= PTP_FALLING_EDGE;
        }
        flags
    }

    pub fn is_both_edges(self) -> bool {
        self.contains(Polarity::RISING | Polarity::FALLING)
    }
}

/// Clock adjustment and timestamping capabilities of one PHC.
///
/// Frequency range is reported in parts per billion; the channel and pin
/// counts bound what the slave configuration may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub max_frequency_adjustment_ppb: i32,
    pub external_timestamp_channels: i32,
    pub periodic_output_channels: i32,
    pub pins: i32,
}

/// Probe a chardev for PHC capabilities. Fails on anything that is not a PHC.
pub fn clock_capabilities(fd: RawFd) -> Result<Capabilities> {
    let mut caps = PtpClockCaps {
        max_adj: 0,
        n_alarm: 0,
        n_ext_ts: 0,
        n_per_out: 0,
        pps: 0,
        n_pins: 0,
        cross_timestamping: 0,
        adjust_phase: 0,
        rsv: [0; 12],
    };
    unsafe { ptp_clock_getcaps(fd, &mut caps) }?;
    Ok(Capabilities {
        max_frequency_adjustment_ppb: caps.max_adj,
        external_timestamp_channels: caps.n_ext_ts,
        periodic_output_channels: caps.n_per_out,
        pins: caps.n_pins,
    })
}

/// Assign `pin` to `function` on `channel` (PTP_PIN_SETFUNC).
pub fn set_pin_function(fd: RawFd, pin: u32, function: PinFunction, channel: u32) -> Result<()> {
    let desc = PtpPinDesc {
        name: [0; 64],
        index: pin,
        func: function.as_raw(),
        chan: channel,
        rsv: [0; 5],
    };
    unsafe { ptp_pin_setfunc(fd, &desc) }?;
    Ok(())
}

/// Start capturing timestamps of the selected edges on `channel`.
pub fn enable_external_timestamps(fd: RawFd, channel: u32, polarity: Polarity) -> Result<()> {
    let request = PtpExttsRequest {
        index: channel,
        flags: polarity.enable_flags(),
        rsv: [0; 2],
    };
    unsafe { ptp_extts_request(fd, &request) }?;
    Ok(())
}

/// Stop capturing on `channel` (flags cleared).
pub fn disable_external_timestamps(fd: RawFd, channel: u32) -> Result<()> {
    let request = PtpExttsRequest {
        index: channel,
        flags: 0,
        rsv: [0; 2],
    };
    unsafe { ptp_extts_request(fd, &request) }?;
    Ok(())
}

/// Program a periodic output on `channel`, first edge at `start`, repeating
/// every `period_s` seconds.
pub fn enable_periodic_output(
    fd: RawFd,
    channel: u32,
    start: Timestamp,
    period_s: u32,
) -> Result<()> {
    let request = PtpPeroutRequest {
        start: PtpClockTime {
            sec: start.seconds as i64,
            nsec: start.nanos,
            reserved: 0,
        },
        period: PtpClockTime {
            sec: period_s as i64,
            nsec: 0,
            reserved: 0,
        },
        index: channel,
        flags: 0,
        rsv: [0; 4],
    };
    unsafe { ptp_perout_request(fd, &request) }?;
    Ok(())
}

/// One timestamped edge, dequeued from the PHC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExttsEvent {
    pub channel: u32,
    pub time: Timestamp,
}

/// Dequeue a single external-timestamp record.
///
/// Interrupted reads are retried; a partial record surfaces as
/// [`crate::clock::Error::ShortRead`].
pub fn read_event(fd: RawFd) -> Result<ExttsEvent> {
    // Safety: PtpExttsEvent consists of integers, every byte pattern is valid.
    let raw: PtpExttsEvent = unsafe { read_raw_record(fd) }?;
    Ok(ExttsEvent {
        channel: raw.index,
        time: Timestamp {
            seconds: raw.t.sec as libc::time_t,
            nanos: raw.t.nsec,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    // the kernel ABI is fixed; a size mismatch would corrupt every request
    #[test]
    fn struct_layout_matches_kernel_abi() {
        assert_eq!(size_of::<PtpClockTime>(), 16);
        assert_eq!(size_of::<PtpClockCaps>(), 80);
        assert_eq!(size_of::<PtpExttsRequest>(), 16);
        assert_eq!(size_of::<PtpPeroutRequest>(), 56);
        assert_eq!(size_of::<PtpPinDesc>(), 96);
        assert_eq!(size_of::<PtpExttsEvent>(), 32);
    }

    #[test]
    fn polarity_flag_encoding() {
        assert_eq!(Polarity::RISING.enable_flags(), 0b011);
        assert_eq!(Polarity::FALLING.enable_flags(), 0b101);
        assert_eq!((Polarity::RISING | Polarity::FALLING).enable_flags(), 0b111);
        assert!(!Polarity::RISING.is_both_edges());
        assert!((Polarity::RISING | Polarity::FALLING).is_both_edges());
    }
}
