//! Adapter for a single PTP hardware clock.
//!
//! A PHC is reachable either directly through its character device
//! (`/dev/ptp0`) or indirectly through the network interface that carries it;
//! [`PhcClock::open`] accepts both. Frequency is exposed in parts per billion,
//! hiding the kernel's 2^-16 ppm fixed-point encoding.

use std::fs::{File, OpenOptions};
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, RawFd};

use nix::errno::Errno;

use crate::phc::{self, Capabilities};
use crate::{Timestamp, NS_PER_SEC};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sys(#[from] nix::Error),
    /// The interface exists but advertises no PHC.
    #[error("interface {0} has no PTP hardware clock")]
    NoPhc(String),
    /// The device node could not be identified as a PHC.
    #[error("{0} is not a PTP hardware clock")]
    NotAPhc(String),
    /// A partial external-timestamp record came out of the kernel.
    #[error("short read of an external timestamp record")]
    ShortRead,
    /// An event arrived on a channel nobody asked for.
    #[error("external timestamp on channel {actual}, expected channel {expected}")]
    UnexpectedChannel { expected: u32, actual: u32 },
    /// The poller has built its readiness array; the slave set can no longer
    /// grow.
    #[error("the slave set is frozen after the first poll")]
    SlaveSetFrozen,
}

/// An open PTP hardware clock.
///
/// The clock is closed when the value is dropped. The file descriptor doubles
/// as the ioctl and event-read handle for the same device.
#[derive(Debug)]
pub struct PhcClock {
    file: File,
    clock: libc::clockid_t,
    capabilities: Capabilities,
}

/// Posix dynamic clock ids encode the file descriptor of the backing chardev.
const fn fd_to_clockid(fd: RawFd) -> libc::clockid_t {
    const CLOCKFD: libc::clockid_t = 3;
    ((!fd) << 3) | CLOCKFD
}

/// The timex `freq` field counts in units of 2^-16 ppm, so one ppb is 65.536
/// of them. This holds for both reads and writes.
fn scaled_frequency_to_ppb(freq: libc::c_long) -> f64 {
    freq as f64 / 65.536
}

fn ppb_to_scaled_frequency(ppb: f64) -> libc::c_long {
    (ppb * 65.536) as libc::c_long
}

/// Split a signed nanosecond offset into the (seconds, nanoseconds) pair the
/// kernel wants, with the nanosecond part non-negative.
fn split_nanoseconds(ns: i64) -> (i64, i64) {
    let mut sec = ns / NS_PER_SEC;
    let mut nsec = ns % NS_PER_SEC;
    if nsec < 0 {
        sec -= 1;
        nsec += NS_PER_SEC;
    }
    (sec, nsec)
}

// timex is plain old data; all-zero is a valid empty request.
fn empty_timex() -> libc::timex {
    unsafe { std::mem::zeroed() }
}

impl PhcClock {
    /// Open a PHC by character-device path or by network interface name.
    ///
    /// An argument starting with `/` is opened directly; anything else is
    /// resolved through the interface's timestamping info to `/dev/ptp<n>`.
    pub fn open(device: &str) -> Result<Self> {
        if device.starts_with('/') {
            Self::open_path(device)
        } else {
            let index = phc_index_of_interface(device)?;
            Self::open_path(&format!("/dev/ptp{index}"))
        }
    }

    fn open_path(path: &str) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let clock = fd_to_clockid(file.as_raw_fd());

        // Any chardev can be opened; only a PHC answers the caps ioctl.
        let capabilities = match phc::clock_capabilities(file.as_raw_fd()) {
            Ok(caps) => caps,
            Err(_) => return Err(Error::NotAPhc(path.to_string())),
        };

        Ok(PhcClock {
            file,
            clock,
            capabilities,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn adjtime(&self, timex: &mut libc::timex) -> Result<()> {
        // # Safety
        //
        // The reference always points to a valid libc::timex, and an invalid
        // clock id only makes clock_adjtime return EINVAL.
        Errno::result(unsafe { libc::clock_adjtime(self.clock, timex) })?;
        Ok(())
    }

    /// Read the clock's own time.
    pub fn now(&self) -> Result<Timestamp> {
        clock_gettime(self.clock)
    }

    /// The currently programmed frequency offset in parts per billion.
    pub fn frequency(&self) -> Result<f64> {
        let mut timex = empty_timex();
        self.adjtime(&mut timex)?;
        Ok(scaled_frequency_to_ppb(timex.freq))
    }

    /// Program a frequency offset in parts per billion. Negative values slow
    /// the clock down.
    pub fn set_frequency(&self, ppb: f64) -> Result<()> {
        let mut timex = empty_timex();
        timex.modes = libc::MOD_FREQUENCY;
        timex.freq = ppb_to_scaled_frequency(ppb);
        self.adjtime(&mut timex)
    }

    /// Atomically add a signed nanosecond offset to the clock's time.
    pub fn step(&self, offset_ns: i64) -> Result<()> {
        let (sec, nsec) = split_nanoseconds(offset_ns);
        let mut timex = empty_timex();
        timex.modes = libc::ADJ_SETOFFSET | libc::MOD_NANO;
        // with MOD_NANO the tv_usec field carries nanoseconds
        timex.time = libc::timeval {
            tv_sec: sec as libc::time_t,
            tv_usec: nsec as libc::suseconds_t,
        };
        self.adjtime(&mut timex)
    }
}

fn clock_gettime(clock: libc::clockid_t) -> Result<Timestamp> {
    let mut timespec = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    // # Safety
    //
    // The timespec pointer is valid; an invalid clock id only makes
    // clock_gettime return EINVAL.
    Errno::result(unsafe { libc::clock_gettime(clock, &mut timespec) })?;

    Ok(Timestamp {
        seconds: timespec.tv_sec,
        nanos: timespec.tv_nsec as u32,
    })
}

/// Read the host's TAI clock.
pub fn tai_now() -> Result<Timestamp> {
    clock_gettime(libc::CLOCK_TAI)
}

const ETHTOOL_GET_TS_INFO: u32 = 0x41;

/// Layout of `struct ethtool_ts_info` from `linux/ethtool.h`.
#[repr(C)]
#[allow(dead_code)]
struct EthtoolTsInfo {
    cmd: u32,
    so_timestamping: u32,
    phc_index: i32,
    tx_types: u32,
    tx_reserved: [u32; 3],
    rx_filters: u32,
    rx_reserved: [u32; 3],
}

/// Ask an interface for the index of its associated PHC.
fn phc_index_of_interface(name: &str) -> Result<i32> {
    if name.len() >= libc::IFNAMSIZ {
        return Err(Error::NoPhc(name.to_string()));
    }

    let mut info = EthtoolTsInfo {
        cmd: ETHTOOL_GET_TS_INFO,
        so_timestamping: 0,
        phc_index: -1,
        tx_types: 0,
        tx_reserved: [0; 3],
        rx_filters: 0,
        rx_reserved: [0; 3],
    };

    // # Safety
    //
    // ifreq is plain data; the name fits per the check above, and ifru_data
    // points at a live EthtoolTsInfo for the duration of the ioctl.
    let result = unsafe {
        let mut request: libc::ifreq = std::mem::zeroed();
        for (dst, src) in request.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        request.ifr_ifru.ifru_data = &mut info as *mut EthtoolTsInfo as *mut libc::c_char;

        let socket = Errno::result(libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0))?;
        let answer = Errno::result(libc::ioctl(socket, libc::SIOCETHTOOL, &mut request));
        libc::close(socket);
        answer
    };
    result?;

    if info.phc_index < 0 {
        return Err(Error::NoPhc(name.to_string()));
    }
    Ok(info.phc_index)
}

/// Read one raw record of type `T` from a file descriptor, retrying on
/// interruption. A successful read of fewer bytes than `size_of::<T>()` is a
/// protocol violation and reported as [`Error::ShortRead`].
///
/// # Safety
///
/// Caller must guarantee that any byte pattern of length `size_of::<T>()` is a
/// valid `T`.
pub(crate) unsafe fn read_raw_record<T>(fd: RawFd) -> Result<T> {
    let mut record = MaybeUninit::<T>::uninit();
    let size = std::mem::size_of::<T>();

    loop {
        let count = libc::read(fd, record.as_mut_ptr() as *mut libc::c_void, size);
        match Errno::result(count) {
            Ok(count) if count as usize == size => return Ok(record.assume_init()),
            Ok(_) => return Err(Error::ShortRead),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
}
