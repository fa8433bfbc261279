//! The slave set and its poll-driven run loop.
//!
//! All slaves are watched through a single `poll` call. The readiness array
//! is built once, on the first poll, and reused for every wake after that;
//! the set of slaves is frozen from then on.

use log::{debug, error};
use nix::errno::Errno;

use crate::clock::{Error, Result};
use crate::config::SlaveOptions;
use crate::slave::Slave;
use crate::source::PpsSource;

/// Bounds shutdown latency: the run predicate is re-checked at least this
/// often even when no pulses arrive.
const POLL_TIMEOUT_MS: libc::c_int = 2000;

const READY: libc::c_short = libc::POLLIN | libc::POLLPRI;

#[derive(Debug, PartialEq, Eq)]
enum PollOutcome {
    /// Timeout, or an interruption the caller resolves by re-checking its
    /// run predicate.
    Idle,
    Ready,
    Fatal(Errno),
}

fn classify_poll(count: libc::c_int, errno: Errno) -> PollOutcome {
    if count < 0 {
        match errno {
            Errno::EINTR => PollOutcome::Idle,
            other => PollOutcome::Fatal(other),
        }
    } else if count == 0 {
        PollOutcome::Idle
    } else {
        PollOutcome::Ready
    }
}

/// An insertion-ordered set of slaves, de-duplicated by device name.
#[derive(Default)]
pub struct SlaveRegistry {
    slaves: Vec<Slave>,
    pollfds: Vec<libc::pollfd>,
}

impl SlaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct a slave for `device` and append it. Adding a name that is
    /// already present is a no-op.
    pub fn add(&mut self, options: &SlaveOptions, device: &str) -> Result<()> {
        if self.slaves.iter().any(|slave| slave.name() == device) {
            return Ok(());
        }
        if !self.pollfds.is_empty() {
            return Err(Error::SlaveSetFrozen);
        }
        self.slaves.push(Slave::new(options, device)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.slaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slaves.is_empty()
    }

    /// Wait for pulses and process every slave that has one queued.
    ///
    /// Per-slave event errors are logged and do not end the loop; a failing
    /// poll does.
    pub fn poll(&mut self, source: &dyn PpsSource) -> Result<()> {
        if self.pollfds.is_empty() {
            self.pollfds = self
                .slaves
                .iter()
                .map(|slave| libc::pollfd {
                    fd: slave.fd(),
                    events: READY,
                    revents: 0,
                })
                .collect();
        }

        // # Safety
        //
        // The array stays valid for the whole call and its length matches.
        let count = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                POLL_TIMEOUT_MS,
            )
        };

        match classify_poll(count, Errno::last()) {
            PollOutcome::Idle => {
                debug!("no pulses this wake");
                Ok(())
            }
            PollOutcome::Fatal(errno) => Err(errno.into()),
            PollOutcome::Ready => {
                for (pollfd, slave) in self.pollfds.iter().zip(self.slaves.iter_mut()) {
                    if pollfd.revents & READY != 0 {
                        if let Err(err) = slave.handle_event(source) {
                            error!("{}: {err}", slave.name());
                        }
                    }
                }
                Ok(())
            }
        }
    }

    /// The cooperative run loop: poll until the predicate says to stop.
    pub fn run(&mut self, source: &dyn PpsSource, still_running: &dyn Fn() -> bool) -> Result<()> {
        while still_running() {
            self.poll(source)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::GenericPpsSource;

    #[test]
    fn interrupted_poll_is_benign() {
        assert_eq!(classify_poll(-1, Errno::EINTR), PollOutcome::Idle);
    }

    #[test]
    fn failed_poll_is_fatal() {
        assert_eq!(
            classify_poll(-1, Errno::EBADF),
            PollOutcome::Fatal(Errno::EBADF)
        );
    }

    #[test]
    fn timeout_and_readiness() {
        assert_eq!(classify_poll(0, Errno::UnknownErrno), PollOutcome::Idle);
        assert_eq!(classify_poll(2, Errno::UnknownErrno), PollOutcome::Ready);
    }

    #[test]
    fn empty_registry() {
        let registry = SlaveRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn run_loop_observes_the_predicate() {
        let mut registry = SlaveRegistry::new();
        let source = GenericPpsSource::new();
        // predicate is false up front, so the loop must return immediately
        registry.run(&source, &|| false).unwrap();
    }

    #[test]
    #[ignore = "requires a PTP hardware clock"]
    fn duplicate_names_collapse() {
        let options = SlaveOptions::default();
        let mut registry = SlaveRegistry::new();
        registry.add(&options, "/dev/ptp0").unwrap();
        registry.add(&options, "/dev/ptp0").unwrap();
        assert_eq!(registry.len(), 1);
    }
}
