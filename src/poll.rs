//! The poll-style multiplex contract.
//!
//! The iteration engine does not talk to the kernel directly; it hands a flat
//! array of [`PollFd`] records and a millisecond timeout to an injected
//! [`PollFn`] and reads the received masks back. [`default_poll`] implements
//! the contract with `poll(2)`; tests and embedders may substitute their own
//! (a deterministic fake, `ppoll`, a WaitForMultipleObjects shim, ...).

use std::io;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};
use std::os::unix::io::RawFd;

use lazy_static::lazy_static;

/// Set of descriptor conditions, using the `poll(2)` bit values.
///
/// `ERROR`, `HANGUP` and `INVALID` are unsolicited: they are stripped from
/// requested masks before polling and always let through on received masks.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct EventMask(u16);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READABLE: EventMask = EventMask(libc::POLLIN as u16);
    pub const WRITABLE: EventMask = EventMask(libc::POLLOUT as u16);
    pub const PRIORITY: EventMask = EventMask(libc::POLLPRI as u16);
    pub const ERROR: EventMask = EventMask(libc::POLLERR as u16);
    pub const HANGUP: EventMask = EventMask(libc::POLLHUP as u16);
    pub const INVALID: EventMask = EventMask(libc::POLLNVAL as u16);

    /// The bits a caller never requests but always receives.
    pub const UNSOLICITED: EventMask =
        EventMask(libc::POLLERR as u16 | libc::POLLHUP as u16 | libc::POLLNVAL as u16);

    pub fn from_raw(raw: u16) -> EventMask {
        EventMask(raw)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for EventMask {
    type Output = EventMask;
    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: EventMask) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventMask {
    type Output = EventMask;
    fn bitand(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 & rhs.0)
    }
}

impl Not for EventMask {
    type Output = EventMask;
    fn not(self) -> EventMask {
        EventMask(!self.0)
    }
}

impl std::fmt::Debug for EventMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        let mut put = |f: &mut std::fmt::Formatter<'_>, s: &str| -> std::fmt::Result {
            if !first {
                f.write_str("|")?;
            }
            first = false;
            f.write_str(s)
        };
        if self.contains(EventMask::READABLE) {
            put(f, "READABLE")?;
        }
        if self.contains(EventMask::WRITABLE) {
            put(f, "WRITABLE")?;
        }
        if self.contains(EventMask::PRIORITY) {
            put(f, "PRIORITY")?;
        }
        if self.contains(EventMask::ERROR) {
            put(f, "ERROR")?;
        }
        if self.contains(EventMask::HANGUP) {
            put(f, "HANGUP")?;
        }
        if self.contains(EventMask::INVALID) {
            put(f, "INVALID")?;
        }
        if first {
            f.write_str("NONE")?;
        }
        Ok(())
    }
}

/// One slot of the flat array handed to the poll primitive.
///
/// Layout-compatible with `struct pollfd` so the default implementation can
/// pass the array to the kernel as-is.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PollFd {
    pub fd: RawFd,
    pub events: EventMask,
    pub revents: EventMask,
}

const _: () = assert!(std::mem::size_of::<PollFd>() == std::mem::size_of::<libc::pollfd>());

impl PollFd {
    pub fn new(fd: RawFd, events: EventMask) -> PollFd {
        PollFd {
            fd,
            events,
            revents: EventMask::NONE,
        }
    }
}

/// The injectable multiplex primitive.
///
/// Fills the received-events slots of `fds` and returns how many entries have
/// any bits set. `timeout_ms` follows the classic contract: `0` returns
/// immediately, `-1` waits forever, anything else is a millisecond bound.
pub type PollFn = fn(&mut [PollFd], i32) -> io::Result<usize>;

/// `poll(2)` as a [`PollFn`].
pub fn default_poll(fds: &mut [PollFd], timeout_ms: i32) -> io::Result<usize> {
    let rc = unsafe {
        libc::poll(
            fds.as_mut_ptr() as *mut libc::pollfd,
            fds.len() as libc::nfds_t,
            timeout_ms,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

lazy_static! {
    /// One-shot check of the verbose poll logging switch.
    static ref POLL_DEBUG: bool = std::env::var_os("MAINSPRING_POLL_DEBUG").is_some();
}

pub(crate) fn poll_debug_enabled() -> bool {
    *POLL_DEBUG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_operations() {
        let rw = EventMask::READABLE | EventMask::WRITABLE;
        assert!(rw.contains(EventMask::READABLE));
        assert!(rw.contains(EventMask::WRITABLE));
        assert!(!rw.contains(EventMask::ERROR));
        assert!(rw.intersects(EventMask::READABLE | EventMask::ERROR));
        assert!(!rw.intersects(EventMask::HANGUP));
        assert!((rw & !EventMask::READABLE) == EventMask::WRITABLE);
        assert!(EventMask::NONE.is_empty());
    }

    #[test]
    fn unsolicited_bits() {
        let requested = EventMask::READABLE | EventMask::ERROR | EventMask::HANGUP;
        let sanitized = requested & !EventMask::UNSOLICITED;
        assert_eq!(EventMask::READABLE, sanitized);
    }

    #[test]
    fn poll_nothing_times_out() {
        let mut fds: [PollFd; 0] = [];
        let start = std::time::Instant::now();
        let n = default_poll(&mut fds, 10).unwrap();
        assert_eq!(0, n);
        assert!(start.elapsed() >= std::time::Duration::from_millis(10));
    }

    #[test]
    fn poll_reports_invalid_descriptor() {
        // A closed descriptor polls back INVALID without being requested.
        let mut fds = [PollFd::new(-1, EventMask::READABLE)];
        let n = default_poll(&mut fds, 0).unwrap();
        // fd -1 entries are defined to be skipped, not INVALID.
        assert_eq!(0, n);
        assert!(fds[0].revents.is_empty());
    }
}
