//! Monotonic and wall-clock time, in microseconds.
//!
//! The iteration engine schedules everything against the monotonic clock; the
//! wall clock is provided for completeness and is never used for scheduling.
//! Readings are cached per loop iteration by the context, so callbacks mostly
//! hit the cache instead of the syscall.

use std::io;
use std::sync::atomic::{AtomicI64, Ordering};

/// Largest value the monotonic clock has returned so far. Some virtualized
/// clocks have been observed stepping backwards across CPUs; scheduling
/// assumes non-decrease, so we clamp.
static LAST_MONOTONIC: AtomicI64 = AtomicI64::new(0);

fn clock_gettime(clock: libc::clockid_t) -> io::Result<i64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ts.tv_sec as i64 * 1_000_000 + ts.tv_nsec as i64 / 1_000)
}

/// Current monotonic time in microseconds.
///
/// Guaranteed not to decrease between two calls in the same process. A clock
/// that cannot be read at all is unrecoverable and aborts the process.
pub fn monotonic_time() -> i64 {
    let now = clock_gettime(libc::CLOCK_MONOTONIC)
        .unwrap_or_else(|e| panic!("monotonic clock is broken: {}", e));
    LAST_MONOTONIC.fetch_max(now, Ordering::Relaxed).max(now)
}

/// Current wall-clock time in microseconds since the epoch.
///
/// May jump forwards or backwards with system clock adjustments; never used
/// for timers.
pub fn real_time() -> i64 {
    clock_gettime(libc::CLOCK_REALTIME)
        .unwrap_or_else(|e| panic!("realtime clock is broken: {}", e))
}

/// Round a microsecond timeout up to the poll granularity.
///
/// `0` and `-1` (infinite) pass through unchanged; positive values round *up*
/// to the next millisecond so a 100 µs timeout does not turn into a busy
/// spin, saturating at `i32::MAX`.
pub(crate) fn timeout_usec_to_msec(timeout_usec: i64) -> i32 {
    if timeout_usec == 0 {
        return 0;
    }
    if timeout_usec > 0 {
        let msec = (timeout_usec + 999) / 1000;
        return msec.min(i32::MAX as i64) as i32;
    }
    -1
}
