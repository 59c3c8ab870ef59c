//! Descriptor watches and the context's poll-record set.
//!
//! A [`FdWatch`] is one descriptor plus a requested mask, owned by a source.
//! The context registers every watch of every attached, unblocked source as a
//! poll record at that source's priority. Records are kept sorted by
//! descriptor identifier; that single invariant lets both the flattening into
//! the poll array and the post-poll scatter of received masks run in one
//! linear pass while coalescing records that share a descriptor.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use crate::poll::{EventMask, PollFd};

/// One watched descriptor: requested mask in, received mask out.
///
/// The masks are atomics because the received side is written by the owner
/// thread during check while callbacks on other threads may query it, and the
/// requested side may be modified while a poll is in flight.
#[derive(Debug)]
pub(crate) struct FdWatch {
    fd: RawFd,
    events: AtomicU16,
    revents: AtomicU16,
}

impl FdWatch {
    pub fn new(fd: RawFd, events: EventMask) -> FdWatch {
        FdWatch {
            fd,
            events: AtomicU16::new(events.raw()),
            revents: AtomicU16::new(0),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn events(&self) -> EventMask {
        EventMask::from_raw(self.events.load(Ordering::Relaxed))
    }

    pub fn set_events(&self, events: EventMask) {
        self.events.store(events.raw(), Ordering::Relaxed);
    }

    pub fn revents(&self) -> EventMask {
        EventMask::from_raw(self.revents.load(Ordering::Relaxed))
    }

    pub fn set_revents(&self, revents: EventMask) {
        self.revents.store(revents.raw(), Ordering::Relaxed);
    }
}

/// Handle returned from `Source::add_fd_watch`, identifying the watch for
/// later modification, removal and querying. Identity, not value: two watches
/// on the same descriptor are distinct.
#[derive(Clone, Debug)]
pub struct FdWatchTag {
    pub(crate) watch: Arc<FdWatch>,
}

impl FdWatchTag {
    pub(crate) fn new(watch: Arc<FdWatch>) -> FdWatchTag {
        FdWatchTag { watch }
    }
}

#[derive(Debug)]
struct PollRec {
    watch: Arc<FdWatch>,
    priority: i32,
}

/// The ordered watch registry of one context.
#[derive(Debug)]
pub(crate) struct PollRecordSet {
    records: Vec<PollRec>,
    /// Set whenever the record set changes; a poll that raced such a change
    /// must not trust the array it polled on.
    changed: bool,
}

impl PollRecordSet {
    pub fn new() -> PollRecordSet {
        PollRecordSet {
            records: Vec::new(),
            changed: false,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Register `watch` at `priority`, keeping the set sorted by descriptor.
    ///
    /// The received mask is cleared: the descriptor may be checked before it
    /// is ever polled.
    pub fn add(&mut self, watch: &Arc<FdWatch>, priority: i32) {
        watch.set_revents(EventMask::NONE);
        let pos = self
            .records
            .partition_point(|rec| rec.watch.fd() <= watch.fd());
        self.records.insert(
            pos,
            PollRec {
                watch: watch.clone(),
                priority,
            },
        );
        self.changed = true;
    }

    /// Drop the record for exactly this watch (pointer identity).
    pub fn remove(&mut self, watch: &Arc<FdWatch>) {
        if let Some(pos) = self
            .records
            .iter()
            .position(|rec| Arc::ptr_eq(&rec.watch, watch))
        {
            self.records.remove(pos);
        }
        self.changed = true;
    }

    /// Flatten the records at or above `max_priority` (numerically at most)
    /// into `out`, merging consecutive records that share a descriptor into
    /// one slot with OR-combined requested masks.
    ///
    /// Returns the number of slots needed; when that exceeds `out.len()` the
    /// caller grows its array and retries. Clears the change flag: the caller
    /// is about to poll on the result.
    pub fn flatten(&mut self, max_priority: i32, out: &mut [PollFd]) -> usize {
        let mut n_poll = 0usize;
        let mut last_fd: Option<RawFd> = None;
        for rec in &self.records {
            if rec.priority > max_priority {
                continue;
            }
            // Unsolicited bits confuse some poll implementations when
            // requested; they come back regardless.
            let events = rec.watch.events() & !EventMask::UNSOLICITED;
            if last_fd == Some(rec.watch.fd()) {
                if n_poll - 1 < out.len() {
                    out[n_poll - 1].events |= events;
                }
            } else {
                if n_poll < out.len() {
                    out[n_poll] = PollFd {
                        fd: rec.watch.fd(),
                        events,
                        revents: EventMask::NONE,
                    };
                }
                n_poll += 1;
            }
            last_fd = Some(rec.watch.fd());
        }
        self.changed = false;
        n_poll
    }

    /// Scatter received masks from a polled array back onto the watches.
    ///
    /// Walks records and array entries jointly (both sorted by descriptor).
    /// Only records at or above `max_priority` receive bits, filtered to the
    /// requested mask plus the unsolicited error conditions.
    pub fn scatter(&self, max_priority: i32, fds: &[PollFd]) {
        let mut rec_iter = self.records.iter().peekable();
        for (i, pollfd) in fds.iter().enumerate() {
            debug_assert!(i == 0 || fds[i - 1].fd < pollfd.fd);
            // Skip records for descriptors the array does not carry.
            while rec_iter
                .peek()
                .map_or(false, |rec| rec.watch.fd() != pollfd.fd)
            {
                rec_iter.next();
            }
            while let Some(rec) = rec_iter.peek() {
                if rec.watch.fd() != pollfd.fd {
                    break;
                }
                if rec.priority <= max_priority {
                    rec.watch
                        .set_revents(pollfd.revents & (rec.watch.events() | EventMask::UNSOLICITED));
                }
                rec_iter.next();
            }
        }
    }

    #[cfg(test)]
    fn is_sorted(&self) -> bool {
        self.records
            .windows(2)
            .all(|w| w[0].watch.fd() <= w[1].watch.fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watch(fd: RawFd, events: EventMask) -> Arc<FdWatch> {
        Arc::new(FdWatch::new(fd, events))
    }

    #[test]
    fn stays_sorted() {
        let mut set = PollRecordSet::new();
        for fd in [7, 3, 9, 3, 1, 7] {
            set.add(&watch(fd, EventMask::READABLE), 0);
            assert!(set.is_sorted());
        }
        assert_eq!(6, set.len());
    }

    #[test]
    fn add_resets_revents_and_flags_change() {
        let mut set = PollRecordSet::new();
        let w = watch(4, EventMask::READABLE);
        w.set_revents(EventMask::HANGUP);
        set.add(&w, 0);
        assert!(w.revents().is_empty());
        assert!(set.changed());
        let mut out = [PollFd::new(0, EventMask::NONE); 4];
        set.flatten(i32::MAX, &mut out);
        assert!(!set.changed());
        set.remove(&w);
        assert!(set.changed());
        assert_eq!(0, set.len());
    }

    #[test]
    fn remove_is_by_identity() {
        let mut set = PollRecordSet::new();
        let a = watch(5, EventMask::READABLE);
        let b = watch(5, EventMask::WRITABLE);
        set.add(&a, 0);
        set.add(&b, 0);
        set.remove(&a);
        assert_eq!(1, set.len());
        let mut out = [PollFd::new(0, EventMask::NONE); 2];
        assert_eq!(1, set.flatten(i32::MAX, &mut out));
        assert_eq!(EventMask::WRITABLE, out[0].events);
    }

    #[test]
    fn flatten_merges_shared_descriptors() {
        let mut set = PollRecordSet::new();
        set.add(&watch(3, EventMask::READABLE), 0);
        set.add(&watch(3, EventMask::WRITABLE), 0);
        set.add(&watch(8, EventMask::READABLE), 0);
        let mut out = [PollFd::new(0, EventMask::NONE); 4];
        let needed = set.flatten(i32::MAX, &mut out);
        assert_eq!(2, needed);
        assert_eq!(3, out[0].fd);
        assert_eq!(EventMask::READABLE | EventMask::WRITABLE, out[0].events);
        assert_eq!(8, out[1].fd);
    }

    #[test]
    fn flatten_filters_by_priority() {
        let mut set = PollRecordSet::new();
        set.add(&watch(3, EventMask::READABLE), 10);
        set.add(&watch(5, EventMask::READABLE), 0);
        let mut out = [PollFd::new(0, EventMask::NONE); 4];
        let needed = set.flatten(5, &mut out);
        assert_eq!(1, needed);
        assert_eq!(5, out[0].fd);
    }

    #[test]
    fn flatten_reports_needed_when_array_small() {
        let mut set = PollRecordSet::new();
        for fd in 1..=5 {
            set.add(&watch(fd, EventMask::READABLE), 0);
        }
        let mut out = [PollFd::new(0, EventMask::NONE); 2];
        assert_eq!(5, set.flatten(i32::MAX, &mut out));
        assert_eq!(1, out[0].fd);
        assert_eq!(2, out[1].fd);
    }

    #[test]
    fn scatter_respects_priority_and_requested_mask() {
        let mut set = PollRecordSet::new();
        let lo = watch(3, EventMask::READABLE);
        let hi = watch(3, EventMask::WRITABLE);
        set.add(&lo, 10);
        set.add(&hi, 0);
        let mut fds = [PollFd::new(3, EventMask::READABLE | EventMask::WRITABLE)];
        fds[0].revents = EventMask::READABLE | EventMask::WRITABLE | EventMask::HANGUP;
        set.scatter(5, &fds);
        // Priority 10 record is beyond the cutoff and receives nothing.
        assert!(lo.revents().is_empty());
        // The other is filtered to requested plus unsolicited bits.
        assert_eq!(EventMask::WRITABLE | EventMask::HANGUP, hi.revents());
    }
}
