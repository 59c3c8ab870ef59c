//! Descriptor sources.
//!
//! The thinnest builtin: one descriptor watch, and a dispatch that hands the
//! received event mask to the callback. For anything richer (several
//! descriptors, protocol state), implement [`SourceFuncs`] directly and use
//! [`Source::add_fd_watch`].

use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::poll::EventMask;
use crate::pollset::FdWatch;
use crate::source::{ControlFlow, Source, SourceCallback, SourceFuncs};

struct UnixFdSource {
    fd: RawFd,
    watch: Arc<FdWatch>,
}

impl SourceFuncs for UnixFdSource {
    // Readiness comes from the watch itself: the engine marks the source
    // ready whenever the watch received events.

    fn dispatch(&mut self, _source: &Source, callback: Option<&mut SourceCallback>) -> ControlFlow {
        let revents = self.watch.revents();
        match callback {
            Some(SourceCallback::Fd(f)) => f(self.fd, revents),
            Some(_) => {
                log::warn!("descriptor source dispatched with a mismatched callback type");
                ControlFlow::Remove
            }
            None => {
                log::warn!("descriptor source dispatched without a callback; set one first");
                ControlFlow::Remove
            }
        }
    }
}

/// A source that watches a single descriptor for `events` and calls its
/// [`Fd` callback](crate::SourceCallback::Fd) with the received mask.
///
/// The source borrows the descriptor; closing it while the source is
/// attached polls back [`EventMask::INVALID`].
pub fn unix_fd_source_new(fd: RawFd, events: EventMask) -> Source {
    let watch = Arc::new(FdWatch::new(fd, events));
    let source = Source::new(UnixFdSource {
        fd,
        watch: watch.clone(),
    });
    source.set_name("unix-fd");
    source.adopt_fd_watch(watch);
    source
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(0, unsafe { libc::pipe(fds.as_mut_ptr()) });
        (fds[0], fds[1])
    }

    #[test]
    fn readable_pipe_end_dispatches() {
        let ctx = Context::new();
        let (read_fd, write_fd) = pipe();
        let got = Arc::new(AtomicUsize::new(0));
        let g = got.clone();

        let source = unix_fd_source_new(read_fd, EventMask::READABLE);
        source.set_fd_callback(move |fd, revents| {
            assert_eq!(read_fd, fd);
            assert!(revents.contains(EventMask::READABLE));
            let mut buf = [0u8; 16];
            unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            g.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Remove
        });
        source.attach(&ctx);

        // Nothing to read yet.
        assert!(!ctx.iteration(false));
        assert_eq!(0, got.load(Ordering::SeqCst));

        unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };
        while !source.is_destroyed() {
            ctx.iteration(true);
        }
        assert_eq!(1, got.load(Ordering::SeqCst));

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }
}
