//! Child-watch sources.
//!
//! Watches a single child process for termination. Where the kernel offers a
//! process descriptor (`pidfd_open(2)`), the source owns one and polls it for
//! readability, which needs no signal handling at all; otherwise it rides the
//! process-wide `SIGCHLD` fan-out in [`crate::unix_signal`].
//!
//! The child is reaped only inside dispatch, right before the callback: as
//! long as the callback has not run, the pid is guaranteed to still be valid.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::poll::EventMask;
use crate::pollset::FdWatch;
use crate::source::{ControlFlow, Source, SourceCallback, SourceFuncs};
use crate::unix_signal;

/// `pidfd_open(2)`, where the libc and kernel know it. The descriptor is
/// close-on-exec by definition.
#[cfg(target_os = "linux")]
fn pidfd_open(pid: Pid) -> Option<RawFd> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0 as libc::c_uint) };
    if fd >= 0 {
        Some(fd as RawFd)
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
fn pidfd_open(_pid: Pid) -> Option<RawFd> {
    None
}

struct ChildWatchSource {
    pid: Pid,
    /// Process descriptor, when the platform has one. The watch polls it for
    /// readability, which signals exit.
    pidfd: Option<RawFd>,
    watch: Option<Arc<FdWatch>>,
    /// SIGCHLD path: flipped by the signal fan-out, cleared around reaping.
    maybe_exited: Arc<AtomicBool>,
    registered: bool,
}

impl SourceFuncs for ChildWatchSource {
    fn prepare(&mut self, _source: &Source) -> (bool, Option<std::time::Duration>) {
        if self.pidfd.is_some() {
            return (false, None);
        }
        (self.maybe_exited.load(Ordering::SeqCst), None)
    }

    fn check(&mut self, _source: &Source) -> bool {
        match &self.watch {
            Some(watch) => watch.revents().contains(EventMask::READABLE),
            None => self.maybe_exited.load(Ordering::SeqCst),
        }
    }

    fn dispatch(&mut self, _source: &Source, callback: Option<&mut SourceCallback>) -> ControlFlow {
        let status = loop {
            // Reset the flag before reaping; a SIGCHLD arriving after the
            // waitpid would otherwise be absorbed by a stale flag.
            self.maybe_exited.store(false, Ordering::SeqCst);
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                // Woken up but not actually reapable yet; try again on the
                // next iteration.
                Ok(WaitStatus::StillAlive) => return ControlFlow::Continue,
                Ok(status) => break status,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log::warn!(
                        "waitpid({}) failed: {}; was the child reaped elsewhere?",
                        self.pid,
                        e
                    );
                    return ControlFlow::Remove;
                }
            }
        };

        match callback {
            Some(SourceCallback::Child(f)) => f(self.pid, status),
            Some(_) => log::warn!("child watch dispatched with a mismatched callback type"),
            None => log::warn!("child watch dispatched without a callback; set one first"),
        }
        // The child is gone; the watch never fires again.
        ControlFlow::Remove
    }

    fn finalize(&mut self, _source: &Source) {
        if let Some(fd) = self.pidfd.take() {
            unsafe {
                libc::close(fd);
            }
        }
        if self.registered {
            unix_signal::unregister_child_watch(&self.maybe_exited);
        }
    }
}

/// A source that fires once when the child process `pid` terminates.
///
/// The pid must be a positive id of a direct child that nothing else reaps
/// (no process-wide `waitpid(-1)` elsewhere). The exit status is delivered to
/// the [`Child` callback](crate::SourceCallback::Child); after delivery the
/// source destroys itself.
pub fn child_watch_source_new(pid: Pid) -> Source {
    let maybe_exited = Arc::new(AtomicBool::new(false));
    let pidfd = if pid.as_raw() > 0 {
        pidfd_open(pid)
    } else {
        log::warn!("child watch requires a positive pid, got {}", pid);
        None
    };
    let watch = pidfd.map(|fd| Arc::new(FdWatch::new(fd, EventMask::READABLE)));
    let use_signal = pidfd.is_none() && pid.as_raw() > 0;

    let source = Source::new(ChildWatchSource {
        pid,
        pidfd,
        watch: watch.clone(),
        maybe_exited: maybe_exited.clone(),
        registered: use_signal,
    });
    source.set_name("child-watch");
    if let Some(watch) = watch {
        source.adopt_fd_watch(watch);
    } else if use_signal {
        unix_signal::register_child_watch(&source, maybe_exited);
    }
    source
}

/// Attach a child watch to the global-default context. Returns the source
/// id.
pub fn child_watch_add<F>(pid: Pid, f: F) -> u32
where
    F: FnMut(Pid, WaitStatus) + Send + 'static,
{
    let source = child_watch_source_new(pid);
    source.set_child_callback(f);
    source.attach(&crate::context::Context::default_context())
}
