//! Cross-thread wakeup primitive.
//!
//! A context parks inside the poll primitive with no lock held; anything that
//! changes what the poll should be waiting for (a new source, a shortened
//! ready-time, a quit request, a unix signal) pokes the context's `Wakeup` to
//! get the poll to return promptly. The notifier is edge-triggered in spirit:
//! any number of `signal` calls are collapsed into a single readable state
//! that one `acknowledge` clears.
//!
//! On Linux this is an eventfd counter; elsewhere a non-blocking self-pipe.
//! Both ends are close-on-exec. `signal` only ever issues a single `write`
//! and is therefore safe to call from a signal handler.

use std::io;
use std::os::unix::io::RawFd;

use crate::poll::{EventMask, PollFd};

#[derive(Debug)]
enum Inner {
    #[cfg(target_os = "linux")]
    EventFd(RawFd),
    Pipe { read: RawFd, write: RawFd },
}

#[derive(Debug)]
pub struct Wakeup {
    inner: Inner,
}

impl Wakeup {
    pub fn new() -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        {
            let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
            if fd >= 0 {
                return Ok(Wakeup {
                    inner: Inner::EventFd(fd),
                });
            }
            // Old kernels without eventfd fall through to the pipe pair.
        }
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        for &fd in &fds {
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
            }
        }
        Ok(Wakeup {
            inner: Inner::Pipe {
                read: fds[0],
                write: fds[1],
            },
        })
    }

    /// The descriptor to include in the poll set, with its requested mask.
    pub fn pollfd(&self) -> PollFd {
        PollFd::new(self.raw_read_fd(), EventMask::READABLE)
    }

    pub fn raw_read_fd(&self) -> RawFd {
        match self.inner {
            #[cfg(target_os = "linux")]
            Inner::EventFd(fd) => fd,
            Inner::Pipe { read, .. } => read,
        }
    }

    fn raw_write_fd(&self) -> RawFd {
        match self.inner {
            #[cfg(target_os = "linux")]
            Inner::EventFd(fd) => fd,
            Inner::Pipe { write, .. } => write,
        }
    }

    /// Make the next (or current) wait observe readiness.
    ///
    /// Never blocks: once the counter or pipe is full the wakeup is already
    /// pending and the short write failing with `EAGAIN` is the success case.
    /// Async-signal-safe.
    pub fn signal(&self) {
        let one: u64 = 1;
        let (buf, len): (*const libc::c_void, usize) = match self.inner {
            #[cfg(target_os = "linux")]
            Inner::EventFd(_) => (&one as *const u64 as *const libc::c_void, 8),
            Inner::Pipe { .. } => (&one as *const u64 as *const libc::c_void, 1),
        };
        loop {
            let rc = unsafe { libc::write(self.raw_write_fd(), buf, len) };
            // EINTR is the only reason to retry; EAGAIN means already signaled.
            if rc >= 0 || io::Error::last_os_error().kind() != io::ErrorKind::Interrupted {
                return;
            }
        }
    }

    /// Drain any pending notification so the descriptor stops polling ready.
    pub fn acknowledge(&self) {
        let mut buf = [0u8; 64];
        loop {
            let rc = unsafe {
                libc::read(
                    self.raw_read_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if rc < 0 {
                match io::Error::last_os_error().kind() {
                    io::ErrorKind::Interrupted => continue,
                    _ => return,
                }
            }
            match self.inner {
                #[cfg(target_os = "linux")]
                // One read consumes the whole eventfd counter.
                Inner::EventFd(_) => return,
                Inner::Pipe { .. } => {
                    if (rc as usize) < buf.len() {
                        return;
                    }
                }
            }
        }
    }
}

impl Drop for Wakeup {
    fn drop(&mut self) {
        unsafe {
            match self.inner {
                #[cfg(target_os = "linux")]
                Inner::EventFd(fd) => {
                    libc::close(fd);
                }
                Inner::Pipe { read, write } => {
                    libc::close(read);
                    libc::close(write);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::default_poll;

    fn readable(w: &Wakeup) -> bool {
        let mut fds = [w.pollfd()];
        default_poll(&mut fds, 0).unwrap() > 0
    }

    #[test]
    fn signal_then_acknowledge() {
        let w = Wakeup::new().unwrap();
        assert!(!readable(&w));
        w.signal();
        assert!(readable(&w));
        // Multiple signals collapse into one pending notification.
        w.signal();
        w.signal();
        w.acknowledge();
        assert!(!readable(&w));
    }

    #[test]
    fn acknowledge_without_signal_is_harmless() {
        let w = Wakeup::new().unwrap();
        w.acknowledge();
        assert!(!readable(&w));
        w.signal();
        assert!(readable(&w));
    }

    #[test]
    fn signal_from_thread_wakes_waiter() {
        let w = std::sync::Arc::new(Wakeup::new().unwrap());
        let w2 = w.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            w2.signal();
        });
        let mut fds = [w.pollfd()];
        let n = default_poll(&mut fds, 5_000).unwrap();
        assert_eq!(1, n);
        assert!(fds[0].revents.contains(EventMask::READABLE));
        t.join().unwrap();
    }
}
