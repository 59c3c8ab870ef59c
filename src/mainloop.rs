//! The loop driver.
//!
//! A [`MainLoop`] is a thin wrapper over a context: `run` iterates the
//! context with blocking polls until `quit` flips the running flag. Several
//! loops may exist for one context; quitting one only stops the `run` calls
//! made through it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context::Context;

struct LoopInner {
    context: Context,
    running: AtomicBool,
}

/// A reference to a loop; `Clone` refs. Cheap to hand to the thread that will
/// eventually call [`MainLoop::quit`].
pub struct MainLoop {
    inner: Arc<LoopInner>,
}

impl MainLoop {
    pub fn new(context: &Context, initially_running: bool) -> MainLoop {
        MainLoop {
            inner: Arc::new(LoopInner {
                context: context.clone(),
                running: AtomicBool::new(initially_running),
            }),
        }
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Iterate the context until [`MainLoop::quit`] is called.
    ///
    /// If another thread owns the context, this blocks until ownership is
    /// handed over (or the loop is quit while waiting). Calling `run` from
    /// within a source's `prepare` or `check` hook would deadlock the
    /// iteration engine and is rejected with a warning.
    pub fn run(&self) {
        let ctx = &self.inner.context;
        {
            let mut st = ctx.lock_state();
            if !ctx.acquire_locked(&mut st) {
                // Another thread owns the context; wait for the handoff, but
                // keep checking whether someone quit us in the meantime.
                self.inner.running.store(true, Ordering::SeqCst);
                let mut got = false;
                while self.is_running() && !got {
                    let (returned, acquired) = ctx.wait_ownership_once(st);
                    st = returned;
                    got = acquired;
                }
                if !self.is_running() {
                    if got {
                        ctx.release_locked(&mut st);
                    }
                    return;
                }
                debug_assert!(got);
            }
            if Context::in_hook_locked(&st) {
                log::warn!(
                    "MainLoop::run called recursively from within a source's check() or prepare() hook; iteration is not possible"
                );
                ctx.release_locked(&mut st);
                return;
            }
        }

        self.inner.running.store(true, Ordering::SeqCst);
        while self.is_running() {
            ctx.iteration(true);
        }
        ctx.release();
    }

    /// Stop the loop. Sources already queued for dispatch in the current
    /// iteration still run; the next iteration does not start.
    pub fn quit(&self) {
        let ctx = &self.inner.context;
        let st = ctx.lock_state();
        self.inner.running.store(false, Ordering::SeqCst);
        // The owner may be sleeping in poll, or a would-be runner may be
        // waiting for the ownership handoff.
        ctx.wakeup();
        ctx.notify_all_waiters();
        drop(st);
    }
}

impl Clone for MainLoop {
    fn clone(&self) -> MainLoop {
        MainLoop {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ControlFlow;
    use crate::timeout::timeout_source_new;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn quit_from_callback_stops_run() {
        let ctx = Context::new();
        let ml = MainLoop::new(&ctx, false);
        let ml2 = ml.clone();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let timer = timeout_source_new(10);
        timer.set_callback(move || {
            f.fetch_add(1, Ordering::SeqCst);
            ml2.quit();
            ControlFlow::Remove
        });
        timer.attach(&ctx);
        ml.run();
        assert_eq!(1, fired.load(Ordering::SeqCst));
        assert!(!ml.is_running());
    }

    #[test]
    fn quit_from_another_thread_stops_run() {
        let ctx = Context::new();
        let ml = MainLoop::new(&ctx, false);
        let ml2 = ml.clone();
        let t = std::thread::spawn(move || {
            // Quitting before run() has flipped the flag would be lost.
            while !ml2.is_running() {
                std::thread::yield_now();
            }
            ml2.quit();
        });
        ml.run();
        t.join().unwrap();
        assert!(!ml.is_running());
    }

    #[test]
    fn quit_while_waiting_for_ownership_returns() {
        let ctx = Context::new();
        assert!(ctx.acquire());
        let ml = MainLoop::new(&ctx, false);
        let ml2 = ml.clone();
        let runner = std::thread::spawn(move || {
            // Blocks waiting for the ownership handoff that never comes.
            ml2.run();
        });
        while !ml.is_running() {
            std::thread::yield_now();
        }
        ml.quit();
        runner.join().unwrap();
        ctx.release();
    }
}
