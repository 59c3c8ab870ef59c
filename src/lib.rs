//! Mainspring is a reusable event-loop core.
//!
//! # Motivation
//!
//! Most Rust event loops are either a thin wrapper around the OS multiplexer
//! (you build the loop yourself) or a full async runtime (you buy into
//! futures, executors and their ecosystem). Mainspring sits deliberately in
//! between: a callback-style loop with a small, explicit state machine that
//! multiplexes timers, descriptor readiness, child-process termination, unix
//! signals and idle work onto one or more cooperating threads.
//!
//! The model is the classic prepare/check/dispatch design. Clients attach
//! [`Source`]s to a [`Context`]; a [`MainLoop`] drives the context,
//! repeatedly preparing all sources, polling the OS, checking which sources
//! are actually ready and dispatching them in strict priority order. Sources
//! are user-extensible: implement [`SourceFuncs`] and your type participates
//! in the pipeline on equal footing with the builtins.
//!
//! # Design points
//!
//! * **Strict numeric priority.** Smaller numbers run first; within one
//!   iteration nothing runs after a more urgent source fired unless it was
//!   queued beforehand. There is no fairness policy beyond that.
//! * **Cooperative multi-threading.** A context is owned by at most one
//!   thread at a time; ownership hands off through a condition variable.
//!   Any thread may attach sources or ask the context to wake up.
//! * **Recursion is allowed.** Callbacks may iterate their own context or
//!   run nested loops; a dispatching source is blocked from re-entry unless
//!   it opts in with [`Source::set_can_recurse`].
//! * **The OS multiplexer is injected.** The engine hands a flat [`PollFd`]
//!   array and a timeout to a [`PollFn`]; `poll(2)` is the default, tests
//!   substitute fakes.
//!
//! # Example
//!
//! ```
//! use mainspring::{Context, ControlFlow, MainLoop};
//!
//! let ctx = Context::new();
//! let ml = MainLoop::new(&ctx, false);
//!
//! let ticker = mainspring::timeout_source_new(10);
//! let ml2 = ml.clone();
//! let mut remaining = 3;
//! ticker.set_callback(move || {
//!     remaining -= 1;
//!     if remaining == 0 {
//!         ml2.quit();
//!         ControlFlow::Remove
//!     } else {
//!         ControlFlow::Continue
//!     }
//! });
//! ticker.attach(&ctx);
//!
//! ml.run();
//! ```
//!
//! # Threads and signals
//!
//! Unix signal dispositions are process-wide, so signal watches cooperate
//! through one hidden worker thread; see [`unix_signal_source_new`]. Child
//! watches prefer a process descriptor and fall back to `SIGCHLD`, with the
//! usual caveat that nothing else in the process may reap the watched child.

mod child_watch;
mod clock;
mod context;
mod idle;
mod mainloop;
mod poll;
mod pollset;
mod source;
mod timeout;
mod unix_fd;
mod unix_signal;
mod wakeup;

pub use child_watch::{child_watch_add, child_watch_source_new};
pub use clock::{monotonic_time, real_time};
pub use context::{current_source, main_depth, source_remove, Context, ContextFlags};
pub use idle::{idle_add, idle_add_full, idle_add_once, idle_source_new, idle_source_new_once};
pub use mainloop::MainLoop;
pub use poll::{default_poll, EventMask, PollFd, PollFn};
pub use pollset::FdWatchTag;
pub use source::{ControlFlow, Source, SourceCallback, SourceFuncs};
pub use timeout::{
    timeout_add, timeout_add_full, timeout_add_once, timeout_add_seconds, timeout_source_new,
    timeout_source_new_once, timeout_source_new_seconds,
};
pub use unix_fd::unix_fd_source_new;
pub use unix_signal::{unix_signal_add, unix_signal_source_new};

// Child watches and signal sources speak in these types.
pub use nix::sys::signal::Signal;
pub use nix::sys::wait::WaitStatus;
pub use nix::unistd::Pid;

/// Source priorities. Numerically smaller is more urgent.
pub mod priority {
    /// For sources that must preempt everything ordinary.
    pub const HIGH: i32 = -100;
    /// Where sources start out, and where timers and descriptor sources
    /// usually live.
    pub const DEFAULT: i32 = 0;
    /// More urgent than idle work, less urgent than events.
    pub const HIGH_IDLE: i32 = 100;
    /// Where idle sources start out.
    pub const DEFAULT_IDLE: i32 = 200;
    /// Background work that should yield to everything else.
    pub const LOW: i32 = 300;
}
