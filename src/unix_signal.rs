//! Unix signal sources and the process-global signal plumbing.
//!
//! Signal handlers can do almost nothing safely, so the handler installed
//! here only sets per-signal atomic flags and pokes the wakeup of a hidden
//! worker context. The worker thread (which keeps every signal masked) scans
//! the registered watches, flips their per-source pending flags, and signals
//! the wakeup of each watch's owning context; the watches then dispatch from
//! their own loops like any other source.
//!
//! Child watches without a pidfd ride the same machinery via `SIGCHLD`.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use lazy_static::lazy_static;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};

use crate::context::Context;
use crate::source::{destroy_lock, lock, ControlFlow, Source, SourceCallback, SourceData, SourceFuncs};

const NSIG: usize = 65;

#[allow(clippy::declare_interior_mutable_const)]
const PENDING_INIT: AtomicBool = AtomicBool::new(false);

/// Per-signal delivery flags, written from the signal handler. Plain atomic
/// booleans, which the handler may touch.
static PENDING: [AtomicBool; NSIG] = [PENDING_INIT; NSIG];
static ANY_PENDING: AtomicBool = AtomicBool::new(false);

/// Raw wakeup descriptor of the worker context, for the handler's one
/// allowed syscall. `-1` until the worker exists.
static WORKER_WAKEUP_FD: AtomicI32 = AtomicI32::new(-1);

struct SignalWatchReg {
    signum: i32,
    pending: Arc<AtomicBool>,
    source: Weak<SourceData>,
}

struct ChildWatchReg {
    maybe_exited: Arc<AtomicBool>,
    source: Weak<SourceData>,
}

struct SignalGlobal {
    refcount: [u32; NSIG],
    signal_watches: Vec<SignalWatchReg>,
    child_watches: Vec<ChildWatchReg>,
}

lazy_static! {
    static ref SIGNAL_GLOBAL: Mutex<SignalGlobal> = Mutex::new(SignalGlobal {
        refcount: [0u32; NSIG],
        signal_watches: Vec::new(),
        child_watches: Vec::new(),
    });

    /// The hidden worker context and its thread. All signals are masked
    /// around the spawn so the worker (and nothing but the worker) never has
    /// a handler run on its stack.
    static ref WORKER_CONTEXT: Context = {
        let previous_mask = SigSet::all()
            .thread_swap_mask(SigmaskHow::SIG_SETMASK)
            .ok();
        let ctx = Context::new();
        WORKER_WAKEUP_FD.store(ctx.inner.wakeup.raw_read_fd(), Ordering::SeqCst);
        let worker = ctx.clone();
        thread::Builder::new()
            .name("mainspring-signal".into())
            .spawn(move || loop {
                worker.iteration(true);
                if ANY_PENDING.swap(false, Ordering::SeqCst) {
                    dispatch_pending(&mut lock(&SIGNAL_GLOBAL));
                }
            })
            .expect("cannot spawn the signal worker thread");
        if let Some(mask) = previous_mask {
            let _ = mask.thread_set_mask();
        }
        ctx
    };
}

extern "C" fn unix_signal_handler(signum: libc::c_int) {
    // Only atomics and a single write here; nothing else is signal-safe.
    #[cfg(target_os = "linux")]
    let saved_errno = unsafe { *libc::__errno_location() };

    if (signum as usize) < NSIG {
        PENDING[signum as usize].store(true, Ordering::SeqCst);
        ANY_PENDING.store(true, Ordering::SeqCst);
    }
    let fd = WORKER_WAKEUP_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let one: u64 = 1;
        unsafe {
            libc::write(fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location() = saved_errno;
    }
}

/// Fan pending per-signal flags out to the registered watches and wake their
/// owning contexts. Runs on the worker thread, and once at registration time
/// to catch signals that arrived before the watch existed.
fn dispatch_pending(global: &mut SignalGlobal) {
    let mut pending = [false; NSIG];
    for (signum, flag) in PENDING.iter().enumerate() {
        // Test-and-clear one by one: a signal arriving between the swap and
        // the scan just leaves its flag set for the next round.
        pending[signum] = flag
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
    }

    if pending[Signal::SIGCHLD as usize] {
        // A single SIGCHLD can stand for any number of exited children, so
        // every child watch gets to try a reap.
        for reg in &global.child_watches {
            if reg
                .maybe_exited
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                wake_source(&reg.source);
            }
        }
    }

    for reg in &global.signal_watches {
        if pending[reg.signum as usize]
            && reg
                .pending
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            wake_source(&reg.source);
        }
    }
}

/// Wake the context owning `source`, if both still exist. Deliberately does
/// nothing else: this runs with the global signal table locked.
fn wake_source(source: &Weak<SourceData>) {
    let data = match source.upgrade() {
        Some(data) => data,
        None => return,
    };
    let _reader = destroy_lock()
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let ctx = lock(&data.context).upgrade();
    if let Some(ctx) = ctx {
        ctx.wakeup.signal();
    }
}

/// Install our handler for `signum` on the 0 → 1 edge of its watch count.
fn ref_signal_handler(global: &mut SignalGlobal, signal: Signal) {
    // The worker must exist before the first handler can fire.
    lazy_static::initialize(&WORKER_CONTEXT);
    let signum = signal as usize;
    global.refcount[signum] += 1;
    if global.refcount[signum] == 1 {
        let action = SigAction::new(
            SigHandler::Handler(unix_signal_handler),
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP | SaFlags::SA_ONSTACK,
            SigSet::empty(),
        );
        if let Err(e) = unsafe { sigaction(signal, &action) } {
            log::warn!("cannot install handler for {}: {}", signal, e);
        }
    }
}

/// Restore the default disposition on the 1 → 0 edge.
fn unref_signal_handler(global: &mut SignalGlobal, signal: Signal) {
    let signum = signal as usize;
    debug_assert!(global.refcount[signum] > 0);
    global.refcount[signum] -= 1;
    if global.refcount[signum] == 0 {
        let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        if let Err(e) = unsafe { sigaction(signal, &action) } {
            log::warn!("cannot restore default disposition for {}: {}", signal, e);
        }
    }
}

/// Register a pidfd-less child watch for SIGCHLD fan-out.
pub(crate) fn register_child_watch(source: &Source, maybe_exited: Arc<AtomicBool>) {
    let mut global = lock(&SIGNAL_GLOBAL);
    ref_signal_handler(&mut global, Signal::SIGCHLD);
    global.child_watches.push(ChildWatchReg {
        maybe_exited,
        source: Arc::downgrade(&source.data),
    });
    // The child may already have exited and the signal already fired.
    dispatch_pending(&mut global);
}

pub(crate) fn unregister_child_watch(maybe_exited: &Arc<AtomicBool>) {
    let mut global = lock(&SIGNAL_GLOBAL);
    if let Some(pos) = global
        .child_watches
        .iter()
        .position(|reg| Arc::ptr_eq(&reg.maybe_exited, maybe_exited))
    {
        global.child_watches.remove(pos);
        unref_signal_handler(&mut global, Signal::SIGCHLD);
    }
}

struct UnixSignalSource {
    signal: Signal,
    pending: Arc<AtomicBool>,
}

impl SourceFuncs for UnixSignalSource {
    fn prepare(&mut self, _source: &Source) -> (bool, Option<std::time::Duration>) {
        (self.pending.load(Ordering::SeqCst), None)
    }

    fn check(&mut self, _source: &Source) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    fn dispatch(&mut self, _source: &Source, callback: Option<&mut SourceCallback>) -> ControlFlow {
        self.pending.store(false, Ordering::SeqCst);
        match callback {
            Some(SourceCallback::Unit(f)) => f(),
            Some(_) => {
                log::warn!("signal source dispatched with a mismatched callback type");
                ControlFlow::Remove
            }
            None => {
                log::warn!("signal source dispatched without a callback; set one first");
                ControlFlow::Remove
            }
        }
    }

    fn finalize(&mut self, _source: &Source) {
        let mut global = lock(&SIGNAL_GLOBAL);
        if let Some(pos) = global
            .signal_watches
            .iter()
            .position(|reg| Arc::ptr_eq(&reg.pending, &self.pending))
        {
            global.signal_watches.remove(pos);
            unref_signal_handler(&mut global, self.signal);
        }
    }
}

/// A source that dispatches whenever `signal` is delivered to the process.
///
/// Multiple sources may watch the same signal; each gets its own delivery.
/// Signals coalesce: one dispatch means the signal arrived at least once
/// since the previous dispatch. The process disposition for `signal` is
/// taken over while at least one watch exists and restored to the default
/// afterwards.
pub fn unix_signal_source_new(signal: Signal) -> Source {
    let pending = Arc::new(AtomicBool::new(false));
    let source = Source::new(UnixSignalSource {
        signal,
        pending: pending.clone(),
    });
    source.set_name(&format!("unix-signal:{}", signal));

    let mut global = lock(&SIGNAL_GLOBAL);
    ref_signal_handler(&mut global, signal);
    global.signal_watches.push(SignalWatchReg {
        signum: signal as i32,
        pending,
        source: Arc::downgrade(&source.data),
    });
    // Catch a signal that fired before this watch was registered.
    dispatch_pending(&mut global);
    drop(global);

    source
}

/// Attach a signal callback to the global-default context. Returns the
/// source id.
pub fn unix_signal_add<F>(signal: Signal, f: F) -> u32
where
    F: FnMut() -> ControlFlow + Send + 'static,
{
    let source = unix_signal_source_new(signal);
    source.set_callback(f);
    source.attach(&Context::default_context())
}
