//! Event sources.
//!
//! A [`Source`] is one unit of event-driven work: a vtable of hooks
//! ([`SourceFuncs`]) that the iteration engine drives through
//! prepare → check → dispatch, plus the bookkeeping the engine needs (a
//! priority, an optional ready-time deadline, descriptor watches, parent and
//! child links, a replaceable callback).
//!
//! `Source` values are strong references: `clone` refs, dropping unrefs. The
//! reference count is kept by hand rather than relying on `Arc`'s so that a
//! dispose hook can observe the count hitting zero and resurrect the source,
//! which is what makes it possible to clear weak external registries without
//! racing destruction. The `Arc` underneath only keeps the memory alive.

use std::mem::ManuallyDrop;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use lazy_static::lazy_static;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::clock;
use crate::context::{Context, ContextInner};
use crate::poll::EventMask;
use crate::pollset::{FdWatch, FdWatchTag};
use crate::priority;

/// Whether a dispatched source should stay attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFlow {
    /// Keep the source; it may dispatch again.
    Continue,
    /// Destroy the source once the dispatch returns.
    Remove,
}

pub(crate) const FLAG_ACTIVE: u32 = 1 << 0;
pub(crate) const FLAG_READY: u32 = 1 << 1;
pub(crate) const FLAG_BLOCKED: u32 = 1 << 2;
pub(crate) const FLAG_IN_CALL: u32 = 1 << 3;
pub(crate) const FLAG_CAN_RECURSE: u32 = 1 << 4;

/// Lock a mutex, ignoring poisoning.
///
/// User hooks run with no engine lock held, but hook panics can still poison
/// the small per-source mutexes; the protected state stays consistent, so we
/// keep going.
pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

lazy_static! {
    /// Serializes reads of a source's context slot against teardown of that
    /// context. Readers are cheap and frequent (every cross-thread operation
    /// on an attached source); the writer side is taken only while a context
    /// is dropping its last reference.
    static ref DESTROY_LOCK: RwLock<()> = RwLock::new(());
}

pub(crate) fn destroy_lock() -> &'static RwLock<()> {
    &DESTROY_LOCK
}

/// The hook vtable of a source.
///
/// The engine calls every hook with no context lock held, so hooks may freely
/// attach sources, re-enter the loop, or destroy their own source. `dispatch`
/// is handed the source's current callback (if one was set) and decides
/// whether the source survives.
pub trait SourceFuncs: Send {
    /// Called before polling. Returns whether the source is already ready
    /// and, optionally, how long the poll may block on its behalf.
    fn prepare(&mut self, _source: &Source) -> (bool, Option<Duration>) {
        (false, None)
    }

    /// Called after polling to decide whether the source is actually ready.
    ///
    /// Even when this declines, a source still becomes ready when one of its
    /// descriptor watches received events or its ready-time has passed.
    fn check(&mut self, _source: &Source) -> bool {
        false
    }

    /// Deliver the event.
    fn dispatch(&mut self, source: &Source, callback: Option<&mut SourceCallback>) -> ControlFlow;

    /// Called exactly once, after the last strong reference is gone and after
    /// the dispose hook (if any) declined to resurrect.
    fn finalize(&mut self, _source: &Source) {}
}

/// The replaceable callback of a source.
///
/// Built-in sources deliver different payloads, so the callback is a tagged
/// union; a source's dispatch hook picks the variant it understands and warns
/// about the rest.
pub enum SourceCallback {
    /// Plain callback, used by timers, idle sources and custom sources.
    Unit(Box<dyn FnMut() -> ControlFlow + Send>),
    /// Child-watch callback: pid and exit status of the reaped child.
    Child(Box<dyn FnMut(Pid, WaitStatus) + Send>),
    /// Descriptor callback: the descriptor and the received event mask.
    Fd(Box<dyn FnMut(RawFd, EventMask) -> ControlFlow + Send>),
}

/// A callback plus its destroy hook, shared between the source and any
/// dispatch that is currently running it. Dropping the last holder runs the
/// destroy hook, which is how a replaced callback is destroyed only after an
/// in-flight dispatch has finished with it.
pub(crate) struct CallbackCell {
    func: Mutex<SourceCallback>,
    destroy: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CallbackCell {
    fn new(func: SourceCallback, destroy: Option<Box<dyn FnOnce() + Send>>) -> CallbackCell {
        CallbackCell {
            func: Mutex::new(func),
            destroy: Mutex::new(destroy),
        }
    }

    pub(crate) fn invoke<R>(&self, f: impl FnOnce(&mut SourceCallback) -> R) -> R {
        f(&mut lock(&self.func))
    }
}

impl Drop for CallbackCell {
    fn drop(&mut self) {
        if let Some(destroy) = lock(&self.destroy).take() {
            destroy();
        }
    }
}

pub(crate) struct SourceLinks {
    pub children: Vec<Source>,
    pub fds: Vec<Arc<FdWatch>>,
    pub name: Option<String>,
    pub dispose: Option<Box<dyn FnOnce(&Source) + Send>>,
}

pub(crate) struct SourceData {
    pub flags: AtomicU32,
    strong: AtomicU32,
    pub priority: AtomicI32,
    pub ready_time: AtomicI64,
    /// Source id within the owning context; zero iff detached.
    pub id: AtomicU32,
    /// Owning context. Read under the destroy-lock reader side.
    pub context: Mutex<Weak<ContextInner>>,
    pub funcs: Mutex<Box<dyn SourceFuncs>>,
    pub callback: Mutex<Option<Arc<CallbackCell>>>,
    /// Non-owning back-link; the parent holds the strong direction.
    pub parent: Mutex<Weak<SourceData>>,
    pub links: Mutex<SourceLinks>,
}

impl SourceData {
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::SeqCst)
    }

    pub fn set_flags(&self, f: u32) -> u32 {
        self.flags.fetch_or(f, Ordering::SeqCst)
    }

    pub fn clear_flags(&self, f: u32) -> u32 {
        self.flags.fetch_and(!f, Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.flags() & FLAG_ACTIVE == 0
    }

    pub fn is_blocked(&self) -> bool {
        self.flags() & FLAG_BLOCKED != 0
    }

    pub fn is_ready(&self) -> bool {
        self.flags() & FLAG_READY != 0
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::SeqCst)
    }
}

/// A strong reference to an event source.
pub struct Source {
    pub(crate) data: Arc<SourceData>,
}

impl Source {
    /// Create a detached source from its hook vtable.
    ///
    /// Priority defaults to [`priority::DEFAULT`], the ready-time to "never".
    pub fn new<F: SourceFuncs + 'static>(funcs: F) -> Source {
        Source {
            data: Arc::new(SourceData {
                flags: AtomicU32::new(FLAG_ACTIVE),
                strong: AtomicU32::new(1),
                priority: AtomicI32::new(priority::DEFAULT),
                ready_time: AtomicI64::new(-1),
                id: AtomicU32::new(0),
                context: Mutex::new(Weak::new()),
                funcs: Mutex::new(Box::new(funcs)),
                callback: Mutex::new(None),
                parent: Mutex::new(Weak::new()),
                links: Mutex::new(SourceLinks {
                    children: Vec::new(),
                    fds: Vec::new(),
                    name: None,
                    dispose: None,
                }),
            }),
        }
    }

    /// Take another counted reference out of the backing storage.
    pub(crate) fn from_arc(data: &Arc<SourceData>) -> Source {
        data.strong.fetch_add(1, Ordering::Relaxed);
        Source { data: data.clone() }
    }

    /// A handle that shares the current reference instead of taking one.
    /// Used to hand the source to dispose/finalize hooks while the count sits
    /// at the edge; cloning it takes a real reference (resurrection).
    pub(crate) fn transient(data: &Arc<SourceData>) -> ManuallyDrop<Source> {
        ManuallyDrop::new(Source { data: data.clone() })
    }

    /// The id within the owning context, or 0 while detached.
    pub fn id(&self) -> u32 {
        self.data.id.load(Ordering::SeqCst)
    }

    /// The owning context, if the source is attached and the context is still
    /// alive.
    pub fn context(&self) -> Option<Context> {
        self.dup_context()
    }

    pub(crate) fn dup_context(&self) -> Option<Context> {
        let _reader = destroy_lock()
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        lock(&self.data.context).upgrade().map(Context::from_inner)
    }

    pub fn priority(&self) -> i32 {
        self.data.priority()
    }

    pub fn is_destroyed(&self) -> bool {
        self.data.is_destroyed()
    }

    /// The monotonic ready-time deadline in microseconds, `-1` for "never".
    pub fn ready_time(&self) -> i64 {
        self.data.ready_time.load(Ordering::SeqCst)
    }

    /// Arrange for the source to be ready once the given monotonic time is
    /// reached. `0` means immediately, `-1` never. A no-op if unchanged.
    ///
    /// When the source is attached this pokes the context's wakeup so an
    /// in-progress poll with a longer timeout can shorten.
    pub fn set_ready_time(&self, ready_time: i64) {
        if self.data.ready_time.load(Ordering::SeqCst) == ready_time {
            return;
        }
        self.data.ready_time.store(ready_time, Ordering::SeqCst);
        if !self.data.is_blocked() {
            if let Some(ctx) = self.dup_context() {
                ctx.wakeup();
            }
        }
    }

    pub fn can_recurse(&self) -> bool {
        self.data.flags() & FLAG_CAN_RECURSE != 0
    }

    /// Allow (or forbid) dispatching this source again while one of its
    /// dispatches is still on the stack. While forbidden, a dispatching
    /// source is blocked: its descriptor watches leave the poll set until the
    /// dispatch returns.
    pub fn set_can_recurse(&self, can_recurse: bool) {
        if can_recurse {
            self.data.set_flags(FLAG_CAN_RECURSE);
        } else {
            self.data.clear_flags(FLAG_CAN_RECURSE);
        }
    }

    pub fn name(&self) -> Option<String> {
        lock(&self.data.links).name.clone()
    }

    /// Attach a human-readable name, for logs and [`Context::find_source_by_name`].
    pub fn set_name(&self, name: &str) {
        lock(&self.data.links).name = Some(name.to_owned());
    }

    /// Replace the callback. The previous callback's destroy hook runs once
    /// no dispatch is using it any more, outside any engine lock.
    pub fn set_callback_any(&self, callback: SourceCallback) {
        self.set_callback_cell(callback, None);
    }

    /// Plain callback, as used by timers, idle sources and custom sources.
    pub fn set_callback<F>(&self, f: F)
    where
        F: FnMut() -> ControlFlow + Send + 'static,
    {
        self.set_callback_cell(SourceCallback::Unit(Box::new(f)), None);
    }

    /// Plain callback plus a destroy hook that runs exactly once when the
    /// callback is replaced or the source is destroyed.
    pub fn set_callback_full<F, D>(&self, f: F, destroy: D)
    where
        F: FnMut() -> ControlFlow + Send + 'static,
        D: FnOnce() + Send + 'static,
    {
        self.set_callback_cell(SourceCallback::Unit(Box::new(f)), Some(Box::new(destroy)));
    }

    /// Child-watch callback.
    pub fn set_child_callback<F>(&self, f: F)
    where
        F: FnMut(Pid, WaitStatus) + Send + 'static,
    {
        self.set_callback_cell(SourceCallback::Child(Box::new(f)), None);
    }

    /// Descriptor callback.
    pub fn set_fd_callback<F>(&self, f: F)
    where
        F: FnMut(RawFd, EventMask) -> ControlFlow + Send + 'static,
    {
        self.set_callback_cell(SourceCallback::Fd(Box::new(f)), None);
    }

    fn set_callback_cell(&self, func: SourceCallback, destroy: Option<Box<dyn FnOnce() + Send>>) {
        let cell = Arc::new(CallbackCell::new(func, destroy));
        let old = {
            let mut slot = lock(&self.data.callback);
            std::mem::replace(&mut *slot, Some(cell))
        };
        // Runs the old destroy hook here unless a dispatch still holds it.
        drop(old);
    }

    pub(crate) fn take_callback(&self) -> Option<Arc<CallbackCell>> {
        lock(&self.data.callback).take()
    }

    pub(crate) fn snapshot_callback(&self) -> Option<Arc<CallbackCell>> {
        lock(&self.data.callback).clone()
    }

    /// Register the dispose hook. May be set only once; it runs when the
    /// reference count reaches zero, before `finalize`, and may resurrect the
    /// source by cloning the handle it is given.
    pub fn set_dispose<F>(&self, dispose: F)
    where
        F: FnOnce(&Source) + Send + 'static,
    {
        let mut links = lock(&self.data.links);
        if links.dispose.is_some() {
            log::warn!("source dispose function may only be set once; ignoring");
            return;
        }
        links.dispose = Some(Box::new(dispose));
    }

    /// Hand a pre-built watch to a freshly constructed, still detached
    /// source. Builtin sources use this so their hook struct can keep a
    /// reference to the same watch.
    pub(crate) fn adopt_fd_watch(&self, watch: Arc<FdWatch>) {
        debug_assert_eq!(0, self.id());
        lock(&self.data.links).fds.push(watch);
    }

    /// The received event mask of one of this source's descriptor watches.
    ///
    /// Only defined while the source's `check` or `dispatch` runs; at other
    /// times the mask is whatever the last poll left behind.
    pub fn query_fd_watch(&self, tag: &FdWatchTag) -> EventMask {
        tag.watch.revents()
    }

    /// Monotonic time as seen by this iteration of the owning context.
    ///
    /// Stable across all callbacks of one iteration; falls back to a fresh
    /// reading for detached sources.
    pub fn time(&self) -> i64 {
        match self.dup_context() {
            Some(ctx) => ctx.cached_time(),
            None => clock::monotonic_time(),
        }
    }

    pub(crate) fn parent(&self) -> Option<Arc<SourceData>> {
        lock(&self.data.parent).upgrade()
    }

    pub(crate) fn has_parent(&self) -> bool {
        lock(&self.data.parent).upgrade().is_some()
    }

    /// Mark this source and its whole parent chain ready.
    pub(crate) fn propagate_ready(data: &Arc<SourceData>) {
        let mut cur = data.clone();
        loop {
            cur.set_flags(FLAG_READY);
            let parent = lock(&cur.parent).upgrade();
            match parent {
                Some(p) => cur = p,
                None => break,
            }
        }
    }
}

impl Clone for Source {
    fn clone(&self) -> Source {
        Source::from_arc(&self.data)
    }
}

impl PartialEq for Source {
    fn eq(&self, other: &Source) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl Eq for Source {}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id())
            .field("priority", &self.priority())
            .field("name", &lock(&self.data.links).name)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Drop for Source {
    fn drop(&mut self) {
        let data = &self.data;
        let mut old = data.strong.load(Ordering::Acquire);
        loop {
            while old > 1 {
                match data.strong.compare_exchange_weak(
                    old,
                    old - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(v) => old = v,
                }
            }
            if old == 0 {
                debug_assert!(false, "source reference count underflow");
                return;
            }
            // Ours is the last reference. Let the dispose hook veto.
            let dispose = lock(&data.links).dispose.take();
            if let Some(dispose) = dispose {
                let transient = Source::transient(data);
                dispose(&transient);
            }
            match data
                .strong
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                // Resurrected while we looked away; drop ours normally.
                Err(v) => old = v,
            }
        }
        finalize_source(data);
    }
}

/// The count is confirmed at zero: run finalize, drop the callback, release
/// children. Attached sources cannot get here (the context's table reference
/// keeps the count positive until destroy).
fn finalize_source(data: &Arc<SourceData>) {
    if data.id.load(Ordering::SeqCst) != 0 {
        log::warn!("source reference count reached zero while still attached to a context");
    }
    {
        let transient = Source::transient(data);
        lock(&data.funcs).finalize(&transient);
    }
    let callback = lock(&data.callback).take();
    drop(callback);
    let children = {
        let mut links = lock(&data.links);
        std::mem::take(&mut links.children)
    };
    for child in &children {
        *lock(&child.data.parent) = Weak::new();
    }
    // May recursively finalize the children.
    drop(children);
}
