//! Contexts and the iteration engine.
//!
//! A [`Context`] owns a set of attached sources and drives them through the
//! prepare → query → poll → check → dispatch pipeline. At most one thread at
//! a time is the context's *owner* and may run the pipeline; other threads
//! may still attach and destroy sources, adjust priorities and ready-times,
//! and poke the wakeup, all serialized by the context's internal mutex.
//!
//! The mutex is never held across a user hook. Every phase collects the
//! sources it will visit (taking strong references) while locked, then drops
//! the lock around each `prepare`/`check`/`dispatch` call. References whose
//! drop could run user code (finalize, callback destroy) are parked in a
//! graveyard and dropped only after the guard is released.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

use lazy_static::lazy_static;

use crate::clock;
use crate::poll::{default_poll, poll_debug_enabled, EventMask, PollFd, PollFn};
use crate::pollset::{FdWatch, FdWatchTag, PollRecordSet};
use crate::priority;
use crate::source::{
    destroy_lock, lock, CallbackCell, ControlFlow, Source, SourceData, FLAG_ACTIVE, FLAG_BLOCKED,
    FLAG_IN_CALL, FLAG_READY,
};
use crate::wakeup::Wakeup;

/// Behavior switches fixed at context construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContextFlags(u32);

impl ContextFlags {
    pub const NONE: ContextFlags = ContextFlags(0);
    /// Assume the context will be polled by threads that never acquire it:
    /// attaching a source always signals the wakeup, not only when a foreign
    /// owner might be sleeping in poll.
    pub const OWNERLESS_POLLING: ContextFlags = ContextFlags(1);

    pub fn contains(self, other: ContextFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ContextFlags {
    type Output = ContextFlags;
    fn bitor(self, rhs: ContextFlags) -> ContextFlags {
        ContextFlags(self.0 | rhs.0)
    }
}

struct PriorityBucket {
    priority: i32,
    /// Insertion order, except that a child is placed immediately before its
    /// parent so it is considered first.
    members: Vec<Arc<SourceData>>,
}

pub(crate) struct ContextState {
    owner: Option<ThreadId>,
    owner_count: u32,
    waiters: usize,
    /// Monotonically increasing id allocator; skips ids still in use after
    /// wrapping, never hands out zero.
    next_id: u32,
    sources: HashMap<u32, Source>,
    buckets: Vec<PriorityBucket>,
    pollset: PollRecordSet,
    cached_poll: Vec<PollFd>,
    pending: Vec<Option<Source>>,
    poll_fn: PollFn,
    time_usec: i64,
    time_is_fresh: bool,
    timeout_usec: i64,
    in_check_or_prepare: u32,
}

pub(crate) struct ContextInner {
    pub(crate) state: Mutex<ContextState>,
    pub(crate) cond: Condvar,
    pub(crate) wakeup: Wakeup,
    wakeup_watch: Arc<FdWatch>,
    flags: ContextFlags,
}

/// References that must not be dropped while the context mutex is held:
/// dropping them can run finalize hooks or callback destroy hooks.
#[derive(Default)]
pub(crate) struct Graveyard {
    sources: Vec<Source>,
    callbacks: Vec<Arc<CallbackCell>>,
}

impl Drop for Graveyard {
    fn drop(&mut self) {
        // Callback destroy hooks run before source finalizers, matching the
        // order destroy itself uses.
        self.callbacks.clear();
        self.sources.clear();
    }
}

/// A reference to a context. `Clone` refs, dropping unrefs; the last drop
/// detaches all remaining sources and releases the internal buffers.
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

lazy_static! {
    static ref DEFAULT_CONTEXT: Context = Context::new();
}

thread_local! {
    static THREAD_DEFAULT_STACK: RefCell<Vec<Option<Context>>> = const { RefCell::new(Vec::new()) };
    static DISPATCH: RefCell<DispatchRecord> = const {
        RefCell::new(DispatchRecord { depth: 0, source: None })
    };
}

struct DispatchRecord {
    depth: u32,
    source: Option<Source>,
}

/// Depth of nested dispatches on the calling thread: 0 outside any callback,
/// 1 inside a callback of a top-level iteration, and so on.
pub fn main_depth() -> u32 {
    DISPATCH.with(|d| d.borrow().depth)
}

/// The source whose dispatch is running on the calling thread, if any.
pub fn current_source() -> Option<Source> {
    DISPATCH.with(|d| d.borrow().source.clone())
}

/// Destroy the source with the given id on the global-default context.
///
/// Returns whether such a source existed; a miss is also logged, since ids
/// may be reused and removing by a stale id is a bug in the caller.
pub fn source_remove(id: u32) -> bool {
    match Context::default_context().find_source(id) {
        Some(source) => {
            source.destroy();
            true
        }
        None => {
            log::warn!("source id {} not found when attempting removal", id);
            false
        }
    }
}

impl Context {
    pub fn new() -> Context {
        Context::with_flags(ContextFlags::NONE)
    }

    pub fn with_flags(flags: ContextFlags) -> Context {
        let wakeup =
            Wakeup::new().unwrap_or_else(|e| panic!("cannot create context wakeup: {}", e));
        let wakeup_watch = Arc::new(FdWatch::new(wakeup.raw_read_fd(), EventMask::READABLE));
        let mut state = ContextState {
            owner: None,
            owner_count: 0,
            waiters: 0,
            next_id: 1,
            sources: HashMap::new(),
            buckets: Vec::new(),
            pollset: PollRecordSet::new(),
            cached_poll: Vec::new(),
            pending: Vec::new(),
            poll_fn: default_poll,
            time_usec: clock::monotonic_time(),
            time_is_fresh: false,
            timeout_usec: -1,
            in_check_or_prepare: 0,
        };
        state.pollset.add(&wakeup_watch, 0);
        Context {
            inner: Arc::new(ContextInner {
                state: Mutex::new(state),
                cond: Condvar::new(),
                wakeup,
                wakeup_watch,
                flags,
            }),
        }
    }

    /// Test seam: a fresh context whose id allocator starts at `next_id`.
    #[doc(hidden)]
    pub fn with_next_id(next_id: u32) -> Context {
        let ctx = Context::new();
        ctx.lock_state().next_id = next_id;
        ctx
    }

    /// The process-wide default context, created on first use.
    pub fn default_context() -> Context {
        DEFAULT_CONTEXT.clone()
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Context {
        Context { inner }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        lock(&self.inner.state)
    }

    fn is_default(&self) -> bool {
        Arc::ptr_eq(&self.inner, &DEFAULT_CONTEXT.inner)
    }

    /// Push this context as the calling thread's default and acquire it.
    ///
    /// Fails (with a warning) when the context is owned by another thread.
    pub fn push_thread_default(&self) {
        if !self.acquire() {
            log::warn!("cannot push a context owned by another thread as thread default");
            return;
        }
        let entry = if self.is_default() {
            None
        } else {
            Some(self.clone())
        };
        THREAD_DEFAULT_STACK.with(|stack| stack.borrow_mut().push(entry));
    }

    /// Pop this context off the thread-default stack and release it. The
    /// context must be the current top of the stack.
    pub fn pop_thread_default(&self) {
        let me = if self.is_default() {
            None
        } else {
            Some(self.clone())
        };
        let popped = THREAD_DEFAULT_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            let matches = match (stack.last(), &me) {
                (Some(None), None) => true,
                (Some(Some(top)), Some(ctx)) => Arc::ptr_eq(&top.inner, &ctx.inner),
                _ => false,
            };
            if matches {
                stack.pop();
                true
            } else {
                false
            }
        });
        if !popped {
            log::warn!("pop_thread_default called on a context that is not the current top");
            return;
        }
        self.release();
    }

    /// The calling thread's default context; `None` means "fall back to the
    /// global default".
    pub fn thread_default() -> Option<Context> {
        THREAD_DEFAULT_STACK.with(|stack| stack.borrow().last().cloned().flatten())
    }

    /// Like [`Context::thread_default`], but resolves the fallback.
    pub fn ref_thread_default() -> Context {
        Context::thread_default().unwrap_or_else(Context::default_context)
    }

    /// Try to become the owner. Recursive: the owner may acquire again and
    /// must release as many times.
    pub fn acquire(&self) -> bool {
        let mut st = self.lock_state();
        self.acquire_locked(&mut st)
    }

    pub(crate) fn acquire_locked(&self, st: &mut ContextState) -> bool {
        let me = thread::current().id();
        if st.owner.is_none() {
            st.owner = Some(me);
            debug_assert_eq!(0, st.owner_count);
        }
        if st.owner == Some(me) {
            st.owner_count += 1;
            true
        } else {
            false
        }
    }

    /// Release one level of ownership; on reaching zero the next waiting
    /// thread is signaled. Releasing without owning is tolerated for
    /// historical reasons, but logged.
    pub fn release(&self) {
        let mut st = self.lock_state();
        self.release_locked(&mut st);
    }

    pub(crate) fn release_locked(&self, st: &mut ContextState) {
        if st.owner_count == 0 {
            log::warn!("context released without a matching acquire");
            return;
        }
        st.owner_count -= 1;
        if st.owner_count == 0 {
            st.owner = None;
            if st.waiters > 0 {
                self.inner.cond.notify_one();
            }
        }
    }

    pub fn is_owner(&self) -> bool {
        let st = self.lock_state();
        st.owner == Some(thread::current().id())
    }

    /// Block until ownership can be taken. Returns with the lock held and
    /// ownership acquired.
    fn wait_for_ownership<'a>(
        &self,
        mut st: MutexGuard<'a, ContextState>,
    ) -> MutexGuard<'a, ContextState> {
        loop {
            let (returned, got) = self.wait_ownership_once(st);
            st = returned;
            if got {
                return st;
            }
        }
    }

    /// One round of the ownership handoff: try to acquire, otherwise wait
    /// for one condvar signal and try once more. Used by [`MainLoop::run`],
    /// which must recheck its running flag between rounds.
    ///
    /// [`MainLoop::run`]: crate::MainLoop::run
    pub(crate) fn wait_ownership_once<'a>(
        &self,
        mut st: MutexGuard<'a, ContextState>,
    ) -> (MutexGuard<'a, ContextState>, bool) {
        if self.acquire_locked(&mut st) {
            return (st, true);
        }
        st.waiters += 1;
        st = self
            .inner
            .cond
            .wait(st)
            .unwrap_or_else(PoisonError::into_inner);
        st.waiters -= 1;
        let got = self.acquire_locked(&mut st);
        (st, got)
    }

    pub(crate) fn in_hook_locked(st: &ContextState) -> bool {
        st.in_check_or_prepare > 0
    }

    /// Wake every thread parked in the ownership handoff.
    pub(crate) fn notify_all_waiters(&self) {
        self.inner.cond.notify_all();
    }

    /// Find an attached source by id.
    pub fn find_source(&self, id: u32) -> Option<Source> {
        if id == 0 {
            log::warn!("source ids are always positive; 0 never matches");
            return None;
        }
        let st = self.lock_state();
        st.sources
            .get(&id)
            .filter(|s| !s.data.is_destroyed())
            .cloned()
    }

    /// Find the first attached source with the given name, in priority order.
    pub fn find_source_by_name(&self, name: &str) -> Option<Source> {
        self.find_source_where(|s| s.name().as_deref() == Some(name))
    }

    /// Find the first attached source matching a predicate, in priority
    /// order. The predicate runs without the context lock held.
    pub fn find_source_where(&self, mut pred: impl FnMut(&Source) -> bool) -> Option<Source> {
        let snapshot = {
            let st = self.lock_state();
            snapshot_sources(&st)
        };
        snapshot
            .into_iter()
            .find(|s| !s.data.is_destroyed() && pred(s))
    }

    /// Number of attached sources, destroyed-but-referenced ones excluded.
    pub fn source_count(&self) -> usize {
        self.lock_state().sources.len()
    }

    /// Signal the context's wakeup: a thread sleeping in this context's poll
    /// returns promptly.
    pub fn wakeup(&self) {
        self.inner.wakeup.signal();
    }

    /// Replace the poll primitive used by this context.
    pub fn set_poll_fn(&self, poll_fn: PollFn) {
        self.lock_state().poll_fn = poll_fn;
    }

    /// Monotonic time as cached for the current iteration, refreshing the
    /// cache if it went stale.
    pub(crate) fn cached_time(&self) -> i64 {
        let mut st = self.lock_state();
        if !st.time_is_fresh {
            st.time_usec = clock::monotonic_time();
            st.time_is_fresh = true;
        }
        st.time_usec
    }

    /// First pipeline phase: ask every eligible source to prepare and settle
    /// on the iteration's effective max priority and poll timeout.
    ///
    /// Returns `(some_source_ready, max_priority)`.
    pub fn prepare(&self) -> (bool, i32) {
        let mut st = self.lock_state();
        st.time_is_fresh = false;
        if st.in_check_or_prepare > 0 {
            drop(st);
            log::warn!(
                "Context::prepare called recursively from within a source's check() or prepare() hook"
            );
            return (false, i32::MAX);
        }

        // If recursing, the pending dispatches of the outer iteration are
        // abandoned; their references are dropped outside the lock.
        let old_pending = std::mem::take(&mut st.pending);

        st.timeout_usec = -1;
        let snapshot = snapshot_sources(&st);
        let mut n_ready = 0usize;
        let mut current_priority = i32::MAX;

        for source in &snapshot {
            let data = &source.data;
            if data.is_destroyed() || data.is_blocked() {
                continue;
            }
            if n_ready > 0 && data.priority() > current_priority {
                break;
            }

            let mut source_timeout_usec: i64 = -1;
            if !data.is_ready() {
                st.in_check_or_prepare += 1;
                drop(st);
                let (hook_ready, hook_timeout) = lock(&data.funcs).prepare(source);
                st = self.lock_state();
                st.in_check_or_prepare -= 1;

                let mut ready = hook_ready;
                source_timeout_usec =
                    hook_timeout.map_or(-1, |d| d.as_micros().min(i64::MAX as u128) as i64);

                let ready_time = data.ready_time.load(std::sync::atomic::Ordering::SeqCst);
                if !ready && ready_time != -1 {
                    if !st.time_is_fresh {
                        st.time_usec = clock::monotonic_time();
                        st.time_is_fresh = true;
                    }
                    if ready_time <= st.time_usec {
                        source_timeout_usec = 0;
                        ready = true;
                    } else if source_timeout_usec < 0
                        || ready_time < st.time_usec + source_timeout_usec
                    {
                        source_timeout_usec = (ready_time - st.time_usec).max(0);
                    }
                }
                if ready {
                    Source::propagate_ready(data);
                }
            }

            if data.is_ready() {
                n_ready += 1;
                current_priority = data.priority();
                st.timeout_usec = 0;
            }
            if source_timeout_usec >= 0 {
                st.timeout_usec = if st.timeout_usec < 0 {
                    source_timeout_usec
                } else {
                    st.timeout_usec.min(source_timeout_usec)
                };
            }
        }

        drop(st);
        drop(old_pending);
        drop(snapshot);
        (n_ready > 0, current_priority)
    }

    /// Second pipeline phase: flatten the poll records at `max_priority` into
    /// `fds` and report `(slots_needed, timeout_ms)`. When `slots_needed`
    /// exceeds `fds.len()`, grow the array and call again.
    pub fn query(&self, max_priority: i32, fds: &mut [PollFd]) -> (usize, i32) {
        let mut st = self.lock_state();
        let needed = st.pollset.flatten(max_priority, fds);
        let timeout_usec = st.timeout_usec;
        if timeout_usec != 0 {
            st.time_is_fresh = false;
        }
        drop(st);
        if poll_debug_enabled() {
            log::debug!(
                "query: {} poll records (max_priority {}), timeout {}µs",
                needed,
                max_priority,
                timeout_usec
            );
        }
        (needed, clock::timeout_usec_to_msec(timeout_usec))
    }

    /// Fourth pipeline phase (the third, polling, belongs to the caller in
    /// manual iteration): scatter received events and determine readiness.
    ///
    /// Returns false without dispatching anything when the record set changed
    /// while the poll was in flight; the iteration should simply restart.
    pub fn check(&self, max_priority: i32, fds: &[PollFd]) -> bool {
        let mut st = self.lock_state();
        if st.in_check_or_prepare > 0 {
            drop(st);
            log::warn!(
                "Context::check called recursively from within a source's check() or prepare() hook"
            );
            return false;
        }

        for pollfd in fds {
            if pollfd.fd == self.inner.wakeup.raw_read_fd() {
                if !pollfd.revents.is_empty() {
                    self.inner.wakeup.acknowledge();
                }
                break;
            }
        }

        // The array no longer matches the record set; let the loop rerun.
        if st.pollset.changed() {
            return false;
        }

        st.pollset.scatter(max_priority, fds);

        let snapshot = snapshot_sources(&st);
        let mut n_ready = 0usize;
        let mut max_priority = max_priority;

        for source in &snapshot {
            let data = &source.data;
            if data.is_destroyed() || data.is_blocked() {
                continue;
            }
            if n_ready > 0 && data.priority() > max_priority {
                break;
            }

            if !data.is_ready() {
                st.in_check_or_prepare += 1;
                drop(st);
                let mut ready = lock(&data.funcs).check(source);
                st = self.lock_state();
                st.in_check_or_prepare -= 1;

                if !ready {
                    // A declined check still counts as ready when one of the
                    // source's own descriptors received events.
                    let fds_hit = {
                        let links = lock(&data.links);
                        links.fds.iter().any(|w| !w.revents().is_empty())
                    };
                    if fds_hit {
                        ready = true;
                    }
                }
                if !ready {
                    let ready_time = data.ready_time.load(std::sync::atomic::Ordering::SeqCst);
                    if ready_time != -1 {
                        if !st.time_is_fresh {
                            st.time_usec = clock::monotonic_time();
                            st.time_is_fresh = true;
                        }
                        if ready_time <= st.time_usec {
                            ready = true;
                        }
                    }
                }
                if ready {
                    Source::propagate_ready(data);
                }
            }

            if data.is_ready() {
                st.pending.push(Some(source.clone()));
                n_ready += 1;
                // Never dispatch sources with less urgency than the first
                // one chosen.
                max_priority = data.priority();
            }
        }

        drop(st);
        drop(snapshot);
        n_ready > 0
    }

    /// Final pipeline phase: dispatch everything queued by `check`, in order.
    pub fn dispatch(&self) {
        let mut graveyard = Graveyard::default();
        let mut st = self.lock_state();
        let mut i = 0;
        while i < st.pending.len() {
            let entry = st.pending[i].take();
            i += 1;
            let source = match entry {
                Some(source) => source,
                None => continue,
            };
            let data = source.data.clone();
            data.clear_flags(FLAG_READY);
            if data.is_destroyed() {
                graveyard.sources.push(source);
                continue;
            }

            let callback = source.snapshot_callback();
            if !source.can_recurse() {
                block_source(self, &mut st, &data);
            }
            let was_in_call = data.set_flags(FLAG_IN_CALL) & FLAG_IN_CALL != 0;

            drop(st);
            let prev = DISPATCH.with(|d| {
                let mut d = d.borrow_mut();
                d.depth += 1;
                std::mem::replace(&mut d.source, Some(source.clone()))
            });
            // A recursing source can reach its own dispatch again from a
            // nested iteration while the outer dispatch still holds the hook
            // state; that inner delivery has nothing to call into and is
            // skipped.
            let flow = match data.funcs.try_lock() {
                Ok(mut funcs) => match &callback {
                    Some(cell) => cell.invoke(|cb| funcs.dispatch(&source, Some(cb))),
                    None => funcs.dispatch(&source, None),
                },
                Err(std::sync::TryLockError::Poisoned(poisoned)) => {
                    let mut funcs = poisoned.into_inner();
                    match &callback {
                        Some(cell) => cell.invoke(|cb| funcs.dispatch(&source, Some(cb))),
                        None => funcs.dispatch(&source, None),
                    }
                }
                Err(std::sync::TryLockError::WouldBlock) => {
                    log::warn!("source dispatched recursively while its dispatch is still running; skipping");
                    ControlFlow::Continue
                }
            };
            DISPATCH.with(|d| {
                let mut d = d.borrow_mut();
                d.depth -= 1;
                d.source = prev;
            });
            st = self.lock_state();

            if !was_in_call {
                data.clear_flags(FLAG_IN_CALL);
            }
            if data.is_blocked() && !data.is_destroyed() {
                unblock_source(self, &mut st, &data);
            }
            if flow == ControlFlow::Remove && !data.is_destroyed() {
                destroy_locked(self, &mut st, &source, &mut graveyard);
            }
            if let Some(cell) = callback {
                graveyard.callbacks.push(cell);
            }
            graveyard.sources.push(source);
        }
        // Anything still queued (left by a nested non-dispatching iteration)
        // must not have its references dropped under the lock.
        for entry in st.pending.drain(..) {
            if let Some(source) = entry {
                graveyard.sources.push(source);
            }
        }
        drop(st);
        drop(graveyard);
    }

    /// Run one full iteration: prepare, query, poll, check, dispatch.
    ///
    /// With `may_block` the poll may sleep until something happens; without
    /// it the iteration only handles what is ready right now. Returns whether
    /// any source was dispatched.
    pub fn iteration(&self, may_block: bool) -> bool {
        self.iterate(may_block, true)
    }

    /// Non-destructive readiness probe: prepare, query, poll(0), check, no
    /// dispatch.
    pub fn pending(&self) -> bool {
        self.iterate(false, false)
    }

    fn iterate(&self, may_block: bool, dispatch: bool) -> bool {
        {
            let mut st = self.lock_state();
            if !self.acquire_locked(&mut st) {
                if !may_block {
                    return false;
                }
                st = self.wait_for_ownership(st);
                drop(st);
            }
        }

        let (_, max_priority) = self.prepare();

        let mut fds = std::mem::take(&mut self.lock_state().cached_poll);
        let mut timeout_ms;
        let n_fds;
        loop {
            let (needed, t) = self.query(max_priority, &mut fds);
            timeout_ms = t;
            if needed <= fds.len() {
                n_fds = needed;
                break;
            }
            fds.resize(needed, PollFd::new(-1, EventMask::NONE));
        }

        if !may_block {
            timeout_ms = 0;
        }
        self.poll_records(&mut fds[..n_fds], timeout_ms);

        let some_ready = self.check(max_priority, &fds[..n_fds]);
        if dispatch {
            self.dispatch();
        }

        self.lock_state().cached_poll = fds;
        self.release();
        some_ready
    }

    /// Invoke the injected poll primitive outside the lock.
    fn poll_records(&self, fds: &mut [PollFd], timeout_ms: i32) {
        if fds.is_empty() && timeout_ms == 0 {
            return;
        }
        let poll_fn = self.lock_state().poll_fn;
        let debug_start = if poll_debug_enabled() {
            log::debug!("polling {} descriptors, timeout {}ms", fds.len(), timeout_ms);
            Some(std::time::Instant::now())
        } else {
            None
        };
        match poll_fn(fds, timeout_ms) {
            Ok(_) => {}
            // Interruption is not an error: nothing is ready this round.
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => log::warn!("poll failed: {}", e),
        }
        if let Some(start) = debug_start {
            for pollfd in fds.iter().filter(|p| !p.revents.is_empty()) {
                log::debug!("  fd {} received {:?}", pollfd.fd, pollfd.revents);
            }
            log::debug!("poll finished in {:?}", start.elapsed());
        }
    }

    /// Run `f` with this context owned, repeating while it returns
    /// [`ControlFlow::Continue`].
    ///
    /// Called directly when the calling thread already owns the context;
    /// acquires synchronously when the context is the thread default;
    /// otherwise schedules an idle source on the context.
    pub fn invoke<F>(&self, f: F)
    where
        F: FnMut() -> ControlFlow + Send + 'static,
    {
        self.invoke_full(priority::DEFAULT, f);
    }

    /// Like [`Context::invoke`] with an explicit priority for the scheduled
    /// case.
    pub fn invoke_full<F>(&self, priority: i32, mut f: F)
    where
        F: FnMut() -> ControlFlow + Send + 'static,
    {
        if self.is_owner() {
            while f() == ControlFlow::Continue {}
            return;
        }
        let thread_default = Context::ref_thread_default();
        if Arc::ptr_eq(&thread_default.inner, &self.inner) && self.acquire() {
            while f() == ControlFlow::Continue {}
            self.release();
        } else {
            let source = crate::idle::idle_source_new();
            source.set_priority(priority);
            source.set_callback(f);
            source.attach(self);
        }
    }
}

impl Clone for Context {
    fn clone(&self) -> Context {
        Context {
            inner: self.inner.clone(),
        }
    }
}

impl Default for Context {
    fn default() -> Context {
        Context::new()
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock_state();
        f.debug_struct("Context")
            .field("sources", &st.sources.len())
            .field("poll_records", &st.pollset.len())
            .field("owned", &st.owner.is_some())
            .finish()
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // Last reference: nothing can reach this context any more, but
        // sources may still be attached. Detach them while holding strong
        // references so their finalizers observe a coherent, empty context.
        let st = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        let mut sources: Vec<Source> = st.sources.drain().map(|(_, s)| s).collect();
        for entry in st.pending.drain(..) {
            if let Some(source) = entry {
                sources.push(source);
            }
        }
        st.buckets.clear();
        {
            let _writer = destroy_lock()
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            for source in &sources {
                *lock(&source.data.context) = Weak::new();
                source.data.id.store(0, std::sync::atomic::Ordering::SeqCst);
            }
        }
        for source in &sources {
            source.data.clear_flags(FLAG_ACTIVE);
            drop(source.take_callback());
        }
        // Finalizers of unreferenced sources run here.
        drop(sources);
    }
}

fn snapshot_sources(st: &ContextState) -> Vec<Source> {
    let mut out = Vec::new();
    for bucket in &st.buckets {
        for member in &bucket.members {
            out.push(Source::from_arc(member));
        }
    }
    out
}

fn bucket_insert(st: &mut ContextState, data: &Arc<SourceData>) {
    let prio = data.priority();
    let idx = match st.buckets.binary_search_by(|b| b.priority.cmp(&prio)) {
        Ok(idx) => idx,
        Err(idx) => {
            st.buckets.insert(
                idx,
                PriorityBucket {
                    priority: prio,
                    members: Vec::new(),
                },
            );
            idx
        }
    };
    let bucket = &mut st.buckets[idx];
    let parent = lock(&data.parent).upgrade();
    let parent_pos = parent.and_then(|p| bucket.members.iter().position(|m| Arc::ptr_eq(m, &p)));
    match parent_pos {
        // A child goes immediately before its parent.
        Some(pos) => bucket.members.insert(pos, data.clone()),
        None => bucket.members.push(data.clone()),
    }
}

fn bucket_remove(st: &mut ContextState, data: &Arc<SourceData>) {
    let prio = data.priority();
    if let Ok(idx) = st.buckets.binary_search_by(|b| b.priority.cmp(&prio)) {
        let bucket = &mut st.buckets[idx];
        if let Some(pos) = bucket.members.iter().position(|m| Arc::ptr_eq(m, data)) {
            bucket.members.remove(pos);
        }
        if bucket.members.is_empty() {
            st.buckets.remove(idx);
        }
    }
}

fn add_poll_locked(ctx: &Context, st: &mut ContextState, watch: &Arc<FdWatch>, prio: i32) {
    st.pollset.add(watch, prio);
    // The context's own wakeup record needs no wakeup.
    if !Arc::ptr_eq(watch, &ctx.inner.wakeup_watch) {
        ctx.inner.wakeup.signal();
    }
}

fn remove_poll_locked(ctx: &Context, st: &mut ContextState, watch: &Arc<FdWatch>) {
    st.pollset.remove(watch);
    ctx.inner.wakeup.signal();
}

/// Pull a dispatching source (and its children) out of the poll set until
/// the dispatch returns.
fn block_source(ctx: &Context, st: &mut ContextState, data: &Arc<SourceData>) {
    if data.is_blocked() {
        log::warn!("attempt to block an already blocked source");
        return;
    }
    data.set_flags(FLAG_BLOCKED);
    let (fds, children) = {
        let links = lock(&data.links);
        (links.fds.clone(), links.children.clone())
    };
    for watch in &fds {
        remove_poll_locked(ctx, st, watch);
    }
    for child in &children {
        block_source(ctx, st, &child.data);
    }
    drop(children);
}

fn unblock_source(ctx: &Context, st: &mut ContextState, data: &Arc<SourceData>) {
    if !data.is_blocked() || data.is_destroyed() {
        log::warn!("attempt to unblock a source that is not blocked");
        return;
    }
    data.clear_flags(FLAG_BLOCKED);
    let (fds, children) = {
        let links = lock(&data.links);
        (links.fds.clone(), links.children.clone())
    };
    for watch in &fds {
        add_poll_locked(ctx, st, watch, data.priority());
    }
    for child in &children {
        unblock_source(ctx, st, &child.data);
    }
    drop(children);
}

/// Set a blocked flag on a detached subtree (used when a child is added to a
/// blocked parent; there is no poll set to update yet).
fn block_flags_only(data: &Arc<SourceData>) {
    data.set_flags(FLAG_BLOCKED);
    let children = lock(&data.links).children.clone();
    for child in &children {
        block_flags_only(&child.data);
    }
    drop(children);
}

fn attach_locked(ctx: &Context, st: &mut ContextState, source: &Source, do_wakeup: bool) -> u32 {
    // The counter may have wrapped; never reuse a live id and never hand out
    // zero.
    let id = loop {
        let id = st.next_id;
        st.next_id = st.next_id.wrapping_add(1);
        if id != 0 && !st.sources.contains_key(&id) {
            break id;
        }
    };
    source.data.id.store(id, std::sync::atomic::Ordering::SeqCst);
    *lock(&source.data.context) = Arc::downgrade(&ctx.inner);
    st.sources.insert(id, source.clone());
    bucket_insert(st, &source.data);

    if !source.data.is_blocked() {
        let fds = lock(&source.data.links).fds.clone();
        for watch in &fds {
            add_poll_locked(ctx, st, watch, source.data.priority());
        }
    }

    let children = lock(&source.data.links).children.clone();
    for child in &children {
        attach_locked(ctx, st, child, false);
    }
    drop(children);

    // A foreign owner (or, with ownerless polling, anyone) may be sleeping in
    // poll with a timeout computed before this source existed.
    if do_wakeup
        && (ctx.inner.flags.contains(ContextFlags::OWNERLESS_POLLING)
            || (st.owner.is_some() && st.owner != Some(thread::current().id())))
    {
        ctx.inner.wakeup.signal();
    }
    id
}

pub(crate) fn destroy_locked(
    ctx: &Context,
    st: &mut ContextState,
    source: &Source,
    graveyard: &mut Graveyard,
) {
    if source.data.is_destroyed() {
        return;
    }
    source.data.clear_flags(FLAG_ACTIVE);

    if let Some(cell) = source.take_callback() {
        graveyard.callbacks.push(cell);
    }

    if !source.data.is_blocked() {
        let fds = lock(&source.data.links).fds.clone();
        for watch in &fds {
            remove_poll_locked(ctx, st, watch);
        }
    }

    // Destroying the parent destroys the children.
    loop {
        let child = lock(&source.data.links).children.pop();
        match child {
            None => break,
            Some(child) => {
                *lock(&child.data.parent) = Weak::new();
                destroy_locked(ctx, st, &child, graveyard);
                graveyard.sources.push(child);
            }
        }
    }

    // Detach from the parent, dropping its strong reference to us.
    if let Some(parent) = source.parent() {
        *lock(&source.data.parent) = Weak::new();
        let removed = {
            let mut links = lock(&parent.links);
            links
                .children
                .iter()
                .position(|c| Arc::ptr_eq(&c.data, &source.data))
                .map(|pos| links.children.remove(pos))
        };
        if let Some(removed) = removed {
            graveyard.sources.push(removed);
        }
    }

    let id = source.data.id.swap(0, std::sync::atomic::Ordering::SeqCst);
    if id != 0 {
        bucket_remove(st, &source.data);
        if let Some(table_ref) = st.sources.remove(&id) {
            graveyard.sources.push(table_ref);
        }
    }
    *lock(&source.data.context) = Weak::new();
}

fn set_priority_attached(ctx: &Context, st: &mut ContextState, data: &Arc<SourceData>, prio: i32) {
    // Remove and re-insert so the source lands in the right bucket.
    bucket_remove(st, data);
    data.priority.store(prio, std::sync::atomic::Ordering::SeqCst);
    bucket_insert(st, data);

    if !data.is_blocked() {
        let fds = lock(&data.links).fds.clone();
        for watch in &fds {
            remove_poll_locked(ctx, st, watch);
            add_poll_locked(ctx, st, watch, prio);
        }
    }
    let children = lock(&data.links).children.clone();
    for child in &children {
        set_priority_attached(ctx, st, &child.data, prio);
    }
    drop(children);
}

fn set_priority_detached(data: &Arc<SourceData>, prio: i32) {
    data.priority.store(prio, std::sync::atomic::Ordering::SeqCst);
    let children = lock(&data.links).children.clone();
    for child in &children {
        set_priority_detached(&child.data, prio);
    }
    drop(children);
}

// Structural source operations live here rather than in source.rs: they all
// mutate context state and share its locking discipline.
impl Source {
    /// Attach the source to a context, returning its positive id.
    ///
    /// Attaches children recursively. Safe to call from any thread; a foreign
    /// owner sleeping in poll is woken so the new source is considered on its
    /// next iteration. Returns 0 on misuse (already attached or destroyed).
    pub fn attach(&self, ctx: &Context) -> u32 {
        if self.is_destroyed() {
            log::warn!("cannot attach a destroyed source");
            return 0;
        }
        if self.id() != 0 || self.dup_context().is_some() {
            log::warn!("source is already attached to a context");
            return 0;
        }
        let mut st = ctx.lock_state();
        let id = attach_locked(ctx, &mut st, self, true);
        drop(st);
        id
    }

    /// Remove the source from its context (if any) and mark it destroyed.
    ///
    /// Idempotent; safe from any thread. The source keeps existing while
    /// references remain but will never be dispatched again.
    pub fn destroy(&self) {
        match self.dup_context() {
            Some(ctx) => {
                let mut graveyard = Graveyard::default();
                let mut st = ctx.lock_state();
                destroy_locked(&ctx, &mut st, self, &mut graveyard);
                drop(st);
                drop(graveyard);
            }
            None => {
                self.data.clear_flags(FLAG_ACTIVE);
            }
        }
    }

    /// Change the source's priority; smaller is more urgent.
    ///
    /// Forbidden on children (a child always shares its parent's priority);
    /// recurses into the source's own children. While attached, descriptor
    /// watches are re-registered at the new priority.
    pub fn set_priority(&self, prio: i32) {
        if self.has_parent() {
            log::warn!("cannot change the priority of a child source");
            return;
        }
        match self.dup_context() {
            Some(ctx) => {
                let mut st = ctx.lock_state();
                set_priority_attached(&ctx, &mut st, &self.data, prio);
            }
            None => set_priority_detached(&self.data, prio),
        }
    }

    /// Add a descriptor watch owned by this source.
    ///
    /// While the source is attached and unblocked, the watch participates in
    /// the context's poll at the source's priority. The returned tag
    /// identifies the watch for [`Source::modify_fd_watch`],
    /// [`Source::remove_fd_watch`] and [`Source::query_fd_watch`].
    pub fn add_fd_watch(&self, fd: std::os::unix::io::RawFd, events: EventMask) -> FdWatchTag {
        let watch = Arc::new(FdWatch::new(fd, events));
        if self.is_destroyed() {
            log::warn!("cannot add a descriptor watch to a destroyed source");
            return FdWatchTag::new(watch);
        }
        match self.dup_context() {
            Some(ctx) => {
                let mut st = ctx.lock_state();
                lock(&self.data.links).fds.push(watch.clone());
                if !self.data.is_blocked() {
                    add_poll_locked(&ctx, &mut st, &watch, self.data.priority());
                }
            }
            None => lock(&self.data.links).fds.push(watch.clone()),
        }
        FdWatchTag::new(watch)
    }

    /// Change the requested event mask of a watch. To stop watching, use
    /// [`Source::remove_fd_watch`] instead of an empty mask.
    pub fn modify_fd_watch(&self, tag: &FdWatchTag, events: EventMask) {
        let known = lock(&self.data.links)
            .fds
            .iter()
            .any(|w| Arc::ptr_eq(w, &tag.watch));
        if !known {
            log::warn!("descriptor watch does not belong to this source");
            return;
        }
        tag.watch.set_events(events);
        if let Some(ctx) = self.dup_context() {
            // A poll in flight is watching the old mask.
            ctx.wakeup();
        }
    }

    /// Remove a watch added with [`Source::add_fd_watch`].
    pub fn remove_fd_watch(&self, tag: &FdWatchTag) {
        match self.dup_context() {
            Some(ctx) => {
                let mut st = ctx.lock_state();
                let removed = {
                    let mut links = lock(&self.data.links);
                    links
                        .fds
                        .iter()
                        .position(|w| Arc::ptr_eq(w, &tag.watch))
                        .map(|pos| links.fds.remove(pos))
                };
                match removed {
                    Some(watch) => {
                        if !self.data.is_blocked() {
                            remove_poll_locked(&ctx, &mut st, &watch);
                        }
                    }
                    None => log::warn!("descriptor watch does not belong to this source"),
                }
            }
            None => {
                let mut links = lock(&self.data.links);
                match links.fds.iter().position(|w| Arc::ptr_eq(w, &tag.watch)) {
                    Some(pos) => {
                        links.fds.remove(pos);
                    }
                    None => log::warn!("descriptor watch does not belong to this source"),
                }
            }
        }
    }

    /// Adopt `child` as a child source. The child must be detached and
    /// parentless; it takes this source's priority, attaches wherever this
    /// source is attached, and is destroyed with it.
    pub fn add_child(&self, child: &Source) {
        if self.is_destroyed() || child.is_destroyed() {
            log::warn!("cannot link destroyed sources");
            return;
        }
        if child.id() != 0 || child.dup_context().is_some() {
            log::warn!("a child source must not be attached to a context");
            return;
        }
        if child.has_parent() {
            log::warn!("source already has a parent");
            return;
        }
        match self.dup_context() {
            Some(ctx) => {
                let mut st = ctx.lock_state();
                lock(&self.data.links).children.push(child.clone());
                *lock(&child.data.parent) = Arc::downgrade(&self.data);
                set_priority_detached(&child.data, self.data.priority());
                if self.data.is_blocked() {
                    block_flags_only(&child.data);
                }
                attach_locked(&ctx, &mut st, child, true);
            }
            None => {
                lock(&self.data.links).children.push(child.clone());
                *lock(&child.data.parent) = Arc::downgrade(&self.data);
                set_priority_detached(&child.data, self.data.priority());
                if self.data.is_blocked() {
                    block_flags_only(&child.data);
                }
            }
        }
    }

    /// Detach `child` from this source and destroy it.
    pub fn remove_child(&self, child: &Source) {
        let is_ours = child
            .parent()
            .map_or(false, |p| Arc::ptr_eq(&p, &self.data));
        if !is_ours {
            log::warn!("source is not a child of this source");
            return;
        }
        match self.dup_context() {
            Some(ctx) => {
                let mut graveyard = Graveyard::default();
                let mut st = ctx.lock_state();
                destroy_locked(&ctx, &mut st, child, &mut graveyard);
                drop(st);
                drop(graveyard);
            }
            None => {
                *lock(&child.data.parent) = Weak::new();
                let removed = {
                    let mut links = lock(&self.data.links);
                    links
                        .children
                        .iter()
                        .position(|c| Arc::ptr_eq(&c.data, &child.data))
                        .map(|pos| links.children.remove(pos))
                };
                drop(removed);
                child.destroy();
            }
        }
    }
}
