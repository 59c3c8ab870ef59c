//! Scenario tests for the context/source/loop machinery: priority ordering,
//! timer behavior, id allocation, descriptor fairness, cross-thread handoff.
//! Signal and child-process handling lives in `signal-handling.rs`, which
//! runs without the threaded harness.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mainspring::{
    idle_source_new, priority, timeout_source_new, Context, ContextFlags, ControlFlow, EventMask,
    MainLoop, PollFd, Source, SourceCallback, SourceFuncs,
};

/// A source with no readiness of its own: it fires purely through its
/// ready-time, and its dispatch just runs the plain callback.
struct Manual;

impl SourceFuncs for Manual {
    fn dispatch(&mut self, _source: &Source, callback: Option<&mut SourceCallback>) -> ControlFlow {
        match callback {
            Some(SourceCallback::Unit(f)) => f(),
            _ => ControlFlow::Remove,
        }
    }
}

fn counting_idle(ctx: &Context, prio: i32, counter: &Arc<AtomicUsize>) -> Source {
    let source = idle_source_new();
    source.set_priority(prio);
    let counter = counter.clone();
    source.set_callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        ControlFlow::Continue
    });
    source.attach(ctx);
    source
}

/// Two idle sources at priorities 1 and 0: only the more urgent one runs
/// until it goes away.
#[test]
fn priority_ordering() {
    let _ = env_logger::try_init();
    let ctx = Context::new();
    let count_a = Arc::new(AtomicUsize::new(0));
    let count_b = Arc::new(AtomicUsize::new(0));
    let _a = counting_idle(&ctx, 1, &count_a);
    let b = counting_idle(&ctx, 0, &count_b);

    assert!(ctx.iteration(false));
    assert_eq!((0, 1), (count_a.load(Ordering::SeqCst), count_b.load(Ordering::SeqCst)));
    assert!(ctx.iteration(false));
    assert_eq!((0, 2), (count_a.load(Ordering::SeqCst), count_b.load(Ordering::SeqCst)));

    b.destroy();
    assert!(ctx.iteration(false));
    assert_eq!((1, 2), (count_a.load(Ordering::SeqCst), count_b.load(Ordering::SeqCst)));
}

/// Three timers plus a quit-timer; faster timers tick at least as often as
/// slower ones and nobody overshoots its budget.
#[test]
fn timer_grouping() {
    let ctx = Context::new();
    let ml = MainLoop::new(&ctx, false);

    let mut counters = Vec::new();
    for interval in [100u32, 250, 330] {
        let count = Arc::new(AtomicUsize::new(0));
        let timer = timeout_source_new(interval);
        let c = count.clone();
        timer.set_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue
        });
        timer.attach(&ctx);
        counters.push(count);
    }

    let quit = timeout_source_new(1_050);
    let ml2 = ml.clone();
    quit.set_callback(move || {
        ml2.quit();
        ControlFlow::Remove
    });
    quit.attach(&ctx);

    ml.run();

    let count_100 = counters[0].load(Ordering::SeqCst);
    let count_250 = counters[1].load(Ordering::SeqCst);
    let count_330 = counters[2].load(Ordering::SeqCst);
    assert!(count_100 >= count_250, "{} < {}", count_100, count_250);
    assert!(count_250 >= count_330, "{} < {}", count_250, count_330);
    assert!(count_100 <= 10, "100ms timer fired {} times", count_100);
    assert!(count_250 <= 4, "250ms timer fired {} times", count_250);
    assert!(count_330 <= 3, "330ms timer fired {} times", count_330);
}

/// The id allocator wraps without ever reusing a live id or handing out 0.
#[test]
fn id_saturation() {
    let ctx = Context::with_next_id(u32::MAX - 1);

    let attach_one = |ctx: &Context| {
        let source = Source::new(Manual);
        let id = source.attach(ctx);
        (source, id)
    };

    let (_s1, id1) = attach_one(&ctx);
    let (_s2, id2) = attach_one(&ctx);
    let (_s3, id3) = attach_one(&ctx);
    assert_eq!(u32::MAX - 1, id1);
    assert_eq!(u32::MAX, id2);
    assert!(id3 > 0);

    let mut seen = vec![id1, id2, id3];
    let mut keep = Vec::new();
    for _ in 0..50 {
        let (source, id) = attach_one(&ctx);
        assert!(id > 0);
        assert!(!seen.contains(&id), "id {} allocated twice", id);
        seen.push(id);
        keep.push(source);
    }
}

/// A writer at high priority and a reader at default priority on one pipe:
/// never both in one iteration, neither starved, all bytes arrive.
#[test]
fn descriptor_priority_fairness() {
    const TOTAL: usize = 128 * 1024 * 1024;
    const CHUNK: usize = 64 * 1024;

    let mut fds = [0 as libc::c_int; 2];
    assert_eq!(0, unsafe { libc::pipe(fds.as_mut_ptr()) });
    let (read_fd, write_fd) = (fds[0], fds[1]);
    for fd in [read_fd, write_fd] {
        unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
    }

    let ctx = Context::new();
    let written = Arc::new(AtomicUsize::new(0));
    let read = Arc::new(AtomicUsize::new(0));
    let writer_ran = Arc::new(AtomicBool::new(false));
    let reader_ran = Arc::new(AtomicBool::new(false));

    let writer = mainspring::unix_fd_source_new(write_fd, EventMask::WRITABLE);
    writer.set_priority(priority::HIGH);
    {
        let written = written.clone();
        let writer_ran = writer_ran.clone();
        writer.set_fd_callback(move |fd: RawFd, _revents| {
            writer_ran.store(true, Ordering::SeqCst);
            let buf = [0x5au8; CHUNK];
            loop {
                let done = written.load(Ordering::SeqCst);
                if done >= TOTAL {
                    return ControlFlow::Remove;
                }
                let want = CHUNK.min(TOTAL - done);
                let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, want) };
                if n < 0 {
                    // Pipe full; wait for the reader to drain it.
                    return ControlFlow::Continue;
                }
                written.fetch_add(n as usize, Ordering::SeqCst);
            }
        });
    }
    writer.attach(&ctx);

    let reader = mainspring::unix_fd_source_new(read_fd, EventMask::READABLE);
    {
        let read = read.clone();
        let reader_ran = reader_ran.clone();
        reader.set_fd_callback(move |fd: RawFd, _revents| {
            reader_ran.store(true, Ordering::SeqCst);
            let mut buf = [0u8; CHUNK];
            loop {
                let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                if n <= 0 {
                    return ControlFlow::Continue;
                }
                if read.fetch_add(n as usize, Ordering::SeqCst) + n as usize >= TOTAL {
                    return ControlFlow::Remove;
                }
            }
        });
    }
    reader.attach(&ctx);

    while !(writer.is_destroyed() && reader.is_destroyed()) {
        writer_ran.store(false, Ordering::SeqCst);
        reader_ran.store(false, Ordering::SeqCst);
        ctx.iteration(true);
        // Strict priority: the two sources never share an iteration.
        assert!(
            !(writer_ran.load(Ordering::SeqCst) && reader_ran.load(Ordering::SeqCst)),
            "writer and reader dispatched in the same iteration"
        );
    }

    assert_eq!(TOTAL, written.load(Ordering::SeqCst));
    assert_eq!(TOTAL, read.load(Ordering::SeqCst));

    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
}

/// With ownerless polling, attaching from anywhere signals the wakeup, so a
/// poller that never acquired the context returns promptly.
#[test]
fn ownerless_polling_wakes_unowned_poll() {
    let ctx = Context::with_flags(ContextFlags::OWNERLESS_POLLING);

    let (_, max_priority) = ctx.prepare();
    let mut fds = vec![PollFd::new(-1, EventMask::NONE); 4];
    let (n, timeout_ms) = ctx.query(max_priority, &mut fds);
    assert!(n <= fds.len());
    // Nothing scheduled: the poll would block forever.
    assert_eq!(-1, timeout_ms);

    let fired = Arc::new(AtomicUsize::new(0));
    let ctx2 = ctx.clone();
    let f = fired.clone();
    let attacher = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        let idle = idle_source_new();
        idle.set_callback(move || {
            f.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Remove
        });
        idle.attach(&ctx2);
    });

    let start = std::time::Instant::now();
    let polled = mainspring::default_poll(&mut fds[..n], timeout_ms).unwrap();
    assert!(polled > 0, "poll returned without the wakeup firing");
    assert!(
        start.elapsed() < Duration::from_secs(5),
        "attach did not interrupt the poll"
    );
    attacher.join().unwrap();

    // The restarted pipeline picks the new source up.
    while fired.load(Ordering::SeqCst) == 0 {
        ctx.iteration(true);
    }
    assert_eq!(1, fired.load(Ordering::SeqCst));
}

/// `invoke` from a foreign thread runs the function exactly once on the
/// thread that owns and iterates the context.
#[test]
fn cross_thread_invoke() {
    let ctx = Context::new();
    let ml = MainLoop::new(&ctx, false);

    let runner_thread = Arc::new(Mutex::new(None));
    let calls = Arc::new(AtomicUsize::new(0));

    let ml2 = ml.clone();
    let ctx2 = ctx.clone();
    let slot = runner_thread.clone();
    let runner = std::thread::spawn(move || {
        *slot.lock().unwrap() = Some(std::thread::current().id());
        let ml3 = ml2.clone();
        // Let the main thread know we are up via an idle handshake.
        let ready = idle_source_new();
        ready.set_callback(move || ControlFlow::Remove);
        ready.attach(&ctx2);
        ml3.run();
    });

    // Wait for the runner to own the context.
    while !{
        let t = runner_thread.lock().unwrap();
        t.is_some()
    } {
        std::thread::yield_now();
    }

    let calls2 = calls.clone();
    let ml4 = ml.clone();
    let expected_thread = runner_thread.clone();
    ctx.invoke(move || {
        assert_eq!(
            Some(std::thread::current().id()),
            *expected_thread.lock().unwrap(),
            "invoke ran on the wrong thread"
        );
        calls2.fetch_add(1, Ordering::SeqCst);
        ml4.quit();
        ControlFlow::Remove
    });

    runner.join().unwrap();
    assert_eq!(1, calls.load(Ordering::SeqCst));
}

/// Invoking while owning the context calls the function directly.
#[test]
fn invoke_direct_when_owner() {
    let ctx = Context::new();
    assert!(ctx.acquire());
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    ctx.invoke(move || {
        c.fetch_add(1, Ordering::SeqCst);
        ControlFlow::Remove
    });
    assert_eq!(1, calls.load(Ordering::SeqCst));
    ctx.release();
}

/// A synchronously invoked function is repeated until it stops asking to
/// continue, both when the caller already owns the context and when the
/// context is the thread default and gets acquired for the call.
#[test]
fn invoke_repeats_while_continue() {
    let ctx = Context::new();

    // Direct call: the caller owns the context.
    assert!(ctx.acquire());
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    ctx.invoke(move || {
        if c.fetch_add(1, Ordering::SeqCst) < 4 {
            ControlFlow::Continue
        } else {
            ControlFlow::Remove
        }
    });
    assert_eq!(5, calls.load(Ordering::SeqCst));
    ctx.release();

    // Synchronous acquire: the context is the thread default but unowned.
    ctx.push_thread_default();
    // The thread-default push acquired it; release so invoke_full has to
    // take ownership for the duration of the call itself.
    ctx.release();
    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    ctx.invoke_full(priority::DEFAULT, move || {
        if c.fetch_add(1, Ordering::SeqCst) < 2 {
            ControlFlow::Continue
        } else {
            ControlFlow::Remove
        }
    });
    assert_eq!(3, calls.load(Ordering::SeqCst));
    assert!(!ctx.is_owner());
    // Restore the ownership level pop_thread_default expects to hand back.
    assert!(ctx.acquire());
    ctx.pop_thread_default();
}

/// A zero ready-time dispatches within the current iteration; `-1` never
/// does by itself.
#[test]
fn ready_time_boundaries() {
    let ctx = Context::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let source = Source::new(Manual);
    let f = fired.clone();
    source.set_callback(move || {
        f.fetch_add(1, Ordering::SeqCst);
        ControlFlow::Continue
    });
    source.attach(&ctx);

    // Never ready on its own.
    assert_eq!(-1, source.ready_time());
    assert!(!ctx.iteration(false));
    assert_eq!(0, fired.load(Ordering::SeqCst));

    source.set_ready_time(0);
    assert!(ctx.iteration(false));
    assert_eq!(1, fired.load(Ordering::SeqCst));

    // Dispatch does not reset the ready-time; zero stays immediate.
    assert_eq!(0, source.ready_time());
    assert!(ctx.iteration(false));
    assert_eq!(2, fired.load(Ordering::SeqCst));

    source.set_ready_time(-1);
    assert!(!ctx.iteration(false));
    assert_eq!(2, fired.load(Ordering::SeqCst));
}

/// Setter/getter round-trips across the whole value range.
#[test]
fn priority_and_ready_time_roundtrip() {
    let ctx = Context::new();
    let source = Source::new(Manual);
    source.attach(&ctx);
    for prio in [i32::MIN, -1, 0, 1, priority::LOW, i32::MAX] {
        source.set_priority(prio);
        assert_eq!(prio, source.priority());
    }
    for t in [-1i64, 0, 1, i64::MAX] {
        source.set_ready_time(t);
        assert_eq!(t, source.ready_time());
    }
}

/// `attach` + `destroy` + drop leaves the context membership unchanged.
#[test]
fn attach_destroy_unref_roundtrip() {
    let ctx = Context::new();
    let before = ctx.source_count();
    let source = Source::new(Manual);
    let id = source.attach(&ctx);
    assert_eq!(before + 1, ctx.source_count());
    assert!(ctx.find_source(id).unwrap() == source);
    source.destroy();
    drop(source);
    assert_eq!(before, ctx.source_count());
    assert!(ctx.find_source(id).is_none());
}

/// `pending` reports readiness without dispatching.
#[test]
fn pending_does_not_dispatch() {
    let ctx = Context::new();
    let count = Arc::new(AtomicUsize::new(0));
    let _idle = counting_idle(&ctx, priority::DEFAULT_IDLE, &count);
    assert!(ctx.pending());
    assert!(ctx.pending());
    assert_eq!(0, count.load(Ordering::SeqCst));
    assert!(ctx.iteration(false));
    assert_eq!(1, count.load(Ordering::SeqCst));
}

/// The dispatch record tracks depth and the current source.
#[test]
fn dispatch_record_depth_and_source() {
    let ctx = Context::new();
    assert_eq!(0, mainspring::main_depth());
    assert!(mainspring::current_source().is_none());

    let seen = Arc::new(Mutex::new(None));
    let source = idle_source_new();
    let s = seen.clone();
    source.set_callback(move || {
        *s.lock().unwrap() = Some((mainspring::main_depth(), mainspring::current_source()));
        ControlFlow::Remove
    });
    source.attach(&ctx);
    assert!(ctx.iteration(false));

    let (depth, current) = seen.lock().unwrap().take().unwrap();
    assert_eq!(1, depth);
    assert!(current.unwrap() == source);
    assert_eq!(0, mainspring::main_depth());
}

/// A substituted poll primitive is actually the one consulted.
#[test]
fn injected_poll_fn_is_used() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counting_poll(fds: &mut [PollFd], timeout_ms: i32) -> std::io::Result<usize> {
        CALLS.fetch_add(1, Ordering::SeqCst);
        mainspring::default_poll(fds, timeout_ms)
    }

    let ctx = Context::new();
    ctx.set_poll_fn(counting_poll);
    let idle = idle_source_new();
    idle.set_callback(|| ControlFlow::Remove);
    idle.attach(&ctx);
    let before = CALLS.load(Ordering::SeqCst);
    ctx.iteration(false);
    assert!(CALLS.load(Ordering::SeqCst) > before);
}

/// A callback may re-enter the loop; the dispatching source itself is
/// blocked from recursing unless it opts in.
#[test]
fn recursive_iteration_from_callback() {
    let ctx = Context::new();
    let inner_ran = Arc::new(AtomicUsize::new(0));
    let outer_ran = Arc::new(AtomicUsize::new(0));

    let inner = idle_source_new();
    // Less urgent than the outer source so it only runs in the nested
    // iteration.
    inner.set_priority(priority::LOW);
    let i = inner_ran.clone();
    inner.set_callback(move || {
        i.fetch_add(1, Ordering::SeqCst);
        ControlFlow::Remove
    });
    inner.attach(&ctx);

    let outer = idle_source_new();
    outer.set_priority(priority::HIGH);
    let o = outer_ran.clone();
    let ctx2 = ctx.clone();
    outer.set_callback(move || {
        o.fetch_add(1, Ordering::SeqCst);
        // The nested iteration must not redispatch the outer source, which
        // is blocked while inside its own dispatch.
        while ctx2.iteration(false) {}
        ControlFlow::Remove
    });
    outer.attach(&ctx);

    assert!(ctx.iteration(false));
    assert_eq!(1, outer_ran.load(Ordering::SeqCst));
    assert_eq!(1, inner_ran.load(Ordering::SeqCst));
}

/// Sources attached before a loop runs in another thread are seen by its
/// first iteration.
#[test]
fn attach_before_run_is_not_lost() {
    let ctx = Context::new();
    let ml = MainLoop::new(&ctx, false);
    let fired = Arc::new(AtomicUsize::new(0));

    let f = fired.clone();
    let ml2 = ml.clone();
    let source = timeout_source_new(1);
    source.set_callback(move || {
        f.fetch_add(1, Ordering::SeqCst);
        ml2.quit();
        ControlFlow::Remove
    });
    source.attach(&ctx);

    let runner = std::thread::spawn(move || ml.run());
    runner.join().unwrap();
    assert_eq!(1, fired.load(Ordering::SeqCst));
}
