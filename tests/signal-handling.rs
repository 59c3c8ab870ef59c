//! Signal and child-process tests.
//!
//! These run without the normal test harness: the harness keeps threads of
//! its own around, and process-wide signal delivery interacts badly with
//! that. On failure the whole binary just panics, which is enough.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mainspring::{
    child_watch_source_new, unix_signal_source_new, Context, ControlFlow, MainLoop, Pid, Signal,
    WaitStatus,
};
use nix::sys::signal::raise;
use nix::unistd::{fork, ForkResult};

/// One SIGUSR1 watch and a batch of SIGUSR2 watches on the same context:
/// raising a signal fires all of its watches and none of the others.
fn signal_test() {
    let ctx = Context::new();

    let usr1_count = Arc::new(AtomicUsize::new(0));
    let usr1 = unix_signal_source_new(Signal::SIGUSR1);
    let c = usr1_count.clone();
    usr1.set_callback(move || {
        c.fetch_add(1, Ordering::SeqCst);
        ControlFlow::Remove
    });
    usr1.attach(&ctx);

    let usr2_count = Arc::new(AtomicUsize::new(0));
    let mut usr2_sources = Vec::new();
    for _ in 0..10 {
        let source = unix_signal_source_new(Signal::SIGUSR2);
        let c = usr2_count.clone();
        source.set_callback(move || {
            c.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Remove
        });
        source.attach(&ctx);
        usr2_sources.push(source);
    }

    raise(Signal::SIGUSR2).unwrap();
    while usr2_count.load(Ordering::SeqCst) < 10 {
        ctx.iteration(true);
    }
    assert_eq!(10, usr2_count.load(Ordering::SeqCst));
    // SIGUSR1 never fired and its watch is still alive.
    assert_eq!(0, usr1_count.load(Ordering::SeqCst));
    assert!(!usr1.is_destroyed());

    raise(Signal::SIGUSR1).unwrap();
    while usr1_count.load(Ordering::SeqCst) < 1 {
        ctx.iteration(true);
    }
    assert_eq!(1, usr1_count.load(Ordering::SeqCst));
    assert_eq!(10, usr2_count.load(Ordering::SeqCst));
}

fn fork_child(exit_code: i32) -> Pid {
    match unsafe { fork() } {
        Ok(ForkResult::Child) => std::process::exit(exit_code),
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => panic!("cannot fork: {}", e),
    }
}

/// Watch a child that exits with a known status.
fn child_test() {
    let ctx = Context::new();
    let ml = MainLoop::new(&ctx, false);
    let pid = fork_child(42);

    let seen = Arc::new(AtomicUsize::new(0));
    let watch = child_watch_source_new(pid);
    let s = seen.clone();
    let ml2 = ml.clone();
    watch.set_child_callback(move |reaped, status| {
        assert_eq!(pid, reaped);
        match status {
            WaitStatus::Exited(_, code) => assert_eq!(42, code),
            other => panic!("unexpected wait status {:?}", other),
        }
        s.fetch_add(1, Ordering::SeqCst);
        ml2.quit();
    });
    watch.attach(&ctx);

    ml.run();
    assert_eq!(1, seen.load(Ordering::SeqCst));
    // Delivered exactly once, then gone.
    assert!(watch.is_destroyed());
}

/// Two children, two watches, both delivered.
fn child_multiple_test() {
    let ctx = Context::new();
    let pid_a = fork_child(3);
    let pid_b = fork_child(4);

    let remaining = Arc::new(AtomicUsize::new(2));
    for (pid, code) in [(pid_a, 3), (pid_b, 4)] {
        let watch = child_watch_source_new(pid);
        let r = remaining.clone();
        watch.set_child_callback(move |reaped, status| {
            assert_eq!(pid, reaped);
            assert_eq!(WaitStatus::Exited(pid, code), status);
            r.fetch_sub(1, Ordering::SeqCst);
        });
        watch.attach(&ctx);
    }

    while remaining.load(Ordering::SeqCst) > 0 {
        ctx.iteration(true);
    }
}

fn main() {
    signal_test();
    child_test();
    child_multiple_test();
    println!("signal-handling: ok");
}
