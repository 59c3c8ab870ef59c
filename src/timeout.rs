//! Timer sources.
//!
//! A timer is driven entirely by its ready-time: dispatching does not reset
//! it, the dispatch hook re-arms for `now + interval` when the callback asks
//! to continue. Ticks missed while the loop was busy are not caught up.
//!
//! Whole-second timers deliberately trade precision for grouping: their
//! expirations are snapped to a per-process point within the second, so
//! independent second-granularity timers across the process (and, with a
//! shared session environment, across processes) fire together and batch
//! their wakeups.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::clock;
use crate::context::Context;
use crate::priority;
use crate::source::{ControlFlow, Source, SourceCallback, SourceFuncs};

/// Microsecond offset within the second that whole-second timers aim for.
/// Derived once per process from the session identity in the environment; no
/// session identity means no perturbation.
fn timer_perturb() -> i64 {
    static PERTURB: AtomicI64 = AtomicI64::new(-1);
    let cached = PERTURB.load(Ordering::Relaxed);
    if cached != -1 {
        return cached;
    }
    let seed = std::env::var("DBUS_SESSION_BUS_ADDRESS")
        .ok()
        .or_else(|| std::env::var("HOSTNAME").ok());
    let perturb = match seed {
        Some(seed) => {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            seed.hash(&mut hasher);
            (hasher.finish() % 1_000_000) as i64
        }
        None => 0,
    };
    PERTURB.store(perturb, Ordering::Relaxed);
    perturb
}

fn next_expiration(interval: u32, seconds: bool, now: i64) -> i64 {
    if !seconds {
        return now + interval as i64 * 1_000;
    }
    let perturb = timer_perturb();
    let mut expiration = now + interval as i64 * 1_000_000;

    // Land the microsecond part on the perturbation mark without ever moving
    // the expiration into the past: when rounding down would lose more than a
    // quarter second, round up to the next second instead.
    expiration -= perturb;
    let remainder = expiration % 1_000_000;
    if remainder >= 1_000_000 / 4 {
        expiration += 1_000_000;
    }
    expiration -= remainder;
    expiration += perturb;
    expiration
}

struct TimeoutSource {
    /// Milliseconds, or whole seconds when `seconds` is set.
    interval: u32,
    seconds: bool,
    one_shot: bool,
}

impl SourceFuncs for TimeoutSource {
    // Readiness comes from the ready-time alone; no prepare/check needed.

    fn dispatch(&mut self, source: &Source, callback: Option<&mut SourceCallback>) -> ControlFlow {
        let again = match callback {
            Some(SourceCallback::Unit(f)) => f(),
            Some(_) => {
                log::warn!("timer source dispatched with a mismatched callback type");
                ControlFlow::Remove
            }
            None => {
                log::warn!("timer source dispatched without a callback; set one first");
                ControlFlow::Remove
            }
        };
        if self.one_shot {
            return ControlFlow::Remove;
        }
        if again == ControlFlow::Continue {
            source.set_ready_time(next_expiration(self.interval, self.seconds, source.time()));
        }
        again
    }
}

fn timeout_source(interval: u32, seconds: bool, one_shot: bool) -> Source {
    let source = Source::new(TimeoutSource {
        interval,
        seconds,
        one_shot,
    });
    source.set_name("timeout");
    source.set_ready_time(next_expiration(interval, seconds, clock::monotonic_time()));
    source
}

/// A repeating timer with millisecond granularity.
///
/// Attach it to a context and give it a callback; the callback runs once per
/// elapsed interval for as long as it returns [`ControlFlow::Continue`].
pub fn timeout_source_new(interval_ms: u32) -> Source {
    timeout_source(interval_ms, false, false)
}

/// A repeating timer with whole-second granularity, grouped with other
/// second-granularity timers (see the module docs). The first tick may
/// deviate from the interval by up to a second.
pub fn timeout_source_new_seconds(interval_s: u32) -> Source {
    timeout_source(interval_s, true, false)
}

/// A timer that fires once and destroys itself.
pub fn timeout_source_new_once(interval_ms: u32) -> Source {
    timeout_source(interval_ms, false, true)
}

/// Attach a repeating timer callback to the global-default context.
/// Returns the source id.
pub fn timeout_add<F>(interval_ms: u32, f: F) -> u32
where
    F: FnMut() -> ControlFlow + Send + 'static,
{
    timeout_add_full(priority::DEFAULT, interval_ms, f)
}

/// [`timeout_add`] with an explicit priority.
pub fn timeout_add_full<F>(prio: i32, interval_ms: u32, f: F) -> u32
where
    F: FnMut() -> ControlFlow + Send + 'static,
{
    let source = timeout_source_new(interval_ms);
    if prio != priority::DEFAULT {
        source.set_priority(prio);
    }
    source.set_callback(f);
    source.attach(&Context::default_context())
}

/// Run `f` once on the global-default context after `interval_ms`.
pub fn timeout_add_once<F>(interval_ms: u32, f: F) -> u32
where
    F: FnOnce() + Send + 'static,
{
    let source = timeout_source_new_once(interval_ms);
    let mut f = Some(f);
    source.set_callback(move || {
        if let Some(f) = f.take() {
            f();
        }
        ControlFlow::Remove
    });
    source.attach(&Context::default_context())
}

/// Attach a repeating whole-second timer callback to the global-default
/// context. Returns the source id.
pub fn timeout_add_seconds<F>(interval_s: u32, f: F) -> u32
where
    F: FnMut() -> ControlFlow + Send + 'static,
{
    let source = timeout_source_new_seconds(interval_s);
    source.set_callback(f);
    source.attach(&Context::default_context())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn fires_after_interval_and_rearms() {
        let ctx = Context::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        let source = timeout_source_new(10);
        source.set_callback(move || {
            t.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue
        });
        source.attach(&ctx);

        let start = clock::monotonic_time();
        while ticks.load(Ordering::SeqCst) < 3 {
            ctx.iteration(true);
        }
        let elapsed = clock::monotonic_time() - start;
        assert!(elapsed >= 30_000, "three 10ms ticks took only {}µs", elapsed);
        source.destroy();
    }

    #[test]
    fn callback_return_remove_stops_timer() {
        let ctx = Context::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        let source = timeout_source_new(5);
        source.set_callback(move || {
            t.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Remove
        });
        let id = source.attach(&ctx);
        while !source.is_destroyed() {
            ctx.iteration(true);
        }
        assert_eq!(1, ticks.load(Ordering::SeqCst));
        assert!(ctx.find_source(id).is_none());
    }

    #[test]
    fn one_shot_destroys_itself() {
        let ctx = Context::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        let source = timeout_source_new_once(5);
        // Even a callback asking to continue runs only once.
        source.set_callback(move || {
            t.fetch_add(1, Ordering::SeqCst);
            ControlFlow::Continue
        });
        source.attach(&ctx);
        while !source.is_destroyed() {
            ctx.iteration(true);
        }
        assert_eq!(1, ticks.load(Ordering::SeqCst));
    }

    #[test]
    fn seconds_expirations_share_the_perturbation_phase() {
        let now = clock::monotonic_time();
        let a = next_expiration(1, true, now);
        let b = next_expiration(2, true, now);
        assert_eq!(a % 1_000_000, b % 1_000_000);
        assert!(a > now);
        // Rounding moves the first tick by at most one second.
        assert!(a <= now + 2_000_000);
    }

    #[test]
    fn millisecond_expiration_is_exact() {
        assert_eq!(1_234_000 + 250_000, next_expiration(250, false, 1_234_000));
    }
}
