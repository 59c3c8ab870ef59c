//! Idle sources.
//!
//! An idle source is ready on every iteration; it only runs when nothing
//! more urgent does, purely because its default priority
//! ([`priority::DEFAULT_IDLE`]) sorts after timers and descriptor sources.

use std::time::Duration;

use crate::context::Context;
use crate::priority;
use crate::source::{ControlFlow, Source, SourceCallback, SourceFuncs};

struct IdleSource {
    one_shot: bool,
}

impl SourceFuncs for IdleSource {
    fn prepare(&mut self, _source: &Source) -> (bool, Option<Duration>) {
        (true, Some(Duration::ZERO))
    }

    fn check(&mut self, _source: &Source) -> bool {
        true
    }

    fn dispatch(&mut self, _source: &Source, callback: Option<&mut SourceCallback>) -> ControlFlow {
        let again = match callback {
            Some(SourceCallback::Unit(f)) => f(),
            Some(_) => {
                log::warn!("idle source dispatched with a mismatched callback type");
                ControlFlow::Remove
            }
            None => {
                log::warn!("idle source dispatched without a callback; set one first");
                ControlFlow::Remove
            }
        };
        if self.one_shot {
            ControlFlow::Remove
        } else {
            again
        }
    }
}

fn idle_source(one_shot: bool) -> Source {
    let source = Source::new(IdleSource { one_shot });
    source.set_priority(priority::DEFAULT_IDLE);
    source.set_name("idle");
    source
}

/// A source that runs its callback whenever the loop has nothing more urgent
/// to do, until the callback returns [`ControlFlow::Remove`].
pub fn idle_source_new() -> Source {
    idle_source(false)
}

/// An idle source that runs once and destroys itself.
pub fn idle_source_new_once() -> Source {
    idle_source(true)
}

/// Attach an idle callback to the global-default context. Returns the source
/// id.
pub fn idle_add<F>(f: F) -> u32
where
    F: FnMut() -> ControlFlow + Send + 'static,
{
    idle_add_full(priority::DEFAULT_IDLE, f)
}

/// [`idle_add`] with an explicit priority.
pub fn idle_add_full<F>(prio: i32, f: F) -> u32
where
    F: FnMut() -> ControlFlow + Send + 'static,
{
    let source = idle_source_new();
    if prio != priority::DEFAULT_IDLE {
        source.set_priority(prio);
    }
    source.set_callback(f);
    source.attach(&Context::default_context())
}

/// Run `f` once on the global-default context when it is next idle.
pub fn idle_add_once<F>(f: F) -> u32
where
    F: FnOnce() + Send + 'static,
{
    let source = idle_source_new_once();
    let mut f = Some(f);
    source.set_callback(move || {
        if let Some(f) = f.take() {
            f();
        }
        ControlFlow::Remove
    });
    source.attach(&Context::default_context())
}
