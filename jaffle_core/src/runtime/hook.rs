//! Process-wide capture of panics that escape target code.
//!
//! Panics raised inside an iteration boundary are classified there. Every
//! other panic, typically one on a thread the target spawned, goes through
//! the failure sink registered by the most recently started runtime.

use super::peer::NativePeer;
use super::{Shared, panic_message};
use log::error;
use std::cell::Cell;
use std::panic;
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError};

thread_local! {
    /// Number of iteration boundaries active on the current thread.
    static BOUNDARY_DEPTH: Cell<usize> = const { Cell::new(0) };
}

type FailureSink = Arc<dyn Fn(&str) + Send + Sync>;

static SINK: Mutex<Option<FailureSink>> = Mutex::new(None);
static INSTALL: Once = Once::new();

/// Marks the current thread as running under an iteration boundary while
/// alive.
pub(crate) struct Boundary(());

impl Boundary {
    pub(crate) fn enter() -> Self {
        BOUNDARY_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Boundary(())
    }
}

impl Drop for Boundary {
    fn drop(&mut self) {
        BOUNDARY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

fn inside_boundary() -> bool {
    BOUNDARY_DEPTH.with(Cell::get) > 0
}

fn lock_sink() -> MutexGuard<'static, Option<FailureSink>> {
    SINK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes escaped panics to `shared`. The hook itself is installed once per
/// process and runs after the previously installed one.
pub(crate) fn install<P: NativePeer>(shared: &Arc<Shared<P>>) {
    let weak = Arc::downgrade(shared);
    let sink: FailureSink = Arc::new(move |message: &str| {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let thread = std::thread::current();
        error!(
            "Uncaught failure on thread {}: {message}",
            thread.name().unwrap_or("<unnamed>")
        );
        if let Err(e) = shared.handle_failure(false) {
            error!("Failed to report uncaught failure: {e}");
        }
    });
    *lock_sink() = Some(sink);

    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            previous(info);
            if inside_boundary() {
                return;
            }
            let sink = lock_sink().clone();
            if let Some(sink) = sink {
                sink(&panic_message(info.payload()));
            }
        }));
    });
}
