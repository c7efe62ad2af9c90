//! Surrogate monitor thread.
//!
//! The driver times out an iteration by killing the surrogate it was given.
//! The monitor notices the death, swaps in a replacement and then pushes the
//! main task out of the abandoned iteration, first through the map sentinel
//! and the cancellation token, and as a last resort with a signal that breaks
//! blocking system calls.

use super::Shared;
use super::peer::{NativePeer, SurrogateHandle};
use log::{debug, error};
use nix::sys::pthread::{Pthread, pthread_kill};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::thread::{self, JoinHandle};

pub(crate) const INTERRUPT_SIGNAL: Signal = Signal::SIGUSR2;

extern "C" fn ignore_interrupt(_: nix::libc::c_int) {}

/// Installs a do-nothing handler for [`INTERRUPT_SIGNAL`]. Without
/// `SA_RESTART` the signal makes blocking calls fail with `EINTR`.
pub(crate) fn install_interrupt_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(ignore_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler is async-signal-safe, it does nothing.
    unsafe { sigaction(INTERRUPT_SIGNAL, &action) }.map(|_| ())
}

pub(crate) fn spawn<P: NativePeer>(
    shared: Arc<Shared<P>>,
    first: SurrogateHandle,
    main_thread: Pthread,
    acks: Receiver<()>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("jaffle-surrogate-monitor".to_string())
        .spawn(move || watch(&shared, first, main_thread, &acks))
}

fn watch<P: NativePeer>(
    shared: &Shared<P>,
    mut handle: SurrogateHandle,
    main_thread: Pthread,
    acks: &Receiver<()>,
) {
    loop {
        let status = match shared.peer.wait_surrogate(handle) {
            Ok(status) => status,
            Err(e) => {
                error!("Lost track of surrogate {handle:?}: {e}");
                shared.peer.force_exit(1);
            }
        };
        debug!("Surrogate {handle:?} died with status {status}");

        {
            let mut state = shared.lock_surrogate();
            state.status = status;
            state.dead = true;
            shared.map.invalidate();
            handle = match shared.peer.spawn_surrogate() {
                Ok(replacement) => replacement,
                Err(e) => {
                    error!("Unable to replace surrogate {handle:?}: {e}");
                    shared.peer.force_exit(1);
                }
            };
            state.handle = Some(handle);
            shared.cancel.store(true, Ordering::Release);
            if let Err(e) = pthread_kill(main_thread, INTERRUPT_SIGNAL) {
                debug!("Interrupting the main task failed: {e}");
            }
        }

        // The main task acknowledges once it has reported the death.
        if acks.recv().is_err() {
            debug!("Runtime dropped, surrogate monitor exits");
            return;
        }
    }
}
