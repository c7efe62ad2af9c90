//! Runtime side of the fork-server protocol.
//!
//! A [`Runtime`] picks one of three execution modes at start-up, reports
//! iteration outcomes to the driver through a [`NativePeer`], and in surrogate
//! mode recovers from iterations the driver gave up on. Rewritten units reach
//! it through the start/end hooks; Rust targets call it directly.

mod hook;
mod monitor;
pub mod peer;

pub use peer::{CapabilityFlags, NativePeer, StandalonePeer, SurrogateHandle};

use crate::config::RuntimeEnv;
use crate::coverage::CoverageMap;
use log::{error, info, warn};
use nix::sys::pthread::pthread_self;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Persistent loop needs a positive iteration ceiling")]
    ZeroIterations,
    #[error("Runtime has already terminated")]
    Terminated,
    #[error("Failed to spawn a fork surrogate: {0}")]
    SurrogateSpawn(#[source] std::io::Error),
    #[error("Failed to start the surrogate monitor: {0}")]
    Monitor(#[source] std::io::Error),
    #[error("Failed to install the interrupt handler: {0}")]
    Signal(#[from] nix::errno::Errno),
    #[error("Lost synchronization with the native peer")]
    LostSynchronization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No fork server: the process runs the target once.
    Plain,
    /// Every iteration runs in a freshly forked child.
    ForkServer,
    /// The process loops over iterations while a forked surrogate stands in
    /// for it towards the driver.
    Surrogate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Running(Mode),
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

/// How one run of target code ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    Completed,
    /// The target asked to exit through [`Runtime::exit`].
    Exited(i32),
    /// The iteration was abandoned after its surrogate died.
    Interrupted,
    /// The target panicked.
    Failed(String),
}

impl IterationOutcome {
    fn from_unwind(result: std::thread::Result<()>) -> Self {
        let payload = match result {
            Ok(()) => return Self::Completed,
            Err(payload) => payload,
        };
        if let Some(ExitRequest(status)) = payload.downcast_ref::<ExitRequest>() {
            Self::Exited(*status)
        } else if payload.is::<Interrupted>() {
            Self::Interrupted
        } else {
            Self::Failed(panic_message(&*payload))
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}

/// Unwind payload carrying an exit request out of target code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRequest(pub i32);

/// Unwind payload abandoning an iteration whose surrogate died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

/// Identity announced to the peer: the first four bytes of the MD5 digest of
/// the entry point's name.
pub fn entry_identity(entry_name: &str) -> i32 {
    let digest = md5::compute(entry_name.as_bytes());
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[derive(Debug, Default)]
pub(crate) struct SurrogateState {
    pub(crate) handle: Option<SurrogateHandle>,
    pub(crate) dead: bool,
    pub(crate) status: i32,
    /// A panic on another thread already reported the running iteration.
    pub(crate) settled: bool,
}

/// State reachable from the monitor thread.
pub(crate) struct Shared<P> {
    pub(crate) peer: P,
    pub(crate) map: Arc<CoverageMap>,
    pub(crate) surrogate: Mutex<SurrogateState>,
    pub(crate) cancel: AtomicBool,
    report_results: AtomicBool,
    surrogate_mode: AtomicBool,
    ack: OnceLock<Sender<()>>,
}

impl<P> Shared<P> {
    /// The monitor only exists in surrogate mode, where a poisoned lock is
    /// recoverable.
    pub(crate) fn lock_surrogate(&self) -> MutexGuard<'_, SurrogateState> {
        self.surrogate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<P: NativePeer> Shared<P> {
    fn is_surrogate(&self) -> bool {
        self.surrogate_mode.load(Ordering::Acquire)
    }

    fn reports_results(&self) -> bool {
        self.report_results.load(Ordering::Relaxed)
    }

    fn lock_status(&self) -> Result<MutexGuard<'_, SurrogateState>, RuntimeError> {
        match self.surrogate.lock() {
            Ok(guard) => Ok(guard),
            Err(poisoned) if self.is_surrogate() => Ok(poisoned.into_inner()),
            Err(_) => Err(RuntimeError::LostSynchronization),
        }
    }

    fn settle(&self, report_ok: bool) -> Result<(), RuntimeError> {
        let mut state = self.lock_status()?;
        if self.is_surrogate() && state.dead {
            self.surrogate_died(&mut state);
        } else if state.settled {
            state.settled = false;
        } else if report_ok && self.reports_results() {
            self.peer.report_ok();
        }
        Ok(())
    }

    fn surrogate_died(&self, state: &mut SurrogateState) {
        warn!(
            "Surrogate died with status {}, discarding the iteration",
            state.status
        );
        self.peer.report_killed(state.status);
        self.map.restore();
        self.cancel.store(false, Ordering::Release);
        state.dead = false;
        state.settled = false;
        if let Some(ack) = self.ack.get() {
            if ack.send(()).is_err() {
                error!("Surrogate monitor is gone");
            }
        }
    }

    /// One failure report per iteration. `ends_iteration` is false for
    /// panics escaping on other threads, after which the iteration keeps
    /// running.
    fn handle_failure(&self, ends_iteration: bool) -> Result<(), RuntimeError> {
        let surrogate = self.is_surrogate();
        {
            let mut state = self.lock_status()?;
            if !self.reports_results() {
                self.peer.force_exit(1);
            }
            if surrogate && state.dead {
                self.surrogate_died(&mut state);
            } else if !state.settled {
                self.peer.report_uncaught_failure();
            }
            state.settled = surrogate && !ends_iteration;
        }
        if surrogate {
            Ok(())
        } else {
            self.peer.force_exit(1)
        }
    }
}

#[derive(Debug, Default)]
struct LoopState {
    initialized: bool,
    run_persistent: bool,
    completed: u64,
    finished: bool,
}

type InputReset = Box<dyn FnMut() + Send>;

pub struct Runtime<P: NativePeer = StandalonePeer> {
    shared: Arc<Shared<P>>,
    env: RuntimeEnv,
    custom_init: bool,
    capture_panics: bool,
    phase: Mutex<Phase>,
    can_persist: AtomicBool,
    persistent: Mutex<LoopState>,
    input_reset: Mutex<Option<InputReset>>,
}

impl<P: NativePeer> Runtime<P> {
    pub fn new(peer: P, map: Arc<CoverageMap>, env: RuntimeEnv) -> Self {
        Self {
            shared: Arc::new(Shared {
                peer,
                map,
                surrogate: Mutex::new(SurrogateState::default()),
                cancel: AtomicBool::new(false),
                report_results: AtomicBool::new(false),
                surrogate_mode: AtomicBool::new(false),
                ack: OnceLock::new(),
            }),
            env,
            custom_init: false,
            capture_panics: true,
            phase: Mutex::new(Phase::Uninitialized),
            can_persist: AtomicBool::new(false),
            persistent: Mutex::new(LoopState::default()),
            input_reset: Mutex::new(None),
        }
    }

    /// With a custom entry, [`Runtime::run_main`] leaves start-up to the
    /// target, through [`Runtime::init`] or the persistent loop.
    pub fn with_custom_init(mut self, custom_init: bool) -> Self {
        self.custom_init = custom_init;
        self
    }

    /// Whether [`Runtime::start`] installs the process-wide panic hook that
    /// reports panics escaping on threads outside an iteration boundary.
    /// On by default; embedders managing their own hook turn it off.
    pub fn capture_panics(mut self, enabled: bool) -> Self {
        self.capture_panics = enabled;
        self
    }

    /// Callback discarding buffered input between iterations. Without one,
    /// nothing is reset.
    pub fn set_input_reset<F>(&self, reset: F)
    where
        F: FnMut() + Send + 'static,
    {
        *self
            .input_reset
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(reset));
    }

    pub fn peer(&self) -> &P {
        &self.shared.peer
    }

    pub fn map(&self) -> &Arc<CoverageMap> {
        &self.shared.map
    }

    pub fn phase(&self) -> Phase {
        *self.lock_phase()
    }

    pub fn mode(&self) -> Option<Mode> {
        match self.phase() {
            Phase::Running(mode) => Some(mode),
            _ => None,
        }
    }

    /// The surrogate currently standing in for this process, if any.
    pub fn surrogate(&self) -> Option<SurrogateHandle> {
        self.shared.lock_surrogate().handle
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_loop(&self) -> MutexGuard<'_, LoopState> {
        self.persistent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_surrogate(&self) -> bool {
        self.shared.is_surrogate()
    }

    /// Connects to the peer and selects the execution mode. Later calls
    /// return the mode chosen by the first one.
    pub fn start(&self, entry_name: &str) -> Result<Mode, RuntimeError> {
        let mut phase = self.lock_phase();
        match *phase {
            Phase::Running(mode) => return Ok(mode),
            Phase::Terminated => return Err(RuntimeError::Terminated),
            Phase::Uninitialized => {}
        }

        let peer = &self.shared.peer;
        peer.start(entry_identity(entry_name));
        let flags = peer.capability_flags();
        self.shared
            .report_results
            .store(flags.has_shared_map, Ordering::Relaxed);

        let mode = if !flags.has_forkserver {
            Mode::Plain
        } else {
            let can_persist = self.env.persistent;
            self.can_persist.store(can_persist, Ordering::Relaxed);
            if !can_persist || self.env.forkserver {
                peer.enter_forkserver_mode();
                Mode::ForkServer
            } else {
                self.enter_surrogate_mode()?;
                self.shared.surrogate_mode.store(true, Ordering::Release);
                Mode::Surrogate
            }
        };
        if self.capture_panics {
            hook::install(&self.shared);
        }
        info!("Runtime for {entry_name} running in {mode:?} mode");
        *phase = Phase::Running(mode);
        Ok(mode)
    }

    fn enter_surrogate_mode(&self) -> Result<(), RuntimeError> {
        monitor::install_interrupt_handler()?;
        let peer = &self.shared.peer;
        peer.enter_surrogate_mode();
        let first = peer
            .spawn_surrogate()
            .map_err(RuntimeError::SurrogateSpawn)?;
        self.shared.lock_surrogate().handle = Some(first);

        let (ack, acks) = mpsc::channel();
        if self.shared.ack.set(ack).is_err() {
            return Err(RuntimeError::LostSynchronization);
        }
        monitor::spawn(Arc::clone(&self.shared), first, pthread_self(), acks)
            .map_err(RuntimeError::Monitor)?;
        Ok(())
    }

    /// Start-up for custom entry points, named after the running executable.
    pub fn init(&self) -> Result<Mode, RuntimeError> {
        let entry = std::env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "main".to_string());
        self.start(&entry)
    }

    /// Records an edge ending at `location`. Unwinds with [`Interrupted`]
    /// when the current iteration has been abandoned.
    #[inline]
    pub fn record(&self, location: u32) {
        if self.shared.map.record(location).is_err() {
            panic::resume_unwind(Box::new(Interrupted));
        }
    }

    /// Cancellation point for target code that records no edges for a while.
    pub fn checkpoint(&self) {
        if self.shared.cancel.load(Ordering::Acquire) || !self.shared.map.is_available() {
            panic::resume_unwind(Box::new(Interrupted));
        }
    }

    /// Reports a finished iteration, or the surrogate's death if it died
    /// meanwhile.
    pub fn report(&self) -> Result<(), RuntimeError> {
        self.settle(true)
    }

    fn settle(&self, report_ok: bool) -> Result<(), RuntimeError> {
        self.shared.settle(report_ok)
    }

    /// Reports an uncaught failure of target code that ended the iteration.
    /// Outside surrogate mode the process is then forced to exit with
    /// status 1.
    pub fn handle_failure(&self, message: &str) -> Result<(), RuntimeError> {
        error!("Uncaught failure in target: {message}");
        self.shared.handle_failure(true)
    }

    /// Ends the target run with `status`. In surrogate mode this only unwinds
    /// to the iteration boundary.
    pub fn exit(&self, status: i32) -> ! {
        let mode = self.mode();
        if mode == Some(Mode::Surrogate) {
            panic::resume_unwind(Box::new(ExitRequest(status)));
        }
        if let Err(e) = self.report() {
            error!("Failed to report exit: {e}");
        }
        *self.lock_phase() = Phase::Terminated;
        if mode == Some(Mode::ForkServer) {
            self.shared.peer.force_exit(status);
        }
        std::process::exit(status)
    }

    /// End hook: the entry point returned normally.
    pub fn main_returned(&self) -> Result<(), RuntimeError> {
        match self.mode() {
            None => Ok(()),
            Some(Mode::Surrogate) => {
                warn!("Entry point returned in surrogate mode");
                Ok(())
            }
            Some(mode) => {
                self.report()?;
                *self.lock_phase() = Phase::Terminated;
                if mode == Mode::ForkServer {
                    self.shared.peer.force_exit(0);
                }
                Ok(())
            }
        }
    }

    /// Persistent loop head: `while runtime.persistent_loop()? == Continue`.
    pub fn persistent_loop(&self) -> Result<LoopControl, RuntimeError> {
        self.advance_loop(None)
    }

    /// Like [`Runtime::persistent_loop`], stopping after `iterations`
    /// reported iterations.
    pub fn persistent_loop_bounded(&self, iterations: u64) -> Result<LoopControl, RuntimeError> {
        if iterations == 0 {
            return Err(RuntimeError::ZeroIterations);
        }
        self.advance_loop(Some(iterations))
    }

    fn advance_loop(&self, ceiling: Option<u64>) -> Result<LoopControl, RuntimeError> {
        let mut state = self.lock_loop();
        if state.finished {
            return Ok(LoopControl::Stop);
        }
        if !state.initialized {
            if self.mode().is_none() {
                self.init()?;
            }
            state.initialized = true;
            state.run_persistent = self.can_persist.load(Ordering::Relaxed);
            return Ok(LoopControl::Continue);
        }
        if !state.run_persistent {
            state.finished = true;
            return Ok(LoopControl::Stop);
        }

        self.report()?;
        self.reset_input();
        state.completed += 1;
        if ceiling.is_some_and(|n| state.completed >= n) {
            state.finished = true;
            return Ok(LoopControl::Stop);
        }
        Ok(LoopControl::Continue)
    }

    fn reset_persistent_loop(&self) {
        *self.lock_loop() = LoopState::default();
    }

    /// Whether a persistent loop already reported the iteration that just
    /// completed.
    fn loop_reported_last(&self) -> bool {
        let state = self.lock_loop();
        state.finished && state.run_persistent
    }

    fn reset_input(&self) {
        let mut reset = self
            .input_reset
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(reset) = reset.as_mut() {
            reset();
        }
    }

    /// Runs one iteration of target code and reports its outcome.
    pub fn run_iteration<F: FnOnce()>(&self, target: F) -> Result<IterationOutcome, RuntimeError> {
        let outcome = guarded(target);
        self.dispatch(&outcome)?;
        Ok(outcome)
    }

    fn dispatch(&self, outcome: &IterationOutcome) -> Result<(), RuntimeError> {
        match outcome {
            IterationOutcome::Completed => self.settle(!self.loop_reported_last()),
            IterationOutcome::Exited(_) | IterationOutcome::Interrupted => self.report(),
            IterationOutcome::Failed(message) => self.handle_failure(message),
        }
    }

    /// Runs an entry point the way the start and end hooks would. In
    /// surrogate mode this never returns successfully: every pass of `main`
    /// is one iteration.
    pub fn run_main<F: FnMut()>(&self, entry_name: &str, main: F) -> Result<(), RuntimeError> {
        self.serve(entry_name, main, None)
    }

    fn serve<F: FnMut()>(
        &self,
        entry_name: &str,
        mut main: F,
        limit: Option<u64>,
    ) -> Result<(), RuntimeError> {
        if !self.custom_init {
            self.start(entry_name)?;
        }
        let mut iterations = 0;
        loop {
            if self.is_surrogate() {
                self.run_iteration(&mut main)?;
            } else {
                let outcome = guarded(&mut main);
                if !self.is_surrogate() {
                    return match outcome {
                        IterationOutcome::Failed(message) => self.handle_failure(&message),
                        _ => self.main_returned(),
                    };
                }
                // A custom entry switched to surrogate mode during this pass.
                self.dispatch(&outcome)?;
            }
            self.reset_persistent_loop();
            self.reset_input();
            iterations += 1;
            if limit.is_some_and(|limit| iterations >= limit) {
                return Ok(());
            }
        }
    }
}

/// Runs `target` under an iteration boundary, where panics are classified
/// instead of going to the process-wide hook.
fn guarded<F: FnOnce()>(target: F) -> IterationOutcome {
    let _boundary = hook::Boundary::enter();
    IterationOutcome::from_unwind(panic::catch_unwind(AssertUnwindSafe(target)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coverage::DEFAULT_MAP_SIZE_POW2;
    use std::sync::atomic::{AtomicI64, AtomicUsize};
    use std::sync::mpsc::Receiver;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Start(i32),
        EnterForkserver,
        EnterSurrogate,
        Spawn(i64),
        ReportKilled(i32),
        ReportOk,
        ReportFailure,
    }

    /// Payload standing in for the process exit a real peer performs.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct ForcedExit(i32);

    struct MockPeer {
        flags: CapabilityFlags,
        events: Mutex<Vec<Event>>,
        next_handle: AtomicI64,
        deaths: Mutex<Receiver<i32>>,
    }

    impl MockPeer {
        fn new(flags: CapabilityFlags) -> (Self, Sender<i32>) {
            let (kill, deaths) = mpsc::channel();
            let peer = Self {
                flags,
                events: Mutex::new(Vec::new()),
                next_handle: AtomicI64::new(100),
                deaths: Mutex::new(deaths),
            };
            (peer, kill)
        }

        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn count(&self, wanted: &Event) -> usize {
            self.events().iter().filter(|e| *e == wanted).count()
        }

        fn spawns(&self) -> usize {
            self.events()
                .iter()
                .filter(|e| matches!(e, Event::Spawn(_)))
                .count()
        }
    }

    impl NativePeer for MockPeer {
        fn start(&self, identity: i32) {
            self.push(Event::Start(identity));
        }

        fn capability_flags(&self) -> CapabilityFlags {
            self.flags
        }

        fn enter_forkserver_mode(&self) {
            self.push(Event::EnterForkserver);
        }

        fn force_exit(&self, status: i32) -> ! {
            panic::resume_unwind(Box::new(ForcedExit(status)))
        }

        fn enter_surrogate_mode(&self) {
            self.push(Event::EnterSurrogate);
        }

        fn spawn_surrogate(&self) -> std::io::Result<SurrogateHandle> {
            let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
            self.push(Event::Spawn(handle));
            Ok(SurrogateHandle(handle))
        }

        fn wait_surrogate(&self, _handle: SurrogateHandle) -> std::io::Result<i32> {
            let deaths = self.deaths.lock().unwrap();
            match deaths.recv() {
                Ok(status) => Ok(status),
                // The test is over; nobody will kill this surrogate.
                Err(_) => loop {
                    std::thread::park();
                },
            }
        }

        fn report_killed(&self, status: i32) {
            self.push(Event::ReportKilled(status));
        }

        fn report_ok(&self) {
            self.push(Event::ReportOk);
        }

        fn report_uncaught_failure(&self) {
            self.push(Event::ReportFailure);
        }
    }

    const DRIVER: CapabilityFlags = CapabilityFlags {
        has_shared_map: true,
        has_forkserver: true,
    };

    fn new_runtime(flags: CapabilityFlags, env: RuntimeEnv) -> (Runtime<MockPeer>, Sender<i32>) {
        let (peer, kill) = MockPeer::new(flags);
        let map = Arc::new(CoverageMap::new(DEFAULT_MAP_SIZE_POW2).unwrap());
        let runtime = Runtime::new(peer, map, env).capture_panics(false);
        (runtime, kill)
    }

    fn persistent() -> RuntimeEnv {
        RuntimeEnv {
            persistent: true,
            forkserver: false,
        }
    }

    fn forced_exit<F: FnOnce()>(f: F) -> Option<i32> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => None,
            Err(payload) => payload.downcast_ref::<ForcedExit>().map(|e| e.0),
        }
    }

    fn wait_until<F: Fn() -> bool>(condition: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "Timed out waiting for the monitor");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn identity_is_derived_from_the_entry_name() {
        let digest = md5::compute(b"demo/Main");
        let expected = i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        assert_eq!(entry_identity("demo/Main"), expected);
        assert_ne!(entry_identity("demo/Main"), entry_identity("demo/Other"));

        let (runtime, _kill) = new_runtime(CapabilityFlags::default(), RuntimeEnv::default());
        runtime.start("demo/Main").unwrap();
        assert_eq!(runtime.peer().events(), vec![Event::Start(expected)]);
    }

    #[test]
    fn mode_follows_capabilities_and_switches() {
        let cases = [
            (CapabilityFlags::default(), persistent(), Mode::Plain),
            (DRIVER, RuntimeEnv::default(), Mode::ForkServer),
            (
                DRIVER,
                RuntimeEnv {
                    persistent: true,
                    forkserver: true,
                },
                Mode::ForkServer,
            ),
            (DRIVER, persistent(), Mode::Surrogate),
        ];
        for (flags, env, expected) in cases {
            let (runtime, _kill) = new_runtime(flags, env);
            assert_eq!(runtime.phase(), Phase::Uninitialized);
            assert_eq!(runtime.start("Main").unwrap(), expected, "{flags:?} {env:?}");
            assert_eq!(runtime.phase(), Phase::Running(expected));
            assert_eq!(
                runtime.start("Main").unwrap(),
                expected,
                "Second start keeps the mode"
            );
            assert_eq!(runtime.peer().count(&Event::Start(entry_identity("Main"))), 1);
        }
    }

    #[test]
    fn plain_runs_are_not_persistent() {
        let (runtime, _kill) = new_runtime(CapabilityFlags::default(), persistent());
        assert_eq!(runtime.persistent_loop().unwrap(), LoopControl::Continue);
        assert_eq!(runtime.mode(), Some(Mode::Plain), "First loop call starts up");
        runtime.record(10);
        assert_eq!(runtime.map().get(10), Some(1));
        assert_eq!(runtime.persistent_loop().unwrap(), LoopControl::Stop);
        assert_eq!(runtime.persistent_loop().unwrap(), LoopControl::Stop);
        assert_eq!(runtime.peer().count(&Event::ReportOk), 0);
    }

    #[test]
    fn bounded_loop_reports_every_iteration() {
        let env = RuntimeEnv {
            persistent: true,
            forkserver: true,
        };
        let (runtime, _kill) = new_runtime(DRIVER, env);
        let resets = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&resets);
        runtime.set_input_reset(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut controls = Vec::new();
        loop {
            let control = runtime.persistent_loop_bounded(3).unwrap();
            controls.push(control);
            if control == LoopControl::Stop {
                break;
            }
        }
        use LoopControl::{Continue, Stop};
        assert_eq!(controls, vec![Continue, Continue, Continue, Stop]);
        assert_eq!(runtime.peer().count(&Event::ReportOk), 3);
        assert_eq!(resets.load(Ordering::SeqCst), 3);
        assert_eq!(runtime.persistent_loop_bounded(3).unwrap(), Stop);
        assert_eq!(runtime.peer().count(&Event::ReportOk), 3);
        assert!(matches!(
            runtime.persistent_loop_bounded(0),
            Err(RuntimeError::ZeroIterations)
        ));
    }

    #[test]
    fn forkserver_children_exit_through_the_peer() {
        let (runtime, _kill) = new_runtime(DRIVER, RuntimeEnv::default());
        runtime.start("Main").unwrap();
        assert_eq!(forced_exit(|| runtime.exit(3)), Some(3));
        assert_eq!(runtime.peer().count(&Event::ReportOk), 1);
        assert_eq!(runtime.phase(), Phase::Terminated);

        let (runtime, _kill) = new_runtime(DRIVER, RuntimeEnv::default());
        runtime.start("Main").unwrap();
        assert_eq!(
            forced_exit(|| {
                let _ = runtime.main_returned();
            }),
            Some(0)
        );
        assert_eq!(
            runtime.peer().events(),
            vec![
                Event::Start(entry_identity("Main")),
                Event::EnterForkserver,
                Event::ReportOk
            ]
        );
        assert!(matches!(runtime.start("Main"), Err(RuntimeError::Terminated)));
    }

    #[test]
    fn failures_outside_surrogate_mode_exit_with_one() {
        let (runtime, _kill) = new_runtime(DRIVER, RuntimeEnv::default());
        runtime.start("Main").unwrap();
        assert_eq!(
            forced_exit(|| {
                let _ = runtime.handle_failure("boom");
            }),
            Some(1)
        );
        assert_eq!(runtime.peer().count(&Event::ReportFailure), 1);

        let no_map = CapabilityFlags {
            has_shared_map: false,
            has_forkserver: true,
        };
        let (runtime, _kill) = new_runtime(no_map, RuntimeEnv::default());
        runtime.start("Main").unwrap();
        assert_eq!(
            forced_exit(|| {
                let _ = runtime.handle_failure("boom");
            }),
            Some(1)
        );
        assert_eq!(
            runtime.peer().count(&Event::ReportFailure),
            0,
            "Nobody listens for results"
        );
    }

    #[test]
    fn plain_main_reports_nothing_without_a_driver() {
        let (runtime, _kill) = new_runtime(CapabilityFlags::default(), RuntimeEnv::default());
        let mut runs = 0;
        runtime.run_main("Main", || runs += 1).unwrap();
        assert_eq!(runs, 1);
        assert_eq!(runtime.phase(), Phase::Terminated);
        assert_eq!(runtime.peer().events(), vec![Event::Start(entry_identity("Main"))]);

        let (runtime, _kill) = new_runtime(DRIVER, persistent());
        let runtime = runtime.with_custom_init(true);
        runtime.run_main("Main", || {}).unwrap();
        assert_eq!(runtime.phase(), Phase::Uninitialized, "Custom entry never started");
        assert!(runtime.peer().events().is_empty());
    }

    #[test]
    fn surrogate_iterations_report_their_outcome() {
        let (runtime, _kill) = new_runtime(DRIVER, persistent());
        assert_eq!(runtime.start("Main").unwrap(), Mode::Surrogate);
        assert_eq!(runtime.peer().spawns(), 1);

        let outcome = runtime.run_iteration(|| runtime.record(7)).unwrap();
        assert_eq!(outcome, IterationOutcome::Completed);
        let outcome = runtime.run_iteration(|| runtime.exit(4)).unwrap();
        assert_eq!(outcome, IterationOutcome::Exited(4));
        assert_eq!(runtime.peer().count(&Event::ReportOk), 2);

        let outcome = runtime.run_iteration(|| panic!("target bug")).unwrap();
        assert_eq!(outcome, IterationOutcome::Failed("target bug".to_string()));
        assert_eq!(runtime.peer().count(&Event::ReportFailure), 1);
        assert_eq!(runtime.mode(), Some(Mode::Surrogate), "Failures do not end the loop");
    }

    #[test]
    fn surrogate_death_interrupts_the_iteration() {
        let (runtime, kill) = new_runtime(DRIVER, persistent());
        runtime.start("Main").unwrap();

        kill.send(9).unwrap();
        let outcome = runtime
            .run_iteration(|| {
                loop {
                    runtime.checkpoint();
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        assert_eq!(outcome, IterationOutcome::Interrupted);
        assert_eq!(runtime.peer().count(&Event::ReportKilled(9)), 1);
        assert_eq!(runtime.peer().count(&Event::ReportOk), 0);
        assert_eq!(runtime.peer().spawns(), 2, "Exactly one replacement");
        assert_eq!(runtime.surrogate(), Some(SurrogateHandle(101)));
        assert!(runtime.map().is_available());

        let outcome = runtime.run_iteration(|| runtime.record(1)).unwrap();
        assert_eq!(outcome, IterationOutcome::Completed);
        assert_eq!(runtime.peer().count(&Event::ReportOk), 1);
        assert_eq!(runtime.peer().count(&Event::ReportKilled(9)), 1);
    }

    #[test]
    fn late_deaths_replace_the_ok_report() {
        let (runtime, kill) = new_runtime(DRIVER, persistent());
        runtime.start("Main").unwrap();

        kill.send(15).unwrap();
        wait_until(|| !runtime.map().is_available());
        let outcome = runtime.run_iteration(|| {}).unwrap();
        assert_eq!(outcome, IterationOutcome::Completed);
        assert_eq!(runtime.peer().count(&Event::ReportKilled(15)), 1);
        assert_eq!(runtime.peer().count(&Event::ReportOk), 0);
        assert!(runtime.map().is_available());

        kill.send(6).unwrap();
        wait_until(|| !runtime.map().is_available());
        let outcome = runtime.run_iteration(|| runtime.record(3)).unwrap();
        assert_eq!(outcome, IterationOutcome::Interrupted);
        assert_eq!(runtime.peer().count(&Event::ReportKilled(6)), 1);
        assert_eq!(runtime.peer().spawns(), 3);
    }

    #[test]
    fn failures_after_a_death_report_the_death() {
        let (runtime, kill) = new_runtime(DRIVER, persistent());
        runtime.start("Main").unwrap();

        kill.send(9).unwrap();
        wait_until(|| !runtime.map().is_available());
        let outcome = runtime.run_iteration(|| panic!("late")).unwrap();
        assert_eq!(outcome, IterationOutcome::Failed("late".to_string()));
        assert_eq!(runtime.peer().count(&Event::ReportKilled(9)), 1);
        assert_eq!(runtime.peer().count(&Event::ReportFailure), 0);
        assert_eq!(runtime.peer().spawns(), 2);
        assert!(runtime.map().is_available());
        assert_eq!(runtime.mode(), Some(Mode::Surrogate));
    }

    #[test]
    fn panics_on_target_threads_are_reported_once() {
        let (runtime, _kill) = new_runtime(DRIVER, persistent());
        let runtime = runtime.capture_panics(true);
        runtime.start("Main").unwrap();

        let outcome = runtime
            .run_iteration(|| {
                let worker = std::thread::spawn(|| panic!("escaped"));
                assert!(worker.join().is_err());
                runtime.record(5);
            })
            .unwrap();
        assert_eq!(outcome, IterationOutcome::Completed);
        assert_eq!(runtime.peer().count(&Event::ReportFailure), 1);
        assert_eq!(
            runtime.peer().count(&Event::ReportOk),
            0,
            "The failure settled the iteration"
        );

        let outcome = runtime.run_iteration(|| runtime.record(6)).unwrap();
        assert_eq!(outcome, IterationOutcome::Completed);
        assert_eq!(runtime.peer().count(&Event::ReportOk), 1);

        let outcome = runtime.run_iteration(|| panic!("on the main task")).unwrap();
        assert!(matches!(outcome, IterationOutcome::Failed(_)));
        assert_eq!(
            runtime.peer().count(&Event::ReportFailure),
            2,
            "Boundary panics bypass the hook"
        );

        let outcome = runtime
            .run_iteration(|| {
                let _ = std::thread::spawn(|| panic!("escaped first")).join();
                panic!("then failed");
            })
            .unwrap();
        assert!(matches!(outcome, IterationOutcome::Failed(_)));
        assert_eq!(runtime.peer().count(&Event::ReportFailure), 3);
        assert_eq!(runtime.peer().count(&Event::ReportOk), 1);
    }

    #[test]
    fn surrogate_main_loops_and_resets_between_passes() {
        let (runtime, _kill) = new_runtime(DRIVER, persistent());
        let resets = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&resets);
        runtime.set_input_reset(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut passes = 0;
        runtime
            .serve(
                "Main",
                || {
                    passes += 1;
                    // A two-round persistent loop inside every pass.
                    while runtime.persistent_loop_bounded(2).unwrap() == LoopControl::Continue {
                        runtime.record(passes);
                    }
                },
                Some(3),
            )
            .unwrap();
        assert_eq!(passes, 3);
        assert_eq!(
            runtime.peer().count(&Event::ReportOk),
            6,
            "Two loop reports per pass and no extra report on return"
        );
        assert_eq!(resets.load(Ordering::SeqCst), 3 * 2 + 3);
    }
}
