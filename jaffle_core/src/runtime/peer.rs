//! The native side of the fuzzing driver protocol.

use log::debug;
use std::io;

/// What the attached driver offers, as announced at start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityFlags {
    /// A driver reads the coverage map after every iteration.
    pub has_shared_map: bool,
    /// A driver repeatedly asks for new children.
    pub has_forkserver: bool,
}

impl CapabilityFlags {
    pub const SHARED_MAP: u32 = 1 << 0;
    pub const FORKSERVER: u32 = 1 << 1;

    pub fn from_bits(bits: u32) -> Self {
        Self {
            has_shared_map: bits & Self::SHARED_MAP != 0,
            has_forkserver: bits & Self::FORKSERVER != 0,
        }
    }

    pub fn bits(self) -> u32 {
        let mut bits = 0;
        if self.has_shared_map {
            bits |= Self::SHARED_MAP;
        }
        if self.has_forkserver {
            bits |= Self::FORKSERVER;
        }
        bits
    }
}

/// Opaque identifier of a fork surrogate, normally its process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurrogateHandle(pub i64);

/// Operations of the native peer that talks to the fuzzing driver.
///
/// Implementations own the transport (control pipes, shared memory); the
/// [`Runtime`](super::Runtime) only decides when to call what. Every method is
/// called with the runtime's status lock held where ordering matters, so
/// implementations need no locking of their own.
pub trait NativePeer: Send + Sync + 'static {
    /// Announces the target to the driver. `identity` seeds the initial map
    /// contents so that an empty program still produces one tuple.
    fn start(&self, identity: i32);

    /// Valid once [`NativePeer::start`] has returned.
    fn capability_flags(&self) -> CapabilityFlags;

    /// Hands control to the fork server. Returns in every forked child.
    fn enter_forkserver_mode(&self);

    /// Leaves the process immediately, without running exit handlers.
    fn force_exit(&self, status: i32) -> !;

    fn enter_surrogate_mode(&self);

    /// Forks a new surrogate the driver will treat as the current child.
    fn spawn_surrogate(&self) -> io::Result<SurrogateHandle>;

    /// Blocks until `handle` dies and returns its wait status.
    fn wait_surrogate(&self, handle: SurrogateHandle) -> io::Result<i32>;

    fn report_killed(&self, status: i32);

    fn report_ok(&self);

    fn report_uncaught_failure(&self);
}

/// Peer for runs without a driver: no shared map, no fork server.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandalonePeer;

impl NativePeer for StandalonePeer {
    fn start(&self, identity: i32) {
        debug!("No fuzzing driver attached (identity {identity:#010x})");
    }

    fn capability_flags(&self) -> CapabilityFlags {
        CapabilityFlags::default()
    }

    fn enter_forkserver_mode(&self) {}

    fn force_exit(&self, status: i32) -> ! {
        // SAFETY: `_exit` only ends the process; no Rust state is observed
        // afterwards.
        unsafe { nix::libc::_exit(status) }
    }

    fn enter_surrogate_mode(&self) {}

    fn spawn_surrogate(&self) -> io::Result<SurrogateHandle> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "surrogates need a fork server",
        ))
    }

    fn wait_surrogate(&self, _handle: SurrogateHandle) -> io::Result<i32> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "surrogates need a fork server",
        ))
    }

    fn report_killed(&self, _status: i32) {}

    fn report_ok(&self) {}

    fn report_uncaught_failure(&self) {}
}
