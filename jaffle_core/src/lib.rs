pub mod batch;
pub mod classfile;
pub mod config;
pub mod coverage;
pub mod instrument;
pub mod runtime;

pub use batch::{Batch, BatchError, BatchStats, SupportUnit, load_support_units};
pub use classfile::{ClassFile, ClassFileError};
pub use config::{ConfigError, JaffleConfig, RuntimeEnv};
pub use coverage::{CoverageError, CoverageMap};
pub use instrument::retry::{UnitOutcome, UnitStatus, instrument_unit};
pub use instrument::{
    EdgeCounter, HookTargets, InstrumentOptions, Instrumenter, RewriteError, Rewritten,
};
pub use runtime::{
    CapabilityFlags, IterationOutcome, LoopControl, Mode, NativePeer, Runtime, RuntimeError,
    StandalonePeer,
};
