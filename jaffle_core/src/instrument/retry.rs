//! Retry controller: keeps lowering the entry-record density until a unit
//! fits the class-file limits, so every unit yields some output.

use super::{EdgeCounter, InstrumentOptions, Instrumenter, RewriteError, Rewritten};
use log::{error, info, warn};
use serde::Serialize;

/// Densities tried after a size failure, highest first.
pub const DENSITY_LADDER: [u8; 11] = [80, 65, 50, 35, 25, 15, 10, 5, 2, 1, 0];

/// Any unit needing more attempts than this has broken the ladder invariant.
pub const MAX_ATTEMPTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "status")]
pub enum UnitStatus {
    Instrumented { edges: u64, density: u8 },
    AlreadyInstrumented,
    /// Not a class file; copied unchanged.
    Skipped,
    /// Failed validation; copied unchanged.
    Malformed,
    /// Did not fit even without entry records; copied unchanged.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutcome {
    pub bytes: Vec<u8>,
    /// Internal name of the class, when the unit could be read as one.
    pub class_name: Option<String>,
    pub status: UnitStatus,
}

/// First ladder value strictly below `density`.
pub fn next_density(density: u8) -> Option<u8> {
    DENSITY_LADDER.iter().copied().find(|&step| step < density)
}

/// Instruments `data`, read from `file_name`, stepping down the density
/// ladder on size failures. Only files ending in `.class` are rewritten.
pub fn instrument_unit(
    instrumenter: &Instrumenter,
    file_name: &str,
    data: &[u8],
    options: &InstrumentOptions,
    edges: &EdgeCounter,
) -> UnitOutcome {
    let passthrough = |status| UnitOutcome {
        bytes: data.to_vec(),
        class_name: None,
        status,
    };
    if !file_name.ends_with(".class") {
        return passthrough(UnitStatus::Skipped);
    }
    if data.is_empty() {
        warn!("Empty file: {file_name}");
        return passthrough(UnitStatus::Skipped);
    }

    let mut attempt_options = *options;
    for _ in 0..MAX_ATTEMPTS {
        let snapshot = edges.get();
        match instrumenter.rewrite(data, &attempt_options, edges) {
            Ok(Rewritten::Instrumented {
                bytes,
                class_name,
                edges: count,
            }) => {
                return UnitOutcome {
                    bytes,
                    class_name: Some(class_name),
                    status: UnitStatus::Instrumented {
                        edges: count,
                        density: attempt_options.density,
                    },
                };
            }
            Ok(Rewritten::AlreadyInstrumented { class_name }) => {
                info!("Already instrumented {file_name}");
                return UnitOutcome {
                    bytes: data.to_vec(),
                    class_name,
                    status: UnitStatus::AlreadyInstrumented,
                };
            }
            Ok(Rewritten::NotAClass) => {
                warn!("File {file_name} is not a valid class file");
                return passthrough(UnitStatus::Skipped);
            }
            Err(RewriteError::MalformedInput { fallback, source }) => {
                edges.rollback(snapshot);
                error!("Error while processing {file_name}: {source}");
                return UnitOutcome {
                    bytes: fallback,
                    class_name: None,
                    status: UnitStatus::Malformed,
                };
            }
            Err(err @ RewriteError::SizeLimitExceeded { .. }) => {
                edges.rollback(snapshot);
                let Some(density) = next_density(attempt_options.density) else {
                    error!("Unable to instrument {file_name} at all: {err}");
                    let RewriteError::SizeLimitExceeded { partial, .. } = err else {
                        unreachable!();
                    };
                    return UnitOutcome {
                        bytes: partial,
                        class_name: None,
                        status: UnitStatus::Exhausted,
                    };
                };
                warn!("{err}; instrumenting {file_name} with density {density}");
                attempt_options.density = density;
            }
        }
    }
    panic!("Instrumenting {file_name} took more than {MAX_ATTEMPTS} attempts");
}
