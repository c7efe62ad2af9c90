use crate::coverage::{DEFAULT_MAP_SIZE_POW2, MAX_MAP_SIZE_POW2};
use crate::instrument::{DEFAULT_DENSITY, HookTargets, InstrumentOptions};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the config file picked up from the working directory when no
/// `-c` option is given.
pub const DEFAULT_CONFIG_FILE: &str = "jaffle.toml";

/// Density overrides, in increasing precedence.
pub const INST_RATIO_VARS: [&str; 2] = ["AFL_INST_RATIO", "JAFFLE_INST_RATIO"];
pub const PERSISTENT_VAR: &str = "JAFFLE_PERSISTENT";
pub const FORKSERVER_VAR: &str = "JAFFLE_FORKSERVER";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{origin} must be between 0 and 100, got {value:?}")]
    InvalidDensity { origin: String, value: String },
    #[error("map-size-pow2 must be between 1 and {MAX_MAP_SIZE_POW2}, got {0}")]
    InvalidMapSize(u32),
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct InstrumentSettings {
    #[serde(default = "default_density")]
    pub density: u8,
    #[serde(default)]
    pub custom_init: bool,
    #[serde(default)]
    pub deterministic: bool,
    #[serde(default = "default_map_size_pow2")]
    pub map_size_pow2: u32,
}

fn default_density() -> u8 {
    DEFAULT_DENSITY
}

fn default_map_size_pow2() -> u32 {
    DEFAULT_MAP_SIZE_POW2
}

impl Default for InstrumentSettings {
    fn default() -> Self {
        Self {
            density: default_density(),
            custom_init: false,
            deterministic: false,
            map_size_pow2: default_map_size_pow2(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct JaffleConfig {
    #[serde(default)]
    pub instrument: InstrumentSettings,
    #[serde(default)]
    pub hooks: HookTargets,
    /// Directory holding the compiled runtime support classes.
    #[serde(default)]
    pub support_dir: Option<PathBuf>,
}

impl JaffleConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: JaffleConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Applies the density overrides found through `lookup`, normally
    /// `std::env::var`. The last variable in [`INST_RATIO_VARS`] wins.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for var in INST_RATIO_VARS {
            if let Some(raw) = lookup(var) {
                self.instrument.density = parse_density(var, &raw)?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instrument.density > 100 {
            return Err(ConfigError::InvalidDensity {
                origin: "density".to_string(),
                value: self.instrument.density.to_string(),
            });
        }
        let pow2 = self.instrument.map_size_pow2;
        if pow2 == 0 || pow2 > MAX_MAP_SIZE_POW2 {
            return Err(ConfigError::InvalidMapSize(pow2));
        }
        Ok(())
    }

    pub fn instrument_options(&self) -> InstrumentOptions {
        InstrumentOptions {
            density: self.instrument.density,
            has_custom_entry: self.instrument.custom_init,
            deterministic: self.instrument.deterministic,
        }
    }
}

fn parse_density(origin: &str, raw: &str) -> Result<u8, ConfigError> {
    let invalid = || ConfigError::InvalidDensity {
        origin: origin.to_string(),
        value: raw.to_string(),
    };
    let value: i64 = raw.trim().parse().map_err(|_| invalid())?;
    if !(0..=100).contains(&value) {
        return Err(invalid());
    }
    Ok(value as u8)
}

/// Environment switches read by the runtime at start-up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeEnv {
    /// Persistent-loop opt-in.
    pub persistent: bool,
    /// Keep fork-server mode even when persistence is requested.
    pub forkserver: bool,
}

impl RuntimeEnv {
    /// A switch is on when its variable is set at all, whatever its value.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            persistent: lookup(PERSISTENT_VAR).is_some(),
            forkserver: lookup(FORKSERVER_VAR).is_some(),
        }
    }

    pub fn from_process_env() -> Self {
        Self::from_lookup(|var| std::env::var_os(var).map(|v| v.to_string_lossy().into_owned()))
    }
}
