use jaffle_core::batch::{Batch, BatchStats, load_support_units};
use jaffle_core::config::{ConfigError, DEFAULT_CONFIG_FILE, JaffleConfig};
use jaffle_core::instrument::Instrumenter;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Instruments JVM class files and jar archives for AFL edge coverage",
    long_about = None
)]
struct Cli {
    /// Leave runtime start-up to the program instead of its main method.
    #[clap(long)]
    custom_init: bool,
    /// Derive location ids from the input bytes for reproducible output.
    #[clap(long)]
    deterministic: bool,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Directory of compiled runtime support classes to bundle.
    #[clap(long, value_parser)]
    support_dir: Option<PathBuf>,
    /// Print the summary as JSON.
    #[clap(long)]
    json: bool,
    #[clap(value_parser)]
    output_dir: PathBuf,
    /// `.class` files or archives.
    #[clap(required = true, value_parser)]
    inputs: Vec<PathBuf>,
}

fn load_config(path: Option<&Path>) -> Result<JaffleConfig, ConfigError> {
    match path {
        Some(path) => {
            info!("Loading configuration from specified path: {path:?}");
            JaffleConfig::load_from_file(path)
        }
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_FILE);
            if default_path.exists() {
                info!("No config file specified, loading default: {default_path:?}");
                JaffleConfig::load_from_file(default_path)
            } else {
                info!("No config file specified and {DEFAULT_CONFIG_FILE} not found, using built-in defaults");
                Ok(JaffleConfig::default())
            }
        }
    }
}

/// Config file, then the density variables found through `env`, then flags.
fn effective_config<F>(cli: &Cli, env: F) -> Result<JaffleConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = load_config(cli.config_file.as_deref())?;
    config.apply_env(env)?;
    if cli.custom_init {
        config.instrument.custom_init = true;
    }
    if cli.deterministic {
        config.instrument.deterministic = true;
    }
    if let Some(dir) = &cli.support_dir {
        config.support_dir = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

fn print_summary(output: &Path, stats: &BatchStats) {
    println!("Output written to {}", output.display());
    println!(
        "Class files: {}, Archives: {}, Instrumented units: {}",
        stats.class_files, stats.archives, stats.instrumented
    );
    println!(
        "Already instrumented: {}, Skipped: {}, Malformed: {}, Exhausted: {}, Failed inputs: {}",
        stats.already_instrumented,
        stats.skipped,
        stats.malformed,
        stats.exhausted,
        stats.failed_inputs
    );
    if stats.failed_entries > 0 || stats.dropped_signatures > 0 {
        println!(
            "Unreadable archive entries: {}, Dropped signature files: {}",
            stats.failed_entries, stats.dropped_signatures
        );
    }
    println!("Recorded edges: {}", stats.edges);
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let usage_error = e.use_stderr();
            e.print()?;
            std::process::exit(if usage_error { 1 } else { 0 });
        }
    };

    let config = effective_config(&cli, |var| std::env::var(var).ok())?;
    info!("Effective configuration: {config:?}");

    let support = match &config.support_dir {
        Some(dir) => load_support_units(dir)
            .with_context(|| format!("Unable to load support classes from {dir:?}"))?,
        None => {
            warn!("No support directory given, outputs will not carry the runtime classes");
            Vec::new()
        }
    };

    let instrumenter = Instrumenter::new(config.hooks.clone(), config.instrument.map_size_pow2);
    let mut batch = Batch::new(
        &instrumenter,
        config.instrument_options(),
        &cli.output_dir,
        support,
    )?;
    for input in &cli.inputs {
        batch.process(input);
    }
    let output = std::fs::canonicalize(batch.output_dir()).unwrap_or_else(|_| cli.output_dir.clone());
    let stats = batch.finish()?;

    if cli.json {
        let summary = serde_json::json!({ "output": output, "stats": stats });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&output, &stats);
    }
    Ok(())
}
