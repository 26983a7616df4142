//! Tether Command-Line Interface
//!
//! This CLI provides tools for:
//! - Running bridged WebAssembly modules and draining their callbacks
//! - Checking a module's imports and exports against the bridge ABI
//! - Printing configuration presets to start a config file from

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tether_bridge::wasm::{Bridge, BridgeConfig, ModuleReport};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tether")]
#[command(author, version, about = "Host bridge for WebAssembly modules", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Instantiate a module, call `start`, and run queued callbacks
    Run {
        /// Module file (.wasm or .wat)
        module: PathBuf,

        /// JSON configuration file (fields default like the `default` preset)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Preset to start from when no config file is given
        #[arg(long, default_value = "default")]
        preset: String,

        /// Fuel limit (enables fuel metering)
        #[arg(long)]
        fuel: Option<u64>,

        /// Maximum linear memory in bytes
        #[arg(long)]
        max_memory: Option<usize>,

        /// Maximum handle table slots
        #[arg(long)]
        max_handles: Option<usize>,

        /// Skip the `start` export
        #[arg(long)]
        no_start: bool,
    },

    /// List a module's imports and exports and check them against the bridge
    Inspect {
        /// Module file (.wasm or .wat)
        module: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a configuration preset as JSON
    Config {
        /// Preset name (default, minimal, development)
        #[arg(default_value = "default")]
        preset: String,
    },
}

/// Resolve the configuration for `run`: file, else preset, then flag overrides.
fn load_config(
    path: Option<&Path>,
    preset: &str,
    fuel: Option<u64>,
    max_memory: Option<usize>,
    max_handles: Option<usize>,
) -> Result<BridgeConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        }
        None => parse_preset(preset)?,
    };

    if let Some(fuel) = fuel {
        config = config.fuel_limit(fuel);
    }
    if let Some(bytes) = max_memory {
        config = config.max_memory(bytes);
    }
    if let Some(slots) = max_handles {
        config = config.max_handles(slots);
    }
    Ok(config)
}

fn parse_preset(name: &str) -> Result<BridgeConfig> {
    BridgeConfig::preset(&name.to_lowercase()).with_context(|| {
        format!(
            "Unknown preset: {}. Use default, minimal, or development",
            name
        )
    })
}

fn cmd_run(module_path: PathBuf, config: BridgeConfig, no_start: bool) -> Result<()> {
    let bridge = Bridge::new(config).context("Failed to create bridge")?;
    let module = bridge
        .load_module(&module_path)
        .with_context(|| format!("Failed to load module {}", module_path.display()))?;

    let report = module.inspect();
    for import in report.imports.iter().filter(|i| !i.provided) {
        warn!("Import {}::{} is not provided by the bridge", import.module, import.name);
    }

    let mut instance = bridge
        .instantiate(&module)
        .context("Failed to instantiate module")?;
    info!("Instantiated {}", module.name());

    println!("=== Tether Run ===");
    println!();
    println!("Module:       {}", module_path.display());
    println!("Error sink:   {}", if instance.has_error_sink() { "yes" } else { "no" });

    if !no_start {
        let started = instance.start().context("start failed")?;
        if started.value {
            println!("start:        {} us", started.execution_time_us);
            if let Some(fuel) = started.fuel_consumed {
                println!("Fuel used:    {}", fuel);
            }
        } else {
            println!("start:        (not exported)");
        }
    }

    let tasks = instance
        .run_until_idle()
        .context("Host task queue failed")?;
    println!("Tasks run:    {}", tasks);
    if let Some(fuel) = instance.remaining_fuel() {
        println!("Fuel left:    {}", fuel);
    }

    println!();
    println!("Statistics:");
    println!("{}", serde_json::to_string_pretty(&instance.stats())?);

    Ok(())
}

fn cmd_inspect(module_path: PathBuf, json: bool) -> Result<()> {
    // Inspection never runs the module, so the default engine config is fine.
    let bridge = Bridge::new(BridgeConfig::default()).context("Failed to create bridge")?;
    let module = bridge
        .load_module(&module_path)
        .with_context(|| format!("Failed to load module {}", module_path.display()))?;
    let report = module.inspect();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if !report.is_compatible() {
        anyhow::bail!("{} cannot be instantiated by the bridge", report.name);
    }
    Ok(())
}

fn print_report(report: &ModuleReport) {
    println!("=== Module: {} ===", report.name);
    println!();
    println!("Imports ({}):", report.imports.len());
    for import in &report.imports {
        let mark = if import.provided { " " } else { "!" };
        println!("  {} {}::{}", mark, import.module, import.name);
    }
    println!();
    println!("Exports ({}):", report.exports.len());
    for export in &report.exports {
        println!("    {}", export);
    }
    println!();
    if report.missing_exports.is_empty() {
        println!("Required exports: ok");
    } else {
        println!("Missing exports:  {}", report.missing_exports.join(", "));
    }
    if !report.optional_exports.is_empty() {
        println!("Optional exports: {}", report.optional_exports.join(", "));
    }
}

fn cmd_config(preset: String) -> Result<()> {
    let config = parse_preset(&preset)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run {
            module,
            config,
            preset,
            fuel,
            max_memory,
            max_handles,
            no_start,
        } => {
            let config = load_config(config.as_deref(), &preset, fuel, max_memory, max_handles)?;
            cmd_run(module, config, no_start)
        }

        Commands::Inspect { module, json } => cmd_inspect(module, json),

        Commands::Config { preset } => cmd_config(preset),
    }
}
