//! tickfsm - tick-driven state machine runner
//!
//! Loads machine documents and a scenario, then drives the engine tick by tick.

mod report;
mod scenario;

use clap::{Parser, Subcommand};
use colored::Colorize;
use scenario::{Scenario, ScenarioError, Simulation};
use std::path::{Path, PathBuf};
use tickfsm_core::diagnostics::drain;
use tickfsm_core::{Engine, EngineConfig};
use tickfsm_dsl::{DslError, MachineDocument};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tickfsm")]
#[command(about = "Run tick-driven state machine scenarios")]
#[command(version)]
struct Cli {
    /// Engine config file (overrides TICKFSM_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario
    Run {
        /// Scenario file (YAML)
        scenario: PathBuf,

        /// Number of ticks (defaults to the scenario's, then 1)
        #[arg(short = 'n', long)]
        ticks: Option<u32>,

        /// Tick only this group
        #[arg(short, long)]
        group: Option<String>,

        /// Print a JSON report instead of the table
        #[arg(long)]
        json: bool,
    },

    /// Validate machine documents
    Check {
        /// Machine files (YAML or JSON)
        #[arg(required = true)]
        machines: Vec<PathBuf>,
    },
}

fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            scenario,
            ticks,
            group,
            json,
        } => load_config(cli.config.as_deref())
            .and_then(|config| run(&config, &scenario, ticks, group.as_deref(), json)),
        Commands::Check { machines } => check(&machines),
    };

    if let Err(e) = result {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, ScenarioError> {
    match path {
        Some(path) => {
            let mut config = EngineConfig::from_file(path)?;
            config.apply_env_overrides();
            config.validate()?;
            tracing::info!("Loaded config from {}", path.display());
            Ok(config)
        }
        None => Ok(EngineConfig::load()?),
    }
}

fn run(
    config: &EngineConfig,
    path: &Path,
    ticks: Option<u32>,
    group: Option<&str>,
    json: bool,
) -> Result<(), ScenarioError> {
    let scenario = Scenario::from_path(path)?;

    let engine = Engine::with_config(config);
    let mut rx = engine.subscribe();
    let mut sim = Simulation::load_into(engine, &scenario)?;

    let ticks = ticks.or(scenario.ticks).unwrap_or(1);
    tracing::info!(
        "Running {} for {} tick(s) ({} instance(s))",
        path.display(),
        ticks,
        sim.engine().registry().instance_count(None)
    );

    let mut summaries = Vec::new();
    let mut diagnostics = drain(&mut rx);
    if !json {
        for diagnostic in diagnostics.drain(..) {
            eprintln!("{}", report::format_diagnostic(&diagnostic));
        }
    }

    for _ in 0..ticks {
        let tick_summaries = sim.step(group);
        let events = drain(&mut rx);
        if json {
            diagnostics.extend(events);
            summaries.extend(tick_summaries);
            continue;
        }
        for summary in &tick_summaries {
            println!("{}", report::format_summary(sim.ticks(), summary));
        }
        for diagnostic in &events {
            eprintln!("{}", report::format_diagnostic(diagnostic));
        }
    }

    if json {
        let value = report::run_json(&sim, &summaries, &diagnostics);
        let output = serde_json::to_string_pretty(&value)
            .map_err(|e| ScenarioError::Invalid(format!("failed to encode report: {}", e)))?;
        println!("{}", output);
    } else {
        println!();
        println!("{}", report::format_table(&sim.engine().registry().snapshot()));
    }
    Ok(())
}

fn check(paths: &[PathBuf]) -> Result<(), ScenarioError> {
    let mut failed = 0;
    for path in paths {
        match check_one(path) {
            Ok(doc) => {
                let checksum = doc.checksum()?;
                println!(
                    "{} {} ({} states, {} transitions, rate {}, checksum {})",
                    "OK".green(),
                    doc.name.cyan(),
                    doc.states.len(),
                    doc.transitions.len(),
                    doc.process_rate,
                    checksum.dimmed()
                );
                for state in doc.undeclared_states() {
                    println!(
                        "   {} state '{}' is referenced but not declared",
                        "warning:".yellow(),
                        state
                    );
                }
            }
            Err(e) => {
                failed += 1;
                println!(
                    "{} {} [{}]: {}",
                    "FAILED".red(),
                    path.display(),
                    e.error_code(),
                    e
                );
            }
        }
    }

    if failed > 0 {
        return Err(ScenarioError::Invalid(format!(
            "{} of {} machine(s) failed validation",
            failed,
            paths.len()
        )));
    }
    Ok(())
}

fn check_one(path: &Path) -> Result<MachineDocument, DslError> {
    let doc = MachineDocument::from_path(path)?;
    doc.compile()?;
    Ok(doc)
}
