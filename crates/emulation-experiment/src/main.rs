//! Emulation Experiment CLI.
//!
//! Commands:
//! - resolve: Print the resolved component order (dry run)
//! - run: Resolve, construct and run an experiment

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use emulation_experiment::config::ExperimentConfig;
use emulation_experiment::experiment::ExperimentRunner;
use emulation_experiment::results::format_duration;
use emulation_kernel::RootRequest;

/// Generate a timestamped output path from the given path.
/// e.g., "results.json" -> "results-20260108-010530.json"
fn timestamped_path(path: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d-%H%M%S");
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("results");
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("json");
    let parent = path.parent().unwrap_or(Path::new("."));
    parent.join(format!("{}-{}.{}", stem, timestamp, ext))
}

#[derive(Parser)]
#[command(name = "emulation-experiment")]
#[command(version)]
#[command(about = "Resolve and run component-defined emulation experiments")]
struct Cli {
    /// Experiment configuration file (JSON)
    #[arg(long, short, env = "EMULATION_CONFIG")]
    config: Option<PathBuf>,

    /// Component repository directory (repeatable, appended to the config's)
    #[arg(long = "repo")]
    repos: Vec<PathBuf>,

    /// Default provider for a capability: capability=component (repeatable)
    #[arg(long = "bind")]
    bindings: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the order components would run in
    Resolve {
        /// Root components: name[:arg,key=value,...]
        #[arg(required = true)]
        roots: Vec<RootRequest>,

        /// Also print every ordering edge and its reason
        #[arg(long)]
        explain: bool,
    },

    /// Run an experiment
    Run {
        /// Root components: name[:arg,key=value,...]
        #[arg(required = true)]
        roots: Vec<RootRequest>,

        /// Slack after the last barrier arrival before positive time
        #[arg(long)]
        buffer_seconds: Option<f64>,

        /// Abort automatically after this many seconds
        #[arg(long)]
        deadline_seconds: Option<f64>,

        /// Output file for results (a timestamp is added to the name)
        #[arg(long, default_value = "results.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();

    let mut config = match &cli.config {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };
    config.repositories.extend(cli.repos);
    for binding in &cli.bindings {
        config.bind(binding)?;
    }

    match cli.command {
        Commands::Resolve { roots, explain } => {
            let runner = ExperimentRunner::new(config);
            let plan = runner.plan(&roots)?;

            for (idx, component) in plan.resolution.order.iter().enumerate() {
                println!("{:>3}. {}", idx + 1, component.name());
            }
            if explain {
                println!("\nEdges:");
                for edge in &plan.resolution.edges {
                    println!("  {} -> {} ({})", edge.before, edge.after, edge.reason);
                }
            }
        }

        Commands::Run {
            roots,
            buffer_seconds,
            deadline_seconds,
            output,
        } => {
            if let Some(buffer) = buffer_seconds {
                config.kernel.barrier.buffer_seconds = buffer;
            }
            if deadline_seconds.is_some() {
                config.deadline_seconds = deadline_seconds;
            }
            let output_dir = config.output_dir.clone();

            let runner = ExperimentRunner::new(config);
            let result = runner.run(&roots).await?;

            let summary = &result.summary;
            let elapsed = (result.ended_at - result.started_at).num_milliseconds();
            println!("\n=== Experiment Result ===");
            println!("Run: {}", result.run_id);
            println!("Phase: {:?}", summary.phase);
            println!("Components: {}", result.order.join(", "));
            println!(
                "Graph: {} vertices, {} edges",
                result.vertex_count, result.edge_count
            );
            println!("Duration: {}", format_duration(elapsed));
            if let Some(start) = summary.experiment_start {
                println!("Positive time started: {}", start);
            }
            println!("Action failures: {}", summary.action_failures);
            println!("Reboots: {}", summary.reboots);

            println!("\nVertices:");
            for (vertex, progress) in &summary.vertices {
                println!("  {}: {:?}", vertex, progress);
            }
            if !summary.unacknowledged.is_empty() {
                println!("\nDid not acknowledge abort: {}", summary.unacknowledged.join(", "));
            }
            if let Some(reason) = &result.abort_reason {
                println!("\nAborted: {}", reason);
            }

            let output = if output.is_relative() {
                output_dir.join(output)
            } else {
                output
            };
            std::fs::create_dir_all(output.parent().unwrap_or(Path::new(".")))
                .context("creating output directory")?;
            let output_path = timestamped_path(&output);
            result.save(&output_path)?;
            info!(path = %output_path.display(), "Results saved");
            println!("\nResults saved to: {}", output_path.display());

            if !result.completed() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
