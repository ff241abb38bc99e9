//! CONVEYOR CLI
//!
//! Runs the demonstration pipeline and inspects configuration.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod config;
mod pipeline;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use pipeline::{Outcome, RunOptions};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "CONVEYOR - handler pipelines with conflict-aware scheduling", long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the demo pipeline
    Run {
        /// Path to a JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Number of concurrent executions
        #[arg(short, long, default_value_t = 8)]
        invocations: u32,
        /// Number of distinct job keys
        #[arg(short, long, default_value_t = 3)]
        keys: u32,
        /// Run executions sharing a key one after another
        #[arg(long)]
        serialize_same_key: bool,
        /// Interrupt jobs with this key
        #[arg(long)]
        interrupt_on: Option<u32>,
    },
    /// Print the effective configuration
    Config {
        /// Path to a JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            config,
            invocations,
            keys,
            serialize_same_key,
            interrupt_on,
        } => {
            let config = config::load(config.as_deref())?;
            let options = RunOptions {
                invocations,
                keys,
                serialize_same_key,
                interrupt_on,
            };
            let executor = pipeline::build(config, &options);
            let report = pipeline::run(&executor, &options).await;

            for (index, outcome) in report.outcomes.iter().enumerate() {
                match outcome {
                    Outcome::Completed { key } => println!("#{index} key={key} completed"),
                    Outcome::Interrupted { key } => println!("#{index} key={key} interrupted"),
                    Outcome::Rejected { key } => println!("#{index} key={key} rejected"),
                    Outcome::Failed { key, error } => println!("#{index} key={key} failed: {error}"),
                }
            }
            println!("{}", serde_json::to_string_pretty(&report.telemetry)?);
            Ok(())
        }
        Commands::Config { config } => {
            let config = config::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
