//! Accord: policy engine replica
//!
//! Subcommands:
//! - `run`: start a replica from a config file and poll its datasources
//! - `eval`: evaluate a rules file against a JSON facts file
//! - `check`: validate a rules file

use std::path::PathBuf;

use accord_engine::PolicyKind;
use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod eval;
mod run;

/// Parse a policy kind as written in configs and the API.
fn parse_kind(s: &str) -> Result<PolicyKind, String> {
    match s.to_lowercase().as_str() {
        "recursive" => Ok(PolicyKind::Recursive),
        "nonrecursive" => Ok(PolicyKind::Nonrecursive),
        "z3" => Ok(PolicyKind::Z3),
        _ => Err(format!(
            "invalid policy kind '{}', expected recursive, nonrecursive or z3",
            s
        )),
    }
}

#[derive(Parser)]
#[command(name = "accord")]
#[command(about = "Datalog policy engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a replica until interrupted
    Run {
        /// Replica config file (JSON)
        #[arg(long, env = "ACCORD_CONFIG")]
        config: PathBuf,

        /// Override the configured replica id
        #[arg(long, env = "ACCORD_REPLICA_ID")]
        replica_id: Option<String>,
    },

    /// Evaluate a rules file and print one table
    Eval {
        /// Rules file, one rule per statement
        rules: PathBuf,

        /// Facts file: `{"owner:table": [[v0, v1], ...]}`
        #[arg(long)]
        facts: Option<PathBuf>,

        /// Table to print
        #[arg(long)]
        table: String,

        /// Policy kind to evaluate with
        #[arg(long, value_parser = parse_kind, default_value = "recursive")]
        kind: PolicyKind,
    },

    /// Check that every rule in a file is accepted
    Check {
        /// Rules file, one rule per statement
        rules: PathBuf,

        /// Policy kind to check against
        #[arg(long, value_parser = parse_kind, default_value = "recursive")]
        kind: PolicyKind,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "accord=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, replica_id } => run::run(&config, replica_id).await,
        Commands::Eval {
            rules,
            facts,
            table,
            kind,
        } => eval::run_eval(&rules, facts.as_deref(), &table, kind).await,
        Commands::Check { rules, kind } => eval::run_check(&rules, kind).await,
    }
}
