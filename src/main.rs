//! Terrallel: run one external command across many workspaces in a
//! user-declared dependency tree.
//!
//! This is the entry point. It parses the command line, loads the
//! manifest, expands the chosen target into a plan of subprocess jobs,
//! and drives the plan under signal supervision. Child output is
//! multiplexed onto the operator's streams with `[<workspace>]: `
//! prefixes, and a result tree is printed once traversal settles.

mod error;
mod job;
mod manifest;
mod plan;
mod prefix;
mod report;
mod runner;
mod signal;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::job::CommandJob;
use crate::plan::Plan;
use crate::runner::Direction;
use crate::signal::Supervisor;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "terrallel",
    version,
    about = "Run a command across workspace trees in parallel"
)]
struct Cli {
    /// Path to the manifest file.
    #[arg(short, long, default_value = "Infrafile")]
    manifest: PathBuf,
    /// Print every command instead of spawning it.
    #[arg(short = 'd', long)]
    dry_run: bool,
    /// Target to run.
    target: String,
    /// External command and its arguments, after a literal `--`.
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Diagnostics go to stderr and respect RUST_LOG; the operator's
    // multiplexed child output stays on the usual streams.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let (bin, args) = cli
        .command
        .split_first()
        .ok_or_else(|| anyhow!("missing command after --"))?;
    let manifest = manifest::load(&cli.manifest)
        .with_context(|| format!("failure loading {}", cli.manifest.display()))?;
    let target = manifest
        .targets
        .get(&cli.target)
        .ok_or_else(|| anyhow!("target {} not found", cli.target))?;
    let basedir = PathBuf::from(&manifest.settings.basedir);

    let supervisor = Supervisor::new();
    supervisor.listen();

    let plan = Plan::build(target, &|workspace: &str| {
        CommandJob::new(
            workspace,
            &basedir,
            bin,
            args,
            Box::new(io::stdout()),
            Box::new(io::stderr()),
        )
    });
    let direction = Direction::from_args(&cli.command);
    let outcome = runner::traverse(&plan, &supervisor, cli.dry_run, direction).await;

    print!("\n{}", report::render(&plan));
    outcome.map_err(anyhow::Error::new)
}
