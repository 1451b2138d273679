use clap::Parser;

use anyhow::Result;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use codesite::{build_instance, BuildOptions};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the site configuration file
    config: PathBuf,
    /// Parallelism for the worker pool and the build command's $jobs
    #[arg(short = 'j', long)]
    jobs: Option<usize>,
    /// Build only this tree instead of every tree in the configuration
    #[arg(long)]
    tree: Option<String>,
    /// Echo the external build command's output and be more chatty
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    build_instance(
        &cli.config,
        &BuildOptions {
            nb_jobs: cli.jobs,
            tree: cli.tree,
            verbose: cli.verbose,
        },
    )
}
