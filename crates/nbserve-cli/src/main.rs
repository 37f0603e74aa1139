//! nbserve CLI - kernel execution manager for Jupyter notebooks.

mod colors;
mod exec;
mod output;
mod run;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use nbserve_core::{AccessPolicy, Coordinator, ExecConfig, KernelSpec, ProcessLauncher};

#[derive(Parser)]
#[command(name = "nbserve")]
#[command(about = "Kernel execution manager for Jupyter notebooks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory notebooks may live in (repeatable; default: current directory)
    #[arg(long = "allowed-dir", global = true)]
    allowed_dirs: Vec<PathBuf>,

    /// Execution timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Kernel binary to launch (default: bundled nbserve-kernel)
    #[arg(long, global = true)]
    kernel: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a code snippet against a notebook's kernel
    Exec {
        /// Path to the notebook (.ipynb file)
        notebook: PathBuf,

        /// Code to execute
        code: String,
    },

    /// Run notebook cells in order, writing outputs back to the file
    Run {
        /// Path to the notebook (.ipynb file)
        notebook: PathBuf,

        /// First cell index
        #[arg(long, default_value_t = 0)]
        from: usize,

        /// Last cell index, inclusive (default: last cell)
        #[arg(long)]
        to: Option<usize>,

        /// Skip the remaining cells after the first failure
        #[arg(long)]
        stop_on_error: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let policy = if cli.allowed_dirs.is_empty() {
        let cwd = std::env::current_dir().context("cannot determine current directory")?;
        AccessPolicy::new([cwd])?
    } else {
        AccessPolicy::new(&cli.allowed_dirs)?
    };

    let config = ExecConfig::default();
    let timeout = cli.timeout.map(Duration::from_secs);

    let spec = match cli.kernel {
        Some(program) => KernelSpec::new(program, Vec::new()),
        None => KernelSpec::resolve_default()?,
    };
    let launcher = Arc::new(ProcessLauncher::new(spec, config.clone()));
    let coordinator = Coordinator::new(policy, launcher, config);

    let outcome = match cli.command {
        Commands::Exec { notebook, code } => {
            exec::execute(&coordinator, &notebook, &code, timeout).await
        }

        Commands::Run {
            notebook,
            from,
            to,
            stop_on_error,
        } => run::execute(&coordinator, &notebook, from, to, stop_on_error, timeout).await,
    };

    // Kernels are per-process; reap them before reporting the outcome.
    coordinator.shutdown_all().await;
    outcome
}
