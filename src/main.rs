//! gpu-stress: concurrent multi-GPU stress test.
//!
//! Without a subcommand this is the orchestrator: it resolves the target
//! devices and re-runs itself once per device with the hidden `worker`
//! subcommand, then waits for every worker to exit.

use std::io::IsTerminal;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use gpu_stress::config::{Cli, Command};
use gpu_stress::gpu;
use gpu_stress::stress::{orchestrator, worker};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "gpu_stress=debug"
    } else {
        "gpu_stress=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_ansi(std::io::stdout().is_terminal())
        .init();

    match cli.command.clone() {
        Some(Command::Worker(args)) => {
            // The device binding is per-thread, so the whole sequence runs
            // on one blocking thread.
            let outcome = tokio::task::spawn_blocking(move || {
                let accel = gpu::backend(&args.backend);
                worker::run_worker(args.params(), accel.as_ref())
            })
            .await?;

            Ok(ExitCode::from(outcome.exit_code()))
        }
        None => {
            info!("gpu-stress v{}", env!("CARGO_PKG_VERSION"));
            orchestrator::run(&cli).await
        }
    }
}
