//! Orchestrator: resolves target devices and runs one worker process each.
//!
//! Workers are this same executable re-run with the hidden `worker`
//! subcommand, so every device gets a fresh process and a fresh device
//! runtime. All workers are started before any is awaited, and every one
//! is awaited no matter how the others end.

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitCode, ExitStatus, Stdio};
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::config::{BackendArgs, Cli, WorkerParams};
use crate::gpu::{self, device};
use crate::stress::worker::EXIT_OUT_OF_MEMORY;

/// Exit code when no accelerator runtime is detected.
pub const EXIT_NO_ACCELERATOR: u8 = 1;

/// Exit code under `--strict` when any worker did not complete.
pub const EXIT_WORKER_FAILURE: u8 = 3;

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Cannot locate the gpu-stress executable: {0}")]
    CurrentExe(#[source] std::io::Error),

    #[error("Failed to spawn worker for device {device_id}: {source}")]
    Spawn {
        device_id: usize,
        source: std::io::Error,
    },

    #[error("Failed to wait for worker on device {device_id}: {source}")]
    Wait {
        device_id: usize,
        source: std::io::Error,
    },
}

/// Everything needed to launch the workers.
#[derive(Debug, Clone)]
pub struct StressPlan {
    /// Resolved device ids, in launch order.
    pub devices: Vec<usize>,
    pub duration: Duration,
    pub mem_gb: u64,
    pub matrix_dim: usize,
    pub backend: BackendArgs,
    pub verbose: bool,
}

impl StressPlan {
    pub fn from_cli(cli: &Cli, device_count: usize) -> Self {
        Self {
            devices: cli.gpus.resolve(device_count),
            duration: Duration::from_secs(cli.duration),
            mem_gb: cli.mem_gb,
            matrix_dim: cli.matrix_dim,
            backend: cli.backend.clone(),
            verbose: cli.verbose,
        }
    }

    pub fn params(&self, device_id: usize) -> WorkerParams {
        WorkerParams {
            device_id,
            duration: self.duration,
            mem_gb: self.mem_gb,
            matrix_dim: self.matrix_dim,
        }
    }
}

/// How a worker process ended, as seen from the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Completed,
    OutOfMemory,
    Failed(i32),
    /// Terminated by a signal.
    Killed,
    /// Never started, or could not be waited on.
    LaunchFailed(String),
}

impl WorkerStatus {
    pub fn from_exit(status: ExitStatus) -> Self {
        match status.code() {
            Some(0) => WorkerStatus::Completed,
            Some(code) if code == i32::from(EXIT_OUT_OF_MEMORY) => WorkerStatus::OutOfMemory,
            Some(code) => WorkerStatus::Failed(code),
            None => WorkerStatus::Killed,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, WorkerStatus::Completed)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Completed => f.write_str("completed"),
            WorkerStatus::OutOfMemory => f.write_str("out of memory"),
            WorkerStatus::Failed(code) => write!(f, "failed (exit code {code})"),
            WorkerStatus::Killed => f.write_str("killed by signal"),
            WorkerStatus::LaunchFailed(reason) => write!(f, "launch failed: {reason}"),
        }
    }
}

/// Result of joining one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub device_id: usize,
    pub status: WorkerStatus,
}

/// Launches and joins worker processes.
pub struct Orchestrator {
    program: PathBuf,
    plan: StressPlan,
}

impl Orchestrator {
    /// Orchestrator re-executing the running binary.
    pub fn new(plan: StressPlan) -> Result<Self, LaunchError> {
        let program = std::env::current_exe().map_err(LaunchError::CurrentExe)?;
        Ok(Self::with_program(program, plan))
    }

    /// Orchestrator launching `program` as the worker executable.
    pub fn with_program(program: impl Into<PathBuf>, plan: StressPlan) -> Self {
        Self {
            program: program.into(),
            plan,
        }
    }

    /// Command-line arguments of the worker for `device_id`.
    pub fn worker_args(&self, device_id: usize) -> Vec<String> {
        let mut args = vec!["worker".to_string()];
        args.extend(self.plan.params(device_id).to_args());
        args.extend(self.plan.backend.to_args());
        if self.plan.verbose {
            args.push("--verbose".to_string());
        }
        args
    }

    fn spawn(&self, device_id: usize) -> Result<Child, LaunchError> {
        Command::new(&self.program)
            .args(self.worker_args(device_id))
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| LaunchError::Spawn { device_id, source })
    }

    /// Start one worker per planned device, then wait for all of them.
    ///
    /// Reports come back in launch order.
    pub async fn run(&self) -> Vec<WorkerReport> {
        let launched: Vec<(usize, Result<Child, LaunchError>)> = self
            .plan
            .devices
            .iter()
            .map(|&device_id| {
                let child = self.spawn(device_id);
                if let Ok(child) = &child {
                    info!(device = device_id, pid = ?child.id(), "Launched worker");
                }
                (device_id, child)
            })
            .collect();

        let joins = launched.into_iter().map(|(device_id, child)| async move {
            let status = match child {
                Ok(mut child) => match child.wait().await {
                    Ok(status) => WorkerStatus::from_exit(status),
                    Err(source) => {
                        let err = LaunchError::Wait { device_id, source };
                        error!(device = device_id, error = %err, "Lost track of worker");
                        WorkerStatus::LaunchFailed(err.to_string())
                    }
                },
                Err(err) => {
                    error!(device = device_id, error = %err, "Worker launch failed");
                    WorkerStatus::LaunchFailed(err.to_string())
                }
            };
            WorkerReport { device_id, status }
        });

        join_all(joins).await
    }
}

/// Reports for a plan whose workers could not be launched at all.
pub fn launch_failed_reports(devices: &[usize], err: &LaunchError) -> Vec<WorkerReport> {
    devices
        .iter()
        .map(|&device_id| WorkerReport {
            device_id,
            status: WorkerStatus::LaunchFailed(err.to_string()),
        })
        .collect()
}

/// Print the startup banner.
pub fn log_banner(plan: &StressPlan) {
    info!("========================================");
    info!(devices = ?plan.devices, "Target devices");
    info!(
        duration_secs = plan.duration.as_secs(),
        mem_gb = plan.mem_gb,
        matrix_dim = plan.matrix_dim,
        "Stress parameters"
    );
    info!("========================================");
}

/// Log one line per worker. Returns how many did not complete.
pub fn summarize(reports: &[WorkerReport]) -> usize {
    let mut incomplete = 0;
    for report in reports {
        if report.status.is_completed() {
            info!(device = report.device_id, "Worker {}", report.status);
        } else {
            incomplete += 1;
            warn!(device = report.device_id, "Worker {}", report.status);
        }
    }
    incomplete
}

/// Orchestrator entry point.
pub async fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let accel = gpu::backend(&cli.backend);
    let count = match device::probe(accel.as_ref()) {
        Ok(count) => count,
        Err(err) => {
            error!(error = %err, "No accelerator runtime detected");
            return Ok(ExitCode::from(EXIT_NO_ACCELERATOR));
        }
    };

    if cli.list_devices {
        println!("{}", device::devices_json(accel.as_ref())?);
        return Ok(ExitCode::SUCCESS);
    }

    let plan = StressPlan::from_cli(cli, count);
    log_banner(&plan);

    let devices = plan.devices.clone();
    let reports = match Orchestrator::new(plan) {
        Ok(orch) => orch.run().await,
        Err(err) => {
            error!(error = %err, "No worker could be launched");
            launch_failed_reports(&devices, &err)
        }
    };
    let incomplete = summarize(&reports);

    info!("All stress tests ended");

    if cli.strict && incomplete > 0 {
        Ok(ExitCode::from(EXIT_WORKER_FAILURE))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    fn plan(devices: Vec<usize>) -> StressPlan {
        StressPlan {
            devices,
            duration: Duration::from_secs(5),
            mem_gb: 2,
            matrix_dim: 64,
            backend: BackendArgs {
                backend: BackendKind::Sim,
                sim_devices: 2,
                sim_mem_gb: 8,
            },
            verbose: false,
        }
    }

    #[test]
    fn test_worker_args() {
        let orch = Orchestrator::with_program("gpu-stress", plan(vec![1]));
        let args = orch.worker_args(1);

        assert_eq!(args[0], "worker");
        let joined = args.join(" ");
        assert!(joined.contains("--device 1"));
        assert!(joined.contains("--duration 5"));
        assert!(joined.contains("--mem_gb 2"));
        assert!(joined.contains("--matrix-dim 64"));
        assert!(joined.contains("--backend sim"));
        assert!(!joined.contains("--verbose"));
    }

    #[test]
    fn test_plan_from_cli() {
        use clap::Parser;

        let cli = Cli::try_parse_from(["gpu-stress", "--gpus", "0,2,1", "--duration", "3"]).unwrap();
        let plan = StressPlan::from_cli(&cli, 8);
        assert_eq!(plan.devices, vec![0, 2, 1]);
        assert_eq!(plan.duration, Duration::from_secs(3));

        let cli = Cli::try_parse_from(["gpu-stress"]).unwrap();
        assert_eq!(StressPlan::from_cli(&cli, 3).devices, vec![0, 1, 2]);
    }

    #[cfg(unix)]
    #[test]
    fn test_status_from_exit() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(
            WorkerStatus::from_exit(ExitStatus::from_raw(0)),
            WorkerStatus::Completed
        );
        assert_eq!(
            WorkerStatus::from_exit(ExitStatus::from_raw(i32::from(EXIT_OUT_OF_MEMORY) << 8)),
            WorkerStatus::OutOfMemory
        );
        assert_eq!(
            WorkerStatus::from_exit(ExitStatus::from_raw(11 << 8)),
            WorkerStatus::Failed(11)
        );
        // Raw status 9: terminated by SIGKILL.
        assert_eq!(
            WorkerStatus::from_exit(ExitStatus::from_raw(9)),
            WorkerStatus::Killed
        );
    }

    #[tokio::test]
    async fn test_missing_program_reports_every_device() {
        let orch = Orchestrator::with_program("/nonexistent/gpu-stress", plan(vec![0, 1, 0]));
        let reports = orch.run().await;

        let devices: Vec<usize> = reports.iter().map(|r| r.device_id).collect();
        assert_eq!(devices, vec![0, 1, 0]);
        assert!(reports
            .iter()
            .all(|r| matches!(r.status, WorkerStatus::LaunchFailed(_))));
        assert_eq!(summarize(&reports), 3);
    }

    #[test]
    fn test_unlocatable_executable_fails_every_device() {
        let err = LaunchError::CurrentExe(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "executable removed",
        ));
        let reports = launch_failed_reports(&[2, 0, 2], &err);

        let devices: Vec<usize> = reports.iter().map(|r| r.device_id).collect();
        assert_eq!(devices, vec![2, 0, 2]);
        assert!(reports.iter().all(|r| matches!(
            &r.status,
            WorkerStatus::LaunchFailed(reason) if reason.contains("executable removed")
        )));
        assert_eq!(summarize(&reports), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_worker_does_not_block_join() {
        // `false` ignores its arguments and exits 1.
        let orch = Orchestrator::with_program("false", plan(vec![0, 1]));
        let reports = orch.run().await;

        assert_eq!(reports.len(), 2);
        assert!(reports
            .iter()
            .all(|r| r.status == WorkerStatus::Failed(1)));
    }
}
