//! Command-line configuration for gpu-stress.
//!
//! There is no configuration file: every knob is a flag. The same binary
//! serves as orchestrator (top-level flags) and as worker (the hidden
//! `worker` subcommand the orchestrator re-executes once per device).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;

/// Number of 4-byte float elements treated as one gigabyte.
pub const ELEMENTS_PER_GB: usize = 256 * 1024 * 1024;

/// Side length of the square compute matrix.
pub const DEFAULT_MATRIX_DIM: usize = 4000;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "gpu-stress",
    version,
    about = "Concurrent multi-GPU stress test: one isolated worker process per device"
)]
pub struct Cli {
    /// Compute loop duration per device, in seconds.
    #[arg(long, default_value_t = 60)]
    pub duration: u64,

    /// Device memory to occupy per device, in gigabytes.
    #[arg(long = "mem_gb", default_value_t = 4, value_parser = clap::value_parser!(u64).range(1..))]
    pub mem_gb: u64,

    /// Target devices: "all" or a comma-separated list of ids (e.g. "0,1").
    #[arg(long, default_value = "all")]
    pub gpus: DeviceSpec,

    /// Side length of the square matrix multiplied in the compute loop.
    #[arg(long, default_value_t = DEFAULT_MATRIX_DIM, value_parser = parse_matrix_dim)]
    pub matrix_dim: usize,

    #[command(flatten)]
    pub backend: BackendArgs,

    /// Exit non-zero when any worker did not complete.
    #[arg(long)]
    pub strict: bool,

    /// Print detected devices as JSON and exit.
    #[arg(long)]
    pub list_devices: bool,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Stress a single device (spawned by the orchestrator).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Arguments of the hidden `worker` subcommand.
#[derive(Args, Debug, Clone)]
pub struct WorkerArgs {
    /// Device to bind.
    #[arg(long)]
    pub device: usize,

    #[arg(long)]
    pub duration: u64,

    #[arg(long = "mem_gb")]
    pub mem_gb: u64,

    #[arg(long, default_value_t = DEFAULT_MATRIX_DIM, value_parser = parse_matrix_dim)]
    pub matrix_dim: usize,

    #[command(flatten)]
    pub backend: BackendArgs,
}

impl WorkerArgs {
    pub fn params(&self) -> WorkerParams {
        WorkerParams {
            device_id: self.device,
            duration: Duration::from_secs(self.duration),
            mem_gb: self.mem_gb,
            matrix_dim: self.matrix_dim,
        }
    }
}

/// Which accelerator runtime to drive.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// NVIDIA CUDA (requires the `cuda` feature).
    Cuda,
    /// Simulated devices backed by host memory accounting.
    Sim,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cuda => f.write_str("cuda"),
            BackendKind::Sim => f.write_str("sim"),
        }
    }
}

/// Backend selection, shared by the orchestrator and its workers.
#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct BackendArgs {
    /// Accelerator runtime.
    #[arg(long, value_enum, env = "GPU_STRESS_BACKEND", default_value_t = BackendKind::Cuda)]
    pub backend: BackendKind,

    /// Number of simulated devices (sim backend only).
    #[arg(long, env = "GPU_STRESS_SIM_DEVICES", default_value_t = 0)]
    pub sim_devices: usize,

    /// Memory capacity of each simulated device, in gigabytes.
    #[arg(long, env = "GPU_STRESS_SIM_MEM_GB", default_value_t = 16)]
    pub sim_mem_gb: u64,
}

impl BackendArgs {
    /// Render back into flags for a re-executed worker.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--backend".to_string(),
            self.backend.to_string(),
            "--sim-devices".to_string(),
            self.sim_devices.to_string(),
            "--sim-mem-gb".to_string(),
            self.sim_mem_gb.to_string(),
        ]
    }
}

fn parse_matrix_dim(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("matrix dimension must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("empty device list")]
    EmptyDeviceList,

    #[error("invalid device id {0:?}: expected a non-negative integer")]
    InvalidDeviceId(String),
}

/// Device selection as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSpec {
    /// Every device the runtime reports.
    All,
    /// Explicit ids, in the user's order. Duplicates are kept and ids are
    /// not checked against the device count.
    List(Vec<usize>),
}

impl DeviceSpec {
    /// Resolve into the ordered list of device ids to launch workers for.
    pub fn resolve(&self, device_count: usize) -> Vec<usize> {
        match self {
            DeviceSpec::All => (0..device_count).collect(),
            DeviceSpec::List(ids) => ids.clone(),
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "all" {
            return Ok(DeviceSpec::All);
        }
        if s.is_empty() {
            return Err(ConfigError::EmptyDeviceList);
        }

        s.split(',')
            .map(|token| {
                let token = token.trim();
                token
                    .parse::<usize>()
                    .map_err(|_| ConfigError::InvalidDeviceId(token.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(DeviceSpec::List)
    }
}

/// Parameters of one worker, fixed for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerParams {
    /// Device to bind.
    pub device_id: usize,

    /// How long the compute loop runs.
    pub duration: Duration,

    /// Memory occupation target in gigabytes.
    pub mem_gb: u64,

    /// Side length of the compute matrix.
    pub matrix_dim: usize,
}

impl WorkerParams {
    /// Shape of the memory occupation buffer: `(mem_gb * 256, 1024, 1024)`.
    ///
    /// `None` when the buffer size does not fit in the address space.
    pub fn occupation_shape(&self) -> Option<[usize; 3]> {
        let outer = usize::try_from(self.mem_gb).ok()?.checked_mul(256)?;
        self.occupation_bytes()?;
        Some([outer, 1024, 1024])
    }

    /// Number of f32 elements in the memory occupation buffer.
    pub fn occupation_elements(&self) -> Option<usize> {
        usize::try_from(self.mem_gb)
            .ok()?
            .checked_mul(ELEMENTS_PER_GB)
    }

    /// Size of the memory occupation buffer in bytes.
    pub fn occupation_bytes(&self) -> Option<u64> {
        let elements = u64::try_from(self.occupation_elements()?).ok()?;
        elements.checked_mul(std::mem::size_of::<f32>() as u64)
    }

    /// Flags for the hidden `worker` subcommand.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--device".to_string(),
            self.device_id.to_string(),
            "--duration".to_string(),
            self.duration.as_secs().to_string(),
            "--mem_gb".to_string(),
            self.mem_gb.to_string(),
            "--matrix-dim".to_string(),
            self.matrix_dim.to_string(),
        ]
    }
}
