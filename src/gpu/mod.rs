//! Accelerator runtimes.
//!
//! - [`device`]: device discovery and the availability probe
//! - [`sim`]: simulated devices for CPU-only runs and tests
//! - `cuda`: CUDA backend on cudarc (requires the `cuda` feature)
//!
//! A worker only talks to the runtime through [`Accelerator`] and the
//! [`BoundDevice`] it hands out, so the stress sequence is the same for
//! every backend.

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod device;
pub mod sim;

use thiserror::Error;

use crate::config::{BackendArgs, BackendKind};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("Accelerator runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid device {device_id}: runtime reports {count} device(s)")]
    InvalidDevice { device_id: usize, count: usize },

    #[error("Out of memory on device {device_id}: requested {requested_bytes} bytes")]
    OutOfMemory {
        device_id: usize,
        requested_bytes: u64,
    },

    #[error("Driver error on device {device_id}: {reason}")]
    Driver { device_id: usize, reason: String },
}

/// An accelerator runtime: enumerates devices and binds to one of them.
pub trait Accelerator: Send + Sync {
    /// Short runtime name used in log lines.
    fn name(&self) -> &'static str;

    /// Number of devices the runtime reports.
    fn device_count(&self) -> Result<usize, DeviceError>;

    /// Describe every device the runtime reports.
    fn devices(&self) -> Result<Vec<device::DeviceInfo>, DeviceError>;

    /// Make `device_id` the active device of the calling thread.
    fn bind(&self, device_id: usize) -> Result<Box<dyn BoundDevice>, DeviceError>;
}

/// A device bound by one worker. Owns every allocation made through it;
/// they are released when it is dropped.
pub trait BoundDevice {
    fn device_id(&self) -> usize;

    /// Allocate a buffer of `shape` f32 elements filled with uniform random
    /// values, held until the device is dropped.
    fn occupy(&mut self, shape: [usize; 3]) -> Result<(), DeviceError>;

    /// Allocate a `dim × dim` normal-random matrix and its product buffer.
    fn prepare_compute(&mut self, dim: usize) -> Result<(), DeviceError>;

    /// Multiply the compute matrix by itself, discarding the result.
    /// May return before the device has finished the work.
    fn matmul(&mut self) -> Result<(), DeviceError>;

    /// Block until all queued work has finished.
    fn synchronize(&mut self) -> Result<(), DeviceError>;
}

/// Build the runtime selected on the command line.
pub fn backend(args: &BackendArgs) -> Box<dyn Accelerator> {
    match args.backend {
        BackendKind::Cuda => cuda_backend(),
        BackendKind::Sim => Box::new(sim::SimAccelerator::new(args.sim_devices, args.sim_mem_gb)),
    }
}

#[cfg(feature = "cuda")]
fn cuda_backend() -> Box<dyn Accelerator> {
    Box::new(cuda::CudaAccelerator::new())
}

#[cfg(not(feature = "cuda"))]
fn cuda_backend() -> Box<dyn Accelerator> {
    Box::new(CudaDisabled)
}

/// Stand-in for the CUDA runtime in builds without the `cuda` feature.
#[cfg(not(feature = "cuda"))]
struct CudaDisabled;

#[cfg(not(feature = "cuda"))]
impl Accelerator for CudaDisabled {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn device_count(&self) -> Result<usize, DeviceError> {
        Err(DeviceError::Unavailable(
            "built without the `cuda` feature".to_string(),
        ))
    }

    fn devices(&self) -> Result<Vec<device::DeviceInfo>, DeviceError> {
        self.device_count().map(|_| Vec::new())
    }

    fn bind(&self, _device_id: usize) -> Result<Box<dyn BoundDevice>, DeviceError> {
        Err(DeviceError::Unavailable(
            "built without the `cuda` feature".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_backend_selected() {
        let args = BackendArgs {
            backend: BackendKind::Sim,
            sim_devices: 3,
            sim_mem_gb: 1,
        };
        let accel = backend(&args);
        assert_eq!(accel.name(), "sim");
        assert_eq!(accel.device_count().unwrap(), 3);
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_cuda_unavailable_without_feature() {
        let args = BackendArgs {
            backend: BackendKind::Cuda,
            sim_devices: 0,
            sim_mem_gb: 16,
        };
        let accel = backend(&args);
        assert!(matches!(
            accel.device_count(),
            Err(DeviceError::Unavailable(_))
        ));
        assert!(accel.bind(0).is_err());
    }
}
