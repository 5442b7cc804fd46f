//! CUDA backend.
//!
//! Device memory comes from the stream allocator and is filled with cuRAND.
//! The compute matrix is multiplied with cuBLAS SGEMM. Kernel launches are
//! asynchronous, so callers must [`BoundDevice::synchronize`] before
//! reading the clock for the last time.

use std::panic;
use std::sync::Arc;

use cudarc::cublas::sys::cublasOperation_t;
use cudarc::cublas::{CudaBlas, Gemm, GemmConfig};
use cudarc::curand::CudaRng;
use cudarc::driver::sys::{CUdevice_attribute, CUresult};
use cudarc::driver::{result, CudaContext, CudaSlice, CudaStream, DriverError};
use tracing::debug;

use super::device::DeviceInfo;
use super::{Accelerator, BoundDevice, DeviceError};

/// The CUDA driver runtime.
#[derive(Debug, Default)]
pub struct CudaAccelerator;

impl CudaAccelerator {
    pub fn new() -> Self {
        Self
    }
}

fn driver_error(device_id: usize, err: impl std::fmt::Debug) -> DeviceError {
    DeviceError::Driver {
        device_id,
        reason: format!("{err:?}"),
    }
}

fn alloc_error(device_id: usize, requested_bytes: u64, err: DriverError) -> DeviceError {
    if err.0 == CUresult::CUDA_ERROR_OUT_OF_MEMORY {
        DeviceError::OutOfMemory {
            device_id,
            requested_bytes,
        }
    } else {
        driver_error(device_id, err)
    }
}

/// Out of memory for a request whose size does not fit in the address space.
fn oversized(device_id: usize) -> DeviceError {
    DeviceError::OutOfMemory {
        device_id,
        requested_bytes: u64::MAX,
    }
}

impl Accelerator for CudaAccelerator {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn device_count(&self) -> Result<usize, DeviceError> {
        // With dynamic loading, a missing libcuda surfaces as a panic.
        let probed = panic::catch_unwind(|| {
            result::init()?;
            result::device::get_count()
        });

        match probed {
            Ok(Ok(count)) => Ok(count.max(0) as usize),
            Ok(Err(err)) => Err(DeviceError::Unavailable(format!("{err:?}"))),
            Err(_) => Err(DeviceError::Unavailable(
                "CUDA driver library could not be loaded".to_string(),
            )),
        }
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        let count = self.device_count()?;
        let mut devices = Vec::with_capacity(count);

        for id in 0..count {
            let ctx = CudaContext::new(id).map_err(|e| driver_error(id, e))?;
            ctx.bind_to_thread().map_err(|e| driver_error(id, e))?;

            let name = ctx.name().map_err(|e| driver_error(id, e))?;
            let (free, total) = result::mem_get_info().map_err(|e| driver_error(id, e))?;
            let major = ctx
                .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
                .map_err(|e| driver_error(id, e))?;
            let minor = ctx
                .attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
                .map_err(|e| driver_error(id, e))?;

            devices.push(DeviceInfo {
                id,
                name,
                total_memory: total as u64,
                free_memory: free as u64,
                compute_capability: Some((major as u32, minor as u32)),
            });
        }

        Ok(devices)
    }

    fn bind(&self, device_id: usize) -> Result<Box<dyn BoundDevice>, DeviceError> {
        let count = self.device_count()?;
        if device_id >= count {
            return Err(DeviceError::InvalidDevice { device_id, count });
        }

        let ctx = CudaContext::new(device_id).map_err(|e| driver_error(device_id, e))?;
        ctx.bind_to_thread()
            .map_err(|e| driver_error(device_id, e))?;

        let stream = ctx.default_stream();
        let rng = CudaRng::new(device_id as u64, stream.clone())
            .map_err(|e| driver_error(device_id, e))?;
        let blas = CudaBlas::new(stream.clone()).map_err(|e| driver_error(device_id, e))?;

        Ok(Box::new(CudaDevice {
            device_id,
            _ctx: ctx,
            stream,
            rng,
            blas,
            occupation: None,
            compute: None,
        }))
    }
}

struct CudaCompute {
    dim: usize,
    a: CudaSlice<f32>,
    c: CudaSlice<f32>,
}

/// A device bound by the current worker process.
pub struct CudaDevice {
    device_id: usize,
    _ctx: Arc<CudaContext>,
    stream: Arc<CudaStream>,
    rng: CudaRng,
    blas: CudaBlas,

    /// Held only to keep the memory resident.
    occupation: Option<CudaSlice<f32>>,
    compute: Option<CudaCompute>,
}

impl CudaDevice {
    fn alloc_f32(&self, elements: usize) -> Result<CudaSlice<f32>, DeviceError> {
        let bytes = elements
            .checked_mul(std::mem::size_of::<f32>())
            .ok_or_else(|| oversized(self.device_id))? as u64;
        // SAFETY: every allocation is fully written by cuRAND or cuBLAS
        // before it is read.
        unsafe { self.stream.alloc::<f32>(elements) }
            .map_err(|e| alloc_error(self.device_id, bytes, e))
    }
}

impl BoundDevice for CudaDevice {
    fn device_id(&self) -> usize {
        self.device_id
    }

    fn occupy(&mut self, shape: [usize; 3]) -> Result<(), DeviceError> {
        let elements = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| oversized(self.device_id))?;
        let mut buf = self.alloc_f32(elements)?;
        self.rng
            .fill_with_uniform(&mut buf)
            .map_err(|e| driver_error(self.device_id, e))?;

        debug!(device = self.device_id, elements, "Occupation buffer filled");
        self.occupation = Some(buf);
        Ok(())
    }

    fn prepare_compute(&mut self, dim: usize) -> Result<(), DeviceError> {
        let elements = dim
            .checked_mul(dim)
            .ok_or_else(|| oversized(self.device_id))?;
        let mut a = self.alloc_f32(elements)?;
        let c = self.alloc_f32(elements)?;
        self.rng
            .fill_with_normal(&mut a, 0.0, 1.0)
            .map_err(|e| driver_error(self.device_id, e))?;

        self.compute = Some(CudaCompute { dim, a, c });
        Ok(())
    }

    fn matmul(&mut self) -> Result<(), DeviceError> {
        let compute = self.compute.as_mut().ok_or_else(|| DeviceError::Driver {
            device_id: self.device_id,
            reason: "compute matrix not allocated".to_string(),
        })?;

        let n = compute.dim as i32;
        let cfg = GemmConfig {
            transa: cublasOperation_t::CUBLAS_OP_N,
            transb: cublasOperation_t::CUBLAS_OP_N,
            m: n,
            n,
            k: n,
            alpha: 1.0f32,
            lda: n,
            ldb: n,
            beta: 0.0f32,
            ldc: n,
        };

        // SAFETY: a and c are dim × dim f32 buffers matching cfg.
        unsafe { self.blas.gemm(cfg, &compute.a, &compute.a, &mut compute.c) }
            .map_err(|e| driver_error(self.device_id, e))
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        self.stream
            .synchronize()
            .map_err(|e| driver_error(self.device_id, e))
    }
}
