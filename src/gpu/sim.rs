//! Simulated accelerator.
//!
//! Models a fixed number of devices with a fixed memory capacity each.
//! Memory occupation is accounted against that capacity rather than
//! materialized (a multi-gigabyte host buffer per worker would exhaust the
//! machine running the tests). The compute matrix is real host memory and
//! is multiplied on the CPU, so keep `--matrix-dim` small with this backend.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use super::device::DeviceInfo;
use super::{Accelerator, BoundDevice, DeviceError};

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;
const F32_BYTES: u64 = std::mem::size_of::<f32>() as u64;

/// A runtime reporting `devices` identical devices of `mem_gb` gigabytes.
#[derive(Debug, Clone)]
pub struct SimAccelerator {
    devices: usize,
    capacity_bytes: u64,
}

impl SimAccelerator {
    pub fn new(devices: usize, mem_gb: u64) -> Self {
        Self {
            devices,
            capacity_bytes: mem_gb.saturating_mul(BYTES_PER_GB),
        }
    }
}

impl Accelerator for SimAccelerator {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn device_count(&self) -> Result<usize, DeviceError> {
        Ok(self.devices)
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>, DeviceError> {
        Ok((0..self.devices)
            .map(|id| DeviceInfo {
                id,
                name: format!("Simulated device {id}"),
                total_memory: self.capacity_bytes,
                free_memory: self.capacity_bytes,
                compute_capability: None,
            })
            .collect())
    }

    fn bind(&self, device_id: usize) -> Result<Box<dyn BoundDevice>, DeviceError> {
        if device_id >= self.devices {
            return Err(DeviceError::InvalidDevice {
                device_id,
                count: self.devices,
            });
        }

        Ok(Box::new(SimDevice {
            device_id,
            capacity_bytes: self.capacity_bytes,
            reserved_bytes: 0,
            rng: ChaCha8Rng::seed_from_u64(device_id as u64),
            compute: None,
        }))
    }
}

/// Host-side compute buffers.
struct SimCompute {
    dim: usize,
    a: Vec<f32>,
    c: Vec<f32>,
}

pub struct SimDevice {
    device_id: usize,
    capacity_bytes: u64,
    reserved_bytes: u64,
    rng: ChaCha8Rng,
    compute: Option<SimCompute>,
}

impl SimDevice {
    fn reserve(&mut self, bytes: u64) -> Result<(), DeviceError> {
        let reserved = self
            .reserved_bytes
            .checked_add(bytes)
            .filter(|&total| total <= self.capacity_bytes)
            .ok_or(DeviceError::OutOfMemory {
                device_id: self.device_id,
                requested_bytes: bytes,
            })?;
        self.reserved_bytes = reserved;
        debug!(
            device = self.device_id,
            bytes,
            reserved = self.reserved_bytes,
            "Reserved simulated device memory"
        );
        Ok(())
    }
}

impl BoundDevice for SimDevice {
    fn device_id(&self) -> usize {
        self.device_id
    }

    fn occupy(&mut self, shape: [usize; 3]) -> Result<(), DeviceError> {
        let bytes = shape
            .iter()
            .try_fold(F32_BYTES, |acc, &d| acc.checked_mul(d as u64));
        self.reserve(bytes.unwrap_or(u64::MAX))
    }

    fn prepare_compute(&mut self, dim: usize) -> Result<(), DeviceError> {
        let elements = dim.checked_mul(dim).ok_or(DeviceError::OutOfMemory {
            device_id: self.device_id,
            requested_bytes: u64::MAX,
        })?;
        let bytes = (elements as u64)
            .checked_mul(2 * F32_BYTES)
            .unwrap_or(u64::MAX);
        self.reserve(bytes)?;

        let a = (0..elements)
            .map(|_| self.rng.gen_range(-1.0f32..1.0))
            .collect();
        self.compute = Some(SimCompute {
            dim,
            a,
            c: vec![0.0; elements],
        });
        Ok(())
    }

    fn matmul(&mut self) -> Result<(), DeviceError> {
        let compute = self.compute.as_mut().ok_or_else(|| DeviceError::Driver {
            device_id: self.device_id,
            reason: "compute matrix not allocated".to_string(),
        })?;
        host_matmul(&compute.a, &compute.a, &mut compute.c, compute.dim);
        Ok(())
    }

    fn synchronize(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// `c = a × b` for row-major `n × n` matrices.
pub fn host_matmul(a: &[f32], b: &[f32], c: &mut [f32], n: usize) {
    c.fill(0.0);
    for i in 0..n {
        let row = &mut c[i * n..(i + 1) * n];
        for k in 0..n {
            let aik = a[i * n + k];
            let b_row = &b[k * n..(k + 1) * n];
            for (out, &bkj) in row.iter_mut().zip(b_row) {
                *out += aik * bkj;
            }
        }
    }
}
