//! Device discovery and information.
//!
//! Probes the selected runtime for devices before any worker launches.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Accelerator, DeviceError};

/// Information about a single accelerator device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device index.
    pub id: usize,

    /// Device name (e.g., "NVIDIA GeForce GTX 1070").
    pub name: String,

    /// Total memory in bytes.
    pub total_memory: u64,

    /// Free memory in bytes (at detection time).
    pub free_memory: u64,

    /// Compute capability (major, minor), when the runtime has one.
    pub compute_capability: Option<(u32, u32)>,
}

/// Check that an accelerator runtime is present and has at least one device.
///
/// Returns the device count.
pub fn probe(accel: &dyn Accelerator) -> Result<usize, DeviceError> {
    let count = accel.device_count()?;
    if count == 0 {
        return Err(DeviceError::Unavailable(format!(
            "{} runtime reports no devices",
            accel.name()
        )));
    }

    info!(backend = accel.name(), count, "Accelerator runtime detected");
    Ok(count)
}

/// Render detected devices as pretty JSON.
pub fn devices_json(accel: &dyn Accelerator) -> anyhow::Result<String> {
    let devices = accel.devices()?;
    Ok(serde_json::to_string_pretty(&devices)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::sim::SimAccelerator;

    #[test]
    fn test_probe_counts_devices() {
        let accel = SimAccelerator::new(2, 8);
        assert_eq!(probe(&accel).unwrap(), 2);
    }

    #[test]
    fn test_probe_rejects_empty_runtime() {
        let accel = SimAccelerator::new(0, 8);
        assert!(matches!(probe(&accel), Err(DeviceError::Unavailable(_))));
    }

    #[test]
    fn test_devices_json() {
        let accel = SimAccelerator::new(2, 8);
        let json = devices_json(&accel).unwrap();
        let parsed: Vec<DeviceInfo> = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].id, 1);
        assert_eq!(parsed[0].total_memory, 8 * 1024 * 1024 * 1024);
        assert_eq!(parsed[0].compute_capability, None);
    }
}
