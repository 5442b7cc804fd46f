//! Single-device stress worker.
//!
//! Runs inside its own process, for exactly one device:
//! 1. Bind the device
//! 2. Occupy the requested amount of device memory
//! 3. Multiply a square matrix by itself until the duration elapses
//! 4. Report and exit
//!
//! Every failure is caught here and turned into a [`WorkerOutcome`]; a
//! worker never takes anything else down with it.

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, info_span, warn};

use crate::config::WorkerParams;
use crate::gpu::{Accelerator, BoundDevice, DeviceError};

/// Process exit code of a worker that ran out of memory during occupation.
pub const EXIT_OUT_OF_MEMORY: u8 = 10;

/// Process exit code of a worker that failed for any other reason.
pub const EXIT_FAILED: u8 = 11;

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Unstarted,
    Bound,
    MemoryAllocated,
    Computing,
    Failed,
    Done,
}

/// Statistics of a finished compute loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopStats {
    pub iterations: u64,
    pub elapsed: Duration,
}

impl LoopStats {
    /// Approximate throughput in TFLOP/s for `dim × dim` multiplies.
    pub fn tflops(&self, dim: usize) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        let flops_per_iter = 2.0 * (dim as f64).powi(3);
        flops_per_iter * self.iterations as f64 / secs / 1e12
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// The compute loop ran for the full duration.
    Completed(LoopStats),
    /// Memory occupation did not fit; the compute phase was skipped.
    OutOfMemory,
    /// Any other error, or a panic.
    Failed(String),
}

impl WorkerOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            WorkerOutcome::Completed(_) => 0,
            WorkerOutcome::OutOfMemory => EXIT_OUT_OF_MEMORY,
            WorkerOutcome::Failed(_) => EXIT_FAILED,
        }
    }
}

/// Stress worker for one device.
pub struct StressWorker<'a> {
    params: WorkerParams,
    accel: &'a dyn Accelerator,
    history: Vec<WorkerState>,
}

impl<'a> StressWorker<'a> {
    pub fn new(params: WorkerParams, accel: &'a dyn Accelerator) -> Self {
        Self {
            params,
            accel,
            history: vec![WorkerState::Unstarted],
        }
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.history
            .last()
            .copied()
            .unwrap_or(WorkerState::Unstarted)
    }

    /// Every state the worker has passed through, in order.
    pub fn history(&self) -> &[WorkerState] {
        &self.history
    }

    fn transition(&mut self, next: WorkerState) {
        self.history.push(next);
    }

    /// Run the whole stress sequence. Never panics and never returns an
    /// error; the outcome says what happened.
    pub fn run(&mut self) -> WorkerOutcome {
        let span = info_span!("worker", device = self.params.device_id);
        let _guard = span.enter();

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.drive())) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                error!(error = %err, "Stress test failed");
                WorkerOutcome::Failed(err.to_string())
            }
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(reason = %reason, "Stress test panicked");
                WorkerOutcome::Failed(format!("panic: {reason}"))
            }
        };

        if !matches!(outcome, WorkerOutcome::Completed(_)) && self.state() != WorkerState::Failed {
            self.transition(WorkerState::Failed);
        }
        self.transition(WorkerState::Done);
        outcome
    }

    fn drive(&mut self) -> Result<WorkerOutcome, DeviceError> {
        let mut device = self.accel.bind(self.params.device_id)?;
        self.transition(WorkerState::Bound);
        info!(pid = std::process::id(), backend = self.accel.name(), "Stress worker started");

        info!(mem_gb = self.params.mem_gb, "Allocating memory occupation buffer");
        let occupied = match self.params.occupation_shape() {
            Some(shape) => device.occupy(shape),
            None => Err(DeviceError::OutOfMemory {
                device_id: self.params.device_id,
                requested_bytes: u64::MAX,
            }),
        };
        match occupied {
            Ok(()) => {}
            Err(err @ DeviceError::OutOfMemory { .. }) => {
                warn!(error = %err, "Out of device memory, skipping compute phase");
                self.transition(WorkerState::Failed);
                return Ok(WorkerOutcome::OutOfMemory);
            }
            Err(err) => return Err(err),
        }
        self.transition(WorkerState::MemoryAllocated);
        info!("Memory occupation buffer allocated");

        device.prepare_compute(self.params.matrix_dim)?;
        self.transition(WorkerState::Computing);
        info!(matrix_dim = self.params.matrix_dim, "Starting matrix multiply loop");

        let stats = run_compute_loop(device.as_mut(), self.params.duration)?;
        info!(
            iterations = stats.iterations,
            elapsed_secs = stats.elapsed.as_secs_f64(),
            tflops = stats.tflops(self.params.matrix_dim),
            "Stress test complete"
        );

        Ok(WorkerOutcome::Completed(stats))
    }
}

/// Multiply until at least `duration` of wall-clock time has passed since
/// the loop started. Queued device work is drained before the final
/// measurement.
pub fn run_compute_loop(
    device: &mut dyn BoundDevice,
    duration: Duration,
) -> Result<LoopStats, DeviceError> {
    let start = Instant::now();
    let mut iterations = 0u64;

    while start.elapsed() < duration {
        device.matmul()?;
        iterations += 1;
    }
    device.synchronize()?;

    let elapsed = start.elapsed();
    debug!(device = device.device_id(), iterations, ?elapsed, "Compute loop drained");
    Ok(LoopStats { iterations, elapsed })
}

/// Run one worker to completion.
pub fn run_worker(params: WorkerParams, accel: &dyn Accelerator) -> WorkerOutcome {
    StressWorker::new(params, accel).run()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::sim::SimAccelerator;

    /// Counts calls; `matmul` never blocks.
    #[derive(Default)]
    struct CountingDevice {
        matmuls: u64,
        synced: bool,
    }

    impl BoundDevice for CountingDevice {
        fn device_id(&self) -> usize {
            0
        }

        fn occupy(&mut self, _shape: [usize; 3]) -> Result<(), DeviceError> {
            Ok(())
        }

        fn prepare_compute(&mut self, _dim: usize) -> Result<(), DeviceError> {
            Ok(())
        }

        fn matmul(&mut self) -> Result<(), DeviceError> {
            self.matmuls += 1;
            Ok(())
        }

        fn synchronize(&mut self) -> Result<(), DeviceError> {
            self.synced = true;
            Ok(())
        }
    }

    fn params(device_id: usize, duration_ms: u64, mem_gb: u64) -> WorkerParams {
        WorkerParams {
            device_id,
            duration: Duration::from_millis(duration_ms),
            mem_gb,
            matrix_dim: 16,
        }
    }

    #[test]
    fn test_compute_loop_never_undershoots() {
        let mut dev = CountingDevice::default();
        let duration = Duration::from_millis(200);

        let stats = run_compute_loop(&mut dev, duration).unwrap();

        assert!(stats.elapsed >= duration);
        assert_eq!(stats.iterations, dev.matmuls);
        assert!(stats.iterations > 0);
        assert!(dev.synced);
    }

    #[test]
    fn test_compute_loop_zero_duration() {
        let mut dev = CountingDevice::default();
        let stats = run_compute_loop(&mut dev, Duration::ZERO).unwrap();
        assert_eq!(stats.iterations, 0);
        assert!(dev.synced);
    }

    #[test]
    fn test_worker_completes() {
        let accel = SimAccelerator::new(2, 2);
        let mut worker = StressWorker::new(params(1, 50, 1), &accel);

        let outcome = worker.run();

        assert!(matches!(outcome, WorkerOutcome::Completed(_)));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(
            worker.history(),
            &[
                WorkerState::Unstarted,
                WorkerState::Bound,
                WorkerState::MemoryAllocated,
                WorkerState::Computing,
                WorkerState::Done,
            ]
        );
    }

    #[test]
    fn test_out_of_memory_skips_compute() {
        let accel = SimAccelerator::new(1, 2);
        let mut worker = StressWorker::new(params(0, 50, 4), &accel);

        let outcome = worker.run();

        assert_eq!(outcome, WorkerOutcome::OutOfMemory);
        assert_eq!(outcome.exit_code(), EXIT_OUT_OF_MEMORY);
        assert_eq!(
            worker.history(),
            &[
                WorkerState::Unstarted,
                WorkerState::Bound,
                WorkerState::Failed,
                WorkerState::Done,
            ]
        );
    }

    #[test]
    fn test_oversized_occupation_is_out_of_memory() {
        let accel = SimAccelerator::new(1, 16);
        let mut worker = StressWorker::new(params(0, 10, 1 << 44), &accel);

        let outcome = worker.run();

        assert_eq!(outcome, WorkerOutcome::OutOfMemory);
        assert!(!worker.history().contains(&WorkerState::Computing));
    }

    #[test]
    fn test_invalid_device_fails_quietly() {
        let accel = SimAccelerator::new(1, 2);
        let mut worker = StressWorker::new(params(7, 50, 1), &accel);

        let outcome = worker.run();

        assert!(matches!(outcome, WorkerOutcome::Failed(_)));
        assert_eq!(outcome.exit_code(), EXIT_FAILED);
        assert_eq!(
            worker.history(),
            &[WorkerState::Unstarted, WorkerState::Failed, WorkerState::Done]
        );
    }

    #[test]
    fn test_tflops() {
        let stats = LoopStats {
            iterations: 1000,
            elapsed: Duration::from_secs(2),
        };
        // 2 * 1000^3 * 1000 / 2 s = 1e12 FLOP/s
        assert!((stats.tflops(1000) - 1.0).abs() < 1e-9);

        let idle = LoopStats {
            iterations: 0,
            elapsed: Duration::ZERO,
        };
        assert_eq!(idle.tflops(4000), 0.0);
    }
}
