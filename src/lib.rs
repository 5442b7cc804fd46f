//! gpu-stress: concurrent multi-GPU burn-in.
//!
//! Occupies a target amount of memory on each selected device and keeps it
//! busy with back-to-back dense matrix multiplies for a fixed duration.
//! Every device is driven by its own worker process:
//!   orchestrator → (device id, duration, memory size) → worker
//!
//! Workers report only through log lines and their exit status.

pub mod config;
pub mod gpu;
pub mod stress;
