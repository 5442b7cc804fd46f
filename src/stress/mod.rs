//! The stress test itself.
//!
//! - [`orchestrator`]: resolves devices, launches and joins worker processes
//! - [`worker`]: binds one device, occupies memory, runs the compute loop

pub mod orchestrator;
pub mod worker;
