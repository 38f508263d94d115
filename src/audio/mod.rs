//! Audio module - real-time input to output passthrough
//!
//! This module provides:
//! - The per-block passthrough callback
//! - Device binding and the cpal duplex backend
//! - The start/stop pipeline that owns the live stream

mod device;
mod error;
#[cfg(test)]
mod mock;
mod passthrough;
mod pipeline;

pub use device::{CpalBackend, DeviceBinding, DeviceSelector, MAX_LATENCY};
pub use pipeline::{ActivityState, AudioPipeline, RunOutcome, DEFAULT_POLL_INTERVAL};
