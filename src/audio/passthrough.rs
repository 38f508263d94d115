//! The per-block passthrough callback
//!
//! The audio engine invokes [`PassthroughCallback::process`] on its own
//! real-time thread once per block. The callback copies input to output
//! unmodified and records any engine status flags in a [`StatusMonitor`].
//!
//! ## Real-time rules
//!
//! The callback never blocks, allocates or logs. Status flags are counted
//! with relaxed atomics and drained by the pipeline thread, which turns them
//! into log diagnostics at its own pace.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Status flags the engine attaches to a block
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamStatus {
    /// Input samples were dropped before reaching the callback
    pub input_overflow: bool,
    /// The output block could not be fully filled from input
    pub output_underflow: bool,
}

impl StreamStatus {
    #[cfg(test)]
    pub const OK: Self = Self {
        input_overflow: false,
        output_underflow: false,
    };

    pub fn is_empty(&self) -> bool {
        !self.input_overflow && !self.output_underflow
    }
}

/// Flagged-block counters shared between the engine and the pipeline thread
#[derive(Debug, Default)]
pub struct StatusMonitor {
    input_overflows: AtomicU64,
    output_underflows: AtomicU64,
    blocks: AtomicU64,
}

/// Counts drained from a [`StatusMonitor`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub input_overflows: u64,
    pub output_underflows: u64,
}

impl StatusReport {
    pub fn is_empty(&self) -> bool {
        self.input_overflows == 0 && self.output_underflows == 0
    }
}

impl StatusMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one processed block and its status
    #[inline]
    pub fn record(&self, status: StreamStatus) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        if status.input_overflow {
            self.input_overflows.fetch_add(1, Ordering::Relaxed);
        }
        if status.output_underflow {
            self.output_underflows.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Take the flagged-block counts accumulated since the last call
    pub fn take(&self) -> StatusReport {
        StatusReport {
            input_overflows: self.input_overflows.swap(0, Ordering::Relaxed),
            output_underflows: self.output_underflows.swap(0, Ordering::Relaxed),
        }
    }

    /// Total blocks processed (for statistics)
    pub fn blocks_processed(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }
}

/// Identity transform from the input block to the output block
pub struct PassthroughCallback {
    channels: usize,
    monitor: Arc<StatusMonitor>,
}

impl PassthroughCallback {
    pub fn new(channels: u16, monitor: Arc<StatusMonitor>) -> Self {
        Self {
            channels: channels as usize,
            monitor,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Copy `frames` interleaved frames from `input` to `output`.
    ///
    /// Buffers shorter than `frames * channels` are a contract violation by
    /// the engine; whatever input exists is copied and the rest of the
    /// output is silenced instead of panicking on the audio thread.
    #[inline]
    pub fn process(&self, input: &[f32], output: &mut [f32], frames: usize, status: StreamStatus) {
        self.monitor.record(status);

        let wanted = (frames * self.channels).min(output.len());
        let copied = wanted.min(input.len());
        output[..copied].copy_from_slice(&input[..copied]);
        output[copied..wanted].fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| (i as f32 * 0.37).sin()).collect()
    }

    #[test]
    fn test_identity_across_shapes() {
        for channels in 1..=8u16 {
            let callback = PassthroughCallback::new(channels, Arc::new(StatusMonitor::new()));
            for frames in [0usize, 1, 2, 63, 64, 256, 1000] {
                let input = ramp(frames * channels as usize);
                let mut output = vec![f32::NAN; input.len()];
                callback.process(&input, &mut output, frames, StreamStatus::OK);
                assert_eq!(output, input, "channels={} frames={}", channels, frames);
            }
        }
    }

    #[test]
    fn test_status_does_not_change_copy() {
        let monitor = Arc::new(StatusMonitor::new());
        let callback = PassthroughCallback::new(2, Arc::clone(&monitor));
        let input = ramp(32);
        let mut output = vec![0.0; 32];

        let status = StreamStatus {
            input_overflow: true,
            output_underflow: true,
        };
        callback.process(&input, &mut output, 16, status);

        assert_eq!(output, input);
        let report = monitor.take();
        assert_eq!(report.input_overflows, 1);
        assert_eq!(report.output_underflows, 1);
        assert_eq!(monitor.blocks_processed(), 1);
    }

    #[test]
    fn test_only_given_frames_are_written() {
        let callback = PassthroughCallback::new(1, Arc::new(StatusMonitor::new()));
        let input = [1.0, 2.0, 3.0, 4.0];
        let mut output = [9.0; 4];
        callback.process(&input, &mut output, 2, StreamStatus::OK);
        assert_eq!(output, [1.0, 2.0, 9.0, 9.0]);
    }

    #[test]
    fn test_short_input_is_padded_with_silence() {
        let callback = PassthroughCallback::new(2, Arc::new(StatusMonitor::new()));
        let input = [0.5, -0.5];
        let mut output = [1.0; 6];
        callback.process(&input, &mut output, 3, StreamStatus::OK);
        assert_eq!(output, [0.5, -0.5, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_monitor_take_resets() {
        let monitor = StatusMonitor::new();
        monitor.record(StreamStatus {
            input_overflow: true,
            output_underflow: false,
        });
        monitor.record(StreamStatus::OK);

        let report = monitor.take();
        assert_eq!(report.input_overflows, 1);
        assert_eq!(report.output_underflows, 0);
        assert!(monitor.take().is_empty());
        assert_eq!(monitor.blocks_processed(), 2);
    }
}
