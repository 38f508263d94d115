//! Hardware-free backend for exercising the pipeline in tests

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::device::{AudioBackend, DeviceBinding, DuplexStream};
use super::error::PipelineError;
use super::passthrough::{PassthroughCallback, StreamStatus};

const BLOCK_FRAMES: usize = 64;

/// Counters and fault switches shared by a [`MockBackend`] and its streams
#[derive(Debug, Default)]
pub struct MockStats {
    opens: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    blocks: AtomicU64,
    mismatched: AtomicU64,
    flagged: AtomicU64,
    closing: AtomicUsize,
    close_delay_ms: AtomicU64,
    fail_next_open: Mutex<Option<String>>,
    runtime_failure: Mutex<Option<String>>,
}

impl MockStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Streams currently open
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Most streams ever open at once
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::SeqCst)
    }

    /// Blocks whose output differed from their input
    pub fn mismatched_blocks(&self) -> u64 {
        self.mismatched.load(Ordering::SeqCst)
    }

    /// Blocks delivered with a non-empty status
    pub fn flagged_blocks(&self) -> u64 {
        self.flagged.load(Ordering::SeqCst)
    }

    /// Streams currently inside their `Drop`
    pub fn closing(&self) -> usize {
        self.closing.load(Ordering::SeqCst)
    }

    /// Make every stream take `delay` to release its device
    pub fn set_close_delay(&self, delay: Duration) {
        self.close_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_next_open(&self, reason: &str) {
        *self.fail_next_open.lock().unwrap() = Some(reason.to_string());
    }

    pub fn inject_runtime_failure(&self, reason: &str) {
        *self.runtime_failure.lock().unwrap() = Some(reason.to_string());
    }
}

/// Backend whose "engine" is a plain thread feeding a test signal
#[derive(Default)]
pub struct MockBackend {
    stats: Arc<MockStats>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

pub struct MockStream {
    running: Arc<AtomicBool>,
    engine: Option<thread::JoinHandle<()>>,
    stats: Arc<MockStats>,
}

impl DuplexStream for MockStream {
    fn poll_failure(&mut self) -> Option<PipelineError> {
        self.stats
            .runtime_failure
            .lock()
            .unwrap()
            .take()
            .map(PipelineError::StreamRuntime)
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.stats.closing.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        if let Some(engine) = self.engine.take() {
            let _ = engine.join();
        }
        let delay = self.stats.close_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
        self.stats.live.fetch_sub(1, Ordering::SeqCst);
        self.stats.closing.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AudioBackend for MockBackend {
    type Stream = MockStream;

    fn open_duplex(
        &self,
        binding: &DeviceBinding,
        _sample_rate: u32,
        callback: PassthroughCallback,
    ) -> Result<Self::Stream, PipelineError> {
        binding.validate()?;
        if let Some(reason) = self.stats.fail_next_open.lock().unwrap().take() {
            return Err(PipelineError::DeviceOpen(reason));
        }

        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        let now_live = self.stats.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_live.fetch_max(now_live, Ordering::SeqCst);

        let running = Arc::new(AtomicBool::new(true));
        let engine = {
            let running = Arc::clone(&running);
            let stats = Arc::clone(&self.stats);
            let channels = binding.channels as usize;
            thread::spawn(move || {
                let mut input = vec![0.0f32; BLOCK_FRAMES * channels];
                let mut output = vec![0.0f32; BLOCK_FRAMES * channels];
                let mut block = 0u64;

                while running.load(Ordering::SeqCst) {
                    let input_len = input.len();
                    for (i, sample) in input.iter_mut().enumerate() {
                        *sample = ((block as usize * input_len + i) as f32 * 0.01).sin();
                    }
                    let status = StreamStatus {
                        input_overflow: block % 4 == 1,
                        output_underflow: block % 4 == 3,
                    };
                    if !status.is_empty() {
                        stats.flagged.fetch_add(1, Ordering::SeqCst);
                    }

                    callback.process(&input, &mut output, BLOCK_FRAMES, status);

                    if output != input {
                        stats.mismatched.fetch_add(1, Ordering::SeqCst);
                    }
                    stats.blocks.fetch_add(1, Ordering::SeqCst);
                    block += 1;
                    thread::sleep(Duration::from_micros(500));
                }
            })
        };

        Ok(MockStream {
            running,
            engine: Some(engine),
            stats: Arc::clone(&self.stats),
        })
    }
}
