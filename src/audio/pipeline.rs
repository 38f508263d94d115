//! Passthrough pipeline lifecycle
//!
//! [`AudioPipeline::start`] opens the duplex stream and then parks its thread
//! in a sleep-and-recheck loop until [`AudioPipeline::stop`] clears the
//! activity state from another thread. The stream is owned by the thread
//! inside `start` and is dropped there on every exit path.
//!
//! ## Stop latency
//!
//! `stop` only flips the state; the running `start` notices it on its next
//! poll, so the stream closes at most one poll interval (10 ms by default)
//! after `stop` returns.
//!
//! ## When the state becomes Running
//!
//! `start` marks the pipeline Running before the device is opened, so the
//! state reads Running (with no stream yet) while the open is in progress.
//! A `stop` arriving during the open then still lands: the loop sees Idle on
//! its first check and closes the freshly opened stream. If the open fails
//! the state goes straight to Error.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::device::{AudioBackend, CpalBackend, DeviceBinding, DuplexStream, SAMPLE_RATE};
use super::error::PipelineError;
use super::passthrough::{PassthroughCallback, StatusMonitor};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Whether the pipeline has a stream open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityState {
    #[default]
    Idle,
    Running,
    /// The last run failed. Behaves like `Idle` for a new `start`.
    Error,
}

impl ActivityState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Error,
            _ => Self::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Running => 1,
            Self::Error => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Running => "Running",
            Self::Error => "Error",
        }
    }
}

/// Atomic cell holding an [`ActivityState`]
#[derive(Debug, Default)]
struct StateCell(AtomicU8);

impl StateCell {
    fn load(&self) -> ActivityState {
        ActivityState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: ActivityState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }

    fn swap(&self, state: ActivityState) -> ActivityState {
        ActivityState::from_u8(self.0.swap(state.as_u8(), Ordering::AcqRel))
    }

    fn transition(&self, from: ActivityState, to: ActivityState) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// How a call to [`AudioPipeline::start`] ended
#[derive(Debug)]
pub enum RunOutcome {
    /// Another run owns the stream; nothing was opened
    AlreadyActive,
    /// Ran until `stop` was called
    Stopped,
    /// Opening or running the stream failed; state is now `Error`
    Failed(PipelineError),
}

/// Held by the thread inside `start` for as long as it may own a stream.
///
/// Dropping it leaves `Running` (if still set) for `Idle` and frees the
/// pipeline for the next `start`.
struct RunLease<'a> {
    owned: &'a AtomicBool,
    state: &'a StateCell,
}

impl<'a> RunLease<'a> {
    fn acquire(owned: &'a AtomicBool, state: &'a StateCell) -> Option<Self> {
        owned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { owned, state })
    }
}

impl Drop for RunLease<'_> {
    fn drop(&mut self) {
        self.state
            .transition(ActivityState::Running, ActivityState::Idle);
        self.owned.store(false, Ordering::Release);
    }
}

/// Real-time microphone-to-speaker passthrough
pub struct AudioPipeline<B: AudioBackend = CpalBackend> {
    binding: DeviceBinding,
    backend: B,
    state: StateCell,
    /// Set while a thread is inside the running section of `start`
    owned: AtomicBool,
    poll_interval: Duration,
    monitor: Arc<StatusMonitor>,
    last_failure: Mutex<Option<String>>,
}

impl<B: AudioBackend> AudioPipeline<B> {
    pub fn new(binding: DeviceBinding, backend: B) -> Self {
        Self {
            binding,
            backend,
            state: StateCell::default(),
            owned: AtomicBool::new(false),
            poll_interval: DEFAULT_POLL_INTERVAL,
            monitor: Arc::new(StatusMonitor::new()),
            last_failure: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn binding(&self) -> &DeviceBinding {
        &self.binding
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn state(&self) -> ActivityState {
        self.state.load()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ActivityState::Running
    }

    /// Cause of the most recent failed run, cleared by the next successful open
    pub fn last_failure(&self) -> Option<String> {
        self.last_failure
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or(None)
    }

    /// Blocks completed by the audio engine since construction
    pub fn blocks_processed(&self) -> u64 {
        self.monitor.blocks_processed()
    }

    /// Open the stream and run until [`stop`](Self::stop) is called.
    ///
    /// Blocks the calling thread for the whole run; use
    /// [`spawn`](Self::spawn) from a UI thread. Never panics on device
    /// failures: they are logged, recorded and reported in the outcome.
    pub fn start(&self) -> RunOutcome {
        let Some(_lease) = RunLease::acquire(&self.owned, &self.state) else {
            log::info!("Pipeline already active");
            return RunOutcome::AlreadyActive;
        };

        self.state.store(ActivityState::Running);
        log::info!("Pipeline started");

        match self.run() {
            Ok(()) => {
                log::info!("Pipeline stopped");
                RunOutcome::Stopped
            }
            Err(e) => {
                log::error!("Error in pipeline: {}", e);
                self.state.store(ActivityState::Error);
                self.set_failure(Some(e.to_string()));
                RunOutcome::Failed(e)
            }
        }
    }

    /// Body of a run; the stream is dropped before this returns
    fn run(&self) -> Result<(), PipelineError> {
        let callback = PassthroughCallback::new(self.binding.channels, Arc::clone(&self.monitor));
        let mut stream = self
            .backend
            .open_duplex(&self.binding, SAMPLE_RATE, callback)?;
        self.set_failure(None);

        while self.state.load() == ActivityState::Running {
            if let Some(e) = stream.poll_failure() {
                return Err(e);
            }
            self.report_status();
            thread::sleep(self.poll_interval);
        }
        self.report_status();
        Ok(())
    }

    /// Log engine block flags collected since the last poll
    fn report_status(&self) {
        let report = self.monitor.take();
        if report.is_empty() {
            return;
        }
        if report.input_overflows > 0 {
            log::warn!("input overflow ({} blocks)", report.input_overflows);
        }
        if report.output_underflows > 0 {
            log::warn!("output underflow ({} blocks)", report.output_underflows);
        }
    }

    fn set_failure(&self, failure: Option<String>) {
        if let Ok(mut guard) = self.last_failure.lock() {
            *guard = failure;
        }
    }

    /// Ask a running `start` to close its stream and return.
    ///
    /// Does not wait for the stream to close. Harmless when idle.
    pub fn stop(&self) {
        match self.state.swap(ActivityState::Idle) {
            ActivityState::Running => log::info!("Stopping pipeline"),
            _ => log::info!("Stopping pipeline (not active)"),
        }
    }
}

impl<B: AudioBackend + 'static> AudioPipeline<B> {
    /// Run [`start`](Self::start) on a dedicated thread
    pub fn spawn(self: &Arc<Self>) -> Result<thread::JoinHandle<RunOutcome>, PipelineError> {
        let pipeline = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("passthrough".to_string())
            .spawn(move || pipeline.start())?;
        Ok(handle)
    }
}
