//! Device binding and the duplex stream backend
//!
//! cpal has no portable full-duplex stream, so [`CpalBackend`] opens one
//! input stream and one output stream and bridges them with a lock-free SPSC
//! ring buffer. The output callback drains the ring into a scratch block and
//! hands both blocks to the [`PassthroughCallback`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapRb,
};
use serde::{Deserialize, Serialize};

use super::error::PipelineError;
use super::passthrough::{PassthroughCallback, StreamStatus};

/// Session sample rate in Hz
pub const SAMPLE_RATE: u32 = 44_100;

/// Frames per scratch block handed to the callback
const SCRATCH_FRAMES: usize = 4096;

/// How a device is picked from the host
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceSelector {
    #[default]
    Default,
    Named(String),
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Input/output devices and channel count, fixed for a pipeline's lifetime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceBinding {
    pub input: DeviceSelector,
    pub output: DeviceSelector,
    pub channels: u16,
}

impl DeviceBinding {
    pub fn new(input: DeviceSelector, output: DeviceSelector, channels: u16) -> Self {
        Self {
            input,
            output,
            channels,
        }
    }

    /// Reject bindings no device could satisfy
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.channels == 0 {
            return Err(PipelineError::InvalidChannels(self.channels));
        }
        Ok(())
    }
}

impl Default for DeviceBinding {
    fn default() -> Self {
        Self::new(DeviceSelector::Default, DeviceSelector::Default, 1)
    }
}

/// A live duplex stream. Dropping it releases the hardware.
pub trait DuplexStream {
    /// Return a runtime failure raised by the engine since the last call
    fn poll_failure(&mut self) -> Option<PipelineError>;
}

/// Opens duplex streams that drive a [`PassthroughCallback`]
pub trait AudioBackend: Send + Sync {
    type Stream: DuplexStream;

    fn open_duplex(
        &self,
        binding: &DeviceBinding,
        sample_rate: u32,
        callback: PassthroughCallback,
    ) -> Result<Self::Stream, PipelineError>;
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Input,
    Output,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

/// Longest silence prefill the bridge accepts
pub const MAX_LATENCY: Duration = Duration::from_secs(1);

#[inline]
fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

#[inline]
fn f32_to_i16(sample: f32) -> i16 {
    (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Input half of the bridge, owned by the capture callback
struct CaptureSide {
    producer: ringbuf::HeapProd<f32>,
    overflowed: Arc<AtomicBool>,
}

impl CaptureSide {
    #[inline]
    fn capture(&mut self, data: &[f32]) {
        // Non-blocking push - samples that don't fit are dropped
        if self.producer.push_slice(data) < data.len() {
            self.overflowed.store(true, Ordering::Relaxed);
        }
    }

    #[inline]
    fn capture_i16(&mut self, data: &[i16]) {
        let pushed = self
            .producer
            .push_iter(data.iter().map(|&s| i16_to_f32(s)));
        if pushed < data.len() {
            self.overflowed.store(true, Ordering::Relaxed);
        }
    }
}

/// Output half of the bridge, owned by the render callback
struct RenderSide {
    consumer: ringbuf::HeapCons<f32>,
    overflowed: Arc<AtomicBool>,
    scratch: Vec<f32>,
    /// Output staging for devices that don't render f32
    staging: Vec<f32>,
    callback: PassthroughCallback,
}

impl RenderSide {
    #[inline]
    fn render(&mut self, data: &mut [f32]) {
        let block = self.scratch.len();
        for out in data.chunks_mut(block) {
            self.render_block(out);
        }
    }

    #[inline]
    fn render_i16(&mut self, data: &mut [i16]) {
        let block = self.scratch.len();
        // Taking the Vec out and back never reallocates
        let mut staging = std::mem::take(&mut self.staging);
        for out in data.chunks_mut(block) {
            let staged = &mut staging[..out.len()];
            self.render_block(staged);
            for (dst, &src) in out.iter_mut().zip(staged.iter()) {
                *dst = f32_to_i16(src);
            }
        }
        self.staging = staging;
    }

    /// Pull one block of at most `scratch.len()` samples through the callback
    #[inline]
    fn render_block(&mut self, out: &mut [f32]) {
        let channels = self.callback.channels().max(1);
        let len = out.len();
        let got = self.consumer.pop_slice(&mut self.scratch[..len]);
        self.scratch[got..len].fill(0.0);

        let status = StreamStatus {
            input_overflow: self.overflowed.swap(false, Ordering::Relaxed),
            output_underflow: got < len,
        };
        self.callback
            .process(&self.scratch[..len], out, len / channels, status);
    }
}

/// Prefill length in frames for `latency` at `sample_rate`
fn latency_frames(latency: Duration, sample_rate: u32) -> Result<usize, PipelineError> {
    if latency > MAX_LATENCY {
        return Err(PipelineError::DeviceOpen(format!(
            "latency {} ms exceeds {} ms",
            latency.as_millis(),
            MAX_LATENCY.as_millis()
        )));
    }
    let frames = latency.as_micros() * sample_rate as u128 / 1_000_000;
    usize::try_from(frames)
        .map_err(|_| PipelineError::DeviceOpen(format!("latency of {} frames", frames)))
}

/// Build the ring bridge, pre-filled with `latency_frames` of silence
fn bridge(
    callback: PassthroughCallback,
    latency_frames: usize,
) -> Result<(CaptureSide, RenderSide), PipelineError> {
    let channels = callback.channels().max(1);
    let too_large = || PipelineError::DeviceOpen(format!("latency of {} frames", latency_frames));
    let latency_samples = latency_frames.checked_mul(channels).ok_or_else(too_large)?;
    let capacity = latency_samples
        .checked_mul(2)
        .ok_or_else(too_large)?
        .max(SCRATCH_FRAMES * channels * 2);

    let rb = HeapRb::<f32>::new(capacity);
    let (mut producer, consumer) = rb.split();
    let prefilled = producer.push_iter(std::iter::repeat(0.0).take(latency_samples));
    if prefilled < latency_samples {
        return Err(too_large());
    }

    let overflowed = Arc::new(AtomicBool::new(false));
    let capture = CaptureSide {
        producer,
        overflowed: Arc::clone(&overflowed),
    };
    let render = RenderSide {
        consumer,
        overflowed,
        scratch: vec![0.0; SCRATCH_FRAMES * channels],
        staging: vec![0.0; SCRATCH_FRAMES * channels],
        callback,
    };
    Ok((capture, render))
}

/// Pick the sample format to build a stream with, preferring f32 then i16
fn choose_format(
    offered: impl IntoIterator<Item = cpal::SampleFormat>,
    direction: Direction,
    channels: u16,
    sample_rate: u32,
) -> Result<cpal::SampleFormat, PipelineError> {
    let offered: Vec<cpal::SampleFormat> = offered.into_iter().collect();
    for wanted in [cpal::SampleFormat::F32, cpal::SampleFormat::I16] {
        if offered.contains(&wanted) {
            return Ok(wanted);
        }
    }
    match offered.first() {
        Some(format) => Err(PipelineError::DeviceOpen(format!(
            "Unsupported {} format: {:?}",
            direction.label(),
            format
        ))),
        None => Err(PipelineError::DeviceOpen(format!(
            "{} device has no config with {} channel(s) at {} Hz",
            direction.label(),
            channels,
            sample_rate
        ))),
    }
}

/// Error callback forwarding stream failures to the owning thread
fn error_callback(
    tx: mpsc::Sender<String>,
    direction: Direction,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        log::error!("{} stream error: {}", direction.label(), err);
        let _ = tx.send(err.to_string());
    }
}

/// Production backend on top of cpal
pub struct CpalBackend {
    latency: Duration,
}

impl CpalBackend {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }

    fn resolve(
        host: &cpal::Host,
        selector: &DeviceSelector,
        direction: Direction,
    ) -> Result<cpal::Device, PipelineError> {
        let name = match selector {
            DeviceSelector::Default => {
                let device = match direction {
                    Direction::Input => host.default_input_device(),
                    Direction::Output => host.default_output_device(),
                };
                return device.ok_or(PipelineError::NoDefaultDevice(direction.label()));
            }
            DeviceSelector::Named(name) => name,
        };

        let devices: Vec<cpal::Device> = match direction {
            Direction::Input => host.input_devices().map(|d| d.collect()),
            Direction::Output => host.output_devices().map(|d| d.collect()),
        }
        .map_err(|e| PipelineError::DeviceOpen(e.to_string()))?;

        devices
            .into_iter()
            .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
            .ok_or_else(|| PipelineError::DeviceNotFound(name.clone()))
    }

    /// Sample format the device supports at `channels` and `sample_rate`
    fn sample_format(
        device: &cpal::Device,
        direction: Direction,
        channels: u16,
        sample_rate: u32,
    ) -> Result<cpal::SampleFormat, PipelineError> {
        let rate = cpal::SampleRate(sample_rate);
        let matches = |c: &cpal::SupportedStreamConfigRange| {
            c.channels() == channels && c.min_sample_rate() <= rate && rate <= c.max_sample_rate()
        };
        let offered: Vec<cpal::SampleFormat> = match direction {
            Direction::Input => device
                .supported_input_configs()
                .map(|configs| configs.filter(matches).map(|c| c.sample_format()).collect()),
            Direction::Output => device
                .supported_output_configs()
                .map(|configs| configs.filter(matches).map(|c| c.sample_format()).collect()),
        }
        .map_err(|e| PipelineError::DeviceOpen(e.to_string()))?;

        choose_format(offered, direction, channels, sample_rate)
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

/// A running input/output stream pair
pub struct CpalDuplexStream {
    _input: cpal::Stream,
    _output: cpal::Stream,
    failures: Receiver<String>,
}

impl DuplexStream for CpalDuplexStream {
    fn poll_failure(&mut self) -> Option<PipelineError> {
        match self.failures.try_recv() {
            Ok(msg) => Some(PipelineError::StreamRuntime(msg)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

impl AudioBackend for CpalBackend {
    type Stream = CpalDuplexStream;

    fn open_duplex(
        &self,
        binding: &DeviceBinding,
        sample_rate: u32,
        callback: PassthroughCallback,
    ) -> Result<Self::Stream, PipelineError> {
        binding.validate()?;

        let host = cpal::default_host();
        let input_device = Self::resolve(&host, &binding.input, Direction::Input)?;
        let output_device = Self::resolve(&host, &binding.output, Direction::Output)?;

        log::info!(
            "Using input device: {}",
            input_device.name().unwrap_or_else(|_| "Unknown".to_string())
        );
        log::info!(
            "Using output device: {}",
            output_device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let input_format =
            Self::sample_format(&input_device, Direction::Input, binding.channels, sample_rate)?;
        let output_format =
            Self::sample_format(&output_device, Direction::Output, binding.channels, sample_rate)?;

        let config = cpal::StreamConfig {
            channels: binding.channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        log::info!(
            "Audio config: {:?} (input {:?}, output {:?})",
            config,
            input_format,
            output_format
        );

        let (mut capture, mut render) =
            bridge(callback, latency_frames(self.latency, sample_rate)?)?;

        let (failure_tx, failures) = mpsc::channel::<String>();
        let input_err = error_callback(failure_tx.clone(), Direction::Input);
        let output_err = error_callback(failure_tx, Direction::Output);

        let input = match input_format {
            cpal::SampleFormat::F32 => input_device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| capture.capture(data),
                input_err,
                None,
            ),
            cpal::SampleFormat::I16 => input_device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| capture.capture_i16(data),
                input_err,
                None,
            ),
            format => {
                return Err(PipelineError::DeviceOpen(format!(
                    "Unsupported input format: {:?}",
                    format
                )))
            }
        }
        .map_err(|e| PipelineError::DeviceOpen(e.to_string()))?;

        let output = match output_format {
            cpal::SampleFormat::F32 => output_device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| render.render(data),
                output_err,
                None,
            ),
            cpal::SampleFormat::I16 => output_device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| render.render_i16(data),
                output_err,
                None,
            ),
            format => {
                return Err(PipelineError::DeviceOpen(format!(
                    "Unsupported output format: {:?}",
                    format
                )))
            }
        }
        .map_err(|e| PipelineError::DeviceOpen(e.to_string()))?;

        input
            .play()
            .map_err(|e| PipelineError::DeviceOpen(e.to_string()))?;
        output
            .play()
            .map_err(|e| PipelineError::DeviceOpen(e.to_string()))?;

        Ok(CpalDuplexStream {
            _input: input,
            _output: output,
            failures,
        })
    }
}
