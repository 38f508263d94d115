//! Errors raised while opening or running the passthrough stream

use thiserror::Error;

/// Errors that can occur while the pipeline opens or runs its stream.
///
/// None of these escape [`AudioPipeline::start`](super::AudioPipeline::start);
/// they are logged and recorded as the pipeline's last failure.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("No default {0} device available")]
    NoDefaultDevice(&'static str),

    #[error("Invalid channel count: {0}")]
    InvalidChannels(u16),

    #[error("Failed to open device: {0}")]
    DeviceOpen(String),

    #[error("Stream failed: {0}")]
    StreamRuntime(String),

    #[error("Failed to spawn pipeline thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl PipelineError {
    /// Whether the failure happened before the stream was running
    pub fn is_open_failure(&self) -> bool {
        matches!(
            self,
            Self::DeviceNotFound(_)
                | Self::NoDefaultDevice(_)
                | Self::InvalidChannels(_)
                | Self::DeviceOpen(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = PipelineError::DeviceNotFound("USB Mic".to_string());
        assert_eq!(err.to_string(), "Device not found: USB Mic");

        let err = PipelineError::NoDefaultDevice("input");
        assert_eq!(err.to_string(), "No default input device available");
    }

    #[test]
    fn test_open_failure_kind() {
        assert!(PipelineError::InvalidChannels(0).is_open_failure());
        assert!(PipelineError::DeviceOpen("busy".into()).is_open_failure());
        assert!(!PipelineError::StreamRuntime("device unplugged".into()).is_open_failure());
    }
}
