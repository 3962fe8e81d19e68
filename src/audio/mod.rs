//! Audio pipelines for the live console
//!
//! Capture turns microphone input into base64 PCM16 chunks plus a volume
//! level; playback turns PCM16 chunks from the model into sound, one buffer at
//! a time. Both use CPAL, with the device layer behind a trait so the pipeline
//! logic runs without hardware.

pub mod player;
pub mod processor;
pub mod recorder;
pub mod registry;

pub use player::{
    AudioOutput, AudioPlayer, CpalOutput, CpalSource, PlaybackSource, SampleBuffer,
    PLAYBACK_SAMPLE_RATE,
};
pub use processor::{ChunkEncoder, CAPTURE_SAMPLE_RATE, CHUNK_SAMPLES, VOLUME_GAIN};
pub use recorder::{AudioRecorder, BlockCallback, CaptureEvent, CpalInput, InputBackend};
pub use registry::{ProcessingNode, ProcessorRegistry, VolumeMeterNode, VU_METER};

/// Errors that can occur in the audio pipelines.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioError {
    NoInputDevice,
    NoOutputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    /// No processing node registered under this name
    UnknownProcessor(String),
}

impl std::fmt::Display for AudioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioError::NoInputDevice => write!(f, "No audio input device found"),
            AudioError::NoOutputDevice => write!(f, "No audio output device found"),
            AudioError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            AudioError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            AudioError::UnknownProcessor(name) => {
                write!(f, "No processing node registered as '{}'", name)
            }
        }
    }
}

impl std::error::Error for AudioError {}
