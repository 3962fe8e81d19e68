//! Sample-level processing for the capture and playback pipelines
//!
//! Pure functions and small state machines with no device access, so the
//! block-by-block behavior can be tested without audio hardware.

use base64::{engine::general_purpose::STANDARD, Engine};

/// Sample rate of captured audio sent to the server
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Samples per captured chunk (~128ms at 16kHz)
pub const CHUNK_SAMPLES: usize = 2048;

/// Gain applied to block RMS before clamping to [0, 1]
pub const VOLUME_GAIN: f32 = 4.0;

/// Convert a float sample in [-1, 1] to PCM16.
///
/// Scales by 32767 and rounds half away from zero; out-of-range input is clamped.
pub fn float_to_pcm16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16
}

/// Encode samples as little-endian PCM16 bytes, base64 for transport
pub fn encode_pcm16(samples: &[i16]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|&s| s.to_le_bytes()).collect();
    STANDARD.encode(&bytes)
}

/// Decode big-endian PCM16 bytes into floats in [-1, 1).
///
/// Each consecutive byte pair is one sample, high byte first. A trailing odd
/// byte is ignored.
pub fn decode_pcm16_be(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_be_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Meter level of one block: `sqrt(mean(sample^2))`, times `VOLUME_GAIN`, clamped to [0, 1]
pub fn block_volume(block: &[f32]) -> f32 {
    if block.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = block.iter().map(|s| s * s).sum();
    let rms = (sum_squares / block.len() as f32).sqrt();
    (rms * VOLUME_GAIN).clamp(0.0, 1.0)
}

/// Average interleaved frames down to mono
pub fn to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Downsample audio from source rate to target rate using simple averaging
///
/// Supports integer ratios (e.g., 48kHz → 16kHz).
///
/// # Returns
/// Downsampled audio, or original if rates match or ratio not supported
pub fn downsample(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    // Guard against division by zero
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate {
        return samples.to_vec();
    }

    if source_rate % target_rate != 0 {
        log::warn!(
            "Unsupported resample ratio {}:{}, returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    let ratio = (source_rate / target_rate) as usize;

    samples
        .chunks(ratio)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

/// Accumulates PCM16 samples into fixed-size chunks.
///
/// Each full chunk is handed out base64-encoded; `finish()` flushes a
/// non-empty partial chunk when the input ends.
#[derive(Debug)]
pub struct ChunkEncoder {
    buffer: Vec<i16>,
    capacity: usize,
}

impl ChunkEncoder {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Feed one block; returns the chunks that filled up, in order
    pub fn process(&mut self, block: &[f32]) -> Vec<String> {
        let mut chunks = Vec::new();
        for &sample in block {
            self.buffer.push(float_to_pcm16(sample));
            if self.buffer.len() >= self.capacity {
                chunks.push(encode_pcm16(&self.buffer));
                self.buffer.clear();
            }
        }
        chunks
    }

    /// Flush the partial chunk, if any
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let chunk = encode_pcm16(&self.buffer);
        self.buffer.clear();
        Some(chunk)
    }

    /// Samples waiting for the next flush
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new(CHUNK_SAMPLES)
    }
}
