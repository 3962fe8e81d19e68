//! Model audio playback
//!
//! The AudioPlayer turns PCM16 chunks received from the session into float
//! buffers and hands them to an `AudioOutput`. Exactly one buffer is live at a
//! time: a new chunk stops the previous source before it starts, and
//! `stop()` (wired to the session's `interrupted` event) silences the current
//! one.
//!
//! # Architecture
//!
//! ```text
//! ClientEvent::Audio ──▶ add_pcm16 ──▶ decode_pcm16_be ──▶ installed nodes
//!                                                               │
//!                        previous source.stop() ◀── replace ────┤
//!                                                               ▼
//!                                                       AudioOutput::play
//! ```

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};

use super::processor::decode_pcm16_be;
use super::registry::{ProcessingNode, ProcessorRegistry};
use super::AudioError;

/// Sample rate of audio produced by the model
pub const PLAYBACK_SAMPLE_RATE: u32 = 48_000;

/// Mono float samples at a fixed rate
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// A started buffer on an output
pub trait PlaybackSource: Send {
    /// Halt and release the buffer. Idempotent.
    fn stop(&mut self);

    /// True once the buffer has played to the end or was stopped
    fn is_finished(&self) -> bool;
}

/// Output sink that starts buffers immediately
pub trait AudioOutput: Send {
    type Source: PlaybackSource;

    fn play(&mut self, buffer: SampleBuffer) -> Result<Self::Source, AudioError>;
}

/// Playback pipeline holding at most one live source
pub struct AudioPlayer<O: AudioOutput = CpalOutput> {
    output: O,
    current: Option<O::Source>,
    nodes: Vec<(String, Box<dyn ProcessingNode>)>,
    sample_rate: u32,
}

impl<O: AudioOutput> AudioPlayer<O> {
    pub fn new(output: O) -> Self {
        Self::with_sample_rate(output, PLAYBACK_SAMPLE_RATE)
    }

    /// Player for a model that produces audio at `sample_rate`
    pub fn with_sample_rate(output: O, sample_rate: u32) -> Self {
        Self {
            output,
            current: None,
            nodes: Vec::new(),
            sample_rate,
        }
    }

    /// Route every future buffer through a fresh instance of the named node
    pub fn install(&mut self, registry: &ProcessorRegistry, name: &str) -> Result<(), AudioError> {
        let node = registry
            .create(name)
            .ok_or_else(|| AudioError::UnknownProcessor(name.to_string()))?;
        self.nodes.push((name.to_string(), node));
        log::debug!("AudioPlayer: installed '{}'", name);
        Ok(())
    }

    /// Names of installed nodes, in processing order
    pub fn installed(&self) -> Vec<&str> {
        self.nodes.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Decode a big-endian PCM16 chunk and play it, replacing the current buffer
    pub fn add_pcm16(&mut self, bytes: &[u8]) -> Result<(), AudioError> {
        let mut samples = decode_pcm16_be(bytes);
        for (_, node) in self.nodes.iter_mut() {
            node.process(&mut samples);
        }

        self.stop();

        let source = self.output.play(SampleBuffer {
            samples,
            sample_rate: self.sample_rate,
        })?;
        self.current = Some(source);
        Ok(())
    }

    /// Halt the current buffer, if any
    pub fn stop(&mut self) {
        if let Some(mut source) = self.current.take() {
            source.stop();
            log::debug!("AudioPlayer: stopped current buffer");
        }
    }

    pub fn is_playing(&self) -> bool {
        self.current.as_ref().is_some_and(|source| !source.is_finished())
    }
}

// ============================================================================
// CPAL output
// ============================================================================

struct LiveBuffer {
    id: u64,
    samples: Vec<f32>,
    position: f64,
    step: f64,
}

type Slot = Arc<Mutex<Option<LiveBuffer>>>;

/// Pull the next sample of the live buffer; silence when there is none
fn next_sample(slot: &mut Option<LiveBuffer>) -> f32 {
    let Some(buffer) = slot.as_mut() else {
        return 0.0;
    };
    if let Some(&sample) = buffer.samples.get(buffer.position as usize) {
        buffer.position += buffer.step;
        return sample;
    }
    // Played to the end
    *slot = None;
    0.0
}

/// Default output device, driven from a dedicated thread.
///
/// The device stream is created once and mixes from a single slot; playing a
/// buffer replaces the slot contents. Buffers are resampled to the device rate
/// by nearest-sample stepping and copied to every output channel.
pub struct CpalOutput {
    slot: Slot,
    next_id: u64,
    device_rate: u32,
    shutdown: Option<std_mpsc::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the named output device, or the host default when `None`
    pub fn new(device_name: Option<String>) -> Result<Self, AudioError> {
        let slot: Slot = Arc::new(Mutex::new(None));
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, AudioError>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let thread_slot = slot.clone();
        let join = std::thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || match open_output(device_name.as_deref(), thread_slot) {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    let _ = shutdown_rx.recv();
                    drop(stream);
                    log::debug!("CpalOutput: playback thread exiting");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let device_rate = ready_rx.recv().unwrap_or_else(|_| {
            Err(AudioError::StreamCreationFailed(
                "Playback thread exited during setup".to_string(),
            ))
        })?;

        Ok(Self {
            slot,
            next_id: 0,
            device_rate,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }
}

impl AudioOutput for CpalOutput {
    type Source = CpalSource;

    fn play(&mut self, buffer: SampleBuffer) -> Result<CpalSource, AudioError> {
        let id = self.next_id;
        self.next_id += 1;

        let step = buffer.sample_rate as f64 / self.device_rate as f64;
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(LiveBuffer {
            id,
            samples: buffer.samples,
            position: 0.0,
            step,
        });

        Ok(CpalSource {
            id,
            slot: self.slot.clone(),
        })
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("CpalOutput: playback thread panicked");
            }
        }
    }
}

/// Handle to one buffer in a `CpalOutput` slot
pub struct CpalSource {
    id: u64,
    slot: Slot,
}

impl PlaybackSource for CpalSource {
    fn stop(&mut self) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|buffer| buffer.id == self.id) {
            *slot = None;
        }
    }

    fn is_finished(&self) -> bool {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        !slot.as_ref().is_some_and(|buffer| buffer.id == self.id)
    }
}

fn open_output(device_name: Option<&str>, slot: Slot) -> Result<(Stream, u32), AudioError> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .output_devices()
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?
            .find(|device| device.name().is_ok_and(|n| n == name))
            .ok_or(AudioError::NoOutputDevice)?,
        None => host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?,
    };

    log::info!("Using audio output device: {:?}", device.name());

    let supported_config = device
        .default_output_config()
        .map_err(|_| AudioError::NoSupportedConfig)?;

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let device_rate = config.sample_rate.0;

    let stream = match sample_format {
        SampleFormat::I16 => build_output_typed::<i16>(&device, &config, slot),
        SampleFormat::U16 => build_output_typed::<u16>(&device, &config, slot),
        SampleFormat::F32 => build_output_typed::<f32>(&device, &config, slot),
        _ => Err(AudioError::NoSupportedConfig),
    }?;

    stream.play().map_err(|e| {
        AudioError::StreamCreationFailed(format!("Failed to start stream: {}", e))
    })?;

    Ok((stream, device_rate))
}

fn build_output_typed<T>(
    device: &Device,
    config: &StreamConfig,
    slot: Slot,
) -> Result<Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
{
    let channels = (config.channels as usize).max(1);

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                for frame in data.chunks_mut(channels) {
                    let value = T::from_sample(next_sample(&mut slot));
                    for out in frame.iter_mut() {
                        *out = value;
                    }
                }
            },
            |err| log::error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::registry::VolumeMeterNode;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    struct FakeSource {
        stopped: Arc<AtomicBool>,
    }

    impl PlaybackSource for FakeSource {
        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        fn is_finished(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct FakeOutput {
        played: Arc<Mutex<Vec<(SampleBuffer, Arc<AtomicBool>)>>>,
    }

    impl AudioOutput for FakeOutput {
        type Source = FakeSource;

        fn play(&mut self, buffer: SampleBuffer) -> Result<FakeSource, AudioError> {
            let stopped = Arc::new(AtomicBool::new(false));
            self.played.lock().unwrap().push((buffer, stopped.clone()));
            Ok(FakeSource { stopped })
        }
    }

    fn player() -> (AudioPlayer<FakeOutput>, Arc<Mutex<Vec<(SampleBuffer, Arc<AtomicBool>)>>>) {
        let output = FakeOutput::default();
        let played = output.played.clone();
        (AudioPlayer::new(output), played)
    }

    #[test]
    fn test_add_pcm16_decodes_big_endian_at_48k() {
        let (mut player, played) = player();

        player.add_pcm16(&[0x00, 0x01, 0x80, 0x00]).unwrap();

        let played = played.lock().unwrap();
        assert_eq!(played.len(), 1);
        assert_eq!(played[0].0.samples, vec![1.0 / 32768.0, -1.0]);
        assert_eq!(played[0].0.sample_rate, PLAYBACK_SAMPLE_RATE);
        assert!(player.is_playing());
    }

    #[test]
    fn test_new_buffer_stops_previous() {
        let (mut player, played) = player();

        player.add_pcm16(&[0x00, 0x01]).unwrap();
        player.add_pcm16(&[0x00, 0x02]).unwrap();
        player.add_pcm16(&[0x00, 0x03]).unwrap();

        let played = played.lock().unwrap();
        let stopped: Vec<bool> = played.iter().map(|(_, s)| s.load(Ordering::SeqCst)).collect();
        assert_eq!(stopped, vec![true, true, false]);
    }

    #[test]
    fn test_stop_halts_current_and_is_idempotent() {
        let (mut player, played) = player();

        // No source yet
        player.stop();

        player.add_pcm16(&[0x12, 0x34]).unwrap();
        player.stop();
        player.stop();

        assert!(!player.is_playing());
        assert!(played.lock().unwrap()[0].1.load(Ordering::SeqCst));
    }

    #[test]
    fn test_install_unknown_processor() {
        let (mut player, _) = player();
        let registry = ProcessorRegistry::new();

        let result = player.install(&registry, "vu-meter");
        assert!(matches!(result, Err(AudioError::UnknownProcessor(name)) if name == "vu-meter"));
        assert!(player.installed().is_empty());
    }

    #[test]
    fn test_installed_meter_sees_every_buffer() {
        let (levels_tx, mut levels_rx) = mpsc::unbounded_channel();
        let mut registry = ProcessorRegistry::new();
        registry.register("vu-meter", move || {
            Box::new(VolumeMeterNode::new(levels_tx.clone()))
        });

        let (mut player, _) = player();
        player.install(&registry, "vu-meter").unwrap();
        assert_eq!(player.installed(), vec!["vu-meter"]);

        player.add_pcm16(&[0x00, 0x00]).unwrap();
        player.add_pcm16(&[0x7f, 0xff]).unwrap();

        assert_eq!(levels_rx.try_recv().unwrap(), 0.0);
        assert_eq!(levels_rx.try_recv().unwrap(), 1.0);
    }

    #[test]
    fn test_next_sample_steps_and_finishes() {
        let mut slot = Some(LiveBuffer {
            id: 0,
            samples: vec![0.1, 0.2, 0.3, 0.4],
            position: 0.0,
            step: 2.0,
        });

        assert_eq!(next_sample(&mut slot), 0.1);
        assert_eq!(next_sample(&mut slot), 0.3);
        assert_eq!(next_sample(&mut slot), 0.0);
        assert!(slot.is_none());
        assert_eq!(next_sample(&mut slot), 0.0);
    }

    #[test]
    fn test_cpal_source_only_clears_its_own_buffer() {
        let slot: Slot = Arc::new(Mutex::new(Some(LiveBuffer {
            id: 2,
            samples: vec![0.5],
            position: 0.0,
            step: 1.0,
        })));

        let mut stale = CpalSource {
            id: 1,
            slot: slot.clone(),
        };
        assert!(stale.is_finished());
        stale.stop();
        assert!(slot.lock().unwrap().is_some());

        let mut live = CpalSource {
            id: 2,
            slot: slot.clone(),
        };
        assert!(!live.is_finished());
        live.stop();
        assert!(slot.lock().unwrap().is_none());
    }
}
