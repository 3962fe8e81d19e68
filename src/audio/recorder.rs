//! Microphone capture using CPAL
//!
//! The AudioRecorder opens an input stream, converts it to 16 kHz mono and
//! feeds two consumers from every block: the chunk encoder (PCM16 chunks,
//! base64, emitted as `Data`) and the volume meter (emitted as `Volume`).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   f32 blocks   ┌──────────────┐  CaptureEvent::Data
//! │ InputBackend │ ─────────────▶ │ ChunkEncoder │ ─────────────────────┐
//! │ (capture     │       │        └──────────────┘                      ▼
//! │  thread)     │       │        ┌──────────────┐  CaptureEvent::Volume  mpsc
//! └──────────────┘       └──────▶ │ block_volume │ ─────────────────────▶ channel
//!                                 └──────────────┘
//! ```
//!
//! The device stream lives on a dedicated capture thread because CPAL streams
//! are not `Send`. `start()` waits for the thread to report that the device is
//! open. A `stop()` that arrives while that is still in progress is recorded
//! and applied as soon as the device is open, so the microphone is never left
//! running. A `start()` issued after that stop cancels it again.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};

use super::processor::{
    block_volume, downsample, to_mono, ChunkEncoder, CAPTURE_SAMPLE_RATE, CHUNK_SAMPLES,
};
use super::AudioError;

/// Output of the capture pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// Base64 PCM16 (little-endian, 16 kHz mono) chunk
    Data(String),
    /// Meter level of one block, in [0, 1]
    Volume(f32),
}

/// Callback receiving 16 kHz mono blocks in [-1, 1]
pub type BlockCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Source of captured audio.
///
/// `open` runs on the capture thread and may block while the device starts.
/// The returned stream keeps capturing until it is dropped.
pub trait InputBackend: Send + Sync + 'static {
    type Stream;

    fn open(&self, on_block: BlockCallback) -> Result<Self::Stream, AudioError>;
}

/// Microphone input through the default CPAL host
#[derive(Debug, Clone, Default)]
pub struct CpalInput {
    device_name: Option<String>,
}

impl CpalInput {
    /// Capture from the named device, or the host default when `None`
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    fn device(&self) -> Result<Device, AudioError> {
        let host = cpal::default_host();

        let Some(name) = &self.device_name else {
            return host.default_input_device().ok_or(AudioError::NoInputDevice);
        };

        let mut devices = host
            .input_devices()
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;
        devices
            .find(|device| device.name().is_ok_and(|n| &n == name))
            .ok_or(AudioError::NoInputDevice)
    }
}

impl InputBackend for CpalInput {
    type Stream = Stream;

    fn open(&self, on_block: BlockCallback) -> Result<Stream, AudioError> {
        let device = self.device()?;
        log::info!("Using audio input device: {:?}", device.name());

        let supported_config = device
            .default_input_config()
            .map_err(|_| AudioError::NoSupportedConfig)?;

        log::info!(
            "Audio config: {} Hz, {} channels, {:?}",
            supported_config.sample_rate().0,
            supported_config.channels(),
            supported_config.sample_format()
        );

        let sample_format = supported_config.sample_format();
        let config: StreamConfig = supported_config.into();

        let stream = match sample_format {
            SampleFormat::I16 => build_input_typed::<i16>(&device, &config, on_block),
            SampleFormat::U16 => build_input_typed::<u16>(&device, &config, on_block),
            SampleFormat::F32 => build_input_typed::<f32>(&device, &config, on_block),
            _ => Err(AudioError::NoSupportedConfig),
        }?;

        stream.play().map_err(|e| {
            AudioError::StreamCreationFailed(format!("Failed to start stream: {}", e))
        })?;

        Ok(stream)
    }
}

fn build_input_typed<T>(
    device: &Device,
    config: &StreamConfig,
    mut on_block: BlockCallback,
) -> Result<Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels;
    let sample_rate = config.sample_rate.0;
    let resample = sample_rate % CAPTURE_SAMPLE_RATE == 0;
    if !resample {
        log::warn!(
            "AudioRecorder: input rate {} Hz is not a multiple of {} Hz, sending unresampled",
            sample_rate,
            CAPTURE_SAMPLE_RATE
        );
    }

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| s.to_sample::<f32>()).collect();
                let mono = to_mono(&samples, channels);
                if resample {
                    on_block(&downsample(&mono, sample_rate, CAPTURE_SAMPLE_RATE));
                } else {
                    on_block(&mono);
                }
            },
            |err| log::error!("Audio stream error: {}", err),
            None,
        )
        .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))
}

struct CaptureThread {
    stop_tx: std_mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl CaptureThread {
    /// Signal the thread and wait until the device is released
    fn shutdown(self) {
        let _ = self.stop_tx.send(());
        if self.join.join().is_err() {
            log::error!("AudioRecorder: capture thread panicked");
        }
    }
}

enum Phase {
    Stopped,
    Starting { stop_requested: bool },
    Recording(CaptureThread),
}

/// Resets `Starting` back to `Stopped` if `start()` is dropped before the
/// device reports back
struct StartGuard<'a> {
    phase: &'a Mutex<Phase>,
    armed: bool,
}

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(*phase, Phase::Starting { .. }) {
                *phase = Phase::Stopped;
            }
        }
    }
}

/// Microphone capture pipeline
pub struct AudioRecorder<B: InputBackend = CpalInput> {
    backend: Arc<B>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    phase: Mutex<Phase>,
    chunk_samples: usize,
}

impl<B: InputBackend> AudioRecorder<B> {
    /// Create a recorder and the receiver for its events
    pub fn new(backend: B) -> (Self, mpsc::UnboundedReceiver<CaptureEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let recorder = Self {
            backend: Arc::new(backend),
            events,
            phase: Mutex::new(Phase::Stopped),
            chunk_samples: CHUNK_SAMPLES,
        };
        (recorder, rx)
    }

    /// Override the number of samples per emitted chunk
    pub fn with_chunk_samples(mut self, chunk_samples: usize) -> Self {
        self.chunk_samples = chunk_samples;
        self
    }

    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_recording(&self) -> bool {
        matches!(*self.lock_phase(), Phase::Recording(_))
    }

    /// Open the input device and start emitting events.
    ///
    /// Does nothing if capture is already running. Called while another
    /// `start()` is still opening the device, it cancels any `stop()` issued
    /// in between, so the recorder ends up recording. On device failure the
    /// recorder stays stopped and the error is returned.
    pub async fn start(&self) -> Result<(), AudioError> {
        {
            let mut phase = self.lock_phase();
            match &mut *phase {
                Phase::Stopped => {}
                Phase::Starting { stop_requested } => {
                    if *stop_requested {
                        log::debug!("AudioRecorder: start during setup cancels pending stop");
                        *stop_requested = false;
                    }
                    return Ok(());
                }
                Phase::Recording(_) => {
                    log::debug!("AudioRecorder: start ignored, capture already active");
                    return Ok(());
                }
            }
            *phase = Phase::Starting {
                stop_requested: false,
            };
        }
        let mut guard = StartGuard {
            phase: &self.phase,
            armed: true,
        };

        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), AudioError>>();

        let backend = self.backend.clone();
        let events = self.events.clone();
        let chunk_samples = self.chunk_samples;

        let join = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || capture_thread(backend, events, chunk_samples, ready_tx, stop_rx))
            .map_err(|e| AudioError::StreamCreationFailed(e.to_string()))?;

        let opened = ready_rx.await.unwrap_or_else(|_| {
            Err(AudioError::StreamCreationFailed(
                "Capture thread exited during setup".to_string(),
            ))
        });

        guard.armed = false;
        let thread = CaptureThread { stop_tx, join };

        if let Err(e) = opened {
            *self.lock_phase() = Phase::Stopped;
            thread.shutdown();
            log::error!("AudioRecorder: failed to open input: {}", e);
            return Err(e);
        }

        {
            let mut phase = self.lock_phase();
            let keep_running = matches!(
                *phase,
                Phase::Starting {
                    stop_requested: false
                }
            );
            if keep_running {
                *phase = Phase::Recording(thread);
                log::info!("AudioRecorder: capture started");
                return Ok(());
            }
            *phase = Phase::Stopped;
        }

        log::info!("AudioRecorder: stop requested during setup, releasing input");
        thread.shutdown();
        Ok(())
    }

    /// Stop capture and release the input device.
    ///
    /// Safe to call at any time. During `start()` the request is deferred
    /// until the device is open, then applied immediately.
    pub fn stop(&self) {
        let thread = {
            let mut phase = self.lock_phase();
            match std::mem::replace(&mut *phase, Phase::Stopped) {
                Phase::Stopped => return,
                Phase::Starting { .. } => {
                    *phase = Phase::Starting {
                        stop_requested: true,
                    };
                    log::debug!("AudioRecorder: stop deferred until setup completes");
                    return;
                }
                Phase::Recording(thread) => thread,
            }
        };

        thread.shutdown();
        log::info!("AudioRecorder: capture stopped");
    }
}

impl<B: InputBackend> Drop for AudioRecorder<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread<B: InputBackend>(
    backend: Arc<B>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    chunk_samples: usize,
    ready_tx: oneshot::Sender<Result<(), AudioError>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let encoder = Arc::new(Mutex::new(ChunkEncoder::new(chunk_samples)));

    let on_block: BlockCallback = {
        let encoder = encoder.clone();
        let events = events.clone();
        Box::new(move |block: &[f32]| {
            let chunks = encoder
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .process(block);
            for chunk in chunks {
                let _ = events.send(CaptureEvent::Data(chunk));
            }
            let _ = events.send(CaptureEvent::Volume(block_volume(block)));
        })
    };

    let stream = match backend.open(on_block) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if ready_tx.send(Ok(())).is_ok() {
        // Returns on an explicit stop or when the recorder drops the sender
        let _ = stop_rx.recv();
    }
    drop(stream);

    let tail = encoder
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .finish();
    if let Some(chunk) = tail {
        let _ = events.send(CaptureEvent::Data(chunk));
    }
    log::debug!("AudioRecorder: capture thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeStream {
        released: Arc<AtomicBool>,
    }

    impl Drop for FakeStream {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeInput {
        blocks: Vec<Vec<f32>>,
        open_delay: Duration,
        fail: bool,
        released: Arc<AtomicBool>,
        opens: Arc<AtomicUsize>,
    }

    impl InputBackend for FakeInput {
        type Stream = FakeStream;

        fn open(&self, mut on_block: BlockCallback) -> Result<FakeStream, AudioError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.open_delay);
            if self.fail {
                return Err(AudioError::NoInputDevice);
            }
            self.released.store(false, Ordering::SeqCst);
            for block in &self.blocks {
                on_block(block);
            }
            Ok(FakeStream {
                released: self.released.clone(),
            })
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CaptureEvent>) -> Vec<CaptureEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let released = Arc::new(AtomicBool::new(false));
        let backend = FakeInput {
            released: released.clone(),
            ..Default::default()
        };
        let (recorder, _rx) = AudioRecorder::new(backend);

        recorder.start().await.unwrap();
        assert!(recorder.is_recording());
        assert!(!released.load(Ordering::SeqCst));

        recorder.stop();
        assert!(!recorder.is_recording());
        assert!(released.load(Ordering::SeqCst));

        // Second stop is a no-op
        recorder.stop();
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let (recorder, _rx) = AudioRecorder::new(FakeInput::default());
        recorder.stop();
        assert!(!recorder.is_recording());
    }

    #[tokio::test]
    async fn test_start_while_recording_is_ignored() {
        let opens = Arc::new(AtomicUsize::new(0));
        let backend = FakeInput {
            opens: opens.clone(),
            ..Default::default()
        };
        let (recorder, _rx) = AudioRecorder::new(backend);

        recorder.start().await.unwrap();
        recorder.start().await.unwrap();
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_during_setup_releases_device() {
        let released = Arc::new(AtomicBool::new(false));
        let backend = FakeInput {
            open_delay: Duration::from_millis(200),
            released: released.clone(),
            ..Default::default()
        };
        let (recorder, _rx) = AudioRecorder::new(backend);

        let stopper = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            recorder.stop();
        };
        let (result, ()) = tokio::join!(recorder.start(), stopper);

        assert!(result.is_ok());
        assert!(!recorder.is_recording());
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_start_after_stop_during_setup_keeps_recording() {
        let released = Arc::new(AtomicBool::new(false));
        let opens = Arc::new(AtomicUsize::new(0));
        let backend = FakeInput {
            open_delay: Duration::from_millis(200),
            released: released.clone(),
            opens: opens.clone(),
            ..Default::default()
        };
        let (recorder, _rx) = AudioRecorder::new(backend);

        let restart = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            recorder.stop();
            recorder.start().await
        };
        let (first, second) = tokio::join!(recorder.start(), restart);

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert!(recorder.is_recording());
        assert!(!released.load(Ordering::SeqCst));
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        recorder.stop();
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_device_failure_leaves_recorder_stopped() {
        let backend = FakeInput {
            fail: true,
            ..Default::default()
        };
        let (recorder, _rx) = AudioRecorder::new(backend);

        let result = recorder.start().await;
        assert!(matches!(result, Err(AudioError::NoInputDevice)));
        assert!(!recorder.is_recording());

        // Still fails cleanly on retry, not stuck in a starting state
        assert!(recorder.start().await.is_err());
    }

    #[tokio::test]
    async fn test_chunks_volume_and_final_flush() {
        let backend = FakeInput {
            blocks: vec![vec![0.5; 3], vec![0.5; 3]],
            ..Default::default()
        };
        let (recorder, mut rx) = AudioRecorder::new(backend);
        let recorder = recorder.with_chunk_samples(4);

        recorder.start().await.unwrap();
        recorder.stop();

        let events = drain(&mut rx);
        let data: Vec<&String> = events
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::Data(chunk) => Some(chunk),
                _ => None,
            })
            .collect();
        let volumes: Vec<f32> = events
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::Volume(v) => Some(*v),
                _ => None,
            })
            .collect();

        // One full chunk of 4 samples, then the 2-sample tail on stop
        assert_eq!(data.len(), 2);
        use base64::{engine::general_purpose::STANDARD, Engine};
        assert_eq!(STANDARD.decode(data[0]).unwrap().len(), 8);
        assert_eq!(STANDARD.decode(data[1]).unwrap().len(), 4);

        // One level per block; RMS 0.5 x4 clamps to 1.0
        assert_eq!(volumes, vec![1.0, 1.0]);
    }

    #[tokio::test]
    async fn test_drop_releases_device() {
        let released = Arc::new(AtomicBool::new(false));
        let backend = FakeInput {
            released: released.clone(),
            ..Default::default()
        };
        let (recorder, _rx) = AudioRecorder::new(backend);

        recorder.start().await.unwrap();
        drop(recorder);
        assert!(released.load(Ordering::SeqCst));
    }
}
