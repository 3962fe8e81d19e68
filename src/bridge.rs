//! Glue between the session client and the audio pipelines
//!
//! ```text
//! audio event ──▶ AudioPlayer::add_pcm16
//! interrupted ──▶ AudioPlayer::stop
//! CaptureEvent::Data ──▶ send_realtime_input
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::audio::{AudioOutput, AudioPlayer, CaptureEvent, CAPTURE_SAMPLE_RATE};
use crate::live::{Blob, ClientEvent, Connector, EventKind, ListenerId, SessionClient};

/// Player shared between event listeners
pub type SharedPlayer<O> = Arc<Mutex<AudioPlayer<O>>>;

/// Play model audio through `player` and cut it off when the model is interrupted.
///
/// Returns the listener ids so the caller can detach with `off()`.
pub fn attach_player<C, O>(client: &SessionClient<C>, player: SharedPlayer<O>) -> Vec<ListenerId>
where
    C: Connector,
    O: AudioOutput + 'static,
{
    let audio_player = player.clone();
    let audio = client.on(EventKind::Audio, move |event| {
        if let ClientEvent::Audio(bytes) = event {
            let mut player = audio_player.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = player.add_pcm16(bytes) {
                log::warn!("Bridge: playback failed: {}", e);
            }
        }
    });

    let interrupted = client.on(EventKind::Interrupted, move |_| {
        log::debug!("Bridge: interrupted, stopping playback");
        player.lock().unwrap_or_else(PoisonError::into_inner).stop();
    });

    vec![audio, interrupted]
}

/// Stream microphone chunks to the session until the capture channel closes.
///
/// The task ends once every sender is gone, which for an `AudioRecorder`
/// means after it is stopped and dropped, so the tail chunk flushed by
/// `stop()` is still sent. Resolves to the number of chunks sent.
pub fn forward_capture<C: Connector>(
    client: SessionClient<C>,
    mut capture: mpsc::UnboundedReceiver<CaptureEvent>,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut sent = 0;
        while let Some(event) = capture.recv().await {
            match event {
                CaptureEvent::Data(chunk) => {
                    let blob = Blob::pcm16(chunk, CAPTURE_SAMPLE_RATE);
                    match client.send_realtime_input(vec![blob]) {
                        Ok(()) => sent += 1,
                        Err(e) => log::debug!("Bridge: dropped microphone chunk: {}", e),
                    }
                }
                CaptureEvent::Volume(level) => {
                    log::trace!("Bridge: input level {:.2}", level);
                }
            }
        }
        log::debug!("Bridge: capture closed after {} chunks", sent);
        sent
    })
}
