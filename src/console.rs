//! Terminal front end for a live session
//!
//! Wires the session client to the audio pipelines and stdin:
//!
//! ```text
//! microphone ──▶ AudioRecorder ──Data──▶ send_realtime_input
//! stdin line ───────────────────────────▶ send_text
//! audio event ──▶ AudioPlayer::add_pcm16 (vu-meter installed)
//! interrupted ──▶ AudioPlayer::stop
//! content ──────▶ stdout
//! ```
//!
//! Commands: `/quit`, `/reconnect`, `/logs [all|conversations|tools]`.

use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::audio::{
    AudioPlayer, AudioRecorder, CpalInput, CpalOutput, ProcessorRegistry, VolumeMeterNode,
    VU_METER,
};
use crate::bridge::{attach_player, forward_capture, SharedPlayer};
use crate::live::{ClientEvent, EventKind, LiveClient, LiveError, WebSocketConnector};
use crate::logs::{LogFilter, LogMessage};
use crate::settings::{get_api_key, load_settings, settings_path, AppSettings};

/// How long shutdown waits for queued microphone chunks to be sent
const CAPTURE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Run an interactive session until `/quit` or end of input
pub async fn run() -> Result<(), Box<dyn Error>> {
    // Pick the ring provider explicitly for TLS; fails only if one is already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let settings = match settings_path() {
        Ok(path) => load_settings(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            AppSettings::default()
        }
    };

    let api_key = get_api_key().ok_or(LiveError::MissingApiKey)?;
    let client = LiveClient::new(
        WebSocketConnector::new(settings.connect_timeout()),
        settings.client_options(&api_key),
    );
    log::info!("Console: session {}", client.session_id());

    let mut registry = ProcessorRegistry::new();
    let (levels_tx, mut levels_rx) = mpsc::unbounded_channel();
    registry.register(VU_METER, move || {
        Box::new(VolumeMeterNode::new(levels_tx.clone()))
    });
    tokio::spawn(async move {
        while let Some(level) = levels_rx.recv().await {
            log::trace!("Console: output level {:.2}", level);
        }
    });

    let player = match CpalOutput::new(None) {
        Ok(output) => {
            let mut player = AudioPlayer::with_sample_rate(output, settings.playback_sample_rate);
            player.install(&registry, VU_METER)?;
            Some(Arc::new(Mutex::new(player)))
        }
        Err(e) => {
            log::warn!("Console: playback disabled: {}", e);
            None
        }
    };

    register_listeners(&client, player);

    client.connect(settings.live_config()).await?;

    let (recorder, capture_rx) = AudioRecorder::new(CpalInput::new(settings.input_device.clone()));
    if let Err(e) = recorder.start().await {
        log::warn!("Console: microphone disabled: {}", e);
    }
    let forwarder = forward_capture(client.clone(), capture_rx);

    println!("Connected. Type a message, /reconnect, /logs or /quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line {
            "/quit" => break,
            "/reconnect" => {
                if let Err(e) = client.reconnect().await {
                    eprintln!("Reconnect failed: {}", e);
                }
            }
            _ if line.starts_with("/logs") => print_logs(&client, line),
            _ => {
                if let Err(e) = client.send_text(line) {
                    eprintln!("{}", e);
                }
            }
        }
    }

    // Stopping flushes the tail chunk; dropping closes the channel so the
    // forwarder sends it and exits before the socket goes away.
    recorder.stop();
    drop(recorder);
    match tokio::time::timeout(CAPTURE_DRAIN_TIMEOUT, forwarder).await {
        Ok(Ok(sent)) => log::debug!("Console: forwarded {} microphone chunks", sent),
        Ok(Err(e)) => log::warn!("Console: capture forwarder failed: {}", e),
        Err(_) => log::warn!("Console: timed out draining microphone chunks"),
    }
    client.disconnect();
    Ok(())
}

fn register_listeners(client: &LiveClient, player: Option<SharedPlayer<CpalOutput>>) {
    if let Some(player) = player {
        attach_player(client, player);
    }

    client.on(EventKind::Content, |event| {
        if let ClientEvent::Content(content) = event {
            if let Some(text) = content.text() {
                println!("{}", text);
            }
        }
    });

    client.on(EventKind::SetupComplete, |_| {
        log::info!("Console: setup complete");
    });

    client.on(EventKind::ToolCall, |event| {
        if let ClientEvent::ToolCall(call) = event {
            for function in &call.function_calls {
                log::info!("Console: tool call {} ({})", function.name, function.id);
            }
        }
    });

    client.on(EventKind::Close, |event| {
        if let ClientEvent::Close(info) = event {
            if info.reason.is_empty() {
                println!("Session closed.");
            } else {
                println!("Session closed: {}", info.reason);
            }
        }
    });
}

fn print_logs(client: &LiveClient, command: &str) {
    let filter = match command.split_whitespace().nth(1) {
        Some("conversations") => LogFilter::Conversations,
        Some("tools") => LogFilter::Tools,
        _ => LogFilter::All,
    };

    for entry in client.logs().iter().filter(|entry| filter.matches(entry)) {
        let message = match &entry.message {
            LogMessage::Text(text) => text.clone(),
            LogMessage::Json(value) => value.to_string(),
        };
        let repeat = if entry.count > 1 {
            format!(" (x{})", entry.count)
        } else {
            String::new()
        };
        println!(
            "{} {}{} {}",
            entry.date.format("%H:%M:%S"),
            entry.kind,
            repeat,
            message
        );
    }
}
