//! Realtime multimodal session client
//!
//! - [`live`]: WebSocket session, message model and typed events
//! - [`audio`]: microphone capture and model audio playback
//! - [`bridge`]: wiring between session events and the audio pipelines
//! - [`logs`]: capped audit log of session traffic
//! - [`settings`]: persisted configuration

pub mod audio;
pub mod bridge;
pub mod live;
pub mod logs;
pub mod settings;

mod console;

pub use console::run;
