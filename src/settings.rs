use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::live::{
    ClientOptions, Content, GenerationConfig, LiveConfig, Modality, Part, SpeechConfig,
    DEFAULT_MODEL, LIVE_API_URL,
};
use crate::logs::DEFAULT_LOG_CAPACITY;

const SETTINGS_DIR_NAME: &str = "live-console";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Environment variable holding the API key
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Live endpoint, without the key query parameter.
    pub endpoint: String,

    /// Model requested in the `setup` frame.
    pub model: String,

    /// Prebuilt voice for audio responses. `None` lets the server choose.
    pub voice_name: Option<String>,

    /// Whether the model answers with audio or text.
    pub response_modality: Modality,

    /// Optional system prompt sent with `setup`.
    pub system_instruction: Option<String>,

    /// Handshake attempts per connect before giving up.
    pub max_connect_attempts: u32,

    /// Fixed delay between handshake attempts.
    pub retry_delay_ms: u64,

    /// Upper bound on a single handshake.
    pub connect_timeout_ms: u64,

    /// Entries kept in the in-memory session log.
    pub log_capacity: usize,

    /// Sample rate of model audio.
    pub playback_sample_rate: u32,

    /// Input device name. `None` uses the host default.
    pub input_device: Option<String>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            endpoint: LIVE_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice_name: None,
            response_modality: Modality::Audio,
            system_instruction: None,
            max_connect_attempts: 3,
            retry_delay_ms: 1000,
            connect_timeout_ms: 10_000,
            log_capacity: DEFAULT_LOG_CAPACITY,
            playback_sample_rate: crate::audio::PLAYBACK_SAMPLE_RATE,
            input_device: None,
        }
    }
}

impl AppSettings {
    /// Config sent in the `setup` frame
    pub fn live_config(&self) -> LiveConfig {
        let speech_config = self.voice_name.as_deref().map(SpeechConfig::prebuilt);

        LiveConfig {
            model: self.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: Some(vec![self.response_modality]),
                speech_config,
                ..Default::default()
            }),
            system_instruction: self.system_instruction.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part::text(text.clone())],
            }),
            tools: Vec::new(),
        }
    }

    pub fn client_options(&self, api_key: &str) -> ClientOptions {
        let mut options = ClientOptions::new(&self.endpoint, api_key);
        options.max_attempts = self.max_connect_attempts.max(1);
        options.retry_delay = Duration::from_millis(self.retry_delay_ms);
        options.log_capacity = self.log_capacity;
        options
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Get the API key from environment
pub fn get_api_key() -> Option<String> {
    std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty())
}

/// Default settings location under the user config directory
pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails when the destination exists.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("settings.json"));
        assert_eq!(settings, AppSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = AppSettings {
            voice_name: Some("Aoede".to_string()),
            response_modality: Modality::Text,
            max_connect_attempts: 5,
            ..Default::default()
        };
        save_settings(&path, &settings).unwrap();

        assert_eq!(load_settings(&path), settings);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"retry_delay_ms": 250}"#).unwrap();

        let settings = load_settings(&path);
        assert_eq!(settings.retry_delay_ms, 250);
        assert_eq!(settings.max_connect_attempts, 3);
        assert_eq!(settings.endpoint, LIVE_API_URL);
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();

        assert_eq!(load_settings(&path), AppSettings::default());
    }

    #[test]
    fn test_live_config_from_settings() {
        let settings = AppSettings {
            voice_name: Some("Puck".to_string()),
            system_instruction: Some("Be brief.".to_string()),
            ..Default::default()
        };
        let config = settings.live_config();

        assert_eq!(config.model, DEFAULT_MODEL);
        let generation = config.generation_config.unwrap();
        assert_eq!(generation.response_modalities, Some(vec![Modality::Audio]));
        assert_eq!(generation.speech_config, Some(SpeechConfig::prebuilt("Puck")));

        let instruction = config.system_instruction.unwrap();
        assert_eq!(instruction.parts[0].as_text(), Some("Be brief."));
    }

    #[test]
    fn test_default_live_config_matches_client_default() {
        assert_eq!(AppSettings::default().live_config(), LiveConfig::default());
    }

    #[test]
    fn test_client_options_from_settings() {
        let settings = AppSettings {
            endpoint: "wss://example.test/live".to_string(),
            max_connect_attempts: 0,
            retry_delay_ms: 50,
            ..Default::default()
        };
        let options = settings.client_options("k");

        assert_eq!(options.url, "wss://example.test/live?key=k");
        assert_eq!(options.max_attempts, 1);
        assert_eq!(options.retry_delay, Duration::from_millis(50));
        assert_eq!(settings.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_get_api_key_does_not_panic() {
        // Depends on environment; only checks the lookup is safe
        let _ = get_api_key();
    }
}
