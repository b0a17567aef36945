//! Persistent host settings (JSON file, camelCase fields).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use colloquy_core::audio::CaptureConfig;
use colloquy_core::{CompletionParams, EngineConfig, RetryPolicy, RotationLimits};
use serde::{Deserialize, Serialize};
use tracing::warn;

const SETTINGS_FILE: &str = "colloquy.settings.json";

/// Environment variable overriding the settings file location.
const SETTINGS_PATH_ENV: &str = "COLLOQUY_SETTINGS";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub language_hint: String,
    pub voice: String,
    pub system_prompt: Option<String>,

    pub vad_threshold: f32,
    pub padding_duration_ms: u32,

    pub completion_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,

    pub recognition_url: String,
    pub recognition_model: String,
    pub recognition_api_key: Option<String>,

    pub credential_env_prefix: String,
    pub max_requests_per_window: u32,
    pub window_secs: u64,
    pub cooldown_secs: u64,

    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            language_hint: "en".into(),
            voice: "en".into(),
            system_prompt: None,
            vad_threshold: 0.02,
            padding_duration_ms: 600,
            completion_url: "https://api.groq.com/openai/v1/chat/completions".into(),
            model: "llama-3.3-70b-versatile".into(),
            max_tokens: 500,
            temperature: 0.8,
            recognition_url: "https://api.groq.com/openai/v1/audio/transcriptions".into(),
            recognition_model: "whisper-large-v3-turbo".into(),
            recognition_api_key: None,
            credential_env_prefix: "COLLOQUY_API_KEY".into(),
            max_requests_per_window: 50,
            window_secs: 60,
            cooldown_secs: 61,
            retry_attempts: 3,
            retry_delay_secs: 5,
        }
    }
}

impl AppSettings {
    /// Clamp out-of-range values instead of failing startup over a typo.
    pub fn normalize(&mut self) {
        self.vad_threshold = self.vad_threshold.clamp(0.0005, 0.5);
        self.padding_duration_ms = self.padding_duration_ms.clamp(100, 5_000);
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.max_tokens = self.max_tokens.clamp(1, 8_192);
        self.max_requests_per_window = self.max_requests_per_window.max(1);
        self.window_secs = self.window_secs.max(1);
        self.cooldown_secs = self.cooldown_secs.max(1);
        self.retry_attempts = self.retry_attempts.max(1);
        if self.credential_env_prefix.trim().is_empty() {
            self.credential_env_prefix = "COLLOQUY_API_KEY".into();
        }
    }

    pub fn rotation_limits(&self) -> RotationLimits {
        RotationLimits {
            max_requests_per_window: self.max_requests_per_window,
            window_length: Duration::from_secs(self.window_secs),
            cooldown_length: Duration::from_secs(self.cooldown_secs),
        }
    }

    pub fn to_engine_config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            capture: CaptureConfig {
                preferred_input_device: self.preferred_input_device.clone(),
                ..CaptureConfig::default()
            },
            padding_duration_ms: self.padding_duration_ms,
            vad_threshold: self.vad_threshold,
            language_hint: self.language_hint.clone(),
            voice: self.voice.clone(),
            system_prompt: self
                .system_prompt
                .clone()
                .unwrap_or_else(|| defaults.system_prompt.clone()),
            retry: RetryPolicy {
                attempts: self.retry_attempts,
                delay: Duration::from_secs(self.retry_delay_secs),
            },
            completion: CompletionParams {
                model: self.model.clone(),
                max_tokens: self.max_tokens,
                temperature: self.temperature,
            },
            ..defaults
        }
    }
}

/// Settings file location: `$COLLOQUY_SETTINGS` or `./colloquy.settings.json`.
pub fn default_settings_path() -> PathBuf {
    std::env::var_os(SETTINGS_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(SETTINGS_FILE))
}

/// Load settings, falling back to defaults when the file is missing or
/// unparseable — a bad settings file must not block startup.
pub fn load_settings(path: &Path) -> AppSettings {
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<AppSettings>(&raw) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "settings file unparseable — using defaults");
                AppSettings::default()
            }
        },
        Err(_) => AppSettings::default(),
    }
}
