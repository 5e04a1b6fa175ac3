//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon/voice.toml` as a persistent config source.
//! All fields are optional. The file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfigFile {
    /// Directory holding the conversation database
    pub data_dir: Option<String>,

    /// Path to the chat app's settings file
    pub settings_path: Option<String>,

    /// Greetings spoken when a session starts
    pub greetings: Option<Vec<String>>,

    /// Loop timings
    #[serde(default)]
    pub timings: TimingsFileConfig,

    /// Capture subprocess
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Wake word engine
    #[serde(default)]
    pub wake: WakeFileConfig,

    /// Transcription service
    #[serde(default)]
    pub transcription: TranscriptionFileConfig,

    /// Language model backend
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Speech synthesis
    #[serde(default)]
    pub tts: TtsFileConfig,
}

/// Loop timings, all in milliseconds
#[derive(Debug, Default, Deserialize)]
pub struct TimingsFileConfig {
    pub max_capture_ms: Option<u64>,
    pub silence_timeout_ms: Option<u64>,
    pub retry_delay_ms: Option<u64>,
    pub escalation_delay_ms: Option<u64>,
    pub max_consecutive_failures: Option<u32>,
    pub settle_delay_ms: Option<u64>,
    pub error_delay_ms: Option<u64>,
    pub auto_hide_ms: Option<u64>,
    pub flush_delay_ms: Option<u64>,
    pub fade_ms: Option<u64>,
    pub settings_poll_ms: Option<u64>,
}

/// Capture subprocess configuration
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    /// Program to run (e.g. "sox")
    pub program: Option<String>,

    /// Argument template with `{device}`, `{output}` etc placeholders
    pub args: Option<Vec<String>>,

    /// Fixed path the capture program writes to
    pub output_path: Option<String>,
}

/// Wake word configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// Keyword model file
    pub model_path: Option<String>,

    /// Detection threshold (0.0 - 1.0)
    pub sensitivity: Option<f32>,
}

/// Transcription service configuration
#[derive(Debug, Default, Deserialize)]
pub struct TranscriptionFileConfig {
    pub url: Option<String>,
    pub timeout_ms: Option<u64>,
}

/// LLM backend configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    pub url: Option<String>,
}

/// Speech synthesis configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// "http" or "command"
    pub provider: Option<String>,
    pub url: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f32>,
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
}

/// Load the TOML config file from `path`, or the standard path when `None`
///
/// Returns `VoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> VoiceConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return VoiceConfigFile::default();
    };

    if !path.exists() {
        return VoiceConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                VoiceConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            VoiceConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/beacon/voice.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon")
            .join("voice.toml")
    })
}
