//! Configuration management for the Beacon voice loop

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::voice::{CaptureRequest, SAMPLE_RATE};
use crate::{Error, Result};

pub use file::{VoiceConfigFile, config_file_path, load_config_file};

/// Greetings spoken when a session opens
const DEFAULT_GREETINGS: &[&str] = &[
    "Hey, what's up?",
    "I'm listening.",
    "Yes?",
    "How can I help?",
    "What can I do for you?",
];

/// Voice loop configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the conversation database
    pub data_dir: PathBuf,

    /// Path to the chat app's settings file
    pub settings_path: PathBuf,

    /// Loop timings
    pub timings: VoiceTimings,

    /// Capture subprocess
    pub capture: CaptureConfig,

    /// Wake word engine
    pub wake: WakeConfig,

    /// Transcription service
    pub transcription: TranscriptionConfig,

    /// Language model backend
    pub llm: LlmConfig,

    /// Speech synthesis
    pub tts: TtsConfig,

    /// Greetings spoken when a session starts
    pub greetings: Vec<String>,
}

/// Timers that drive the voice loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceTimings {
    /// Hard cap on a single utterance capture
    pub max_capture: Duration,

    /// Trailing quiet that ends a capture
    pub silence_timeout: Duration,

    /// Pause before re-listening after a missed utterance
    pub retry_delay: Duration,

    /// Longer pause once the failure count reaches the limit
    pub escalation_delay: Duration,

    /// Missed utterances tolerated before escalating
    pub max_consecutive_failures: u32,

    /// Pause after speaking before listening again
    pub settle_delay: Duration,

    /// Pause after a downstream error before listening again
    pub error_delay: Duration,

    /// Overlay inactivity deadline
    pub auto_hide: Duration,

    /// Time given to the capture process to flush its file
    pub flush_delay: Duration,

    /// Overlay fade duration
    pub fade: Duration,

    /// How often the settings store is re-read
    pub settings_poll: Duration,
}

impl Default for VoiceTimings {
    fn default() -> Self {
        Self {
            max_capture: Duration::from_millis(8000),
            silence_timeout: Duration::from_millis(2000),
            retry_delay: Duration::from_millis(1500),
            escalation_delay: Duration::from_millis(3000),
            max_consecutive_failures: 3,
            settle_delay: Duration::from_millis(500),
            error_delay: Duration::from_millis(1500),
            auto_hide: Duration::from_secs(15),
            flush_delay: Duration::from_secs(1),
            fade: Duration::from_millis(300),
            settings_poll: Duration::from_secs(2),
        }
    }
}

/// Capture subprocess configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Program to run
    pub program: String,

    /// Argument template; see [`CaptureConfig::render_args`]
    pub args: Vec<String>,

    /// Fixed path the capture program writes to
    pub output_path: PathBuf,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let args = [
            "-q",
            "-v",
            "{volume}",
            "-t",
            "alsa",
            "{device_name}",
            "-c",
            "1",
            "-r",
            "{sample_rate}",
            "-b",
            "16",
            "{output}",
            "silence",
            "1",
            "0.1",
            "1%",
            "1",
            "{silence_secs}",
            "1%",
            "trim",
            "0",
            "{max_secs}",
        ];

        Self {
            program: "sox".to_string(),
            args: args.iter().map(ToString::to_string).collect(),
            output_path: std::env::temp_dir().join("beacon-voice-capture.wav"),
        }
    }
}

impl CaptureConfig {
    /// Substitute capture parameters into the argument template
    ///
    /// Supported placeholders: `{device_name}`, `{device}`, `{volume}`,
    /// `{output}`, `{sample_rate}`, `{max_secs}` and `{silence_secs}`.
    ///
    /// `{device}` is the position in the audio host's enumeration, not an
    /// ALSA card number. The host lists virtual PCMs such as `default` and
    /// `pulse` first, so `hw:{device}` usually names the wrong card; prefer
    /// `{device_name}`, which the ALSA tools accept as a PCM name.
    #[must_use]
    pub fn render_args(&self, request: &CaptureRequest) -> Vec<String> {
        let output = self.output_path.display().to_string();
        let max_secs = format!("{:.1}", request.max_duration.as_secs_f32());
        let silence_secs = format!("{:.1}", request.silence_timeout.as_secs_f32());
        let volume = format!("{:.2}", request.volume);

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{device_name}", &request.device_name)
                    .replace("{device}", &request.device_index.to_string())
                    .replace("{volume}", &volume)
                    .replace("{output}", &output)
                    .replace("{sample_rate}", &SAMPLE_RATE.to_string())
                    .replace("{max_secs}", &max_secs)
                    .replace("{silence_secs}", &silence_secs)
            })
            .collect()
    }
}

/// Wake word engine configuration
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Keyword model file
    pub model_path: Option<PathBuf>,

    /// Detection threshold (0.0 - 1.0)
    pub sensitivity: f32,

    /// Longest a single frame read may block before the stop signal is checked
    pub read_timeout: Duration,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            sensitivity: 0.5,
            read_timeout: Duration::from_millis(200),
        }
    }
}

/// Transcription service configuration
#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    /// Endpoint accepting `audio/wav` bodies
    pub url: String,

    /// Request timeout
    pub timeout: Duration,
}

/// LLM backend configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Streaming chat endpoint
    pub url: String,
}

/// Speech synthesis backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsProvider {
    /// HTTP speech endpoint returning MP3, played locally
    Http,
    /// Local speech command (espeak, say)
    Command,
}

impl std::str::FromStr for TtsProvider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "command" | "local" => Ok(Self::Command),
            other => Err(Error::Config(format!("unknown tts provider: {other}"))),
        }
    }
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Which backend speaks
    pub provider: TtsProvider,

    /// Speech endpoint for the HTTP provider
    pub url: String,

    /// TTS model name
    pub model: String,

    /// Voice identifier
    pub voice: String,

    /// Speed multiplier (0.25 to 4.0)
    pub speed: f32,

    /// Program for the command provider
    pub program: String,

    /// Argument template; `{text}` is replaced with the utterance
    pub args: Vec<String>,
}

impl Config {
    /// Load configuration from the config file and process environment
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = load_config_file(path);
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file overlay and an environment lookup
    ///
    /// Precedence is env > file > default.
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn from_sources(fc: VoiceConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base_dirs = directories::BaseDirs::new();

        // ~/.local/share/omni/beacon on Linux
        let data_dir = env("BEACON_DATA_DIR")
            .or(fc.data_dir)
            .map_or_else(
                || {
                    base_dirs.as_ref().map_or_else(
                        || PathBuf::from("."),
                        |d| d.data_dir().join("omni").join("beacon"),
                    )
                },
                PathBuf::from,
            );

        let settings_path = env("BEACON_SETTINGS").or(fc.settings_path).map_or_else(
            || {
                base_dirs.as_ref().map_or_else(
                    || PathBuf::from("settings.toml"),
                    |d| d.config_dir().join("omni").join("beacon").join("settings.toml"),
                )
            },
            PathBuf::from,
        );

        let timings = merge_timings(&fc.timings)?;

        let default_capture = CaptureConfig::default();
        let capture = CaptureConfig {
            program: fc.capture.program.unwrap_or(default_capture.program),
            args: fc.capture.args.unwrap_or(default_capture.args),
            output_path: fc
                .capture
                .output_path
                .map_or(default_capture.output_path, PathBuf::from),
        };

        let default_wake = WakeConfig::default();
        let sensitivity = fc.wake.sensitivity.unwrap_or(default_wake.sensitivity);
        if !(0.0..=1.0).contains(&sensitivity) {
            return Err(Error::Config(format!(
                "wake.sensitivity must be within 0.0..=1.0, got {sensitivity}"
            )));
        }
        let wake = WakeConfig {
            model_path: env("BEACON_WAKE_MODEL")
                .or(fc.wake.model_path)
                .map(PathBuf::from),
            sensitivity,
            ..default_wake
        };

        let transcription = TranscriptionConfig {
            url: env("BEACON_TRANSCRIBE_URL")
                .or(fc.transcription.url)
                .unwrap_or_else(|| "http://127.0.0.1:8080/api/transcribe".to_string()),
            timeout: Duration::from_millis(fc.transcription.timeout_ms.unwrap_or(30_000)),
        };

        let llm = LlmConfig {
            url: env("BEACON_LLM_URL")
                .or(fc.llm.url)
                .unwrap_or_else(|| "http://127.0.0.1:8080/api/chat/stream".to_string()),
        };

        let provider = match env("BEACON_TTS_PROVIDER").or(fc.tts.provider) {
            Some(p) => p.parse()?,
            None => TtsProvider::Http,
        };
        let tts = TtsConfig {
            provider,
            url: env("BEACON_TTS_URL")
                .or(fc.tts.url)
                .unwrap_or_else(|| "http://127.0.0.1:8080/api/speech".to_string()),
            model: fc.tts.model.unwrap_or_else(|| "tts-1".to_string()),
            voice: fc.tts.voice.unwrap_or_else(|| "alloy".to_string()),
            speed: fc.tts.speed.unwrap_or(1.0),
            program: fc.tts.program.unwrap_or_else(|| "espeak".to_string()),
            args: fc.tts.args.unwrap_or_else(|| vec!["{text}".to_string()]),
        };

        let greetings = fc
            .greetings
            .filter(|g| !g.is_empty())
            .unwrap_or_else(|| DEFAULT_GREETINGS.iter().map(ToString::to_string).collect());

        Ok(Self {
            data_dir,
            settings_path,
            timings,
            capture,
            wake,
            transcription,
            llm,
            tts,
            greetings,
        })
    }

    /// Path of the conversation database
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("voice.db")
    }
}

fn merge_timings(fc: &file::TimingsFileConfig) -> Result<VoiceTimings> {
    let d = VoiceTimings::default();
    let ms = |v: Option<u64>, default: Duration| v.map_or(default, Duration::from_millis);

    let timings = VoiceTimings {
        max_capture: ms(fc.max_capture_ms, d.max_capture),
        silence_timeout: ms(fc.silence_timeout_ms, d.silence_timeout),
        retry_delay: ms(fc.retry_delay_ms, d.retry_delay),
        escalation_delay: ms(fc.escalation_delay_ms, d.escalation_delay),
        max_consecutive_failures: fc
            .max_consecutive_failures
            .unwrap_or(d.max_consecutive_failures),
        settle_delay: ms(fc.settle_delay_ms, d.settle_delay),
        error_delay: ms(fc.error_delay_ms, d.error_delay),
        auto_hide: ms(fc.auto_hide_ms, d.auto_hide),
        flush_delay: ms(fc.flush_delay_ms, d.flush_delay),
        fade: ms(fc.fade_ms, d.fade),
        settings_poll: ms(fc.settings_poll_ms, d.settings_poll),
    };

    if timings.max_consecutive_failures == 0 {
        return Err(Error::Config(
            "timings.max_consecutive_failures must be at least 1".to_string(),
        ));
    }
    for (name, value) in [
        ("max_capture_ms", timings.max_capture),
        ("auto_hide_ms", timings.auto_hide),
        ("settings_poll_ms", timings.settings_poll),
    ] {
        if value.is_zero() {
            return Err(Error::Config(format!("timings.{name} must be non-zero")));
        }
    }

    Ok(timings)
}
