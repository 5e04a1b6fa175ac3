//! Text-to-speech (TTS) processing

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::playback::{AudioPlayback, decode_mp3};
use crate::config::{TtsConfig, TtsProvider};
use crate::settings::SettingsStore;
use crate::{Error, Result};

/// Speaks text aloud
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Speak `text`, returning once playback finished or was stopped
    ///
    /// # Errors
    ///
    /// Returns error if synthesis or playback fails
    async fn speak(&self, text: &str) -> Result<()>;

    /// Cut the current utterance short; a no-op when silent
    fn stop(&self);
}

/// Build the configured synthesizer
///
/// # Errors
///
/// Returns error if the provider is misconfigured
pub fn build_synthesizer(
    config: &TtsConfig,
    settings: Arc<dyn SettingsStore>,
) -> Result<Arc<dyn SpeechSynthesizer>> {
    match config.provider {
        TtsProvider::Http => Ok(Arc::new(HttpSynthesizer::new(config, settings)?)),
        TtsProvider::Command => Ok(Arc::new(CommandSynthesizer::new(config)?)),
    }
}

/// Fetches MP3 speech over HTTP and plays it on the preferred speaker
pub struct HttpSynthesizer {
    client: reqwest::Client,
    url: String,
    model: String,
    voice: String,
    speed: f32,
    settings: Arc<dyn SettingsStore>,
    stopped: Arc<AtomicBool>,
}

impl HttpSynthesizer {
    /// Create a new HTTP synthesizer
    ///
    /// # Errors
    ///
    /// Returns error if the URL is empty or the speed is out of range
    pub fn new(config: &TtsConfig, settings: Arc<dyn SettingsStore>) -> Result<Self> {
        if config.url.is_empty() {
            return Err(Error::Config("tts.url required for http provider".to_string()));
        }
        if !(0.25..=4.0).contains(&config.speed) {
            return Err(Error::Config(format!(
                "tts.speed must be within 0.25..=4.0, got {}",
                config.speed
            )));
        }

        Ok(Self {
            client: reqwest::Client::new(),
            url: config.url.clone(),
            model: config.model.clone(),
            voice: config.voice.clone(),
            speed: config.speed,
            settings,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Synthesize text to MP3 bytes
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct SpeechRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
        }

        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Tts(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Tts(format!("speech service error {status}: {body}")));
        }

        let audio = response.bytes().await.map_err(|e| Error::Tts(e.to_string()))?;
        Ok(audio.to_vec())
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn speak(&self, text: &str) -> Result<()> {
        self.stopped.store(false, Ordering::SeqCst);
        let mp3 = self.synthesize(text).await?;
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        let prefs = self.settings.device_preference();
        let stopped = Arc::clone(&self.stopped);
        tracing::debug!(bytes = mp3.len(), "playing synthesized speech");

        tokio::task::spawn_blocking(move || {
            let pcm = decode_mp3(&mp3)?;
            let output = AudioPlayback::open(Some(prefs.selected_speaker_index))?;
            output.play(pcm, prefs.speaker_volume, &stopped)
        })
        .await
        .map_err(|e| Error::Tts(format!("playback task failed: {e}")))?
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Speaks through a local program such as `espeak` or `say`
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
    stopped: AtomicBool,
    stop_signal: Notify,
}

impl CommandSynthesizer {
    /// Create a new command synthesizer
    ///
    /// # Errors
    ///
    /// Returns error if the program is empty
    pub fn new(config: &TtsConfig) -> Result<Self> {
        if config.program.trim().is_empty() {
            return Err(Error::Config("tts.program required for command provider".to_string()));
        }

        Ok(Self {
            program: config.program.clone(),
            args: config.args.clone(),
            stopped: AtomicBool::new(false),
            stop_signal: Notify::new(),
        })
    }

    /// Substitute `{text}`, appending the text when no argument mentions it
    fn render_args(&self, text: &str) -> Vec<String> {
        let mut args: Vec<String> = self.args.iter().map(|a| a.replace("{text}", text)).collect();
        if !self.args.iter().any(|a| a.contains("{text}")) {
            args.push(text.to_string());
        }
        args
    }
}

#[async_trait]
impl SpeechSynthesizer for CommandSynthesizer {
    async fn speak(&self, text: &str) -> Result<()> {
        self.stopped.store(false, Ordering::SeqCst);

        let stop = self.stop_signal.notified();
        tokio::pin!(stop);
        stop.as_mut().enable();

        let mut child = tokio::process::Command::new(&self.program)
            .args(self.render_args(text))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Tts(format!("failed to spawn {}: {e}", self.program)))?;

        if self.stopped.load(Ordering::SeqCst) {
            let _ = child.start_kill();
            return Ok(());
        }

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if !status.success() {
                    return Err(Error::Tts(format!("{} exited with {status}", self.program)));
                }
                Ok(())
            }
            () = &mut stop => {
                tracing::debug!(program = %self.program, "speech interrupted");
                child.start_kill()?;
                let _ = child.wait().await;
                Ok(())
            }
        }
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
    }
}
