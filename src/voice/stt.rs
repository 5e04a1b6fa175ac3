//! Speech-to-text (STT) processing

use async_trait::async_trait;

use crate::config::TranscriptionConfig;
use crate::{Error, Result};

/// Turns captured audio into text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe WAV audio
    ///
    /// Returns `Ok(None)` when the service answered but heard no speech.
    ///
    /// # Errors
    ///
    /// Returns `Error::Transcription` if the service is unreachable or failed
    async fn transcribe(&self, audio: &[u8]) -> Result<Option<String>>;
}

/// Response from the transcription service
///
/// A missing `transcription` field means no speech, not a failure.
#[derive(Debug, serde::Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    transcription: Option<String>,
}

impl TranscriptionResponse {
    fn into_text(self) -> Option<String> {
        self.transcription
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

/// Transcribes via an HTTP endpoint accepting `audio/wav` bodies
pub struct HttpTranscriber {
    client: reqwest::Client,
    url: String,
}

impl HttpTranscriber {
    /// Create a new transcriber
    ///
    /// # Errors
    ///
    /// Returns error if the URL is empty or the HTTP client cannot be built
    pub fn new(config: &TranscriptionConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(Error::Config("transcription.url required".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, audio: &[u8]) -> Result<Option<String>> {
        tracing::debug!(audio_bytes = audio.len(), "starting transcription");

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "audio/wav")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "transcription request failed");
                Error::Transcription(e.to_string())
            })?;

        let status = response.status();
        tracing::debug!(status = %status, "received response");

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription service error");
            return Err(Error::Transcription(format!("service error {status}: {body}")));
        }

        let result: TranscriptionResponse = response.json().await.map_err(|e| {
            tracing::error!(error = %e, "failed to parse transcription response");
            Error::Transcription(e.to_string())
        })?;

        let text = result.into_text();
        match &text {
            Some(t) => tracing::info!(transcript = %t, "transcription complete"),
            None => tracing::debug!("no speech detected"),
        }
        Ok(text)
    }
}
