//! Error types for the Beacon voice loop

use thiserror::Error;

/// Result type alias for voice loop operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice loop
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio hardware or stream error
    #[error("audio error: {0}")]
    Audio(String),

    /// Capture device could not be opened or the capture process failed to start
    #[error("device error: {0}")]
    Device(String),

    /// A recording is already in flight
    #[error("a recording is already in progress")]
    AlreadyRecording,

    /// Stop was requested for a recording that is not the active one
    #[error("no matching recording in progress")]
    NotRecording,

    /// The capture file exists but holds no audio
    #[error("capture produced an empty file")]
    EmptyCapture,

    /// The capture process never produced an output file
    #[error("capture produced no output file")]
    NoFile,

    /// Transcription service was unreachable or answered with an error
    #[error("transcription error: {0}")]
    Transcription(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Wake word engine error
    #[error("wake word error: {0}")]
    WakeWord(String),

    /// Model dispatch error
    #[error("agent error: {0}")]
    Agent(String),

    /// Operation was cancelled by a stop or focus change
    #[error("operation cancelled")]
    Cancelled,

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether this is a capture outcome the voice loop retries instead of
    /// tearing the session down
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::EmptyCapture | Self::NoFile)
    }
}
