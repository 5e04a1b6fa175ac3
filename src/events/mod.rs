//! Presentation event bus
//!
//! Every component pushes typed [`VoiceEvent`]s onto one broadcast channel.
//! The overlay, the tray and the host IPC writer subscribe and render.
//! Publishing is best-effort: with no subscribers the event is dropped.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default bus capacity; slow subscribers past this lag and skip events
pub const DEFAULT_CAPACITY: usize = 256;

/// What the overlay shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AvatarState {
    Hidden,
    Listening,
    Processing,
    Speaking,
    Error,
}

/// Voice loop state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Greeting,
    Listening,
    Processing,
    Speaking,
}

impl LoopState {
    /// Overlay state that mirrors this loop state
    #[must_use]
    pub const fn avatar(self) -> AvatarState {
        match self {
            Self::Idle => AvatarState::Hidden,
            Self::Greeting | Self::Speaking => AvatarState::Speaking,
            Self::Listening => AvatarState::Listening,
            Self::Processing => AvatarState::Processing,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Main window regained focus
    FocusGained,
    /// Overlay auto-hid after no activity
    Inactivity,
    /// Explicit stop command
    Stopped,
    /// Capture device or engine failed
    DeviceError,
    /// Process is shutting down
    Shutdown,
}

/// Non-fatal side-channel notices
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// Configured microphone is gone, default device used instead
    DeviceFallback { requested: usize, fallback: usize },
    /// Several utterances in a row were empty
    StillListening,
}

/// Event pushed to the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceEvent {
    /// Keyword engine matched the wake phrase
    WakeDetected,
    /// Wake detector started or stopped
    Detector { running: bool },
    SessionStarted { session_id: Uuid },
    SessionEnded { session_id: Uuid, reason: EndReason },
    /// Loop moved to a new state
    State { session_id: Uuid, state: LoopState },
    /// Overlay state with optional caption
    Avatar {
        state: AvatarState,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
    },
    OverlayShown { greeting: String, fade_ms: u64 },
    OverlayHidden { fade_ms: u64 },
    /// User utterance as transcribed
    Transcript { text: String },
    /// One streamed model token
    Token { text: String },
    /// Complete assistant reply
    Reply { text: String },
    Notice(Notice),
    /// Downstream failure surfaced to the user
    Error { message: String },
}

/// Broadcast bus for [`VoiceEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<VoiceEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to every current subscriber
    pub fn publish(&self, event: VoiceEvent) {
        tracing::trace!(?event, "publish");
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.tx.subscribe()
    }
}
