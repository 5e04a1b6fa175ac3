//! Beacon Voice - hands-free voice loop for the Beacon desktop app
//!
//! This library provides the voice assistant core that runs beside the chat
//! application:
//! - Wake word detection gated by main-window focus
//! - Utterance capture, transcription and speech synthesis
//! - The session state machine with retry and inactivity handling
//! - Conversation persistence and streaming model dispatch
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Host app                          │
//! │   focus  │  start/stop  │  tray  │  overlay events   │
//! └────────────────────┬────────────────────────────────┘
//!                      │ ndjson
//! ┌────────────────────▼────────────────────────────────┐
//! │                 Beacon Voice                         │
//! │  FocusArbiter │ Controller │ Avatar │ Tray           │
//! │  Wake word    │ Capture    │ STT    │ TTS            │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │       ConversationBridge (LLM + SQLite)              │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod avatar;
pub mod bridge;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod db;
pub mod error;
pub mod events;
pub mod focus;
pub mod ipc;
pub mod session;
pub mod settings;
pub mod tray;
pub mod voice;

pub use avatar::{AvatarEnded, AvatarHandle, AvatarPresenter};
pub use bridge::{ConversationBridge, HttpModelBackend, ModelBackend, ModelEvent, ModelRequest};
pub use config::Config;
pub use controller::{ControllerCommand, ControllerHandle, VoiceLoopController, VoiceLoopParts};
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use events::{AvatarState, EndReason, EventBus, LoopState, Notice, VoiceEvent};
pub use focus::{FocusArbiter, FocusEvent, FocusKind, WindowKind};
pub use session::{RetryDecision, Session, retry_decision};
pub use settings::{DevicePreference, Settings, SettingsStore};
pub use tray::{TrayStatus, TraySupervisor};
