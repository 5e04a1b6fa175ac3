//! Read-only view of the chat app's user settings
//!
//! The voice loop never writes settings. Device preferences are re-read at the
//! start of every capture and the voice-detection flag is polled so it can be
//! toggled without a restart.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Default system prompt when the user hasn't set one
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are Beacon. Keep responses concise and conversational, they will be spoken aloud.";

/// Persisted audio device selection
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct DevicePreference {
    pub selected_microphone_index: usize,
    pub selected_speaker_index: usize,
    /// Capture gain, rendered into the recorder's `{volume}` argument
    pub mic_volume: f32,
    pub speaker_volume: f32,
}

impl Default for DevicePreference {
    fn default() -> Self {
        Self {
            selected_microphone_index: 0,
            selected_speaker_index: 0,
            mic_volume: 1.0,
            speaker_volume: 1.0,
        }
    }
}

/// A behavioral rule the user attached to the assistant
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Rule {
    pub text: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

const fn enabled_by_default() -> bool {
    true
}

/// Snapshot of the settings the voice loop cares about
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub devices: DevicePreference,
    pub rules: Vec<Rule>,
    pub system_prompt: String,
    pub voice_detection_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            devices: DevicePreference::default(),
            rules: Vec::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            voice_detection_enabled: true,
        }
    }
}

impl Settings {
    /// Text of every enabled rule, in order
    #[must_use]
    pub fn enabled_rules(&self) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.text.as_str())
            .collect()
    }
}

/// On-disk settings schema
#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(default)]
    devices: DevicePreference,
    #[serde(default)]
    rules: Vec<Rule>,
    system_prompt: Option<String>,
    voice_detection_enabled: Option<bool>,
}

impl From<SettingsFile> for Settings {
    fn from(file: SettingsFile) -> Self {
        Self {
            devices: file.devices,
            rules: file.rules,
            system_prompt: file
                .system_prompt
                .filter(|p| !p.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            voice_detection_enabled: file.voice_detection_enabled.unwrap_or(true),
        }
    }
}

/// Source of user settings
pub trait SettingsStore: Send + Sync {
    /// Current settings snapshot
    fn load(&self) -> Settings;

    /// Device selection for the next capture
    fn device_preference(&self) -> DevicePreference {
        self.load().devices
    }
}

/// Settings read from the chat app's TOML file on every call
#[derive(Debug, Clone)]
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    #[must_use]
    pub const fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self) -> Settings {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Settings::default(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to read settings");
                return Settings::default();
            }
        };

        match toml::from_str::<SettingsFile>(&content) {
            Ok(file) => file.into(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to parse settings");
                Settings::default()
            }
        }
    }
}

/// In-memory settings, for embedding hosts and tests
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    inner: RwLock<Settings>,
}

impl MemorySettingsStore {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }

    /// Replace the stored settings
    pub fn set(&self, settings: Settings) {
        if let Ok(mut inner) = self.inner.write() {
            *inner = settings;
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self) -> Settings {
        self.inner
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

/// Poll the voice-detection flag and publish changes
///
/// The task ends once every receiver of `tx` is dropped.
pub fn spawn_detection_poller(
    store: Arc<dyn SettingsStore>,
    interval: Duration,
    tx: watch::Sender<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }

            let enabled = store.load().voice_detection_enabled;
            tx.send_if_modified(|current| {
                if *current == enabled {
                    false
                } else {
                    tracing::info!(enabled, "voice detection setting changed");
                    *current = enabled;
                    true
                }
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_reads_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            r#"
            system_prompt = "Be brief."
            voice_detection_enabled = false

            [devices]
            selected_microphone_index = 3

            [[rules]]
            text = "Answer in English"

            [[rules]]
            text = "Never swear"
            enabled = false
            "#,
        )
        .unwrap();

        let settings = FileSettingsStore::new(path).load();
        assert_eq!(settings.system_prompt, "Be brief.");
        assert!(!settings.voice_detection_enabled);
        assert_eq!(settings.devices.selected_microphone_index, 3);
        assert!((settings.devices.mic_volume - 1.0).abs() < f32::EPSILON);
        assert_eq!(settings.enabled_rules(), vec!["Answer in English"]);
    }

    #[test]
    fn test_missing_or_broken_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let missing = FileSettingsStore::new(dir.path().join("nope.toml"));
        assert_eq!(missing.load(), Settings::default());

        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "devices = ").unwrap();
        assert_eq!(FileSettingsStore::new(path).load(), Settings::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_publishes_toggle() {
        let store = Arc::new(MemorySettingsStore::new(Settings::default()));
        let (tx, mut rx) = watch::channel(true);
        let handle = spawn_detection_poller(store.clone(), Duration::from_secs(2), tx);

        store.set(Settings {
            voice_detection_enabled: false,
            ..Settings::default()
        });

        rx.changed().await.unwrap();
        assert!(!*rx.borrow());

        drop(rx);
        tokio::time::advance(Duration::from_secs(3)).await;
        handle.await.unwrap();
    }
}
