//! Shared test utilities
//!
//! Scripted stand-ins for the audio, wake, synthesis and model collaborators,
//! plus a harness that wires them to a real controller, arbiter and avatar
//! presenter. Everything runs on tokio timers so tests can pause time.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::time::Instant;

use beacon_voice::bridge::{ConversationBridge, ModelBackend, ModelEvent, ModelRequest};
use beacon_voice::config::VoiceTimings;
use beacon_voice::db::{self, ConversationStore, SqliteConversationStore};
use beacon_voice::settings::{DevicePreference, MemorySettingsStore, Settings};
use beacon_voice::voice::{
    AudioInput, CaptureExit, CaptureRequest, RecordingHandle, SpeechSynthesizer, WakeControl,
    WakeEvent,
};
use beacon_voice::{
    AvatarPresenter, ControllerHandle, DbPool, Error, EventBus, FocusArbiter, FocusEvent,
    FocusKind, Result, VoiceEvent, VoiceLoopController, VoiceLoopParts, WindowKind,
};

/// Audio that transcribes to nothing
pub const SILENCE: &[u8] = b"<silence>";
/// Audio the transcription service fails on
pub const UNTRANSCRIBABLE: &[u8] = b"<fail>";

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Timings with a short flush so scenarios stay readable
#[must_use]
pub fn test_timings() -> VoiceTimings {
    VoiceTimings {
        flush_delay: Duration::from_millis(100),
        ..VoiceTimings::default()
    }
}

/// What one scripted capture does
#[derive(Debug, Clone)]
pub enum Utterance {
    /// The recorder exits on its own after `after` and leaves `audio`
    Speech { after: Duration, audio: Vec<u8> },
    /// The recorder runs until stopped and leaves silence
    Quiet,
    /// Stopping finds a header-only file
    Empty,
    /// The device is gone
    Unplugged,
}

impl Utterance {
    #[must_use]
    pub fn said(after: Duration, text: &str) -> Self {
        Self::Speech {
            after,
            audio: text.as_bytes().to_vec(),
        }
    }
}

/// Captures as seen by [`FakeAudio`]
#[derive(Debug, Clone)]
pub struct CaptureRecord {
    pub request: CaptureRequest,
    pub started: Instant,
    pub stopped: Option<Instant>,
}

struct ActiveFake {
    handle_id: uuid::Uuid,
    utterance: Utterance,
    // Keeps the exit channel open for captures that never exit
    _exit_tx: Option<watch::Sender<Option<CaptureExit>>>,
}

/// Scripted [`AudioInput`]; transcription maps audio bytes back to text
pub struct FakeAudio {
    script: Mutex<VecDeque<Utterance>>,
    timings: VoiceTimings,
    active: Mutex<Option<ActiveFake>>,
    pub captures: Mutex<Vec<CaptureRecord>>,
    pub overlaps: AtomicUsize,
}

impl FakeAudio {
    #[must_use]
    pub fn new(script: Vec<Utterance>, timings: VoiceTimings) -> Self {
        Self {
            script: Mutex::new(script.into()),
            timings,
            active: Mutex::new(None),
            captures: Mutex::new(Vec::new()),
            overlaps: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn captures(&self) -> Vec<CaptureRecord> {
        self.captures.lock().unwrap().clone()
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }
}

#[async_trait]
impl AudioInput for FakeAudio {
    async fn start_recording(&self, prefs: &DevicePreference) -> Result<RecordingHandle> {
        let mut active = self.active.lock().unwrap();
        if active.is_some() {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
            return Err(Error::AlreadyRecording);
        }

        let utterance = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Utterance::Quiet);
        if matches!(utterance, Utterance::Unplugged) {
            return Err(Error::Device("microphone unplugged".to_string()));
        }

        let request = CaptureRequest {
            max_duration: self.timings.max_capture,
            silence_timeout: self.timings.silence_timeout,
            device_index: prefs.selected_microphone_index,
            device_name: format!("mic {}", prefs.selected_microphone_index),
            volume: prefs.mic_volume,
        };
        let (exit_tx, exit_rx) = watch::channel(None);
        let keep = if let Utterance::Speech { after, .. } = &utterance {
            let after = *after;
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                exit_tx.send_replace(Some(CaptureExit {
                    code: Some(0),
                    interrupted: false,
                }));
            });
            None
        } else {
            Some(exit_tx)
        };

        let handle = RecordingHandle::new(request.clone(), exit_rx);
        *active = Some(ActiveFake {
            handle_id: handle.id,
            utterance,
            _exit_tx: keep,
        });
        self.captures.lock().unwrap().push(CaptureRecord {
            request,
            started: Instant::now(),
            stopped: None,
        });
        Ok(handle)
    }

    async fn stop_recording(&self, handle: &RecordingHandle) -> Result<Vec<u8>> {
        let current = {
            let mut active = self.active.lock().unwrap();
            match active.as_ref() {
                Some(a) if a.handle_id == handle.id => active.take(),
                _ => None,
            }
        };
        let Some(current) = current else {
            return Err(Error::NotRecording);
        };

        if let Some(last) = self.captures.lock().unwrap().last_mut() {
            last.stopped = Some(Instant::now());
        }
        tokio::time::sleep(self.timings.flush_delay).await;

        match current.utterance {
            Utterance::Speech { audio, .. } => Ok(audio),
            Utterance::Quiet => Ok(SILENCE.to_vec()),
            Utterance::Empty => Err(Error::EmptyCapture),
            Utterance::Unplugged => Err(Error::NotRecording),
        }
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<Option<String>> {
        if audio == SILENCE {
            Ok(None)
        } else if audio == UNTRANSCRIBABLE {
            Err(Error::Transcription("service unavailable".to_string()))
        } else {
            Ok(Some(String::from_utf8_lossy(audio).into_owned()))
        }
    }
}

/// Wake detector that only tracks whether it would be running
pub struct FakeWake {
    running: watch::Sender<bool>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl Default for FakeWake {
    fn default() -> Self {
        let (running, _) = watch::channel(false);
        Self {
            running,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }
}

impl FakeWake {
    #[must_use]
    pub fn is_running_now(&self) -> bool {
        *self.running.borrow()
    }

    /// The detection loop dies on a read error, as an unplugged mic does
    pub fn fail(&self) {
        self.running.send_replace(false);
    }
}

#[async_trait]
impl WakeControl for FakeWake {
    async fn start(&self) -> Result<()> {
        if !self.running.send_replace(true) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn stop(&self) {
        if self.running.send_replace(false) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    fn watch_running(&self) -> watch::Receiver<bool> {
        self.running.subscribe()
    }
}

/// Synthesizer that "speaks" for a fixed time and records what it said
pub struct FakeSynth {
    speak_time: Duration,
    stop: Notify,
    pub spoken: Mutex<Vec<String>>,
    pub stops: AtomicUsize,
    /// Every utterance fails once set
    pub broken: AtomicBool,
}

impl FakeSynth {
    #[must_use]
    pub fn new(speak_time: Duration) -> Self {
        Self {
            speak_time,
            stop: Notify::new(),
            spoken: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            broken: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynth {
    async fn speak(&self, text: &str) -> Result<()> {
        self.spoken.lock().unwrap().push(text.to_string());
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Tts("audio output unavailable".to_string()));
        }
        tokio::select! {
            () = tokio::time::sleep(self.speak_time) => {}
            () = self.stop.notified() => {}
        }
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.stop.notify_waiters();
    }
}

/// Model that streams the same scripted tokens for every request
pub struct FakeModel {
    tokens: Vec<String>,
    delay: Duration,
    pub requests: Mutex<Vec<ModelRequest>>,
    /// Requests are refused once set
    pub offline: AtomicBool,
}

impl FakeModel {
    #[must_use]
    pub fn new(tokens: &[&str], delay: Duration) -> Self {
        Self {
            tokens: tokens.iter().map(ToString::to_string).collect(),
            delay,
            requests: Mutex::new(Vec::new()),
            offline: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelBackend for FakeModel {
    async fn stream(&self, request: ModelRequest) -> Result<BoxStream<'static, Result<ModelEvent>>> {
        self.requests.lock().unwrap().push(request);
        tokio::time::sleep(self.delay).await;
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Agent("model unreachable".to_string()));
        }
        let events: Vec<Result<ModelEvent>> = self
            .tokens
            .iter()
            .cloned()
            .map(|t| Ok(ModelEvent::Token(t)))
            .chain(std::iter::once(Ok(ModelEvent::Done)))
            .collect();
        Ok(futures::stream::iter(events).boxed())
    }
}

/// Options for [`Harness::start`]
pub struct HarnessOptions {
    pub script: Vec<Utterance>,
    pub timings: VoiceTimings,
    pub speak_time: Duration,
    pub reply: Vec<&'static str>,
    /// How long the model thinks before its first token
    pub reply_delay: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            script: Vec::new(),
            timings: test_timings(),
            speak_time: Duration::from_secs(1),
            reply: vec!["Okay."],
            reply_delay: Duration::ZERO,
        }
    }
}

/// A running voice loop built from fakes
pub struct Harness {
    pub events: broadcast::Receiver<VoiceEvent>,
    pub audio: Arc<FakeAudio>,
    pub wake: Arc<FakeWake>,
    pub synth: Arc<FakeSynth>,
    pub model: Arc<FakeModel>,
    pub store: Arc<SqliteConversationStore>,
    pub controller: ControllerHandle,
    pub wake_tx: mpsc::Sender<WakeEvent>,
    pub focus_tx: mpsc::Sender<FocusEvent>,
    pub session_active: watch::Receiver<bool>,
    pub detection_enabled: watch::Sender<bool>,
}

impl Harness {
    #[must_use]
    pub fn start(options: HarnessOptions) -> Self {
        let bus = EventBus::new(4096);
        let events = bus.subscribe();
        let timings = options.timings;

        let audio = Arc::new(FakeAudio::new(options.script, timings));
        let wake = Arc::new(FakeWake::default());
        let synth = Arc::new(FakeSynth::new(options.speak_time));
        let model = Arc::new(FakeModel::new(&options.reply, options.reply_delay));
        let store = Arc::new(SqliteConversationStore::new(setup_test_db()));
        let settings = Arc::new(MemorySettingsStore::new(Settings::default()));
        let bridge = Arc::new(ConversationBridge::new(
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            Arc::clone(&model) as Arc<dyn ModelBackend>,
            Arc::clone(&settings) as _,
        ));

        let (ended_tx, ended_rx) = mpsc::channel(4);
        let (avatar, _avatar_task) =
            AvatarPresenter::spawn(bus.clone(), ended_tx, timings.auto_hide, timings.fade);

        let arbiter = FocusArbiter::new(false);
        let controller = VoiceLoopController::new(
            VoiceLoopParts {
                audio: Arc::clone(&audio) as _,
                wake: Arc::clone(&wake) as _,
                synth: Arc::clone(&synth) as _,
                bridge,
                settings,
                avatar,
                bus,
            },
            timings,
            vec!["Yes?".to_string()],
            arbiter.watch_main_focused(),
        );
        let handle = controller.handle();
        let session_active = controller.watch_session_active();

        let (wake_tx, wake_rx) = mpsc::channel(8);
        let (focus_tx, focus_rx) = mpsc::channel(8);
        let (detection_enabled, enabled_rx) = watch::channel(true);

        let _arbiter_task = arbiter.spawn(
            Arc::clone(&wake) as Arc<dyn WakeControl>,
            handle.clone(),
            focus_rx,
            session_active.clone(),
            enabled_rx,
        );
        let _controller_task = controller.spawn(wake_rx, ended_rx);

        Self {
            events,
            audio,
            wake,
            synth,
            model,
            store,
            controller: handle,
            wake_tx,
            focus_tx,
            session_active,
            detection_enabled,
        }
    }

    /// Fire the wake word
    pub async fn wake(&self) {
        self.wake_tx
            .send(WakeEvent {
                detected_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
    }

    /// Report a main-window focus change
    pub async fn main_window(&self, kind: FocusKind) {
        self.focus_tx
            .send(FocusEvent {
                window: WindowKind::Main,
                kind,
            })
            .await
            .unwrap();
    }

    /// Let every task run to idle and time move by `d`
    pub async fn advance(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }

    /// Events up to and including the first one matching `pred`
    ///
    /// Fails after a minute of test time.
    pub async fn collect_until(&mut self, pred: impl Fn(&VoiceEvent) -> bool) -> Vec<VoiceEvent> {
        let wait = async {
            let mut seen = Vec::new();
            loop {
                match self.events.recv().await {
                    Ok(event) => {
                        let done = pred(&event);
                        seen.push(event);
                        if done {
                            return seen;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(60), wait)
            .await
            .expect("timed out waiting for event")
    }

    /// Next event matching `pred`
    pub async fn wait_for(&mut self, pred: impl Fn(&VoiceEvent) -> bool) -> VoiceEvent {
        self.collect_until(pred)
            .await
            .pop()
            .expect("collect_until returns the match")
    }

    /// Every event published so far that has not been consumed
    pub fn drain(&mut self) -> Vec<VoiceEvent> {
        let mut out = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => out.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return out,
            }
        }
    }

    #[must_use]
    pub fn session_active(&self) -> bool {
        *self.session_active.borrow()
    }
}
