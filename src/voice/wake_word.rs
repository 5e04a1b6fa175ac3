//! Wake word detection
//!
//! One keyword engine and one capture stream live on a dedicated blocking
//! thread. The thread reads a frame, classifies it and emits a [`WakeEvent`]
//! on a match, then keeps going. Detection never stops itself on a match;
//! whoever consumes the event decides whether to stop the detector before
//! opening its own recording.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WakeConfig;
use crate::events::{EventBus, VoiceEvent};
use crate::settings::SettingsStore;
use crate::{Error, Result};

/// Emitted each time the keyword engine matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WakeEvent {
    pub detected_at: DateTime<Utc>,
}

/// Keyword-spotting engine: classifies one frame at a time
pub trait KeywordEngine {
    /// Samples per frame the engine expects
    fn frame_len(&self) -> usize;

    /// Whether this frame completes a wake phrase match
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects the frame
    fn classify(&mut self, frame: &[f32]) -> Result<bool>;
}

/// Blocking source of fixed-size PCM frames
pub trait FrameSource {
    fn frame_len(&self) -> usize;

    /// Read the next frame, waiting at most `timeout`
    ///
    /// Returns `Ok(None)` when no full frame arrived in time.
    ///
    /// # Errors
    ///
    /// Returns error if the stream failed; the detection loop stops
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>>;
}

/// Opens an engine and a matching frame source
///
/// Called on the detection thread, so neither half needs to be `Send`.
pub trait WakeSource: Send + Sync {
    /// # Errors
    ///
    /// Returns error if the engine or the device is unavailable
    fn open(&self) -> Result<(Box<dyn KeywordEngine>, Box<dyn FrameSource>)>;
}

/// Start/stop surface shared by the focus arbiter and the voice loop
#[async_trait]
pub trait WakeControl: Send + Sync {
    /// Start detection; a no-op when already running
    ///
    /// # Errors
    ///
    /// Returns error if the engine or device fails to initialize
    async fn start(&self) -> Result<()>;

    /// Stop detection and release the device; safe to call when stopped
    async fn stop(&self);

    fn is_running(&self) -> bool;

    /// Observe running/stopped transitions, including the loop stopping itself
    fn watch_running(&self) -> watch::Receiver<bool>;
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Runs keyword spotting on the microphone
pub struct WakeWordDetector {
    source: Arc<dyn WakeSource>,
    read_timeout: Duration,
    wake_tx: mpsc::Sender<WakeEvent>,
    bus: EventBus,
    running: Mutex<Option<Running>>,
    state: Arc<watch::Sender<bool>>,
}

impl WakeWordDetector {
    #[must_use]
    pub fn new(
        source: Arc<dyn WakeSource>,
        read_timeout: Duration,
        wake_tx: mpsc::Sender<WakeEvent>,
        bus: EventBus,
    ) -> Self {
        let (state, _) = watch::channel(false);
        Self {
            source,
            read_timeout,
            wake_tx,
            bus,
            running: Mutex::new(None),
            state: Arc::new(state),
        }
    }
}

#[async_trait]
impl WakeControl for WakeWordDetector {
    async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;

        if let Some(r) = running.as_ref() {
            if !r.task.is_finished() {
                return Ok(());
            }
        }
        // Loop ended on its own after a read error; reap it
        if let Some(stale) = running.take() {
            let _ = stale.task.await;
        }

        let cancel = CancellationToken::new();
        let (init_tx, init_rx) = oneshot::channel();
        let ctx = LoopContext {
            source: Arc::clone(&self.source),
            read_timeout: self.read_timeout,
            wake_tx: self.wake_tx.clone(),
            bus: self.bus.clone(),
            state: Arc::clone(&self.state),
            cancel: cancel.clone(),
        };

        let task = tokio::task::spawn_blocking(move || detection_loop(ctx, init_tx));

        match init_rx.await {
            Ok(Ok(())) => {
                *running = Some(Running { cancel, task });
                tracing::info!("wake word detection started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = task.await;
                tracing::error!(error = %e, "wake word detector failed to initialize");
                Err(e)
            }
            Err(_) => {
                let _ = task.await;
                Err(Error::WakeWord("detection thread exited during startup".to_string()))
            }
        }
    }

    async fn stop(&self) {
        let Some(r) = self.running.lock().await.take() else {
            return;
        };

        r.cancel.cancel();
        if let Err(e) = r.task.await {
            tracing::error!(error = %e, "wake word thread panicked");
        }
        tracing::info!("wake word detection stopped");
    }

    fn is_running(&self) -> bool {
        *self.state.borrow()
    }

    fn watch_running(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }
}

struct LoopContext {
    source: Arc<dyn WakeSource>,
    read_timeout: Duration,
    wake_tx: mpsc::Sender<WakeEvent>,
    bus: EventBus,
    state: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
}

fn set_running(ctx: &LoopContext, running: bool) {
    ctx.state.send_replace(running);
    ctx.bus.publish(VoiceEvent::Detector { running });
}

fn detection_loop(ctx: LoopContext, init_tx: oneshot::Sender<Result<()>>) {
    let (mut engine, mut frames) = match ctx.source.open() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };

    if engine.frame_len() != frames.frame_len() {
        let _ = init_tx.send(Err(Error::WakeWord(format!(
            "frame length mismatch: engine {} vs stream {}",
            engine.frame_len(),
            frames.frame_len()
        ))));
        return;
    }

    set_running(&ctx, true);
    let _ = init_tx.send(Ok(()));

    while !ctx.cancel.is_cancelled() {
        let frame = match frames.read_frame(ctx.read_timeout) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(e) => {
                tracing::error!(error = %e, "wake word frame read failed, stopping detector");
                break;
            }
        };

        match engine.classify(&frame) {
            Ok(true) => {
                tracing::info!("wake word detected");
                ctx.bus.publish(VoiceEvent::WakeDetected);
                let event = WakeEvent {
                    detected_at: Utc::now(),
                };
                if ctx.wake_tx.try_send(event).is_err() {
                    tracing::debug!("wake event dropped, consumer busy");
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "keyword engine rejected frame"),
        }
    }

    // Engine and stream drop here, releasing the device before stop() returns
    drop(frames);
    drop(engine);
    set_running(&ctx, false);
}

/// Microphone-backed wake source using the configured keyword model
pub struct MicWakeSource {
    config: WakeConfig,
    settings: Arc<dyn SettingsStore>,
}

impl MicWakeSource {
    #[must_use]
    pub fn new(config: WakeConfig, settings: Arc<dyn SettingsStore>) -> Self {
        Self { config, settings }
    }
}

impl WakeSource for MicWakeSource {
    fn open(&self) -> Result<(Box<dyn KeywordEngine>, Box<dyn FrameSource>)> {
        let engine = build_engine(&self.config)?;
        let mic = self.settings.device_preference().selected_microphone_index;
        let frames = super::CpalFrameSource::open(Some(mic), engine.frame_len())?;
        Ok((engine, Box::new(frames)))
    }
}

#[cfg(feature = "wake-word")]
fn build_engine(config: &WakeConfig) -> Result<Box<dyn KeywordEngine>> {
    Ok(Box::new(RustpotterEngine::new(config)?))
}

#[cfg(not(feature = "wake-word"))]
fn build_engine(_config: &WakeConfig) -> Result<Box<dyn KeywordEngine>> {
    Err(Error::WakeWord(
        "built without the 'wake-word' feature; use a manual start instead".to_string(),
    ))
}

#[cfg(feature = "wake-word")]
mod engine {
    use rustpotter::{Rustpotter, RustpotterConfig, SampleFormat};

    use super::KeywordEngine;
    use crate::config::WakeConfig;
    use crate::voice::SAMPLE_RATE;
    use crate::{Error, Result};

    /// Keyword engine backed by rustpotter
    pub struct RustpotterEngine {
        detector: Rustpotter,
    }

    impl RustpotterEngine {
        /// Load the configured keyword model
        ///
        /// # Errors
        ///
        /// Returns error if no model is configured or it fails to load
        pub fn new(config: &WakeConfig) -> Result<Self> {
            let path = config
                .model_path
                .as_ref()
                .ok_or_else(|| Error::Config("wake.model_path required for wake word".to_string()))?;
            let path_str = path
                .to_str()
                .ok_or_else(|| Error::Config("wake.model_path is not valid UTF-8".to_string()))?;

            let mut rp_config = RustpotterConfig::default();
            rp_config.fmt.sample_rate = SAMPLE_RATE as usize;
            rp_config.fmt.channels = 1;
            rp_config.fmt.sample_format = SampleFormat::F32;
            rp_config.detector.threshold = config.sensitivity;

            let mut detector =
                Rustpotter::new(&rp_config).map_err(|e| Error::WakeWord(e.to_string()))?;
            detector
                .add_wakeword_from_file("beacon", path_str)
                .map_err(|e| Error::WakeWord(e.to_string()))?;

            tracing::info!(path = %path.display(), "wake word model loaded");
            Ok(Self { detector })
        }
    }

    impl KeywordEngine for RustpotterEngine {
        fn frame_len(&self) -> usize {
            self.detector.get_samples_per_frame()
        }

        fn classify(&mut self, frame: &[f32]) -> Result<bool> {
            Ok(self.detector.process_f32(frame).is_some())
        }
    }
}

#[cfg(feature = "wake-word")]
pub use engine::RustpotterEngine;

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const FRAME: usize = 4;

    /// Matches any frame whose first sample is loud
    struct ThresholdEngine;

    impl KeywordEngine for ThresholdEngine {
        fn frame_len(&self) -> usize {
            FRAME
        }

        fn classify(&mut self, frame: &[f32]) -> Result<bool> {
            Ok(frame[0] > 0.5)
        }
    }

    struct ScriptedFrames {
        frames: VecDeque<Vec<f32>>,
        fail_when_empty: bool,
    }

    impl FrameSource for ScriptedFrames {
        fn frame_len(&self) -> usize {
            FRAME
        }

        fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>> {
            if let Some(f) = self.frames.pop_front() {
                return Ok(Some(f));
            }
            if self.fail_when_empty {
                return Err(Error::Audio("device unplugged".to_string()));
            }
            std::thread::sleep(timeout.min(Duration::from_millis(5)));
            Ok(None)
        }
    }

    struct ScriptedSource {
        frames: Vec<Vec<f32>>,
        fail_when_empty: bool,
        fail_open: bool,
        opens: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(frames: Vec<Vec<f32>>) -> Self {
            Self {
                frames,
                fail_when_empty: false,
                fail_open: false,
                opens: AtomicUsize::new(0),
            }
        }
    }

    impl WakeSource for ScriptedSource {
        fn open(&self) -> Result<(Box<dyn KeywordEngine>, Box<dyn FrameSource>)> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(Error::WakeWord("model missing".to_string()));
            }
            Ok((
                Box::new(ThresholdEngine),
                Box::new(ScriptedFrames {
                    frames: self.frames.clone().into(),
                    fail_when_empty: self.fail_when_empty,
                }),
            ))
        }
    }

    fn detector(source: ScriptedSource) -> (WakeWordDetector, mpsc::Receiver<WakeEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let det = WakeWordDetector::new(
            Arc::new(source),
            Duration::from_millis(20),
            tx,
            EventBus::default(),
        );
        (det, rx)
    }

    #[tokio::test]
    async fn test_match_emits_wake_and_keeps_running() {
        let quiet = vec![0.0; FRAME];
        let loud = vec![0.9; FRAME];
        let (det, mut rx) = detector(ScriptedSource::new(vec![
            quiet.clone(),
            loud.clone(),
            quiet,
            loud,
        ]));

        det.start().await.unwrap();
        assert!(det.is_running());

        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        assert!(det.is_running());

        det.stop().await;
        assert!(!det.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (det, _rx) = detector(ScriptedSource::new(Vec::new()));

        det.stop().await;
        det.start().await.unwrap();
        det.stop().await;
        det.stop().await;
        assert!(!det.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_opens_once() {
        let source = Arc::new(ScriptedSource::new(Vec::new()));
        let (tx, _rx) = mpsc::channel(1);
        let det = WakeWordDetector::new(
            source.clone(),
            Duration::from_millis(20),
            tx,
            EventBus::default(),
        );

        det.start().await.unwrap();
        det.start().await.unwrap();
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
        det.stop().await;
    }

    #[tokio::test]
    async fn test_init_error_propagates_and_leaves_stopped() {
        let mut source = ScriptedSource::new(Vec::new());
        source.fail_open = true;
        let (det, _rx) = detector(source);

        let err = det.start().await.unwrap_err();
        assert!(matches!(err, Error::WakeWord(_)));
        assert!(!det.is_running());
    }

    #[tokio::test]
    async fn test_read_error_stops_loop_and_allows_restart() {
        let mut scripted = ScriptedSource::new(vec![vec![0.0; FRAME]]);
        scripted.fail_when_empty = true;
        let source = Arc::new(scripted);
        let (tx, _rx) = mpsc::channel(1);
        let det = WakeWordDetector::new(
            source.clone(),
            Duration::from_millis(20),
            tx,
            EventBus::default(),
        );

        det.start().await.unwrap();
        while det.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        det.start().await.unwrap();
        assert_eq!(source.opens.load(Ordering::SeqCst), 2);
        det.stop().await;
        assert!(!det.is_running());
    }
}
