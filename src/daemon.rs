//! Daemon that wires the voice loop together and runs it until shutdown

use std::sync::Arc;

use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::avatar::AvatarPresenter;
use crate::bridge::{ConversationBridge, HttpModelBackend};
use crate::config::Config;
use crate::controller::{VoiceLoopController, VoiceLoopParts};
use crate::db::{self, SqliteConversationStore};
use crate::events::EventBus;
use crate::focus::FocusArbiter;
use crate::ipc::{self, HostRouter};
use crate::settings::{FileSettingsStore, SettingsStore, spawn_detection_poller};
use crate::tray::TraySupervisor;
use crate::voice::{
    AudioDeviceManager, CpalEnumerator, HttpTranscriber, MicWakeSource, SubprocessBackend,
    WakeControl, WakeWordDetector, build_synthesizer,
};
use crate::Result;

/// The voice loop daemon
pub struct Daemon {
    config: Config,
    host_ipc: bool,
}

impl Daemon {
    /// Create a daemon; `host_ipc` enables the stdin/stdout link to the host
    #[must_use]
    pub const fn new(config: Config, host_ipc: bool) -> Self {
        Self { config, host_ipc }
    }

    /// Run until ctrl-c, a host shutdown message, or the host closing stdin
    ///
    /// # Errors
    ///
    /// Returns error if a component fails to initialize
    #[allow(clippy::too_many_lines)]
    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let timings = config.timings;
        let bus = EventBus::default();

        let shutdown = CancellationToken::new();
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received");
                    shutdown.cancel();
                }
            });
        }

        let settings: Arc<dyn SettingsStore> =
            Arc::new(FileSettingsStore::new(config.settings_path.clone()));

        // Conversation persistence and model backend
        let pool = db::init(config.db_path())?;
        let bridge = Arc::new(ConversationBridge::new(
            Arc::new(SqliteConversationStore::new(pool)),
            Arc::new(HttpModelBackend::new(&config.llm)?),
            Arc::clone(&settings),
        ));

        // Audio in and out
        let audio = Arc::new(AudioDeviceManager::new(
            Arc::new(CpalEnumerator),
            Arc::new(SubprocessBackend::new(config.capture.clone())),
            Arc::new(HttpTranscriber::new(&config.transcription)?),
            bus.clone(),
            config.capture.output_path.clone(),
            timings,
        ));
        let synth = build_synthesizer(&config.tts, Arc::clone(&settings))?;

        let (wake_tx, wake_rx) = mpsc::channel(8);
        let detector = Arc::new(WakeWordDetector::new(
            Arc::new(MicWakeSource::new(config.wake.clone(), Arc::clone(&settings))),
            config.wake.read_timeout,
            wake_tx,
            bus.clone(),
        ));
        let wake: Arc<dyn WakeControl> = detector.clone();

        let (ended_tx, ended_rx) = mpsc::channel(4);
        let (avatar, avatar_task) =
            AvatarPresenter::spawn(bus.clone(), ended_tx, timings.auto_hide, timings.fade);

        // The host reports focus once it is up
        let arbiter = FocusArbiter::new(false);
        let controller = VoiceLoopController::new(
            VoiceLoopParts {
                audio,
                wake: Arc::clone(&wake),
                synth,
                bridge,
                settings: Arc::clone(&settings),
                avatar,
                bus: bus.clone(),
            },
            timings,
            config.greetings.clone(),
            arbiter.watch_main_focused(),
        );
        let handle = controller.handle();
        let session_active = controller.watch_session_active();

        let (enabled_tx, enabled_rx) = watch::channel(settings.load().voice_detection_enabled);
        let poller = spawn_detection_poller(Arc::clone(&settings), timings.settings_poll, enabled_tx);

        let (focus_tx, focus_rx) = mpsc::channel(16);
        let arbiter_task = arbiter.spawn(
            wake,
            handle.clone(),
            focus_rx,
            session_active.clone(),
            enabled_rx,
        );

        let (tray_tx, tray_rx) = mpsc::channel(4);
        let (tray_status, tray_task) =
            TraySupervisor::spawn(detector.watch_running(), session_active, tray_rx);

        let writer_stop = CancellationToken::new();
        let writer = self.host_ipc.then(|| {
            tokio::spawn(ipc::write_events(
                tokio::io::stdout(),
                bus.subscribe(),
                tray_status,
                writer_stop.clone(),
            ))
        });

        let controller_task = controller.spawn(wake_rx, ended_rx);

        let router = HostRouter::new(focus_tx, handle, tray_tx, shutdown.clone());
        let host_ipc = self.host_ipc;
        let reader_shutdown = shutdown.clone();
        let reader = tokio::spawn(async move {
            if host_ipc {
                ipc::read_host(BufReader::new(tokio::io::stdin()), &router).await
            } else {
                reader_shutdown.cancelled().await;
                drop(router);
                Ok(())
            }
        });

        tracing::info!(
            host_ipc,
            wake_word = cfg!(feature = "wake-word"),
            "voice daemon ready"
        );

        shutdown.cancelled().await;
        tracing::info!("shutting down");

        // Dropping the router closes the focus and tray channels, which ends
        // the arbiter and the tray; the last controller handle goes with the
        // arbiter, which ends the controller and its session.
        match reader.await {
            Ok(Err(e)) => tracing::warn!(error = %e, "host reader failed"),
            Err(e) => tracing::warn!(error = %e, "host reader panicked"),
            Ok(Ok(())) => {}
        }
        for (name, task) in [
            ("arbiter", arbiter_task),
            ("tray", tray_task),
            ("controller", controller_task),
            ("avatar", avatar_task),
        ] {
            if let Err(e) = task.await {
                tracing::warn!(task = name, error = %e, "task ended abnormally");
            }
        }
        poller.abort();

        writer_stop.cancel();
        if let Some(writer) = writer {
            match writer.await {
                Ok(Err(e)) => tracing::warn!(error = %e, "event writer failed"),
                Err(e) => tracing::warn!(error = %e, "event writer panicked"),
                Ok(Ok(())) => {}
            }
        }

        tracing::info!("voice daemon stopped");
        Ok(())
    }
}
