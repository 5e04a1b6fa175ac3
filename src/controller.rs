//! Voice loop controller
//!
//! Owns the single active [`Session`] and drives it through
//! greeting, listening, processing and speaking until something ends it:
//! the main window regaining focus, the overlay auto-hiding, an explicit stop
//! or a device failure. Each session runs as its own task with a
//! [`CancellationToken`]; every timer it starts lives inside that task, so
//! tearing the session down drops them all.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::avatar::{AvatarEnded, AvatarHandle};
use crate::bridge::ConversationBridge;
use crate::config::VoiceTimings;
use crate::db::TurnRole;
use crate::events::{AvatarState, EndReason, EventBus, LoopState, Notice, VoiceEvent};
use crate::session::{RetryDecision, Session};
use crate::settings::SettingsStore;
use crate::voice::{AudioInput, SpeechSynthesizer, WakeControl, WakeEvent};
use crate::{Error, Result};

/// Fallback when no greetings are configured
const DEFAULT_GREETING: &str = "I'm listening.";

/// Commands accepted by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerCommand {
    /// Start a session regardless of window focus
    Start,
    /// End the active session, if any
    Stop(EndReason),
}

/// Sender side of the controller
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerCommand>,
}

impl ControllerHandle {
    pub async fn start(&self) {
        self.send(ControllerCommand::Start).await;
    }

    pub async fn stop(&self, reason: EndReason) {
        self.send(ControllerCommand::Stop(reason)).await;
    }

    async fn send(&self, cmd: ControllerCommand) {
        if self.tx.send(cmd).await.is_err() {
            tracing::debug!(?cmd, "voice loop gone, command dropped");
        }
    }
}

impl From<mpsc::Sender<ControllerCommand>> for ControllerHandle {
    fn from(tx: mpsc::Sender<ControllerCommand>) -> Self {
        Self { tx }
    }
}

/// Collaborators a session talks to
pub struct VoiceLoopParts {
    pub audio: Arc<dyn AudioInput>,
    pub wake: Arc<dyn WakeControl>,
    pub synth: Arc<dyn SpeechSynthesizer>,
    pub bridge: Arc<ConversationBridge>,
    pub settings: Arc<dyn SettingsStore>,
    pub avatar: AvatarHandle,
    pub bus: EventBus,
}

struct SessionContext {
    parts: VoiceLoopParts,
    timings: VoiceTimings,
}

struct ActiveSession {
    session_id: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A session that stopped itself
#[derive(Debug)]
struct SessionDone {
    session_id: Uuid,
    reason: EndReason,
}

/// Session state machine
pub struct VoiceLoopController {
    ctx: Arc<SessionContext>,
    greetings: Vec<String>,
    main_focused: watch::Receiver<bool>,
    session_active: watch::Sender<bool>,
    commands_tx: mpsc::Sender<ControllerCommand>,
    commands: mpsc::Receiver<ControllerCommand>,
    done_tx: mpsc::Sender<SessionDone>,
    done_rx: mpsc::Receiver<SessionDone>,
    active: Option<ActiveSession>,
}

impl VoiceLoopController {
    #[must_use]
    pub fn new(
        parts: VoiceLoopParts,
        timings: VoiceTimings,
        greetings: Vec<String>,
        main_focused: watch::Receiver<bool>,
    ) -> Self {
        let (commands_tx, commands) = mpsc::channel(16);
        let (done_tx, done_rx) = mpsc::channel(4);
        let (session_active, _) = watch::channel(false);

        Self {
            ctx: Arc::new(SessionContext { parts, timings }),
            greetings,
            main_focused,
            session_active,
            commands_tx,
            commands,
            done_tx,
            done_rx,
            active: None,
        }
    }

    #[must_use]
    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            tx: self.commands_tx.clone(),
        }
    }

    /// Observe whether a session is active
    #[must_use]
    pub fn watch_session_active(&self) -> watch::Receiver<bool> {
        self.session_active.subscribe()
    }

    /// Run the controller until every [`ControllerHandle`] is dropped
    #[must_use]
    pub fn spawn(
        self,
        wake_rx: mpsc::Receiver<WakeEvent>,
        avatar_ended: mpsc::Receiver<AvatarEnded>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(wake_rx, avatar_ended))
    }

    async fn run(
        mut self,
        mut wake_rx: mpsc::Receiver<WakeEvent>,
        mut avatar_ended: mpsc::Receiver<AvatarEnded>,
    ) {
        // Only handles keep the command channel open
        self.commands_tx = mpsc::channel(1).0;

        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(ControllerCommand::Start) => self.start_session("manual start").await,
                    Some(ControllerCommand::Stop(reason)) => self.end_session(reason).await,
                    None => break,
                },
                Some(event) = wake_rx.recv() => self.on_wake(event).await,
                Some(ended) = avatar_ended.recv() => {
                    if self.is_active(ended.session_id) {
                        self.end_session(ended.reason).await;
                    }
                }
                Some(done) = self.done_rx.recv() => {
                    if self.is_active(done.session_id) {
                        self.end_session(done.reason).await;
                    }
                }
            }
        }

        self.end_session(EndReason::Shutdown).await;
        tracing::debug!("voice loop controller stopped");
    }

    fn is_active(&self, session_id: Uuid) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.session_id == session_id)
    }

    async fn on_wake(&mut self, event: WakeEvent) {
        if *self.main_focused.borrow() {
            tracing::debug!("wake ignored, main window focused");
            return;
        }
        tracing::info!(detected_at = %event.detected_at, "wake word received");
        self.start_session("wake word").await;
    }

    async fn start_session(&mut self, trigger: &str) {
        if self.active.is_some() {
            tracing::debug!(trigger, "session already active");
            return;
        }

        let session = Session::new();
        let session_id = session.session_id;
        let parts = &self.ctx.parts;

        self.session_active.send_replace(true);
        // The detector holds the microphone
        parts.wake.stop().await;

        let greeting = self
            .greetings
            .choose(&mut rand::thread_rng())
            .map_or_else(|| DEFAULT_GREETING.to_string(), Clone::clone);

        parts.avatar.show(session_id, greeting.clone()).await;
        parts.bus.publish(VoiceEvent::SessionStarted { session_id });
        tracing::info!(%session_id, trigger, "session started");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_session(
            Arc::clone(&self.ctx),
            session,
            greeting,
            cancel.clone(),
            self.done_tx.clone(),
        ));

        self.active = Some(ActiveSession {
            session_id,
            cancel,
            task,
        });
    }

    async fn end_session(&mut self, reason: EndReason) {
        let Some(active) = self.active.take() else {
            return;
        };
        let parts = &self.ctx.parts;

        active.cancel.cancel();
        parts.synth.stop();
        if let Err(e) = active.task.await {
            tracing::error!(session_id = %active.session_id, error = %e, "session task panicked");
        }

        parts.avatar.hide(reason).await;
        parts.bus.publish(VoiceEvent::State {
            session_id: active.session_id,
            state: LoopState::Idle,
        });
        parts.bus.publish(VoiceEvent::SessionEnded {
            session_id: active.session_id,
            reason,
        });
        self.session_active.send_replace(false);

        tracing::info!(session_id = %active.session_id, ?reason, "session ended");
    }
}

async fn run_session(
    ctx: Arc<SessionContext>,
    mut session: Session,
    greeting: String,
    cancel: CancellationToken,
    done_tx: mpsc::Sender<SessionDone>,
) {
    let session_id = session.session_id;
    if let Some(reason) = drive(&ctx, &mut session, &greeting, &cancel).await {
        let _ = done_tx.send(SessionDone { session_id, reason }).await;
    }
}

/// Run the loop; `None` means cancelled, `Some` is why it stopped itself
async fn drive(
    ctx: &SessionContext,
    session: &mut Session,
    greeting: &str,
    cancel: &CancellationToken,
) -> Option<EndReason> {
    let parts = &ctx.parts;
    let timings = &ctx.timings;

    set_state(ctx, session, LoopState::Greeting, Some(greeting.to_string())).await;
    if let Err(e) = speak(ctx, greeting, cancel).await {
        if matches!(e, Error::Cancelled) {
            return None;
        }
        tracing::debug!(error = %e, "greeting not spoken");
    }

    loop {
        set_state(ctx, session, LoopState::Listening, None).await;

        let audio = match listen(ctx, cancel).await {
            Ok(audio) => audio,
            Err(Error::Cancelled) => return None,
            Err(e) if e.is_transient() => {
                tracing::debug!(session_id = %session.session_id, error = %e, "nothing captured");
                if !missed(ctx, session, cancel).await {
                    return None;
                }
                continue;
            }
            Err(e) => {
                tracing::error!(session_id = %session.session_id, error = %e, "capture failed, ending session");
                parts.bus.publish(VoiceEvent::Error {
                    message: e.to_string(),
                });
                return Some(EndReason::DeviceError);
            }
        };

        set_state(ctx, session, LoopState::Processing, None).await;

        let transcript = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            t = parts.audio.transcribe(&audio) => t,
        };

        let transcript = match transcript {
            Ok(Some(text)) => text,
            Ok(None) => {
                tracing::debug!(session_id = %session.session_id, "no speech in capture");
                if !missed(ctx, session, cancel).await {
                    return None;
                }
                continue;
            }
            Err(e) => {
                if !downstream_error(ctx, session, &e, cancel).await {
                    return None;
                }
                continue;
            }
        };

        session.reset_failures();
        session.touch();
        // Auto-hide waits while the model answers
        parts.avatar.hold_timeout().await;
        parts.bus.publish(VoiceEvent::Transcript {
            text: transcript.clone(),
        });
        tracing::info!(session_id = %session.session_id, transcript = %transcript, "user heard");

        let reply = converse(ctx, session, &transcript, cancel).await;
        parts.avatar.reset_timeout(timings.auto_hide).await;

        let reply = match reply {
            Ok(reply) => reply.trim().to_string(),
            Err(Error::Cancelled) => return None,
            Err(e) => {
                if !downstream_error(ctx, session, &e, cancel).await {
                    return None;
                }
                continue;
            }
        };

        parts.bus.publish(VoiceEvent::Reply {
            text: reply.clone(),
        });
        set_state(ctx, session, LoopState::Speaking, Some(reply.clone())).await;

        match speak(ctx, &reply, cancel).await {
            Ok(()) => {}
            Err(Error::Cancelled) => return None,
            Err(e) => {
                tracing::warn!(session_id = %session.session_id, error = %e, "speech synthesis failed");
                parts.bus.publish(VoiceEvent::Error {
                    message: e.to_string(),
                });
                parts
                    .avatar
                    .push(AvatarState::Error, Some(e.to_string()))
                    .await;
            }
        }

        session.reset_failures();
        session.touch();
        parts.avatar.reset_timeout(timings.auto_hide).await;

        if !pause(timings.settle_delay, cancel).await {
            return None;
        }
    }
}

async fn set_state(
    ctx: &SessionContext,
    session: &mut Session,
    state: LoopState,
    payload: Option<String>,
) {
    session.state = state;
    ctx.parts.bus.publish(VoiceEvent::State {
        session_id: session.session_id,
        state,
    });
    ctx.parts.avatar.push(state.avatar(), payload).await;
}

/// Record one utterance and return its audio
///
/// Whichever comes first ends the capture: the hard duration cap, the
/// recorder exiting on trailing silence, or cancellation. The capture is
/// always stopped through the manager so its file is validated.
async fn listen(ctx: &SessionContext, cancel: &CancellationToken) -> Result<Vec<u8>> {
    let parts = &ctx.parts;
    let prefs = parts.settings.device_preference();
    // The arbiter may have restarted the detector while the session began
    parts.wake.stop().await;
    let handle = parts.audio.start_recording(&prefs).await?;

    let cancelled = tokio::select! {
        () = tokio::time::sleep(handle.request.max_duration) => {
            tracing::debug!(recording_id = %handle.id, "max capture duration reached");
            false
        }
        () = handle.exited() => {
            tracing::debug!(recording_id = %handle.id, "capture ended on silence");
            false
        }
        () = cancel.cancelled() => true,
    };

    let audio = parts.audio.stop_recording(&handle).await;
    if cancelled {
        return Err(Error::Cancelled);
    }
    audio
}

/// Persist the user turn, stream the reply to the bus and return it
async fn converse(
    ctx: &SessionContext,
    session: &mut Session,
    transcript: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    let bridge = &ctx.parts.bridge;

    let conversation_id = bridge.ensure_conversation(session.conversation_id.as_deref())?;
    session.conversation_id = Some(conversation_id.clone());
    bridge.append_turn(&conversation_id, TurnRole::User, transcript)?;

    let bus = ctx.parts.bus.clone();
    bridge
        .dispatch(
            &conversation_id,
            transcript,
            |token| {
                bus.publish(VoiceEvent::Token {
                    text: token.to_string(),
                });
            },
            cancel,
        )
        .await
}

async fn speak(ctx: &SessionContext, text: &str, cancel: &CancellationToken) -> Result<()> {
    let synth = &ctx.parts.synth;
    tokio::select! {
        biased;
        () = cancel.cancelled() => {
            synth.stop();
            Err(Error::Cancelled)
        }
        result = synth.speak(text) => result,
    }
}

/// Apply the retry policy after a missed utterance; `false` when cancelled
async fn missed(ctx: &SessionContext, session: &mut Session, cancel: &CancellationToken) -> bool {
    let decision = session.record_failure(&ctx.timings);
    tracing::debug!(session_id = %session.session_id, ?decision, "retrying capture");

    if !pause(decision.delay(), cancel).await {
        return false;
    }
    if let RetryDecision::Escalate { .. } = decision {
        ctx.parts
            .bus
            .publish(VoiceEvent::Notice(Notice::StillListening));
    }
    true
}

/// Surface a downstream failure and back off; `false` when cancelled
async fn downstream_error(
    ctx: &SessionContext,
    session: &Session,
    error: &Error,
    cancel: &CancellationToken,
) -> bool {
    tracing::error!(session_id = %session.session_id, error = %error, "downstream failure, resuming");
    let message = error.to_string();
    ctx.parts.bus.publish(VoiceEvent::Error {
        message: message.clone(),
    });
    ctx.parts
        .avatar
        .push(AvatarState::Error, Some(message))
        .await;

    pause(ctx.timings.error_delay, cancel).await
}

/// Sleep unless cancelled first; `false` when cancelled
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
