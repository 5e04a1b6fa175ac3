//! Avatar overlay presenter
//!
//! The overlay's visible state is owned by a single task. Callers talk to it
//! through an [`AvatarHandle`]; it renders by publishing on the event bus and
//! reports the end of a session when it hides, whether asked to or because
//! the inactivity deadline passed.
//!
//! The deadline is suspended while the assistant is speaking or a reply is
//! being produced, and re-armed when either ends. Failed listen cycles keep
//! it running.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::events::{AvatarState, EndReason, EventBus, VoiceEvent};

/// Why and for which session the overlay went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvatarEnded {
    pub session_id: Uuid,
    pub reason: EndReason,
}

#[derive(Debug)]
enum AvatarCommand {
    Show { session_id: Uuid, greeting: String },
    Hide { reason: EndReason },
    Push {
        state: AvatarState,
        payload: Option<String>,
    },
    ResetTimeout(Duration),
    Hold,
}

/// Cheap, cloneable sender side of the presenter
#[derive(Debug, Clone)]
pub struct AvatarHandle {
    tx: mpsc::Sender<AvatarCommand>,
}

impl AvatarHandle {
    /// Fade the overlay in for `session_id`
    pub async fn show(&self, session_id: Uuid, greeting: impl Into<String>) {
        self.send(AvatarCommand::Show {
            session_id,
            greeting: greeting.into(),
        })
        .await;
    }

    /// Fade the overlay out; ends the session it belongs to
    pub async fn hide(&self, reason: EndReason) {
        self.send(AvatarCommand::Hide { reason }).await;
    }

    /// Render a new state
    pub async fn push(&self, state: AvatarState, payload: Option<String>) {
        self.send(AvatarCommand::Push { state, payload }).await;
    }

    /// Move the inactivity deadline to `timeout` from now
    ///
    /// Also releases a [`hold_timeout`](Self::hold_timeout).
    pub async fn reset_timeout(&self, timeout: Duration) {
        self.send(AvatarCommand::ResetTimeout(timeout)).await;
    }

    /// Suspend the inactivity deadline until the next reset
    pub async fn hold_timeout(&self) {
        self.send(AvatarCommand::Hold).await;
    }

    async fn send(&self, cmd: AvatarCommand) {
        if self.tx.send(cmd).await.is_err() {
            tracing::debug!("avatar presenter gone, command dropped");
        }
    }
}

/// Owns the overlay state and its auto-hide timer
pub struct AvatarPresenter {
    bus: EventBus,
    ended_tx: mpsc::Sender<AvatarEnded>,
    fade: Duration,
    timeout: Duration,
    state: AvatarState,
    session_id: Option<Uuid>,
    deadline: Option<Instant>,
    held: bool,
}

impl AvatarPresenter {
    /// Start the presenter task
    ///
    /// Session ends are delivered on `ended_tx`.
    #[must_use]
    pub fn spawn(
        bus: EventBus,
        ended_tx: mpsc::Sender<AvatarEnded>,
        auto_hide: Duration,
        fade: Duration,
    ) -> (AvatarHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(32);
        let presenter = Self {
            bus,
            ended_tx,
            fade,
            timeout: auto_hide,
            state: AvatarState::Hidden,
            session_id: None,
            deadline: None,
            held: false,
        };
        let task = tokio::spawn(presenter.run(rx));
        (AvatarHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<AvatarCommand>) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    tracing::info!(session_id = ?self.session_id, "avatar auto-hide after inactivity");
                    self.hide(EndReason::Inactivity).await;
                }
            }
        }
    }

    async fn handle(&mut self, cmd: AvatarCommand) {
        match cmd {
            AvatarCommand::Show {
                session_id,
                greeting,
            } => self.show(session_id, greeting),
            AvatarCommand::Hide { reason } => self.hide(reason).await,
            AvatarCommand::Push { state, payload } => self.push(state, payload),
            AvatarCommand::ResetTimeout(timeout) => {
                self.timeout = timeout;
                self.held = false;
                if self.session_id.is_some() && !self.is_busy() {
                    self.arm();
                }
            }
            AvatarCommand::Hold => {
                if self.session_id.is_some() {
                    self.held = true;
                    self.deadline = None;
                }
            }
        }
    }

    fn show(&mut self, session_id: Uuid, greeting: String) {
        if let Some(current) = self.session_id {
            tracing::warn!(%current, %session_id, "avatar already showing, replacing session");
        }

        self.session_id = Some(session_id);
        self.state = AvatarState::Listening;
        self.held = false;
        self.arm();
        self.bus.publish(VoiceEvent::OverlayShown {
            greeting,
            fade_ms: self.fade_ms(),
        });
        tracing::debug!(%session_id, "avatar shown");
    }

    async fn hide(&mut self, reason: EndReason) {
        let Some(session_id) = self.session_id.take() else {
            return;
        };

        self.state = AvatarState::Hidden;
        self.deadline = None;
        self.held = false;
        self.bus.publish(VoiceEvent::Avatar {
            state: AvatarState::Hidden,
            payload: None,
        });
        self.bus.publish(VoiceEvent::OverlayHidden {
            fade_ms: self.fade_ms(),
        });
        tracing::debug!(%session_id, ?reason, "avatar hidden");

        if self
            .ended_tx
            .send(AvatarEnded { session_id, reason })
            .await
            .is_err()
        {
            tracing::debug!("no listener for avatar session end");
        }
    }

    fn push(&mut self, state: AvatarState, payload: Option<String>) {
        if self.session_id.is_none() {
            tracing::trace!(?state, "avatar hidden, ignoring state");
            return;
        }

        self.state = state;
        if self.is_busy() {
            self.deadline = None;
        } else if self.deadline.is_none() {
            self.arm();
        }
        self.bus.publish(VoiceEvent::Avatar { state, payload });
    }

    const fn is_busy(&self) -> bool {
        self.held || matches!(self.state, AvatarState::Speaking)
    }

    fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.timeout);
    }

    fn fade_ms(&self) -> u64 {
        u64::try_from(self.fade.as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast;

    use super::*;

    const AUTO_HIDE: Duration = Duration::from_secs(15);

    fn presenter() -> (
        AvatarHandle,
        mpsc::Receiver<AvatarEnded>,
        broadcast::Receiver<VoiceEvent>,
    ) {
        let bus = EventBus::default();
        let events = bus.subscribe();
        let (ended_tx, ended_rx) = mpsc::channel(4);
        let (handle, _task) =
            AvatarPresenter::spawn(bus, ended_tx, AUTO_HIDE, Duration::from_millis(300));
        (handle, ended_rx, events)
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_hide_ends_session() {
        let (avatar, mut ended, mut events) = presenter();
        let id = Uuid::new_v4();

        avatar.show(id, "Yes?").await;
        tokio::time::sleep(Duration::from_secs(16)).await;

        assert_eq!(
            ended.try_recv().unwrap(),
            AvatarEnded {
                session_id: id,
                reason: EndReason::Inactivity
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            VoiceEvent::OverlayShown {
                greeting: "Yes?".to_string(),
                fade_ms: 300
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            VoiceEvent::Avatar {
                state: AvatarState::Hidden,
                payload: None
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            VoiceEvent::OverlayHidden { fade_ms: 300 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_extends_deadline() {
        let (avatar, mut ended, _events) = presenter();
        let id = Uuid::new_v4();

        avatar.show(id, "Hi").await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        avatar.reset_timeout(AUTO_HIDE).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(ended.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(ended.try_recv().unwrap().reason, EndReason::Inactivity);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_suspended_while_speaking() {
        let (avatar, mut ended, _events) = presenter();
        let id = Uuid::new_v4();

        avatar.show(id, "Hi").await;
        avatar.push(AvatarState::Speaking, Some("a long answer".to_string())).await;
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(ended.try_recv().is_err());

        avatar.push(AvatarState::Listening, None).await;
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(ended.try_recv().unwrap().session_id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_suspends_deadline_until_reset() {
        let (avatar, mut ended, _events) = presenter();
        let id = Uuid::new_v4();

        avatar.show(id, "Hi").await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        avatar.hold_timeout().await;
        avatar.push(AvatarState::Processing, None).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(ended.try_recv().is_err());

        avatar.reset_timeout(AUTO_HIDE).await;
        tokio::time::sleep(Duration::from_secs(14)).await;
        assert!(ended.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(ended.try_recv().unwrap().reason, EndReason::Inactivity);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_hide_reports_once() {
        let (avatar, mut ended, _events) = presenter();
        let id = Uuid::new_v4();

        avatar.show(id, "Hi").await;
        avatar.hide(EndReason::FocusGained).await;
        avatar.hide(EndReason::Stopped).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(
            ended.try_recv().unwrap(),
            AvatarEnded {
                session_id: id,
                reason: EndReason::FocusGained
            }
        );
        assert!(ended.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_while_hidden_is_ignored() {
        let (avatar, _ended, mut events) = presenter();

        avatar.push(AvatarState::Speaking, None).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(events.try_recv().is_err());
    }
}
