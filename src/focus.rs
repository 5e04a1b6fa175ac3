//! Focus arbitration between the main window and background listening
//!
//! The wake detector should run only while voice detection is enabled, the
//! main window is not focused and no session is active. The arbiter
//! re-evaluates that on every focus change, session start or end, and
//! settings toggle. A detector that stops on its own while it is still
//! wanted is restarted after a backoff.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::controller::ControllerHandle;
use crate::events::EndReason;
use crate::voice::WakeControl;

/// Which window a focus event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Main,
    Overlay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FocusKind {
    Focus,
    Blur,
    Minimize,
    Restore,
}

impl FocusKind {
    /// Whether the window is now in front of the user
    #[must_use]
    pub const fn is_foreground(self) -> bool {
        matches!(self, Self::Focus | Self::Restore)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FocusEvent {
    pub window: WindowKind,
    pub kind: FocusKind,
}

/// Whether the wake detector should be running
#[must_use]
pub const fn detection_wanted(enabled: bool, main_focused: bool, session_active: bool) -> bool {
    enabled && !main_focused && !session_active
}

/// Owns the main-window focus flag
pub struct FocusArbiter {
    main_focused: watch::Sender<bool>,
}

impl FocusArbiter {
    /// `focused` is the main window's focus state at launch
    #[must_use]
    pub fn new(focused: bool) -> Self {
        let (main_focused, _) = watch::channel(focused);
        Self { main_focused }
    }

    #[must_use]
    pub fn watch_main_focused(&self) -> watch::Receiver<bool> {
        self.main_focused.subscribe()
    }

    /// Run until the focus channel closes
    #[must_use]
    pub fn spawn(
        self,
        wake: Arc<dyn WakeControl>,
        controller: ControllerHandle,
        focus_rx: mpsc::Receiver<FocusEvent>,
        session_active: watch::Receiver<bool>,
        detection_enabled: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let task = ArbiterTask {
            main_focused: self.main_focused,
            detector_running: wake.watch_running(),
            wake,
            controller,
            session_active,
            detection_enabled,
            restart_at: None,
            backoff: RESTART_BACKOFF,
        };
        tokio::spawn(task.run(focus_rx))
    }
}

/// Wait before restarting a detector that stopped on its own
pub const RESTART_BACKOFF: Duration = Duration::from_secs(1);
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(30);

struct ArbiterTask {
    main_focused: watch::Sender<bool>,
    wake: Arc<dyn WakeControl>,
    controller: ControllerHandle,
    session_active: watch::Receiver<bool>,
    detection_enabled: watch::Receiver<bool>,
    detector_running: watch::Receiver<bool>,
    restart_at: Option<Instant>,
    backoff: Duration,
}

impl ArbiterTask {
    async fn run(mut self, mut focus_rx: mpsc::Receiver<FocusEvent>) {
        self.reconcile().await;

        loop {
            let restart_at = self.restart_at;
            tokio::select! {
                event = focus_rx.recv() => match event {
                    Some(event) => self.on_focus(event).await,
                    None => break,
                },
                Ok(()) = self.session_active.changed() => self.reconcile().await,
                Ok(()) = self.detection_enabled.changed() => {
                    tracing::info!(enabled = *self.detection_enabled.borrow(), "voice detection toggled");
                    self.reconcile().await;
                }
                Ok(()) = self.detector_running.changed() => {
                    let running = *self.detector_running.borrow_and_update();
                    if !running && self.wanted() && self.restart_at.is_none() {
                        tracing::warn!(backoff = ?self.backoff, "wake word detector stopped on its own, restarting");
                        self.restart_at = Some(Instant::now() + self.backoff);
                    }
                }
                () = tokio::time::sleep_until(restart_at.unwrap_or_else(Instant::now)), if restart_at.is_some() => {
                    self.restart_at = None;
                    self.restart().await;
                }
            }
        }

        self.wake.stop().await;
        tracing::debug!("focus arbiter stopped");
    }

    async fn on_focus(&mut self, event: FocusEvent) {
        if event.window == WindowKind::Overlay {
            tracing::trace!(?event, "overlay focus ignored");
            return;
        }

        tracing::debug!(kind = ?event.kind, "main window focus changed");
        if event.kind.is_foreground() {
            self.main_focused.send_replace(true);
            self.wake.stop().await;
            self.controller.stop(EndReason::FocusGained).await;
        } else {
            self.main_focused.send_replace(false);
            self.reconcile().await;
        }
    }

    /// Retry after a self-stop, backing off while the device stays broken
    async fn restart(&mut self) {
        self.reconcile().await;

        if self.wake.is_running() || !self.wanted() {
            self.backoff = RESTART_BACKOFF;
            return;
        }

        self.backoff = (self.backoff * 2).min(MAX_RESTART_BACKOFF);
        self.restart_at = Some(Instant::now() + self.backoff);
    }

    fn wanted(&self) -> bool {
        detection_wanted(
            *self.detection_enabled.borrow(),
            *self.main_focused.borrow(),
            *self.session_active.borrow(),
        )
    }

    async fn reconcile(&self) {
        match (self.wanted(), self.wake.is_running()) {
            (true, false) => {
                if let Err(e) = self.wake.start().await {
                    tracing::error!(error = %e, "failed to start wake word detector");
                    return;
                }
                // A session may have claimed the microphone while the engine loaded
                if !self.wanted() {
                    tracing::debug!("detection no longer wanted after start, stopping");
                    self.wake.stop().await;
                }
            }
            (false, true) => self.wake.stop().await,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detection_wanted() {
        assert!(detection_wanted(true, false, false));
        assert!(!detection_wanted(false, false, false));
        assert!(!detection_wanted(true, true, false));
        assert!(!detection_wanted(true, false, true));
    }

    #[test]
    fn test_focus_event_wire_format() {
        let event: FocusEvent =
            serde_json::from_str(r#"{"window":"main","kind":"minimize"}"#).unwrap();
        assert_eq!(
            event,
            FocusEvent {
                window: WindowKind::Main,
                kind: FocusKind::Minimize
            }
        );
        assert!(!event.kind.is_foreground());
        assert!(FocusKind::Restore.is_foreground());
    }
}
