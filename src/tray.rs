//! Tray status supervisor
//!
//! Derives the background status icon from detector and session activity.
//! A manual override from the host pins the status until it is cleared.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrayStatus {
    Listening,
    Inactive,
}

/// Status shown for the given inputs
#[must_use]
pub const fn derive_status(
    override_status: Option<TrayStatus>,
    detector_running: bool,
    session_active: bool,
) -> TrayStatus {
    match override_status {
        Some(status) => status,
        None if detector_running || session_active => TrayStatus::Listening,
        None => TrayStatus::Inactive,
    }
}

pub struct TraySupervisor {
    detector_running: watch::Receiver<bool>,
    session_active: watch::Receiver<bool>,
    override_status: Option<TrayStatus>,
    status: watch::Sender<TrayStatus>,
}

impl TraySupervisor {
    /// Start supervising; `overrides` carries `Some` to pin and `None` to clear
    #[must_use]
    pub fn spawn(
        detector_running: watch::Receiver<bool>,
        session_active: watch::Receiver<bool>,
        overrides: mpsc::Receiver<Option<TrayStatus>>,
    ) -> (watch::Receiver<TrayStatus>, JoinHandle<()>) {
        let initial = derive_status(None, *detector_running.borrow(), *session_active.borrow());
        let (status, status_rx) = watch::channel(initial);

        let supervisor = Self {
            detector_running,
            session_active,
            override_status: None,
            status,
        };
        (status_rx, tokio::spawn(supervisor.run(overrides)))
    }

    async fn run(mut self, mut overrides: mpsc::Receiver<Option<TrayStatus>>) {
        loop {
            tokio::select! {
                cmd = overrides.recv() => match cmd {
                    Some(status) => {
                        tracing::info!(?status, "tray override");
                        self.override_status = status;
                    }
                    None => break,
                },
                Ok(()) = self.detector_running.changed() => {}
                Ok(()) = self.session_active.changed() => {}
            }
            self.refresh();
        }
    }

    fn refresh(&self) {
        let next = derive_status(
            self.override_status,
            *self.detector_running.borrow(),
            *self.session_active.borrow(),
        );
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::debug!(from = ?*current, to = ?next, "tray status");
            *current = next;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_status() {
        assert_eq!(derive_status(None, true, false), TrayStatus::Listening);
        assert_eq!(derive_status(None, false, true), TrayStatus::Listening);
        assert_eq!(derive_status(None, false, false), TrayStatus::Inactive);
        assert_eq!(
            derive_status(Some(TrayStatus::Inactive), true, true),
            TrayStatus::Inactive
        );
    }

    #[tokio::test]
    async fn test_follows_detector_and_override() {
        let (detector_tx, detector_rx) = watch::channel(false);
        let (_session_tx, session_rx) = watch::channel(false);
        let (override_tx, override_rx) = mpsc::channel(4);

        let (mut status, _task) = TraySupervisor::spawn(detector_rx, session_rx, override_rx);
        assert_eq!(*status.borrow(), TrayStatus::Inactive);

        detector_tx.send_replace(true);
        status.changed().await.unwrap();
        assert_eq!(*status.borrow_and_update(), TrayStatus::Listening);

        override_tx.send(Some(TrayStatus::Inactive)).await.unwrap();
        status.changed().await.unwrap();
        assert_eq!(*status.borrow_and_update(), TrayStatus::Inactive);

        override_tx.send(None).await.unwrap();
        status.changed().await.unwrap();
        assert_eq!(*status.borrow_and_update(), TrayStatus::Listening);
    }
}
