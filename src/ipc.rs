//! Newline-delimited JSON link with the host application
//!
//! The host writes [`HostMessage`]s on our stdin; we write every bus event
//! and tray status change on stdout, one JSON object per line.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::controller::ControllerHandle;
use crate::events::{EndReason, VoiceEvent};
use crate::focus::FocusEvent;
use crate::tray::TrayStatus;

/// Inbound message from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Focus(FocusEvent),
    StartVoice,
    StopVoice,
    /// Pin the tray status, or clear the pin with `null`
    TrayOverride { status: Option<TrayStatus> },
    Shutdown,
}

#[derive(Serialize)]
#[serde(tag = "type", rename = "tray")]
struct TrayLine {
    status: TrayStatus,
}

/// Delivers host messages to the components that own them
pub struct HostRouter {
    focus_tx: mpsc::Sender<FocusEvent>,
    controller: ControllerHandle,
    tray_tx: mpsc::Sender<Option<TrayStatus>>,
    shutdown: CancellationToken,
}

impl HostRouter {
    #[must_use]
    pub const fn new(
        focus_tx: mpsc::Sender<FocusEvent>,
        controller: ControllerHandle,
        tray_tx: mpsc::Sender<Option<TrayStatus>>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            focus_tx,
            controller,
            tray_tx,
            shutdown,
        }
    }

    pub async fn route(&self, message: HostMessage) {
        tracing::debug!(?message, "host message");
        match message {
            HostMessage::Focus(event) => {
                if self.focus_tx.send(event).await.is_err() {
                    tracing::warn!("focus arbiter gone, focus event dropped");
                }
            }
            HostMessage::StartVoice => self.controller.start().await,
            HostMessage::StopVoice => self.controller.stop(EndReason::Stopped).await,
            HostMessage::TrayOverride { status } => {
                if self.tray_tx.send(status).await.is_err() {
                    tracing::warn!("tray supervisor gone, override dropped");
                }
            }
            HostMessage::Shutdown => self.shutdown.cancel(),
        }
    }
}

/// Read host messages until end of input or shutdown
///
/// End of input means the host went away and requests shutdown.
///
/// # Errors
///
/// Returns error if reading fails
pub async fn read_host<R>(reader: R, router: &HostRouter) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = tokio::select! {
            () = router.shutdown.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };

        let Some(line) = line else {
            tracing::info!("host closed input, shutting down");
            router.shutdown.cancel();
            return Ok(());
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<HostMessage>(line) {
            Ok(message) => router.route(message).await,
            Err(e) => tracing::warn!(error = %e, line, "unparseable host message, skipped"),
        }
    }
}

/// Write bus events and tray status changes until shutdown
///
/// The current tray status is written first. Events already queued when
/// `shutdown` fires are still written.
///
/// # Errors
///
/// Returns error if writing fails
pub async fn write_events<W>(
    mut writer: W,
    mut events: broadcast::Receiver<VoiceEvent>,
    mut tray: watch::Receiver<TrayStatus>,
    shutdown: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let status = *tray.borrow_and_update();
    write_line(&mut writer, &TrayLine { status }).await?;

    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => write_line(&mut writer, &event).await?,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event writer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            Ok(()) = tray.changed() => {
                let status = *tray.borrow_and_update();
                write_line(&mut writer, &TrayLine { status }).await?;
            }
            () = shutdown.cancelled() => break,
        }
    }

    writer.flush().await?;
    Ok(())
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
