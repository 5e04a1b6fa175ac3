//! Microphone resolution and subprocess capture
//!
//! [`AudioDeviceManager`] owns the single in-flight recording. A capture runs
//! as an external program writing a WAV file to a fixed path; stopping it
//! sends SIGINT, waits for the process to exit, gives it time to flush and
//! then validates the file.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cpal::traits::{DeviceTrait, HostTrait};
use tokio::sync::{Mutex, oneshot, watch};
use uuid::Uuid;

use super::capture::has_audio;
use super::stt::Transcriber;
use crate::config::{CaptureConfig, VoiceTimings};
use crate::events::{EventBus, Notice, VoiceEvent};
use crate::settings::DevicePreference;
use crate::{Error, Result};

/// Index used when the configured microphone is gone
pub const DEFAULT_DEVICE_INDEX: usize = 0;

/// Grace period between SIGINT and a hard kill
const STOP_GRACE: Duration = Duration::from_secs(2);

/// An input device as seen by the audio host
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeviceDescriptor {
    pub index: usize,
    pub name: String,
    pub is_default: bool,
}

/// Lists the live input devices
pub trait DeviceEnumerator: Send + Sync {
    /// # Errors
    ///
    /// Returns error if the audio host cannot be queried
    fn input_devices(&self) -> Result<Vec<DeviceDescriptor>>;
}

/// Enumerates input devices through cpal's default host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalEnumerator;

impl DeviceEnumerator for CpalEnumerator {
    fn input_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());

        let devices = host
            .input_devices()
            .map_err(|e| Error::Device(e.to_string()))?
            .enumerate()
            .map(|(index, device)| {
                let name = device.name().unwrap_or_else(|_| format!("input {index}"));
                let is_default = default_name.as_deref() == Some(name.as_str());
                DeviceDescriptor {
                    index,
                    name,
                    is_default,
                }
            })
            .collect();

        Ok(devices)
    }
}

/// Parameters of one recording
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    pub max_duration: Duration,
    pub silence_timeout: Duration,
    /// Position in the audio host's enumeration
    pub device_index: usize,
    /// Name the audio host reports for that device
    pub device_name: String,
    /// Input gain from the user's settings, 1.0 is unity
    pub volume: f32,
}

/// How a capture process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureExit {
    /// Exit code, `None` when killed by a signal or lost
    pub code: Option<i32>,
    /// Whether the process ended because it was told to stop
    pub interrupted: bool,
}

impl CaptureExit {
    const LOST: Self = Self {
        code: None,
        interrupted: false,
    };
}

/// A running capture process, as handed out by a [`CaptureBackend`]
pub struct CaptureChild {
    stop_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<Option<CaptureExit>>,
}

impl CaptureChild {
    /// Wrap a stop signal and an exit notification
    ///
    /// The backend must publish `Some(exit)` once the process is gone and
    /// treat a fired or dropped `stop_tx` as a request to stop.
    #[must_use]
    pub fn new(
        stop_tx: oneshot::Sender<()>,
        exited: watch::Receiver<Option<CaptureExit>>,
    ) -> Self {
        Self {
            stop_tx: Some(stop_tx),
            exited,
        }
    }

    /// Ask the process to stop; later calls do nothing
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            // Already exited on its own
            let _ = tx.send(());
        }
    }

    /// Wait until the process has exited
    pub async fn wait(&mut self) -> CaptureExit {
        match self.exited.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(CaptureExit::LOST),
            Err(_) => CaptureExit::LOST,
        }
    }

    fn subscribe(&self) -> watch::Receiver<Option<CaptureExit>> {
        self.exited.clone()
    }
}

/// Starts capture processes
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Start recording `request` into `output`
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if the process cannot be started
    async fn spawn(&self, request: &CaptureRequest, output: &Path) -> Result<CaptureChild>;
}

/// Records through an external program such as `sox` or `arecord`
pub struct SubprocessBackend {
    config: CaptureConfig,
}

impl SubprocessBackend {
    #[must_use]
    pub const fn new(config: CaptureConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CaptureBackend for SubprocessBackend {
    async fn spawn(&self, request: &CaptureRequest, output: &Path) -> Result<CaptureChild> {
        let program = which::which(&self.config.program).map_err(|e| {
            Error::Device(format!("capture program {} not found: {e}", self.config.program))
        })?;

        let mut config = self.config.clone();
        config.output_path = output.to_path_buf();
        let args = config.render_args(request);

        tracing::debug!(program = %program.display(), ?args, "spawning capture process");

        let mut child = tokio::process::Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Device(format!("failed to spawn capture process: {e}")))?;

        let pid = child.id();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(async move {
            let (status, interrupted) = tokio::select! {
                status = child.wait() => (status, false),
                _ = stop_rx => (interrupt(&mut child, pid).await, true),
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to reap capture process");
                    None
                }
            };
            tracing::debug!(?pid, ?code, interrupted, "capture process exited");
            exit_tx.send_replace(Some(CaptureExit { code, interrupted }));
        });

        Ok(CaptureChild::new(stop_tx, exit_rx))
    }
}

/// SIGINT the process so it finalizes its file, hard kill after a grace period
async fn interrupt(
    child: &mut tokio::process::Child,
    pid: Option<u32>,
) -> std::io::Result<std::process::ExitStatus> {
    if let Some(pid) = pid {
        if send_sigint(pid) {
            if let Ok(status) = tokio::time::timeout(STOP_GRACE, child.wait()).await {
                return status;
            }
            tracing::warn!(pid, "capture process ignored SIGINT, killing");
        }
    }

    child.start_kill()?;
    child.wait().await
}

#[cfg(unix)]
fn send_sigint(pid: u32) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), Signal::SIGINT) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(pid, error = %e, "failed to signal capture process");
            false
        }
    }
}

#[cfg(not(unix))]
const fn send_sigint(_pid: u32) -> bool {
    false
}

/// Caller's view of an in-flight recording
#[derive(Debug, Clone)]
pub struct RecordingHandle {
    pub id: Uuid,
    pub request: CaptureRequest,
    pub started_at: DateTime<Utc>,
    exited: watch::Receiver<Option<CaptureExit>>,
}

impl RecordingHandle {
    /// Handle for a capture started by a custom [`AudioInput`]
    #[must_use]
    pub fn new(request: CaptureRequest, exited: watch::Receiver<Option<CaptureExit>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            started_at: Utc::now(),
            exited,
        }
    }

    /// Resolves once the capture process exits on its own or is stopped
    pub async fn exited(&self) {
        let mut rx = self.exited.clone();
        let _ = rx.wait_for(Option::is_some).await;
    }
}

/// Recording and transcription surface used by the voice loop
#[async_trait]
pub trait AudioInput: Send + Sync {
    /// Start a capture on the preferred microphone
    ///
    /// # Errors
    ///
    /// Returns `Error::AlreadyRecording` if a capture is in flight, or
    /// `Error::Device` if no device is usable
    async fn start_recording(&self, prefs: &DevicePreference) -> Result<RecordingHandle>;

    /// Stop the capture and return the recorded WAV bytes
    ///
    /// # Errors
    ///
    /// Returns `Error::NotRecording` for a stale handle, `Error::NoFile` or
    /// `Error::EmptyCapture` when nothing usable was written
    async fn stop_recording(&self, handle: &RecordingHandle) -> Result<Vec<u8>>;

    /// Transcribe recorded audio; `Ok(None)` means no speech
    ///
    /// # Errors
    ///
    /// Returns `Error::Transcription` if the service failed
    async fn transcribe(&self, audio: &[u8]) -> Result<Option<String>>;
}

struct ActiveCapture {
    id: Uuid,
    child: CaptureChild,
}

/// Owns the one capture that may exist at a time
pub struct AudioDeviceManager {
    enumerator: Arc<dyn DeviceEnumerator>,
    backend: Arc<dyn CaptureBackend>,
    transcriber: Arc<dyn Transcriber>,
    bus: EventBus,
    output_path: PathBuf,
    timings: VoiceTimings,
    active: Mutex<Option<ActiveCapture>>,
}

impl AudioDeviceManager {
    #[must_use]
    pub fn new(
        enumerator: Arc<dyn DeviceEnumerator>,
        backend: Arc<dyn CaptureBackend>,
        transcriber: Arc<dyn Transcriber>,
        bus: EventBus,
        output_path: PathBuf,
        timings: VoiceTimings,
    ) -> Self {
        Self {
            enumerator,
            backend,
            transcriber,
            bus,
            output_path,
            timings,
            active: Mutex::new(None),
        }
    }

    /// Live input devices
    ///
    /// # Errors
    ///
    /// Returns error if the audio host cannot be queried
    pub fn enumerate_input_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        self.enumerator.input_devices()
    }

    pub async fn is_recording(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Check the preferred index against a fresh enumeration
    fn resolve_device(&self, requested: usize) -> Result<DeviceDescriptor> {
        let mut devices = self.enumerator.input_devices()?;
        if devices.is_empty() {
            return Err(Error::Device("no input devices available".to_string()));
        }

        if let Some(pos) = devices.iter().position(|d| d.index == requested) {
            return Ok(devices.swap_remove(pos));
        }

        tracing::warn!(
            requested,
            fallback = DEFAULT_DEVICE_INDEX,
            "configured microphone not found, using default"
        );
        self.bus.publish(VoiceEvent::Notice(Notice::DeviceFallback {
            requested,
            fallback: DEFAULT_DEVICE_INDEX,
        }));

        let pos = devices
            .iter()
            .position(|d| d.index == DEFAULT_DEVICE_INDEX)
            .unwrap_or(0);
        let mut device = devices.swap_remove(pos);
        device.index = DEFAULT_DEVICE_INDEX;
        Ok(device)
    }

    async fn remove_stale_output(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.output_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl AudioInput for AudioDeviceManager {
    async fn start_recording(&self, prefs: &DevicePreference) -> Result<RecordingHandle> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(Error::AlreadyRecording);
        }

        let device = self.resolve_device(prefs.selected_microphone_index)?;
        self.remove_stale_output().await?;

        let request = CaptureRequest {
            max_duration: self.timings.max_capture,
            silence_timeout: self.timings.silence_timeout,
            device_index: device.index,
            device_name: device.name,
            volume: prefs.mic_volume,
        };
        let child = self.backend.spawn(&request, &self.output_path).await?;

        let handle = RecordingHandle::new(request, child.subscribe());
        *active = Some(ActiveCapture {
            id: handle.id,
            child,
        });

        tracing::info!(
            recording_id = %handle.id,
            device_index = handle.request.device_index,
            device = %handle.request.device_name,
            "recording started"
        );
        Ok(handle)
    }

    async fn stop_recording(&self, handle: &RecordingHandle) -> Result<Vec<u8>> {
        // Held through the flush so no new capture can reuse the path early
        let mut active = self.active.lock().await;
        let mut capture = match active.take() {
            Some(capture) if capture.id == handle.id => capture,
            other => {
                *active = other;
                return Err(Error::NotRecording);
            }
        };

        capture.child.stop();
        let exit = capture.child.wait().await;
        tracing::debug!(recording_id = %handle.id, code = ?exit.code, interrupted = exit.interrupted, "capture ended");

        tokio::time::sleep(self.timings.flush_delay).await;

        let bytes = match tokio::fs::read(&self.output_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %self.output_path.display(), "capture wrote no file");
                return Err(Error::NoFile);
            }
            Err(e) => return Err(e.into()),
        };

        if !has_audio(&bytes) {
            tracing::debug!(bytes = bytes.len(), "capture is empty");
            return Err(Error::EmptyCapture);
        }

        tracing::info!(
            recording_id = %handle.id,
            bytes = bytes.len(),
            elapsed_ms = (Utc::now() - handle.started_at).num_milliseconds(),
            "recording stopped"
        );
        Ok(bytes)
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<Option<String>> {
        self.transcriber.transcribe(audio).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::samples_to_wav;

    struct FixedDevices(Vec<usize>);

    impl DeviceEnumerator for FixedDevices {
        fn input_devices(&self) -> Result<Vec<DeviceDescriptor>> {
            Ok(self
                .0
                .iter()
                .map(|&index| DeviceDescriptor {
                    index,
                    name: format!("mic {index}"),
                    is_default: index == 0,
                })
                .collect())
        }
    }

    /// Writes `content` to the output path once stopped
    struct FileBackend {
        content: Option<Vec<u8>>,
    }

    #[async_trait]
    impl CaptureBackend for FileBackend {
        async fn spawn(&self, _request: &CaptureRequest, output: &Path) -> Result<CaptureChild> {
            let (stop_tx, stop_rx) = oneshot::channel();
            let (exit_tx, exit_rx) = watch::channel(None);
            let content = self.content.clone();
            let output = output.to_path_buf();

            tokio::spawn(async move {
                let _ = stop_rx.await;
                if let Some(bytes) = content {
                    tokio::fs::write(&output, bytes).await.unwrap();
                }
                exit_tx.send_replace(Some(CaptureExit {
                    code: Some(0),
                    interrupted: true,
                }));
            });

            Ok(CaptureChild::new(stop_tx, exit_rx))
        }
    }

    struct NoTranscriber;

    #[async_trait]
    impl Transcriber for NoTranscriber {
        async fn transcribe(&self, _audio: &[u8]) -> Result<Option<String>> {
            Ok(None)
        }
    }

    fn manager(
        dir: &Path,
        devices: Vec<usize>,
        content: Option<Vec<u8>>,
        bus: EventBus,
    ) -> AudioDeviceManager {
        let timings = VoiceTimings {
            flush_delay: Duration::from_millis(10),
            ..VoiceTimings::default()
        };
        AudioDeviceManager::new(
            Arc::new(FixedDevices(devices)),
            Arc::new(FileBackend { content }),
            Arc::new(NoTranscriber),
            bus,
            dir.join("capture.wav"),
            timings,
        )
    }

    fn prefs(mic: usize) -> DevicePreference {
        DevicePreference {
            selected_microphone_index: mic,
            ..DevicePreference::default()
        }
    }

    fn request() -> CaptureRequest {
        CaptureRequest {
            max_duration: Duration::from_secs(8),
            silence_timeout: Duration::from_secs(2),
            device_index: 0,
            device_name: "default".to_string(),
            volume: 1.0,
        }
    }

    fn speech() -> Vec<u8> {
        samples_to_wav(&[0.2; 1600], crate::voice::SAMPLE_RATE).unwrap()
    }

    #[tokio::test]
    async fn test_record_and_stop_returns_audio() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), vec![0, 1], Some(speech()), EventBus::default());

        let handle = mgr.start_recording(&prefs(1)).await.unwrap();
        assert_eq!(handle.request.device_index, 1);
        assert_eq!(handle.request.max_duration, Duration::from_millis(8000));
        assert!(mgr.is_recording().await);

        let audio = mgr.stop_recording(&handle).await.unwrap();
        assert_eq!(audio, speech());
        assert!(!mgr.is_recording().await);

        assert!(matches!(
            mgr.stop_recording(&handle).await,
            Err(Error::NotRecording)
        ));
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), vec![0], Some(speech()), EventBus::default());

        let handle = mgr.start_recording(&prefs(0)).await.unwrap();
        assert!(matches!(
            mgr.start_recording(&prefs(0)).await,
            Err(Error::AlreadyRecording)
        ));
        mgr.stop_recording(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_device_falls_back_once() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let mgr = manager(dir.path(), vec![0, 1], Some(speech()), bus);

        let handle = mgr.start_recording(&prefs(4)).await.unwrap();
        assert_eq!(handle.request.device_index, DEFAULT_DEVICE_INDEX);
        assert_eq!(handle.request.device_name, "mic 0");
        assert_eq!(
            rx.try_recv().unwrap(),
            VoiceEvent::Notice(Notice::DeviceFallback {
                requested: 4,
                fallback: 0
            })
        );
        assert!(rx.try_recv().is_err());

        mgr.stop_recording(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_request_carries_device_name_and_volume() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), vec![0, 1, 2], Some(speech()), EventBus::default());

        let prefs = DevicePreference {
            selected_microphone_index: 2,
            mic_volume: 0.5,
            ..DevicePreference::default()
        };
        let handle = mgr.start_recording(&prefs).await.unwrap();
        assert_eq!(handle.request.device_index, 2);
        assert_eq!(handle.request.device_name, "mic 2");
        assert!((handle.request.volume - 0.5).abs() < f32::EPSILON);

        mgr.stop_recording(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_devices_is_a_device_error() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), Vec::new(), None, EventBus::default());

        assert!(matches!(
            mgr.start_recording(&prefs(0)).await,
            Err(Error::Device(_))
        ));
        assert!(!mgr.is_recording().await);
    }

    #[tokio::test]
    async fn test_missing_file_is_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), vec![0], None, EventBus::default());

        let handle = mgr.start_recording(&prefs(0)).await.unwrap();
        assert!(matches!(mgr.stop_recording(&handle).await, Err(Error::NoFile)));
        assert!(matches!(
            mgr.stop_recording(&handle).await,
            Err(Error::NotRecording)
        ));
    }

    #[tokio::test]
    async fn test_header_only_file_is_empty_capture() {
        let dir = tempfile::tempdir().unwrap();
        let header_only = samples_to_wav(&[], crate::voice::SAMPLE_RATE).unwrap();
        let mgr = manager(dir.path(), vec![0], Some(header_only), EventBus::default());

        let handle = mgr.start_recording(&prefs(0)).await.unwrap();
        assert!(matches!(
            mgr.stop_recording(&handle).await,
            Err(Error::EmptyCapture)
        ));
        assert!(matches!(
            mgr.stop_recording(&handle).await,
            Err(Error::NotRecording)
        ));
    }

    #[tokio::test]
    async fn test_stale_file_is_not_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), vec![0], None, EventBus::default());
        std::fs::write(dir.path().join("capture.wav"), speech()).unwrap();

        let handle = mgr.start_recording(&prefs(0)).await.unwrap();
        assert!(matches!(mgr.stop_recording(&handle).await, Err(Error::NoFile)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_subprocess_backend_stop_and_self_exit() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("sub.wav");
        let request = request();

        let long_running = SubprocessBackend::new(CaptureConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "head -c 100 /dev/zero > {output}; exec sleep 30".to_string(),
            ],
            output_path: PathBuf::new(),
        });
        let mut child = long_running.spawn(&request, &output).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        child.stop();
        let exit = child.wait().await;
        assert!(exit.interrupted);
        assert_eq!(std::fs::read(&output).unwrap().len(), 100);

        let self_exiting = SubprocessBackend::new(CaptureConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "exit 0".to_string()],
            output_path: PathBuf::new(),
        });
        let mut child = self_exiting.spawn(&request, &output).await.unwrap();
        let exit = child.wait().await;
        assert_eq!(exit.code, Some(0));
        assert!(!exit.interrupted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_interrupts_so_the_recorder_can_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("trap.wav");

        // Exits cleanly only if it sees SIGINT; a hard kill leaves no file
        let backend = SubprocessBackend::new(CaptureConfig {
            program: "sh".to_string(),
            args: vec![
                "-c".to_string(),
                "trap 'printf finalized > {output}; exit 0' INT; while :; do sleep 0.05; done"
                    .to_string(),
            ],
            output_path: PathBuf::new(),
        });
        let mut child = backend.spawn(&request(), &output).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        child.stop();

        let exit = child.wait().await;
        assert!(exit.interrupted);
        assert_eq!(exit.code, Some(0));
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "finalized");
    }

    #[tokio::test]
    async fn test_unknown_program_is_device_error() {
        let backend = SubprocessBackend::new(CaptureConfig {
            program: "definitely-not-a-recorder-xyz".to_string(),
            ..CaptureConfig::default()
        });
        let result = backend.spawn(&request(), Path::new("/tmp/x.wav")).await;
        assert!(matches!(result, Err(Error::Device(_))));
    }
}
