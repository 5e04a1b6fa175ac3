use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use beacon_voice::settings::{FileSettingsStore, SettingsStore};
use beacon_voice::voice::{
    AudioDeviceManager, AudioInput, CpalEnumerator, DeviceEnumerator, HttpTranscriber,
    SubprocessBackend, Transcriber, build_synthesizer,
};
use beacon_voice::{Config, Daemon, EventBus};

/// Beacon Voice - hands-free voice loop for the Beacon desktop app
#[derive(Parser)]
#[command(name = "beacon-voice", version, about)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(short, long, env = "BEACON_VOICE_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Run without the stdin/stdout host link (stop with ctrl-c)
    #[arg(long)]
    no_ipc: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List input devices
    Devices,
    /// Record through the capture pipeline and report what was captured
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Speak text through the configured synthesizer
    Say {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Send a WAV file to the transcription service
    Transcribe {
        /// WAV file
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,beacon_voice=info",
        1 => "info,beacon_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    // stdout belongs to the host link
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("fatal: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(cli));
    // A stdin read may still be parked on a blocking thread
    runtime.shutdown_timeout(Duration::from_secs(1));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Devices => list_devices(),
            Command::TestMic { duration } => test_mic(&config, duration).await,
            Command::Say { text } => say(&config, &text).await,
            Command::Transcribe { file } => transcribe(&config, &file).await,
        };
    }

    tracing::info!(
        data_dir = %config.data_dir.display(),
        settings = %config.settings_path.display(),
        "starting beacon voice"
    );

    Daemon::new(config, !cli.no_ipc).run().await?;
    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    let devices = CpalEnumerator.input_devices()?;
    if devices.is_empty() {
        println!("No input devices found");
        return Ok(());
    }

    for device in devices {
        let marker = if device.is_default { " (default)" } else { "" };
        println!("[{}] {}{marker}", device.index, device.name);
    }
    Ok(())
}

async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    let settings = FileSettingsStore::new(config.settings_path.clone());
    let mut timings = config.timings;
    timings.max_capture = Duration::from_secs(duration);

    let bus = EventBus::default();
    let mut notices = bus.subscribe();
    let manager = AudioDeviceManager::new(
        Arc::new(CpalEnumerator),
        Arc::new(SubprocessBackend::new(config.capture.clone())),
        Arc::new(HttpTranscriber::new(&config.transcription)?),
        bus,
        config.capture.output_path.clone(),
        timings,
    );

    println!("Recording for up to {duration} seconds, speak into your microphone...");
    let handle = manager.start_recording(&settings.device_preference()).await?;
    while let Ok(event) = notices.try_recv() {
        println!("notice: {}", serde_json::to_string(&event)?);
    }

    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(duration)) => {}
        () = handle.exited() => println!("Capture ended on silence"),
    }

    let audio = manager.stop_recording(&handle).await?;
    println!("Captured {} bytes from device {}", audio.len(), handle.request.device_index);
    Ok(())
}

async fn say(config: &Config, text: &str) -> anyhow::Result<()> {
    let settings: Arc<dyn SettingsStore> =
        Arc::new(FileSettingsStore::new(config.settings_path.clone()));
    let synth = build_synthesizer(&config.tts, settings)?;

    println!("Speaking: {text}");
    synth.speak(text).await?;
    println!("Done");
    Ok(())
}

async fn transcribe(config: &Config, file: &Path) -> anyhow::Result<()> {
    let audio = tokio::fs::read(file).await?;
    let transcriber = HttpTranscriber::new(&config.transcription)?;

    match transcriber.transcribe(&audio).await? {
        Some(text) => println!("{text}"),
        None => println!("(no speech)"),
    }
    Ok(())
}
