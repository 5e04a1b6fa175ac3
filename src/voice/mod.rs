//! Voice processing module
//!
//! Handles microphone capture, wake word detection, transcription, speech
//! synthesis and playback.

mod capture;
mod device;
mod playback;
mod stt;
mod tts;
mod wake_word;

pub use capture::{CpalFrameSource, SAMPLE_RATE, WAV_HEADER_LEN, has_audio, samples_to_wav};
pub use device::{
    AudioDeviceManager, AudioInput, CaptureBackend, CaptureChild, CaptureExit, CaptureRequest,
    CpalEnumerator, DEFAULT_DEVICE_INDEX, DeviceDescriptor, DeviceEnumerator, RecordingHandle,
    SubprocessBackend,
};
pub use playback::AudioPlayback;
pub use stt::{HttpTranscriber, Transcriber};
pub use tts::{CommandSynthesizer, HttpSynthesizer, SpeechSynthesizer, build_synthesizer};
pub use wake_word::{
    FrameSource, KeywordEngine, MicWakeSource, WakeControl, WakeEvent, WakeSource,
    WakeWordDetector,
};

#[cfg(feature = "wake-word")]
pub use wake_word::RustpotterEngine;
