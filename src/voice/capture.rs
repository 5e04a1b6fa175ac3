//! Microphone frame capture and WAV helpers

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream};

use super::wake_word::FrameSource;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Size of a canonical WAV header; a file this size or smaller holds no audio
pub const WAV_HEADER_LEN: usize = 44;

/// Resolve an input device by enumeration index, or the default device
pub(crate) fn input_device(index: Option<usize>) -> Result<Device> {
    let host = cpal::default_host();

    if let Some(index) = index {
        if let Some(device) = host
            .input_devices()
            .map_err(|e| Error::Audio(e.to_string()))?
            .nth(index)
        {
            return Ok(device);
        }
        tracing::warn!(index, "input device missing, using default");
    }

    host.default_input_device()
        .ok_or_else(|| Error::Audio("no input device available".to_string()))
}

/// Streams fixed-size mono frames from a microphone
///
/// The cpal stream is not `Send`; create and read it on the same thread.
pub struct CpalFrameSource {
    _stream: Stream,
    rx: Receiver<Vec<f32>>,
    pending: VecDeque<f32>,
    frame_len: usize,
    stream_error: Arc<Mutex<Option<String>>>,
}

impl CpalFrameSource {
    /// Open the microphone at `device_index` (default device when `None`)
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened at 16kHz mono
    pub fn open(device_index: Option<usize>, frame_len: usize) -> Result<Self> {
        if frame_len == 0 {
            return Err(Error::Audio("frame length must be non-zero".to_string()));
        }

        let device = input_device(device_index)?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(SAMPLE_RATE))
            .config();

        let (tx, rx) = mpsc::channel::<Vec<f32>>();
        let stream_error = Arc::new(Mutex::new(None));
        let error_slot = Arc::clone(&stream_error);

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    // Reader gone means we're shutting down
                    let _ = tx.send(data.to_vec());
                },
                move |err| {
                    tracing::error!(error = %err, "audio capture error");
                    if let Ok(mut slot) = error_slot.lock() {
                        *slot = Some(err.to_string());
                    }
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            frame_len,
            "frame capture started"
        );

        Ok(Self {
            _stream: stream,
            rx,
            pending: VecDeque::with_capacity(frame_len * 2),
            frame_len,
            stream_error,
        })
    }
}

impl FrameSource for CpalFrameSource {
    fn frame_len(&self) -> usize {
        self.frame_len
    }

    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<f32>>> {
        let deadline = Instant::now() + timeout;

        while self.pending.len() < self.frame_len {
            if let Some(err) = self.stream_error.lock().ok().and_then(|mut e| e.take()) {
                return Err(Error::Audio(err));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(chunk) => self.pending.extend(chunk),
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(Error::Audio("capture stream closed".to_string()));
                }
            }
        }

        Ok(Some(self.pending.drain(..self.frame_len).collect()))
    }
}

/// Convert f32 samples to WAV bytes for the transcription service
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Whether captured bytes hold any audio
///
/// A file must be longer than a bare WAV header. An interrupted writer can
/// leave a zero data length in the header, so the byte count wins over the
/// header's sample count.
#[must_use]
pub fn has_audio(bytes: &[u8]) -> bool {
    if bytes.len() > WAV_HEADER_LEN {
        return true;
    }
    hound::WavReader::new(std::io::Cursor::new(bytes)).is_ok_and(|r| r.duration() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_only_wav_has_no_audio() {
        let wav = samples_to_wav(&[], SAMPLE_RATE).unwrap();
        assert!(!has_audio(&wav));
    }

    #[test]
    fn test_wav_with_samples_has_audio() {
        let wav = samples_to_wav(&[0.1, -0.1, 0.2], SAMPLE_RATE).unwrap();
        assert!(has_audio(&wav));
    }

    #[test]
    fn test_empty_and_opaque_bytes() {
        assert!(!has_audio(&[]));
        assert!(!has_audio(&[1u8; 10]));
        assert!(has_audio(&[7u8; 200]));
    }
}
