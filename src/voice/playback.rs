//! Audio playback to speakers

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate};

use crate::{Error, Result};

/// Decoded mono audio
#[derive(Debug, Clone, PartialEq)]
pub struct Pcm {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Pcm {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// Plays audio on an output device
///
/// Blocks the calling thread; run it under `spawn_blocking`.
pub struct AudioPlayback {
    device: Device,
}

impl AudioPlayback {
    /// Open the output device at `index`, or the default device
    ///
    /// # Errors
    ///
    /// Returns error if no output device is available
    pub fn open(index: Option<usize>) -> Result<Self> {
        let host = cpal::default_host();

        let by_index = index.and_then(|i| host.output_devices().ok()?.nth(i));
        if index.is_some() && by_index.is_none() {
            tracing::warn!(?index, "output device missing, using default");
        }

        let device = by_index
            .or_else(|| host.default_output_device())
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        tracing::debug!(device = device.name().unwrap_or_default(), "audio playback opened");
        Ok(Self { device })
    }

    /// Play `pcm` scaled by `volume` until done or `stop` is set
    ///
    /// # Errors
    ///
    /// Returns error if no output config matches or the stream fails
    pub fn play(&self, pcm: Pcm, volume: f32, stop: &AtomicBool) -> Result<()> {
        if pcm.samples.is_empty() {
            return Ok(());
        }

        let rate = SampleRate(pcm.sample_rate);
        let supported = self
            .device
            .supported_output_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
            .min_by_key(|c| c.channels())
            .ok_or_else(|| {
                Error::Audio(format!("no output config for {} Hz", pcm.sample_rate))
            })?;

        let config = supported.with_sample_rate(rate).config();
        let channels = usize::from(config.channels);
        let duration = pcm.duration();
        let samples = Arc::new(pcm.samples);
        let position = Arc::new(AtomicUsize::new(0));

        let stream_samples = Arc::clone(&samples);
        let stream_position = Arc::clone(&position);
        let volume = volume.clamp(0.0, 1.0);

        let stream = self
            .device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut pos = stream_position.load(Ordering::Relaxed);
                    for frame in data.chunks_mut(channels) {
                        let sample = stream_samples.get(pos).map_or(0.0, |s| s * volume);
                        frame.fill(sample);
                        if pos < stream_samples.len() {
                            pos += 1;
                        }
                    }
                    stream_position.store(pos, Ordering::Relaxed);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let deadline = Instant::now() + duration + Duration::from_millis(500);
        while position.load(Ordering::Relaxed) < samples.len() {
            if stop.load(Ordering::Relaxed) {
                tracing::debug!("playback stopped early");
                return Ok(());
            }
            if Instant::now() > deadline {
                tracing::warn!("playback overran its duration");
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        // Let the device drain its last buffer
        std::thread::sleep(Duration::from_millis(100));
        drop(stream);
        tracing::debug!(samples = samples.len(), "playback complete");

        Ok(())
    }
}

/// Decode MP3 bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if the data is not decodable MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<Pcm> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(sample_rate);
                let channels = frame.channels.max(1);
                #[allow(clippy::cast_precision_loss)]
                let mono = frame.data.chunks(channels).map(|chunk| {
                    let sum: f32 = chunk.iter().map(|&s| f32::from(s) / 32768.0).sum();
                    sum / chunk.len() as f32
                });
                samples.extend(mono);
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(Pcm {
        samples,
        sample_rate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_garbage_decodes_to_nothing_or_errors() {
        match decode_mp3(b"not an mp3 at all") {
            Ok(pcm) => assert!(pcm.samples.is_empty()),
            Err(e) => assert!(matches!(e, Error::Audio(_))),
        }
    }

    #[test]
    fn test_pcm_duration() {
        let pcm = Pcm {
            samples: vec![0.0; 24_000],
            sample_rate: 24_000,
        };
        assert_eq!(pcm.duration(), Duration::from_secs(1));

        let empty = Pcm {
            samples: Vec::new(),
            sample_rate: 0,
        };
        assert_eq!(empty.duration(), Duration::ZERO);
    }
}
