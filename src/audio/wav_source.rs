//! WAV file microphone using hound
//!
//! Plays a recording into the capture pipeline at real-time pace, then keeps
//! sending silence so the service can detect the end of the caller's turn.

use crate::audio::capture::{CaptureFrame, FrameAssembler, Microphone, FRAME_SAMPLES};
use crate::audio::codec::{mix_to_mono, resample};
use crate::error::{CallError, CallResult};
use async_trait::async_trait;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Microphone backed by a WAV file
pub struct WavMicrophone {
    path: PathBuf,
    sample_rate: u32,
    task: Option<JoinHandle<()>>,
}

impl WavMicrophone {
    pub fn new(path: impl AsRef<Path>, sample_rate: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            sample_rate,
            task: None,
        }
    }
}

/// Load samples from a WAV file as mono at its native rate
///
/// Returns the samples and sample rate
pub fn load_mono(path: impl AsRef<Path>) -> CallResult<(Vec<f32>, u32)> {
    let reader = hound::WavReader::open(path.as_ref())
        .map_err(|e| CallError::PermissionDenied(format!("Failed to open WAV file: {}", e)))?;

    let spec = reader.spec();
    let samples: Result<Vec<f32>, _> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect(),
        hound::SampleFormat::Int => {
            // Convert integer samples to float
            let max_value = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_value))
                .collect()
        }
    };

    let samples = samples
        .map_err(|e| CallError::PermissionDenied(format!("Failed to read samples: {}", e)))?;

    Ok((
        mix_to_mono(&samples, spec.channels as usize),
        spec.sample_rate,
    ))
}

#[async_trait]
impl Microphone for WavMicrophone {
    async fn open(&mut self, frames: mpsc::UnboundedSender<CaptureFrame>) -> CallResult<()> {
        self.close();

        let (samples, rate) = load_mono(&self.path)?;
        let samples = resample(&samples, rate, self.sample_rate);
        info!(
            "Streaming {} ({:.1}s) as microphone input",
            self.path.display(),
            samples.len() as f64 / self.sample_rate.max(1) as f64
        );

        let mut assembler = FrameAssembler::new(self.sample_rate, FRAME_SAMPLES);
        let mut queued = assembler.push(&samples, self.sample_rate);
        // Pad the tail so the last partial frame is not lost
        let tail = FRAME_SAMPLES - (samples.len() % FRAME_SAMPLES);
        if tail < FRAME_SAMPLES {
            queued.extend(assembler.push(&vec![0.0; tail], self.sample_rate));
        }

        let frame_period =
            Duration::from_secs_f64(FRAME_SAMPLES as f64 / self.sample_rate.max(1) as f64);

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame_period);
            let mut recorded = queued.into_iter();
            let mut silence_logged = false;

            loop {
                ticker.tick().await;
                let frame = match recorded.next() {
                    Some(frame) => frame,
                    None => {
                        if !silence_logged {
                            debug!("WAV input finished, sending silence");
                            silence_logged = true;
                        }
                        match assembler.push(&[0.0; FRAME_SAMPLES], assembler.target_rate()).pop() {
                            Some(frame) => frame,
                            None => continue,
                        }
                    }
                };
                if frames.send(frame).is_err() {
                    break;
                }
            }
        }));

        Ok(())
    }

    fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for WavMicrophone {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::{WavSpec, WavWriter};

    fn write_wav(path: &Path, channels: u16, rate: u32, samples: &[i16]) {
        let spec = WavSpec {
            channels,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn temp_wav(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("voxline-{}-{}.wav", name, uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_load_mixes_channels() {
        let path = temp_wav("stereo");
        write_wav(&path, 2, 8000, &[16384, 0, -16384, -16384]);

        let (samples, rate) = load_mono(&path).unwrap();
        assert_eq!(rate, 8000);
        assert_eq!(samples, vec![0.25, -0.5]);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_missing_file_is_permission_denied() {
        let err = load_mono("/nonexistent/voxline.wav").unwrap_err();
        assert!(matches!(err, CallError::PermissionDenied(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_recording_then_silence() {
        let path = temp_wav("mono");
        write_wav(&path, 1, 16000, &vec![8192; FRAME_SAMPLES + 10]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mic = WavMicrophone::new(&path, 16000);
        mic.open(tx).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(first.sequence, 0);
        assert!(first.samples.iter().all(|&s| s == 0.25));
        // Padded tail: 10 recorded samples then zeros
        assert_eq!(second.samples[9], 0.25);
        assert_eq!(second.samples[10], 0.0);
        assert_eq!(third.sequence, 2);
        assert!(third.samples.iter().all(|&s| s == 0.0));

        mic.close();
        let _ = std::fs::remove_file(path);
    }
}
