//! Audio capture using PipeWire
//!
//! The [`CapturePipeline`] turns microphone frames into PCM16 batches for the
//! transport. Frames arrive from a [`Microphone`] on its own cadence; batches
//! are cut by the session's fixed transmission interval, independent of it.

use crate::audio::codec::{encode_base64, f32_to_pcm16_bytes, mix_to_mono, resample};
use crate::error::{CallError, CallResult};
use async_trait::async_trait;
use crate::audio::stream_thread::{mono_f32_format, Graph, ReadySender, StreamCommand, StreamThread};
use log::{debug, trace, warn};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use tokio::sync::mpsc;

/// Samples per capture frame (64 ms at 16 kHz)
pub const FRAME_SAMPLES: usize = 1024;

/// A fixed-size block of mono input samples
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureFrame {
    /// Monotonically increasing position within the call
    pub sequence: u64,
    pub samples: Vec<f32>,
}

/// Cuts an arbitrary stream of samples into fixed-size, sequenced frames at
/// the target rate
#[derive(Debug)]
pub struct FrameAssembler {
    target_rate: u32,
    frame_len: usize,
    pending: Vec<f32>,
    next_sequence: u64,
}

impl FrameAssembler {
    pub fn new(target_rate: u32, frame_len: usize) -> Self {
        Self {
            target_rate,
            frame_len: frame_len.max(1),
            pending: Vec::with_capacity(frame_len * 2),
            next_sequence: 0,
        }
    }

    /// Append mono samples recorded at `rate` and return every completed frame
    pub fn push(&mut self, samples: &[f32], rate: u32) -> Vec<CaptureFrame> {
        if rate == self.target_rate {
            self.pending.extend_from_slice(samples);
        } else {
            self.pending
                .extend_from_slice(&resample(samples, rate, self.target_rate));
        }

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_len {
            let samples: Vec<f32> = self.pending.drain(..self.frame_len).collect();
            frames.push(CaptureFrame {
                sequence: self.next_sequence,
                samples,
            });
            self.next_sequence += 1;
        }
        frames
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }
}

/// An audio input device delivering mono frames at the capture rate
#[async_trait]
pub trait Microphone: Send {
    /// Acquire the device and start delivering frames on `frames`
    async fn open(&mut self, frames: mpsc::UnboundedSender<CaptureFrame>) -> CallResult<()>;

    /// Release the device. No frames are delivered after this returns.
    fn close(&mut self);
}

/// One transmission interval's worth of encoded audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBatch {
    pub mime_type: String,
    /// Base64 PCM16
    pub data: String,
    pub first_sequence: u64,
    pub frame_count: usize,
}

/// Microphone frames in, encoded PCM16 batches out
pub struct CapturePipeline {
    microphone: Box<dyn Microphone>,
    sample_rate: u32,
    frames_tx: mpsc::UnboundedSender<CaptureFrame>,
    frames_rx: mpsc::UnboundedReceiver<CaptureFrame>,
    /// PCM16 of frames not yet sent
    pending: Vec<u8>,
    pending_frames: usize,
    first_pending: Option<u64>,
    last_sequence: Option<u64>,
    running: bool,
}

impl CapturePipeline {
    pub fn new(microphone: Box<dyn Microphone>, sample_rate: u32) -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        Self {
            microphone,
            sample_rate,
            frames_tx,
            frames_rx,
            pending: Vec::new(),
            pending_frames: 0,
            first_pending: None,
            last_sequence: None,
            running: false,
        }
    }

    /// Acquire the microphone. Any failure is reported as `PermissionDenied`.
    pub async fn start(&mut self) -> CallResult<()> {
        if self.running {
            return Ok(());
        }
        self.clear();
        self.last_sequence = None;

        match self.microphone.open(self.frames_tx.clone()).await {
            Ok(()) => {
                self.running = true;
                debug!("Capture started at {} Hz", self.sample_rate);
                Ok(())
            }
            Err(CallError::PermissionDenied(msg)) => Err(CallError::PermissionDenied(msg)),
            Err(e) => Err(CallError::PermissionDenied(e.to_string())),
        }
    }

    /// Release the microphone and discard anything not yet sent
    pub fn stop(&mut self) {
        if self.running {
            self.microphone.close();
            self.running = false;
            debug!("Capture stopped");
        }
        self.clear();
        while self.frames_rx.try_recv().is_ok() {}
    }

    /// Wait for the next frame from the microphone
    pub async fn next_frame(&mut self) -> Option<CaptureFrame> {
        self.frames_rx.recv().await
    }

    /// Convert a frame to PCM16 and append it to the accumulator
    pub fn push_frame(&mut self, frame: CaptureFrame) {
        if !self.running {
            trace!("Ignoring frame {} while capture is stopped", frame.sequence);
            return;
        }
        if let Some(last) = self.last_sequence {
            if frame.sequence <= last {
                warn!(
                    "Dropping out-of-order capture frame {} (last {})",
                    frame.sequence, last
                );
                return;
            }
        }
        self.last_sequence = Some(frame.sequence);
        self.first_pending.get_or_insert(frame.sequence);
        self.pending
            .extend_from_slice(&f32_to_pcm16_bytes(&frame.samples));
        self.pending_frames += 1;
    }

    /// Concatenate, encode and clear the accumulator
    pub fn take_batch(&mut self) -> Option<AudioBatch> {
        let first_sequence = self.first_pending?;
        if self.pending.is_empty() {
            self.clear();
            return None;
        }

        let batch = AudioBatch {
            mime_type: format!("audio/pcm;rate={}", self.sample_rate),
            data: encode_base64(&self.pending),
            first_sequence,
            frame_count: self.pending_frames,
        };
        self.clear();
        Some(batch)
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.pending_frames = 0;
        self.first_pending = None;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Frames accumulated since the last batch
    pub fn pending_frames(&self) -> usize {
        self.pending_frames
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// PipeWire microphone
pub struct PipeWireMicrophone {
    sample_rate: u32,
    thread: StreamThread,
}

impl PipeWireMicrophone {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            thread: StreamThread::new("Capture"),
        }
    }
}

#[async_trait]
impl Microphone for PipeWireMicrophone {
    async fn open(&mut self, frames: mpsc::UnboundedSender<CaptureFrame>) -> CallResult<()> {
        let assembler = FrameAssembler::new(self.sample_rate, FRAME_SAMPLES);
        self.thread
            .start(CallError::PermissionDenied, move |receiver, ready| {
                run_capture_loop(assembler, frames, receiver, ready)
            })
            .await
    }

    fn close(&mut self) {
        self.thread.stop();
    }
}

/// Run the PipeWire capture loop in a background thread
fn run_capture_loop(
    assembler: FrameAssembler,
    frames: mpsc::UnboundedSender<CaptureFrame>,
    receiver: pw::channel::Receiver<StreamCommand>,
    ready: &mut ReadySender,
) -> Result<(), String> {
    let graph = Graph::connect()?;

    // User data for the stream callbacks
    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        assembler: FrameAssembler,
        frames: mpsc::UnboundedSender<CaptureFrame>,
    }

    let target_rate = assembler.target_rate();
    let user_data = UserData {
        format: Default::default(),
        assembler,
        frames,
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Capture",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => "Voxline",
    };

    let stream = pw::stream::StreamBox::new(&graph.core, "voxline-capture", props)
        .map_err(|e| format!("Failed to create PipeWire stream: {}", e))?;

    let _listener = stream
        .add_local_listener_with_user_data(user_data)
        .param_changed(|_, user_data, id, param| {
            let Some(param) = param else { return };
            if id != spa::param::ParamType::Format.as_raw() {
                return;
            }

            let (media_type, media_subtype) = match format_utils::parse_format(param) {
                Ok(v) => v,
                Err(_) => return,
            };

            if media_type != MediaType::Audio || media_subtype != MediaSubtype::Raw {
                return;
            }

            if let Err(e) = user_data.format.parse(param) {
                warn!("Failed to parse capture format: {:?}", e);
            }
        })
        .process(|stream, user_data| {
            let Some(mut buffer) = stream.dequeue_buffer() else {
                return;
            };

            let datas = buffer.datas_mut();
            if datas.is_empty() {
                return;
            }

            let data = &mut datas[0];
            let n_channels = user_data.format.channels().max(1) as usize;
            let sample_rate = user_data.format.rate();
            let n_bytes = data.chunk().size() as usize;

            let Some(raw) = data.data() else {
                return;
            };
            if sample_rate == 0 {
                return;
            }

            let interleaved: Vec<f32> = raw[..n_bytes.min(raw.len())]
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            let mono = mix_to_mono(&interleaved, n_channels);

            for frame in user_data.assembler.push(&mono, sample_rate) {
                if user_data.frames.send(frame).is_err() {
                    return;
                }
            }
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    // Ask for mono F32LE at the capture rate; the assembler resamples if the
    // graph negotiates something else
    let values = mono_f32_format(target_rate)?;
    let pod = Pod::from_bytes(&values).ok_or("Failed to build format pod")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Input,
            None,
            pw::stream::StreamFlags::AUTOCONNECT
                | pw::stream::StreamFlags::MAP_BUFFERS
                | pw::stream::StreamFlags::RT_PROCESS,
            &mut params,
        )
        .map_err(|e| format!("Failed to connect stream: {}", e))?;

    if let Some(tx) = ready.take() {
        let _ = tx.send(Ok(()));
    }

    graph.run_until_stopped(receiver);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec::decode_base64;
    use crate::testing::FakeMicrophone;

    fn frame(sequence: u64, value: f32, len: usize) -> CaptureFrame {
        CaptureFrame {
            sequence,
            samples: vec![value; len],
        }
    }

    #[test]
    fn test_assembler_emits_fixed_size_sequenced_frames() {
        let mut assembler = FrameAssembler::new(16000, 4);
        assert!(assembler.push(&[0.1, 0.2, 0.3], 16000).is_empty());

        let frames = assembler.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9], 16000);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].sequence, 0);
        assert_eq!(frames[0].samples, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(frames[1].sequence, 1);
        assert_eq!(frames[1].samples, vec![0.5, 0.6, 0.7, 0.8]);
    }

    #[test]
    fn test_assembler_resamples_to_target_rate() {
        let mut assembler = FrameAssembler::new(16000, 160);
        // 960 samples at 48 kHz are 320 at 16 kHz
        let frames = assembler.push(&vec![0.25; 960], 48000);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.samples.len() == 160));
    }

    #[tokio::test]
    async fn test_batches_concatenate_frames_in_order() {
        let mic = FakeMicrophone::default();
        let mut capture = CapturePipeline::new(Box::new(mic.clone()), 16000);
        capture.start().await.unwrap();

        capture.push_frame(frame(0, 0.5, 2));
        capture.push_frame(frame(1, -1.0, 1));
        assert_eq!(capture.pending_frames(), 2);

        let batch = capture.take_batch().unwrap();
        assert_eq!(batch.mime_type, "audio/pcm;rate=16000");
        assert_eq!(batch.first_sequence, 0);
        assert_eq!(batch.frame_count, 2);

        let pcm = decode_base64(&batch.data).unwrap();
        let expected: Vec<u8> = [16383i16, 16383, -32767]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        assert_eq!(pcm, expected);

        // The accumulator is cleared after each batch
        assert!(capture.take_batch().is_none());
        assert_eq!(capture.pending_frames(), 0);
    }

    #[tokio::test]
    async fn test_frames_reach_pipeline_from_microphone() {
        let mic = FakeMicrophone::default();
        let mut capture = CapturePipeline::new(Box::new(mic.clone()), 16000);
        capture.start().await.unwrap();

        mic.emit(vec![0.1; 8]);
        mic.emit(vec![0.2; 8]);
        let first = capture.next_frame().await.unwrap();
        let second = capture.next_frame().await.unwrap();
        assert_eq!((first.sequence, second.sequence), (0, 1));
    }

    #[tokio::test]
    async fn test_open_failure_is_permission_denied() {
        let mic = FakeMicrophone::failing("device busy");
        let mut capture = CapturePipeline::new(Box::new(mic.clone()), 16000);

        let err = capture.start().await.unwrap_err();
        assert!(matches!(err, CallError::PermissionDenied(_)));
        assert!(!capture.is_running());
    }

    #[tokio::test]
    async fn test_stop_releases_device_and_discards_pending() {
        let mic = FakeMicrophone::default();
        let mut capture = CapturePipeline::new(Box::new(mic.clone()), 16000);
        capture.start().await.unwrap();
        capture.push_frame(frame(0, 0.1, 4));

        capture.stop();
        assert_eq!(mic.closes(), 1);
        assert!(capture.take_batch().is_none());

        // Frames after stop are ignored
        capture.push_frame(frame(1, 0.1, 4));
        assert_eq!(capture.pending_frames(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_frames_are_dropped() {
        let mic = FakeMicrophone::default();
        let mut capture = CapturePipeline::new(Box::new(mic), 16000);
        capture.start().await.unwrap();

        capture.push_frame(frame(3, 0.1, 2));
        capture.push_frame(frame(2, 0.1, 2));
        assert_eq!(capture.pending_frames(), 1);
    }
}
