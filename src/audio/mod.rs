//! Audio capture and playback module using PipeWire
//!
//! This module provides:
//! - PCM16 conversion and transport encoding
//! - Microphone capture at 16kHz mono, batched for the transport
//! - Gapless playback of the service's 24kHz speech with immediate flush
//! - A WAV-file microphone for headless calls

pub mod codec;
mod capture;
mod playback;
mod stream_thread;
mod wav_source;

pub use capture::{
    AudioBatch, CaptureFrame, CapturePipeline, FrameAssembler, Microphone, PipeWireMicrophone,
    FRAME_SAMPLES,
};
pub use playback::{
    AudioSink, PipeWireSink, PlaybackChunk, PlaybackConfig, PlaybackPipeline, PlaybackTimer,
    PlaybackWake, SharedTimeline, SourceId,
};
pub use wav_source::{load_mono, WavMicrophone};
