//! Gapless playback of the service's synthesized speech
//!
//! [`PlaybackPipeline`] owns a bounded, ordered queue of PCM16 chunks and
//! schedules them one after another on an [`AudioSink`]. Start times are
//! computed from the previous chunk's end on the sink clock, so consecutive
//! chunks play back-to-back. Chunks are handed to the sink up to
//! `schedule_ahead` before they are due, since a completion notice only
//! arrives after the device has consumed a whole buffer. Every scheduled unit
//! is tracked in a live-sources registry so [`PlaybackPipeline::flush`] can
//! stop each one.
//!
//! [`PipeWireSink`] is the hardware sink: a PipeWire output stream rendering a
//! shared timeline of scheduled sources.

use crate::audio::codec::{pcm16_bytes_to_f32, resample};
use crate::error::{CallError, CallResult};
use crate::session::timers::{Fired, Timers};
use crate::audio::stream_thread::{mono_f32_format, Graph, ReadySender, StreamCommand, StreamThread};
use async_trait::async_trait;
use log::{debug, trace, warn};
use pipewire as pw;
use pw::spa;
use pw::spa::param::format::{MediaSubtype, MediaType};
use pw::spa::param::format_utils;
use pw::spa::pod::Pod;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Identifier of one scheduled output unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub u64);

/// A block of PCM16 audio received from the transport
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackChunk {
    /// Position in receive order
    pub order: u64,
    pub pcm: Vec<u8>,
}

/// An audio output device that plays sources at scheduled times
#[async_trait]
pub trait AudioSink: Send {
    /// Acquire the device. The id of every source that finishes playing is
    /// sent on `ended`.
    async fn open(&mut self, ended: mpsc::UnboundedSender<SourceId>) -> CallResult<()>;

    /// Current position of the output clock in seconds
    fn now(&self) -> f64;

    fn sample_rate(&self) -> u32;

    /// Schedule mono samples to start at `start_at` on the output clock
    fn schedule(&mut self, id: SourceId, samples: Vec<f32>, start_at: f64) -> CallResult<()>;

    /// Stop a scheduled or playing source. Unknown ids are ignored.
    fn stop(&mut self, id: SourceId);

    /// Release the device
    fn close(&mut self);
}

/// Playback tuning
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Maximum number of queued chunks; the oldest is dropped beyond this
    pub queue_limit: usize,
    /// Sample rate of the PCM16 chunks received from the service
    pub input_sample_rate: u32,
    /// Chunks to buffer before starting from idle (1 = start on first arrival)
    pub prebuffer_chunks: usize,
    /// Start anyway if the warm-up window is not filled within this time
    pub prebuffer_timeout: Duration,
    /// How far past the sink clock chunks are scheduled. Zero schedules one
    /// chunk at a time.
    pub schedule_ahead: Duration,
    /// Interval between polls of an empty queue
    pub idle_poll_interval: Duration,
    /// Polls of an empty queue before the loop goes idle
    pub idle_polls: u32,
    /// Extra time past a source's end before its completion counts as missed
    pub safety_margin: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            queue_limit: 60,
            input_sample_rate: 24000,
            prebuffer_chunks: 1,
            prebuffer_timeout: Duration::from_millis(150),
            schedule_ahead: Duration::from_millis(200),
            idle_poll_interval: Duration::from_millis(20),
            idle_polls: 5,
            safety_margin: Duration::from_millis(250),
        }
    }
}

/// Timers owned by the playback loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackTimer {
    /// Fallback for a completion notification that never arrives
    Safety(SourceId),
    IdlePoll,
    Warmup,
}

/// Something the playback loop has to react to
#[derive(Debug)]
pub enum PlaybackWake {
    SourceEnded(SourceId),
    Timer(Fired<PlaybackTimer>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Idle,
    Warming,
    Playing,
    Polling { remaining: u32 },
}

#[derive(Debug, Clone, Copy)]
struct ScheduledSource {
    order: u64,
    end: f64,
}

/// Bounded, ordered, gapless playback of received audio
pub struct PlaybackPipeline {
    sink: Box<dyn AudioSink>,
    config: PlaybackConfig,
    queue: VecDeque<PlaybackChunk>,
    /// Live-sources registry
    live: BTreeMap<SourceId, ScheduledSource>,
    /// End of the last scheduled chunk; `None` when nothing is scheduled
    next_start: Option<f64>,
    loop_state: LoopState,
    next_order: u64,
    next_source: u64,
    dropped: u64,
    opened: bool,
    timers: Timers<PlaybackTimer>,
    timer_rx: mpsc::UnboundedReceiver<Fired<PlaybackTimer>>,
    ended_tx: mpsc::UnboundedSender<SourceId>,
    ended_rx: mpsc::UnboundedReceiver<SourceId>,
}

impl PlaybackPipeline {
    pub fn new(sink: Box<dyn AudioSink>, config: PlaybackConfig) -> Self {
        let (timers, timer_rx) = Timers::channel();
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        Self {
            sink,
            config,
            queue: VecDeque::new(),
            live: BTreeMap::new(),
            next_start: None,
            loop_state: LoopState::Idle,
            next_order: 0,
            next_source: 0,
            dropped: 0,
            opened: false,
            timers,
            timer_rx,
            ended_tx,
            ended_rx,
        }
    }

    /// Acquire the output device
    pub async fn start(&mut self) -> CallResult<()> {
        if self.opened {
            return Ok(());
        }
        self.sink.open(self.ended_tx.clone()).await?;
        self.opened = true;
        debug!("Playback device opened at {} Hz", self.sink.sample_rate());
        Ok(())
    }

    /// Queue a chunk of PCM16 audio, starting the playback loop if it is idle
    pub fn enqueue(&mut self, pcm: Vec<u8>) {
        if !self.opened {
            debug!("Playback not started, dropping {} bytes", pcm.len());
            return;
        }
        if pcm.len() < 2 {
            return;
        }

        while self.queue.len() >= self.config.queue_limit.max(1) {
            if let Some(oldest) = self.queue.pop_front() {
                self.dropped += 1;
                debug!(
                    "Playback queue full, dropped chunk {} ({} dropped so far)",
                    oldest.order, self.dropped
                );
            }
        }

        let order = self.next_order;
        self.next_order += 1;
        self.queue.push_back(PlaybackChunk { order, pcm });

        match self.loop_state {
            LoopState::Idle | LoopState::Warming
                if self.queue.len() < self.config.prebuffer_chunks =>
            {
                if self.loop_state == LoopState::Idle {
                    self.loop_state = LoopState::Warming;
                    self.timers
                        .arm(PlaybackTimer::Warmup, self.config.prebuffer_timeout);
                }
            }
            LoopState::Playing => self.pump(),
            _ => {
                self.timers.cancel(&PlaybackTimer::Warmup);
                self.timers.cancel(&PlaybackTimer::IdlePoll);
                self.pump();
            }
        }
    }

    /// Stop everything that is playing or pending and clear the queue.
    ///
    /// Safe to call at any time; calling it twice is the same as once.
    pub fn flush(&mut self) {
        let stopped = self.live.len();
        let discarded = self.queue.len();

        for id in self.live.keys() {
            self.sink.stop(*id);
        }
        self.live.clear();
        self.queue.clear();
        self.next_start = None;
        self.timers.cancel_all();
        self.loop_state = LoopState::Idle;

        if stopped > 0 || discarded > 0 {
            debug!(
                "Playback flushed: {} playing stopped, {} queued discarded",
                stopped, discarded
            );
        }
    }

    /// Flush and release the output device
    pub fn close(&mut self) {
        self.flush();
        if self.opened {
            self.sink.close();
            self.opened = false;
        }
    }

    /// Wait for the next completion notice or playback timer
    pub async fn next_wake(&mut self) -> PlaybackWake {
        tokio::select! {
            Some(id) = self.ended_rx.recv() => PlaybackWake::SourceEnded(id),
            Some(fired) = self.timer_rx.recv() => PlaybackWake::Timer(fired),
            else => std::future::pending().await,
        }
    }

    pub fn handle_wake(&mut self, wake: PlaybackWake) {
        match wake {
            PlaybackWake::SourceEnded(id) => self.on_source_ended(id),
            PlaybackWake::Timer(fired) => {
                if !self.timers.settle(&fired) {
                    trace!("Ignoring stale playback timer {:?}", fired.key);
                    return;
                }
                match fired.key {
                    PlaybackTimer::Safety(id) => self.on_missed_completion(id),
                    PlaybackTimer::IdlePoll => self.on_idle_poll(),
                    PlaybackTimer::Warmup => {
                        if self.loop_state == LoopState::Warming {
                            self.pump();
                        }
                    }
                }
            }
        }
    }

    /// Completion notice from the sink; authoritative over the safety timer
    pub fn on_source_ended(&mut self, id: SourceId) {
        if self.live.remove(&id).is_none() {
            trace!("Ignoring completion of inactive source {:?}", id);
            return;
        }
        self.timers.cancel(&PlaybackTimer::Safety(id));
        self.pump();
    }

    fn on_missed_completion(&mut self, id: SourceId) {
        let Some(source) = self.live.remove(&id) else {
            return;
        };
        warn!(
            "Completion of chunk {} (due at {:.3}s) never arrived, continuing playback",
            source.order, source.end
        );
        self.sink.stop(id);
        self.pump();
    }

    fn on_idle_poll(&mut self) {
        if !self.queue.is_empty() {
            self.pump();
            return;
        }
        match self.loop_state {
            LoopState::Polling { remaining } if remaining > 1 => {
                self.loop_state = LoopState::Polling {
                    remaining: remaining - 1,
                };
                self.timers
                    .arm(PlaybackTimer::IdlePoll, self.config.idle_poll_interval);
            }
            _ => self.go_idle(),
        }
    }

    fn go_idle(&mut self) {
        trace!("Playback loop idle");
        self.loop_state = LoopState::Idle;
        self.next_start = None;
    }

    /// Schedule queued chunks until the sink holds `schedule_ahead` of audio
    fn pump(&mut self) {
        let ahead = self.config.schedule_ahead.as_secs_f64();
        while self.live.is_empty() || self.scheduled_ahead() < ahead {
            let Some(chunk) = self.queue.pop_front() else {
                break;
            };
            let rate = self.sink.sample_rate();
            let mut samples = pcm16_bytes_to_f32(&chunk.pcm);
            if rate != self.config.input_sample_rate {
                samples = resample(&samples, self.config.input_sample_rate, rate);
            }
            if samples.is_empty() || rate == 0 {
                continue;
            }

            let now = self.sink.now();
            let start = match self.next_start {
                Some(end) if end > now => end,
                _ => now,
            };
            let duration = samples.len() as f64 / rate as f64;
            let id = SourceId(self.next_source);
            self.next_source += 1;

            if let Err(e) = self.sink.schedule(id, samples, start) {
                warn!("Dropping chunk {}: {}", chunk.order, e);
                continue;
            }

            trace!(
                "Scheduled chunk {} as {:?} at {:.3}s for {:.3}s",
                chunk.order,
                id,
                start,
                duration
            );
            self.live.insert(
                id,
                ScheduledSource {
                    order: chunk.order,
                    end: start + duration,
                },
            );
            self.next_start = Some(start + duration);
            self.loop_state = LoopState::Playing;

            let until_end = (start - now).max(0.0) + duration;
            self.timers.arm(
                PlaybackTimer::Safety(id),
                Duration::from_secs_f64(until_end) + self.config.safety_margin,
            );
        }

        if !self.live.is_empty() {
            return;
        }
        if self.config.idle_polls == 0 {
            self.go_idle();
        } else {
            self.loop_state = LoopState::Polling {
                remaining: self.config.idle_polls,
            };
            self.timers
                .arm(PlaybackTimer::IdlePoll, self.config.idle_poll_interval);
        }
    }

    /// Audio already handed to the sink that has not played yet, in seconds
    fn scheduled_ahead(&self) -> f64 {
        self.next_start
            .map_or(0.0, |end| (end - self.sink.now()).max(0.0))
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Receive-order positions of the queued chunks, oldest first
    pub fn queued_orders(&self) -> Vec<u64> {
        self.queue.iter().map(|c| c.order).collect()
    }

    pub fn live_sources(&self) -> Vec<SourceId> {
        self.live.keys().copied().collect()
    }

    /// End time of the last scheduled chunk, if any
    pub fn scheduled_until(&self) -> Option<f64> {
        self.next_start
    }

    pub fn is_playing(&self) -> bool {
        !self.live.is_empty() || self.loop_state != LoopState::Idle
    }

    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// Chunks dropped by queue admission since creation
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.close();
    }
}

/// Scheduled sources rendered by the output thread - thread-safe
#[derive(Clone)]
pub struct SharedTimeline {
    inner: Arc<Mutex<TimelineInner>>,
}

struct TimelineInner {
    sample_rate: u32,
    /// Frames rendered so far; the output clock
    frames_rendered: u64,
    /// Sources ordered by start frame
    sources: VecDeque<TimelineSource>,
    ended: Option<mpsc::UnboundedSender<SourceId>>,
}

struct TimelineSource {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
    position: usize,
}

impl SharedTimeline {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TimelineInner {
                sample_rate,
                frames_rendered: 0,
                sources: VecDeque::new(),
                ended: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TimelineInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reset the clock and attach the completion listener
    fn reset(&self, ended: Option<mpsc::UnboundedSender<SourceId>>) {
        let mut inner = self.lock();
        inner.frames_rendered = 0;
        inner.sources.clear();
        inner.ended = ended;
    }

    pub fn now(&self) -> f64 {
        let inner = self.lock();
        inner.frames_rendered as f64 / inner.sample_rate.max(1) as f64
    }

    pub fn schedule(&self, id: SourceId, samples: Vec<f32>, start_at: f64) {
        let mut inner = self.lock();
        let start_frame = (start_at.max(0.0) * inner.sample_rate as f64).round() as u64;
        let index = inner
            .sources
            .iter()
            .position(|s| s.start_frame > start_frame)
            .unwrap_or(inner.sources.len());
        inner.sources.insert(
            index,
            TimelineSource {
                id,
                start_frame,
                samples,
                position: 0,
            },
        );
    }

    pub fn stop(&self, id: SourceId) {
        self.lock().sources.retain(|s| s.id != id);
    }

    /// Fill `out` with the next mono frames and advance the clock.
    ///
    /// A source counts as ended once its last sample has been handed to the
    /// device.
    pub fn render(&self, out: &mut [f32]) {
        let mut finished = Vec::new();
        let ended = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let base = inner.frames_rendered;

            for (i, slot) in out.iter_mut().enumerate() {
                let frame = base + i as u64;
                *slot = 0.0;
                while let Some(front) = inner.sources.front_mut() {
                    if front.start_frame > frame {
                        break;
                    }
                    if let Some(&sample) = front.samples.get(front.position) {
                        *slot = sample;
                        front.position += 1;
                        if front.position == front.samples.len() {
                            finished.push(front.id);
                            inner.sources.pop_front();
                        }
                        break;
                    }
                    finished.push(front.id);
                    inner.sources.pop_front();
                }
            }

            inner.frames_rendered += out.len() as u64;
            inner.ended.clone()
        };

        if let Some(ended) = ended {
            for id in finished {
                let _ = ended.send(id);
            }
        }
    }
}

/// PipeWire output device
pub struct PipeWireSink {
    timeline: SharedTimeline,
    sample_rate: u32,
    thread: StreamThread,
}

impl PipeWireSink {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            timeline: SharedTimeline::new(sample_rate),
            sample_rate,
            thread: StreamThread::new("Output"),
        }
    }
}

#[async_trait]
impl AudioSink for PipeWireSink {
    async fn open(&mut self, ended: mpsc::UnboundedSender<SourceId>) -> CallResult<()> {
        if self.thread.is_running() {
            return Err(CallError::Playback("Output already open".to_string()));
        }
        self.timeline.reset(Some(ended));

        let timeline = self.timeline.clone();
        let sample_rate = self.sample_rate;
        self.thread
            .start(CallError::Playback, move |receiver, ready| {
                run_output_loop(timeline, sample_rate, receiver, ready)
            })
            .await
    }

    fn now(&self) -> f64 {
        self.timeline.now()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn schedule(&mut self, id: SourceId, samples: Vec<f32>, start_at: f64) -> CallResult<()> {
        if !self.thread.is_running() {
            return Err(CallError::Playback("Output stream not running".to_string()));
        }
        self.timeline.schedule(id, samples, start_at);
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        self.timeline.stop(id);
    }

    fn close(&mut self) {
        self.thread.stop();
        self.timeline.reset(None);
    }
}

/// Run the PipeWire output loop in a background thread
fn run_output_loop(
    timeline: SharedTimeline,
    sample_rate: u32,
    receiver: pw::channel::Receiver<StreamCommand>,
    ready: &mut ReadySender,
) -> Result<(), String> {
    let graph = Graph::connect()?;

    struct UserData {
        format: spa::param::audio::AudioInfoRaw,
        timeline: SharedTimeline,
        scratch: Vec<f32>,
    }

    let user_data = UserData {
        format: Default::default(),
        timeline,
        scratch: Vec::new(),
    };

    let props = pw::properties::properties! {
        *pw::keys::MEDIA_TYPE => "Audio",
        *pw::keys::MEDIA_CATEGORY => "Playback",
        *pw::keys::MEDIA_ROLE => "Communication",
        *pw::keys::APP_NAME => "Voxline",
    };

    let stream = pw::stream::StreamBox::new(&graph.core, "voxline-playback", props)
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
                warn!("Failed to parse output format: {:?}", e);
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
            let stride = std::mem::size_of::<f32>() * n_channels;

            let Some(slice) = data.data() else {
                return;
            };

            let n_frames = slice.len() / stride;
            user_data.scratch.resize(n_frames, 0.0);
            user_data.timeline.render(&mut user_data.scratch);

            for (i, &sample) in user_data.scratch.iter().enumerate() {
                let bytes = sample.to_le_bytes();
                for channel in 0..n_channels {
                    let offset = i * stride + channel * 4;
                    slice[offset..offset + 4].copy_from_slice(&bytes);
                }
            }

            let chunk = data.chunk_mut();
            *chunk.offset_mut() = 0;
            *chunk.stride_mut() = stride as i32;
            *chunk.size_mut() = (n_frames * stride) as u32;
        })
        .register()
        .map_err(|e| format!("Failed to register stream listener: {}", e))?;

    // Mono F32LE at the service's output rate; PipeWire converts for the device
    let values = mono_f32_format(sample_rate)?;

    let pod = Pod::from_bytes(&values).ok_or("Failed to build format pod")?;
    let mut params = [pod];

    stream
        .connect(
            spa::utils::Direction::Output,
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
