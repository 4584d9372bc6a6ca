//! In-memory devices, transport and credentials for unit tests

use crate::audio::{AudioSink, CaptureFrame, Microphone, SourceId};
use crate::error::{CallError, CallResult};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::transport::{Credential, CredentialSource, Topology, Transport, TransportEvent};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One `schedule` call seen by [`FakeSink`]
#[derive(Debug, Clone, PartialEq)]
pub struct Scheduled {
    pub id: SourceId,
    pub start: f64,
    pub duration: f64,
    pub first_sample: f32,
}

#[derive(Default)]
struct SinkState {
    clock: f64,
    scheduled: Vec<Scheduled>,
    stopped: Vec<SourceId>,
    ended: Option<mpsc::UnboundedSender<SourceId>>,
    open: bool,
}

/// Output device with a manually advanced clock. Never reports completion
/// on its own; see [`FakeSink::finish`].
#[derive(Clone)]
pub struct FakeSink {
    rate: u32,
    state: Arc<Mutex<SinkState>>,
}

impl FakeSink {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            state: Arc::new(Mutex::new(SinkState::default())),
        }
    }

    pub fn advance(&self, secs: f64) {
        lock(&self.state).clock += secs;
    }

    /// Report `id` as finished
    pub fn finish(&self, id: SourceId) {
        if let Some(tx) = &lock(&self.state).ended {
            let _ = tx.send(id);
        }
    }

    pub fn scheduled(&self) -> Vec<Scheduled> {
        lock(&self.state).scheduled.clone()
    }

    pub fn stopped(&self) -> Vec<SourceId> {
        lock(&self.state).stopped.clone()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }
}

#[async_trait]
impl AudioSink for FakeSink {
    async fn open(&mut self, ended: mpsc::UnboundedSender<SourceId>) -> CallResult<()> {
        let mut state = lock(&self.state);
        state.ended = Some(ended);
        state.open = true;
        Ok(())
    }

    fn now(&self) -> f64 {
        lock(&self.state).clock
    }

    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn schedule(&mut self, id: SourceId, samples: Vec<f32>, start_at: f64) -> CallResult<()> {
        lock(&self.state).scheduled.push(Scheduled {
            id,
            start: start_at,
            duration: samples.len() as f64 / self.rate as f64,
            first_sample: samples.first().copied().unwrap_or(0.0),
        });
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        lock(&self.state).stopped.push(id);
    }

    fn close(&mut self) {
        let mut state = lock(&self.state);
        state.ended = None;
        state.open = false;
    }
}

#[derive(Default)]
struct MicState {
    frames: Option<mpsc::UnboundedSender<CaptureFrame>>,
    sequence: u64,
    opens: usize,
    closes: usize,
    failure: Option<String>,
}

/// Microphone fed by the test through [`FakeMicrophone::emit`]
#[derive(Clone, Default)]
pub struct FakeMicrophone {
    state: Arc<Mutex<MicState>>,
}

impl FakeMicrophone {
    /// A microphone whose `open` always fails
    pub fn failing(msg: &str) -> Self {
        let mic = Self::default();
        lock(&mic.state).failure = Some(msg.to_string());
        mic
    }

    /// Deliver one frame, if the microphone is open
    pub fn emit(&self, samples: Vec<f32>) {
        let mut state = lock(&self.state);
        let sequence = state.sequence;
        if let Some(tx) = &state.frames {
            let _ = tx.send(CaptureFrame { sequence, samples });
            state.sequence += 1;
        }
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn closes(&self) -> usize {
        lock(&self.state).closes
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn open(&mut self, frames: mpsc::UnboundedSender<CaptureFrame>) -> CallResult<()> {
        let mut state = lock(&self.state);
        if let Some(msg) = &state.failure {
            return Err(CallError::PermissionDenied(msg.clone()));
        }
        state.opens += 1;
        state.sequence = 0;
        state.frames = Some(frames);
        Ok(())
    }

    fn close(&mut self) {
        let mut state = lock(&self.state);
        state.closes += 1;
        state.frames = None;
    }
}

struct TransportState {
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    credentials: Vec<Credential>,
    sent: Vec<ClientMessage>,
    closes: usize,
    fail_open: bool,
    /// How long `open` takes
    open_delay: Option<Duration>,
    /// Answer every `Setup` with `SetupComplete`
    auto_ack: bool,
}

/// Scripted service connection
#[derive(Clone)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState {
                events: None,
                credentials: Vec::new(),
                sent: Vec::new(),
                closes: 0,
                fail_open: false,
                open_delay: None,
                auto_ack: true,
            })),
        }
    }
}

impl FakeTransport {
    /// Leave `Setup` unanswered until the test pushes `SetupComplete`
    pub fn without_ack() -> Self {
        let transport = Self::default();
        lock(&transport.state).auto_ack = false;
        transport
    }

    pub fn set_fail_open(&self, fail: bool) {
        lock(&self.state).fail_open = fail;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        lock(&self.state).open_delay = Some(delay);
    }

    /// Deliver a message from the service
    pub fn push(&self, message: ServerMessage) {
        if let Some(tx) = &lock(&self.state).events {
            let _ = tx.send(TransportEvent::Message(message));
        }
    }

    /// Drop the connection from the remote side
    pub fn close_with(&self, code: Option<u16>) {
        let mut state = lock(&self.state);
        if let Some(tx) = state.events.take() {
            let _ = tx.send(TransportEvent::Closed {
                code,
                reason: String::new(),
            });
        }
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        lock(&self.state).sent.clone()
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).credentials.len()
    }

    pub fn credentials(&self) -> Vec<Credential> {
        lock(&self.state).credentials.clone()
    }

    pub fn closes(&self) -> usize {
        lock(&self.state).closes
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(
        &mut self,
        credential: &Credential,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> CallResult<()> {
        let delay = {
            let mut state = lock(&self.state);
            state.credentials.push(credential.clone());
            if state.fail_open {
                return Err(CallError::SetupFailed("connection refused".to_string()));
            }
            state.open_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.state).events = Some(events);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        lock(&self.state).events.is_some()
    }

    async fn send(&mut self, message: &ClientMessage) -> CallResult<()> {
        let mut state = lock(&self.state);
        let Some(events) = state.events.clone() else {
            return Err(CallError::Transport("not connected".to_string()));
        };
        state.sent.push(message.clone());
        if state.auto_ack && matches!(message, ClientMessage::Setup(_)) {
            let _ = events.send(TransportEvent::Message(ServerMessage::SetupComplete));
        }
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = lock(&self.state);
        state.events = None;
        state.closes += 1;
    }

    fn topology(&self) -> Topology {
        Topology::Direct
    }
}

#[derive(Default)]
struct CredentialState {
    acquired: usize,
    failing: bool,
}

/// Hands out `token-1`, `token-2`, ... so each acquisition is distinguishable
#[derive(Clone, Default)]
pub struct FakeCredentials {
    state: Arc<Mutex<CredentialState>>,
}

impl FakeCredentials {
    pub fn set_failing(&self, failing: bool) {
        lock(&self.state).failing = failing;
    }

    pub fn acquired(&self) -> usize {
        lock(&self.state).acquired
    }
}

#[async_trait]
impl CredentialSource for FakeCredentials {
    async fn acquire(&self) -> CallResult<Credential> {
        let mut state = lock(&self.state);
        if state.failing {
            return Err(CallError::SetupFailed("token service unavailable".to_string()));
        }
        state.acquired += 1;
        Ok(Credential::new(format!("token-{}", state.acquired)))
    }
}
