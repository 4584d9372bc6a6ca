//! Call session runner
//!
//! One control loop owns the state machine and every resource of the call.
//! Commands, transport events, timers, playback completions, microphone
//! frames and the batch ticker are all multiplexed in a single `select!`, so
//! machine transitions never interleave.
//!
//! Credential requests and connection attempts run as tasks beside the loop
//! and report back as machine inputs. A hang-up abandons them.

use crate::audio::{AudioSink, CapturePipeline, Microphone, PlaybackConfig, PlaybackPipeline};
use crate::error::{CallError, CallResult};
use crate::protocol::ClientMessage;
use crate::session::machine::{CallMachine, CallState, Effect, EndReason, Input, MachineConfig, SessionTimer};
use crate::session::status::StatusSink;
use crate::session::timers::{Fired, Timers};
use crate::settings::VoicePreference;
use crate::transport::{Credential, CredentialSource, Transport, TransportEvent};
use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

/// Requests from whoever controls the call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    Start,
    End,
    /// End any call in progress and stop the loop
    Shutdown,
}

/// Tunables of a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub machine: MachineConfig,
    pub playback: PlaybackConfig,
    pub capture_sample_rate: u32,
    /// How often accumulated microphone frames are sent
    pub batch_interval: Duration,
}

/// Hardware, network and UI the session drives
pub struct SessionParts {
    pub microphone: Box<dyn Microphone>,
    pub sink: Box<dyn AudioSink>,
    pub transport: Box<dyn Transport>,
    pub credentials: Box<dyn CredentialSource>,
    pub status: Box<dyn StatusSink>,
    pub voice: Box<dyn VoicePreference>,
}

/// A credential request or connection attempt in flight
struct PendingSetup {
    task: JoinHandle<SetupOutcome>,
    /// Set for connection attempts; firing it gives the transport back
    cancel: Option<oneshot::Sender<()>>,
}

enum SetupOutcome {
    Credential(CallResult<Credential>),
    Connection {
        transport: Box<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        /// `None` when the attempt was abandoned
        result: Option<CallResult<()>>,
    },
}

/// A duplex voice call session
pub struct CallSession {
    machine: CallMachine,
    capture: CapturePipeline,
    playback: PlaybackPipeline,
    /// Away while a connection attempt owns it
    transport: Option<Box<dyn Transport>>,
    /// Events of the current connection; replaced on every open
    transport_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    pending: Option<PendingSetup>,
    credentials: Arc<dyn CredentialSource>,
    status: Box<dyn StatusSink>,
    voice: Box<dyn VoicePreference>,
    timers: Timers<SessionTimer>,
    timer_rx: mpsc::UnboundedReceiver<Fired<SessionTimer>>,
    setup_timeout: Duration,
    batch_interval: Duration,
    call_id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_pending(pending: &mut Option<PendingSetup>) -> Result<SetupOutcome, JoinError> {
    match pending {
        Some(pending) => (&mut pending.task).await,
        None => std::future::pending().await,
    }
}

impl CallSession {
    pub fn new(options: SessionOptions, parts: SessionParts) -> Self {
        let (timers, timer_rx) = Timers::channel();
        Self {
            setup_timeout: options.machine.setup_timeout,
            machine: CallMachine::new(options.machine),
            capture: CapturePipeline::new(parts.microphone, options.capture_sample_rate),
            playback: PlaybackPipeline::new(parts.sink, options.playback),
            transport: Some(parts.transport),
            transport_rx: None,
            pending: None,
            credentials: Arc::from(parts.credentials),
            status: parts.status,
            voice: parts.voice,
            timers,
            timer_rx,
            batch_interval: options.batch_interval,
            call_id: None,
            started_at: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.machine.state()
    }

    /// Serve commands until `Shutdown` or until the command channel closes.
    ///
    /// Returns how the last call ended, if there was one.
    pub async fn run(
        &mut self,
        commands: mpsc::UnboundedReceiver<CallCommand>,
    ) -> Option<EndReason> {
        self.drive(commands, false).await
    }

    /// Start one call immediately and return once it is over
    pub async fn run_call(
        &mut self,
        commands: mpsc::UnboundedReceiver<CallCommand>,
    ) -> Option<EndReason> {
        self.start_call().await;
        self.drive(commands, true).await
    }

    async fn drive(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<CallCommand>,
        single_call: bool,
    ) -> Option<EndReason> {
        let mut ticker = tokio::time::interval(self.batch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut commands_open = true;
        let mut shutting_down = false;

        loop {
            if self.machine.state() == CallState::Idle
                && (shutting_down || (single_call && self.call_id.is_some()))
            {
                break;
            }

            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(CallCommand::Start) => self.start_call().await,
                    Some(CallCommand::End) => self.dispatch(Input::EndRequested).await,
                    Some(CallCommand::Shutdown) | None => {
                        if command.is_none() {
                            commands_open = false;
                        }
                        shutting_down = true;
                        self.dispatch(Input::EndRequested).await;
                    }
                },
                event = recv_opt(&mut self.transport_rx) => {
                    let event = event.unwrap_or_else(|| {
                        // Reader went away without a close frame
                        TransportEvent::Closed {
                            code: None,
                            reason: "connection lost".to_string(),
                        }
                    });
                    if matches!(event, TransportEvent::Closed { .. }) {
                        self.transport_rx = None;
                    }
                    self.dispatch(Input::Transport(event)).await;
                },
                outcome = join_pending(&mut self.pending) => {
                    let connecting = self
                        .pending
                        .take()
                        .is_some_and(|pending| pending.cancel.is_some());
                    if let Some(input) = self.settle_setup(outcome, connecting) {
                        self.dispatch(input).await;
                    }
                },
                Some(fired) = self.timer_rx.recv() => {
                    if self.timers.settle(&fired) {
                        self.dispatch(Input::Timer(fired.key)).await;
                    } else {
                        trace!("Ignoring stale timer {:?}", fired.key);
                    }
                },
                wake = self.playback.next_wake() => self.playback.handle_wake(wake),
                Some(frame) = self.capture.next_frame() => self.capture.push_frame(frame),
                _ = ticker.tick() => self.send_batch().await,
            }
        }

        self.machine.end_reason().cloned()
    }

    async fn start_call(&mut self) {
        if self.machine.state() != CallState::Idle {
            debug!("Start ignored, call is {}", self.machine.state());
            return;
        }
        let call_id = Uuid::new_v4();
        info!("Starting call {}", call_id);
        self.call_id = Some(call_id);
        self.started_at = None;
        let voice = self.voice.selected_voice();
        self.dispatch(Input::StartRequested { voice }).await;
    }

    /// Send accumulated microphone audio if the call can carry it
    async fn send_batch(&mut self) {
        let Some(batch) = self.capture.take_batch() else {
            return;
        };
        let connected = self.machine.state() == CallState::Active && !self.machine.is_reconnecting();
        let Some(transport) = self
            .transport
            .as_deref_mut()
            .filter(|t| connected && t.is_ready())
        else {
            debug!(
                "Dropping capture batch of {} frames from {} (not connected)",
                batch.frame_count, batch.first_sequence
            );
            return;
        };
        let message = ClientMessage::RealtimeAudio {
            mime_type: batch.mime_type,
            data: batch.data,
        };
        if let Err(e) = transport.send(&message).await {
            debug!("Dropping capture batch: {}", e);
        }
    }

    /// Feed one input to the machine and carry out the resulting effects,
    /// including any inputs those effects produce
    async fn dispatch(&mut self, input: Input) {
        let mut inputs = VecDeque::from([input]);
        while let Some(input) = inputs.pop_front() {
            for effect in self.machine.handle(input) {
                if let Some(next) = self.execute(effect).await {
                    inputs.push_back(next);
                }
            }
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<Input> {
        match effect {
            Effect::State(state) => {
                info!("Call state: {}", state);
                if state == CallState::Active && self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
                self.status.state_changed(state);
                None
            }
            Effect::Status(text) => {
                self.status.status(&text);
                None
            }
            Effect::Transcript { speaker, text } => {
                self.status.transcript(speaker, &text);
                None
            }
            Effect::AcquireCredential => {
                let source = Arc::clone(&self.credentials);
                let task =
                    tokio::spawn(async move { SetupOutcome::Credential(source.acquire().await) });
                self.pending = Some(PendingSetup { task, cancel: None });
                None
            }
            Effect::AcquireDevices => Some(self.acquire_devices().await),
            Effect::OpenTransport(credential) => self.open_transport(credential),
            Effect::Send(message) => {
                let Some(transport) = self.transport.as_deref_mut().filter(|t| t.is_ready()) else {
                    debug!("Not connected, dropping {}", message.kind());
                    return None;
                };
                if let Err(e) = transport.send(&message).await {
                    warn!("Failed to send {}: {}", message.kind(), e);
                }
                None
            }
            Effect::EnqueuePlayback(pcm) => {
                self.playback.enqueue(pcm);
                None
            }
            Effect::FlushPlayback => {
                self.playback.flush();
                None
            }
            Effect::ArmTimer { timer, after } => {
                self.timers.arm(timer, after);
                None
            }
            Effect::CancelTimer(timer) => {
                self.timers.cancel(&timer);
                None
            }
            Effect::Teardown => {
                self.teardown().await;
                Some(Input::CleanupComplete)
            }
        }
    }

    /// Start a connection attempt; the result arrives through `settle_setup`
    fn open_transport(&mut self, credential: Credential) -> Option<Input> {
        let Some(mut transport) = self.transport.take() else {
            return Some(Input::TransportFailed(CallError::Transport(
                "transport unavailable".to_string(),
            )));
        };
        self.transport_rx = None;

        let setup_timeout = self.setup_timeout;
        let (cancel, cancelled) = oneshot::channel();
        let task = tokio::spawn(async move {
            // Discard whatever is left of a previous connection
            transport.close().await;
            let (tx, events) = mpsc::unbounded_channel();
            let result = tokio::select! {
                opened = tokio::time::timeout(setup_timeout, transport.open(&credential, tx)) => {
                    Some(opened.unwrap_or_else(|_| {
                        Err(CallError::SetupFailed(
                            "timed out connecting to the service".to_string(),
                        ))
                    }))
                }
                _ = cancelled => None,
            };
            SetupOutcome::Connection {
                transport,
                events,
                result,
            }
        });
        self.pending = Some(PendingSetup {
            task,
            cancel: Some(cancel),
        });
        None
    }

    fn settle_setup(
        &mut self,
        outcome: Result<SetupOutcome, JoinError>,
        connecting: bool,
    ) -> Option<Input> {
        match outcome {
            Ok(SetupOutcome::Credential(Ok(credential))) => {
                Some(Input::CredentialAcquired(credential))
            }
            Ok(SetupOutcome::Credential(Err(e))) => Some(Input::CredentialFailed(e)),
            Ok(SetupOutcome::Connection {
                transport,
                events,
                result,
            }) => {
                let topology = transport.topology();
                self.transport = Some(transport);
                match result? {
                    Ok(()) => {
                        info!("Connected ({})", topology);
                        self.transport_rx = Some(events);
                        Some(Input::TransportOpened)
                    }
                    Err(e) => Some(Input::TransportFailed(e)),
                }
            }
            Err(e) => {
                error!("Setup task failed: {}", e);
                let e = CallError::SetupFailed(e.to_string());
                Some(if connecting {
                    Input::TransportFailed(e)
                } else {
                    Input::CredentialFailed(e)
                })
            }
        }
    }

    /// Abandon a credential request or connection attempt in flight
    async fn abandon_setup(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        match pending.cancel {
            Some(cancel) => {
                let _ = cancel.send(());
            }
            None => pending.task.abort(),
        }
        match pending.task.await {
            Ok(SetupOutcome::Connection { transport, .. }) => {
                debug!("Connection attempt abandoned");
                self.transport = Some(transport);
            }
            Ok(SetupOutcome::Credential(_)) => {}
            Err(e) if e.is_cancelled() => debug!("Credential request abandoned"),
            Err(e) => error!("Setup task failed: {}", e),
        }
    }

    async fn acquire_devices(&mut self) -> Input {
        if let Err(e) = self.capture.start().await {
            warn!("{}", e);
            return Input::DevicesFailed(e);
        }
        if let Err(e) = self.playback.start().await {
            warn!("Audio output unavailable: {}", e);
            self.capture.stop();
            let e = match e {
                CallError::Playback(_) => e,
                other => CallError::Playback(other.to_string()),
            };
            return Input::DevicesFailed(e);
        }
        Input::DevicesReady
    }

    /// Release everything the call holds. Safe to run in any state.
    async fn teardown(&mut self) {
        self.capture.stop();
        self.playback.close();
        self.abandon_setup().await;
        if let Some(transport) = self.transport.as_mut() {
            transport.close().await;
        }
        self.transport_rx = None;
        self.timers.cancel_all();

        if let (Some(call_id), Some(started)) = (self.call_id, self.started_at.take()) {
            let duration = Utc::now().signed_duration_since(started);
            info!(
                "Call {} lasted {}.{:03}s ({} playback chunks dropped)",
                call_id,
                duration.num_seconds(),
                duration.num_milliseconds().rem_euclid(1000),
                self.playback.dropped_chunks()
            );
        }
    }
}
