//! Call lifecycle state machine
//!
//! [`CallMachine::handle`] is a pure transition function: it takes one
//! [`Input`] and returns the [`Effect`]s the runner must perform, in order.
//! Hardware, network and timers live outside; their outcomes come back in as
//! further inputs.
//!
//! ```text
//! Idle -> Connecting -> Active -> Ending -> Idle
//!             |                     ^
//!             +---------------------+   (any setup failure)
//! ```

use crate::error::CallError;
use crate::protocol::tools::{self, ToolAction};
use crate::protocol::{ClientMessage, ServerMessage, SetupConfig, Speaker};
use crate::session::governor::CallTimeoutPolicy;
use crate::session::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::transport::{CloseKind, Credential, TransportEvent};
use log::{debug, info, warn};
use std::time::Duration;

/// Lifecycle state of the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Connecting,
    Active,
    Ending,
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallState::Idle => write!(f, "idle"),
            CallState::Connecting => write!(f, "connecting"),
            CallState::Active => write!(f, "active"),
            CallState::Ending => write!(f, "ending"),
        }
    }
}

/// Timers owned by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionTimer {
    /// Deadline for the service to acknowledge `Setup`
    SetupAck,
    Warning,
    Hard,
    /// Lets the closing utterance play before the call ends
    EndCallGrace,
    ReconnectDelay,
}

/// Why a call ended
#[derive(Debug, Clone, PartialEq)]
pub enum EndReason {
    CallerHungUp,
    /// The assistant called `end_call`
    AssistantEnded(Option<String>),
    Timeout,
    /// Normal close from the service, or the proxy ended the session
    RemoteClosed(Option<String>),
    ReconnectFailed(String),
    /// Setup could not complete
    Failed(CallError),
}

impl EndReason {
    /// Status shown once the call is back to idle
    pub fn status_text(&self) -> String {
        match self {
            EndReason::CallerHungUp => "Call ended".to_string(),
            EndReason::AssistantEnded(_) => "Call ended by assistant".to_string(),
            EndReason::Timeout => "Call ended: time limit reached".to_string(),
            EndReason::RemoteClosed(Some(reason)) if !reason.is_empty() => {
                format!("Call ended by the service: {}", reason)
            }
            EndReason::RemoteClosed(_) => "Call ended by the service".to_string(),
            EndReason::ReconnectFailed(why) => format!("Connection lost: {}", why),
            EndReason::Failed(err) => err.to_string(),
        }
    }

    /// Whether the call never got going
    pub fn is_failure(&self) -> bool {
        matches!(self, EndReason::Failed(_))
    }
}

/// Something that happened
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    StartRequested { voice: String },
    EndRequested,
    CredentialAcquired(Credential),
    CredentialFailed(CallError),
    /// Microphone and output device acquired
    DevicesReady,
    DevicesFailed(CallError),
    TransportOpened,
    TransportFailed(CallError),
    Transport(TransportEvent),
    Timer(SessionTimer),
    /// The runner finished tearing down after `Effect::Teardown`
    CleanupComplete,
}

/// Something the runner must do
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    State(CallState),
    Status(String),
    Transcript { speaker: Speaker, text: String },
    AcquireCredential,
    AcquireDevices,
    OpenTransport(Credential),
    Send(ClientMessage),
    EnqueuePlayback(Vec<u8>),
    FlushPlayback,
    ArmTimer { timer: SessionTimer, after: Duration },
    CancelTimer(SessionTimer),
    /// Stop capture, playback, transport and all timers, in that order,
    /// then report `CleanupComplete`
    Teardown,
}

pub const LISTENING: &str = "Listening…";
pub const RECONNECTING: &str = "Reconnecting…";

/// Fixed parameters of the machine
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Sent on every connection; the voice is filled in at start
    pub setup: SetupConfig,
    pub timeout: CallTimeoutPolicy,
    pub setup_timeout: Duration,
    pub end_call_grace: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnects: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Credential,
    Devices,
    Transport,
    SetupAck,
}

/// Pure call lifecycle
#[derive(Debug)]
pub struct CallMachine {
    config: MachineConfig,
    state: CallState,
    /// Progress of the initial connect, or of a reconnect while active
    step: Option<Step>,
    credential: Option<Credential>,
    reconnect: ReconnectPolicy,
    warned: bool,
    /// The wrap-up turn came due while reconnecting
    wrap_up_held: bool,
    end_call_pending: Option<Option<String>>,
    end_reason: Option<EndReason>,
}

impl CallMachine {
    pub fn new(config: MachineConfig) -> Self {
        let reconnect = ReconnectPolicy::new(config.reconnect_delay, config.max_reconnects);
        Self {
            config,
            state: CallState::Idle,
            step: None,
            credential: None,
            reconnect,
            warned: false,
            wrap_up_held: false,
            end_call_pending: None,
            end_reason: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Reason the last call ended, once it is back to idle
    pub fn end_reason(&self) -> Option<&EndReason> {
        self.end_reason.as_ref()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.state == CallState::Active && self.step.is_some()
    }

    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        match self.state {
            CallState::Idle => self.on_idle(input),
            CallState::Connecting => self.on_connecting(input),
            CallState::Active => self.on_active(input),
            CallState::Ending => self.on_ending(input),
        }
    }

    fn on_idle(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::StartRequested { voice } => {
                self.config.setup.voice = voice;
                self.reconnect.reset();
                self.warned = false;
                self.wrap_up_held = false;
                self.end_call_pending = None;
                self.end_reason = None;
                self.credential = None;
                self.step = Some(Step::Credential);
                self.state = CallState::Connecting;
                vec![
                    Effect::State(CallState::Connecting),
                    Effect::Status("Connecting…".to_string()),
                    Effect::AcquireCredential,
                ]
            }
            other => {
                debug!("Ignoring {} while idle", input_name(&other));
                Vec::new()
            }
        }
    }

    fn on_connecting(&mut self, input: Input) -> Vec<Effect> {
        match (self.step, input) {
            (_, Input::StartRequested { .. }) => {
                debug!("Call already in progress");
                Vec::new()
            }
            (_, Input::EndRequested) => self.end(EndReason::CallerHungUp),

            (Some(Step::Credential), Input::CredentialAcquired(credential)) => {
                self.credential = Some(credential);
                self.step = Some(Step::Devices);
                vec![Effect::AcquireDevices]
            }
            (Some(Step::Credential), Input::CredentialFailed(err)) => {
                self.end(EndReason::Failed(setup_failed(err)))
            }

            (Some(Step::Devices), Input::DevicesReady) => {
                self.step = Some(Step::Transport);
                let credential = self.credential.take().unwrap_or_default();
                vec![Effect::OpenTransport(credential)]
            }
            (Some(Step::Devices), Input::DevicesFailed(err)) => {
                let err = match err {
                    CallError::PermissionDenied(_) | CallError::Playback(_) => err,
                    other => CallError::PermissionDenied(other.to_string()),
                };
                self.end(EndReason::Failed(err))
            }

            (Some(Step::Transport), Input::TransportOpened) => {
                self.step = Some(Step::SetupAck);
                self.send_setup()
            }
            (Some(Step::Transport), Input::TransportFailed(err)) => {
                self.end(EndReason::Failed(setup_failed(err)))
            }

            (Some(Step::SetupAck), Input::Transport(TransportEvent::Message(ServerMessage::SetupComplete))) => {
                self.enter_active()
            }
            (Some(Step::SetupAck), Input::Timer(SessionTimer::SetupAck)) => self.end(
                EndReason::Failed(CallError::SetupFailed(
                    "service did not acknowledge setup".to_string(),
                )),
            ),

            (_, Input::Transport(TransportEvent::Closed { code, reason })) => {
                self.end(EndReason::Failed(CallError::SetupFailed(format!(
                    "connection closed during setup ({}{})",
                    code.map(|c| c.to_string()).unwrap_or_else(|| "no code".to_string()),
                    if reason.is_empty() { String::new() } else { format!(": {}", reason) }
                ))))
            }
            (_, Input::Transport(TransportEvent::Message(ServerMessage::Error { message, .. }))) => {
                self.end(EndReason::Failed(CallError::SetupFailed(message)))
            }
            (_, Input::Transport(TransportEvent::Message(message))) => {
                debug!("Ignoring {} during setup", message.kind());
                Vec::new()
            }
            (step, other) => {
                debug!(
                    "Ignoring {} while connecting ({:?})",
                    input_name(&other),
                    step
                );
                Vec::new()
            }
        }
    }

    fn on_active(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::StartRequested { .. } => {
                debug!("Call already in progress");
                Vec::new()
            }
            Input::EndRequested => self.end(EndReason::CallerHungUp),
            Input::Transport(TransportEvent::Message(message)) => self.on_message(message),
            Input::Transport(TransportEvent::Malformed(why)) => {
                warn!("Malformed frame ignored: {}", why);
                Vec::new()
            }
            Input::Transport(TransportEvent::Closed { code, reason }) => {
                self.on_closed(code, reason)
            }

            Input::Timer(SessionTimer::Warning) => {
                if self.warned {
                    return Vec::new();
                }
                self.warned = true;
                info!("Call time limit approaching");
                let mut effects = vec![Effect::Status(self.config.timeout.warning_status())];
                if self.step.is_some() {
                    debug!("Holding wrap-up turn until reconnected");
                    self.wrap_up_held = true;
                } else {
                    effects.push(self.wrap_up_turn());
                }
                effects
            }
            Input::Timer(SessionTimer::Hard) => self.end(EndReason::Timeout),
            Input::Timer(SessionTimer::EndCallGrace) => {
                let reason = self.end_call_pending.take().flatten();
                self.end(EndReason::AssistantEnded(reason))
            }

            // Reconnect sequence
            Input::Timer(SessionTimer::ReconnectDelay) if self.step == Some(Step::Credential) => {
                vec![Effect::AcquireCredential]
            }
            Input::CredentialAcquired(credential) if self.step == Some(Step::Credential) => {
                self.step = Some(Step::Transport);
                vec![Effect::OpenTransport(credential)]
            }
            Input::CredentialFailed(err) if self.step == Some(Step::Credential) => {
                self.end(EndReason::ReconnectFailed(err.to_string()))
            }
            Input::TransportOpened if self.step == Some(Step::Transport) => {
                self.step = Some(Step::SetupAck);
                self.send_setup()
            }
            Input::TransportFailed(err) if self.step == Some(Step::Transport) => {
                self.end(EndReason::ReconnectFailed(err.to_string()))
            }
            Input::Timer(SessionTimer::SetupAck) if self.step == Some(Step::SetupAck) => self.end(
                EndReason::ReconnectFailed("service did not acknowledge setup".to_string()),
            ),

            other => {
                debug!("Ignoring {} while active", input_name(&other));
                Vec::new()
            }
        }
    }

    fn on_ending(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::CleanupComplete => {
                self.state = CallState::Idle;
                self.step = None;
                let reason = self
                    .end_reason
                    .get_or_insert(EndReason::CallerHungUp)
                    .clone();
                info!("Call ended: {}", reason.status_text());
                vec![
                    Effect::State(CallState::Idle),
                    Effect::Status(reason.status_text()),
                ]
            }
            other => {
                debug!("Ignoring {} while ending", input_name(&other));
                Vec::new()
            }
        }
    }

    fn on_message(&mut self, message: ServerMessage) -> Vec<Effect> {
        match message {
            ServerMessage::AudioOutput(pcm) => vec![Effect::EnqueuePlayback(pcm)],
            ServerMessage::Interrupted => vec![
                Effect::FlushPlayback,
                Effect::Status(LISTENING.to_string()),
            ],
            ServerMessage::TurnComplete => vec![Effect::Status(LISTENING.to_string())],
            ServerMessage::ModelText(text) => vec![Effect::Transcript {
                speaker: Speaker::Assistant,
                text,
            }],
            ServerMessage::Transcript { speaker, text } => {
                vec![Effect::Transcript { speaker, text }]
            }
            ServerMessage::ToolCall(calls) => self.on_tool_calls(calls),
            ServerMessage::ToolCallCancellation(ids) => {
                info!("Service cancelled tool calls {:?}", ids);
                Vec::new()
            }
            ServerMessage::GoAway { time_left } => {
                warn!(
                    "Service will disconnect soon (time left: {})",
                    time_left.as_deref().unwrap_or("unknown")
                );
                Vec::new()
            }
            ServerMessage::Error { code, message } => {
                warn!("Service error {:?}: {}", code, message);
                vec![Effect::Status(format!("Service error: {}", message))]
            }
            ServerMessage::SetupComplete => {
                if self.step == Some(Step::SetupAck) {
                    info!("Reconnected");
                    self.step = None;
                    self.reconnect.on_reconnected();
                    let mut effects = vec![
                        Effect::CancelTimer(SessionTimer::SetupAck),
                        Effect::Status(LISTENING.to_string()),
                    ];
                    if std::mem::take(&mut self.wrap_up_held) {
                        effects.push(self.wrap_up_turn());
                    }
                    effects
                } else {
                    debug!("Duplicate setup acknowledgement");
                    Vec::new()
                }
            }
            ServerMessage::SessionEnded { reason } => self.end(EndReason::RemoteClosed(reason)),
            ServerMessage::ProxyConnected | ServerMessage::SessionStarted => {
                debug!("Proxy lifecycle: {}", message.kind());
                Vec::new()
            }
        }
    }

    fn on_tool_calls(&mut self, calls: Vec<crate::protocol::FunctionCall>) -> Vec<Effect> {
        let mut effects = Vec::new();
        let mut responses = Vec::new();

        for call in calls {
            match tools::dispatch(&call) {
                ToolAction::EndCall { reason } => {
                    if self.end_call_pending.is_some() {
                        debug!("Duplicate end_call ignored");
                        continue;
                    }
                    info!(
                        "Assistant ended the call ({}); end_call is not acknowledged",
                        reason.as_deref().unwrap_or("no reason")
                    );
                    effects.push(Effect::Status("Ending call…".to_string()));
                    effects.push(Effect::Send(ClientMessage::ClientTurn {
                        text: tools::closing_turn(reason.as_deref()),
                    }));
                    effects.push(Effect::ArmTimer {
                        timer: SessionTimer::EndCallGrace,
                        after: self.config.end_call_grace,
                    });
                    self.end_call_pending = Some(reason);
                }
                ToolAction::Unknown { name } => {
                    warn!("{}", CallError::ToolDispatchUnknown(name));
                    responses.push(tools::unknown_tool_response(&call));
                }
            }
        }

        if !responses.is_empty() {
            effects.insert(0, Effect::Send(ClientMessage::ToolResponse(responses)));
        }
        effects
    }

    fn on_closed(&mut self, code: Option<u16>, reason: String) -> Vec<Effect> {
        if self.end_call_pending.is_some() {
            let reason = self.end_call_pending.take().flatten();
            return self.end(EndReason::AssistantEnded(reason));
        }

        match CloseKind::from_code(code) {
            CloseKind::Normal => {
                let reason = (!reason.is_empty()).then_some(reason);
                self.end(EndReason::RemoteClosed(reason))
            }
            CloseKind::Abnormal => match self.reconnect.on_abnormal_close() {
                ReconnectDecision::Retry { attempt, delay } => {
                    warn!(
                        "Connection closed abnormally ({:?} {}), reconnect attempt {} in {:?}",
                        code, reason, attempt, delay
                    );
                    self.step = Some(Step::Credential);
                    vec![
                        Effect::Status(RECONNECTING.to_string()),
                        Effect::CancelTimer(SessionTimer::SetupAck),
                        Effect::ArmTimer {
                            timer: SessionTimer::ReconnectDelay,
                            after: delay,
                        },
                    ]
                }
                ReconnectDecision::GiveUp => {
                    warn!("Not reconnecting after abnormal close ({:?})", code);
                    let why = if reason.is_empty() {
                        "connection closed".to_string()
                    } else {
                        reason
                    };
                    self.end(EndReason::ReconnectFailed(why))
                }
            },
        }
    }

    fn wrap_up_turn(&self) -> Effect {
        Effect::Send(ClientMessage::ClientTurn {
            text: self.config.timeout.wrap_up_turn(),
        })
    }

    fn send_setup(&self) -> Vec<Effect> {
        vec![
            Effect::Send(ClientMessage::Setup(self.config.setup.clone())),
            Effect::ArmTimer {
                timer: SessionTimer::SetupAck,
                after: self.config.setup_timeout,
            },
        ]
    }

    fn enter_active(&mut self) -> Vec<Effect> {
        self.step = None;
        self.state = CallState::Active;

        let mut effects = vec![
            Effect::CancelTimer(SessionTimer::SetupAck),
            Effect::State(CallState::Active),
            Effect::Status(LISTENING.to_string()),
        ];
        let deadlines = self.config.timeout.deadlines(Duration::ZERO);
        if let Some(warning_in) = deadlines.warning_in {
            effects.push(Effect::ArmTimer {
                timer: SessionTimer::Warning,
                after: warning_in,
            });
        }
        effects.push(Effect::ArmTimer {
            timer: SessionTimer::Hard,
            after: deadlines.hard_in,
        });
        effects
    }

    /// Move to `Ending` and ask for teardown
    fn end(&mut self, reason: EndReason) -> Vec<Effect> {
        info!("Ending call: {:?}", reason);
        self.state = CallState::Ending;
        self.step = None;
        self.credential = None;
        self.end_call_pending = None;
        self.wrap_up_held = false;
        self.end_reason = Some(reason);
        vec![
            Effect::State(CallState::Ending),
            Effect::CancelTimer(SessionTimer::Warning),
            Effect::CancelTimer(SessionTimer::Hard),
            Effect::Teardown,
        ]
    }
}

fn setup_failed(err: CallError) -> CallError {
    match err {
        CallError::SetupFailed(_) => err,
        other => CallError::SetupFailed(other.to_string()),
    }
}

fn input_name(input: &Input) -> &'static str {
    match input {
        Input::StartRequested { .. } => "start request",
        Input::EndRequested => "end request",
        Input::CredentialAcquired(_) => "credential",
        Input::CredentialFailed(_) => "credential failure",
        Input::DevicesReady => "devices ready",
        Input::DevicesFailed(_) => "device failure",
        Input::TransportOpened => "transport open",
        Input::TransportFailed(_) => "transport failure",
        Input::Transport(TransportEvent::Message(m)) => m.kind(),
        Input::Transport(TransportEvent::Malformed(_)) => "malformed frame",
        Input::Transport(TransportEvent::Closed { .. }) => "transport close",
        Input::Timer(_) => "timer",
        Input::CleanupComplete => "cleanup complete",
    }
}
