//! Call session
//!
//! The pure lifecycle machine, its timing policies, and the runner that
//! executes it against real devices and a real connection.

pub mod governor;
pub mod machine;
pub mod reconnect;
pub mod runner;
pub mod status;
pub mod timers;

pub use governor::CallTimeoutPolicy;
pub use machine::{CallMachine, CallState, EndReason};
pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use runner::{CallCommand, CallSession, SessionOptions, SessionParts};
pub use status::{ChannelStatus, ConsoleStatus, StatusEvent, StatusSink};
