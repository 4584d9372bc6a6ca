//! Voxline - duplex voice calls with a realtime AI speech service
//!
//! Microphone audio is captured, batched and streamed to the service while
//! its synthesized speech is played back gaplessly. The caller can interrupt
//! the assistant at any time, and the assistant can end the call itself.

pub mod audio;
pub mod config;
pub mod error;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::CallConfig;
pub use error::{CallError, CallResult};
pub use session::{CallCommand, CallSession, CallState, EndReason};
