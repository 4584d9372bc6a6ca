//! Caller-visible status
//!
//! The session only ever writes to a [`StatusSink`]; it never reads UI state.

use crate::protocol::Speaker;
use crate::session::machine::CallState;
use tokio::sync::mpsc;

/// One-way notifications for whatever is showing the call to the caller
pub trait StatusSink: Send {
    fn state_changed(&mut self, state: CallState);

    /// Free-text status such as "Listening…"
    fn status(&mut self, text: &str);

    fn transcript(&mut self, speaker: Speaker, text: &str);
}

/// Prints status and transcripts to the terminal
#[derive(Debug, Default)]
pub struct ConsoleStatus {
    last_status: Option<String>,
}

impl StatusSink for ConsoleStatus {
    fn state_changed(&mut self, state: CallState) {
        println!("[{}]", state);
    }

    fn status(&mut self, text: &str) {
        // Turn completions repeat "Listening…" constantly
        if self.last_status.as_deref() == Some(text) {
            return;
        }
        self.last_status = Some(text.to_string());
        println!("  {}", text);
    }

    fn transcript(&mut self, speaker: Speaker, text: &str) {
        println!("  {:>9}: {}", speaker, text.trim());
    }
}

/// A status notification as a value
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    State(CallState),
    Status(String),
    Transcript { speaker: Speaker, text: String },
}

/// Forwards notifications over a channel, for embedding the session
#[derive(Debug, Clone)]
pub struct ChannelStatus {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelStatus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelStatus {
    fn state_changed(&mut self, state: CallState) {
        let _ = self.tx.send(StatusEvent::State(state));
    }

    fn status(&mut self, text: &str) {
        let _ = self.tx.send(StatusEvent::Status(text.to_string()));
    }

    fn transcript(&mut self, speaker: Speaker, text: &str) {
        let _ = self.tx.send(StatusEvent::Transcript {
            speaker,
            text: text.to_string(),
        });
    }
}
