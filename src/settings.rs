//! User preferences persisted in dconf
//!
//! Settings are stored under `/com/voxline/call/`

use log::{debug, error};

const DCONF_PATH: &str = "/com/voxline/call/";

/// Voice used when nothing has been selected yet
pub const DEFAULT_VOICE: &str = "Puck";

/// Keys for dconf settings
mod keys {
    pub const SELECTED_VOICE: &str = "selected-voice";
}

/// Get the selected voice name from dconf
pub fn get_selected_voice() -> Option<String> {
    let key = format!("{}{}", DCONF_PATH, keys::SELECTED_VOICE);
    dconf_rs::get_string(&key)
        .ok()
        .filter(|voice| !voice.trim().is_empty())
}

/// Set the selected voice name in dconf
pub fn set_selected_voice(voice: &str) {
    let key = format!("{}{}", DCONF_PATH, keys::SELECTED_VOICE);
    if let Err(e) = dconf_rs::set_string(&key, voice) {
        error!("Failed to save selected voice to dconf: {}", e);
    }
}

/// Source of the voice for the next call. Read once per call start.
pub trait VoicePreference: Send {
    fn selected_voice(&self) -> String;
}

/// The voice stored in dconf, falling back to [`DEFAULT_VOICE`]
pub struct DconfVoice;

impl VoicePreference for DconfVoice {
    fn selected_voice(&self) -> String {
        get_selected_voice().unwrap_or_else(|| {
            debug!("No voice selected, using {}", DEFAULT_VOICE);
            DEFAULT_VOICE.to_string()
        })
    }
}

/// A voice chosen on the command line
pub struct FixedVoice(pub String);

impl VoicePreference for FixedVoice {
    fn selected_voice(&self) -> String {
        self.0.clone()
    }
}
