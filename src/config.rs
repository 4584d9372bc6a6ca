//! Call configuration
//!
//! Loaded from `<config_dir>/voxline/config.json` when present. Every field
//! is optional in the file; missing fields take their defaults.

use crate::audio::PlaybackConfig;
use crate::error::{CallError, CallResult};
use crate::protocol::{tools, ActivityDetection, SetupConfig};
use crate::session::governor::CallTimeoutPolicy;
use crate::session::machine::MachineConfig;
use crate::session::runner::SessionOptions;
use crate::transport::Topology;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "voxline";
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_SERVICE_URL: &str = "wss://generativelanguage.googleapis.com/ws/\
     google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_PROXY_URL: &str = "ws://127.0.0.1:8787/call";
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub topology: Topology,
    /// Endpoint for the direct topology
    pub service_url: String,
    /// Endpoint for the proxied topology
    pub proxy_url: String,
    pub model: String,
    pub system_instruction: Option<String>,
    /// Ask the service for transcripts of both sides
    pub transcribe: bool,

    pub max_duration_ms: u64,
    pub warning_lead_ms: u64,
    pub reconnect_delay_ms: u64,
    /// Reconnections allowed per call
    pub max_reconnects: u32,
    pub end_call_grace_ms: u64,
    pub setup_timeout_ms: u64,

    pub batch_interval_ms: u64,
    pub playback_queue_limit: usize,
    pub prebuffer_chunks: usize,
    pub prebuffer_timeout_ms: u64,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,

    pub activity_detection: ActivityDetection,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            topology: Topology::Direct,
            service_url: DEFAULT_SERVICE_URL.to_string(),
            proxy_url: DEFAULT_PROXY_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            system_instruction: None,
            transcribe: true,
            max_duration_ms: 300_000,
            warning_lead_ms: 30_000,
            reconnect_delay_ms: 1_500,
            max_reconnects: 3,
            end_call_grace_ms: 3_000,
            setup_timeout_ms: 15_000,
            batch_interval_ms: 100,
            playback_queue_limit: 60,
            prebuffer_chunks: 1,
            prebuffer_timeout_ms: 150,
            capture_sample_rate: 16_000,
            playback_sample_rate: 24_000,
            activity_detection: ActivityDetection::default(),
        }
    }
}

/// Default location of the config file
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

impl CallConfig {
    /// Load from `path`, or from the default location when `path` is `None`.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// file that was asked for explicitly is an error.
    pub fn load(path: Option<&Path>) -> CallResult<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_path() {
                Some(p) => (p, false),
                None => {
                    debug!("No config directory, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !path.exists() {
            if explicit {
                return Err(CallError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config: CallConfig = serde_json::from_str(&text).map_err(|e| {
            CallError::Config(format!("invalid config {}: {}", path.display(), e))
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> CallResult<()> {
        if self.max_duration_ms == 0 {
            return Err(CallError::Config("max_duration_ms must be positive".to_string()));
        }
        if self.warning_lead_ms >= self.max_duration_ms {
            return Err(CallError::Config(format!(
                "warning_lead_ms ({}) must be less than max_duration_ms ({})",
                self.warning_lead_ms, self.max_duration_ms
            )));
        }
        if self.batch_interval_ms == 0 {
            return Err(CallError::Config("batch_interval_ms must be positive".to_string()));
        }
        if self.playback_queue_limit == 0 {
            return Err(CallError::Config(
                "playback_queue_limit must be positive".to_string(),
            ));
        }
        if self.capture_sample_rate == 0 || self.playback_sample_rate == 0 {
            return Err(CallError::Config("sample rates must be positive".to_string()));
        }
        Ok(())
    }

    pub fn timeout_policy(&self) -> CallTimeoutPolicy {
        CallTimeoutPolicy::new(
            Duration::from_millis(self.max_duration_ms),
            Duration::from_millis(self.warning_lead_ms),
        )
    }

    /// URL the transport connects to for the configured topology
    pub fn endpoint(&self) -> &str {
        match self.topology {
            Topology::Direct => &self.service_url,
            Topology::Proxied => &self.proxy_url,
        }
    }

    /// `Setup` payload; the voice is filled in when a call starts
    pub fn setup(&self) -> SetupConfig {
        SetupConfig {
            model: self.model.clone(),
            voice: String::new(),
            system_instruction: self.system_instruction.clone(),
            tools: tools::declarations(),
            activity_detection: self.activity_detection.clone(),
            transcribe: self.transcribe,
        }
    }

    pub fn machine(&self) -> MachineConfig {
        MachineConfig {
            setup: self.setup(),
            timeout: self.timeout_policy(),
            setup_timeout: Duration::from_millis(self.setup_timeout_ms),
            end_call_grace: Duration::from_millis(self.end_call_grace_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_reconnects: self.max_reconnects,
        }
    }

    pub fn playback(&self) -> PlaybackConfig {
        PlaybackConfig {
            queue_limit: self.playback_queue_limit,
            input_sample_rate: self.playback_sample_rate,
            prebuffer_chunks: self.prebuffer_chunks,
            prebuffer_timeout: Duration::from_millis(self.prebuffer_timeout_ms),
            ..PlaybackConfig::default()
        }
    }

    pub fn session(&self) -> SessionOptions {
        SessionOptions {
            machine: self.machine(),
            playback: self.playback(),
            capture_sample_rate: self.capture_sample_rate,
            batch_interval: Duration::from_millis(self.batch_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = std::env::temp_dir().join(format!("voxline-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(
            &path,
            r#"{"topology": "proxied", "max_duration_ms": 60000, "warning_lead_ms": 5000}"#,
        )
        .unwrap();

        let config = CallConfig::load(Some(&path)).unwrap();
        assert_eq!(config.topology, Topology::Proxied);
        assert_eq!(config.max_duration_ms, 60_000);
        assert_eq!(config.batch_interval_ms, 100);
        assert_eq!(config.endpoint(), DEFAULT_PROXY_URL);
        assert!(config.validate().is_ok());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let path = std::env::temp_dir().join("voxline-definitely-missing.json");
        assert!(matches!(
            CallConfig::load(Some(&path)),
            Err(CallError::Config(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let late_warning = CallConfig {
            warning_lead_ms: 300_000,
            ..CallConfig::default()
        };
        assert!(late_warning.validate().is_err());

        let no_batching = CallConfig {
            batch_interval_ms: 0,
            ..CallConfig::default()
        };
        assert!(no_batching.validate().is_err());

        let no_queue = CallConfig {
            playback_queue_limit: 0,
            ..CallConfig::default()
        };
        assert!(no_queue.validate().is_err());

        assert!(CallConfig::default().validate().is_ok());
    }

    #[test]
    fn test_derived_settings() {
        let config = CallConfig::default();
        let machine = config.machine();
        assert_eq!(machine.timeout.max_duration, Duration::from_secs(300));
        assert_eq!(machine.reconnect_delay, Duration::from_millis(1500));
        assert_eq!(machine.setup.tools[0].name, tools::END_CALL);
        assert_eq!(config.playback().queue_limit, 60);
    }
}
