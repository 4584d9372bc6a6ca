//! Command-line interface for Voxline
//!
//! Handles argument parsing and logging configuration.

use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;
use voxline::transport::Topology;

/// Voxline - talk to a realtime AI voice assistant from the terminal
#[derive(Parser, Debug)]
#[command(name = "voxline")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = also network and audio deps
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Config file (defaults to <config dir>/voxline/config.json)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Connect directly to the service or through a proxy
    #[arg(long, value_name = "direct|proxied")]
    pub topology: Option<Topology>,

    /// Override the endpoint URL for the selected topology
    #[arg(long)]
    pub url: Option<String>,

    /// Access token for the service
    #[arg(long, env = "VOXLINE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Read the access token from this environment variable before each
    /// connection
    #[arg(long, value_name = "VAR", conflicts_with_all = ["token", "token_endpoint"])]
    pub token_env: Option<String>,

    /// Fetch a short-lived token from this URL before each connection
    #[arg(long, value_name = "URL", conflicts_with = "token")]
    pub token_endpoint: Option<String>,

    /// Use a WAV file instead of the microphone
    #[arg(long, value_name = "FILE")]
    pub input_wav: Option<PathBuf>,

    /// Voice for this call, without changing the saved preference
    #[arg(long)]
    pub voice: Option<String>,

    /// Save the preferred voice and exit
    #[arg(long, value_name = "NAME")]
    pub set_voice: Option<String>,

    /// Maximum call length in seconds
    #[arg(long, value_name = "SECONDS")]
    pub max_duration: Option<u64>,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    // Set voxline modules to requested verbosity level
    builder.filter_module("voxline", args.log_level());

    // Network and audio stacks only at -vvvv
    if args.verbose >= 4 {
        builder.filter_module("tungstenite", args.log_level());
        builder.filter_module("tokio_tungstenite", args.log_level());
        builder.filter_module("reqwest", args.log_level());
        builder.filter_module("pipewire", args.log_level());
    }

    builder.format_timestamp_millis().init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_levels() {
        let args = Args::parse_from(["voxline", "-vv"]);
        assert_eq!(args.log_level(), LevelFilter::Debug);

        let args = Args::parse_from(["voxline", "-q", "-v"]);
        assert_eq!(args.log_level(), LevelFilter::Error);
    }

    #[test]
    fn test_topology_flag() {
        let args = Args::parse_from(["voxline", "--topology", "proxy"]);
        assert_eq!(args.topology, Some(Topology::Proxied));
    }

    #[test]
    fn test_token_env_flag() {
        let args = Args::parse_from(["voxline", "--token-env", "CALL_TOKEN"]);
        assert_eq!(args.token_env.as_deref(), Some("CALL_TOKEN"));
        assert!(Args::try_parse_from([
            "voxline",
            "--token-env",
            "CALL_TOKEN",
            "--token-endpoint",
            "http://localhost/token"
        ])
        .is_err());
    }

    #[test]
    fn test_token_and_endpoint_conflict() {
        assert!(Args::try_parse_from([
            "voxline",
            "--token",
            "abc",
            "--token-endpoint",
            "http://localhost/token"
        ])
        .is_err());
    }
}
