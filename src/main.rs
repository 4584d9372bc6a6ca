//! Voxline - a duplex voice-call client for Linux
//!
//! This is the main entry point: it places one call and exits when the call
//! is over.

mod cli;
mod tokio_runtime;

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::mpsc;
use voxline::audio::{AudioSink, Microphone, PipeWireMicrophone, PipeWireSink, WavMicrophone};
use voxline::session::{CallCommand, CallSession, ConsoleStatus, EndReason, SessionParts};
use voxline::settings::{self, DconfVoice, FixedVoice, VoicePreference};
use voxline::transport::{
    Anonymous, CredentialSource, EnvToken, StaticToken, Topology, TokenEndpoint,
    WebSocketTransport,
};
use voxline::CallConfig;

fn main() -> ExitCode {
    // Parse command-line arguments and initialize logging
    let args = cli::Args::parse();
    cli::init_logging(&args);

    if let Some(voice) = &args.set_voice {
        settings::set_selected_voice(voice);
        println!("Voice set to {}", voice);
        return ExitCode::SUCCESS;
    }

    match run(args) {
        Ok(Some(reason)) if reason.is_failure() => {
            eprintln!("{}", reason.status_text());
            ExitCode::FAILURE
        }
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &cli::Args) -> anyhow::Result<CallConfig> {
    let mut config =
        CallConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    if let Some(topology) = args.topology {
        config.topology = topology;
    }
    if let Some(url) = &args.url {
        match config.topology {
            Topology::Direct => config.service_url = url.clone(),
            Topology::Proxied => config.proxy_url = url.clone(),
        }
    }
    if let Some(secs) = args.max_duration {
        config.max_duration_ms = secs.saturating_mul(1000);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn credential_source(
    args: &cli::Args,
    topology: Topology,
) -> anyhow::Result<Box<dyn CredentialSource>> {
    if let Some(token) = &args.token {
        return Ok(Box::new(StaticToken(token.clone())));
    }
    if let Some(var) = &args.token_env {
        return Ok(Box::new(EnvToken { var: var.clone() }));
    }
    if let Some(url) = &args.token_endpoint {
        let endpoint = TokenEndpoint::new(url.clone()).context("Invalid token endpoint")?;
        return Ok(Box::new(endpoint));
    }
    if topology == Topology::Direct {
        warn!("No access token given; the service will likely refuse the connection");
    }
    Ok(Box::new(Anonymous))
}

fn run(args: cli::Args) -> anyhow::Result<Option<EndReason>> {
    let config = load_config(&args)?;
    let credentials = credential_source(&args, config.topology)?;

    let microphone: Box<dyn Microphone> = match &args.input_wav {
        Some(path) => {
            info!("Using {} as the microphone", path.display());
            Box::new(WavMicrophone::new(path, config.capture_sample_rate))
        }
        None => Box::new(PipeWireMicrophone::new(config.capture_sample_rate)),
    };
    let sink: Box<dyn AudioSink> = Box::new(PipeWireSink::new(config.playback_sample_rate));
    let voice: Box<dyn VoicePreference> = match &args.voice {
        Some(voice) => Box::new(FixedVoice(voice.clone())),
        None => Box::new(DconfVoice),
    };
    let transport = WebSocketTransport::new(config.topology, config.endpoint())
        .with_handshake_timeout(Duration::from_millis(config.setup_timeout_ms));

    let mut session = CallSession::new(
        config.session(),
        SessionParts {
            microphone,
            sink,
            transport: Box::new(transport),
            credentials,
            status: Box::new(ConsoleStatus::default()),
            voice,
        },
    );

    info!("Starting Voxline ({} topology)", config.topology);

    let runtime = tokio_runtime::build().context("Failed to create Tokio runtime")?;
    let reason = runtime.block_on(async move {
        let (commands, rx) = mpsc::unbounded_channel();

        // Hang up on Ctrl-C
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, hanging up");
                let _ = commands.send(CallCommand::End);
            }
        });

        session.run_call(rx).await
    });

    Ok(reason)
}
