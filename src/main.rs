use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use echo_link::{AppConfig, CpalDevice, EchoLink, LoggingAmplifier, MicMode};

/// echo-link - voice appliance audio daemon
#[derive(Parser)]
#[command(name = "echo-link", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "ECHO_LINK_CONFIG")]
    config: Option<PathBuf>,

    /// Voice server host
    #[arg(long, env = "ECHO_LINK_HOST")]
    host: Option<String>,

    /// Voice server port
    #[arg(long, env = "ECHO_LINK_PORT")]
    port: Option<u16>,

    /// Identifier announced to the server
    #[arg(long, env = "ECHO_LINK_CLIENT_ID")]
    client_id: Option<String>,

    /// Microphone policy: `always_on` or `on_button_press`
    #[arg(long, value_parser = parse_mic_mode)]
    mic_mode: Option<MicMode>,

    /// Record regardless of the connection and log the mic level
    #[arg(long)]
    mic_debug: bool,

    /// Input device name (default: system default)
    #[arg(long)]
    input: Option<String>,

    /// Output device name (default: system default)
    #[arg(long)]
    output: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List audio input devices
    ListDevices,
}

fn parse_mic_mode(value: &str) -> Result<MicMode, String> {
    match value {
        "always_on" => Ok(MicMode::AlwaysOn),
        "on_button_press" => Ok(MicMode::OnButtonPress),
        other => Err(format!(
            "unknown mic mode {other:?} (expected always_on or on_button_press)"
        )),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(Command::ListDevices) = cli.command {
        for name in CpalDevice::list_input_devices()? {
            println!("{name}");
        }
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(host) = cli.host {
        config.transport.host = host;
    }
    if let Some(port) = cli.port {
        config.transport.port = port;
    }
    if let Some(client_id) = cli.client_id {
        config.transport.client_id = client_id;
    }
    if let Some(mic_mode) = cli.mic_mode {
        config.mic_mode = mic_mode;
    }

    let mut device = CpalDevice::new(config.engine.sample_rate);
    if let Some(name) = cli.input {
        device = device.with_input(name);
    }
    if let Some(name) = cli.output {
        device = device.with_output(name);
    }

    tracing::info!(
        host = %config.transport.host,
        port = config.transport.port,
        client_id = %config.transport.client_id,
        mic_mode = ?config.mic_mode,
        "starting"
    );

    let session = EchoLink::builder()
        .device(Arc::new(device))
        .amplifier(Arc::new(LoggingAmplifier))
        .config(config)
        .mic_debug(cli.mic_debug)
        .on_event(|e| match e.indicator_state() {
            Some(indicator) => tracing::info!(event = ?e, ?indicator, "device event"),
            None => tracing::debug!(event = ?e, "device event"),
        })
        .start()
        .await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    session.stop().await;
    Ok(())
}
