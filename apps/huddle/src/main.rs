use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

use huddle_core::config::Config;
use huddle_core::signaling::{
    ChannelEvent, SignalingChannel, StaticCredentials, WebSocketConnector,
};
use huddle_core::telemetry::logging::{self, LogConfig, LogLevel};

/// Exit status asking the supervisor to restart the process.
const EXIT_RELOAD: u8 = 75;

#[derive(Parser, Debug)]
#[command(name = "huddle", version, about = "Huddle signaling tools")]
struct Cli {
    #[arg(long, value_enum, env = "HUDDLE_LOG_LEVEL", default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    #[arg(long, env = "HUDDLE_LOG_FILE", help = "Write logs to a file instead of stderr")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the rendezvous service and print everything addressed to us.
    Probe(ProbeArgs),
}

#[derive(Args, Debug)]
struct ProbeArgs {
    #[arg(long, env = "HUDDLE_IDENTITY")]
    identity: String,

    #[arg(long, env = "HUDDLE_TOKEN", hide_env_values = true)]
    token: String,

    /// Overrides HUDDLE_SIGNALING_URL.
    #[arg(long)]
    signaling_url: Option<String>,

    /// Ask this participant for an offer (repeatable).
    #[arg(long = "peer")]
    peers: Vec<String>,

    #[arg(long)]
    assert_control: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("initializing logging")?;

    let config = Config::from_env().context("reading HUDDLE_* environment")?;

    match cli.command {
        Command::Probe(args) => probe(config, args).await,
    }
}

async fn probe(config: Config, args: ProbeArgs) -> Result<ExitCode> {
    let endpoint = args.signaling_url.unwrap_or(config.signaling_url.clone());
    let connector = WebSocketConnector::new(&endpoint)
        .with_context(|| format!("invalid signaling endpoint {endpoint}"))?;
    tracing::info!(target: "huddle::probe", url = %connector.url(), identity = %args.identity, "starting probe");

    let channel = SignalingChannel::spawn(
        args.identity,
        Arc::new(connector),
        Arc::new(StaticCredentials::new(args.token)),
        config.channel_timings(),
    );
    let mut events = channel.subscribe();

    for peer in &args.peers {
        channel.request_offer(peer)?;
    }
    if args.assert_control {
        channel.assert_control()?;
    }

    let status = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ChannelEvent::Message(message)) => {
                    tracing::info!(
                        target: "huddle::probe",
                        from = %message.from,
                        kind = ?message.event,
                        data = %message.data,
                        "message"
                    );
                }
                Ok(ChannelEvent::StateChanged(state)) => {
                    tracing::info!(target: "huddle::probe", state = ?state, "connection state");
                }
                Ok(ChannelEvent::Reload) => {
                    tracing::warn!(target: "huddle::probe", "service requested reload; exiting");
                    break ExitCode::from(EXIT_RELOAD);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "huddle::probe", skipped, "event consumer lagged");
                }
                Err(RecvError::Closed) => break ExitCode::FAILURE,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("waiting for ctrl-c")?;
                tracing::info!(target: "huddle::probe", "interrupted; shutting down");
                break ExitCode::SUCCESS;
            }
        }
    };

    channel.destroy();
    Ok(status)
}
