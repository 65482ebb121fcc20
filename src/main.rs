use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mediasoup_handler::{Handler, HandlerConfig, WebRtcPeerConnection};

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// mediasoup-handler command line arguments
#[derive(Parser, Debug)]
#[command(name = "mediasoup-handler")]
#[command(version, about = "Print the native RTP capabilities of the WebRTC engine", long_about = None)]
struct CliArgs {
    /// Handler configuration file (JSON)
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print compact JSON instead of pretty JSON
    #[arg(long)]
    compact: bool,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting mediasoup-handler v{}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config {
        Some(path) => HandlerConfig::load(path).await?,
        None => HandlerConfig::default(),
    };

    let capabilities =
        Handler::<WebRtcPeerConnection>::native_rtp_capabilities(&config).await?;
    tracing::info!(
        "{} engine: {} codecs, {} header extensions",
        Handler::<WebRtcPeerConnection>::name(),
        capabilities.codecs.len(),
        capabilities.header_extensions.len()
    );

    let output = if args.compact {
        serde_json::to_string(&capabilities)?
    } else {
        serde_json::to_string_pretty(&capabilities)?
    };
    println!("{}", output);

    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "mediasoup_handler=error,webrtc=error",
        LogLevel::Warn => "mediasoup_handler=warn,webrtc=warn",
        LogLevel::Info => "mediasoup_handler=info,webrtc=warn",
        LogLevel::Verbose => "mediasoup_handler=debug,webrtc=warn",
        LogLevel::Debug => "mediasoup_handler=debug,webrtc=info",
        LogLevel::Trace => "mediasoup_handler=trace,webrtc=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    // Logs go to stderr, stdout carries the JSON document
    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
