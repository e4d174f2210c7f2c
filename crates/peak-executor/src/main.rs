//! peak-executor: single-position PEAK signal execution engine.
//!
//! Usage:
//!   peak-executor [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>     Config file path (default: config/executor.toml)
//!   -s, --symbol <SYMBOL>   Instrument id (overrides config)
//!   --validate-only         Connectivity/auth check, then exit

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use peak_executor::config::Config;
use peak_executor::engine::Engine;
use peak_executor::exchange::{BinanceClient, ExchangeApi};

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "peak-executor")]
#[command(about = "Single-position PEAK signal execution engine")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/executor.toml")]
    config: PathBuf,

    /// Instrument id (overrides config file)
    #[arg(short, long)]
    symbol: Option<String>,

    /// One-shot connectivity/auth check, then exit
    #[arg(long)]
    validate_only: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // Load .env if present (credentials live there in development).
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io) if io.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: failed to load .env file: {e}");
        }
    }

    let args = Args::parse();

    let mut config = if args.config.exists() {
        Config::from_file(&args.config)
            .with_context(|| format!("failed to load config from {:?}", args.config))?
    } else {
        Config::default()
    };
    config.apply_env_overrides();
    if let Some(symbol) = args.symbol {
        config.symbol = symbol.to_ascii_uppercase();
    }
    config.validate()?;

    let level = config
        .log_level
        .parse::<Level>()
        .unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install tracing subscriber")?;

    if !args.config.exists() {
        warn!(path = ?args.config, "config file not found, using defaults");
    }
    info!(
        symbol = %config.symbol,
        trade_mode = %config.trade_mode,
        "starting executor"
    );

    let client = BinanceClient::new(&config).context("building exchange client")?;
    let api = Arc::new(client);

    if args.validate_only {
        api.sanity_check()
            .await
            .context("connectivity/auth check failed")?;
        info!("validate-only check passed");
        return Ok(());
    }

    let mut engine = Engine::new(config, api)?;

    tokio::select! {
        result = engine.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, flushing state");
            engine.persist("shutdown").await;
            Ok(())
        }
    }
}
