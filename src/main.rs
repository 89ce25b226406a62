use arbitrage_bot::arbitrage::ArbitrageEngine;
use arbitrage_bot::config::ArbitrageConfig;
use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use log::LevelFilter;
use std::env;
use std::io::{Error, ErrorKind, Write};
use std::str::FromStr;
use tokio::sync::watch;

fn invalid_input<E: std::fmt::Display>(e: E) -> Error {
    Error::new(ErrorKind::InvalidInput, e.to_string())
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging with local timezone
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "3600".to_string())
        .parse::<i32>()
        .map_err(|e| invalid_input(format!("Invalid TIMEZONE_OFFSET: {}", e)))?;
    let offset = FixedOffset::east_opt(offset_seconds)
        .ok_or_else(|| invalid_input(format!("Invalid offset: {}", offset_seconds)))?;
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
                .unwrap_or(LevelFilter::Debug),
        )
        .init();

    let git_hash = option_env!("ARBITRAGE_BOT_GIT_HASH").unwrap_or("unknown");
    log::info!("arbitrage-bot git: {}", git_hash);
    log::info!("Starting arbitrage loop...");

    let cfg = ArbitrageConfig::from_env_or_yaml().map_err(|e| invalid_input(format!("{:#}", e)))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received Ctrl-C, shutting down...");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut engine = ArbitrageEngine::new(cfg)
        .await
        .map_err(|e| Error::new(ErrorKind::Other, format!("{:#}", e)))?
        .with_shutdown(shutdown_rx);
    engine
        .run()
        .await
        .map_err(|e| Error::new(ErrorKind::Other, e))
}
