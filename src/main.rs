// src/main.rs

//! The `orderfeed` operator CLI: watch topics or publish a single message.

use anyhow::{Context, Result, anyhow};
use orderfeed::config::Config;
use orderfeed::core::{ConnectionStatus, OutboundBody, RealtimeClient};
use std::env;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

const USAGE: &str = "Usage:\n  orderfeed [--config PATH] watch TOPIC...\n  orderfeed [--config PATH] send DESTINATION PAYLOAD\n  orderfeed --version";

/// How long to wait for DISCONNECT to be flushed before exiting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("orderfeed version {VERSION}");
        return Ok(());
    }

    // Logging starts before the config is read so that config errors are
    // reported through it; the filter is swapped once `log_level` is known.
    let rust_log = env::var("RUST_LOG").ok();
    let initial_filter = EnvFilter::new(rust_log.as_deref().unwrap_or("info"));
    let (filter, reload_handle) = reload::Layer::new(initial_filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .init();

    let (config_path, rest) = split_config_flag(&args[1..])?;
    let config = match config_path {
        Some(path) => Config::from_file(path)?,
        None => match Config::from_file("orderfeed.toml") {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("Using built-in defaults: {:#}", e);
                Config::default()
            }
        },
    };

    if rust_log.is_none()
        && let Err(e) = reload_handle.reload(EnvFilter::new(&config.log_level))
    {
        warn!("Failed to apply log_level '{}': {}", config.log_level, e);
    }

    let client = RealtimeClient::from_config(&config).context("Failed to build client")?;
    info!(
        "orderfeed {} using {} endpoint {}",
        VERSION, config.environment, config.endpoint
    );

    let result = match rest.split_first() {
        Some((cmd, topics)) if cmd == "watch" && !topics.is_empty() => {
            watch(&client, topics).await
        }
        Some((cmd, params)) if cmd == "send" && params.len() == 2 => {
            send(&client, &params[0], &params[1]).await
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    };

    let connection = client.manager().current();
    client.disconnect();
    if let Some(connection) = connection {
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, connection.closed()).await;
    }
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

/// Pulls `--config PATH` out of the argument list.
fn split_config_flag(args: &[String]) -> Result<(Option<&str>, Vec<String>)> {
    let mut config_path = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter
                .next()
                .ok_or_else(|| anyhow!("--config flag requires a value"))?;
            config_path = Some(path.as_str());
        } else {
            rest.push(arg.clone());
        }
    }
    Ok((config_path, rest))
}

async fn watch(client: &RealtimeClient, topics: &[String]) -> Result<()> {
    let mut status_rx = client.watch_state();
    let mut handles = Vec::with_capacity(topics.len());
    for topic in topics {
        let handle = client
            .subscribe(topic, |message| {
                info!(
                    topic = %message.topic,
                    message_id = message.message_id.as_deref().unwrap_or("-"),
                    "{}",
                    message.payload
                );
            })
            .await
            .with_context(|| format!("Failed to subscribe to '{topic}'"))?;
        handles.push(handle);
    }
    info!("Watching {} topic(s). Press Ctrl-C to stop.", handles.len());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down.");
                break;
            }
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                match &*status_rx.borrow_and_update() {
                    ConnectionStatus::Connected => info!("Connection is up."),
                    ConnectionStatus::Connecting => info!("Connecting..."),
                    ConnectionStatus::Failed(e) => warn!("Connection failed: {}", e),
                    ConnectionStatus::Disconnected => info!("Disconnected."),
                }
            }
        }
    }

    for handle in handles {
        handle.unsubscribe();
    }
    Ok(())
}

async fn send(client: &RealtimeClient, destination: &str, payload: &str) -> Result<()> {
    let body = match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(value) => OutboundBody::Json(value),
        Err(_) => OutboundBody::Text(payload.to_string()),
    };
    client
        .send(destination, body)
        .await
        .with_context(|| format!("Failed to send to '{destination}'"))?;
    info!("Sent to '{}'.", destination);
    Ok(())
}
