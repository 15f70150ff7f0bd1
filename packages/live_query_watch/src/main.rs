use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use live_query::{ChannelHandler, ClientConfig, HandlerEvent, LiveQuery, SubscriptionRegistry};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "lq-watch")]
#[command(about = "Subscribe to a live query and print change events as JSON lines")]
struct Cli {
    /// Path to live_query.toml (LIVE_QUERY_* env vars apply either way)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured server URI
    #[arg(long)]
    server_uri: Option<String>,

    /// Override the configured application id
    #[arg(long)]
    application_id: Option<String>,

    /// Subscription key
    #[arg(short, long, default_value = "watch")]
    key: String,

    /// Class to watch
    #[arg(long)]
    class: String,

    /// Constraints as a JSON object, e.g. '{"level":{"$gt":3}}'
    #[arg(long = "where")]
    constraints: Option<String>,

    /// Comma-separated fields to deliver
    #[arg(long, value_delimiter = ',')]
    fields: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries events, logs go to stderr
    let default_directive = if cli.debug {
        "live_query=debug,lq_watch=debug,info"
    } else {
        "live_query=info,lq_watch=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let mut config =
        ClientConfig::load(cli.config.as_deref()).context("Failed to load live query config")?;
    if let Some(uri) = cli.server_uri.clone() {
        config.server_uri = uri;
    }
    if let Some(app_id) = cli.application_id.clone() {
        config.application_id = app_id;
    }

    let query = build_query(&cli)?;
    let registry = Arc::new(SubscriptionRegistry::with_websocket(config.clone()));

    let (handler, mut events) = ChannelHandler::new();
    registry
        .add_subscription(&cli.key, query, handler)
        .await
        .with_context(|| format!("Failed to subscribe {:?}", cli.key))?;
    info!(key = %cli.key, uri = %config.server_uri, "watching live query");

    let cancel = CancellationToken::new();
    let pump = registry.spawn_pump_loop(config.pump_interval, cancel.clone());

    let printer = tokio::spawn(async move {
        while let Some(item) = events.recv().await {
            match item {
                HandlerEvent::Event(event) => match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => debug!(error = %e, "failed to encode event"),
                },
                HandlerEvent::Message(message) => info!("{message}"),
            }
        }
    });

    wait_for_quit(&registry).await?;

    info!("Received shutdown signal, unsubscribing...");
    registry.unsubscribe_all().await;
    cancel.cancel();
    pump.await.context("Pump loop panicked")?;
    printer.await.context("Printer task panicked")?;
    Ok(())
}

fn build_query(cli: &Cli) -> Result<LiveQuery> {
    let mut query = LiveQuery::new(cli.class.clone());
    if let Some(raw) = &cli.constraints {
        query.constraints = serde_json::from_str::<Map<String, Value>>(raw)
            .context("--where must be a JSON object")?;
    }
    if !cli.fields.is_empty() {
        query = query.select(cli.fields.iter().cloned());
    }
    Ok(query)
}

/// Run until Ctrl-C. SIGUSR1 pauses every subscription, SIGUSR2 resumes them.
#[cfg(unix)]
async fn wait_for_quit(registry: &SubscriptionRegistry) -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut pause = signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;
    let mut resume =
        signal(SignalKind::user_defined2()).context("Failed to install SIGUSR2 handler")?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                return result.context("Failed to install Ctrl+C handler");
            }
            _ = pause.recv() => registry.pause().await,
            _ = resume.recv() => {
                let renewed = registry.resume().await;
                debug!(renewed, "resume signal handled");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_quit(_registry: &SubscriptionRegistry) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_query_from_flags() {
        let cli = Cli::parse_from([
            "lq-watch",
            "--class",
            "PlayerData",
            "--where",
            r#"{"level":{"$gt":3}}"#,
            "--fields",
            "locX,locY",
        ]);
        let query = build_query(&cli).unwrap();
        assert_eq!(query.class_name, "PlayerData");
        assert_eq!(query.constraints["level"]["$gt"], 3);
        assert_eq!(
            query.fields,
            Some(vec!["locX".to_string(), "locY".to_string()])
        );
        assert_eq!(cli.key, "watch");
    }

    #[test]
    fn rejects_non_object_where() {
        let cli = Cli::parse_from(["lq-watch", "--class", "PlayerData", "--where", "[1,2]"]);
        assert!(build_query(&cli).is_err());
    }
}
