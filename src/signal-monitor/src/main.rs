//! Signal Monitor Service
//!
//! Discovers Polymarket markets through the Gamma API, streams their order
//! books and trades from the CLOB WebSocket, and publishes detected signals
//! to the configured sinks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use common::clob::ClobFeed;
use common::config::Config;
use common::gamma::GammaClient;
use common::orderbook::OrderBookRegistry;

mod detector;
mod discovery;
mod monitor;
mod sinks;

use detector::SignalEngine;
use discovery::Discovery;
use monitor::Monitor;
use sinks::{EventSink, MultiplexSink, StdoutSink, WebhookSink};

/// Signal Monitor - streams market signals from catalog and CLOB feeds
#[derive(Parser, Debug)]
#[command(name = "signal-monitor")]
#[command(about = "Detects and publishes Polymarket trading signals")]
struct Args {
    /// Refresh interval override in seconds
    #[arg(long)]
    refresh_interval: Option<u64>,

    /// Comma-separated category override
    #[arg(long)]
    categories: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    FmtSubscriber::builder().with_max_level(Level::INFO).init();

    let args = Args::parse();

    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(interval) = args.refresh_interval {
        config.app.refresh_interval_sec = interval;
    }
    if let Some(categories) = args.categories {
        config.app.categories = categories
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect();
    }

    info!("Signal Monitor starting...");
    info!(
        "Categories: {:?}, refresh every {}s",
        config.app.categories, config.app.refresh_interval_sec
    );

    let sink = Arc::new(build_multiplex(&config)?);

    let catalog = Arc::new(GammaClient::new(&config.gamma).context("building catalog client")?);
    let discovery = Discovery::new(
        catalog,
        config.filters.clone(),
        config.rolling.clone(),
        config.top.clone(),
        config.signals.drop_expired_markets,
    );

    let feed = ClobFeed::spawn(config.clob.clone());

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(Mutex::new(SignalEngine::new(
        config.signals.clone(),
        events_tx.clone(),
    )));
    let registry = Arc::new(Mutex::new(OrderBookRegistry::new()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    let monitor = Monitor::new(
        config,
        discovery,
        feed,
        engine,
        registry,
        sink,
        events_tx,
        events_rx,
        shutdown_rx,
    );
    monitor.run().await?;

    info!("Signal Monitor stopped");
    Ok(())
}

fn build_multiplex(config: &Config) -> Result<MultiplexSink> {
    let mut children: Vec<(String, Arc<dyn EventSink>)> = Vec::new();
    if config.sinks.stdout.enabled {
        children.push(("stdout".to_string(), Arc::new(StdoutSink)));
    }
    if config.sinks.webhook.enabled {
        match &config.sinks.webhook.url {
            Some(url) => {
                let webhook = WebhookSink::new(&config.sinks.webhook, url.clone())
                    .map_err(|error| anyhow::anyhow!("building webhook sink: {error}"))?;
                children.push(("webhook".to_string(), Arc::new(webhook)));
            }
            None => warn!("webhook sink enabled but SINKS_WEBHOOK_URL is unset, skipping"),
        }
    }
    let routes: HashMap<String, Vec<String>> = config.sinks.routes.clone();
    Ok(MultiplexSink::new(
        children,
        config.sinks.mode,
        &config.sinks.required_sinks,
        routes,
        config.sinks.transform,
    ))
}
