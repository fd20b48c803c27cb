// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2025 Waddle Social

//! overseer-demo - a hello server that upgrades itself in place.
//!
//! Build it, start it, then drop a newer build where `--fetch-file` points
//! (or serve one at `--fetch-url`). The running server swaps to the new
//! build without refusing a single connection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use waddle_overseer::{Config, Fetcher, FileFetcher, HttpFetcher, State};

mod app;

use app::{create_router, AppState, BUILD_ID};

/// Demo service supervised by waddle-overseer
#[derive(Parser, Debug)]
#[command(name = "overseer-demo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listen address, repeat for several (`:port` binds all interfaces)
    #[arg(short, long = "address", default_value = ":5001")]
    addresses: Vec<String>,

    /// Poll this URL for new builds
    #[arg(long, conflicts_with = "fetch_file")]
    fetch_url: Option<String>,

    /// Watch this file for new builds
    #[arg(long)]
    fetch_file: Option<PathBuf>,

    /// Seconds between fetch attempts
    #[arg(long, default_value_t = 10)]
    interval: u64,

    /// Log every supervision action
    #[arg(long)]
    debug: bool,

    /// Exit instead of running unsupervised when supervision fails
    #[arg(long)]
    required: bool,

    /// Install new builds without restarting into them
    #[arg(long)]
    no_restart_after_fetch: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,waddle_overseer=debug"));

    // stdout is reserved for the sanity-check answer.
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn build_config(cli: Cli) -> Config {
    let interval = Duration::from_secs(cli.interval);
    let fetcher: Option<Box<dyn Fetcher>> = match (cli.fetch_url, cli.fetch_file) {
        (Some(url), _) => Some(Box::new(HttpFetcher::new(url, interval))),
        (None, Some(path)) => Some(Box::new(FileFetcher::new(path, interval))),
        (None, None) => None,
    };
    let fallback = cli.addresses.first().cloned();

    Config {
        required: cli.required,
        addresses: cli.addresses,
        fetcher,
        debug: cli.debug,
        no_restart_after_fetch: cli.no_restart_after_fetch,
        ..Config::new(move |state| program(state, fallback))
    }
    .with_env_overrides()
}

/// Runs once per slave, or directly when supervision is unavailable.
async fn program(mut state: State, fallback: Option<String>) {
    info!(build = BUILD_ID, id = %state.id, enabled = state.enabled, "app listening...");

    let mut listeners = std::mem::take(&mut state.listeners).into_inner();
    if listeners.is_empty() {
        // Unsupervised: bind the first address ourselves.
        let Some(address) = fallback else {
            return;
        };
        let address = match address.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => address,
        };
        match tokio::net::TcpListener::bind(&address).await {
            Ok(listener) => listeners.push((address, listener)),
            Err(e) => {
                tracing::error!(address = %address, error = %e, "Failed to bind");
                return;
            }
        }
    }

    let shared = Arc::new(AppState {
        id: state.id.clone(),
        bin_id: state.bin_id.clone(),
        started_at: state.started_at,
        shutdown: state.shutdown.clone(),
        restart: state.restart_handle(),
    });
    app::serve(create_router(shared), listeners, &state.shutdown).await;
    info!(id = %state.id, "app stopped");
}

#[tokio::main]
async fn main() -> Result<()> {
    waddle_overseer::sanity_check();

    let cli = Cli::parse();
    init_tracing();

    info!("Overseer demo build {} starting...", BUILD_ID);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    waddle_overseer::run(build_config(cli)).await;
    Ok(())
}
