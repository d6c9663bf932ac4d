//! Acquisition daemon entry point.
//!
//! Wires the flag-driven configuration into the pipeline, starts the
//! SIMPLON status poller and the web server, and translates Ctrl-C /
//! SIGTERM into the supervisory cancellation token. Exit code is zero on a
//! clean shutdown and non-zero when the transport cannot be brought up
//! with fallback disabled.

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stxm_map::config::{AppConfig, Cli};
use stxm_map::pipeline::{self, Pipeline};
use stxm_map::{server, simplon};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_cli(Cli::parse())?;
    info!(
        endpoint = %cfg.endpoint,
        grid_x = cfg.grid_x,
        grid_y = cfg.grid_y,
        workers = cfg.workers,
        debug = cfg.debug,
        "starting stxm-map"
    );

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_token.cancel();
    });

    let Pipeline {
        bridge,
        ui_rx,
        producer,
        tasks,
    } = pipeline::spawn(cfg.clone(), token.clone())?;

    let poller = if cfg.debug {
        None
    } else {
        Some(tokio::spawn(simplon::poll_task(
            token.clone(),
            cfg.api_version.clone(),
            cfg.simplon_interval,
            bridge.endpoint_watch(),
            bridge.status.clone(),
        )))
    };

    let server_result = server::run(&cfg, bridge, ui_rx, token.clone()).await;
    // The server only returns on cancellation or a bind failure; either
    // way the pipeline should drain now.
    token.cancel();

    let producer_result = producer.await;
    for task in tasks {
        let _ = task.await;
    }
    if let Some(poller) = poller {
        let _ = poller.await;
    }

    server_result?;
    match producer_result {
        Ok(result) => result?,
        Err(join_err) => error!(error = %join_err, "producer task failed"),
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
