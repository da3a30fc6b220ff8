// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use duel_orchestrator::config::{Config, DuelNodeConfig};
use duel_orchestrator::metrics::start_metrics_server;
use duel_orchestrator::node::run_duel_node;
use duel_orchestrator::server::DuelNodePublicMetadata;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version = VERSION)]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DuelNodeConfig::load(&args.config_path)?;

    let prometheus_registry = prometheus::Registry::new();
    start_metrics_server(config.metrics_port, prometheus_registry.clone());
    info!("Metrics server started at port {}", config.metrics_port);

    let metadata = DuelNodePublicMetadata::new(VERSION);

    let handle = run_duel_node(config, metadata, prometheus_registry).await?;
    handle
        .await
        .map_err(|e| anyhow::anyhow!("Task join error: {}", e))
}
