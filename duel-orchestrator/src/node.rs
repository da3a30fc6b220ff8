// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::config::DuelNodeConfig;
use crate::metrics::DuelMetrics;
use crate::reconciler::LedgerReconciler;
use crate::server::{handler::DuelRequestHandler, run_server, DuelNodePublicMetadata};
use crate::settlement::SettlementDriver;
use crate::sweeper::{MonitoringCompletionSweep, Observable, StakingDeadlineSweep, SweepService};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Validate the configuration, start the background tasks and serve the
/// duel API. The returned handle belongs to the server task; the sweep and
/// reconciliation tasks run detached until the process exits.
pub async fn run_duel_node(
    config: DuelNodeConfig,
    metadata: DuelNodePublicMetadata,
    prometheus_registry: prometheus::Registry,
) -> anyhow::Result<JoinHandle<()>> {
    let metrics = Arc::new(DuelMetrics::new(&prometheus_registry));
    let start_time = std::time::Instant::now();

    // Start server uptime tracking task
    let uptime_metrics = metrics.clone();
    tokio::spawn(async move {
        loop {
            uptime_metrics
                .server_uptime_seconds
                .set(start_time.elapsed().as_secs() as i64);
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
        }
    });

    let server_config = config.validate(metrics.clone()).await?;
    let cancel = CancellationToken::new();

    let driver = Arc::new(SettlementDriver::new(
        server_config.store.clone(),
        server_config.escrow.clone(),
        server_config.health.clone(),
        server_config.notifier.clone(),
        server_config.signers.clone(),
        metrics.clone(),
    ));
    let reconciler = Arc::new(LedgerReconciler::new(
        server_config.store.clone(),
        server_config.escrow.clone(),
        server_config.notifier.clone(),
        metrics.clone(),
        server_config.reconcile_interval,
    ));

    let mut handles = vec![];

    // Escrow contract events feed the reconciler as confirmation evidence.
    let (events_tx, events_rx) = mpsc::channel(1000);
    handles.push(server_config.escrow.clone().subscribe(
        server_config.event_start_block,
        server_config.event_poll_interval,
        events_tx,
        cancel.clone(),
    ));
    handles.push(reconciler.clone().run_event_sink(events_rx, cancel.clone()));

    // Periodic duties: expire unstaked duels, complete elapsed monitoring
    // windows, reconcile unresolved ledger calls.
    let observables: Vec<Box<dyn Observable + Send + Sync>> = vec![
        Box::new(StakingDeadlineSweep::new(
            server_config.store.clone(),
            server_config.escrow.clone(),
            server_config.signers.clone(),
            server_config.notifier.clone(),
            metrics.clone(),
            server_config.sweep_interval,
        )),
        Box::new(MonitoringCompletionSweep::new(
            server_config.store.clone(),
            driver.clone(),
            server_config.sweep_interval,
        )),
        Box::new(reconciler),
    ];
    handles.extend(SweepService::new(observables, metrics.clone()).run(&cancel));

    // Start Server
    let socket_address = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        server_config.server_listen_port,
    );
    Ok(run_server(
        &socket_address,
        DuelRequestHandler::new(
            server_config.store,
            server_config.escrow,
            server_config.signers,
            server_config.notifier,
            driver,
            metrics.clone(),
            server_config.default_monitoring_duration_minutes,
        ),
        metrics,
        Arc::new(metadata),
    ))
}
