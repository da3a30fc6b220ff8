// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use axum::routing::get;
use axum::Router;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Registry, TextEncoder,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

const FINE_GRAINED_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.15, 0.2, 0.25, 0.3, 0.35, 0.4, 0.45, 0.5, 0.6, 0.7, 0.8, 0.9,
    1.0, 1.2, 1.4, 1.6, 1.8, 2.0, 2.5, 3.0, 3.5, 4.0, 5.0, 6.0, 6.5, 7.0, 7.5, 8.0, 8.5, 9.0, 9.5,
    10., 15., 20., 25., 30., 35., 40., 45., 50., 60., 70., 80., 90., 100., 120., 140., 160., 180.,
    200., 250., 300., 350., 400.,
];

#[derive(Clone, Debug)]
#[allow(dead_code)]
pub struct DuelMetrics {
    pub(crate) requests_received: IntCounterVec,
    pub(crate) requests_ok: IntCounterVec,
    pub(crate) err_requests: IntCounterVec,
    pub(crate) requests_inflight: IntGaugeVec,

    pub(crate) escrow_tx_submitted: IntCounterVec,
    pub(crate) escrow_tx_confirmed: IntCounterVec,
    pub(crate) escrow_tx_failed: IntCounterVec,
    pub(crate) escrow_tx_latency: HistogramVec,
    pub(crate) escrow_rpc_errors: IntCounterVec,
    pub(crate) escrow_events_observed: IntCounter,

    pub(crate) stake_ledger_failures: IntCounter,
    pub(crate) duels_activated: IntCounter,
    pub(crate) monitoring_started: IntCounter,
    pub(crate) duels_completed: IntCounterVec,
    pub(crate) duels_cancelled: IntCounter,
    pub(crate) refunds_issued: IntCounter,

    pub(crate) sweep_runs: IntCounterVec,
    pub(crate) reconciler_resolved: IntCounterVec,

    pub(crate) server_uptime_seconds: IntGauge,
}

impl DuelMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            requests_received: register_int_counter_vec_with_registry!(
                "duel_requests_received",
                "Total number of requests received in Server, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            requests_ok: register_int_counter_vec_with_registry!(
                "duel_requests_ok",
                "Total number of requests completed successfully, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            err_requests: register_int_counter_vec_with_registry!(
                "duel_err_requests",
                "Total number of requests that failed, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            requests_inflight: register_int_gauge_vec_with_registry!(
                "duel_requests_inflight",
                "Number of requests currently being processed, by request type",
                &["type"],
                registry,
            )
            .unwrap(),
            escrow_tx_submitted: register_int_counter_vec_with_registry!(
                "duel_escrow_tx_submitted",
                "Total number of escrow transactions submitted, by call",
                &["call"],
                registry,
            )
            .unwrap(),
            escrow_tx_confirmed: register_int_counter_vec_with_registry!(
                "duel_escrow_tx_confirmed",
                "Total number of escrow transactions confirmed on the ledger, by call",
                &["call"],
                registry,
            )
            .unwrap(),
            escrow_tx_failed: register_int_counter_vec_with_registry!(
                "duel_escrow_tx_failed",
                "Total number of escrow transactions that failed or were never confirmed, by call",
                &["call"],
                registry,
            )
            .unwrap(),
            escrow_tx_latency: register_histogram_vec_with_registry!(
                "duel_escrow_tx_latency",
                "Submission-to-confirmation latency of escrow transactions, by call",
                &["call"],
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            escrow_rpc_errors: register_int_counter_vec_with_registry!(
                "duel_escrow_rpc_errors",
                "Total number of escrow RPC errors, by method",
                &["method"],
                registry,
            )
            .unwrap(),
            escrow_events_observed: register_int_counter_with_registry!(
                "duel_escrow_events_observed",
                "Total number of escrow contract events observed by the subscription",
                registry,
            )
            .unwrap(),
            stake_ledger_failures: register_int_counter_with_registry!(
                "duel_stake_ledger_failures",
                "Total number of stake placements that failed on the ledger",
                registry,
            )
            .unwrap(),
            duels_activated: register_int_counter_with_registry!(
                "duel_duels_activated",
                "Total number of duels that collected both stakes and became active",
                registry,
            )
            .unwrap(),
            monitoring_started: register_int_counter_with_registry!(
                "duel_monitoring_started",
                "Total number of duels that entered health monitoring",
                registry,
            )
            .unwrap(),
            duels_completed: register_int_counter_vec_with_registry!(
                "duel_duels_completed",
                "Total number of completed duels, by outcome",
                &["outcome"],
                registry,
            )
            .unwrap(),
            duels_cancelled: register_int_counter_with_registry!(
                "duel_duels_cancelled",
                "Total number of duels cancelled because the staking window timed out",
                registry,
            )
            .unwrap(),
            refunds_issued: register_int_counter_with_registry!(
                "duel_refunds_issued",
                "Total number of stake refunds submitted to the escrow",
                registry,
            )
            .unwrap(),
            sweep_runs: register_int_counter_vec_with_registry!(
                "duel_sweep_runs",
                "Total number of periodic sweep executions, by sweep",
                &["sweep"],
                registry,
            )
            .unwrap(),
            reconciler_resolved: register_int_counter_vec_with_registry!(
                "duel_reconciler_resolved",
                "Total number of ledger call records resolved from escrow evidence, by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            server_uptime_seconds: register_int_gauge_with_registry!(
                "duel_server_uptime_seconds",
                "Seconds since the node started",
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}

async fn render_metrics(registry: Arc<Registry>) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = String::new();
    // encoding registered families into a string buffer cannot fail
    let _ = encoder.encode_utf8(&metric_families, &mut buffer);
    buffer
}

/// Serve the Prometheus endpoint on `port`.
pub fn start_metrics_server(port: u16, registry: Registry) -> JoinHandle<()> {
    let registry = Arc::new(registry);
    tokio::spawn(async move {
        let router = Router::new().route(
            "/metrics",
            get(move || render_metrics(registry.clone())),
        );
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        info!("[Metrics] Serving prometheus metrics at {}/metrics", addr);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .unwrap_or_else(|e| panic!("Failed to bind metrics port {}: {}", port, e));
        axum::serve(listener, router)
            .await
            .unwrap_or_else(|e| panic!("Metrics server error: {}", e));
    })
}
