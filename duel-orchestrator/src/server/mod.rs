// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::with_metrics;
use crate::{
    error::DuelError,
    escrow::EscrowContractInner,
    metrics::DuelMetrics,
    server::handler::{
        CompleteRequest, CompletionResponse, DuelRequestHandler, DuelRequestHandlerTrait,
        MonitoringResponse, StakeRequest, StakeResponse, StartMonitoringRequest,
    },
    types::Duel,
};
use axum::{
    extract::{Path, State},
    Json,
};
use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod handler;

pub const APPLICATION_JSON: &str = "application/json";

pub const PING_PATH: &str = "/ping";
// Note: Using :param syntax for axum 0.7.x (not {param} which is for axum 0.8.x)
pub const STAKE_PATH: &str = "/duels/stake";
pub const MONITORING_PATH: &str = "/duels/monitoring";
pub const COMPLETE_PATH: &str = "/duels/complete";
pub const DUEL_RECORD_PATH: &str = "/duels/:duel_id";

// Node's public metadata that is accessible via the `/ping` endpoint.
// Be careful with what to put here, as it is public.
#[derive(serde::Serialize)]
pub struct DuelNodePublicMetadata {
    pub version: &'static str,
}

impl DuelNodePublicMetadata {
    pub fn new(version: &'static str) -> Self {
        Self { version }
    }

    pub fn empty_for_testing() -> Self {
        Self { version: "testing" }
    }
}

pub fn run_server<P>(
    socket_address: &SocketAddr,
    handler: DuelRequestHandler<P>,
    metrics: Arc<DuelMetrics>,
    metadata: Arc<DuelNodePublicMetadata>,
) -> tokio::task::JoinHandle<()>
where
    P: EscrowContractInner + Send + Sync + 'static,
{
    let socket_address = *socket_address;
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(socket_address).await.unwrap();
        axum::serve(
            listener,
            make_router(Arc::new(handler), metrics, metadata).into_make_service(),
        )
        .await
        .unwrap();
    })
}

pub(crate) fn make_router(
    handler: Arc<impl DuelRequestHandlerTrait + Sync + Send + 'static>,
    metrics: Arc<DuelMetrics>,
    metadata: Arc<DuelNodePublicMetadata>,
) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/health", get(health_check))
        .route(PING_PATH, get(ping))
        .route(STAKE_PATH, post(handle_stake))
        .route(MONITORING_PATH, post(handle_start_monitoring))
        .route(COMPLETE_PATH, post(handle_complete))
        .route(DUEL_RECORD_PATH, get(handle_get_duel))
        .with_state((handler, metrics, metadata))
}

impl axum::response::IntoResponse for DuelError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            DuelError::MissingField(_)
            | DuelError::InvalidField { .. }
            | DuelError::AlreadyStaked(_)
            | DuelError::StakingDeadlinePassed(_)
            | DuelError::UnexpectedDuelStatus { .. }
            | DuelError::StakesIncomplete(_) => StatusCode::BAD_REQUEST,
            DuelError::NotAParticipant(_) => StatusCode::FORBIDDEN,
            DuelError::DuelNotFound(_) => StatusCode::NOT_FOUND,
            DuelError::SignerUnavailable(_)
            | DuelError::LedgerCallFailed(_)
            | DuelError::StorageError(_)
            | DuelError::InternalError(_)
            | DuelError::Generic(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "title": self.title(),
            "description": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl<E> From<E> for DuelError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Generic(err.into().to_string())
    }
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn ping(
    State((_, _, metadata)): State<(
        Arc<impl DuelRequestHandlerTrait + Sync + Send>,
        Arc<DuelMetrics>,
        Arc<DuelNodePublicMetadata>,
    )>,
) -> Result<Json<Arc<DuelNodePublicMetadata>>, DuelError> {
    Ok(Json(metadata))
}

#[instrument(level = "error", skip_all)]
async fn handle_stake(
    State((handler, metrics, _)): State<(
        Arc<impl DuelRequestHandlerTrait + Sync + Send>,
        Arc<DuelMetrics>,
        Arc<DuelNodePublicMetadata>,
    )>,
    Json(request): Json<StakeRequest>,
) -> Result<Json<StakeResponse>, DuelError> {
    let future = async {
        let response = handler.submit_stake(request).await?;
        Ok(response)
    };
    with_metrics!(metrics.clone(), "submit_stake", future).await
}

#[instrument(level = "error", skip_all)]
async fn handle_start_monitoring(
    State((handler, metrics, _)): State<(
        Arc<impl DuelRequestHandlerTrait + Sync + Send>,
        Arc<DuelMetrics>,
        Arc<DuelNodePublicMetadata>,
    )>,
    Json(request): Json<StartMonitoringRequest>,
) -> Result<Json<MonitoringResponse>, DuelError> {
    let future = async {
        let response = handler.start_monitoring(request).await?;
        Ok(response)
    };
    with_metrics!(metrics.clone(), "start_monitoring", future).await
}

#[instrument(level = "error", skip_all)]
async fn handle_complete(
    State((handler, metrics, _)): State<(
        Arc<impl DuelRequestHandlerTrait + Sync + Send>,
        Arc<DuelMetrics>,
        Arc<DuelNodePublicMetadata>,
    )>,
    Json(request): Json<CompleteRequest>,
) -> Result<Json<CompletionResponse>, DuelError> {
    let future = async {
        let response = handler.complete_duel(request).await?;
        Ok(response)
    };
    with_metrics!(metrics.clone(), "complete_duel", future).await
}

#[instrument(level = "error", skip_all, fields(duel_id = duel_id))]
async fn handle_get_duel(
    Path(duel_id): Path<String>,
    State((handler, metrics, _)): State<(
        Arc<impl DuelRequestHandlerTrait + Sync + Send>,
        Arc<DuelMetrics>,
        Arc<DuelNodePublicMetadata>,
    )>,
) -> Result<Json<Duel>, DuelError> {
    let future = async {
        let response = handler.get_duel(duel_id).await?;
        Ok(response)
    };
    with_metrics!(metrics.clone(), "get_duel", future).await
}

#[macro_export]
macro_rules! with_metrics {
    ($metrics:expr, $type_:expr, $func:expr) => {
        async move {
            info!("Received {} request", $type_);
            $metrics
                .requests_received
                .with_label_values(&[$type_])
                .inc();
            $metrics
                .requests_inflight
                .with_label_values(&[$type_])
                .inc();

            let result = $func.await;

            match &result {
                Ok(_) => {
                    info!("{} request succeeded", $type_);
                    $metrics.requests_ok.with_label_values(&[$type_]).inc();
                }
                Err(e) => {
                    info!("{} request failed: {:?}", $type_, e);
                    $metrics.err_requests.with_label_values(&[$type_]).inc();
                }
            }

            $metrics
                .requests_inflight
                .with_label_values(&[$type_])
                .dec();
            result
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test_logging, HandlerFixture};
    use crate::types::{address_hex, now_ms};
    use ethers::types::TxHash;
    use serde_json::Value;

    /// Serve the real router over a programmable ledger on an ephemeral port.
    async fn spawn_test_server(fixture: &HandlerFixture) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = make_router(
            fixture.handler(),
            fixture.metrics.clone(),
            Arc::new(DuelNodePublicMetadata::empty_for_testing()),
        );
        tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .await
                .unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_health_and_ping_endpoints() {
        init_test_logging();
        let fixture = HandlerFixture::new().await;
        let addr = spawn_test_server(&fixture).await;
        let client = reqwest::Client::new();

        for path in ["/", "/health"] {
            let resp = client
                .get(format!("http://{}{}", addr, path))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status().as_u16(), 200);
        }

        let resp = client
            .get(format!("http://{}{}", addr, PING_PATH))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["version"], "testing");
    }

    #[tokio::test]
    async fn test_stake_rejections_map_to_http_statuses() {
        init_test_logging();
        let fixture = HandlerFixture::new().await;
        fixture
            .insert_waiting_duel("duel-http", Some(now_ms() + 90_000))
            .await;
        let addr = spawn_test_server(&fixture).await;
        let client = reqwest::Client::new();
        let stake_url = format!("http://{}{}", addr, STAKE_PATH);

        // missing fields
        let resp = client
            .post(&stake_url)
            .json(&serde_json::json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["title"], "Invalid request");
        assert!(body["description"].as_str().unwrap().contains("duelId"));

        // unknown duel
        let resp = client
            .post(&stake_url)
            .json(&serde_json::json!({
                "duelId": "ghost",
                "stakeAmount": 10,
                "participant": address_hex(&fixture.first_address()),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 404);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["title"], "Duel not found");

        // valid duel, caller is neither participant
        let resp = client
            .post(&stake_url)
            .json(&serde_json::json!({
                "duelId": "duel-http",
                "stakeAmount": 10,
                "participant": "0x00000000000000000000000000000000000000aa",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 403);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["title"], "Not a participant");
    }

    #[tokio::test]
    async fn test_ledger_failure_maps_to_500() {
        init_test_logging();
        let fixture = HandlerFixture::new().await;
        fixture
            .insert_waiting_duel("duel-http", Some(now_ms() + 90_000))
            .await;
        fixture
            .ledger
            .queue_submission_response(Err("rpc down".to_string()));
        let addr = spawn_test_server(&fixture).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{}{}", addr, STAKE_PATH))
            .json(&serde_json::json!({
                "duelId": "duel-http",
                "stakeAmount": 10,
                "participant": address_hex(&fixture.first_address()),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 500);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["title"], "Ledger call failed");
    }

    #[tokio::test]
    async fn test_stake_and_fetch_duel_over_http() {
        init_test_logging();
        let fixture = HandlerFixture::new().await;
        fixture
            .insert_waiting_duel("duel-http", Some(now_ms() + 90_000))
            .await;
        fixture.ledger.queue_confirmed_submission(TxHash::from([0xA1; 32]));
        let addr = spawn_test_server(&fixture).await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://{}{}", addr, STAKE_PATH))
            .json(&serde_json::json!({
                "duelId": "duel-http",
                "stakeAmount": 10,
                "participant": address_hex(&fixture.first_address()),
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["bothStaked"], false);
        assert_eq!(body["numericId"], 1);
        assert!(body["transactionRef"].as_str().unwrap().starts_with("0x"));
        assert_eq!(body["duelStatus"], "waiting_for_stakes");

        let resp = client
            .get(format!("http://{}/duels/duel-http", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let record: Value = resp.json().await.unwrap();
        assert_eq!(record["id"], "duel-http");
        assert_eq!(record["status"], "waiting_for_stakes");
        assert_eq!(record["first"]["stakeState"], "staked");
        assert_eq!(record["second"]["stakeState"], "unstaked");
    }
}
