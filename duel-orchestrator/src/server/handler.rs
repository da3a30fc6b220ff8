// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::DuelError;
use crate::escrow::{EscrowClient, EscrowContractInner};
use crate::metrics::DuelMetrics;
use crate::notifier::{publish_duel_event, RealtimeNotifier};
use crate::record_store::DuelRecordStore;
use crate::settlement::SettlementDriver;
use crate::signer::SignerRegistry;
use crate::types::{
    address_hex, now_ms, ChallengeMetadata, Duel, DuelBecameActivePayload, DuelStatus, FinalScores,
    LedgerCallRecord, MonitoringStartedPayload, MonitoringWindow, ParticipantStakedPayload,
    StakeState, StakeStatuses, EVENT_DUEL_BECAME_ACTIVE, EVENT_MONITORING_STARTED,
    EVENT_PARTICIPANT_STAKED,
};
use async_trait::async_trait;
use axum::Json;
use ethers::types::Address as EthAddress;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakeRequest {
    pub duel_id: Option<String>,
    pub stake_amount: Option<u64>,
    pub participant: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakeResponse {
    pub transaction_ref: String,
    pub numeric_id: u64,
    pub stake_amount: u64,
    pub both_staked: bool,
    pub duel_status: DuelStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMonitoringRequest {
    pub duel_id: Option<String>,
    pub participant: Option<String>,
    pub duration_minutes: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringResponse {
    pub duel_id: String,
    pub challenge_metadata: ChallengeMetadata,
    pub start_time: u64,
    pub end_time: u64,
    pub duration_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub duel_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    pub duel_id: String,
    pub duel_status: DuelStatus,
    pub winner: Option<String>,
    pub final_scores: Option<FinalScores>,
}

#[async_trait]
pub trait DuelRequestHandlerTrait {
    // Handles a request to place one participant's stake into escrow and, if
    // this was the second stake, activate the duel.
    async fn submit_stake(&self, request: StakeRequest)
        -> Result<Json<StakeResponse>, DuelError>;
    // Handles a request to open the health monitoring window of an accepted
    // duel. Repeating the request returns the existing window.
    async fn start_monitoring(
        &self,
        request: StartMonitoringRequest,
    ) -> Result<Json<MonitoringResponse>, DuelError>;
    // Manually triggers the completion and settlement driver for a duel whose
    // monitoring window has elapsed.
    async fn complete_duel(
        &self,
        request: CompleteRequest,
    ) -> Result<Json<CompletionResponse>, DuelError>;
    async fn get_duel(&self, duel_id: String) -> Result<Json<Duel>, DuelError>;
}

pub struct DuelRequestHandler<P> {
    store: Arc<DuelRecordStore>,
    escrow: Arc<EscrowClient<P>>,
    signers: Arc<SignerRegistry>,
    notifier: Arc<dyn RealtimeNotifier>,
    driver: Arc<SettlementDriver<P>>,
    metrics: Arc<DuelMetrics>,
    default_monitoring_duration_minutes: u64,
}

fn parse_participant(raw: &str) -> Result<EthAddress, DuelError> {
    EthAddress::from_str(raw).map_err(|_| DuelError::InvalidField {
        field: "participant",
        reason: format!("`{}` is not a valid ledger address", raw),
    })
}

impl<P> DuelRequestHandler<P>
where
    P: EscrowContractInner + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<DuelRecordStore>,
        escrow: Arc<EscrowClient<P>>,
        signers: Arc<SignerRegistry>,
        notifier: Arc<dyn RealtimeNotifier>,
        driver: Arc<SettlementDriver<P>>,
        metrics: Arc<DuelMetrics>,
        default_monitoring_duration_minutes: u64,
    ) -> Self {
        Self {
            store,
            escrow,
            signers,
            notifier,
            driver,
            metrics,
            default_monitoring_duration_minutes,
        }
    }
}

#[async_trait]
impl<P> DuelRequestHandlerTrait for DuelRequestHandler<P>
where
    P: EscrowContractInner + Send + Sync + 'static,
{
    async fn submit_stake(
        &self,
        request: StakeRequest,
    ) -> Result<Json<StakeResponse>, DuelError> {
        let duel_id = request.duel_id.ok_or(DuelError::MissingField("duelId"))?;
        let stake_amount = request
            .stake_amount
            .ok_or(DuelError::MissingField("stakeAmount"))?;
        let participant_raw = request
            .participant
            .ok_or(DuelError::MissingField("participant"))?;
        let participant = parse_participant(&participant_raw)?;
        info!(
            "[Handler] 📥 Received stake request: duel_id={}, participant={}, amount={}",
            duel_id,
            address_hex(&participant),
            stake_amount
        );

        // Preconditions, each a distinct rejection. Checked against a fresh
        // read; the record can still move under us afterwards, which the
        // atomic claims below account for.
        let duel = self
            .store
            .get(&duel_id)
            .await
            .ok_or_else(|| DuelError::DuelNotFound(duel_id.clone()))?;
        let slot = duel
            .slot_of(&participant)
            .ok_or_else(|| DuelError::NotAParticipant(address_hex(&participant)))?;
        if duel.participant(slot).stake_state == StakeState::Staked {
            warn!(
                "[Handler] ❌ Stake rejected, {} already staked: duel_id={}",
                slot, duel_id
            );
            return Err(DuelError::AlreadyStaked(address_hex(&participant)));
        }
        if duel.staking_deadline_elapsed(now_ms()) {
            warn!(
                "[Handler] ❌ Stake rejected, staking deadline passed: duel_id={}",
                duel_id
            );
            return Err(DuelError::StakingDeadlinePassed(duel_id));
        }
        if duel.status != DuelStatus::WaitingForStakes {
            warn!(
                "[Handler] ❌ Stake rejected, duel is {}: duel_id={}",
                duel.status, duel_id
            );
            return Err(DuelError::UnexpectedDuelStatus {
                duel_id,
                actual: duel.status,
            });
        }
        if stake_amount != duel.stake_amount {
            return Err(DuelError::InvalidField {
                field: "stakeAmount",
                reason: format!(
                    "duel requires a stake of {}, got {}",
                    duel.stake_amount, stake_amount
                ),
            });
        }

        let numeric_id = self.store.ensure_numeric_id(&duel_id).await?;
        let signer = self
            .signers
            .participant_signer(&participant)
            .ok_or_else(|| DuelError::SignerUnavailable(address_hex(&participant)))?;

        // Mark the attempt before touching the ledger so a crash between
        // submission and the status write leaves a visible Pending record.
        self.store
            .update(&duel_id, |d| {
                let p = d.participant_mut(slot);
                p.stake_state = StakeState::Pending;
                p.stake_call = Some(LedgerCallRecord::pending());
            })
            .await?;

        let tx_ref = match self
            .escrow
            .place_stake(numeric_id, stake_amount, signer.as_ref())
            .await
        {
            Ok(tx_ref) => tx_ref,
            Err(e) => {
                self.metrics.stake_ledger_failures.inc();
                // The stake stays Pending: the attempt happened and its
                // outcome is unknown until the reconciler finds evidence.
                self.store
                    .update(&duel_id, |d| {
                        d.participant_mut(slot).stake_call = Some(LedgerCallRecord::failed());
                    })
                    .await?;
                warn!(
                    "[Handler] ❌ Stake ledger call failed: duel_id={}, participant={}, error={:?}",
                    duel_id,
                    address_hex(&participant),
                    e
                );
                return Err(e);
            }
        };

        self.store
            .update(&duel_id, |d| {
                let p = d.participant_mut(slot);
                p.stake_state = StakeState::Staked;
                p.stake_tx_ref = Some(tx_ref.clone());
                p.stake_call = Some(LedgerCallRecord::confirmed(tx_ref.clone()));
            })
            .await?;

        // Both-staked is evaluated from a fresh read taken after our own
        // update, so a concurrent stake by the other participant is seen by
        // whichever call lands second.
        let fresh = self.store.get(&duel_id).await.ok_or_else(|| {
            DuelError::InternalError(format!("duel `{}` vanished mid-stake", duel_id))
        })?;

        if fresh.both_staked() {
            let claimed = self
                .store
                .transition_status(&duel_id, DuelStatus::WaitingForStakes, DuelStatus::Accepted)
                .await?;
            if claimed {
                let activated = self
                    .store
                    .update(&duel_id, |d| {
                        d.ledger_active = true;
                        // Nothing left for the deadline sweep to act on.
                        d.staking_deadline_ms = None;
                    })
                    .await?;
                self.metrics.duels_activated.inc();
                info!(
                    "[Handler] ✅ Both stakes placed, duel is now active: duel_id={}",
                    duel_id
                );
                publish_duel_event(
                    self.notifier.as_ref(),
                    &duel_id,
                    EVENT_DUEL_BECAME_ACTIVE,
                    DuelBecameActivePayload {
                        status: activated.status,
                        stake_statuses: StakeStatuses {
                            first: activated.first.stake_state,
                            second: activated.second.stake_state,
                        },
                        stake_amount: activated.stake_amount,
                        numeric_id,
                    },
                )
                .await;
            }
        } else {
            info!(
                "[Handler] ✅ Stake placed, waiting for the other participant: duel_id={}",
                duel_id
            );
            publish_duel_event(
                self.notifier.as_ref(),
                &duel_id,
                EVENT_PARTICIPANT_STAKED,
                ParticipantStakedPayload {
                    staked_participant: address_hex(&participant),
                    transaction_ref: tx_ref.clone(),
                    time_remaining: fresh.staking_time_remaining_secs(now_ms()),
                },
            )
            .await;
        }

        let settled_view = self.store.get(&duel_id).await.ok_or_else(|| {
            DuelError::InternalError(format!("duel `{}` vanished mid-stake", duel_id))
        })?;
        Ok(Json(StakeResponse {
            transaction_ref: tx_ref,
            numeric_id,
            stake_amount,
            both_staked: settled_view.both_staked(),
            duel_status: settled_view.status,
        }))
    }

    async fn start_monitoring(
        &self,
        request: StartMonitoringRequest,
    ) -> Result<Json<MonitoringResponse>, DuelError> {
        let duel_id = request.duel_id.ok_or(DuelError::MissingField("duelId"))?;
        let participant_raw = request
            .participant
            .ok_or(DuelError::MissingField("participant"))?;
        let participant = parse_participant(&participant_raw)?;
        let duration_minutes = request
            .duration_minutes
            .unwrap_or(self.default_monitoring_duration_minutes);
        if duration_minutes == 0 {
            return Err(DuelError::InvalidField {
                field: "durationMinutes",
                reason: "monitoring duration must be positive".to_string(),
            });
        }
        info!(
            "[Handler] 📥 Received monitoring request: duel_id={}, duration={}min",
            duel_id, duration_minutes
        );

        let duel = self
            .store
            .get(&duel_id)
            .await
            .ok_or_else(|| DuelError::DuelNotFound(duel_id.clone()))?;
        duel.slot_of(&participant)
            .ok_or_else(|| DuelError::NotAParticipant(address_hex(&participant)))?;
        if !duel.both_staked() {
            warn!(
                "[Handler] ❌ Monitoring rejected, stakes incomplete: duel_id={}",
                duel_id
            );
            return Err(DuelError::StakesIncomplete(duel_id));
        }

        // Already monitoring: idempotent, return the window as-is.
        if duel.status == DuelStatus::MonitoringHealth {
            let window = existing_window(&duel)?;
            return Ok(Json(monitoring_response(&duel_id, &duel, &window)));
        }

        // Claim the transition. Only the caller that flips Accepted to
        // MonitoringHealth sets the window and publishes the event.
        let (updated, claimed) = self
            .store
            .update_returning(&duel_id, |d| {
                if d.status != DuelStatus::Accepted {
                    return false;
                }
                d.status = DuelStatus::MonitoringHealth;
                d.window = Some(MonitoringWindow::starting_now(duration_minutes));
                d.first.progress = 0;
                d.second.progress = 0;
                true
            })
            .await?;

        if !claimed {
            // Lost a race or the duel is in the wrong state entirely.
            if updated.status == DuelStatus::MonitoringHealth {
                let window = existing_window(&updated)?;
                return Ok(Json(monitoring_response(&duel_id, &updated, &window)));
            }
            warn!(
                "[Handler] ❌ Monitoring rejected, duel is {}: duel_id={}",
                updated.status, duel_id
            );
            return Err(DuelError::UnexpectedDuelStatus {
                duel_id,
                actual: updated.status,
            });
        }

        let window = existing_window(&updated)?;
        self.metrics.monitoring_started.inc();
        info!(
            "[Handler] ✅ Monitoring started: duel_id={}, window=[{}, {}]",
            duel_id, window.start_ms, window.end_ms
        );
        publish_duel_event(
            self.notifier.as_ref(),
            &duel_id,
            EVENT_MONITORING_STARTED,
            MonitoringStartedPayload {
                window,
                challenge_metadata: updated.challenge.clone(),
                participants: vec![
                    address_hex(&updated.first.address),
                    address_hex(&updated.second.address),
                ],
            },
        )
        .await;

        Ok(Json(monitoring_response(&duel_id, &updated, &window)))
    }

    async fn complete_duel(
        &self,
        request: CompleteRequest,
    ) -> Result<Json<CompletionResponse>, DuelError> {
        let duel_id = request.duel_id.ok_or(DuelError::MissingField("duelId"))?;
        info!(
            "[Handler] 📥 Received completion request: duel_id={}",
            duel_id
        );
        let outcome = self.driver.complete_duel(&duel_id).await?;
        Ok(Json(CompletionResponse {
            duel_id,
            duel_status: outcome.duel_status,
            winner: outcome.winner,
            final_scores: outcome.final_scores,
        }))
    }

    async fn get_duel(&self, duel_id: String) -> Result<Json<Duel>, DuelError> {
        let duel = self
            .store
            .get(&duel_id)
            .await
            .ok_or(DuelError::DuelNotFound(duel_id))?;
        Ok(Json(duel))
    }
}

fn existing_window(duel: &Duel) -> Result<MonitoringWindow, DuelError> {
    duel.window.ok_or_else(|| {
        DuelError::InternalError(format!(
            "duel `{}` is monitoring but has no window recorded",
            duel.id
        ))
    })
}

fn monitoring_response(duel_id: &str, duel: &Duel, window: &MonitoringWindow) -> MonitoringResponse {
    MonitoringResponse {
        duel_id: duel_id.to_string(),
        challenge_metadata: duel.challenge.clone(),
        start_time: window.start_ms,
        end_time: window.end_ms,
        duration_minutes: window.duration_minutes,
    }
}
