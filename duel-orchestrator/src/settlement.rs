// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Completion and settlement driver.
//!
//! Runs for a duel whose monitoring window has elapsed, scores both
//! participants from their latest health samples and settles the escrowed
//! stakes for the winner. Safe to invoke repeatedly and concurrently: only
//! the invocation that claims the monitoring_health -> completed transition
//! produces side effects.

use crate::error::{DuelError, DuelResult};
use crate::escrow::{EscrowClient, EscrowContractInner};
use crate::health::HealthMetricReader;
use crate::metrics::DuelMetrics;
use crate::notifier::{publish_duel_event, RealtimeNotifier};
use crate::record_store::DuelRecordStore;
use crate::signer::SignerRegistry;
use crate::types::{
    address_hex, Duel, DuelCompletedPayload, DuelOutcome, DuelStatus, FinalScores,
    LedgerCallRecord, ParticipantSlot, DISPOSITION_SETTLEMENT_IN_PROGRESS,
    DISPOSITION_TIE_REFUNDED, EVENT_DUEL_COMPLETED,
};
use std::sync::Arc;
use tap::TapFallible;
use tracing::{debug, error, info, warn};

/// What the driver did (or found already done) for one duel.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub duel_status: DuelStatus,
    pub winner: Option<String>,
    pub final_scores: Option<FinalScores>,
}

impl CompletionOutcome {
    fn from_record(duel: &Duel) -> Self {
        let winner = duel
            .outcome
            .and_then(|o| o.winner())
            .map(|slot| address_hex(&duel.participant(slot).address));
        let final_scores = match (duel.first.final_score, duel.second.final_score) {
            (Some(first), Some(second)) => Some(FinalScores { first, second }),
            _ => None,
        };
        Self {
            duel_status: duel.status,
            winner,
            final_scores,
        }
    }
}

pub struct SettlementDriver<P> {
    store: Arc<DuelRecordStore>,
    escrow: Arc<EscrowClient<P>>,
    health: Arc<dyn HealthMetricReader>,
    notifier: Arc<dyn RealtimeNotifier>,
    signers: Arc<SignerRegistry>,
    metrics: Arc<DuelMetrics>,
}

impl<P> SettlementDriver<P>
where
    P: EscrowContractInner + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<DuelRecordStore>,
        escrow: Arc<EscrowClient<P>>,
        health: Arc<dyn HealthMetricReader>,
        notifier: Arc<dyn RealtimeNotifier>,
        signers: Arc<SignerRegistry>,
        metrics: Arc<DuelMetrics>,
    ) -> Self {
        Self {
            store,
            escrow,
            health,
            notifier,
            signers,
            metrics,
        }
    }

    /// Completes a duel: scores both participants, persists the outcome and
    /// settles the escrow when there is a winner. Invoked by the completion
    /// sweep and by the manual completion endpoint, possibly at the same time.
    pub async fn complete_duel(&self, duel_id: &str) -> DuelResult<CompletionOutcome> {
        let duel = self
            .store
            .get(duel_id)
            .await
            .ok_or_else(|| DuelError::DuelNotFound(duel_id.to_string()))?;

        // Not monitoring means there is nothing to drive: either another
        // invocation already completed the duel or it never got that far.
        if duel.status != DuelStatus::MonitoringHealth {
            debug!(
                "[Settlement] Duel is {}, nothing to complete: duel_id={}",
                duel.status, duel_id
            );
            return Ok(CompletionOutcome::from_record(&duel));
        }

        // Scores are read before claiming the transition so an unreachable
        // health platform leaves the duel monitoring and retryable.
        let metric_name = duel.challenge.metric_name.clone();
        let first_score = self.read_score(&duel, ParticipantSlot::First, &metric_name).await?;
        let second_score = self
            .read_score(&duel, ParticipantSlot::Second, &metric_name)
            .await?;

        let outcome = if first_score > second_score {
            DuelOutcome::Winner(ParticipantSlot::First)
        } else if second_score > first_score {
            DuelOutcome::Winner(ParticipantSlot::Second)
        } else {
            DuelOutcome::Tie
        };

        let (completed, claimed) = self
            .store
            .update_returning(duel_id, |d| {
                if d.status != DuelStatus::MonitoringHealth {
                    return false;
                }
                d.status = DuelStatus::Completed;
                d.first.final_score = Some(first_score);
                d.second.final_score = Some(second_score);
                d.outcome = Some(outcome);
                true
            })
            .await?;

        if !claimed {
            // Raced with another driver invocation that finished first.
            debug!(
                "[Settlement] Completion already claimed elsewhere: duel_id={}",
                duel_id
            );
            return Ok(CompletionOutcome::from_record(&completed));
        }

        info!(
            "[Settlement] Duel completed: duel_id={}, scores=({}, {}), outcome={:?}",
            duel_id, first_score, second_score, outcome
        );

        let disposition = match outcome.winner() {
            Some(winner_slot) => {
                self.settle_for_winner(duel_id, &completed, winner_slot).await;
                DISPOSITION_SETTLEMENT_IN_PROGRESS
            }
            None => DISPOSITION_TIE_REFUNDED,
        };
        let outcome_label = if outcome.winner().is_some() {
            "winner"
        } else {
            "tie"
        };
        self.metrics
            .duels_completed
            .with_label_values(&[outcome_label])
            .inc();

        let final_record = self.store.get(duel_id).await.unwrap_or(completed);
        publish_duel_event(
            self.notifier.as_ref(),
            duel_id,
            EVENT_DUEL_COMPLETED,
            DuelCompletedPayload {
                winner: outcome
                    .winner()
                    .map(|slot| address_hex(&final_record.participant(slot).address)),
                final_scores: FinalScores {
                    first: first_score,
                    second: second_score,
                },
                challenge_metadata: final_record.challenge.clone(),
                disposition_text: disposition.to_string(),
            },
        )
        .await;

        Ok(CompletionOutcome::from_record(&final_record))
    }

    async fn read_score(
        &self,
        duel: &Duel,
        slot: ParticipantSlot,
        metric_name: &str,
    ) -> DuelResult<u64> {
        let participant = duel.participant(slot).address;
        let sample = self
            .health
            .latest_sample(participant, &duel.id, metric_name)
            .await
            .tap_err(|e| {
                error!(
                    "[Settlement] Failed to read {} sample for {}: {:?}",
                    metric_name,
                    address_hex(&participant),
                    e
                )
            })?;
        // Never reported counts as zero progress, not as an error.
        Ok(sample.unwrap_or(0))
    }

    /// Submits the settlement call for a decided duel. Failures are recorded
    /// and swallowed: the duel stays completed without a settlement reference
    /// until reconciliation finds the matching ledger event or an operator
    /// steps in.
    async fn settle_for_winner(&self, duel_id: &str, duel: &Duel, winner_slot: ParticipantSlot) {
        if !duel.ledger_active {
            warn!(
                "[Settlement] ⚠️ Duel has a winner but was never ledger-active, skipping settlement: duel_id={}",
                duel_id
            );
            return;
        }
        let Some(numeric_id) = duel.numeric_id else {
            warn!(
                "[Settlement] ⚠️ Duel has no numeric id, skipping settlement: duel_id={}",
                duel_id
            );
            return;
        };

        let winner = duel.participant(winner_slot).address;
        let loser = duel.participant(winner_slot.other()).address;
        let signer = self.signers.service_signer();

        if let Err(e) = self
            .store
            .update(duel_id, |d| {
                d.settlement_call = Some(LedgerCallRecord::pending())
            })
            .await
        {
            warn!(
                "[Settlement] Failed to record settlement attempt: duel_id={}, error={:?}",
                duel_id, e
            );
        }

        match self
            .escrow
            .settle_duel(numeric_id, winner, loser, signer.as_ref())
            .await
        {
            Ok(tx_ref) => {
                info!(
                    "[Settlement] ✅ Settlement submitted: duel_id={}, winner={}, tx_ref={}",
                    duel_id,
                    address_hex(&winner),
                    tx_ref
                );
                if let Err(e) = self
                    .store
                    .update(duel_id, |d| {
                        d.settlement_tx_ref = Some(tx_ref.clone());
                        d.settlement_call = Some(LedgerCallRecord::confirmed(tx_ref.clone()));
                    })
                    .await
                {
                    warn!(
                        "[Settlement] Failed to record settlement reference: duel_id={}, error={:?}",
                        duel_id, e
                    );
                }
            }
            Err(e) => {
                // The duel stays completed without a settlement reference.
                warn!(
                    "[Settlement] ❌ Settlement call failed, duel left unsettled: duel_id={}, error={:?}",
                    duel_id, e
                );
                if let Err(e) = self
                    .store
                    .update(duel_id, |d| {
                        d.settlement_call = Some(LedgerCallRecord::failed())
                    })
                    .await
                {
                    warn!(
                        "[Settlement] Failed to record settlement failure: duel_id={}, error={:?}",
                        duel_id, e
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{decode_signed_payload, init_test_logging, HandlerFixture};
    use crate::types::LedgerCallStatus;
    use ethers::abi::{decode as abi_decode, ParamType, Token};
    use ethers::types::TxHash;

    fn settle_call_args(raw: &[u8]) -> (u64, ethers::types::Address, ethers::types::Address) {
        let (_, data, _) = decode_signed_payload(raw);
        let tokens = abi_decode(
            &[ParamType::Uint(64), ParamType::Address, ParamType::Address],
            &data[4..],
        )
        .unwrap();
        let numeric_id = match &tokens[0] {
            Token::Uint(v) => v.as_u64(),
            other => panic!("unexpected token {:?}", other),
        };
        let winner = match &tokens[1] {
            Token::Address(a) => *a,
            other => panic!("unexpected token {:?}", other),
        };
        let loser = match &tokens[2] {
            Token::Address(a) => *a,
            other => panic!("unexpected token {:?}", other),
        };
        (numeric_id, winner, loser)
    }

    #[tokio::test]
    async fn test_driver_is_noop_outside_monitoring() {
        init_test_logging();
        let fixture = HandlerFixture::new().await;
        fixture.insert_waiting_duel("duel-1", None).await;
        let before = fixture.store.get("duel-1").await.unwrap();

        let outcome = fixture.driver.complete_duel("duel-1").await.unwrap();
        assert_eq!(outcome.duel_status, DuelStatus::WaitingForStakes);
        assert_eq!(outcome.winner, None);
        assert_eq!(outcome.final_scores, None);

        // no mutation, no event, no ledger call
        assert_eq!(fixture.store.get("duel-1").await.unwrap(), before);
        assert!(fixture.notifier.published_events().is_empty());
        assert!(fixture.ledger.submitted_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_higher_score_wins_and_settles() {
        init_test_logging();
        let fixture = HandlerFixture::new().await;
        fixture.insert_monitoring_duel("duel-1", 0).await;
        fixture
            .health
            .set_sample(fixture.first_address(), "duel-1", "steps", 12_000);
        fixture
            .health
            .set_sample(fixture.second_address(), "duel-1", "steps", 9_000);
        fixture
            .ledger
            .queue_confirmed_submission(TxHash::from([0xB1; 32]));

        let outcome = fixture.driver.complete_duel("duel-1").await.unwrap();
        assert_eq!(outcome.duel_status, DuelStatus::Completed);
        assert_eq!(
            outcome.winner.as_deref(),
            Some(address_hex(&fixture.first_address()).as_str())
        );
        let scores = outcome.final_scores.unwrap();
        assert_eq!((scores.first, scores.second), (12_000, 9_000));

        let duel = fixture.store.get("duel-1").await.unwrap();
        assert_eq!(duel.status, DuelStatus::Completed);
        assert_eq!(duel.outcome, Some(DuelOutcome::Winner(ParticipantSlot::First)));
        assert_eq!(duel.first.final_score, Some(12_000));
        assert_eq!(duel.second.final_score, Some(9_000));
        assert!(duel.settlement_tx_ref.is_some());
        assert_eq!(
            duel.settlement_call.unwrap().status,
            LedgerCallStatus::Confirmed
        );

        // settle(numericId, winner, loser) with the winner first
        let submitted = fixture.ledger.submitted_transactions();
        assert_eq!(submitted.len(), 1);
        let (numeric_id, winner, loser) = settle_call_args(&submitted[0]);
        assert_eq!(numeric_id, duel.numeric_id.unwrap());
        assert_eq!(winner, fixture.first_address());
        assert_eq!(loser, fixture.second_address());

        let events = fixture.notifier.events_named(EVENT_DUEL_COMPLETED);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["dispositionText"], DISPOSITION_SETTLEMENT_IN_PROGRESS);
        assert_eq!(events[0]["finalScores"]["first"], 12_000);
    }

    #[tokio::test]
    async fn test_driver_runs_once_under_double_fire() {
        init_test_logging();
        let fixture = HandlerFixture::new().await;
        fixture.insert_monitoring_duel("duel-1", 0).await;
        fixture
            .health
            .set_sample(fixture.first_address(), "duel-1", "steps", 5_000);
        fixture
            .health
            .set_sample(fixture.second_address(), "duel-1", "steps", 4_000);
        fixture
            .ledger
            .queue_confirmed_submission(TxHash::from([0xB1; 32]));

        let first_run = fixture.driver.complete_duel("duel-1").await.unwrap();
        let second_run = fixture.driver.complete_duel("duel-1").await.unwrap();
        assert_eq!(first_run.duel_status, DuelStatus::Completed);
        assert_eq!(second_run.duel_status, DuelStatus::Completed);
        assert_eq!(second_run.winner, first_run.winner);

        // one settlement, one completion event
        assert_eq!(fixture.ledger.submitted_transactions().len(), 1);
        assert_eq!(fixture.notifier.events_named(EVENT_DUEL_COMPLETED).len(), 1);
    }

    #[tokio::test]
    async fn test_tie_completes_without_settlement() {
        init_test_logging();
        let fixture = HandlerFixture::new().await;
        fixture.insert_monitoring_duel("duel-1", 0).await;
        fixture
            .health
            .set_sample(fixture.first_address(), "duel-1", "steps", 7_500);
        fixture
            .health
            .set_sample(fixture.second_address(), "duel-1", "steps", 7_500);

        let outcome = fixture.driver.complete_duel("duel-1").await.unwrap();
        assert_eq!(outcome.duel_status, DuelStatus::Completed);
        assert_eq!(outcome.winner, None);

        let duel = fixture.store.get("duel-1").await.unwrap();
        assert_eq!(duel.outcome, Some(DuelOutcome::Tie));
        assert!(duel.settlement_call.is_none());
        assert!(fixture.ledger.submitted_transactions().is_empty());

        let events = fixture.notifier.events_named(EVENT_DUEL_COMPLETED);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["winner"], serde_json::Value::Null);
        assert_eq!(events[0]["dispositionText"], DISPOSITION_TIE_REFUNDED);
    }

    #[tokio::test]
    async fn test_missing_sample_counts_as_zero() {
        init_test_logging();
        let fixture = HandlerFixture::new().await;
        fixture.insert_monitoring_duel("duel-1", 0).await;
        fixture
            .health
            .set_sample(fixture.second_address(), "duel-1", "steps", 100);
        fixture
            .ledger
            .queue_confirmed_submission(TxHash::from([0xB2; 32]));

        let outcome = fixture.driver.complete_duel("duel-1").await.unwrap();
        let scores = outcome.final_scores.unwrap();
        assert_eq!((scores.first, scores.second), (0, 100));
        assert_eq!(
            outcome.winner.as_deref(),
            Some(address_hex(&fixture.second_address()).as_str())
        );
    }

    #[tokio::test]
    async fn test_settlement_failure_is_swallowed() {
        init_test_logging();
        let fixture = HandlerFixture::new().await;
        fixture.insert_monitoring_duel("duel-1", 0).await;
        fixture
            .health
            .set_sample(fixture.first_address(), "duel-1", "steps", 10);
        fixture
            .ledger
            .queue_submission_response(Err("gas estimation failed".to_string()));

        // the duel still completes, the failure is only recorded
        let outcome = fixture.driver.complete_duel("duel-1").await.unwrap();
        assert_eq!(outcome.duel_status, DuelStatus::Completed);
        assert!(outcome.winner.is_some());

        let duel = fixture.store.get("duel-1").await.unwrap();
        assert_eq!(duel.status, DuelStatus::Completed);
        assert_eq!(duel.settlement_tx_ref, None);
        assert_eq!(duel.settlement_call.unwrap().status, LedgerCallStatus::Failed);

        // the completion event still goes out
        assert_eq!(fixture.notifier.events_named(EVENT_DUEL_COMPLETED).len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_inactive_duel_skips_settlement() {
        init_test_logging();
        let fixture = HandlerFixture::new().await;
        fixture.insert_monitoring_duel("duel-1", 0).await;
        fixture
            .store
            .update("duel-1", |d| d.ledger_active = false)
            .await
            .unwrap();
        fixture
            .health
            .set_sample(fixture.first_address(), "duel-1", "steps", 10);

        let outcome = fixture.driver.complete_duel("duel-1").await.unwrap();
        assert_eq!(outcome.duel_status, DuelStatus::Completed);
        assert!(fixture.ledger.submitted_transactions().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_health_platform_leaves_duel_monitoring() {
        init_test_logging();
        let fixture = HandlerFixture::new().await;
        fixture.insert_monitoring_duel("duel-1", 0).await;
        fixture.health.fail_next_read("health platform down");

        let err = fixture.driver.complete_duel("duel-1").await.unwrap_err();
        assert!(matches!(err, DuelError::InternalError(_)));

        // still monitoring, retryable by the next sweep
        let duel = fixture.store.get("duel-1").await.unwrap();
        assert_eq!(duel.status, DuelStatus::MonitoringHealth);
        assert!(fixture.notifier.published_events().is_empty());
    }
}
