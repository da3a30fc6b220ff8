// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Periodic sweeps over the duel record store.
//!
//! Deadlines live on the persisted records, not in process memory: a restart
//! loses no scheduled work because every sweep re-derives what is due from
//! the store. The StakingDeadlineSweep cancels and refunds duels whose
//! staking window ran out, the MonitoringCompletionSweep drives the
//! settlement of duels whose monitoring window has elapsed.

use crate::escrow::{EscrowClient, EscrowContractInner};
use crate::metrics::DuelMetrics;
use crate::notifier::{publish_duel_event, RealtimeNotifier};
use crate::record_store::DuelRecordStore;
use crate::settlement::SettlementDriver;
use crate::signer::SignerRegistry;
use crate::types::{
    address_hex, now_ms, Duel, DuelCancelledPayload, DuelStatus, LedgerCallRecord,
    ParticipantSlot, DISPOSITION_STAKING_TIMED_OUT, EVENT_DUEL_CANCELLED,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[async_trait]
pub trait Observable {
    fn name(&self) -> &str;
    async fn observe_and_report(&self);
    fn interval(&self) -> Duration;
}

/// Runs each registered observable on its own interval until cancelled.
pub struct SweepService {
    observables: Vec<Box<dyn Observable + Send + Sync>>,
    metrics: Arc<DuelMetrics>,
}

impl SweepService {
    pub fn new(
        observables: Vec<Box<dyn Observable + Send + Sync>>,
        metrics: Arc<DuelMetrics>,
    ) -> Self {
        Self {
            observables,
            metrics,
        }
    }

    pub fn run(self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![];
        for observable in self.observables.into_iter() {
            let metrics = self.metrics.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = interval(observable.interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                info!("[SweepService] Started sweep task: {}", observable.name());
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            info!(
                                "[SweepService] Sweep task shutting down: {}",
                                observable.name()
                            );
                            return;
                        }
                        _ = ticker.tick() => {
                            metrics
                                .sweep_runs
                                .with_label_values(&[observable.name()])
                                .inc();
                            observable.observe_and_report().await;
                        }
                    }
                }
            }));
        }
        handles
    }
}

/// Cancels duels whose staking deadline passed while still waiting for
/// stakes, and refunds whichever participants already escrowed value.
pub struct StakingDeadlineSweep<P> {
    store: Arc<DuelRecordStore>,
    escrow: Arc<EscrowClient<P>>,
    signers: Arc<SignerRegistry>,
    notifier: Arc<dyn RealtimeNotifier>,
    metrics: Arc<DuelMetrics>,
    sweep_interval: Duration,
}

impl<P> StakingDeadlineSweep<P>
where
    P: EscrowContractInner + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<DuelRecordStore>,
        escrow: Arc<EscrowClient<P>>,
        signers: Arc<SignerRegistry>,
        notifier: Arc<dyn RealtimeNotifier>,
        metrics: Arc<DuelMetrics>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            store,
            escrow,
            signers,
            notifier,
            metrics,
            sweep_interval,
        }
    }

    async fn cancel_duel(&self, duel: &Duel) {
        // Claim the transition first. Losing the claim means a stake request
        // activated the duel between our read and now.
        let claimed = match self
            .store
            .transition_status(
                &duel.id,
                DuelStatus::WaitingForStakes,
                DuelStatus::CancelledTimeout,
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(
                    "[DeadlineSweep] Failed to cancel duel: duel_id={}, error={:?}",
                    duel.id, e
                );
                return;
            }
        };
        if !claimed {
            return;
        }

        self.metrics.duels_cancelled.inc();
        info!(
            "[DeadlineSweep] ⏰ Staking deadline passed, duel cancelled: duel_id={}",
            duel.id
        );
        publish_duel_event(
            self.notifier.as_ref(),
            &duel.id,
            EVENT_DUEL_CANCELLED,
            DuelCancelledPayload {
                status: DuelStatus::CancelledTimeout,
                disposition_text: DISPOSITION_STAKING_TIMED_OUT.to_string(),
            },
        )
        .await;

        for slot in [ParticipantSlot::First, ParticipantSlot::Second] {
            if duel.participant(slot).is_staked() {
                self.refund_participant(duel, slot).await;
            }
        }
    }

    async fn refund_participant(&self, duel: &Duel, slot: ParticipantSlot) {
        let user = duel.participant(slot).address;
        let Some(numeric_id) = duel.numeric_id else {
            // A staked participant without a numeric id should not exist.
            warn!(
                "[DeadlineSweep] Staked duel has no numeric id, cannot refund: duel_id={}",
                duel.id
            );
            return;
        };

        if let Err(e) = self
            .store
            .update(&duel.id, |d| {
                d.participant_mut(slot).refund_call = Some(LedgerCallRecord::pending())
            })
            .await
        {
            warn!(
                "[DeadlineSweep] Failed to record refund attempt: duel_id={}, error={:?}",
                duel.id, e
            );
        }

        let signer = self.signers.service_signer();
        match self
            .escrow
            .refund_stake(numeric_id, user, signer.as_ref())
            .await
        {
            Ok(tx_ref) => {
                self.metrics.refunds_issued.inc();
                info!(
                    "[DeadlineSweep] ✅ Stake refunded: duel_id={}, user={}, tx_ref={}",
                    duel.id,
                    address_hex(&user),
                    tx_ref
                );
                if let Err(e) = self
                    .store
                    .update(&duel.id, |d| {
                        d.participant_mut(slot).refund_call =
                            Some(LedgerCallRecord::confirmed(tx_ref.clone()))
                    })
                    .await
                {
                    warn!(
                        "[DeadlineSweep] Failed to record refund: duel_id={}, error={:?}",
                        duel.id, e
                    );
                }
            }
            Err(e) => {
                warn!(
                    "[DeadlineSweep] ❌ Refund failed, left for reconciliation: duel_id={}, user={}, error={:?}",
                    duel.id,
                    address_hex(&user),
                    e
                );
                if let Err(e) = self
                    .store
                    .update(&duel.id, |d| {
                        d.participant_mut(slot).refund_call = Some(LedgerCallRecord::failed())
                    })
                    .await
                {
                    warn!(
                        "[DeadlineSweep] Failed to record refund failure: duel_id={}, error={:?}",
                        duel.id, e
                    );
                }
            }
        }
    }
}

#[async_trait]
impl<P> Observable for StakingDeadlineSweep<P>
where
    P: EscrowContractInner + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "StakingDeadlineSweep"
    }

    async fn observe_and_report(&self) {
        let now = now_ms();
        for duel in self.store.list_status(DuelStatus::WaitingForStakes).await {
            if duel.staking_deadline_elapsed(now) {
                self.cancel_duel(&duel).await;
            }
        }
    }

    fn interval(&self) -> Duration {
        self.sweep_interval
    }
}

/// Completes duels whose monitoring window has elapsed. The driver's own
/// guard makes it harmless to race a manual completion request.
pub struct MonitoringCompletionSweep<P> {
    store: Arc<DuelRecordStore>,
    driver: Arc<SettlementDriver<P>>,
    sweep_interval: Duration,
}

impl<P> MonitoringCompletionSweep<P>
where
    P: EscrowContractInner + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<DuelRecordStore>,
        driver: Arc<SettlementDriver<P>>,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            store,
            driver,
            sweep_interval,
        }
    }
}

#[async_trait]
impl<P> Observable for MonitoringCompletionSweep<P>
where
    P: EscrowContractInner + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "MonitoringCompletionSweep"
    }

    async fn observe_and_report(&self) {
        let now = now_ms();
        for duel in self.store.list_status(DuelStatus::MonitoringHealth).await {
            let elapsed = match &duel.window {
                Some(window) => window.is_elapsed(now),
                None => {
                    warn!(
                        "[CompletionSweep] Monitoring duel has no window: duel_id={}",
                        duel.id
                    );
                    false
                }
            };
            if !elapsed {
                continue;
            }
            if let Err(e) = self.driver.complete_duel(&duel.id).await {
                warn!(
                    "[CompletionSweep] Completion failed, will retry next sweep: duel_id={}, error={:?}",
                    duel.id, e
                );
            }
        }
    }

    fn interval(&self) -> Duration {
        self.sweep_interval
    }
}
