// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation between the record store and the escrow ledger.
//!
//! No transaction spans the two systems, so a crash or a dropped RPC
//! response can leave a duel record claiming a ledger call is pending or
//! failed when the call in fact landed. The reconciler collects escrow
//! contract events as they are observed and periodically resolves every
//! unresolved ledger-call record against that evidence, falling back to
//! direct ledger reads where no event was captured. It never re-submits
//! anything: resolution is evidence-based only.

use crate::escrow::{EscrowClient, EscrowContractEvent, EscrowContractInner};
use crate::metrics::DuelMetrics;
use crate::notifier::{publish_duel_event, RealtimeNotifier};
use crate::record_store::DuelRecordStore;
use crate::sweeper::Observable;
use crate::types::{
    address_hex, Duel, DuelBecameActivePayload, DuelStatus, LedgerCallRecord, ParticipantSlot,
    StakeState, StakeStatuses, EVENT_DUEL_BECAME_ACTIVE,
};
use async_trait::async_trait;
use ethers::types::Address as EthAddress;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Escrow events seen on the ledger, keyed so one lookup answers "did this
/// call land". Entries are consumed when applied to a record.
#[derive(Default)]
struct ObservedLedgerEvents {
    stakes: HashMap<(u64, EthAddress), String>,
    settlements: HashMap<u64, (EthAddress, EthAddress, String)>,
    refunds: HashMap<(u64, EthAddress), String>,
}

pub struct LedgerReconciler<P> {
    store: Arc<DuelRecordStore>,
    escrow: Arc<EscrowClient<P>>,
    notifier: Arc<dyn RealtimeNotifier>,
    metrics: Arc<DuelMetrics>,
    observed: RwLock<ObservedLedgerEvents>,
    reconcile_interval: Duration,
}

fn unresolved(record: &Option<LedgerCallRecord>) -> bool {
    matches!(record, Some(r) if !r.is_resolved())
}

impl<P> LedgerReconciler<P>
where
    P: EscrowContractInner + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<DuelRecordStore>,
        escrow: Arc<EscrowClient<P>>,
        notifier: Arc<dyn RealtimeNotifier>,
        metrics: Arc<DuelMetrics>,
        reconcile_interval: Duration,
    ) -> Self {
        Self {
            store,
            escrow,
            notifier,
            metrics,
            observed: RwLock::new(ObservedLedgerEvents::default()),
            reconcile_interval,
        }
    }

    /// Feeds the reconciler from the escrow event subscription until the
    /// stream closes or the token fires.
    pub fn run_event_sink(
        self: Arc<Self>,
        mut events_rx: mpsc::Receiver<EscrowContractEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("[Reconciler] Escrow event sink started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[Reconciler] Escrow event sink shutting down");
                        return;
                    }
                    maybe_event = events_rx.recv() => {
                        match maybe_event {
                            Some(event) => self.record_event(event).await,
                            None => {
                                info!("[Reconciler] Escrow event stream closed");
                                return;
                            }
                        }
                    }
                }
            }
        })
    }

    pub async fn record_event(&self, event: EscrowContractEvent) {
        debug!("[Reconciler] 📥 Observed ledger event: {:?}", event);
        let mut observed = self.observed.write().await;
        match event {
            EscrowContractEvent::StakePlaced {
                numeric_id,
                staker,
                tx_ref,
                ..
            } => {
                observed.stakes.insert((numeric_id, staker), tx_ref);
            }
            EscrowContractEvent::DuelSettled {
                numeric_id,
                winner,
                loser,
                tx_ref,
                ..
            } => {
                observed.settlements.insert(numeric_id, (winner, loser, tx_ref));
            }
            EscrowContractEvent::StakeRefunded {
                numeric_id,
                user,
                tx_ref,
                ..
            } => {
                observed.refunds.insert((numeric_id, user), tx_ref);
            }
        }
    }

    /// One reconciliation pass over every record with unresolved ledger
    /// calls. Returns how many call records were resolved.
    pub async fn reconcile_once(&self) -> usize {
        let mut resolved = 0;
        for duel in self.store.list_unresolved_ledger_calls().await {
            let Some(numeric_id) = duel.numeric_id else {
                // Ledger calls are only made once a numeric id exists.
                debug!(
                    "[Reconciler] Unresolved calls but no numeric id: duel_id={}",
                    duel.id
                );
                continue;
            };
            resolved += self.reconcile_stakes(&duel, numeric_id).await;
            resolved += self.reconcile_settlement(&duel, numeric_id).await;
            resolved += self.reconcile_refunds(&duel, numeric_id).await;
        }
        if resolved > 0 {
            info!("[Reconciler] ✅ Resolved {} ledger call(s)", resolved);
        }
        resolved
    }

    async fn reconcile_stakes(&self, duel: &Duel, numeric_id: u64) -> usize {
        let mut resolved = 0;
        for slot in [ParticipantSlot::First, ParticipantSlot::Second] {
            let participant = duel.participant(slot);
            if !unresolved(&participant.stake_call) {
                continue;
            }

            let event_ref = self
                .observed
                .write()
                .await
                .stakes
                .remove(&(numeric_id, participant.address));
            let record = match event_ref {
                Some(tx_ref) => LedgerCallRecord::confirmed(tx_ref),
                None => {
                    // No event captured; the escrowed balance itself is
                    // just as conclusive.
                    match self.escrow.get_stake(numeric_id, participant.address).await {
                        Ok(balance) if !balance.is_zero() => {
                            LedgerCallRecord::confirmed_unreferenced()
                        }
                        Ok(_) => continue,
                        Err(e) => {
                            warn!(
                                "[Reconciler] Stake lookup failed: duel_id={}, error={:?}",
                                duel.id, e
                            );
                            continue;
                        }
                    }
                }
            };

            let tx_ref = record.tx_ref.clone();
            let update = self
                .store
                .update(&duel.id, |d| {
                    let p = d.participant_mut(slot);
                    p.stake_state = StakeState::Staked;
                    if p.stake_tx_ref.is_none() {
                        p.stake_tx_ref = tx_ref.clone();
                    }
                    p.stake_call = Some(record.clone());
                })
                .await;
            if let Err(e) = update {
                warn!(
                    "[Reconciler] Failed to persist stake resolution: duel_id={}, error={:?}",
                    duel.id, e
                );
                continue;
            }

            info!(
                "[Reconciler] ✅ Stake confirmed from ledger evidence: duel_id={}, participant={}",
                duel.id,
                address_hex(&participant.address)
            );
            self.metrics
                .reconciler_resolved
                .with_label_values(&["stake"])
                .inc();
            resolved += 1;
            self.maybe_activate(&duel.id, numeric_id).await;
        }
        resolved
    }

    async fn reconcile_settlement(&self, duel: &Duel, numeric_id: u64) -> usize {
        if !unresolved(&duel.settlement_call) {
            return 0;
        }

        let event = self.observed.write().await.settlements.remove(&numeric_id);
        let record = match event {
            Some((winner, _loser, tx_ref)) => {
                let recorded_winner = duel
                    .outcome
                    .and_then(|o| o.winner())
                    .map(|slot| duel.participant(slot).address);
                if recorded_winner != Some(winner) {
                    warn!(
                        "[Reconciler] ⚠️ Settled winner on ledger differs from record: duel_id={}, ledger_winner={}",
                        duel.id,
                        address_hex(&winner)
                    );
                }
                LedgerCallRecord::confirmed(tx_ref)
            }
            None => {
                // A ledger-active duel keeps both stakes escrowed until
                // settlement pays them out; an empty combined balance means
                // the settlement landed even though we never saw it confirm.
                if !duel.ledger_active || duel.status != DuelStatus::Completed {
                    return 0;
                }
                match self
                    .escrow
                    .get_combined_stake(numeric_id, duel.first.address, duel.second.address)
                    .await
                {
                    Ok(balance) if balance.is_zero() => {
                        LedgerCallRecord::confirmed_unreferenced()
                    }
                    Ok(_) => return 0,
                    Err(e) => {
                        warn!(
                            "[Reconciler] Combined stake lookup failed: duel_id={}, error={:?}",
                            duel.id, e
                        );
                        return 0;
                    }
                }
            }
        };

        let tx_ref = record.tx_ref.clone();
        let update = self
            .store
            .update(&duel.id, |d| {
                if d.settlement_tx_ref.is_none() {
                    d.settlement_tx_ref = tx_ref.clone();
                }
                d.settlement_call = Some(record.clone());
            })
            .await;
        if let Err(e) = update {
            warn!(
                "[Reconciler] Failed to persist settlement resolution: duel_id={}, error={:?}",
                duel.id, e
            );
            return 0;
        }

        info!(
            "[Reconciler] ✅ Settlement confirmed from ledger evidence: duel_id={}",
            duel.id
        );
        self.metrics
            .reconciler_resolved
            .with_label_values(&["settlement"])
            .inc();
        1
    }

    async fn reconcile_refunds(&self, duel: &Duel, numeric_id: u64) -> usize {
        let mut resolved = 0;
        for slot in [ParticipantSlot::First, ParticipantSlot::Second] {
            let participant = duel.participant(slot);
            if !unresolved(&participant.refund_call) {
                continue;
            }
            let Some(tx_ref) = self
                .observed
                .write()
                .await
                .refunds
                .remove(&(numeric_id, participant.address))
            else {
                continue;
            };

            let update = self
                .store
                .update(&duel.id, |d| {
                    d.participant_mut(slot).refund_call =
                        Some(LedgerCallRecord::confirmed(tx_ref.clone()));
                })
                .await;
            if let Err(e) = update {
                warn!(
                    "[Reconciler] Failed to persist refund resolution: duel_id={}, error={:?}",
                    duel.id, e
                );
                continue;
            }

            info!(
                "[Reconciler] ✅ Refund confirmed from ledger evidence: duel_id={}, participant={}",
                duel.id,
                address_hex(&participant.address)
            );
            self.metrics
                .reconciler_resolved
                .with_label_values(&["refund"])
                .inc();
            resolved += 1;
        }
        resolved
    }

    /// A stake promoted by reconciliation can be the one that makes the duel
    /// fully staked; activation then follows the same claimed transition the
    /// request path uses.
    async fn maybe_activate(&self, duel_id: &str, numeric_id: u64) {
        let Some(duel) = self.store.get(duel_id).await else {
            return;
        };
        if !duel.both_staked() || duel.status != DuelStatus::WaitingForStakes {
            return;
        }

        let claimed = match self
            .store
            .transition_status(duel_id, DuelStatus::WaitingForStakes, DuelStatus::Accepted)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(
                    "[Reconciler] Activation transition failed: duel_id={}, error={:?}",
                    duel_id, e
                );
                return;
            }
        };
        if !claimed {
            return;
        }

        let activated = match self
            .store
            .update(duel_id, |d| {
                d.ledger_active = true;
                d.staking_deadline_ms = None;
            })
            .await
        {
            Ok(activated) => activated,
            Err(e) => {
                warn!(
                    "[Reconciler] Failed to mark duel ledger-active: duel_id={}, error={:?}",
                    duel_id, e
                );
                return;
            }
        };

        self.metrics.duels_activated.inc();
        info!(
            "[Reconciler] ✅ Duel activated from reconciled stakes: duel_id={}",
            duel_id
        );
        publish_duel_event(
            self.notifier.as_ref(),
            duel_id,
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
}

#[async_trait]
impl<P> Observable for LedgerReconciler<P>
where
    P: EscrowContractInner + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        "LedgerReconciler"
    }

    async fn observe_and_report(&self) {
        self.reconcile_once().await;
    }

    fn interval(&self) -> Duration {
        self.reconcile_interval
    }
}

// The event sink holds the reconciler behind an Arc, and the sweep service
// must observe that same instance to see the events it records.
#[async_trait]
impl<P> Observable for Arc<LedgerReconciler<P>>
where
    P: EscrowContractInner + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.as_ref().name()
    }

    async fn observe_and_report(&self) {
        self.as_ref().observe_and_report().await
    }

    fn interval(&self) -> Duration {
        self.as_ref().interval()
    }
}
