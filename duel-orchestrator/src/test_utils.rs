// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Programmable fakes and fixtures shared by the unit tests.

use crate::error::{DuelError, DuelResult};
use crate::escrow::{EscrowClient, EscrowContractEvent, EscrowContractInner};
use crate::health::HealthMetricReader;
use crate::metrics::DuelMetrics;
use crate::notifier::RealtimeNotifier;
use crate::record_store::DuelRecordStore;
use crate::reconciler::LedgerReconciler;
use crate::server::handler::DuelRequestHandler;
use crate::settlement::SettlementDriver;
use crate::signer::{FileKeySigner, SignerRegistry, TransactionSigner};
use crate::sweeper::{MonitoringCompletionSweep, StakingDeadlineSweep};
use crate::types::{
    ChallengeMetadata, Duel, DuelStatus, LedgerCallRecord, MonitoringWindow, StakeState,
};
use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address as EthAddress, Bytes, TxHash, U256};
use ethers::utils::rlp::Rlp;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::Duration;

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug)]
pub struct MockLedgerError(pub String);

impl std::fmt::Display for MockLedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mock ledger error: {}", self.0)
    }
}

impl std::error::Error for MockLedgerError {}

#[derive(Default)]
struct MockLedgerState {
    submission_queue: VecDeque<Result<TxHash, String>>,
    transaction_statuses: HashMap<TxHash, Option<bool>>,
    submitted: Vec<Bytes>,
    nonce: u64,
    stake_balances: HashMap<(u64, EthAddress), U256>,
    combined_stakes: HashMap<u64, U256>,
    event_batches: VecDeque<(Vec<EscrowContractEvent>, u64)>,
    fetch_cursors: Vec<u64>,
}

/// In-memory stand-in for the escrow contract. Every response is
/// programmable and every submission is recorded for assertions.
#[derive(Clone, Default)]
pub struct MockEscrowLedger {
    state: Arc<Mutex<MockLedgerState>>,
}

impl MockEscrowLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue_submission_response(&self, response: Result<TxHash, String>) {
        self.state
            .lock()
            .unwrap()
            .submission_queue
            .push_back(response);
    }

    /// Queue a submission that also confirms on the first status poll.
    pub fn queue_confirmed_submission(&self, tx_hash: TxHash) {
        let mut state = self.state.lock().unwrap();
        state.submission_queue.push_back(Ok(tx_hash));
        state.transaction_statuses.insert(tx_hash, Some(true));
    }

    pub fn set_transaction_status(&self, tx_hash: TxHash, status: Option<bool>) {
        self.state
            .lock()
            .unwrap()
            .transaction_statuses
            .insert(tx_hash, status);
    }

    pub fn submitted_transactions(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().submitted.clone()
    }

    pub fn set_stake_balance(&self, numeric_id: u64, staker: EthAddress, balance: U256) {
        self.state
            .lock()
            .unwrap()
            .stake_balances
            .insert((numeric_id, staker), balance);
    }

    pub fn set_combined_stake(&self, numeric_id: u64, balance: U256) {
        self.state
            .lock()
            .unwrap()
            .combined_stakes
            .insert(numeric_id, balance);
    }

    pub fn queue_events_batch(&self, events: Vec<EscrowContractEvent>, next_cursor: u64) {
        self.state
            .lock()
            .unwrap()
            .event_batches
            .push_back((events, next_cursor));
    }

    /// Every `from_block` passed to fetch_escrow_events, in call order.
    pub fn fetch_cursors(&self) -> Vec<u64> {
        self.state.lock().unwrap().fetch_cursors.clone()
    }
}

#[async_trait]
impl EscrowContractInner for MockEscrowLedger {
    type Error = MockLedgerError;

    fn contract_address(&self) -> EthAddress {
        EthAddress::from([0xEC; 20])
    }

    async fn submit_signed_transaction(&self, raw: Bytes) -> Result<TxHash, Self::Error> {
        let mut state = self.state.lock().unwrap();
        state.submitted.push(raw);
        match state.submission_queue.pop_front() {
            Some(Ok(tx_hash)) => Ok(tx_hash),
            Some(Err(message)) => Err(MockLedgerError(message)),
            None => Err(MockLedgerError(
                "no submission response queued".to_string(),
            )),
        }
    }

    async fn transaction_status(&self, tx_hash: TxHash) -> Result<Option<bool>, Self::Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .transaction_statuses
            .get(&tx_hash)
            .copied()
            .flatten())
    }

    async fn next_nonce(&self, _address: EthAddress) -> Result<U256, Self::Error> {
        let mut state = self.state.lock().unwrap();
        let nonce = state.nonce;
        state.nonce += 1;
        Ok(U256::from(nonce))
    }

    async fn gas_price(&self) -> Result<U256, Self::Error> {
        Ok(U256::from(1_000_000_000u64))
    }

    async fn get_stake(&self, numeric_id: u64, staker: EthAddress) -> Result<U256, Self::Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .stake_balances
            .get(&(numeric_id, staker))
            .copied()
            .unwrap_or_default())
    }

    async fn get_combined_stake(
        &self,
        numeric_id: u64,
        _first: EthAddress,
        _second: EthAddress,
    ) -> Result<U256, Self::Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .combined_stakes
            .get(&numeric_id)
            .copied()
            .unwrap_or_default())
    }

    async fn get_owner(&self) -> Result<EthAddress, Self::Error> {
        Ok(EthAddress::from([0x0E; 20]))
    }

    async fn get_platform_account(&self) -> Result<EthAddress, Self::Error> {
        Ok(EthAddress::from([0x0F; 20]))
    }

    async fn fetch_escrow_events(
        &self,
        from_block: u64,
    ) -> Result<(Vec<EscrowContractEvent>, u64), Self::Error> {
        let mut state = self.state.lock().unwrap();
        state.fetch_cursors.push(from_block);
        Ok(state
            .event_batches
            .pop_front()
            .unwrap_or((vec![], from_block)))
    }
}

/// Signer over a throwaway key.
pub struct TestSigner {
    wallet: LocalWallet,
}

impl TestSigner {
    pub fn random() -> Self {
        Self {
            wallet: LocalWallet::new(&mut rand::thread_rng()).with_chain_id(31337u64),
        }
    }
}

#[async_trait]
impl TransactionSigner for TestSigner {
    fn address(&self) -> EthAddress {
        self.wallet.address()
    }

    async fn sign_transaction(&self, tx: &TypedTransaction) -> DuelResult<Bytes> {
        let signature = self
            .wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| DuelError::SignerUnavailable(format!("signing failed: {}", e)))?;
        Ok(tx.rlp_signed(&signature))
    }
}

/// Notifier that records every published event instead of delivering it.
#[derive(Debug, Default)]
pub struct CapturingNotifier {
    events: Mutex<Vec<(String, String, serde_json::Value)>>,
}

impl CapturingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published_events(&self) -> Vec<(String, String, serde_json::Value)> {
        self.events.lock().unwrap().clone()
    }

    /// Payloads of every published event with the given name.
    pub fn events_named(&self, name: &str) -> Vec<serde_json::Value> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, event, _)| event == name)
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl RealtimeNotifier for CapturingNotifier {
    fn is_configured(&self) -> bool {
        true
    }

    async fn publish(&self, channel: &str, event: &str, payload: serde_json::Value) {
        self.events
            .lock()
            .unwrap()
            .push((channel.to_string(), event.to_string(), payload));
    }
}

/// Health reader answering from a fixed sample table.
#[derive(Default)]
pub struct StaticHealthReader {
    samples: Mutex<HashMap<(EthAddress, String, String), u64>>,
    fail_next: Mutex<Option<String>>,
}

impl StaticHealthReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sample(&self, participant: EthAddress, duel_id: &str, metric: &str, value: u64) {
        self.samples.lock().unwrap().insert(
            (participant, duel_id.to_string(), metric.to_string()),
            value,
        );
    }

    pub fn fail_next_read(&self, reason: &str) {
        *self.fail_next.lock().unwrap() = Some(reason.to_string());
    }
}

#[async_trait]
impl HealthMetricReader for StaticHealthReader {
    async fn latest_sample(
        &self,
        participant: EthAddress,
        duel_id: &str,
        metric_name: &str,
    ) -> DuelResult<Option<u64>> {
        if let Some(reason) = self.fail_next.lock().unwrap().take() {
            return Err(DuelError::InternalError(reason));
        }
        Ok(self
            .samples
            .lock()
            .unwrap()
            .get(&(participant, duel_id.to_string(), metric_name.to_string()))
            .copied())
    }
}

/// Decode an RLP-signed transaction payload into (to, calldata, value).
pub fn decode_signed_payload(raw: &[u8]) -> (EthAddress, Vec<u8>, U256) {
    let rlp = Rlp::new(raw);
    let (tx, _signature) = TypedTransaction::decode_signed(&rlp).unwrap();
    let to = tx.to_addr().copied().unwrap_or_default();
    let data = tx.data().map(|d| d.to_vec()).unwrap_or_default();
    let value = tx.value().copied().unwrap_or_default();
    (to, data, value)
}

const TEST_STAKE_AMOUNT: u64 = 10;
const TEST_DEFAULT_MONITORING_MINUTES: u64 = 60;

/// Fully assembled orchestration stack over programmable fakes.
pub struct HandlerFixture {
    pub store: Arc<DuelRecordStore>,
    pub ledger: MockEscrowLedger,
    pub escrow: Arc<EscrowClient<MockEscrowLedger>>,
    pub signers: Arc<SignerRegistry>,
    pub health: Arc<StaticHealthReader>,
    pub notifier: Arc<CapturingNotifier>,
    pub metrics: Arc<DuelMetrics>,
    pub driver: Arc<SettlementDriver<MockEscrowLedger>>,
    handler: Arc<DuelRequestHandler<MockEscrowLedger>>,
    first: EthAddress,
    second: EthAddress,
}

impl HandlerFixture {
    pub async fn new() -> Self {
        let metrics = Arc::new(DuelMetrics::new_for_testing());
        let store = Arc::new(DuelRecordStore::new_in_memory());
        let ledger = MockEscrowLedger::new();
        let escrow = Arc::new(EscrowClient::new_for_testing(ledger.clone()));
        let health = Arc::new(StaticHealthReader::new());
        let notifier = Arc::new(CapturingNotifier::new());

        let service_wallet = LocalWallet::new(&mut rand::thread_rng()).with_chain_id(31337u64);
        let first_wallet = LocalWallet::new(&mut rand::thread_rng()).with_chain_id(31337u64);
        let second_wallet = LocalWallet::new(&mut rand::thread_rng()).with_chain_id(31337u64);
        let first = first_wallet.address();
        let second = second_wallet.address();
        let signers = Arc::new(SignerRegistry::new(
            Arc::new(FileKeySigner::from_wallet(service_wallet)),
            vec![
                Arc::new(FileKeySigner::from_wallet(first_wallet)),
                Arc::new(FileKeySigner::from_wallet(second_wallet)),
            ],
        ));

        let driver = Arc::new(SettlementDriver::new(
            store.clone(),
            escrow.clone(),
            health.clone() as Arc<dyn HealthMetricReader>,
            notifier.clone() as Arc<dyn RealtimeNotifier>,
            signers.clone(),
            metrics.clone(),
        ));
        let handler = Arc::new(DuelRequestHandler::new(
            store.clone(),
            escrow.clone(),
            signers.clone(),
            notifier.clone() as Arc<dyn RealtimeNotifier>,
            driver.clone(),
            metrics.clone(),
            TEST_DEFAULT_MONITORING_MINUTES,
        ));

        Self {
            store,
            ledger,
            escrow,
            signers,
            health,
            notifier,
            metrics,
            driver,
            handler,
            first,
            second,
        }
    }

    pub fn handler(&self) -> Arc<DuelRequestHandler<MockEscrowLedger>> {
        self.handler.clone()
    }

    pub fn first_address(&self) -> EthAddress {
        self.first
    }

    pub fn second_address(&self) -> EthAddress {
        self.second
    }

    pub fn default_monitoring_duration_minutes(&self) -> u64 {
        TEST_DEFAULT_MONITORING_MINUTES
    }

    pub fn deadline_sweep(&self) -> StakingDeadlineSweep<MockEscrowLedger> {
        StakingDeadlineSweep::new(
            self.store.clone(),
            self.escrow.clone(),
            self.signers.clone(),
            self.notifier.clone() as Arc<dyn RealtimeNotifier>,
            self.metrics.clone(),
            Duration::from_millis(50),
        )
    }

    pub fn completion_sweep(&self) -> MonitoringCompletionSweep<MockEscrowLedger> {
        MonitoringCompletionSweep::new(
            self.store.clone(),
            self.driver.clone(),
            Duration::from_millis(50),
        )
    }

    pub fn reconciler(&self) -> LedgerReconciler<MockEscrowLedger> {
        LedgerReconciler::new(
            self.store.clone(),
            self.escrow.clone(),
            self.notifier.clone() as Arc<dyn RealtimeNotifier>,
            self.metrics.clone(),
            Duration::from_millis(50),
        )
    }

    pub async fn insert_waiting_duel(&self, duel_id: &str, staking_deadline_ms: Option<u64>) {
        let mut duel = Duel::new(
            duel_id,
            self.first,
            self.second,
            TEST_STAKE_AMOUNT,
            ChallengeMetadata::steps("10k steps"),
        );
        if let Some(deadline) = staking_deadline_ms {
            duel = duel.with_staking_deadline(deadline);
        }
        self.store.insert(duel).await.unwrap();
    }

    pub async fn insert_accepted_duel(&self, duel_id: &str) {
        self.insert_waiting_duel(duel_id, None).await;
        self.store.ensure_numeric_id(duel_id).await.unwrap();
        self.store
            .update(duel_id, |d| {
                for p in [&mut d.first, &mut d.second] {
                    p.stake_state = StakeState::Staked;
                    p.stake_tx_ref = Some("0x11".to_string());
                    p.stake_call = Some(LedgerCallRecord::confirmed("0x11".to_string()));
                }
                d.status = DuelStatus::Accepted;
                d.ledger_active = true;
                d.staking_deadline_ms = None;
            })
            .await
            .unwrap();
    }

    pub async fn insert_monitoring_duel(&self, duel_id: &str, duration_minutes: u64) {
        self.insert_accepted_duel(duel_id).await;
        self.store
            .update(duel_id, |d| {
                d.status = DuelStatus::MonitoringHealth;
                d.window = Some(MonitoringWindow::starting_now(duration_minutes));
            })
            .await
            .unwrap();
    }
}
