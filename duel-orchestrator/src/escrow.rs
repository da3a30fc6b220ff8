// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Client for the on-ledger escrow contract.
//!
//! [`EscrowClient`] wraps an [`EscrowContractInner`] transport so the rest of
//! the node (and the tests) never talk to a provider directly. Mutating calls
//! are signed by a [`TransactionSigner`], submitted, and then polled until the
//! ledger reports them mined; a call that cannot be confirmed within the
//! polling budget surfaces as an error and is never retried here. Deciding
//! what a failed call means for a duel record is the caller's job.

use crate::error::{DuelError, DuelResult};
use crate::metrics::DuelMetrics;
use crate::retry_with_max_elapsed_time;
use crate::signer::TransactionSigner;
use ethers::abi::{self, ParamType, Token};
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address as EthAddress, Bytes, Filter, Log, TransactionRequest, TxHash, H256, U256,
};
use ethers::utils::keccak256;
use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use async_trait::async_trait;
use std::time::Duration;

/// Escrow calls are small storage updates, well under this limit.
const ESCROW_CALL_GAS_LIMIT: u64 = 300_000;

// Contract surface of the escrow: three mutating entry points and two views.
static PLACE_STAKE_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| ethers::utils::id("placeStake(uint64)"));
static SETTLE_DUEL_SELECTOR: Lazy<[u8; 4]> =
    Lazy::new(|| ethers::utils::id("settleDuel(uint64,address,address)"));
static REFUND_STAKE_SELECTOR: Lazy<[u8; 4]> =
    Lazy::new(|| ethers::utils::id("refundStake(uint64,address)"));
static STAKE_OF_SELECTOR: Lazy<[u8; 4]> =
    Lazy::new(|| ethers::utils::id("stakeOf(uint64,address)"));
static COMBINED_STAKE_OF_SELECTOR: Lazy<[u8; 4]> =
    Lazy::new(|| ethers::utils::id("combinedStakeOf(uint64,address,address)"));
static OWNER_SELECTOR: Lazy<[u8; 4]> = Lazy::new(|| ethers::utils::id("owner()"));
static PLATFORM_ACCOUNT_SELECTOR: Lazy<[u8; 4]> =
    Lazy::new(|| ethers::utils::id("platformAccount()"));

static STAKE_PLACED_TOPIC: Lazy<H256> =
    Lazy::new(|| H256::from(keccak256("StakePlaced(uint64,address,uint256)")));
static DUEL_SETTLED_TOPIC: Lazy<H256> =
    Lazy::new(|| H256::from(keccak256("DuelSettled(uint64,address,address)")));
static STAKE_REFUNDED_TOPIC: Lazy<H256> =
    Lazy::new(|| H256::from(keccak256("StakeRefunded(uint64,address)")));

fn encode_call(selector: [u8; 4], args: &[Token]) -> Bytes {
    let mut data = selector.to_vec();
    data.extend(abi::encode(args));
    data.into()
}

/// Event emitted by the escrow contract, already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowContractEvent {
    StakePlaced {
        numeric_id: u64,
        staker: EthAddress,
        amount: U256,
        tx_ref: String,
        block_number: u64,
    },
    DuelSettled {
        numeric_id: u64,
        winner: EthAddress,
        loser: EthAddress,
        tx_ref: String,
        block_number: u64,
    },
    StakeRefunded {
        numeric_id: u64,
        user: EthAddress,
        tx_ref: String,
        block_number: u64,
    },
}

impl EscrowContractEvent {
    pub fn numeric_id(&self) -> u64 {
        match self {
            Self::StakePlaced { numeric_id, .. }
            | Self::DuelSettled { numeric_id, .. }
            | Self::StakeRefunded { numeric_id, .. } => *numeric_id,
        }
    }
}

/// Decode one raw log into an escrow event. Logs with unknown topics or
/// malformed data are skipped rather than treated as errors, so unrelated
/// contract activity can never wedge the subscription.
pub fn decode_escrow_log(log: &Log) -> Option<EscrowContractEvent> {
    let topic = log.topics.first()?;
    let tx_ref = format!("{:?}", log.transaction_hash?);
    let block_number = log.block_number?.as_u64();

    if topic == &*STAKE_PLACED_TOPIC {
        let tokens = abi::decode(
            &[ParamType::Uint(64), ParamType::Address, ParamType::Uint(256)],
            &log.data,
        )
        .ok()?;
        let mut iter = tokens.into_iter();
        return Some(EscrowContractEvent::StakePlaced {
            numeric_id: iter.next()?.into_uint()?.as_u64(),
            staker: iter.next()?.into_address()?,
            amount: iter.next()?.into_uint()?,
            tx_ref,
            block_number,
        });
    }
    if topic == &*DUEL_SETTLED_TOPIC {
        let tokens = abi::decode(
            &[ParamType::Uint(64), ParamType::Address, ParamType::Address],
            &log.data,
        )
        .ok()?;
        let mut iter = tokens.into_iter();
        return Some(EscrowContractEvent::DuelSettled {
            numeric_id: iter.next()?.into_uint()?.as_u64(),
            winner: iter.next()?.into_address()?,
            loser: iter.next()?.into_address()?,
            tx_ref,
            block_number,
        });
    }
    if topic == &*STAKE_REFUNDED_TOPIC {
        let tokens = abi::decode(&[ParamType::Uint(64), ParamType::Address], &log.data).ok()?;
        let mut iter = tokens.into_iter();
        return Some(EscrowContractEvent::StakeRefunded {
            numeric_id: iter.next()?.into_uint()?.as_u64(),
            user: iter.next()?.into_address()?,
            tx_ref,
            block_number,
        });
    }
    None
}

// Use a trait to abstract over the HTTP provider and the mock ledger used in
// tests.
#[async_trait]
pub trait EscrowContractInner: Send + Sync {
    type Error: Into<anyhow::Error> + Send + Sync + std::error::Error + 'static;

    fn contract_address(&self) -> EthAddress;

    async fn submit_signed_transaction(&self, raw: Bytes) -> Result<TxHash, Self::Error>;

    /// None: not mined yet. Some(true): mined and succeeded. Some(false):
    /// mined but reverted.
    async fn transaction_status(&self, tx_hash: TxHash) -> Result<Option<bool>, Self::Error>;

    async fn next_nonce(&self, address: EthAddress) -> Result<U256, Self::Error>;

    async fn gas_price(&self) -> Result<U256, Self::Error>;

    async fn get_stake(&self, numeric_id: u64, staker: EthAddress) -> Result<U256, Self::Error>;

    async fn get_combined_stake(
        &self,
        numeric_id: u64,
        first: EthAddress,
        second: EthAddress,
    ) -> Result<U256, Self::Error>;

    async fn get_owner(&self) -> Result<EthAddress, Self::Error>;

    async fn get_platform_account(&self) -> Result<EthAddress, Self::Error>;

    /// Decoded escrow events from `from_block` to the ledger tip, plus the
    /// next block to resume from.
    async fn fetch_escrow_events(
        &self,
        from_block: u64,
    ) -> Result<(Vec<EscrowContractEvent>, u64), Self::Error>;
}

pub struct EscrowClient<P> {
    inner: P,
    metrics: Arc<DuelMetrics>,
    chain_id: u64,
    confirmation_poll_attempts: u32,
    confirmation_poll_interval: Duration,
}

pub type HttpEscrowClient = EscrowClient<HttpEscrowContract>;

impl<P> EscrowClient<P>
where
    P: EscrowContractInner + Send + Sync + 'static,
{
    pub fn new(
        inner: P,
        metrics: Arc<DuelMetrics>,
        chain_id: u64,
        confirmation_poll_attempts: u32,
        confirmation_poll_interval: Duration,
    ) -> Self {
        Self {
            inner,
            metrics,
            chain_id,
            confirmation_poll_attempts,
            confirmation_poll_interval,
        }
    }

    #[cfg(test)]
    pub fn new_for_testing(inner: P) -> Self {
        Self {
            inner,
            metrics: Arc::new(DuelMetrics::new_for_testing()),
            chain_id: 31337,
            confirmation_poll_attempts: 3,
            confirmation_poll_interval: Duration::from_millis(10),
        }
    }

    pub fn contract_address(&self) -> EthAddress {
        self.inner.contract_address()
    }

    /// Place `amount` into escrow for `numeric_id`, paid and signed by the
    /// staking participant.
    pub async fn place_stake(
        &self,
        numeric_id: u64,
        amount: u64,
        signer: &dyn TransactionSigner,
    ) -> DuelResult<String> {
        let data = encode_call(*PLACE_STAKE_SELECTOR, &[Token::Uint(numeric_id.into())]);
        self.submit_and_confirm("place_stake", signer, data, Some(U256::from(amount)))
            .await
    }

    /// Pay the combined stake of `numeric_id` out to the winner. Signed by
    /// the service account that operates the escrow.
    pub async fn settle_duel(
        &self,
        numeric_id: u64,
        winner: EthAddress,
        loser: EthAddress,
        signer: &dyn TransactionSigner,
    ) -> DuelResult<String> {
        let data = encode_call(
            *SETTLE_DUEL_SELECTOR,
            &[
                Token::Uint(numeric_id.into()),
                Token::Address(winner),
                Token::Address(loser),
            ],
        );
        self.submit_and_confirm("settle_duel", signer, data, None).await
    }

    /// Return `user`'s stake for `numeric_id`. Signed by the service account.
    pub async fn refund_stake(
        &self,
        numeric_id: u64,
        user: EthAddress,
        signer: &dyn TransactionSigner,
    ) -> DuelResult<String> {
        let data = encode_call(
            *REFUND_STAKE_SELECTOR,
            &[Token::Uint(numeric_id.into()), Token::Address(user)],
        );
        self.submit_and_confirm("refund_stake", signer, data, None).await
    }

    pub async fn get_stake(&self, numeric_id: u64, staker: EthAddress) -> DuelResult<U256> {
        self.inner.get_stake(numeric_id, staker).await.map_err(|e| {
            self.metrics
                .escrow_rpc_errors
                .with_label_values(&["get_stake"])
                .inc();
            DuelError::LedgerCallFailed(format!("stakeOf query failed: {:?}", e))
        })
    }

    pub async fn get_combined_stake(
        &self,
        numeric_id: u64,
        first: EthAddress,
        second: EthAddress,
    ) -> DuelResult<U256> {
        self.inner
            .get_combined_stake(numeric_id, first, second)
            .await
            .map_err(|e| {
                self.metrics
                    .escrow_rpc_errors
                    .with_label_values(&["get_combined_stake"])
                    .inc();
                DuelError::LedgerCallFailed(format!("combinedStakeOf query failed: {:?}", e))
            })
    }

    /// Operator account of the escrow contract. Queried at startup as a
    /// liveness probe of the configured contract address.
    pub async fn get_owner(&self) -> DuelResult<EthAddress> {
        self.inner.get_owner().await.map_err(|e| {
            self.metrics
                .escrow_rpc_errors
                .with_label_values(&["get_owner"])
                .inc();
            DuelError::LedgerCallFailed(format!("owner query failed: {:?}", e))
        })
    }

    /// Account receiving the platform's share of each settlement.
    pub async fn get_platform_account(&self) -> DuelResult<EthAddress> {
        self.inner.get_platform_account().await.map_err(|e| {
            self.metrics
                .escrow_rpc_errors
                .with_label_values(&["get_platform_account"])
                .inc();
            DuelError::LedgerCallFailed(format!("platformAccount query failed: {:?}", e))
        })
    }

    /// Build, sign, submit, then poll until the transaction is mined.
    /// Polls `confirmation_poll_attempts` times at `confirmation_poll_interval`.
    async fn submit_and_confirm(
        &self,
        call: &'static str,
        signer: &dyn TransactionSigner,
        data: Bytes,
        value: Option<U256>,
    ) -> DuelResult<String> {
        let from = signer.address();
        let nonce = self.inner.next_nonce(from).await.map_err(|e| {
            self.metrics
                .escrow_rpc_errors
                .with_label_values(&["next_nonce"])
                .inc();
            DuelError::LedgerCallFailed(format!("nonce query failed: {:?}", e))
        })?;
        let gas_price = self.inner.gas_price().await.map_err(|e| {
            self.metrics
                .escrow_rpc_errors
                .with_label_values(&["gas_price"])
                .inc();
            DuelError::LedgerCallFailed(format!("gas price query failed: {:?}", e))
        })?;

        let mut request = TransactionRequest::new()
            .from(from)
            .to(self.inner.contract_address())
            .data(data)
            .nonce(nonce)
            .gas(ESCROW_CALL_GAS_LIMIT)
            .gas_price(gas_price)
            .chain_id(self.chain_id);
        if let Some(value) = value {
            request = request.value(value);
        }
        let tx: TypedTransaction = request.into();

        let raw = signer.sign_transaction(&tx).await?;
        let submitted_at = std::time::Instant::now();
        let tx_hash = self
            .inner
            .submit_signed_transaction(raw)
            .await
            .map_err(|e| {
                self.metrics
                    .escrow_tx_failed
                    .with_label_values(&[call])
                    .inc();
                error!("[EscrowClient] ❌ {} submission failed: {:?}", call, e);
                DuelError::LedgerCallFailed(format!("{} submission failed: {:?}", call, e))
            })?;
        self.metrics
            .escrow_tx_submitted
            .with_label_values(&[call])
            .inc();
        let tx_ref = format!("{:?}", tx_hash);
        info!(
            "[EscrowClient] {} submitted as {}, waiting for confirmation",
            call, tx_ref
        );

        for i in 0..self.confirmation_poll_attempts {
            tokio::time::sleep(self.confirmation_poll_interval).await;
            match self.inner.transaction_status(tx_hash).await {
                Ok(Some(true)) => {
                    self.metrics
                        .escrow_tx_confirmed
                        .with_label_values(&[call])
                        .inc();
                    self.metrics
                        .escrow_tx_latency
                        .with_label_values(&[call])
                        .observe(submitted_at.elapsed().as_secs_f64());
                    info!("[EscrowClient] ✅ {} confirmed: {}", call, tx_ref);
                    return Ok(tx_ref);
                }
                Ok(Some(false)) => {
                    self.metrics
                        .escrow_tx_failed
                        .with_label_values(&[call])
                        .inc();
                    error!("[EscrowClient] ❌ {} reverted on ledger: {}", call, tx_ref);
                    return Err(DuelError::LedgerCallFailed(format!(
                        "{} transaction {} reverted",
                        call, tx_ref
                    )));
                }
                Ok(None) => {
                    if i % 10 == 0 {
                        debug!(
                            "[EscrowClient] ⏳ Still waiting for {} confirmation: {}",
                            call, tx_ref
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        "[EscrowClient] Receipt query for {} failed, retrying: {:?}",
                        tx_ref, e
                    );
                }
            }
        }

        self.metrics
            .escrow_tx_failed
            .with_label_values(&[call])
            .inc();
        Err(DuelError::LedgerCallFailed(format!(
            "{} transaction {} not confirmed after {} polls",
            call, tx_ref, self.confirmation_poll_attempts
        )))
    }

    /// Poll the escrow contract for events and forward them over `events_tx`
    /// until cancelled. Fetch failures are retried with backoff and then
    /// logged; the cursor does not advance past unfetched blocks, so no event
    /// is skipped.
    pub fn subscribe(
        self: Arc<Self>,
        from_block: u64,
        poll_interval: Duration,
        events_tx: mpsc::Sender<EscrowContractEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut cursor = from_block;
            let mut ticker = tokio::time::interval(poll_interval);
            info!(
                "[EscrowClient] Watching escrow events from block {}",
                cursor
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("[EscrowClient] Escrow event subscription shutting down");
                        return;
                    }
                    _ = ticker.tick() => {}
                }

                let Ok(Ok((events, next_cursor))) = retry_with_max_elapsed_time!(
                    self.inner.fetch_escrow_events(cursor),
                    Duration::from_secs(30)
                ) else {
                    self.metrics
                        .escrow_rpc_errors
                        .with_label_values(&["fetch_escrow_events"])
                        .inc();
                    error!(
                        "[EscrowClient] Failed to fetch escrow events from block {}",
                        cursor
                    );
                    continue;
                };

                for event in events {
                    self.metrics.escrow_events_observed.inc();
                    debug!("[EscrowClient] Observed escrow event: {:?}", event);
                    if events_tx.send(event).await.is_err() {
                        warn!("[EscrowClient] Event receiver closed, stopping subscription");
                        return;
                    }
                }
                cursor = next_cursor;
            }
        })
    }
}

/// Production transport over an HTTP JSON-RPC provider.
pub struct HttpEscrowContract {
    provider: Provider<Http>,
    contract_address: EthAddress,
}

impl HttpEscrowContract {
    pub fn new(rpc_url: &str, contract_address: EthAddress) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| anyhow::anyhow!("Invalid ledger RPC url `{}`: {}", rpc_url, e))?
            .interval(Duration::from_millis(2000));
        Ok(Self {
            provider,
            contract_address,
        })
    }

    pub async fn get_chain_id(&self) -> anyhow::Result<u64> {
        Ok(self.provider.get_chainid().await?.as_u64())
    }

    pub async fn latest_block_number(&self) -> anyhow::Result<u64> {
        Ok(self.provider.get_block_number().await?.as_u64())
    }

    async fn call_view(&self, data: Bytes) -> Result<U256, ProviderError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.contract_address)
            .data(data)
            .into();
        let output = self.provider.call(&tx, None).await?;
        let tokens = abi::decode(&[ParamType::Uint(256)], &output)
            .map_err(|e| ProviderError::CustomError(format!("view output decode: {}", e)))?;
        tokens
            .into_iter()
            .next()
            .and_then(|t| t.into_uint())
            .ok_or_else(|| ProviderError::CustomError("empty view output".to_string()))
    }

    async fn call_address_view(&self, data: Bytes) -> Result<EthAddress, ProviderError> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(self.contract_address)
            .data(data)
            .into();
        let output = self.provider.call(&tx, None).await?;
        let tokens = abi::decode(&[ParamType::Address], &output)
            .map_err(|e| ProviderError::CustomError(format!("view output decode: {}", e)))?;
        tokens
            .into_iter()
            .next()
            .and_then(|t| t.into_address())
            .ok_or_else(|| ProviderError::CustomError("empty view output".to_string()))
    }
}

#[async_trait]
impl EscrowContractInner for HttpEscrowContract {
    type Error = ProviderError;

    fn contract_address(&self) -> EthAddress {
        self.contract_address
    }

    async fn submit_signed_transaction(&self, raw: Bytes) -> Result<TxHash, Self::Error> {
        let pending = self.provider.send_raw_transaction(raw).await?;
        Ok(*pending)
    }

    async fn transaction_status(&self, tx_hash: TxHash) -> Result<Option<bool>, Self::Error> {
        let receipt = self.provider.get_transaction_receipt(tx_hash).await?;
        // Receipts without a status field predate status reporting; treat
        // mined as succeeded.
        Ok(receipt.map(|r| r.status.map_or(true, |s| s.as_u64() == 1)))
    }

    async fn next_nonce(&self, address: EthAddress) -> Result<U256, Self::Error> {
        self.provider.get_transaction_count(address, None).await
    }

    async fn gas_price(&self) -> Result<U256, Self::Error> {
        self.provider.get_gas_price().await
    }

    async fn get_stake(&self, numeric_id: u64, staker: EthAddress) -> Result<U256, Self::Error> {
        let data = encode_call(
            *STAKE_OF_SELECTOR,
            &[Token::Uint(numeric_id.into()), Token::Address(staker)],
        );
        self.call_view(data).await
    }

    async fn get_combined_stake(
        &self,
        numeric_id: u64,
        first: EthAddress,
        second: EthAddress,
    ) -> Result<U256, Self::Error> {
        let data = encode_call(
            *COMBINED_STAKE_OF_SELECTOR,
            &[
                Token::Uint(numeric_id.into()),
                Token::Address(first),
                Token::Address(second),
            ],
        );
        self.call_view(data).await
    }

    async fn get_owner(&self) -> Result<EthAddress, Self::Error> {
        self.call_address_view(encode_call(*OWNER_SELECTOR, &[])).await
    }

    async fn get_platform_account(&self) -> Result<EthAddress, Self::Error> {
        self.call_address_view(encode_call(*PLATFORM_ACCOUNT_SELECTOR, &[]))
            .await
    }

    async fn fetch_escrow_events(
        &self,
        from_block: u64,
    ) -> Result<(Vec<EscrowContractEvent>, u64), Self::Error> {
        let latest = self.provider.get_block_number().await?.as_u64();
        if latest < from_block {
            return Ok((Vec::new(), from_block));
        }
        let filter = Filter::new()
            .from_block(from_block)
            .to_block(latest)
            .address(self.contract_address);
        let logs = self.provider.get_logs(&filter).await?;

        // Safeguard check that all events are emitted from the escrow address
        if logs.iter().any(|log| log.address != self.contract_address) {
            return Err(ProviderError::CustomError(format!(
                "Provider returned logs from a different contract address (expected: {:?})",
                self.contract_address
            )));
        }

        let events = logs.iter().filter_map(decode_escrow_log).collect();
        Ok((events, latest + 1))
    }
}
