// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Transaction signing capabilities.
//!
//! Escrow calls never touch raw key material directly. They go through a
//! [`TransactionSigner`], and the node hands each component only the signers
//! it is supposed to use: participant signers for stake placement, the
//! service signer for settlements and refunds.

use crate::error::{DuelError, DuelResult};
use async_trait::async_trait;
use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::Address as EthAddress;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Capability to sign escrow transactions for exactly one address.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    fn address(&self) -> EthAddress;

    /// Produce the RLP-encoded signed transaction, ready for submission.
    async fn sign_transaction(&self, tx: &TypedTransaction) -> DuelResult<Bytes>;
}

/// Signer backed by a hex-encoded private key read from a file.
pub struct FileKeySigner {
    wallet: LocalWallet,
}

impl FileKeySigner {
    pub fn from_key_file(path: &Path, chain_id: u64) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!(
                "Failed to read signing key from {:?}: {}. \
                Please ensure the key file exists and contains a hex-encoded private key.",
                path,
                e
            )
        })?;
        let trimmed = contents.trim().trim_start_matches("0x");
        let wallet = LocalWallet::from_str(trimmed)
            .map_err(|e| anyhow::anyhow!("Invalid private key in {:?}: {}", path, e))?
            .with_chain_id(chain_id);
        info!(
            "[Signer] Loaded signing key for address {:?} from {:?}",
            wallet.address(),
            path
        );
        Ok(Self { wallet })
    }

    #[cfg(test)]
    pub fn from_wallet(wallet: LocalWallet) -> Self {
        Self { wallet }
    }
}

// Keep key material out of debug output.
impl std::fmt::Debug for FileKeySigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKeySigner")
            .field("address", &self.wallet.address())
            .finish()
    }
}

#[async_trait]
impl TransactionSigner for FileKeySigner {
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

/// The signers this node operates with: one per known participant address,
/// plus the service account that owns settlements and refunds.
pub struct SignerRegistry {
    service: Arc<dyn TransactionSigner>,
    participants: HashMap<EthAddress, Arc<dyn TransactionSigner>>,
}

impl SignerRegistry {
    pub fn new(
        service: Arc<dyn TransactionSigner>,
        participant_signers: Vec<Arc<dyn TransactionSigner>>,
    ) -> Self {
        let participants = participant_signers
            .into_iter()
            .map(|s| (s.address(), s))
            .collect();
        Self {
            service,
            participants,
        }
    }

    pub fn service_signer(&self) -> Arc<dyn TransactionSigner> {
        self.service.clone()
    }

    pub fn participant_signer(
        &self,
        address: &EthAddress,
    ) -> Option<Arc<dyn TransactionSigner>> {
        self.participants.get(address).cloned()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }
}
