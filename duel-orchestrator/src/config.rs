// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::escrow::{EscrowClient, HttpEscrowClient, HttpEscrowContract};
use crate::health::{HealthMetricReader, HttpHealthMetricReader};
use crate::metrics::DuelMetrics;
use crate::notifier::{RealtimeNotifier, WebhookNotifier};
use crate::record_store::DuelRecordStore;
use crate::signer::{FileKeySigner, SignerRegistry, TransactionSigner};
use anyhow::anyhow;
use ethers::types::Address as EthAddress;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_with::serde_as;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Load and persist node configuration files. YAML is detected from the
/// file extension, everything else is treated as JSON.
pub trait Config: Serialize + DeserializeOwned {
    fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = if path.extension().and_then(|s| s.to_str()) == Some("yaml")
            || path.extension().and_then(|s| s.to_str()) == Some("yml")
        {
            serde_yaml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };
        Ok(config)
    }

    fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LedgerConfig {
    // Rpc url for the ledger fullnode, used for queries and submitting
    // escrow transactions.
    pub ledger_rpc_url: String,
    // The deployed escrow contract address.
    pub escrow_contract_address: String,
    // The chain id the node expects to be connected to.
    pub ledger_chain_id: u64,
    #[serde(default = "default_confirmation_poll_attempts")]
    pub confirmation_poll_attempts: u32,
    #[serde(default = "default_confirmation_poll_interval_ms")]
    pub confirmation_poll_interval_ms: u64,
}

pub fn default_confirmation_poll_attempts() -> u32 {
    60
}

pub fn default_confirmation_poll_interval_ms() -> u64 {
    500
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SignerConfig {
    // Path of the file where the service account key is stored, hex-encoded.
    // Settlements and refunds are signed with it.
    pub service_key_path: PathBuf,
    // Key files for the participant accounts this node may stake on behalf
    // of. Stake requests for addresses outside this set are rejected.
    #[serde(default)]
    pub participant_key_paths: Vec<PathBuf>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct NotifierConfig {
    // Base url of the realtime webhook gateway. Leaving it unset turns every
    // publish into a logged no-op.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_base_url: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HealthConfig {
    // Base url of the health-metric platform API.
    pub base_url: String,
}

#[serde_as]
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DuelNodeConfig {
    // The port that the server listens on.
    pub server_listen_port: u16,
    // The port for the metrics server.
    pub metrics_port: u16,
    // Where the duel records are persisted.
    pub record_store_path: PathBuf,
    #[serde(default = "default_monitoring_duration_minutes")]
    pub default_monitoring_duration_minutes: u64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    #[serde(default = "default_reconcile_interval_seconds")]
    pub reconcile_interval_seconds: u64,
    #[serde(default = "default_event_poll_interval_seconds")]
    pub event_poll_interval_seconds: u64,
    // Ledger configuration
    pub ledger: LedgerConfig,
    // Signing key configuration
    pub signer: SignerConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notifier: Option<NotifierConfig>,
    // Health platform configuration
    pub health: HealthConfig,
}

pub fn default_monitoring_duration_minutes() -> u64 {
    60
}

pub fn default_sweep_interval_seconds() -> u64 {
    30
}

pub fn default_reconcile_interval_seconds() -> u64 {
    60
}

pub fn default_event_poll_interval_seconds() -> u64 {
    15
}

impl Config for DuelNodeConfig {}

impl DuelNodeConfig {
    /// Checks the configuration against the live ledger and assembles the
    /// collaborators the node runs with.
    pub async fn validate(&self, metrics: Arc<DuelMetrics>) -> anyhow::Result<DuelServerConfig> {
        info!("Starting config validation");
        if self.ledger.ledger_rpc_url.is_empty() {
            return Err(anyhow!("ledger-rpc-url must not be empty"));
        }
        let contract_address = EthAddress::from_str(&self.ledger.escrow_contract_address)
            .map_err(|e| {
                anyhow!(
                    "Invalid escrow contract address `{}`: {}",
                    self.ledger.escrow_contract_address,
                    e
                )
            })?;

        info!("Creating escrow ledger provider");
        let contract = HttpEscrowContract::new(&self.ledger.ledger_rpc_url, contract_address)?;
        let chain_id = contract.get_chain_id().await?;
        if chain_id != self.ledger.ledger_chain_id {
            return Err(anyhow!(
                "Ledger chain id mismatch: expected {}, but connected to {}",
                self.ledger.ledger_chain_id,
                chain_id
            ));
        }
        info!("Connected to ledger chain: {}", chain_id);
        // Escrow events are observed from the block the node came up at.
        let event_start_block = contract.latest_block_number().await?;

        let escrow = Arc::new(EscrowClient::new(
            contract,
            metrics.clone(),
            chain_id,
            self.ledger.confirmation_poll_attempts,
            Duration::from_millis(self.ledger.confirmation_poll_interval_ms),
        ));
        // A responding RPC node with no contract behind the address would
        // pass the chain id check; asking the contract itself catches that.
        let owner = escrow
            .get_owner()
            .await
            .map_err(|e| anyhow!("Escrow contract at {:?} did not answer: {}", contract_address, e))?;
        let platform_account = escrow
            .get_platform_account()
            .await
            .map_err(|e| anyhow!("Escrow contract at {:?} did not answer: {}", contract_address, e))?;
        info!(
            "Escrow contract reachable - owner: {:?}, platform account: {:?}",
            owner, platform_account
        );

        let service_signer: Arc<dyn TransactionSigner> = Arc::new(FileKeySigner::from_key_file(
            &self.signer.service_key_path,
            chain_id,
        )?);
        let mut participant_signers: Vec<Arc<dyn TransactionSigner>> = vec![];
        for path in &self.signer.participant_key_paths {
            participant_signers.push(Arc::new(FileKeySigner::from_key_file(path, chain_id)?));
        }
        let signers = Arc::new(SignerRegistry::new(service_signer, participant_signers));
        info!(
            "Loaded {} participant signer(s)",
            signers.participant_count()
        );

        let store = Arc::new(DuelRecordStore::load(self.record_store_path.clone())?);

        let webhook_base_url = self
            .notifier
            .as_ref()
            .and_then(|n| n.webhook_base_url.clone());
        let notifier: Arc<dyn RealtimeNotifier> = Arc::new(WebhookNotifier::new(webhook_base_url));

        let health: Arc<dyn HealthMetricReader> =
            Arc::new(HttpHealthMetricReader::new(&self.health.base_url)?);

        let duel_server_config = DuelServerConfig {
            server_listen_port: self.server_listen_port,
            metrics_port: self.metrics_port,
            default_monitoring_duration_minutes: self.default_monitoring_duration_minutes,
            sweep_interval: Duration::from_secs(self.sweep_interval_seconds),
            reconcile_interval: Duration::from_secs(self.reconcile_interval_seconds),
            event_poll_interval: Duration::from_secs(self.event_poll_interval_seconds),
            event_start_block,
            store,
            escrow,
            signers,
            notifier,
            health,
        };

        info!("Config validation complete");
        Ok(duel_server_config)
    }
}

/// Validated runtime configuration with live collaborators.
pub struct DuelServerConfig {
    pub server_listen_port: u16,
    pub metrics_port: u16,
    pub default_monitoring_duration_minutes: u64,
    pub sweep_interval: Duration,
    pub reconcile_interval: Duration,
    pub event_poll_interval: Duration,
    pub event_start_block: u64,
    pub store: Arc<DuelRecordStore>,
    pub escrow: Arc<HttpEscrowClient>,
    pub signers: Arc<SignerRegistry>,
    pub notifier: Arc<dyn RealtimeNotifier>,
    pub health: Arc<dyn HealthMetricReader>,
}
