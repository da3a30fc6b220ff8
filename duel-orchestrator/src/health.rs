// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Read side of the health-metric platform.
//!
//! Settlement only needs one question answered: what is the participant's
//! latest recorded value for the duel's metric? A missing sample is a valid
//! answer (the participant never reported), distinct from the platform being
//! unreachable.

use crate::error::{DuelError, DuelResult};
use crate::types::address_hex;
use async_trait::async_trait;
use ethers::types::Address as EthAddress;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait HealthMetricReader: Send + Sync {
    /// Latest sample for `participant` in `duel_id`'s challenge metric.
    /// Ok(None) means no sample was ever recorded.
    async fn latest_sample(
        &self,
        participant: EthAddress,
        duel_id: &str,
        metric_name: &str,
    ) -> DuelResult<Option<u64>>;
}

#[derive(Debug, Deserialize)]
struct SampleResponse {
    value: u64,
}

/// Reader over the health platform's HTTP API.
pub struct HttpHealthMetricReader {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHealthMetricReader {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build health platform client: {}", e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl HealthMetricReader for HttpHealthMetricReader {
    async fn latest_sample(
        &self,
        participant: EthAddress,
        duel_id: &str,
        metric_name: &str,
    ) -> DuelResult<Option<u64>> {
        let url = format!(
            "{}/participants/{}/duels/{}/metrics/{}/latest",
            self.base_url,
            address_hex(&participant),
            duel_id,
            metric_name
        );
        let response = self.client.get(&url).send().await.map_err(|e| {
            DuelError::InternalError(format!("health platform unreachable: {}", e))
        })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(
                "[HealthReader] No {} sample recorded for {} in duel `{}`",
                metric_name,
                address_hex(&participant),
                duel_id
            );
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(DuelError::InternalError(format!(
                "health platform returned {} for {}",
                response.status(),
                url
            )));
        }

        let sample: SampleResponse = response.json().await.map_err(|e| {
            DuelError::InternalError(format!("health platform sent malformed sample: {}", e))
        })?;
        Ok(Some(sample.value))
    }
}
