// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Gas pricing for destination-chain broadcasts.
//!
//! Prices come in three tiers. A task starts at its configured base speed
//! and climbs one speed per bump interval of task age, so a transaction that
//! keeps missing inclusion bids progressively more without ever exceeding
//! the configured ceiling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ethers::types::U256;
use serde::Deserialize;
use tokio::sync::RwLock;
use url::Url;

use crate::error::{RelayerError, RelayerResult};
use crate::metrics::RelayerMetrics;

/// Minimum step between consecutive escalation speeds, in gwei. Keeps
/// escalation moving when the oracle reports nearly flat tiers.
const MIN_ESCALATION_STEP_GWEI: u64 = 10;

pub fn gwei(amount: u64) -> U256 {
    U256::from(amount) * U256::exp10(9)
}

fn u256_to_gwei(amount: U256) -> i64 {
    (amount / U256::exp10(9)).min(U256::from(i64::MAX as u64)).as_u64() as i64
}

/// Speed a task has earned from its age: one bump per full interval on top
/// of the configured base.
pub fn speed_for_elapsed(base_speed: u64, elapsed_ms: u64, bump_interval_ms: u64) -> u64 {
    if bump_interval_ms == 0 {
        return base_speed;
    }
    base_speed + elapsed_ms / bump_interval_ms
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPriceTiers {
    pub standard: U256,
    pub fast: U256,
    pub instant: U256,
}

impl GasPriceTiers {
    /// All tiers pinned to one price. Used when only the node's own
    /// `eth_gasPrice` is available.
    pub fn uniform(price: U256) -> Self {
        Self {
            standard: price,
            fast: price,
            instant: price,
        }
    }

    pub fn validate(&self) -> RelayerResult<()> {
        if self.standard > self.fast || self.fast > self.instant {
            return Err(RelayerError::ProviderError(format!(
                "gas price tiers not monotone: standard={} fast={} instant={}",
                self.standard, self.fast, self.instant
            )));
        }
        Ok(())
    }

    /// Price for an escalation speed. Speeds 0 and 1 map to the standard and
    /// fast tiers; from speed 2 on, each extra speed adds the fast/instant
    /// spread, floored at [`MIN_ESCALATION_STEP_GWEI`].
    pub fn price_for_speed(&self, speed: u64) -> U256 {
        match speed {
            0 => self.standard,
            1 => self.fast,
            s => {
                let step = std::cmp::max(
                    self.instant.saturating_sub(self.fast),
                    gwei(MIN_ESCALATION_STEP_GWEI),
                );
                self.instant + step * U256::from(s - 2)
            }
        }
    }

    pub fn price_for_speed_capped(&self, speed: u64, max_price: U256) -> U256 {
        std::cmp::min(self.price_for_speed(speed), max_price)
    }
}

/// Source of the destination chain's own notion of gas price, used when no
/// oracle is configured or the oracle is down.
#[async_trait]
pub trait ChainGasOracle: Send + Sync {
    async fn gas_price(&self) -> RelayerResult<U256>;
}

/// Tier table published by an external oracle, prices in gwei.
#[derive(Debug, Deserialize)]
struct OracleResponse {
    standard: f64,
    fast: f64,
    instant: f64,
}

impl OracleResponse {
    fn into_tiers(self) -> RelayerResult<GasPriceTiers> {
        let to_wei = |gwei_amount: f64| -> RelayerResult<U256> {
            if !gwei_amount.is_finite() || gwei_amount < 0.0 {
                return Err(RelayerError::ProviderError(format!(
                    "oracle reported invalid gas price: {}",
                    gwei_amount
                )));
            }
            Ok(U256::from((gwei_amount * 1e9) as u128))
        };
        let tiers = GasPriceTiers {
            standard: to_wei(self.standard)?,
            fast: to_wei(self.fast)?,
            instant: to_wei(self.instant)?,
        };
        tiers.validate()?;
        Ok(tiers)
    }
}

pub struct GasPriceService {
    chain_name: String,
    oracle_url: Option<Url>,
    client: reqwest::Client,
    chain: Arc<dyn ChainGasOracle>,
    cache_ttl: Duration,
    max_gas_price: U256,
    snapshot: RwLock<Option<(Instant, GasPriceTiers)>>,
    metrics: Arc<RelayerMetrics>,
}

impl GasPriceService {
    pub fn new(
        chain_name: String,
        oracle_url: Option<Url>,
        chain: Arc<dyn ChainGasOracle>,
        cache_ttl: Duration,
        max_gas_price: U256,
        metrics: Arc<RelayerMetrics>,
    ) -> Self {
        Self {
            chain_name,
            oracle_url,
            client: reqwest::Client::new(),
            chain,
            cache_ttl,
            max_gas_price,
            snapshot: RwLock::new(None),
            metrics,
        }
    }

    pub fn max_gas_price(&self) -> U256 {
        self.max_gas_price
    }

    /// Current tier table, refreshed when the cached snapshot is older than
    /// the TTL. A stale snapshot is served when every source is down.
    pub async fn tiers(&self) -> RelayerResult<GasPriceTiers> {
        {
            let snapshot = self.snapshot.read().await;
            if let Some((at, tiers)) = snapshot.as_ref() {
                if at.elapsed() < self.cache_ttl {
                    return Ok(*tiers);
                }
            }
        }
        let mut snapshot = self.snapshot.write().await;
        // Another task may have refreshed while we waited for the write lock.
        if let Some((at, tiers)) = snapshot.as_ref() {
            if at.elapsed() < self.cache_ttl {
                return Ok(*tiers);
            }
        }
        match self.fetch_tiers().await {
            Ok(tiers) => {
                *snapshot = Some((Instant::now(), tiers));
                self.publish_tier_metrics(&tiers);
                Ok(tiers)
            }
            Err(e) => {
                self.metrics.gas_price_refresh_failures.inc();
                if let Some((_, stale)) = snapshot.as_ref() {
                    tracing::warn!(
                        "[{}] gas price refresh failed, serving stale tiers: {:?}",
                        self.chain_name,
                        e
                    );
                    Ok(*stale)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn fetch_tiers(&self) -> RelayerResult<GasPriceTiers> {
        if let Some(url) = &self.oracle_url {
            match self.fetch_oracle(url).await {
                Ok(tiers) => return Ok(tiers),
                Err(e) => {
                    tracing::warn!(
                        "[{}] gas oracle unavailable, falling back to node price: {:?}",
                        self.chain_name,
                        e
                    );
                }
            }
        }
        let price = self.chain.gas_price().await?;
        Ok(GasPriceTiers::uniform(price))
    }

    async fn fetch_oracle(&self, url: &Url) -> RelayerResult<GasPriceTiers> {
        let response = self
            .client
            .get(url.clone())
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| RelayerError::TransientProviderError(e.to_string()))?
            .error_for_status()
            .map_err(|e| RelayerError::TransientProviderError(e.to_string()))?;
        let parsed: OracleResponse = response
            .json()
            .await
            .map_err(|e| RelayerError::SerializationError(e.to_string()))?;
        parsed.into_tiers()
    }

    fn publish_tier_metrics(&self, tiers: &GasPriceTiers) {
        self.metrics
            .gas_price_gwei
            .with_label_values(&["standard"])
            .set(u256_to_gwei(tiers.standard));
        self.metrics
            .gas_price_gwei
            .with_label_values(&["fast"])
            .set(u256_to_gwei(tiers.fast));
        self.metrics
            .gas_price_gwei
            .with_label_values(&["instant"])
            .set(u256_to_gwei(tiers.instant));
    }
}
