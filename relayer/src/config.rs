// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use bridge_relayer_config::Config;
use ethers::abi::{Event, HumanReadableParser};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

use crate::error::RelayerError;
use crate::eth_client::{ChainApi, EthClient};
use crate::metrics::RelayerMetrics;

fn default_required_confirmations() -> u64 {
    6
}

fn default_start_block() -> u64 {
    0
}

fn default_max_block_range() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_retry_delay_ms() -> u64 {
    2_000
}

fn default_send_timeout_ms() -> u64 {
    60_000
}

fn default_receipt_timeout_ms() -> u64 {
    5_000
}

fn default_receipt_poll_delay_ms() -> u64 {
    1_000
}

fn default_lock_ttl_ms() -> u64 {
    60_000
}

fn default_lock_wait_ms() -> u64 {
    30_000
}

fn default_gas_bump_interval_ms() -> u64 {
    60_000
}

fn default_max_gas_price_gwei() -> u64 {
    250
}

fn default_gas_cache_ttl_ms() -> u64 {
    600_000
}

fn default_extra_gas_percent() -> u64 {
    25
}

/// The chain the watcher reads events from.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SourceChainConfig {
    // Rpc url of a fullnode, used for queries only.
    pub rpc_url: String,
    // The expected chain id; startup aborts on a mismatch.
    pub chain_id: u64,
    // Short label used in logs and metric labels, e.g. "home".
    pub name: String,
    // The contract whose events are relayed.
    pub event_contract_address: String,
    // Human-readable signature of the watched event, e.g.
    // "event MessageSent(bytes32 indexed messageId, bytes message, bytes signatures)".
    pub event_abi: String,
    // Only events whose decoded arguments equal every entry here are
    // relayed, e.g. recipient = the bridge address. Empty relays all.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub event_arg_filters: BTreeMap<String, String>,
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u64,
    // First block to consider when no checkpoint is stored yet.
    #[serde(default = "default_start_block")]
    pub start_block: u64,
    // Cap on blocks fetched per cycle; the remainder carries over.
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl SourceChainConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// The chain the sender broadcasts to and the receiptor watches.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DestinationChainConfig {
    // Rpc url of a fullnode, used for queries and broadcasts.
    pub rpc_url: String,
    // The expected chain id; also bound into transaction signatures.
    pub chain_id: u64,
    // Short label used in logs and metric labels, e.g. "foreign".
    pub name: String,
    // The bridge contract relay calls are sent to.
    pub bridge_contract_address: String,
    // Function that applies a relayed message, e.g. "executeSignatures(bytes,bytes)".
    pub relay_function: String,
    // View function answering whether a message id was already relayed,
    // e.g. "relayedMessages(bytes32)".
    pub processed_function: String,
    // Addresses whose signatures count towards the threshold.
    pub authorized_signers: Vec<String>,
    pub signature_threshold: usize,
    // Blocks a relay transaction must be buried under before it is final.
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u64,
    // Blocks to wait for a missing receipt before the broadcast is
    // presumed dropped. No default on purpose: it depends on block time.
    pub max_wait_blocks: u64,
}

/// Escalation tier a task starts at. Age bumps it further, see the gas
/// price service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GasSpeed {
    Standard,
    Fast,
    Instant,
}

impl GasSpeed {
    pub fn base_speed(self) -> u64 {
        match self {
            GasSpeed::Standard => 0,
            GasSpeed::Fast => 1,
            GasSpeed::Instant => 2,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct GasConfig {
    // Oracle endpoint answering {"standard":..,"fast":..,"instant":..} in
    // gwei. Without one, the node's own gas price is used for every tier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oracle_url: Option<String>,
    #[serde(default = "GasConfig::default_speed_type")]
    pub speed_type: GasSpeed,
    #[serde(default = "default_gas_bump_interval_ms")]
    pub bump_interval_ms: u64,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_gas_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    // Headroom on top of the gas estimate, in percent.
    #[serde(default = "default_extra_gas_percent")]
    pub extra_gas_percent: u64,
}

impl GasConfig {
    fn default_speed_type() -> GasSpeed {
        GasSpeed::Standard
    }

    pub fn bump_interval(&self) -> Duration {
        Duration::from_millis(self.bump_interval_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            oracle_url: None,
            speed_type: Self::default_speed_type(),
            bump_interval_ms: default_gas_bump_interval_ms(),
            max_gas_price_gwei: default_max_gas_price_gwei(),
            cache_ttl_ms: default_gas_cache_ttl_ms(),
            extra_gas_percent: default_extra_gas_percent(),
        }
    }
}

/// Where checkpoints and the nonce cache live.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StoreConfig {
    // Durable single-node default.
    File { path: PathBuf },
    // Test and throwaway deployments only; state dies with the process.
    Memory,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayerNodeConfig {
    // Identity of this relay direction, prefixed to logs and store keys.
    pub relay_id: String,
    // The port for the metrics server.
    pub metrics_port: u16,
    // Path of the file holding the destination signer key (hex).
    pub signer_key_path: PathBuf,
    pub source: SourceChainConfig,
    pub destination: DestinationChainConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub gas: GasConfig,
    // Delay before a failed send task is offered again.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_receipt_timeout_ms")]
    pub receipt_timeout_ms: u64,
    // Delay between checks of the same pending transaction.
    #[serde(default = "default_receipt_poll_delay_ms")]
    pub receipt_poll_delay_ms: u64,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    // Watchdog budget per component. Absent: four polling intervals.
    // Zero: watchdog disabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_processing_time_ms: Option<u64>,
}

impl Config for RelayerNodeConfig {}

impl RelayerNodeConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.receipt_timeout_ms)
    }

    pub fn receipt_poll_delay(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_delay_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn max_processing_time(&self) -> Option<Duration> {
        match self.max_processing_time_ms {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => Some(Duration::from_millis(
                4 * self.source.poll_interval_ms.max(self.receipt_poll_delay_ms),
            )),
        }
    }

    /// Check the config against the live chains and build the runtime
    /// clients. A chain-id mismatch is fatal and non-retryable.
    pub async fn validate(&self, metrics: Arc<RelayerMetrics>) -> anyhow::Result<RelayerRunConfig> {
        info!("Starting config validation");
        let event = HumanReadableParser::parse_event(&self.source.event_abi)
            .map_err(|e| anyhow!("invalid event abi {:?}: {}", self.source.event_abi, e))?;
        let event_contract = Address::from_str(&self.source.event_contract_address)
            .map_err(|e| anyhow!("invalid event contract address: {}", e))?;
        let bridge_contract = Address::from_str(&self.destination.bridge_contract_address)
            .map_err(|e| anyhow!("invalid bridge contract address: {}", e))?;
        let authorized_signers = self
            .destination
            .authorized_signers
            .iter()
            .map(|s| {
                Address::from_str(s).map_err(|e| anyhow!("invalid authorized signer {}: {}", s, e))
            })
            .collect::<anyhow::Result<Vec<Address>>>()?;
        if self.destination.signature_threshold == 0
            || self.destination.signature_threshold > authorized_signers.len()
        {
            return Err(anyhow!(
                "signature threshold {} out of range for {} authorized signers",
                self.destination.signature_threshold,
                authorized_signers.len()
            ));
        }
        if self.source.max_block_range == 0 {
            return Err(anyhow!("max-block-range must be at least 1"));
        }
        let gas_oracle_url = self
            .gas
            .oracle_url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .context("invalid gas oracle url")?;

        let raw_key = std::fs::read_to_string(&self.signer_key_path)
            .with_context(|| format!("Failed to read signer key at {:?}", self.signer_key_path))?;
        let wallet = LocalWallet::from_str(raw_key.trim())
            .map_err(|e| anyhow!("signer key at {:?} is not valid: {}", self.signer_key_path, e))?
            .with_chain_id(self.destination.chain_id);
        info!("Loaded destination signer {:?}", wallet.address());

        let source_client = Arc::new(EthClient::connect(
            &self.source.rpc_url,
            &self.source.name,
            metrics.clone(),
        )?);
        expect_chain_id(source_client.as_ref(), self.source.chain_id).await?;
        let destination_client = Arc::new(
            EthClient::connect(
                &self.destination.rpc_url,
                &self.destination.name,
                metrics.clone(),
            )?
            .with_wallet(wallet),
        );
        expect_chain_id(destination_client.as_ref(), self.destination.chain_id).await?;

        info!("Config validation complete");
        Ok(RelayerRunConfig {
            config: self.clone(),
            source_client,
            destination_client,
            event,
            event_contract,
            bridge_contract,
            authorized_signers,
            gas_oracle_url,
        })
    }
}

async fn expect_chain_id(client: &EthClient, expected: u64) -> anyhow::Result<()> {
    let actual = ChainApi::chain_id(client).await?;
    if actual != expected {
        // Surfaced as an error type so main can exit with the dedicated code.
        return Err(RelayerError::IncompatibleChain(format!(
            "chain {} reports id {}, config expects {}",
            client.chain_name(),
            actual,
            expected
        ))
        .into());
    }
    info!("Connected to chain {} (id {})", client.chain_name(), actual);
    Ok(())
}

/// A validated config plus the runtime clients built from it.
#[derive(Debug)]
pub struct RelayerRunConfig {
    pub config: RelayerNodeConfig,
    pub source_client: Arc<EthClient>,
    pub destination_client: Arc<EthClient>,
    pub event: Event,
    pub event_contract: Address,
    pub bridge_contract: Address,
    pub authorized_signers: Vec<Address>,
    pub gas_oracle_url: Option<Url>,
}
