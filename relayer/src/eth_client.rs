// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Chain access for the pipeline.
//!
//! [`ChainApi`] is the full surface the watcher, sender and receiptor need:
//! height, logs, mined transaction counts, receipts, calls, estimation and
//! raw broadcast. [`EthClient`] implements it over any ethers transport.
//!
//! Transactions are signed locally and broadcast as raw payloads, so the
//! transaction hash is known before the node answers. A node that replies
//! "already known" therefore still leaves us with a hash to poll.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::providers::{JsonRpcClient, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockId, BlockNumber, Bytes, Filter, Log, TransactionReceipt, TransactionRequest,
    H256, U256,
};
use ethers::utils::keccak256;
use tap::TapFallible;

use crate::error::{RelayerError, RelayerResult};
use crate::gas_price::ChainGasOracle;
use crate::metered_provider::{new_metered_provider, MeteredHttpProvider};
use crate::metrics::RelayerMetrics;

const PROVIDER_POLL_INTERVAL: Duration = Duration::from_millis(2000);

/// A signed transaction ready for broadcast. The hash is derived from the
/// signed RLP payload, not from a node response.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub hash: H256,
    pub raw: Bytes,
    pub nonce: u64,
}

#[async_trait]
pub trait ChainApi: Send + Sync {
    fn chain_name(&self) -> &str;

    /// Address transactions are signed from. Errors when the chain was
    /// connected without a signing key.
    fn signer_address(&self) -> RelayerResult<Address>;

    async fn chain_id(&self) -> RelayerResult<u64>;

    async fn block_number(&self) -> RelayerResult<u64>;

    async fn get_logs(
        &self,
        address: Address,
        topic0: H256,
        from_block: u64,
        to_block: u64,
    ) -> RelayerResult<Vec<Log>>;

    /// Mined transaction count for `address`. Queried at the latest block,
    /// never the pending pool, so the answer only moves forward.
    async fn transaction_count(&self, address: Address) -> RelayerResult<u64>;

    async fn transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> RelayerResult<Option<TransactionReceipt>>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> RelayerResult<U256>;

    async fn call(&self, tx: &TypedTransaction) -> RelayerResult<Bytes>;

    async fn gas_price(&self) -> RelayerResult<U256>;

    async fn sign_transaction(&self, tx: TransactionRequest) -> RelayerResult<SignedTransaction>;

    /// Broadcast a signed payload. The node's error message is preserved
    /// verbatim so callers can classify it.
    async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256>;
}

#[derive(Debug, Clone)]
pub struct EthClient<P: JsonRpcClient = MeteredHttpProvider> {
    chain_name: String,
    provider: Provider<P>,
    wallet: Option<LocalWallet>,
}

impl EthClient<MeteredHttpProvider> {
    pub fn connect(
        url: &str,
        chain_name: &str,
        metrics: Arc<RelayerMetrics>,
    ) -> RelayerResult<Self> {
        let provider = new_metered_provider(url, chain_name.to_string(), metrics)
            .map_err(|e| {
                RelayerError::InvalidConfig(format!("invalid rpc url {}: {}", url, e))
            })?
            .interval(PROVIDER_POLL_INTERVAL);
        Ok(Self::new(provider, chain_name))
    }
}

impl<P: JsonRpcClient + 'static> EthClient<P> {
    pub fn new(provider: Provider<P>, chain_name: &str) -> Self {
        Self {
            chain_name: chain_name.to_string(),
            provider,
            wallet: None,
        }
    }

    pub fn with_wallet(mut self, wallet: LocalWallet) -> Self {
        self.wallet = Some(wallet);
        self
    }

    fn wallet(&self) -> RelayerResult<&LocalWallet> {
        self.wallet.as_ref().ok_or_else(|| {
            RelayerError::InvalidConfig(format!(
                "chain {} has no signing key configured",
                self.chain_name
            ))
        })
    }

    fn provider_err(&self, e: impl std::fmt::Display) -> RelayerError {
        RelayerError::ProviderError(format!("[{}] {}", self.chain_name, e))
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> ChainApi for EthClient<P> {
    fn chain_name(&self) -> &str {
        &self.chain_name
    }

    fn signer_address(&self) -> RelayerResult<Address> {
        Ok(self.wallet()?.address())
    }

    async fn chain_id(&self) -> RelayerResult<u64> {
        let id = self
            .provider
            .get_chainid()
            .await
            .map_err(|e| self.provider_err(e))?;
        Ok(id.as_u64())
    }

    async fn block_number(&self) -> RelayerResult<u64> {
        let number = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| self.provider_err(e))?;
        Ok(number.as_u64())
    }

    async fn get_logs(
        &self,
        address: Address,
        topic0: H256,
        from_block: u64,
        to_block: u64,
    ) -> RelayerResult<Vec<Log>> {
        let filter = Filter::new()
            .address(address)
            .topic0(topic0)
            .from_block(from_block)
            .to_block(to_block);
        self.provider
            .get_logs(&filter)
            .await
            .map_err(|e| self.provider_err(e))
            .tap_err(|e| {
                tracing::error!("get_logs failed. Filter: {:?}. Error {:?}", filter, e)
            })
    }

    async fn transaction_count(&self, address: Address) -> RelayerResult<u64> {
        let count = self
            .provider
            .get_transaction_count(address, Some(BlockId::Number(BlockNumber::Latest)))
            .await
            .map_err(|e| self.provider_err(e))?;
        Ok(count.as_u64())
    }

    async fn transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> RelayerResult<Option<TransactionReceipt>> {
        self.provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.provider_err(e))
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> RelayerResult<U256> {
        self.provider
            .estimate_gas(tx, None)
            .await
            .map_err(|e| self.provider_err(e))
    }

    async fn call(&self, tx: &TypedTransaction) -> RelayerResult<Bytes> {
        self.provider
            .call(tx, None)
            .await
            .map_err(|e| self.provider_err(e))
    }

    async fn gas_price(&self) -> RelayerResult<U256> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| self.provider_err(e))
    }

    async fn sign_transaction(&self, tx: TransactionRequest) -> RelayerResult<SignedTransaction> {
        let wallet = self.wallet()?;
        let nonce = tx
            .nonce
            .ok_or_else(|| {
                RelayerError::Generic("refusing to sign a transaction without a nonce".to_string())
            })?
            .as_u64();
        let typed = TypedTransaction::Legacy(tx);
        let signature = wallet
            .sign_transaction(&typed)
            .await
            .map_err(|e| RelayerError::Generic(format!("failed to sign transaction: {}", e)))?;
        let raw = typed.rlp_signed(&signature);
        let hash = H256::from(keccak256(&raw));
        Ok(SignedTransaction {
            hash,
            raw,
            nonce,
        })
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256> {
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(|e| self.provider_err(e))?;
        Ok(pending.tx_hash())
    }
}

#[async_trait]
impl<P: JsonRpcClient + 'static> ChainGasOracle for EthClient<P> {
    async fn gas_price(&self) -> RelayerResult<U256> {
        ChainApi::gas_price(self).await
    }
}
