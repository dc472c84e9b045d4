// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;

use ethers::providers::{Http, HttpClientError, JsonRpcClient, Provider};
use serde::{de::DeserializeOwned, Serialize};
use url::ParseError;

use crate::metrics::RelayerMetrics;

/// An HTTP JSON-RPC transport that counts queries and tracks latency per
/// method, and flips the per-chain connectivity gauge on failures.
#[derive(Debug, Clone)]
pub struct MeteredHttpProvider {
    chain_name: String,
    inner: Http,
    metrics: Arc<RelayerMetrics>,
}

impl MeteredHttpProvider {
    pub fn new(
        url: &str,
        chain_name: String,
        metrics: Arc<RelayerMetrics>,
    ) -> Result<Self, ParseError> {
        let inner = Http::from_str(url)?;
        Ok(Self {
            chain_name,
            inner,
            metrics,
        })
    }
}

#[async_trait::async_trait]
impl JsonRpcClient for MeteredHttpProvider {
    type Error = HttpClientError;

    async fn request<T, R>(&self, method: &str, params: T) -> Result<R, Self::Error>
    where
        T: Debug + Serialize + Send + Sync,
        R: DeserializeOwned + Send,
    {
        self.metrics
            .rpc_queries
            .with_label_values(&[&self.chain_name, method])
            .inc();
        let _timer = self
            .metrics
            .rpc_query_latency
            .with_label_values(&[&self.chain_name, method])
            .start_timer();
        let result = self.inner.request(method, params).await;
        let connected = self
            .metrics
            .node_connected
            .with_label_values(&[&self.chain_name]);
        match &result {
            Ok(_) => connected.set(1),
            Err(_) => connected.set(0),
        }
        result
    }
}

pub fn new_metered_provider(
    url: &str,
    chain_name: String,
    metrics: Arc<RelayerMetrics>,
) -> Result<Provider<MeteredHttpProvider>, ParseError> {
    let transport = MeteredHttpProvider::new(url, chain_name, metrics)?;
    Ok(Provider::new(transport))
}
