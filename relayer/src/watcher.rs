// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Source-chain event watcher.
//!
//! Each tick reads the chain height, derives the highest block old enough to
//! trust, fetches watched logs for the next unprocessed range and publishes
//! one task per decoded event. The checkpoint is written only after every
//! task of the range is enqueued; a crash in between re-emits tasks rather
//! than dropping them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ethers::abi::{Event, RawLog, Token};
use ethers::types::{Address, Bytes, Log};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RelayerResult;
use crate::eth_client::ChainApi;
use crate::metrics::RelayerMetrics;
use crate::queue::TaskQueue;
use crate::retry_with_max_elapsed_time;
use crate::storage::{last_processed_block_key, StateStore};
use crate::types::{EventTask, RelayEvent};
use crate::watchdog::ProgressHandle;

const RPC_RETRY_MAX_ELAPSED: Duration = Duration::from_secs(30);

pub struct WatcherParams {
    pub relay_id: String,
    pub contract: Address,
    pub event: Event,
    /// Equality filters on decoded arguments; events that do not match
    /// every entry are skipped. Empty relays every event.
    pub arg_filters: BTreeMap<String, String>,
    pub start_block: u64,
    pub required_confirmations: u64,
    pub max_block_range: u64,
    pub poll_interval: Duration,
}

pub struct EventWatcher {
    params: WatcherParams,
    checkpoint_key: String,
    chain: Arc<dyn ChainApi>,
    store: Arc<dyn StateStore>,
    send_queue: Arc<dyn TaskQueue<EventTask>>,
    metrics: Arc<RelayerMetrics>,
    progress: ProgressHandle,
}

impl EventWatcher {
    pub fn new(
        params: WatcherParams,
        chain: Arc<dyn ChainApi>,
        store: Arc<dyn StateStore>,
        send_queue: Arc<dyn TaskQueue<EventTask>>,
        metrics: Arc<RelayerMetrics>,
        progress: ProgressHandle,
    ) -> Self {
        let checkpoint_key = last_processed_block_key(&params.relay_id);
        Self {
            params,
            checkpoint_key,
            chain,
            store,
            send_queue,
            metrics,
            progress,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        info!(
            "[{}] event watcher started, watching {} on {}",
            self.params.relay_id, self.params.event.name, self.chain.chain_name()
        );
        let mut interval = tokio::time::interval(self.params.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[{}] event watcher shutting down", self.params.relay_id);
                    return;
                }
                _ = interval.tick() => {
                    match self.process_new_blocks().await {
                        Ok(()) => self.progress.touch(),
                        Err(e) => {
                            error!(
                                "[{}] failed to process new blocks: {:?}",
                                self.params.relay_id, e
                            );
                            self.metrics
                                .relayer_errors
                                .with_label_values(&[e.error_type()])
                                .inc();
                        }
                    }
                }
            }
        }
    }

    /// Highest block already committed as processed. A checkpoint behind the
    /// configured start block is ignored, the configured start wins.
    async fn last_processed_block(&self) -> RelayerResult<u64> {
        let start_floor = self.params.start_block.saturating_sub(1);
        let stored = self.store.get_u64(&self.checkpoint_key).await?;
        Ok(stored.map_or(start_floor, |block| block.max(start_floor)))
    }

    async fn process_new_blocks(&self) -> RelayerResult<()> {
        let Ok(Ok(height)) =
            retry_with_max_elapsed_time!(self.chain.block_number(), RPC_RETRY_MAX_ELAPSED)
        else {
            warn!(
                "[{}] giving up on block height until next tick",
                self.params.relay_id
            );
            return Ok(());
        };
        self.metrics
            .latest_observed_block
            .with_label_values(&[&self.params.relay_id])
            .set(height as i64);

        // Only blocks buried under the required confirmations are eligible.
        let Some(last_block_to_process) = height.checked_sub(self.params.required_confirmations)
        else {
            return Ok(());
        };
        let last_processed = self.last_processed_block().await?;
        if last_block_to_process <= last_processed {
            return Ok(());
        }

        let from_block = last_processed + 1;
        let to_block = last_block_to_process.min(last_processed + self.params.max_block_range);

        let Ok(Ok(logs)) = retry_with_max_elapsed_time!(
            self.chain.get_logs(
                self.params.contract,
                self.params.event.signature(),
                from_block,
                to_block
            ),
            RPC_RETRY_MAX_ELAPSED
        ) else {
            warn!(
                "[{}] giving up on logs {}..={} until next tick",
                self.params.relay_id, from_block, to_block
            );
            return Ok(());
        };

        let mut published = 0usize;
        for log in logs {
            let Some(task) = self.decode_log(log) else {
                continue;
            };
            if !self.matches_arg_filters(&task) {
                continue;
            }
            self.metrics
                .observed_events
                .with_label_values(&[&self.params.relay_id, &task.event.event_name])
                .inc();
            self.send_queue.publish(task).await?;
            published += 1;
        }

        // Empty ranges advance the checkpoint too; confirmations already
        // shield these blocks from reorgs.
        self.store.set_u64(&self.checkpoint_key, to_block).await?;
        self.metrics
            .last_processed_block
            .with_label_values(&[&self.params.relay_id])
            .set(to_block as i64);
        info!(
            "[{}] processed blocks {}..={}, published {} tasks",
            self.params.relay_id, from_block, to_block, published
        );
        Ok(())
    }

    /// An event missing a filtered argument never matches.
    fn matches_arg_filters(&self, task: &EventTask) -> bool {
        let matched = self
            .params
            .arg_filters
            .iter()
            .all(|(name, want)| task.event.args.get(name) == Some(want));
        if !matched {
            debug!(
                "[{}] event {} does not match the argument filters, skipping",
                self.params.relay_id,
                task.reference()
            );
        }
        matched
    }

    fn decode_log(&self, log: Log) -> Option<EventTask> {
        let (Some(block_number), Some(tx_hash), Some(log_index)) =
            (log.block_number, log.transaction_hash, log.log_index)
        else {
            warn!(
                "[{}] skipping pending log without block metadata",
                self.params.relay_id
            );
            return None;
        };
        let raw = RawLog {
            topics: log.topics.clone(),
            data: log.data.to_vec(),
        };
        match self.params.event.parse_log(raw) {
            Ok(parsed) => {
                let mut args = BTreeMap::new();
                for param in parsed.params {
                    args.insert(param.name, token_to_string(&param.value));
                }
                Some(EventTask::new(
                    self.params.relay_id.clone(),
                    RelayEvent {
                        tx_hash,
                        block_number: block_number.as_u64(),
                        log_index: log_index.as_u64(),
                        address: log.address,
                        topics: log.topics,
                        data: log.data,
                        event_name: self.params.event.name.clone(),
                        args,
                    },
                ))
            }
            Err(e) => {
                error!(
                    "[{}] failed to decode log {:?}#{} : {:?}",
                    self.params.relay_id, tx_hash, log_index, e
                );
                self.metrics
                    .relayer_errors
                    .with_label_values(&["serialization_error"])
                    .inc();
                None
            }
        }
    }
}

/// Stringify a decoded ABI value for the task payload.
fn token_to_string(token: &Token) -> String {
    match token {
        Token::Address(address) => format!("{:?}", address),
        Token::FixedBytes(bytes) | Token::Bytes(bytes) => {
            Bytes::from(bytes.clone()).to_string()
        }
        Token::Uint(value) | Token::Int(value) => value.to_string(),
        Token::Bool(value) => value.to_string(),
        Token::String(value) => value.clone(),
        Token::Array(items) | Token::FixedArray(items) | Token::Tuple(items) => {
            let inner: Vec<String> = items.iter().map(token_to_string).collect();
            format!("[{}]", inner.join(","))
        }
    }
}
