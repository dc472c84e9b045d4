// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Receipt tracking for broadcast transactions.
//!
//! Every broadcast gets a receipt task. The receiptor polls the destination
//! chain until the transaction is buried deep enough, and turns dead
//! broadcasts back into event tasks: a reverted transaction is resent with a
//! fresh nonce (the revert consumed the old one), a vanished transaction is
//! resent pinned to its old nonce so the replacement occupies the same slot.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::RelayerResult;
use crate::eth_client::ChainApi;
use crate::metrics::RelayerMetrics;
use crate::queue::{Delivery, TaskQueue};
use crate::types::{EventTask, ReceiptTask};
use crate::watchdog::ProgressHandle;

const IDLE_HEARTBEAT: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// Mined successfully and buried under enough blocks.
    Success { confirmations: u64 },
    /// Not in a block yet, keep polling.
    WaitingReceipt,
    /// Mined but too shallow to trust.
    WaitingK { confirmations: u64 },
    /// Still missing after the chain advanced past the waiting budget; the
    /// broadcast is considered dropped.
    Null,
    /// Mined and reverted.
    Failed,
    /// The receipt check itself did not answer in time.
    Timeout,
}

impl ReceiptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ReceiptOutcome::Success { .. } => "success",
            ReceiptOutcome::WaitingReceipt => "waiting_receipt",
            ReceiptOutcome::WaitingK { .. } => "waiting_k",
            ReceiptOutcome::Null => "null",
            ReceiptOutcome::Failed => "failed",
            ReceiptOutcome::Timeout => "timeout",
        }
    }
}

pub struct ReceiptorParams {
    pub relay_id: String,
    /// Delay before the next check of the same transaction.
    pub poll_delay: Duration,
    /// Hard cap on a single receipt RPC.
    pub receipt_timeout: Duration,
    /// Blocks past the broadcast height before a missing receipt counts as
    /// dropped.
    pub max_wait_blocks: u64,
    /// Blocks the chain must advance past the receipt's block before the
    /// transaction counts as final.
    pub required_confirmations: u64,
}

pub struct Receiptor {
    params: ReceiptorParams,
    chain: Arc<dyn ChainApi>,
    receipt_queue: Arc<dyn TaskQueue<ReceiptTask>>,
    send_queue: Arc<dyn TaskQueue<EventTask>>,
    metrics: Arc<RelayerMetrics>,
    progress: ProgressHandle,
}

impl Receiptor {
    pub fn new(
        params: ReceiptorParams,
        chain: Arc<dyn ChainApi>,
        receipt_queue: Arc<dyn TaskQueue<ReceiptTask>>,
        send_queue: Arc<dyn TaskQueue<EventTask>>,
        metrics: Arc<RelayerMetrics>,
        progress: ProgressHandle,
    ) -> Self {
        Self {
            params,
            chain,
            receipt_queue,
            send_queue,
            metrics,
            progress,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        info!("[{}] receiptor started", self.params.relay_id);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[{}] receiptor shutting down", self.params.relay_id);
                    return;
                }
                _ = tokio::time::sleep(IDLE_HEARTBEAT) => {
                    self.progress.touch();
                }
                delivery = self.receipt_queue.consume() => {
                    match delivery {
                        Ok(delivery) => {
                            if let Err(e) = self.process_delivery(delivery).await {
                                error!(
                                    "[{}] failed to settle receipt task: {:?}",
                                    self.params.relay_id, e
                                );
                                self.metrics
                                    .relayer_errors
                                    .with_label_values(&[e.error_type()])
                                    .inc();
                            }
                            self.progress.touch();
                        }
                        Err(e) => {
                            error!("[{}] receipt queue failed: {:?}", self.params.relay_id, e);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn process_delivery(&self, delivery: Delivery<ReceiptTask>) -> RelayerResult<()> {
        let task = delivery.task.clone();
        let outcome = match self.check(&task).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // The check could not run; try again later.
                warn!(
                    "[{}] receipt check errored for {:?}: {:?}",
                    self.params.relay_id, task.tx_hash, e
                );
                self.metrics
                    .relayer_errors
                    .with_label_values(&[e.error_type()])
                    .inc();
                return self
                    .receipt_queue
                    .nack_delayed(delivery, self.params.poll_delay)
                    .await;
            }
        };
        self.metrics
            .receipt_results
            .with_label_values(&[&self.params.relay_id, outcome.label()])
            .inc();

        match outcome {
            ReceiptOutcome::Success { confirmations } => {
                info!(
                    "[{}] {:?} confirmed with {} confirmations, event {} relayed",
                    self.params.relay_id,
                    task.tx_hash,
                    confirmations,
                    task.event.reference()
                );
                self.receipt_queue.ack(delivery).await
            }
            ReceiptOutcome::WaitingReceipt => {
                debug!(
                    "[{}] {:?} not mined yet (check {})",
                    self.params.relay_id,
                    task.tx_hash,
                    delivery.redeliveries + 1
                );
                self.receipt_queue
                    .nack_delayed(delivery, self.params.poll_delay)
                    .await
            }
            ReceiptOutcome::WaitingK { confirmations } => {
                debug!(
                    "[{}] {:?} at {} of {} confirmations",
                    self.params.relay_id,
                    task.tx_hash,
                    confirmations,
                    self.params.required_confirmations
                );
                self.receipt_queue
                    .nack_delayed(delivery, self.params.poll_delay)
                    .await
            }
            ReceiptOutcome::Timeout => {
                error!(
                    "[{}] receipt check timed out for {:?}",
                    self.params.relay_id, task.tx_hash
                );
                self.receipt_queue
                    .nack_delayed(delivery, self.params.poll_delay)
                    .await
            }
            ReceiptOutcome::Null => {
                // Dropped from the pool. Resend pinned to the same nonce so
                // the replacement fills the now-orphaned slot.
                warn!(
                    "[{}] {:?} missing for over {} blocks, resending event {} pinned to nonce {}",
                    self.params.relay_id,
                    task.tx_hash,
                    self.params.max_wait_blocks,
                    task.event.reference(),
                    task.nonce
                );
                self.resend(task.event.retry_with_nonce(Some(task.nonce)))
                    .await?;
                self.receipt_queue.ack(delivery).await
            }
            ReceiptOutcome::Failed => {
                // The revert consumed the nonce; the resend takes a new one.
                error!(
                    "[{}] {:?} reverted on chain, resending event {}",
                    self.params.relay_id,
                    task.tx_hash,
                    task.event.reference()
                );
                self.resend(task.event.retry_with_nonce(None)).await?;
                self.receipt_queue.ack(delivery).await
            }
        }
    }

    async fn resend(&self, task: EventTask) -> RelayerResult<()> {
        self.metrics
            .resent_tasks
            .with_label_values(&[&self.params.relay_id])
            .inc();
        self.send_queue.publish(task).await
    }

    async fn check(&self, task: &ReceiptTask) -> RelayerResult<ReceiptOutcome> {
        // Height before receipt, so confirmations are never overcounted.
        let height = self.chain.block_number().await?;
        let fetched = tokio::time::timeout(
            self.params.receipt_timeout,
            self.chain.transaction_receipt(task.tx_hash),
        )
        .await;
        let receipt = match fetched {
            Err(_) => return Ok(ReceiptOutcome::Timeout),
            Ok(result) => result?,
        };
        let Some(receipt) = receipt else {
            if height.saturating_sub(task.sent_block) >= self.params.max_wait_blocks {
                return Ok(ReceiptOutcome::Null);
            }
            return Ok(ReceiptOutcome::WaitingReceipt);
        };
        let succeeded = receipt.status.map(|s| s.as_u64() == 1).unwrap_or(false);
        if !succeeded {
            return Ok(ReceiptOutcome::Failed);
        }
        let Some(block_number) = receipt.block_number else {
            return Ok(ReceiptOutcome::WaitingReceipt);
        };
        let confirmations = height.saturating_sub(block_number.as_u64());
        if confirmations >= self.params.required_confirmations {
            Ok(ReceiptOutcome::Success { confirmations })
        } else {
            Ok(ReceiptOutcome::WaitingK { confirmations })
        }
    }
}
