// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Destination-chain sender.
//!
//! Consumes event tasks one at a time, translates them into calls and
//! broadcasts them with an explicitly managed nonce. The nonce lease is held
//! from the moment the nonce is read until the broadcast result is applied.
//!
//! Nonce accounting follows two rules. The cached next nonce never falls
//! behind the chain's mined transaction count, and it only moves forward
//! (`max(stored, used + 1)`) except on an explicit resync after the node
//! rejects a nonce as too low. A resend task may pin the nonce of the
//! transaction it replaces; when that slot was consumed in the meantime the
//! pin is discarded, and when the slot is still open but the event needs no
//! broadcast anymore, a zero-value self transfer fills the slot so later
//! transactions do not sit behind a gap forever.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, TransactionRequest, H256, U256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{RelayerError, RelayerResult};
use crate::eth_client::ChainApi;
use crate::gas_price::{speed_for_elapsed, GasPriceService};
use crate::locker::Locker;
use crate::metrics::RelayerMetrics;
use crate::queue::{Delivery, TaskQueue};
use crate::storage::{nonce_key, nonce_lock_key, StateStore};
use crate::translator::{EventTranslator, TranslateError};
use crate::types::{now_ms, EventTask, ReceiptTask};
use crate::watchdog::ProgressHandle;

const DUMMY_TX_GAS: u64 = 21_000;
const IDLE_HEARTBEAT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum SendOutcome {
    /// Broadcast accepted; a receipt task tracks it from here.
    Success { tx_hash: H256, nonce: u64 },
    /// The node already knew the transaction. Tracked like a success but the
    /// cached nonce is not advanced; the earlier submission did that.
    TxImported { tx_hash: H256, nonce: u64 },
    /// Nothing to broadcast, the task is complete.
    Skipped,
    NonceTooLow,
    InsufficientFunds,
    BlockGasLimitExceeded,
    Timeout,
    Failed(RelayerError),
}

impl SendOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SendOutcome::Success { .. } => "success",
            SendOutcome::TxImported { .. } => "tx_imported",
            SendOutcome::Skipped => "skipped",
            SendOutcome::NonceTooLow => "nonce_too_low",
            SendOutcome::InsufficientFunds => "insufficient_funds",
            SendOutcome::BlockGasLimitExceeded => "block_gas_limit_exceeded",
            SendOutcome::Timeout => "timeout",
            SendOutcome::Failed(_) => "failed",
        }
    }
}

enum SendErrorKind {
    Imported,
    NonceTooLow,
    InsufficientFunds,
    BlockGasLimit,
    Unknown,
}

/// Map a node rejection to its handling class by message. Geth and
/// OpenEthereum word these differently, so match loosely.
fn classify_send_error(message: &str) -> SendErrorKind {
    let message = message.to_lowercase();
    if message.contains("already imported")
        || message.contains("already known")
        || message.contains("alreadyknown")
        || message.contains("known transaction")
    {
        SendErrorKind::Imported
    } else if message.contains("nonce too low") || message.contains("nonce is too low") {
        SendErrorKind::NonceTooLow
    } else if message.contains("insufficient funds") {
        SendErrorKind::InsufficientFunds
    } else if message.contains("exceeds block gas limit") {
        SendErrorKind::BlockGasLimit
    } else {
        SendErrorKind::Unknown
    }
}

/// Cached next-nonce for the signer, persisted so restarts do not reuse a
/// nonce that is still pending in the pool.
struct NonceCache {
    relay_id: String,
    key: String,
    signer: Address,
    chain: Arc<dyn ChainApi>,
    store: Arc<dyn StateStore>,
    metrics: Arc<RelayerMetrics>,
}

impl NonceCache {
    fn new(
        relay_id: &str,
        signer: Address,
        chain: Arc<dyn ChainApi>,
        store: Arc<dyn StateStore>,
        metrics: Arc<RelayerMetrics>,
    ) -> Self {
        Self {
            relay_id: relay_id.to_string(),
            key: nonce_key(relay_id),
            signer,
            chain,
            store,
            metrics,
        }
    }

    /// Next nonce to use. Falls back to the chain's mined count when nothing
    /// is cached yet.
    async fn next(&self) -> RelayerResult<u64> {
        if let Some(cached) = self.store.get_u64(&self.key).await? {
            return Ok(cached);
        }
        let count = self.chain.transaction_count(self.signer).await?;
        self.store.set_u64(&self.key, count).await?;
        Ok(count)
    }

    /// Drop the cache and resync to the chain's mined count. Only called
    /// after the node proved the cache wrong.
    async fn refresh(&self) -> RelayerResult<u64> {
        let count = self.chain.transaction_count(self.signer).await?;
        self.store.set_u64(&self.key, count).await?;
        self.metrics
            .nonce_refreshes
            .with_label_values(&[&self.relay_id])
            .inc();
        info!(
            "[{}] nonce cache resynced to chain count {}",
            self.relay_id, count
        );
        Ok(count)
    }

    /// Mark `nonce` consumed. The stored value only moves forward.
    async fn record_used(&self, nonce: u64) -> RelayerResult<()> {
        let stored = self.store.get_u64(&self.key).await?.unwrap_or(0);
        let next = nonce + 1;
        if next > stored {
            self.store.set_u64(&self.key, next).await?;
        }
        Ok(())
    }
}

pub struct SenderParams {
    pub relay_id: String,
    /// Delay before a failed task is offered again.
    pub retry_delay: Duration,
    /// Hard cap on a single broadcast RPC.
    pub send_timeout: Duration,
    /// Headroom on top of the gas estimate, in percent.
    pub extra_gas_percent: u64,
    pub gas_base_speed: u64,
    pub gas_bump_interval: Duration,
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
}

pub struct Sender {
    params: SenderParams,
    lock_key: String,
    chain: Arc<dyn ChainApi>,
    locker: Arc<dyn Locker>,
    translator: Arc<dyn EventTranslator>,
    gas: Arc<GasPriceService>,
    send_queue: Arc<dyn TaskQueue<EventTask>>,
    receipt_queue: Arc<dyn TaskQueue<ReceiptTask>>,
    metrics: Arc<RelayerMetrics>,
    progress: ProgressHandle,
    nonce: NonceCache,
}

impl Sender {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: SenderParams,
        chain: Arc<dyn ChainApi>,
        store: Arc<dyn StateStore>,
        locker: Arc<dyn Locker>,
        translator: Arc<dyn EventTranslator>,
        gas: Arc<GasPriceService>,
        send_queue: Arc<dyn TaskQueue<EventTask>>,
        receipt_queue: Arc<dyn TaskQueue<ReceiptTask>>,
        metrics: Arc<RelayerMetrics>,
        progress: ProgressHandle,
    ) -> RelayerResult<Self> {
        let signer = chain.signer_address()?;
        let lock_key = nonce_lock_key(&params.relay_id);
        let nonce = NonceCache::new(&params.relay_id, signer, chain.clone(), store, metrics.clone());
        Ok(Self {
            params,
            lock_key,
            chain,
            locker,
            translator,
            gas,
            send_queue,
            receipt_queue,
            metrics,
            progress,
            nonce,
        })
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        info!("[{}] sender started", self.params.relay_id);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[{}] sender shutting down", self.params.relay_id);
                    return;
                }
                _ = tokio::time::sleep(IDLE_HEARTBEAT) => {
                    // Nothing to do is progress too.
                    self.progress.touch();
                }
                delivery = self.send_queue.consume() => {
                    match delivery {
                        Ok(delivery) => {
                            if let Err(e) = self.process_delivery(delivery).await {
                                error!(
                                    "[{}] failed to settle send task: {:?}",
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
                            error!("[{}] send queue failed: {:?}", self.params.relay_id, e);
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn process_delivery(&self, delivery: Delivery<EventTask>) -> RelayerResult<()> {
        let task = delivery.task.clone();
        let timer = self
            .metrics
            .broadcast_latency
            .with_label_values(&[&self.params.relay_id])
            .start_timer();
        let outcome = self.send_task(&task).await;
        drop(timer);
        self.metrics
            .send_results
            .with_label_values(&[&self.params.relay_id, outcome.label()])
            .inc();

        match outcome {
            SendOutcome::Success { tx_hash, nonce } => {
                info!(
                    "[{}] broadcast {:?} with nonce {} for event {}",
                    self.params.relay_id,
                    tx_hash,
                    nonce,
                    task.reference()
                );
                self.track_receipt(tx_hash, nonce, task).await?;
            }
            SendOutcome::TxImported { tx_hash, nonce } => {
                info!(
                    "[{}] node already knew {:?} (nonce {}), tracking receipt",
                    self.params.relay_id, tx_hash, nonce
                );
                self.track_receipt(tx_hash, nonce, task).await?;
            }
            SendOutcome::Skipped => {
                info!(
                    "[{}] nothing to broadcast for event {}",
                    self.params.relay_id,
                    task.reference()
                );
            }
            SendOutcome::BlockGasLimitExceeded => {
                // Retrying cannot shrink the transaction; drop it for good.
                error!(
                    "[{}] dropping event {}: transaction exceeds the block gas limit",
                    self.params.relay_id,
                    task.reference()
                );
            }
            SendOutcome::NonceTooLow => {
                warn!(
                    "[{}] nonce rejected as too low for event {}, retrying",
                    self.params.relay_id,
                    task.reference()
                );
                self.requeue(task.retry_with_nonce(None)).await?;
            }
            SendOutcome::Timeout => {
                error!(
                    "[{}] broadcast timed out after {:?} for event {}, retrying",
                    self.params.relay_id,
                    self.params.send_timeout,
                    task.reference()
                );
                self.requeue(task.retry_with_nonce(None)).await?;
            }
            SendOutcome::InsufficientFunds => {
                error!(
                    "[{}] signer cannot fund the transaction for event {}, retrying",
                    self.params.relay_id,
                    task.reference()
                );
                self.requeue(task.retry_with_nonce(task.nonce)).await?;
            }
            SendOutcome::Failed(ref e) => {
                error!(
                    "[{}] broadcast failed for event {}: {:?}, retrying",
                    self.params.relay_id,
                    task.reference(),
                    e
                );
                self.metrics
                    .relayer_errors
                    .with_label_values(&[e.error_type()])
                    .inc();
                self.requeue(task.retry_with_nonce(task.nonce)).await?;
            }
        }
        self.send_queue.ack(delivery).await
    }

    async fn requeue(&self, task: EventTask) -> RelayerResult<()> {
        self.send_queue
            .publish_delayed(task, self.params.retry_delay)
            .await
    }

    /// Hand a broadcast transaction to the receiptor, stamped with the height
    /// at broadcast time so the receipt wait can be bounded in blocks. The
    /// embedded task also gets its first-broadcast time set here if this was
    /// the first attempt that made it onto the wire; resend pricing measures
    /// elapsed time from that moment.
    async fn track_receipt(&self, tx_hash: H256, nonce: u64, task: EventTask) -> RelayerResult<()> {
        let sent_block = match self.chain.block_number().await {
            Ok(height) => height,
            Err(e) => {
                // Zero makes the receipt wait bound trip on the first check.
                warn!(
                    "[{}] could not read the chain height after broadcast: {:?}",
                    self.params.relay_id, e
                );
                0
            }
        };
        self.receipt_queue
            .publish(ReceiptTask::new(
                tx_hash,
                nonce,
                task.stamped(now_ms()),
                sent_block,
            ))
            .await
    }

    async fn send_task(&self, task: &EventTask) -> SendOutcome {
        // Translation does not touch the nonce, keep it outside the lease.
        let request = match self.translator.translate(task).await {
            Ok(Some(request)) => Some(request),
            Ok(None) => {
                info!(
                    "[{}] event {} needs no broadcast",
                    self.params.relay_id,
                    task.reference()
                );
                None
            }
            Err(e) if e.is_noop() => {
                info!(
                    "[{}] event {} needs no broadcast: {}",
                    self.params.relay_id,
                    task.reference(),
                    e
                );
                None
            }
            Err(TranslateError::Chain(e)) => return SendOutcome::Failed(e),
            Err(e) => return SendOutcome::Failed(RelayerError::Generic(e.to_string())),
        };

        let guard = match self
            .locker
            .acquire(&self.lock_key, self.params.lock_ttl, self.params.lock_wait)
            .await
        {
            Ok(guard) => guard,
            Err(e) => return SendOutcome::Failed(e),
        };
        let outcome = match request {
            Some(request) => self.broadcast(task, request).await,
            None => self.fill_or_skip(task).await,
        };
        drop(guard);
        outcome
    }

    /// A task that translates to nothing is done, unless it pinned a nonce
    /// whose slot is still open. That slot would block every later nonce, so
    /// it is consumed with a zero-value self transfer.
    async fn fill_or_skip(&self, task: &EventTask) -> SendOutcome {
        let Some(pinned) = task.nonce else {
            return SendOutcome::Skipped;
        };
        let authoritative = match self.chain.transaction_count(self.nonce.signer).await {
            Ok(count) => count,
            Err(e) => return SendOutcome::Failed(e),
        };
        if pinned < authoritative {
            info!(
                "[{}] nonce {} already consumed, event {} complete",
                self.params.relay_id,
                pinned,
                task.reference()
            );
            return SendOutcome::Skipped;
        }
        let price = match self.escalated_price(task).await {
            Ok(price) => price,
            Err(e) => return SendOutcome::Failed(e),
        };
        let signer = self.nonce.signer;
        let request = TransactionRequest::new()
            .from(signer)
            .to(signer)
            .value(0u64)
            .gas(DUMMY_TX_GAS)
            .gas_price(price)
            .nonce(pinned);
        warn!(
            "[{}] filling orphaned nonce {} with a self transfer for event {}",
            self.params.relay_id,
            pinned,
            task.reference()
        );
        let outcome = self.sign_and_send(request).await;
        if matches!(outcome, SendOutcome::Success { .. }) {
            self.metrics
                .dummy_transactions
                .with_label_values(&[&self.params.relay_id])
                .inc();
        }
        outcome
    }

    async fn broadcast(&self, task: &EventTask, request: TransactionRequest) -> SendOutcome {
        let nonce = match self.pick_nonce(task).await {
            Ok(nonce) => nonce,
            Err(e) => return SendOutcome::Failed(e),
        };
        let price = match self.escalated_price(task).await {
            Ok(price) => price,
            Err(e) => return SendOutcome::Failed(e),
        };
        let request = request
            .from(self.nonce.signer)
            .nonce(nonce)
            .gas_price(price);
        let estimate = match self.chain.estimate_gas(&request.clone().into()).await {
            Ok(estimate) => estimate,
            Err(e) => return SendOutcome::Failed(e),
        };
        let gas_limit = estimate * U256::from(100 + self.params.extra_gas_percent) / U256::from(100);
        self.sign_and_send(request.gas(gas_limit)).await
    }

    /// Pinned nonce if its slot is still open, otherwise the cached next.
    async fn pick_nonce(&self, task: &EventTask) -> RelayerResult<u64> {
        if let Some(pinned) = task.nonce {
            let authoritative = self.chain.transaction_count(self.nonce.signer).await?;
            if pinned >= authoritative {
                return Ok(pinned);
            }
            info!(
                "[{}] pinned nonce {} already consumed, allocating fresh",
                self.params.relay_id, pinned
            );
        }
        self.nonce.next().await
    }

    async fn escalated_price(&self, task: &EventTask) -> RelayerResult<U256> {
        let tiers = self.gas.tiers().await?;
        let speed = speed_for_elapsed(
            self.params.gas_base_speed,
            task.elapsed_ms(now_ms()),
            self.params.gas_bump_interval.as_millis() as u64,
        );
        Ok(tiers.price_for_speed_capped(speed, self.gas.max_gas_price()))
    }

    async fn sign_and_send(&self, request: TransactionRequest) -> SendOutcome {
        let signed = match self.chain.sign_transaction(request).await {
            Ok(signed) => signed,
            Err(e) => return SendOutcome::Failed(e),
        };
        let sent = tokio::time::timeout(
            self.params.send_timeout,
            self.chain.send_raw_transaction(signed.raw.clone()),
        )
        .await;
        match sent {
            Err(_) => SendOutcome::Timeout,
            Ok(Ok(_)) => {
                if let Err(e) = self.nonce.record_used(signed.nonce).await {
                    warn!(
                        "[{}] broadcast ok but nonce cache update failed: {:?}",
                        self.params.relay_id, e
                    );
                }
                SendOutcome::Success {
                    tx_hash: signed.hash,
                    nonce: signed.nonce,
                }
            }
            Ok(Err(e)) => match classify_send_error(&e.to_string()) {
                SendErrorKind::Imported => SendOutcome::TxImported {
                    tx_hash: signed.hash,
                    nonce: signed.nonce,
                },
                SendErrorKind::NonceTooLow => {
                    if let Err(refresh_err) = self.nonce.refresh().await {
                        warn!(
                            "[{}] nonce resync failed: {:?}",
                            self.params.relay_id, refresh_err
                        );
                    }
                    SendOutcome::NonceTooLow
                }
                SendErrorKind::InsufficientFunds => SendOutcome::InsufficientFunds,
                SendErrorKind::BlockGasLimit => SendOutcome::BlockGasLimitExceeded,
                SendErrorKind::Unknown => SendOutcome::Failed(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gas_price::gwei;
    use crate::locker::InProcessLocker;
    use crate::queue::MemoryTaskQueue;
    use crate::storage::MemoryStateStore;
    use crate::test_utils::{MockChain, ScriptedTranslator};
    use crate::translator::TranslateError;
    use crate::types::RelayEvent;
    use ethers::types::{Bytes, H256};
    use std::collections::BTreeMap;

    struct Harness {
        chain: Arc<MockChain>,
        translator: Arc<ScriptedTranslator>,
        store: Arc<MemoryStateStore>,
        send_queue: MemoryTaskQueue<EventTask>,
        receipt_queue: MemoryTaskQueue<ReceiptTask>,
        metrics: Arc<RelayerMetrics>,
        sender: Sender,
    }

    fn harness() -> Harness {
        harness_with_timeout(Duration::from_secs(2))
    }

    fn harness_with_timeout(send_timeout: Duration) -> Harness {
        telemetry_subscribers::init_for_testing();
        let chain = Arc::new(MockChain::new());
        let translator = Arc::new(ScriptedTranslator::new());
        let store = Arc::new(MemoryStateStore::new());
        let send_queue = MemoryTaskQueue::new("send");
        let receipt_queue = MemoryTaskQueue::new("receipt");
        let metrics = Arc::new(RelayerMetrics::new_for_testing());
        let gas = Arc::new(GasPriceService::new(
            "mock".to_string(),
            None,
            chain.clone(),
            Duration::ZERO,
            gwei(250),
            metrics.clone(),
        ));
        let params = SenderParams {
            relay_id: "eth-to-stc".to_string(),
            retry_delay: Duration::ZERO,
            send_timeout,
            extra_gas_percent: 25,
            gas_base_speed: 0,
            gas_bump_interval: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(5),
            lock_wait: Duration::from_secs(2),
        };
        let sender = Sender::new(
            params,
            chain.clone(),
            store.clone(),
            Arc::new(InProcessLocker::new()),
            translator.clone(),
            gas,
            Arc::new(send_queue.clone()),
            Arc::new(receipt_queue.clone()),
            metrics.clone(),
            ProgressHandle::detached(),
        )
        .unwrap();
        Harness {
            chain,
            translator,
            store,
            send_queue,
            receipt_queue,
            metrics,
            sender,
        }
    }

    fn task() -> EventTask {
        EventTask::new(
            "eth-to-stc".to_string(),
            RelayEvent {
                tx_hash: H256::repeat_byte(0x11),
                block_number: 4100,
                log_index: 0,
                address: Address::repeat_byte(0x13),
                topics: Vec::new(),
                data: Bytes::new(),
                event_name: "MessageSent".to_string(),
                args: BTreeMap::new(),
            },
        )
    }

    fn delivery(task: EventTask) -> Delivery<EventTask> {
        Delivery {
            task,
            redeliveries: 0,
        }
    }

    fn result_count(h: &Harness, label: &str) -> u64 {
        h.metrics
            .send_results
            .with_label_values(&["eth-to-stc", label])
            .get()
    }

    async fn stored_nonce(h: &Harness) -> Option<u64> {
        use crate::storage::StateStore;
        h.store.get_u64("eth-to-stc:nonce").await.unwrap()
    }

    async fn seed_nonce(h: &Harness, nonce: u64) {
        use crate::storage::StateStore;
        h.store.set_u64("eth-to-stc:nonce", nonce).await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_miss_uses_chain_count() {
        let h = harness();
        h.chain.push_transaction_count(Ok(20));
        h.chain.set_block_number(7000);

        h.sender.process_delivery(delivery(task())).await.unwrap();

        let signed = h.chain.signed_requests();
        assert_eq!(signed.len(), 1);
        assert_eq!(signed[0].nonce, Some(20u64.into()));
        // Estimate 100_000 plus 25 percent headroom.
        assert_eq!(signed[0].gas, Some(125_000u64.into()));
        assert_eq!(signed[0].gas_price, Some(gwei(10)));
        assert_eq!(stored_nonce(&h).await, Some(21));

        let receipt = h.receipt_queue.consume().await.unwrap().task;
        assert_eq!(receipt.nonce, 20);
        assert_eq!(receipt.event.event.tx_hash, H256::repeat_byte(0x11));
        assert_eq!(receipt.sent_block, 7000);
        // The first accepted broadcast stamps the task.
        assert!(receipt.event.timestamp_ms.is_some());
        assert_eq!(result_count(&h, "success"), 1);
        assert_eq!(h.send_queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_cached_nonce_used_without_chain_query() {
        let h = harness();
        seed_nonce(&h, 10).await;
        // No transaction_count scripted: a chain query would fail the test.

        h.sender.process_delivery(delivery(task())).await.unwrap();

        assert_eq!(h.chain.signed_requests()[0].nonce, Some(10u64.into()));
        assert_eq!(stored_nonce(&h).await, Some(11));
        assert_eq!(result_count(&h, "success"), 1);
    }

    #[tokio::test]
    async fn test_nonce_too_low_resyncs_and_retries() {
        let h = harness();
        seed_nonce(&h, 10).await;
        h.chain
            .push_send_result(Err(RelayerError::ProviderError("nonce too low".to_string())));
        h.chain.push_transaction_count(Ok(100));

        h.sender.process_delivery(delivery(task())).await.unwrap();

        assert_eq!(result_count(&h, "nonce_too_low"), 1);
        assert_eq!(stored_nonce(&h).await, Some(100));
        assert_eq!(
            h.metrics
                .nonce_refreshes
                .with_label_values(&["eth-to-stc"])
                .get(),
            1
        );

        // The retry allocates the resynced nonce and succeeds.
        let retry = h.send_queue.consume().await.unwrap();
        assert_eq!(retry.task.retries, 1);
        assert_eq!(retry.task.nonce, None);
        h.sender.process_delivery(retry).await.unwrap();

        let signed = h.chain.signed_requests();
        assert_eq!(signed[1].nonce, Some(100u64.into()));
        assert_eq!(stored_nonce(&h).await, Some(101));
    }

    #[tokio::test]
    async fn test_already_imported_tracks_receipt_without_increment() {
        let h = harness();
        seed_nonce(&h, 10).await;
        h.chain.push_send_result(Err(RelayerError::ProviderError(
            "transaction already known".to_string(),
        )));

        h.sender.process_delivery(delivery(task())).await.unwrap();

        assert_eq!(result_count(&h, "tx_imported"), 1);
        // The earlier submission advanced the cache; this one must not.
        assert_eq!(stored_nonce(&h).await, Some(10));
        let receipt = h.receipt_queue.consume().await.unwrap().task;
        assert_eq!(receipt.nonce, 10);
        assert_ne!(receipt.tx_hash, H256::zero());
        assert_eq!(h.send_queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_insufficient_funds_retries_without_increment() {
        let h = harness();
        seed_nonce(&h, 10).await;
        h.chain.push_send_result(Err(RelayerError::ProviderError(
            "insufficient funds for gas * price + value".to_string(),
        )));

        h.sender.process_delivery(delivery(task())).await.unwrap();

        assert_eq!(result_count(&h, "insufficient_funds"), 1);
        assert_eq!(stored_nonce(&h).await, Some(10));
        let retry = h.send_queue.consume().await.unwrap().task;
        assert_eq!(retry.retries, 1);
        assert_eq!(h.receipt_queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_block_gas_limit_drops_task() {
        let h = harness();
        seed_nonce(&h, 10).await;
        h.chain.push_send_result(Err(RelayerError::ProviderError(
            "exceeds block gas limit".to_string(),
        )));

        h.sender.process_delivery(delivery(task())).await.unwrap();

        assert_eq!(result_count(&h, "block_gas_limit_exceeded"), 1);
        assert_eq!(h.send_queue.len().await, 0);
        assert_eq!(h.receipt_queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_send_timeout_requeues() {
        let h = harness_with_timeout(Duration::from_millis(50));
        seed_nonce(&h, 10).await;
        h.chain.set_send_delay(Duration::from_millis(300));

        h.sender.process_delivery(delivery(task())).await.unwrap();

        assert_eq!(result_count(&h, "timeout"), 1);
        let retry = h.send_queue.consume().await.unwrap().task;
        assert_eq!(retry.retries, 1);
        assert_eq!(retry.nonce, None);
        // The nonce stays put until a broadcast is confirmed accepted.
        assert_eq!(stored_nonce(&h).await, Some(10));
    }

    #[tokio::test]
    async fn test_noop_without_pin_is_done() {
        let h = harness();
        h.translator.push(Err(TranslateError::AlreadyProcessed {
            reference: "x".to_string(),
        }));

        h.sender.process_delivery(delivery(task())).await.unwrap();

        assert_eq!(result_count(&h, "skipped"), 1);
        assert_eq!(h.send_queue.len().await, 0);
        assert_eq!(h.receipt_queue.len().await, 0);
        assert_eq!(h.chain.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_null_translation_skips() {
        let h = harness();
        h.translator.push(Ok(None));

        h.sender.process_delivery(delivery(task())).await.unwrap();

        assert_eq!(result_count(&h, "skipped"), 1);
        assert_eq!(h.chain.sent_count(), 0);
        assert_eq!(h.receipt_queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_noop_with_open_pin_sends_dummy() {
        let h = harness();
        h.translator.push(Err(TranslateError::AlreadyProcessed {
            reference: "x".to_string(),
        }));
        // Mined count 25, pinned 30: the slot is still open.
        h.chain.push_transaction_count(Ok(25));
        let pinned = task().retry_with_nonce(Some(30));

        h.sender.process_delivery(delivery(pinned)).await.unwrap();

        let signed = h.chain.signed_requests();
        assert_eq!(signed.len(), 1);
        assert_eq!(signed[0].to, Some(h.chain.wallet_address().into()));
        assert_eq!(signed[0].value, Some(0u64.into()));
        assert_eq!(signed[0].gas, Some(DUMMY_TX_GAS.into()));
        assert_eq!(signed[0].nonce, Some(30u64.into()));
        assert_eq!(
            h.metrics
                .dummy_transactions
                .with_label_values(&["eth-to-stc"])
                .get(),
            1
        );
        // The dummy is tracked like any broadcast.
        let receipt = h.receipt_queue.consume().await.unwrap().task;
        assert_eq!(receipt.nonce, 30);
        assert_eq!(stored_nonce(&h).await, Some(31));
        assert_eq!(result_count(&h, "success"), 1);
    }

    #[tokio::test]
    async fn test_noop_with_consumed_pin_skips() {
        let h = harness();
        h.translator.push(Err(TranslateError::AlreadyProcessed {
            reference: "x".to_string(),
        }));
        h.chain.push_transaction_count(Ok(31));
        let pinned = task().retry_with_nonce(Some(30));

        h.sender.process_delivery(delivery(pinned)).await.unwrap();

        assert_eq!(result_count(&h, "skipped"), 1);
        assert_eq!(h.chain.sent_count(), 0);
        assert_eq!(h.receipt_queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_pinned_nonce_reused_while_slot_open() {
        let h = harness();
        h.chain.push_transaction_count(Ok(28));
        let pinned = task().retry_with_nonce(Some(30));

        h.sender.process_delivery(delivery(pinned)).await.unwrap();

        assert_eq!(h.chain.signed_requests()[0].nonce, Some(30u64.into()));
        assert_eq!(stored_nonce(&h).await, Some(31));
    }

    #[tokio::test]
    async fn test_pinned_nonce_consumed_allocates_fresh() {
        let h = harness();
        // Slot check sees count 9, then the fresh allocation fetches 9 too.
        h.chain.push_transaction_count(Ok(9));
        h.chain.push_transaction_count(Ok(9));
        let pinned = task().retry_with_nonce(Some(5));

        h.sender.process_delivery(delivery(pinned)).await.unwrap();

        assert_eq!(h.chain.signed_requests()[0].nonce, Some(9u64.into()));
        assert_eq!(stored_nonce(&h).await, Some(10));
    }

    #[tokio::test]
    async fn test_translation_chain_error_retries() {
        let h = harness();
        h.translator.push(Err(TranslateError::Chain(
            RelayerError::TransientProviderError("rpc down".to_string()),
        )));

        h.sender.process_delivery(delivery(task())).await.unwrap();

        assert_eq!(result_count(&h, "failed"), 1);
        let retry = h.send_queue.consume().await.unwrap().task;
        assert_eq!(retry.retries, 1);
        assert_eq!(h.chain.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_gas_escalates_from_first_broadcast_time() {
        let h = harness();
        seed_nonce(&h, 10).await;
        // First broadcast went out ten minutes ago; the resend must pay more.
        let aged = task().stamped(now_ms().saturating_sub(10 * 60 * 1000));

        h.sender.process_delivery(delivery(aged)).await.unwrap();

        // Ten minutes at one bump per minute lands well past the instant
        // tier; uniform tiers escalate by the minimum step from speed 2 on.
        let price = h.chain.signed_requests()[0].gas_price.unwrap();
        assert!(price > gwei(10), "expected escalated price, got {}", price);
    }

    #[test]
    fn test_classify_send_error_variants() {
        assert!(matches!(
            classify_send_error("Transaction with the same hash was already imported"),
            SendErrorKind::Imported
        ));
        assert!(matches!(
            classify_send_error("already known"),
            SendErrorKind::Imported
        ));
        assert!(matches!(
            classify_send_error("Transaction nonce is too low"),
            SendErrorKind::NonceTooLow
        ));
        assert!(matches!(
            classify_send_error("insufficient funds for transfer"),
            SendErrorKind::InsufficientFunds
        ));
        assert!(matches!(
            classify_send_error("tx exceeds block gas limit"),
            SendErrorKind::BlockGasLimit
        ));
        assert!(matches!(
            classify_send_error("connection reset by peer"),
            SendErrorKind::Unknown
        ));
    }
}
