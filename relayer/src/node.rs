// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Assembles the pipeline out of a validated config and spawns it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{RelayerNodeConfig, StoreConfig};
use crate::eth_client::ChainApi;
use crate::gas_price::{gwei, GasPriceService};
use crate::locker::InProcessLocker;
use crate::metrics::RelayerMetrics;
use crate::queue::{MemoryTaskQueue, TaskQueue};
use crate::receiptor::{Receiptor, ReceiptorParams};
use crate::sender::{Sender, SenderParams};
use crate::storage::{FileStateStore, MemoryStateStore, StateStore};
use crate::translator::MessageRelayTranslator;
use crate::types::{EventTask, ReceiptTask};
use crate::watchdog::{ProgressHandle, Watchdog};
use crate::watcher::{EventWatcher, WatcherParams};

const UPTIME_REFRESH: Duration = Duration::from_secs(10);
const QUEUE_DEPTH_REFRESH: Duration = Duration::from_secs(10);

pub async fn run_relayer_node(
    config: RelayerNodeConfig,
    prometheus_registry: prometheus::Registry,
    cancel: CancellationToken,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let metrics = Arc::new(RelayerMetrics::new(&prometheus_registry));
    let start_time = std::time::Instant::now();

    // Start process uptime tracking task
    let uptime_metrics = metrics.clone();
    tokio::spawn(async move {
        loop {
            uptime_metrics
                .uptime_seconds
                .set(start_time.elapsed().as_secs() as i64);
            tokio::time::sleep(UPTIME_REFRESH).await;
        }
    });

    let run = config.validate(metrics.clone()).await?;

    let store: Arc<dyn StateStore> = match &config.store {
        StoreConfig::File { path } => Arc::new(FileStateStore::open(path).await?),
        StoreConfig::Memory => MemoryStateStore::new_shared(),
    };
    let locker = InProcessLocker::new_shared();
    let send_queue = MemoryTaskQueue::<EventTask>::new("send");
    let receipt_queue = MemoryTaskQueue::<ReceiptTask>::new("receipt");

    let source: Arc<dyn ChainApi> = run.source_client.clone();
    let destination: Arc<dyn ChainApi> = run.destination_client.clone();

    let gas = Arc::new(GasPriceService::new(
        config.destination.name.clone(),
        run.gas_oracle_url.clone(),
        run.destination_client.clone(),
        config.gas.cache_ttl(),
        gwei(config.gas.max_gas_price_gwei),
        metrics.clone(),
    ));
    let translator = Arc::new(MessageRelayTranslator::new(
        destination.clone(),
        run.bridge_contract,
        config.destination.relay_function.clone(),
        config.destination.processed_function.clone(),
        run.authorized_signers.clone(),
        config.destination.signature_threshold,
    ));

    let (watcher_progress, sender_progress, receiptor_progress, watchdog) =
        match config.max_processing_time() {
            Some(budget) => {
                let mut watchdog = Watchdog::new(budget);
                let watcher = watchdog.register("watcher");
                let sender = watchdog.register("sender");
                let receiptor = watchdog.register("receiptor");
                (watcher, sender, receiptor, Some(watchdog))
            }
            None => {
                info!("[{}] watchdog disabled by config", config.relay_id);
                (
                    ProgressHandle::detached(),
                    ProgressHandle::detached(),
                    ProgressHandle::detached(),
                    None,
                )
            }
        };

    let watcher = EventWatcher::new(
        WatcherParams {
            relay_id: config.relay_id.clone(),
            contract: run.event_contract,
            event: run.event.clone(),
            arg_filters: config.source.event_arg_filters.clone(),
            start_block: config.source.start_block,
            required_confirmations: config.source.required_confirmations,
            max_block_range: config.source.max_block_range,
            poll_interval: config.source.poll_interval(),
        },
        source,
        store.clone(),
        Arc::new(send_queue.clone()),
        metrics.clone(),
        watcher_progress,
    );
    let sender = Sender::new(
        SenderParams {
            relay_id: config.relay_id.clone(),
            retry_delay: config.retry_delay(),
            send_timeout: config.send_timeout(),
            extra_gas_percent: config.gas.extra_gas_percent,
            gas_base_speed: config.gas.speed_type.base_speed(),
            gas_bump_interval: config.gas.bump_interval(),
            lock_ttl: config.lock_ttl(),
            lock_wait: config.lock_wait(),
        },
        destination.clone(),
        store,
        locker,
        translator,
        gas,
        Arc::new(send_queue.clone()),
        Arc::new(receipt_queue.clone()),
        metrics.clone(),
        sender_progress,
    )?;
    let receiptor = Receiptor::new(
        ReceiptorParams {
            relay_id: config.relay_id.clone(),
            poll_delay: config.receipt_poll_delay(),
            receipt_timeout: config.receipt_timeout(),
            max_wait_blocks: config.destination.max_wait_blocks,
            required_confirmations: config.destination.required_confirmations,
        },
        destination,
        Arc::new(receipt_queue.clone()),
        Arc::new(send_queue.clone()),
        metrics.clone(),
        receiptor_progress,
    );

    let mut handles = vec![
        watcher.spawn(cancel.clone()),
        sender.spawn(cancel.clone()),
        receiptor.spawn(cancel.clone()),
        spawn_queue_depth_task(send_queue, receipt_queue, metrics, cancel.clone()),
    ];
    if let Some(watchdog) = watchdog {
        handles.push(watchdog.spawn(cancel));
    }

    info!("[{}] relayer node started", config.relay_id);
    Ok(handles)
}

fn spawn_queue_depth_task(
    send_queue: MemoryTaskQueue<EventTask>,
    receipt_queue: MemoryTaskQueue<ReceiptTask>,
    metrics: Arc<RelayerMetrics>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(QUEUE_DEPTH_REFRESH);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    metrics
                        .queue_depth
                        .with_label_values(&[send_queue.name()])
                        .set(send_queue.len().await as i64);
                    metrics
                        .queue_depth
                        .with_label_values(&[receipt_queue.name()])
                        .set(receipt_queue.len().await as i64);
                }
            }
        }
    })
}
