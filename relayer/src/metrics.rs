// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Registry,
};

const FINE_GRAINED_LATENCY_SEC_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1., 2.5, 5., 10., 20., 30., 60., 90.,
];

#[derive(Clone, Debug)]
pub struct RelayerMetrics {
    /// Highest block committed as processed, per relay.
    pub last_processed_block: IntGaugeVec,
    /// Latest chain height the watcher has observed, per relay.
    pub latest_observed_block: IntGaugeVec,
    /// Events decoded out of watched logs, per relay and event name.
    pub observed_events: IntCounterVec,
    /// Send attempts by terminal label, per relay.
    pub send_results: IntCounterVec,
    /// Receipt checks by outcome label, per relay.
    pub receipt_results: IntCounterVec,
    /// Event tasks pushed back for another broadcast, per relay.
    pub resent_tasks: IntCounterVec,
    /// Placeholder self-transfers broadcast to consume an orphaned nonce.
    pub dummy_transactions: IntCounterVec,
    /// Times the cached nonce was discarded in favor of the chain's count.
    pub nonce_refreshes: IntCounterVec,
    /// Tasks waiting in each queue.
    pub queue_depth: IntGaugeVec,
    /// Current gas price per speed tier, in gwei.
    pub gas_price_gwei: IntGaugeVec,
    /// Failed refreshes of the gas price snapshot.
    pub gas_price_refresh_failures: IntCounter,
    /// Wall time from task pickup to broadcast result, per relay.
    pub broadcast_latency: HistogramVec,
    /// RPC queries issued through the metered providers.
    pub rpc_queries: IntCounterVec,
    pub rpc_query_latency: HistogramVec,
    /// 1 while the last RPC against the node succeeded, 0 after a failure.
    pub node_connected: IntGaugeVec,
    /// Errors surfaced by any component, labeled by error type.
    pub relayer_errors: IntCounterVec,
    pub uptime_seconds: IntGauge,
}

impl RelayerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            last_processed_block: register_int_gauge_vec_with_registry!(
                "last_processed_block",
                "Highest source block committed as processed",
                &["relay"],
                registry,
            )
            .unwrap(),
            latest_observed_block: register_int_gauge_vec_with_registry!(
                "latest_observed_block",
                "Latest source chain height observed",
                &["relay"],
                registry,
            )
            .unwrap(),
            observed_events: register_int_counter_vec_with_registry!(
                "observed_events",
                "Watched events decoded from source logs",
                &["relay", "event"],
                registry,
            )
            .unwrap(),
            send_results: register_int_counter_vec_with_registry!(
                "send_results",
                "Broadcast attempts by result",
                &["relay", "result"],
                registry,
            )
            .unwrap(),
            receipt_results: register_int_counter_vec_with_registry!(
                "receipt_results",
                "Receipt checks by outcome",
                &["relay", "result"],
                registry,
            )
            .unwrap(),
            resent_tasks: register_int_counter_vec_with_registry!(
                "resent_tasks",
                "Event tasks re-enqueued to replace a dead broadcast",
                &["relay"],
                registry,
            )
            .unwrap(),
            dummy_transactions: register_int_counter_vec_with_registry!(
                "dummy_transactions",
                "Self transfers sent to consume an orphaned nonce",
                &["relay"],
                registry,
            )
            .unwrap(),
            nonce_refreshes: register_int_counter_vec_with_registry!(
                "nonce_refreshes",
                "Cached nonce resets to the chain transaction count",
                &["relay"],
                registry,
            )
            .unwrap(),
            queue_depth: register_int_gauge_vec_with_registry!(
                "queue_depth",
                "Tasks waiting in each queue",
                &["queue"],
                registry,
            )
            .unwrap(),
            gas_price_gwei: register_int_gauge_vec_with_registry!(
                "gas_price_gwei",
                "Current gas price per speed tier",
                &["speed"],
                registry,
            )
            .unwrap(),
            gas_price_refresh_failures: register_int_counter_with_registry!(
                "gas_price_refresh_failures",
                "Failed refreshes of the gas price snapshot",
                registry,
            )
            .unwrap(),
            broadcast_latency: register_histogram_vec_with_registry!(
                "broadcast_latency",
                "Seconds from task pickup to broadcast result",
                &["relay"],
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            rpc_queries: register_int_counter_vec_with_registry!(
                "rpc_queries",
                "RPC queries issued, by chain and method",
                &["chain", "method"],
                registry,
            )
            .unwrap(),
            rpc_query_latency: register_histogram_vec_with_registry!(
                "rpc_query_latency",
                "RPC query latency in seconds, by chain and method",
                &["chain", "method"],
                FINE_GRAINED_LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            node_connected: register_int_gauge_vec_with_registry!(
                "node_connected",
                "Whether the last RPC against the node succeeded",
                &["chain"],
                registry,
            )
            .unwrap(),
            relayer_errors: register_int_counter_vec_with_registry!(
                "relayer_errors",
                "Errors surfaced by any component, by error type",
                &["type"],
                registry,
            )
            .unwrap(),
            uptime_seconds: register_int_gauge_with_registry!(
                "uptime_seconds",
                "Seconds since the relayer process started",
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}
