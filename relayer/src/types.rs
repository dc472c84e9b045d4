// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use ethers::types::{Address, Bytes, H256};
use serde::{Deserialize, Serialize};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A decoded source-chain log, as carried inside an event task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEvent {
    /// Hash of the source transaction that emitted the event.
    pub tx_hash: H256,
    /// Block the event was observed in.
    pub block_number: u64,
    /// Index of the log within the source transaction.
    pub log_index: u64,
    /// Contract the log was emitted from.
    pub address: Address,
    /// Raw topics, kept so broker consumers can re-verify the decoding.
    pub topics: Vec<H256>,
    /// Raw data payload of the log.
    pub data: Bytes,
    /// Name of the event, as declared in the watched ABI.
    pub event_name: String,
    /// Decoded event arguments, stringified. BTreeMap keeps the wire
    /// encoding deterministic.
    pub args: BTreeMap<String, String>,
}

/// A watched source-chain event waiting to be relayed.
///
/// Tasks are produced by the watcher, consumed by the sender and re-enqueued
/// by the receiptor when a broadcast needs to be redone. Tasks are immutable
/// once queued; every retry is a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTask {
    /// Identity of the watcher that produced the task. A shared broker can
    /// carry tasks for several relay directions.
    pub event_type: String,
    pub event: RelayEvent,
    /// Nonce this task must reuse, set when a resend replaces a transaction
    /// whose nonce slot is still unconsumed.
    pub nonce: Option<u64>,
    /// Number of times this task has been re-enqueued.
    pub retries: u32,
    /// Unix millis of the first broadcast attempt. Unset until the sender
    /// gets a transaction out; gas escalation measures elapsed time from
    /// here, so a first attempt always prices at the base speed.
    pub timestamp_ms: Option<u64>,
}

impl EventTask {
    pub fn new(event_type: String, event: RelayEvent) -> Self {
        Self {
            event_type,
            event,
            nonce: None,
            retries: 0,
            timestamp_ms: None,
        }
    }

    /// Identity of the source event, used for logs and dedup checks.
    pub fn reference(&self) -> String {
        format!("{:?}#{}", self.event.tx_hash, self.event.log_index)
    }

    pub fn is_retry(&self) -> bool {
        self.retries > 0
    }

    /// A copy scheduled for another attempt. The broadcast timestamp is kept
    /// so the next attempt prices gas off the original broadcast age.
    pub fn retry_with_nonce(&self, nonce: Option<u64>) -> Self {
        Self {
            retries: self.retries + 1,
            nonce,
            ..self.clone()
        }
    }

    /// A copy with the first-broadcast time set, if it was not already.
    pub fn stamped(&self, now_ms: u64) -> Self {
        Self {
            timestamp_ms: Some(self.timestamp_ms.unwrap_or(now_ms)),
            ..self.clone()
        }
    }

    /// Milliseconds since the first broadcast attempt; zero before it.
    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        self.timestamp_ms
            .map_or(0, |started| now_ms.saturating_sub(started))
    }
}

/// A broadcast transaction whose receipt is still outstanding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptTask {
    /// Hash of the broadcast destination-chain transaction.
    pub tx_hash: H256,
    /// Nonce the transaction was sent with.
    pub nonce: u64,
    /// The event task that produced the broadcast. Resends are built from it.
    pub event: EventTask,
    /// Destination height at broadcast time. Bounds how many blocks the
    /// receiptor waits before declaring the transaction dropped.
    pub sent_block: u64,
    /// Unix millis at broadcast time.
    pub sent_at_ms: u64,
}

impl ReceiptTask {
    pub fn new(tx_hash: H256, nonce: u64, event: EventTask, sent_block: u64) -> Self {
        Self {
            tx_hash,
            nonce,
            event,
            sent_block,
            sent_at_ms: now_ms(),
        }
    }
}
