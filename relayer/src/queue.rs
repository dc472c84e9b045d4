// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Task queues linking the pipeline stages.
//!
//! The watcher publishes event tasks, the sender consumes them and publishes
//! receipt tasks, the receiptor consumes those and feeds resends back to the
//! event queue. Consumers take one delivery at a time and must settle it with
//! [`TaskQueue::ack`] or [`TaskQueue::nack_delayed`] before the next one, so
//! a stuck task never piles unfinished work behind it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::{RelayerError, RelayerResult};

/// One in-flight task handed to a consumer.
#[derive(Debug)]
pub struct Delivery<T> {
    pub task: T,
    /// How many times this delivery has been handed out before.
    pub redeliveries: u32,
}

#[async_trait]
pub trait TaskQueue<T: Send + 'static>: Send + Sync {
    async fn publish(&self, task: T) -> RelayerResult<()>;

    /// Publish after `delay`. Used for retry paths so a failing task does
    /// not spin hot against the chain.
    async fn publish_delayed(&self, task: T, delay: Duration) -> RelayerResult<()>;

    /// Wait for the next delivery.
    async fn consume(&self) -> RelayerResult<Delivery<T>>;

    /// Settle a delivery as done.
    async fn ack(&self, delivery: Delivery<T>) -> RelayerResult<()>;

    /// Return a delivery to the queue for another attempt after `delay`.
    async fn nack_delayed(&self, delivery: Delivery<T>, delay: Duration) -> RelayerResult<()>;

    /// Tasks currently waiting (not counting scheduled delayed ones).
    async fn len(&self) -> usize;
}

struct QueueInner<T> {
    ready: Mutex<VecDeque<(T, u32)>>,
    notify: Notify,
}

/// Single-process broker backed by a `VecDeque`. Tasks do not survive a
/// restart; the watcher re-scans from its checkpoint to regenerate them.
pub struct MemoryTaskQueue<T> {
    name: &'static str,
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for MemoryTaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> MemoryTaskQueue<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(QueueInner {
                ready: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn push_back(&self, task: T, redeliveries: u32) -> RelayerResult<()> {
        let mut ready = self
            .inner
            .ready
            .lock()
            .map_err(|e| RelayerError::QueueError(format!("queue {} poisoned: {}", self.name, e)))?;
        ready.push_back((task, redeliveries));
        drop(ready);
        self.inner.notify.notify_one();
        Ok(())
    }

    fn schedule(&self, task: T, redeliveries: u32, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = queue.push_back(task, redeliveries) {
                tracing::error!("[{}] failed to requeue delayed task: {:?}", queue.name, e);
            }
        });
    }
}

#[async_trait]
impl<T: Send + 'static> TaskQueue<T> for MemoryTaskQueue<T> {
    async fn publish(&self, task: T) -> RelayerResult<()> {
        self.push_back(task, 0)
    }

    async fn publish_delayed(&self, task: T, delay: Duration) -> RelayerResult<()> {
        if delay.is_zero() {
            return self.push_back(task, 0);
        }
        self.schedule(task, 0, delay);
        Ok(())
    }

    async fn consume(&self) -> RelayerResult<Delivery<T>> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut ready = self.inner.ready.lock().map_err(|e| {
                    RelayerError::QueueError(format!("queue {} poisoned: {}", self.name, e))
                })?;
                if let Some((task, redeliveries)) = ready.pop_front() {
                    return Ok(Delivery { task, redeliveries });
                }
            }
            notified.await;
        }
    }

    async fn ack(&self, _delivery: Delivery<T>) -> RelayerResult<()> {
        Ok(())
    }

    async fn nack_delayed(&self, delivery: Delivery<T>, delay: Duration) -> RelayerResult<()> {
        let redeliveries = delivery.redeliveries + 1;
        if delay.is_zero() {
            return self.push_back(delivery.task, redeliveries);
        }
        self.schedule(delivery.task, redeliveries, delay);
        Ok(())
    }

    async fn len(&self) -> usize {
        self.inner.ready.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = MemoryTaskQueue::new("send");
        queue.publish(1u32).await.unwrap();
        queue.publish(2u32).await.unwrap();
        queue.publish(3u32).await.unwrap();
        assert_eq!(queue.len().await, 3);

        for expected in 1..=3u32 {
            let delivery = queue.consume().await.unwrap();
            assert_eq!(delivery.task, expected);
            assert_eq!(delivery.redeliveries, 0);
            queue.ack(delivery).await.unwrap();
        }
        assert_eq!(queue.len().await, 0);
    }

    #[tokio::test]
    async fn test_consume_waits_for_publish() {
        let queue = MemoryTaskQueue::new("send");
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.consume().await.unwrap().task })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;
        queue.publish(9u32).await.unwrap();
        assert_eq!(consumer.await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_count() {
        let queue = MemoryTaskQueue::new("receipt");
        queue.publish("task").await.unwrap();

        let first = queue.consume().await.unwrap();
        queue
            .nack_delayed(first, Duration::from_millis(20))
            .await
            .unwrap();
        // Not visible until the delay passes.
        assert_eq!(queue.len().await, 0);

        let second = queue.consume().await.unwrap();
        assert_eq!(second.task, "task");
        assert_eq!(second.redeliveries, 1);

        queue
            .nack_delayed(second, Duration::from_millis(10))
            .await
            .unwrap();
        let third = queue.consume().await.unwrap();
        assert_eq!(third.redeliveries, 2);
    }

    #[tokio::test]
    async fn test_publish_delayed_orders_after_ready_tasks() {
        let queue = MemoryTaskQueue::new("send");
        queue
            .publish_delayed("late", Duration::from_millis(30))
            .await
            .unwrap();
        queue.publish("now").await.unwrap();

        assert_eq!(queue.consume().await.unwrap().task, "now");
        assert_eq!(queue.consume().await.unwrap().task, "late");
    }

    #[tokio::test]
    async fn test_zero_delay_is_immediate() {
        let queue = MemoryTaskQueue::new("send");
        queue.publish_delayed(7u32, Duration::ZERO).await.unwrap();
        assert_eq!(queue.len().await, 1);
    }
}
