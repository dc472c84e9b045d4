// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Liveness watchdog.
//!
//! Every pipeline component reports progress through a [`ProgressHandle`].
//! When any component goes silent for longer than the allowed processing
//! time the process exits with a dedicated code, and the supervisor around
//! it restarts the relayer from its persisted checkpoints.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Exit code when the configured node does not match the configured chain.
pub const EXIT_INCOMPATIBILITY: i32 = 10;
/// Exit code when a component stopped making progress.
pub const EXIT_MAX_TIME_REACHED: i32 = 11;

const CHECK_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ProgressHandle {
    sender: Arc<watch::Sender<Instant>>,
}

impl ProgressHandle {
    pub fn touch(&self) {
        self.sender.send_replace(Instant::now());
    }

    /// A handle nobody watches. For tests and tools.
    pub fn detached() -> Self {
        let (sender, _receiver) = watch::channel(Instant::now());
        Self {
            sender: Arc::new(sender),
        }
    }
}

pub struct Watchdog {
    max_processing_time: Duration,
    components: Vec<(String, watch::Receiver<Instant>)>,
}

impl Watchdog {
    pub fn new(max_processing_time: Duration) -> Self {
        Self {
            max_processing_time,
            components: Vec::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>) -> ProgressHandle {
        let (sender, receiver) = watch::channel(Instant::now());
        self.components.push((name.into(), receiver));
        ProgressHandle {
            sender: Arc::new(sender),
        }
    }

    fn stalled_component(&self) -> Option<(&str, Duration)> {
        self.components.iter().find_map(|(name, receiver)| {
            let elapsed = receiver.borrow().elapsed();
            (elapsed > self.max_processing_time).then(|| (name.as_str(), elapsed))
        })
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "watchdog armed over {} components, max processing time {:?}",
                self.components.len(),
                self.max_processing_time
            );
            let mut interval = tokio::time::interval(CHECK_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("watchdog shutting down");
                        return;
                    }
                    _ = interval.tick() => {
                        if let Some((name, elapsed)) = self.stalled_component() {
                            error!(
                                "component {} made no progress for {:?}, exiting",
                                name, elapsed
                            );
                            std::process::exit(EXIT_MAX_TIME_REACHED);
                        }
                    }
                }
            }
        })
    }
}
