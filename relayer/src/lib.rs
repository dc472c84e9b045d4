// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod error;
pub mod eth_client;
pub mod gas_price;
pub mod locker;
pub mod metered_provider;
pub mod metrics;
pub mod node;
pub mod queue;
pub mod receiptor;
pub mod sender;
pub mod storage;
pub mod translator;
pub mod types;
pub mod watchdog;
pub mod watcher;

#[cfg(test)]
pub mod test_utils;

#[macro_export]
macro_rules! retry_with_max_elapsed_time {
    ($func:expr, $max_elapsed_time:expr) => {{
        // The following delay sequence (in secs) will be used, applied with jitter
        // 0.4, 0.8, 1.6, 3.2, 6.4, 12.8, 25.6, 30, 60, 120, 120 ...
        let backoff = backoff::ExponentialBackoff {
            initial_interval: Duration::from_millis(400),
            randomization_factor: 0.1,
            multiplier: 2.0,
            max_interval: Duration::from_secs(120),
            max_elapsed_time: Some($max_elapsed_time),
            ..Default::default()
        };
        backoff::future::retry(backoff, || {
            let fut = async {
                let result = $func.await;
                match result {
                    Ok(_) => {
                        return Ok(result);
                    }
                    Err(e) => {
                        // Every error is treated as transient and retried
                        // until max_elapsed_time runs out.
                        tracing::debug!("Retrying due to error: {:?}", e);
                        return Err(backoff::Error::transient(e));
                    }
                }
            };
            std::boxed::Box::pin(fut)
        })
        .await
    }};
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    async fn flaky_ok() -> anyhow::Result<()> {
        Ok(())
    }

    async fn always_err() -> anyhow::Result<()> {
        Err(anyhow::anyhow!("rpc down"))
    }

    #[tokio::test]
    async fn test_retry_with_max_elapsed_time() {
        telemetry_subscribers::init_for_testing();
        // No retry needed, returns immediately even with a tiny budget.
        let max_elapsed_time = Duration::from_millis(20);
        retry_with_max_elapsed_time!(flaky_ok(), max_elapsed_time)
            .unwrap()
            .unwrap();

        // A function that always errors must give up before the budget runs out.
        let max_elapsed_time = Duration::from_secs(10);
        let instant = std::time::Instant::now();
        retry_with_max_elapsed_time!(always_err(), max_elapsed_time).unwrap_err();
        assert!(instant.elapsed() < max_elapsed_time);
    }
}
