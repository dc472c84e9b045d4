// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use bridge_relayer::config::RelayerNodeConfig;
use bridge_relayer::error::RelayerError;
use bridge_relayer::node::run_relayer_node;
use bridge_relayer::watchdog::EXIT_INCOMPATIBILITY;
use bridge_relayer_config::Config;
use bridge_relayer_metrics::start_prometheus_server;
use clap::Parser;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version)]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = RelayerNodeConfig::load(&args.config_path).unwrap();

    let metrics_address =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), config.metrics_port);
    let registry_service = start_prometheus_server(metrics_address);
    let prometheus_registry = registry_service.default_registry();

    // Init logging
    let (_log_guard, _filter_handle) =
        telemetry_subscribers::TelemetryConfig::new(env!("CARGO_BIN_NAME"))
        .with_env()
        .with_prom_registry(&prometheus_registry)
        .init();

    info!("Metrics server started at port {}", config.metrics_port);

    let cancel = CancellationToken::new();
    let handles = match run_relayer_node(config, prometheus_registry, cancel).await {
        Ok(handles) => handles,
        Err(e) => {
            // A chain-id mismatch means the config points at the wrong
            // network. Exit with the dedicated code so supervisors do not
            // restart into the same mismatch.
            if let Some(RelayerError::IncompatibleChain(reason)) = e.downcast_ref::<RelayerError>()
            {
                error!("Incompatible chain: {}", reason);
                std::process::exit(EXIT_INCOMPATIBILITY);
            }
            return Err(e);
        }
    };
    futures::future::join_all(handles).await;
    Ok(())
}
