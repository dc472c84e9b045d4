// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Prometheus scrape endpoint shared by the relayer binaries.
//!
//! `start_prometheus_server` spawns an axum server exposing `/metrics` and
//! hands back a [`RegistryService`] whose default registry the rest of the
//! process registers its metric families against.

use axum::{extract::Extension, http::StatusCode, routing::get, Router};
use prometheus::{Registry, TextEncoder};
use std::net::SocketAddr;

pub const METRICS_ROUTE: &str = "/metrics";

#[derive(Clone)]
pub struct RegistryService {
    default_registry: Registry,
}

impl RegistryService {
    pub fn new(default_registry: Registry) -> Self {
        Self { default_registry }
    }

    /// The registry process-wide metrics are registered against.
    /// `prometheus::Registry` is cheaply clonable (shared internally).
    pub fn default_registry(&self) -> Registry {
        self.default_registry.clone()
    }

    pub fn gather_all(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.default_registry.gather()
    }
}

pub fn create_metrics_router(registry_service: RegistryService) -> Router {
    Router::new()
        .route(METRICS_ROUTE, get(metrics))
        .layer(Extension(registry_service))
}

/// Spawns the metrics server and returns the registry service it scrapes.
/// The server runs until process exit.
pub fn start_prometheus_server(addr: SocketAddr) -> RegistryService {
    let registry_service = RegistryService::new(Registry::new());
    let router = create_metrics_router(registry_service.clone());

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .unwrap_or_else(|e| panic!("Failed to bind metrics server to {}: {}", addr, e));
        if let Err(e) = axum::serve(listener, router.into_make_service()).await {
            tracing::error!("Metrics server stopped: {:?}", e);
        }
    });

    registry_service
}

async fn metrics(Extension(registry_service): Extension<RegistryService>) -> (StatusCode, String) {
    let metrics_families = registry_service.gather_all();
    match TextEncoder.encode_to_string(&metrics_families) {
        Ok(metrics) => (StatusCode::OK, metrics),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to encode metrics: {}", error),
        ),
    }
}
