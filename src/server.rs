// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! HTTP endpoints: Prometheus metrics, health and readiness probes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use kube::Client;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::signal;
use tracing::{error, info};

use crate::kubernetes::{self, WatchedResource};

/// Shared state for the probe endpoints.
#[derive(Clone)]
pub struct ProbeState {
    pub client: Client,
    pub resource: WatchedResource,
    pub probe_namespace: String,
    pub cache_synced: Arc<AtomicBool>,
}

/// Serve `/metrics` on its own bind address.
pub async fn serve_metrics(address: String, registry: Registry) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics))
        .with_state(registry);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Serving metrics on {}", address);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Serve `/healthz` and `/readyz` on the probe bind address.
pub async fn serve_probes(address: String, state: ProbeState) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Serving health probes on {}", address);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn metrics(State(registry): State<Registry>) -> Result<String, (StatusCode, String)> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to encode metrics: {e}"),
            )
        })?;
    String::from_utf8(buffer).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics are not valid UTF-8: {e}"),
        )
    })
}

/// Healthy when the watched GVK is discoverable and listable.
async fn healthz(State(state): State<ProbeState>) -> Result<&'static str, (StatusCode, String)> {
    match kubernetes::probe_list(&state.client, &state.resource, &state.probe_namespace).await {
        Ok(()) => Ok("ok"),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            format!("list probe failed: {e}"),
        )),
    }
}

/// Ready once the initial cache sync completed.
async fn readyz(State(state): State<ProbeState>) -> Result<&'static str, (StatusCode, &'static str)> {
    if state.cache_synced.load(Ordering::SeqCst) {
        Ok("ok")
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, "cache not synced"))
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, draining");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::LeaseMetrics;
    use crate::test_utils::MockService;
    use kube::api::{ApiResource, GroupVersionKind};

    fn probe_state(service: MockService, synced: bool) -> ProbeState {
        let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
        ProbeState {
            client: service.into_client(),
            resource: WatchedResource {
                resource: ApiResource::from_gvk(&gvk),
                gvk,
                namespaced: true,
            },
            probe_namespace: "default".to_string(),
            cache_synced: Arc::new(AtomicBool::new(synced)),
        }
    }

    #[tokio::test]
    async fn test_readyz_reflects_cache_sync() {
        let state = probe_state(MockService::new(), false);
        assert!(readyz(State(state.clone())).await.is_err());

        state.cache_synced.store(true, Ordering::SeqCst);
        assert_eq!(readyz(State(state)).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_healthz_requires_listable_gvk() {
        let healthy = probe_state(
            MockService::new().on_get(
                "/api/v1/namespaces/default/configmaps",
                200,
                r#"{"apiVersion":"v1","kind":"ConfigMapList","metadata":{},"items":[]}"#,
            ),
            true,
        );
        assert_eq!(healthz(State(healthy)).await.unwrap(), "ok");

        let unhealthy = probe_state(
            MockService::new().on_get(
                "/api/v1/namespaces/default/configmaps",
                403,
                r#"{"kind":"Status","apiVersion":"v1","status":"Failure","message":"forbidden","reason":"Forbidden","code":403}"#,
            ),
            true,
        );
        let (status, _) = healthz(State(unhealthy)).await.unwrap_err();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_families() {
        let registry = Registry::new();
        let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
        let _metrics = LeaseMetrics::new(&gvk, &registry).unwrap();

        let output = metrics(State(registry)).await.unwrap();
        assert!(output.contains("lease_controller_info"));
        assert!(output.contains("lease_controller_leases_started_total"));
    }
}
