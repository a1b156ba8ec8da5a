// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use kube::runtime::events::{Recorder, Reporter};
use kube::Client;
use prometheus::Registry;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lease_controller::config::Config;
use lease_controller::constants::OPERATOR_NAME;
use lease_controller::kubernetes::resolve_gvk;
use lease_controller::leader::{self, LeaderElectionConfig};
use lease_controller::metrics::LeaseMetrics;
use lease_controller::reconcilers::{LeaseReconciler, NamespaceReconciler};
use lease_controller::server::{self, ProbeState};
use lease_controller::tracker::NamespaceTracker;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // RUST_LOG wins over the flag so debugging stays a one-off env var away.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let gvk = config.gvk();
    info!(
        "Starting lease controller for {} {}",
        gvk.api_version(),
        gvk.kind
    );

    // Resolve the leader election namespace before doing anything else so a
    // misconfigured deployment fails fast.
    let leader_election = if config.leader_elect {
        Some(config.resolve_leader_election_namespace()?)
    } else {
        None
    };

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let resource = resolve_gvk(&client, &gvk).await?;

    if let Some(namespace) = leader_election {
        info!("Leader election enabled, waiting for the lock");
        leader::wait_for_leadership(
            client.clone(),
            LeaderElectionConfig::new(config.leader_lock_name(), namespace),
        )
        .await;
    }

    let registry = Registry::new();
    let metrics = Arc::new(LeaseMetrics::new(&gvk, &registry)?);
    let recorder = Recorder::new(
        client.clone(),
        Reporter {
            controller: OPERATOR_NAME.to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        },
    );

    // With no opt-in pair configured every namespace is managed and the
    // namespace reconciler is not started at all.
    let opt_in = config.opt_in_labels();
    let tracker = opt_in.as_ref().map(|_| Arc::new(NamespaceTracker::new()));
    let namespace_reconciler = match (&tracker, opt_in) {
        (Some(tracker), Some((key, value))) => {
            info!("Namespace opt-in enabled via label {}={}", key, value);
            Some(NamespaceReconciler::new(
                client.clone(),
                key,
                value,
                tracker.clone(),
            ))
        }
        _ => None,
    };

    let cache_synced = Arc::new(AtomicBool::new(false));
    let lease_reconciler = LeaseReconciler::new(
        client.clone(),
        resource.clone(),
        tracker,
        recorder,
        metrics,
        cache_synced.clone(),
    );

    let metrics_server = server::serve_metrics(config.metrics_bind_address.clone(), registry);
    let probe_server = server::serve_probes(
        config.health_probe_bind_address.clone(),
        ProbeState {
            client,
            resource,
            probe_namespace: config.probe_namespace.clone(),
            cache_synced,
        },
    );

    match namespace_reconciler {
        Some(namespace_reconciler) => {
            tokio::try_join!(
                lease_reconciler.run(),
                namespace_reconciler.run(),
                metrics_server,
                probe_server
            )?;
        }
        None => {
            tokio::try_join!(lease_reconciler.run(), metrics_server, probe_server)?;
        }
    }

    warn!("All controller tasks stopped");
    Ok(())
}
