// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Resolution of the watched GVK and dynamically typed API handles.

use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use kube::discovery::{self, Scope};
use kube::Client;
use tracing::info;

use crate::error::{Error, Result};

/// The watched resource type, resolved once at startup through API discovery.
#[derive(Debug, Clone)]
pub struct WatchedResource {
    pub gvk: GroupVersionKind,
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// Resolve a GVK against the API server. Fails when the GVK is not served,
/// which is a startup error: a controller for an absent resource type is
/// misconfigured.
pub async fn resolve_gvk(client: &Client, gvk: &GroupVersionKind) -> Result<WatchedResource> {
    let (resource, capabilities) = discovery::pinned_kind(client, gvk).await.map_err(|e| {
        Error::Discovery(format!(
            "{} {} is not served by the API server: {}",
            gvk.api_version(),
            gvk.kind,
            e
        ))
    })?;
    let namespaced = matches!(capabilities.scope, Scope::Namespaced);
    info!(
        "Resolved {} {} as {} ({} scoped)",
        gvk.api_version(),
        gvk.kind,
        resource.plural,
        if namespaced { "namespace" } else { "cluster" }
    );
    Ok(WatchedResource {
        gvk: gvk.clone(),
        resource,
        namespaced,
    })
}

impl WatchedResource {
    /// API handle spanning all namespaces, used for the watch.
    pub fn all(&self, client: Client) -> Api<DynamicObject> {
        Api::all_with(client, &self.resource)
    }

    /// API handle for a single namespace; falls back to the cluster scope
    /// for cluster-scoped resources.
    pub fn namespaced(&self, client: Client, namespace: &str) -> Api<DynamicObject> {
        if self.namespaced && !namespace.is_empty() {
            Api::namespaced_with(client, namespace, &self.resource)
        } else {
            Api::all_with(client, &self.resource)
        }
    }
}

/// Health probe: the GVK must be listable with minimal load. A bounded list
/// of limit 1 keeps the probe cheap on busy clusters.
pub async fn probe_list(
    client: &Client,
    resource: &WatchedResource,
    probe_namespace: &str,
) -> Result<()> {
    let api = resource.namespaced(client.clone(), probe_namespace);
    api.list(&ListParams::default().limit(1)).await?;
    Ok(())
}
