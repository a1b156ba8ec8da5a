// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Event publishing for dynamically typed objects.

use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{DynamicObject, GroupVersionKind};
use kube::runtime::events::{Event, EventType, Recorder};
use tracing::warn;

/// Build an event reference for a watched object. The GVK comes from the
/// controller configuration since cached projections may lack type metadata.
pub fn object_reference(obj: &DynamicObject, gvk: &GroupVersionKind) -> ObjectReference {
    ObjectReference {
        api_version: Some(gvk.api_version()),
        kind: Some(gvk.kind.clone()),
        name: obj.metadata.name.clone(),
        namespace: obj.metadata.namespace.clone(),
        uid: obj.metadata.uid.clone(),
        resource_version: obj.metadata.resource_version.clone(),
        ..ObjectReference::default()
    }
}

/// Publish an event attached to the given reference. Publish failures are
/// logged and never block reconciliation.
pub async fn publish(
    recorder: &Recorder,
    reference: &ObjectReference,
    type_: EventType,
    reason: &str,
    note: String,
) {
    let event = Event {
        type_,
        reason: reason.to_string(),
        note: Some(note),
        action: reason.to_string(),
        secondary: None,
    };
    if let Err(e) = recorder.publish(&event, reference).await {
        warn!("Failed to publish {} event: {}", reason, e);
    }
}
