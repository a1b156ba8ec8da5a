// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Cache minimization: trim watched objects to the fields the reconciler needs.

use std::collections::{BTreeMap, BTreeSet};

use kube::api::{DynamicObject, ObjectMeta};
use serde_json::Value;

/// Returns a transform that replaces a watched object with its minimal
/// projection: identity, deletion timestamp and the kept annotations.
/// Everything else (spec, status, labels, managed fields) is discarded
/// before the object enters the cache, bounding per-object memory on
/// high-cardinality watches. The cleanup-job path needs labels and reads
/// them from a fresh API call instead.
pub fn trim_for_cache(keep: BTreeSet<String>) -> impl FnMut(&mut DynamicObject) + Send {
    move |obj: &mut DynamicObject| {
        let meta = std::mem::take(&mut obj.metadata);
        let annotations = meta
            .annotations
            .map(|annotations| {
                annotations
                    .into_iter()
                    .filter(|(key, _)| keep.contains(key))
                    .collect::<BTreeMap<_, _>>()
            })
            .filter(|kept| !kept.is_empty());
        obj.metadata = ObjectMeta {
            name: meta.name,
            namespace: meta.namespace,
            uid: meta.uid,
            resource_version: meta.resource_version,
            deletion_timestamp: meta.deletion_timestamp,
            annotations,
            ..ObjectMeta::default()
        };
        obj.data = Value::Object(serde_json::Map::new());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::annotations;
    use serde_json::json;

    fn keep_set() -> BTreeSet<String> {
        annotations::cached().iter().map(|k| k.to_string()).collect()
    }

    fn full_object() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "team-a",
                "uid": "uid-1",
                "resourceVersion": "7",
                "deletionTimestamp": "2026-03-01T00:00:00Z",
                "labels": {"app": "web"},
                "annotations": {
                    (annotations::TTL): "2d",
                    (annotations::LEASE_START): "2026-02-27T00:00:00Z",
                    "kubectl.kubernetes.io/last-applied-configuration": "{...}"
                },
                "managedFields": [{"manager": "kubectl", "operation": "Apply"}]
            },
            "spec": {"replicas": 30, "template": {"spec": {"containers": []}}},
            "status": {"readyReplicas": 30}
        }))
        .unwrap()
    }

    #[test]
    fn test_identity_survives() {
        let mut obj = full_object();
        trim_for_cache(keep_set())(&mut obj);
        assert_eq!(obj.metadata.name.as_deref(), Some("web"));
        assert_eq!(obj.metadata.namespace.as_deref(), Some("team-a"));
        assert_eq!(obj.metadata.uid.as_deref(), Some("uid-1"));
        assert_eq!(obj.metadata.resource_version.as_deref(), Some("7"));
        assert!(obj.metadata.deletion_timestamp.is_some());
        assert_eq!(obj.types.as_ref().unwrap().kind, "Deployment");
    }

    #[test]
    fn test_payload_and_labels_discarded() {
        let mut obj = full_object();
        trim_for_cache(keep_set())(&mut obj);
        assert_eq!(obj.data, Value::Object(serde_json::Map::new()));
        assert!(obj.metadata.labels.is_none());
        assert!(obj.metadata.managed_fields.is_none());
    }

    #[test]
    fn test_only_kept_annotations_survive() {
        let mut obj = full_object();
        trim_for_cache(keep_set())(&mut obj);
        let kept = obj.metadata.annotations.expect("lease annotations kept");
        assert_eq!(kept.len(), 2);
        assert_eq!(kept.get(annotations::TTL).map(String::as_str), Some("2d"));
        assert!(kept.contains_key(annotations::LEASE_START));
        assert!(!kept.contains_key("kubectl.kubernetes.io/last-applied-configuration"));
    }

    #[test]
    fn test_no_relevant_annotations_leaves_none() {
        let mut obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "plain",
                "namespace": "team-a",
                "annotations": {"unrelated": "value"}
            }
        }))
        .unwrap();
        trim_for_cache(keep_set())(&mut obj);
        assert!(obj.metadata.annotations.is_none());
    }

    #[test]
    fn test_transform_is_idempotent() {
        let mut once = full_object();
        let mut transform = trim_for_cache(keep_set());
        transform(&mut once);
        let mut twice = once.clone();
        transform(&mut twice);
        assert_eq!(
            serde_json::to_value(&once).unwrap(),
            serde_json::to_value(&twice).unwrap()
        );
    }
}
