// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Event admission: keeps reconcile traffic down to lease-relevant changes.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::Namespace;
use kube::api::DynamicObject;
use kube::ResourceExt;

use crate::constants::annotations;

type ObjectKey = (String, String);

/// Admits watch events for the lease controller:
/// - creates only when `ttl` is present,
/// - updates only when the `{ttl, lease-start}` projection changed
///   (which includes `ttl` being removed, so stale annotations get cleaned),
/// - nothing for objects that never carried lease annotations.
///
/// State is kept per object and dropped again on delete, so unrelated
/// objects on a high-churn watch cost no memory here.
#[derive(Debug, Default)]
pub struct LeasePredicate {
    seen: HashMap<ObjectKey, BTreeMap<String, String>>,
}

impl LeasePredicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, obj: &DynamicObject) -> bool {
        let key = object_key(obj);
        let projection = lease_projection(obj);
        match self.seen.get(&key) {
            None => {
                if projection.is_empty() {
                    return false;
                }
                self.seen.insert(key, projection);
                true
            }
            Some(previous) if *previous == projection => false,
            Some(_) => {
                if projection.is_empty() {
                    self.seen.remove(&key);
                } else {
                    self.seen.insert(key, projection);
                }
                true
            }
        }
    }

    pub fn forget(&mut self, obj: &DynamicObject) {
        self.seen.remove(&object_key(obj));
    }
}

fn object_key(obj: &DynamicObject) -> ObjectKey {
    (obj.namespace().unwrap_or_default(), obj.name_any())
}

fn lease_projection(obj: &DynamicObject) -> BTreeMap<String, String> {
    let object_annotations = obj.annotations();
    [annotations::TTL, annotations::LEASE_START]
        .into_iter()
        .filter_map(|key| {
            object_annotations
                .get(key)
                .map(|value| (key.to_string(), value.clone()))
        })
        .collect()
}

/// Admits namespace events when the labels or the generation changed, plus
/// every first sighting. Deletions are handled by the caller, which forgets
/// the namespace and lets the reconcile observe the NotFound.
#[derive(Debug, Default)]
pub struct NamespacePredicate {
    seen: HashMap<String, (Option<BTreeMap<String, String>>, Option<i64>)>,
}

impl NamespacePredicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, namespace: &Namespace) -> bool {
        let key = namespace.name_any();
        let projection = (
            namespace.metadata.labels.clone(),
            namespace.metadata.generation,
        );
        match self.seen.get(&key) {
            Some(previous) if *previous == projection => false,
            _ => {
                self.seen.insert(key, projection);
                true
            }
        }
    }

    pub fn forget(&mut self, name: &str) {
        self.seen.remove(name);
    }
}
