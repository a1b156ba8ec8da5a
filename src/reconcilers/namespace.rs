// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Namespace reconciler - watches namespace labels and feeds the opt-in tracker.

use std::sync::Arc;
use std::time::Duration;

use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::kubernetes::predicate::NamespacePredicate;
use crate::tracker::NamespaceTracker;

pub struct NamespaceReconciler {
    client: Client,
    label_key: String,
    label_value: String,
    tracker: Arc<NamespaceTracker>,
}

impl NamespaceReconciler {
    pub fn new(
        client: Client,
        label_key: String,
        label_value: String,
        tracker: Arc<NamespaceTracker>,
    ) -> Self {
        Self {
            client,
            label_key,
            label_value,
            tracker,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let (reader, writer) = reflector::store();

        // Admit only label or generation changes; deletions pass through so
        // the reconcile observes the NotFound and drops the namespace.
        let mut predicate = NamespacePredicate::new();
        let trigger = reflector(
            writer,
            watcher(namespaces, watcher::Config::default()).default_backoff(),
        )
        .filter_map(move |event| {
            let admitted = match event {
                Err(e) => Some(Err(e)),
                Ok(watcher::Event::Apply(ns)) | Ok(watcher::Event::InitApply(ns)) => {
                    predicate.admit(&ns).then(|| Ok(ns))
                }
                Ok(watcher::Event::Delete(ns)) => {
                    predicate.forget(&ns.name_any());
                    Some(Ok(ns))
                }
                Ok(_) => None,
            };
            future::ready(admitted)
        });

        let context = Arc::new(self);
        let tracker = context.tracker.clone();

        Controller::for_stream(trigger, reader)
            .shutdown_on_signal()
            .run(reconcile, error_policy, context)
            .for_each(move |result| {
                let tracker = tracker.clone();
                async move {
                    match result {
                        Ok(o) => debug!("Reconciled namespace: {:?}", o),
                        // The namespace vanished between trigger and store
                        // lookup; it cannot be opted in anymore.
                        Err(kube::runtime::controller::Error::ObjectNotFound(obj_ref)) => {
                            debug!("Namespace {} deleted, not tracking", obj_ref.name);
                            tracker.remove(&obj_ref.name);
                        }
                        Err(e) => warn!("Namespace reconciliation error: {:?}", e),
                    }
                }
            })
            .await;

        Ok(())
    }
}

async fn reconcile(ns: Arc<Namespace>, ctx: Arc<NamespaceReconciler>) -> Result<Action> {
    let name = ns.name_any();
    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());

    let ns = match namespaces.get(&name).await {
        Ok(ns) => ns,
        Err(kube::Error::Api(response)) if response.code == 404 => {
            debug!("Namespace {} not found, not tracking", name);
            ctx.tracker.remove(&name);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    };

    let opted_in = ns
        .labels()
        .get(&ctx.label_key)
        .is_some_and(|value| *value == ctx.label_value);
    if opted_in {
        info!("Namespace {} opted in, tracking", name);
        ctx.tracker.add(&name);
    } else {
        debug!(
            "Namespace {} does not carry {}={}, not tracking",
            name, ctx.label_key, ctx.label_value
        );
        ctx.tracker.remove(&name);
    }

    Ok(Action::await_change())
}

fn error_policy(ns: Arc<Namespace>, error: &Error, _ctx: Arc<NamespaceReconciler>) -> Action {
    warn!("Namespace reconcile of {} failed: {}", ns.name_any(), error);
    Action::requeue(Duration::from_secs(60))
}
