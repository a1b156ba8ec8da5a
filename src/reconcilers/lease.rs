// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Lease reconciler - the state machine that maintains the lease invariants
//! and deletes expired objects, plus the watch plumbing around it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Timelike, Utc};
use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{EventType, Recorder};
use kube::runtime::{reflector, watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cleanup::{self, CleanupJobConfig};
use crate::constants::annotations;
use crate::duration::{format_rfc3339_utc, parse_flexible_duration};
use crate::error::{Error, Result};
use crate::events;
use crate::kubernetes::cache::trim_for_cache;
use crate::kubernetes::delete::delete_with_uid_precondition;
use crate::kubernetes::predicate::LeasePredicate;
use crate::kubernetes::WatchedResource;
use crate::metrics::LeaseMetrics;
use crate::tracker::{NamespaceChange, NamespaceEvent, NamespaceTracker};

/// Buffer for namespace change notifications from the tracker.
const NAMESPACE_EVENT_BUFFER: usize = 16;
/// Error backoff bounds for requeues after failed reconciles.
const BACKOFF_MAX_SECS: u64 = 300;

pub struct LeaseReconciler {
    client: Client,
    resource: WatchedResource,
    tracker: Option<Arc<NamespaceTracker>>,
    recorder: Recorder,
    metrics: Arc<LeaseMetrics>,
    cache_synced: Arc<AtomicBool>,
    error_counts: Mutex<HashMap<String, u32>>,
}

impl LeaseReconciler {
    pub fn new(
        client: Client,
        resource: WatchedResource,
        tracker: Option<Arc<NamespaceTracker>>,
        recorder: Recorder,
        metrics: Arc<LeaseMetrics>,
        cache_synced: Arc<AtomicBool>,
    ) -> Self {
        Self {
            client,
            resource,
            tracker,
            recorder,
            metrics,
            cache_synced,
            error_counts: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let api = self.resource.all(self.client.clone());
        let dyntype = self.resource.resource.clone();
        let writer = reflector::store::Writer::new(dyntype.clone());
        let reader = writer.as_reader();

        {
            let reader = reader.clone();
            let synced = self.cache_synced.clone();
            let kind = self.resource.gvk.kind.clone();
            tokio::spawn(async move {
                if reader.wait_until_ready().await.is_ok() {
                    synced.store(true, Ordering::SeqCst);
                    info!("Cache synced for {}", kind);
                }
            });
        }

        // The cache holds minimal projections only; the reconciler re-reads
        // objects through the API when it needs labels or fresh annotations.
        let keep: BTreeSet<String> = annotations::cached()
            .iter()
            .map(|key| key.to_string())
            .collect();
        let watch = watcher(api, watcher::Config::default())
            .modify(trim_for_cache(keep))
            .default_backoff();

        // Admission: creates with ttl, updates whose {ttl, lease-start}
        // projection changed, no deletes.
        let mut predicate = LeasePredicate::new();
        let trigger = reflector(writer, watch).filter_map(move |event| {
            let admitted = match event {
                Err(e) => Some(Err(e)),
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    predicate.admit(&obj).then(|| Ok(obj))
                }
                Ok(watcher::Event::Delete(obj)) => {
                    predicate.forget(&obj);
                    None
                }
                Ok(_) => None,
            };
            future::ready(admitted)
        });

        let context = Arc::new(self);

        if let Some(tracker) = context.tracker.clone() {
            let (sender, receiver) = mpsc::channel(NAMESPACE_EVENT_BUFFER);
            tracker.subscribe(sender);
            tokio::spawn(consume_namespace_events(receiver, context.clone()));
        }

        info!(
            "Starting lease reconciler for {} {}",
            context.resource.gvk.api_version(),
            context.resource.gvk.kind
        );

        Controller::for_stream_with(trigger, reader, dyntype)
            .shutdown_on_signal()
            .run(reconcile, error_policy, context)
            .for_each(|result| async move {
                match result {
                    Ok(o) => debug!("Reconciled lease: {:?}", o),
                    Err(kube::runtime::controller::Error::ObjectNotFound(obj_ref)) => {
                        debug!("Object {} no longer present", obj_ref)
                    }
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            })
            .await;

        Ok(())
    }

    fn next_backoff(&self, key: &str) -> Duration {
        let mut counts = self
            .error_counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let attempts = counts.entry(key.to_string()).or_insert(0);
        *attempts = attempts.saturating_add(1);
        Duration::from_secs(2u64.saturating_pow(*attempts - 1).min(BACKOFF_MAX_SECS))
    }

    fn clear_backoff(&self, key: &str) {
        self.error_counts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }

    async fn patch_annotations<I>(
        &self,
        api: &Api<DynamicObject>,
        name: &str,
        changes: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = (&'static str, Option<String>)>,
    {
        // A merge patch touching only the changed annotation keys; removals
        // are nulls. Concurrent writers conflict on the annotations map only.
        let mut map = serde_json::Map::new();
        for (key, value) in changes {
            map.insert(key.to_string(), value.map(Value::String).unwrap_or(Value::Null));
        }
        let patch = json!({"metadata": {"annotations": Value::Object(map)}});
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    /// Remove controller-written annotations when ttl is gone.
    async fn clean_lease_annotations(
        &self,
        api: &Api<DynamicObject>,
        obj: &DynamicObject,
        reference: &ObjectReference,
    ) -> Result<Action> {
        let object_annotations = obj.annotations();
        let stale: Vec<&'static str> = [
            annotations::LEASE_START,
            annotations::EXPIRE_AT,
            annotations::LEASE_STATUS,
        ]
        .into_iter()
        .filter(|key| object_annotations.contains_key(*key))
        .collect();
        if stale.is_empty() {
            return Ok(Action::await_change());
        }

        self.patch_annotations(api, &obj.name_any(), stale.into_iter().map(|key| (key, None)))
            .await?;
        events::publish(
            &self.recorder,
            reference,
            EventType::Normal,
            "LeaseAnnotationsCleaned",
            "Removed lease annotations because ttl is not set".to_string(),
        )
        .await;
        Ok(Action::await_change())
    }

    /// Resolve the lease anchor, writing it when missing or unparseable.
    /// A user-set parseable lease-start is never overwritten.
    async fn ensure_lease_start(
        &self,
        api: &Api<DynamicObject>,
        obj: &DynamicObject,
        reference: &ObjectReference,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        match obj
            .annotations()
            .get(annotations::LEASE_START)
            .filter(|value| !value.is_empty())
        {
            Some(raw) => match DateTime::parse_from_rfc3339(raw) {
                Ok(start) => Ok(start.with_timezone(&Utc)),
                Err(_) => {
                    self.patch_annotations(
                        api,
                        &obj.name_any(),
                        [(annotations::LEASE_START, Some(format_rfc3339_utc(now)))],
                    )
                    .await?;
                    events::publish(
                        &self.recorder,
                        reference,
                        EventType::Warning,
                        "LeaseStartReset",
                        "Invalid lease-start, reset to now".to_string(),
                    )
                    .await;
                    Ok(now)
                }
            },
            None => {
                self.patch_annotations(
                    api,
                    &obj.name_any(),
                    [(annotations::LEASE_START, Some(format_rfc3339_utc(now)))],
                )
                .await?;
                events::publish(
                    &self.recorder,
                    reference,
                    EventType::Normal,
                    "LeaseStarted",
                    "Lease started".to_string(),
                )
                .await;
                self.metrics.leases_started.inc();
                Ok(now)
            }
        }
    }

    async fn mark_invalid_ttl(
        &self,
        api: &Api<DynamicObject>,
        obj: &DynamicObject,
        reference: &ObjectReference,
        detail: String,
    ) -> Result<Action> {
        let message = format!("Invalid TTL: {}", detail);
        self.patch_annotations(
            api,
            &obj.name_any(),
            [(annotations::LEASE_STATUS, Some(message.clone()))],
        )
        .await?;
        events::publish(
            &self.recorder,
            reference,
            EventType::Warning,
            "InvalidTTL",
            message,
        )
        .await;
        self.metrics.invalid_ttl.inc();
        Ok(Action::await_change())
    }

    /// Expiry: record the final state, run any configured cleanup job, then
    /// delete. Cleanup failures never block the deletion.
    async fn handle_expired(
        &self,
        api: &Api<DynamicObject>,
        obj: &DynamicObject,
        reference: &ObjectReference,
        lease_started_at: DateTime<Utc>,
        lease_expired_at: DateTime<Utc>,
    ) -> Result<()> {
        let status = "Lease expired. Deleting object.";
        self.patch_annotations(
            api,
            &obj.name_any(),
            [
                (
                    annotations::EXPIRE_AT,
                    Some(format_rfc3339_utc(lease_expired_at)),
                ),
                (annotations::LEASE_STATUS, Some(status.to_string())),
            ],
        )
        .await?;
        events::publish(
            &self.recorder,
            reference,
            EventType::Normal,
            "LeaseExpired",
            status.to_string(),
        )
        .await;
        self.metrics.leases_expired.inc();

        match cleanup::parse_cleanup_config(obj.annotations()) {
            Ok(None) => {}
            Ok(Some(config)) => {
                if let Err(e) = self
                    .execute_cleanup_job(obj, reference, &config, lease_started_at, lease_expired_at)
                    .await
                {
                    warn!(
                        "Cleanup job for {}/{} failed: {}",
                        obj.namespace().unwrap_or_default(),
                        obj.name_any(),
                        e
                    );
                    events::publish(
                        &self.recorder,
                        reference,
                        EventType::Warning,
                        "CleanupJobFailed",
                        format!("Cleanup job failed: {}", e),
                    )
                    .await;
                    self.metrics.cleanup_jobs_failed.inc();
                }
            }
            Err(e) => {
                warn!(
                    "Invalid cleanup job config on {}/{}: {}",
                    obj.namespace().unwrap_or_default(),
                    obj.name_any(),
                    e
                );
                events::publish(
                    &self.recorder,
                    reference,
                    EventType::Warning,
                    "CleanupJobConfigInvalid",
                    format!("Invalid cleanup job config: {}", e),
                )
                .await;
            }
        }

        delete_with_uid_precondition(api, obj).await
    }

    async fn execute_cleanup_job(
        &self,
        obj: &DynamicObject,
        reference: &ObjectReference,
        config: &CleanupJobConfig,
        lease_started_at: DateTime<Utc>,
        lease_expired_at: DateTime<Utc>,
    ) -> Result<()> {
        let job_start = Instant::now();
        let manifest = cleanup::cleanup_job_manifest(
            obj,
            &self.resource.gvk,
            config,
            lease_started_at,
            lease_expired_at,
        )?;
        let job = cleanup::submit_cleanup_job(&self.client, obj, manifest).await?;
        let job_name = job.name_any();

        info!(
            "Created cleanup job {} in {}",
            job_name,
            job.namespace().unwrap_or_default()
        );
        events::publish(
            &self.recorder,
            reference,
            EventType::Normal,
            "CleanupJobCreated",
            format!("Created cleanup job: {}", job_name),
        )
        .await;
        self.metrics.cleanup_jobs_created.inc();

        if !config.wait {
            debug!("Cleanup job {} running in fire-and-forget mode", job_name);
            return Ok(());
        }

        match cleanup::wait_for_job_completion(&self.client, &job, config.timeout).await {
            Ok(()) => {
                info!("Cleanup job {} completed", job_name);
                events::publish(
                    &self.recorder,
                    reference,
                    EventType::Normal,
                    "CleanupJobCompleted",
                    format!("Cleanup job completed: {}", job_name),
                )
                .await;
                self.metrics.cleanup_jobs_completed.inc();
                self.metrics
                    .cleanup_job_duration
                    .observe(job_start.elapsed().as_secs_f64());
                Ok(())
            }
            Err(e) => {
                events::publish(
                    &self.recorder,
                    reference,
                    EventType::Warning,
                    "CleanupJobTimeout",
                    format!("Cleanup job did not complete: {}", e),
                )
                .await;
                Err(e)
            }
        }
    }
}

pub(crate) async fn reconcile(obj: Arc<DynamicObject>, ctx: Arc<LeaseReconciler>) -> Result<Action> {
    let started = Instant::now();
    let key = format!(
        "{}/{}",
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    );

    let result = reconcile_inner(&obj, &ctx).await;

    ctx.metrics
        .reconcile_duration
        .observe(started.elapsed().as_secs_f64());
    match &result {
        Ok(_) => ctx.clear_backoff(&key),
        Err(_) => ctx.metrics.reconcile_errors.inc(),
    }
    result
}

async fn reconcile_inner(obj: &DynamicObject, ctx: &LeaseReconciler) -> Result<Action> {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();
    debug!(
        "Reconciling lease for {} {}/{}",
        ctx.resource.gvk.kind, namespace, name
    );

    if let Some(tracker) = &ctx.tracker {
        if !tracker.contains(&namespace) {
            debug!("Namespace {} not tracked, skipping", namespace);
            return Ok(Action::await_change());
        }
    }

    // Always work from a fresh read: the cached projection is trimmed and
    // may lag behind user edits.
    let api = ctx.resource.namespaced(ctx.client.clone(), &namespace);
    let obj = match api.get(&name).await {
        Ok(obj) => obj,
        Err(kube::Error::Api(response)) if response.code == 404 => {
            debug!("{} {}/{} not found, skipping", ctx.resource.gvk.kind, namespace, name);
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e.into()),
    };
    let reference = events::object_reference(&obj, &ctx.resource.gvk);

    let ttl_value = obj
        .annotations()
        .get(annotations::TTL)
        .filter(|value| !value.is_empty())
        .cloned();
    let Some(ttl_value) = ttl_value else {
        return ctx.clean_lease_annotations(&api, &obj, &reference).await;
    };

    // Whole-second now keeps reruns byte-identical to what was annotated.
    let now = Utc::now();
    let now = now.with_nanosecond(0).unwrap_or(now);

    let lease_start = ctx.ensure_lease_start(&api, &obj, &reference, now).await?;

    let ttl = match parse_flexible_duration(&ttl_value) {
        Ok(ttl) => ttl,
        Err(e) => return ctx.mark_invalid_ttl(&api, &obj, &reference, e.to_string()).await,
    };

    let Some(expire_at) = lease_start.checked_add_signed(ttl) else {
        return ctx
            .mark_invalid_ttl(&api, &obj, &reference, format!("expiry overflows: {:?}", ttl_value))
            .await;
    };

    if now >= expire_at {
        ctx.handle_expired(&api, &obj, &reference, lease_start, expire_at)
            .await?;
        return Ok(Action::await_change());
    }

    let status = format!(
        "Lease active. Expires at {} UTC.",
        format_rfc3339_utc(expire_at)
    );
    ctx.patch_annotations(
        &api,
        &name,
        [
            (annotations::EXPIRE_AT, Some(format_rfc3339_utc(expire_at))),
            (annotations::LEASE_STATUS, Some(status)),
        ],
    )
    .await?;

    let wakeup = (expire_at - now).to_std().unwrap_or(Duration::ZERO);
    Ok(Action::requeue(wakeup))
}

fn error_policy(obj: Arc<DynamicObject>, error: &Error, ctx: Arc<LeaseReconciler>) -> Action {
    let key = format!(
        "{}/{}",
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    );
    let delay = ctx.next_backoff(&key);
    warn!("Reconcile of {} failed, retrying in {:?}: {}", key, delay, error);
    Action::requeue(delay)
}

/// Rescan newly opted-in namespaces: list the watched GVK there and run the
/// state machine for every object carrying a ttl. Removals need no action;
/// the next reconcile of an affected object observes the tracker and skips.
async fn consume_namespace_events(
    mut receiver: mpsc::Receiver<NamespaceEvent>,
    ctx: Arc<LeaseReconciler>,
) {
    while let Some(event) = receiver.recv().await {
        if event.change != NamespaceChange::Added {
            continue;
        }
        info!(
            "Namespace {} opted in, rescanning {}",
            event.namespace, ctx.resource.gvk.kind
        );
        let api = ctx.resource.namespaced(ctx.client.clone(), &event.namespace);
        let list = match api.list(&ListParams::default()).await {
            Ok(list) => list,
            Err(e) => {
                warn!(
                    "Failed to list {} in namespace {}: {}",
                    ctx.resource.gvk.kind, event.namespace, e
                );
                continue;
            }
        };
        for obj in list.items {
            if !obj.annotations().contains_key(annotations::TTL) {
                continue;
            }
            let key = format!("{}/{}", event.namespace, obj.name_any());
            if let Err(e) = reconcile(Arc::new(obj), ctx.clone()).await {
                warn!("Rescan reconcile of {} failed: {}", key, e);
            }
        }
    }
}
