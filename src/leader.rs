// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Optional leader election over a coordination/v1 Lease. The controller is
//! safe to run unelected (UID-preconditioned deletes, idempotent patches);
//! election only avoids duplicate work between replicas.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::Result;

pub struct LeaderElectionConfig {
    /// Name of the Lease lock object.
    pub lease_name: String,
    /// Namespace the lock lives in.
    pub namespace: String,
    /// Identity of this instance, typically the pod name.
    pub holder_id: String,
    /// Seconds before an unrenewed lease may be taken over.
    pub lease_duration_secs: i32,
    /// Renewal cadence; roughly a third of the lease duration.
    pub renew_interval_secs: u64,
}

impl LeaderElectionConfig {
    pub fn new(lease_name: String, namespace: String) -> Self {
        let holder_id = std::env::var("HOSTNAME").unwrap_or_else(|_| {
            format!("{}-{}", lease_name, std::process::id())
        });
        Self {
            lease_name,
            namespace,
            holder_id,
            lease_duration_secs: 15,
            renew_interval_secs: 5,
        }
    }
}

/// Block until this instance holds the lock, then keep renewing it in the
/// background for the lifetime of the process.
pub async fn wait_for_leadership(client: Client, config: LeaderElectionConfig) {
    let api: Api<Lease> = Api::namespaced(client, &config.namespace);

    loop {
        match try_acquire_or_renew(&api, &config).await {
            Ok(true) => break,
            Ok(false) => debug!(
                "Lease {}/{} held by another instance",
                config.namespace, config.lease_name
            ),
            Err(e) => warn!("Leader election attempt failed: {}", e),
        }
        sleep(Duration::from_secs(config.renew_interval_secs)).await;
    }

    info!(
        "Acquired leadership of {}/{} as {}",
        config.namespace, config.lease_name, config.holder_id
    );

    tokio::spawn(async move {
        loop {
            sleep(Duration::from_secs(config.renew_interval_secs)).await;
            match try_acquire_or_renew(&api, &config).await {
                Ok(true) => {}
                Ok(false) => warn!(
                    "Lost the leader lock {}/{}",
                    config.namespace, config.lease_name
                ),
                Err(e) => warn!("Leader lock renewal failed: {}", e),
            }
        }
    });
}

/// One election round. Creates the lock if absent, renews it when held, and
/// takes it over once the previous holder stopped renewing. Conflicting
/// writers lose on the replace and report not-acquired.
async fn try_acquire_or_renew(api: &Api<Lease>, config: &LeaderElectionConfig) -> Result<bool> {
    let now = Utc::now();

    let existing = match api.get(&config.lease_name).await {
        Ok(lease) => lease,
        Err(kube::Error::Api(response)) if response.code == 404 => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(config.lease_name.clone()),
                    namespace: Some(config.namespace.clone()),
                    ..ObjectMeta::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(config.holder_id.clone()),
                    lease_duration_seconds: Some(config.lease_duration_secs),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_transitions: Some(0),
                    ..LeaseSpec::default()
                }),
            };
            return match api.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
                Err(e) => Err(e.into()),
            };
        }
        Err(e) => return Err(e.into()),
    };

    let spec = existing.spec.clone().unwrap_or_default();
    let held_by_us = spec.holder_identity.as_deref() == Some(config.holder_id.as_str());

    if !held_by_us {
        let duration = spec
            .lease_duration_seconds
            .unwrap_or(config.lease_duration_secs) as i64;
        let expired = match &spec.renew_time {
            Some(renewed) => now > renewed.0 + chrono::TimeDelta::seconds(duration),
            None => true,
        };
        if !expired {
            return Ok(false);
        }
    }

    let mut updated = existing;
    updated.spec = Some(LeaseSpec {
        holder_identity: Some(config.holder_id.clone()),
        lease_duration_seconds: Some(config.lease_duration_secs),
        acquire_time: if held_by_us {
            spec.acquire_time.clone()
        } else {
            Some(MicroTime(now))
        },
        renew_time: Some(MicroTime(now)),
        lease_transitions: if held_by_us {
            spec.lease_transitions
        } else {
            Some(spec.lease_transitions.unwrap_or(0) + 1)
        },
        ..LeaseSpec::default()
    });

    match api
        .replace(&config.lease_name, &PostParams::default(), &updated)
        .await
    {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
        Err(e) => Err(e.into()),
    }
}
