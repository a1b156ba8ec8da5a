// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Operator configuration from flags with environment variable fallbacks.

use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::api::GroupVersionKind;

use crate::constants::{OPERATOR_NAME, SERVICE_ACCOUNT_NAMESPACE_FILE};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "lease-controller",
    version,
    disable_version_flag = true,
    about = "Annotation-driven TTL lease controller for a single Kubernetes resource type"
)]
pub struct Config {
    /// Kubernetes API group of the watched resource (empty for the core group)
    #[arg(long, env = "LEASE_GVK_GROUP", default_value = "")]
    pub group: String,

    /// Kubernetes API version of the watched resource (e.g. "v1")
    #[arg(long, env = "LEASE_GVK_VERSION")]
    pub version: String,

    /// Kubernetes kind of the watched resource (e.g. "ConfigMap")
    #[arg(long, env = "LEASE_GVK_KIND")]
    pub kind: String,

    /// Label key a namespace must carry to opt in. Without the opt-in pair
    /// every namespace is managed.
    #[arg(long, env = "LEASE_OPT_IN_LABEL_KEY")]
    pub opt_in_label_key: Option<String>,

    /// Label value a namespace must carry to opt in
    #[arg(long, env = "LEASE_OPT_IN_LABEL_VALUE")]
    pub opt_in_label_value: Option<String>,

    /// Bind address for the Prometheus metrics endpoint
    #[arg(long, env = "LEASE_METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: String,

    /// Bind address for the health and readiness probes
    #[arg(long, env = "LEASE_PROBE_BIND_ADDRESS", default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: String,

    /// Namespace used by the health list probe for namespaced resources
    #[arg(long, env = "LEASE_PROBE_NAMESPACE", default_value = "default")]
    pub probe_namespace: String,

    /// Enable leader election so only one replica reconciles
    #[arg(long, env = "LEASE_LEADER_ELECTION")]
    pub leader_elect: bool,

    /// Namespace for the leader election lock. Defaults to the service
    /// account namespace when running in-cluster.
    #[arg(long, env = "LEASE_LEADER_ELECTION_NAMESPACE")]
    pub leader_election_namespace: Option<String>,

    /// Log verbosity (trace, debug, info, warn, error); RUST_LOG overrides
    #[arg(long, env = "LEASE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    /// The opt-in pair when both halves are configured.
    pub fn opt_in_labels(&self) -> Option<(String, String)> {
        match (&self.opt_in_label_key, &self.opt_in_label_value) {
            (Some(key), Some(value)) if !key.is_empty() && !value.is_empty() => {
                Some((key.clone(), value.clone()))
            }
            _ => None,
        }
    }

    /// Unique leader lock name per GVK.
    pub fn leader_lock_name(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            OPERATOR_NAME, self.group, self.version, self.kind
        )
        .to_lowercase()
    }

    /// Resolve the leader election namespace: flag or env first, then the
    /// in-cluster service account namespace.
    pub fn resolve_leader_election_namespace(&self) -> Result<String> {
        if let Some(namespace) = self
            .leader_election_namespace
            .as_ref()
            .filter(|ns| !ns.is_empty())
        {
            return Ok(namespace.clone());
        }
        match std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE) {
            Ok(contents) => {
                let namespace = contents.trim().to_string();
                if namespace.is_empty() {
                    bail!("service account namespace file is empty");
                }
                Ok(namespace)
            }
            Err(e) => Err(e).context(
                "leader election enabled but no namespace configured; \
                 set --leader-election-namespace or LEASE_LEADER_ELECTION_NAMESPACE",
            ),
        }
    }
}
