// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// The operator name, used for the event reporter and the leader lock prefix.
pub const OPERATOR_NAME: &str = "lease-controller";

/// Namespace prefixed to every Prometheus metric name.
pub const METRICS_NAMESPACE: &str = "lease_controller";

/// In-cluster file holding the service account namespace, used as the leader
/// election namespace fallback.
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Lease annotation keys on watched objects
pub mod annotations {
    /// Duration string enabling lease management; absence disables it
    pub const TTL: &str = "lease.geeko.me/ttl";
    /// RFC3339 UTC anchor of the lease; set by the controller when missing
    pub const LEASE_START: &str = "lease.geeko.me/lease-start";
    /// RFC3339 UTC expiry, always lease-start + ttl; controller-owned
    pub const EXPIRE_AT: &str = "lease.geeko.me/expire-at";
    /// Human-readable lease state or error; controller-owned
    pub const LEASE_STATUS: &str = "lease.geeko.me/lease-status";

    /// "configmap-name/script-key" selecting the cleanup script
    pub const ON_DELETE_JOB: &str = "lease.geeko.me/on-delete-job";
    pub const JOB_SERVICE_ACCOUNT: &str = "lease.geeko.me/job-service-account";
    pub const JOB_IMAGE: &str = "lease.geeko.me/job-image";
    /// Comma-separated Secret names projected into the job environment
    pub const JOB_ENV_SECRETS: &str = "lease.geeko.me/job-env-secrets";
    pub const JOB_WAIT: &str = "lease.geeko.me/job-wait";
    pub const JOB_TIMEOUT: &str = "lease.geeko.me/job-timeout";
    pub const JOB_TTL: &str = "lease.geeko.me/job-ttl";
    pub const JOB_BACKOFF_LIMIT: &str = "lease.geeko.me/job-backoff-limit";

    /// The keep-set for the cache transform: everything the reconciler may
    /// need to read from the cached projection.
    pub fn cached() -> [&'static str; 12] {
        [
            TTL,
            LEASE_START,
            EXPIRE_AT,
            LEASE_STATUS,
            ON_DELETE_JOB,
            JOB_SERVICE_ACCOUNT,
            JOB_IMAGE,
            JOB_ENV_SECRETS,
            JOB_WAIT,
            JOB_TIMEOUT,
            JOB_TTL,
            JOB_BACKOFF_LIMIT,
        ]
    }
}

/// Labels stamped on cleanup jobs for discoverability
pub mod job_labels {
    pub const SOURCE_KIND: &str = "lease.geeko.me/source-kind";
    pub const SOURCE_NAME: &str = "lease.geeko.me/source-name";
    pub const CLEANUP_JOB: &str = "lease.geeko.me/cleanup-job";
}

/// Cleanup job defaults, applied when the corresponding annotation is absent
pub mod defaults {
    pub const JOB_IMAGE: &str = "bitnami/kubectl:latest";
    pub const JOB_SERVICE_ACCOUNT: &str = "default";
    pub const JOB_TTL_SECONDS: i32 = 300;
    pub const JOB_BACKOFF_LIMIT: i32 = 3;
    pub const JOB_TIMEOUT: &str = "5m";
    /// Job status polling interval in wait mode
    pub const JOB_POLL_INTERVAL_SECS: u64 = 2;
}
