// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("API discovery failed: {0}")]
    Discovery(String),

    // Duration parse failures carry a self-describing detail message; it is
    // surfaced verbatim in the lease-status annotation.
    #[error("{0}")]
    InvalidDuration(String),

    #[error("invalid cleanup job config: {0}")]
    CleanupJobConfig(String),

    #[error("cleanup job submission failed: {0}")]
    CleanupJobSubmit(#[source] kube::Error),

    #[error("cleanup job failed: {0}")]
    CleanupJobFailed(String),

    #[error("timed out waiting for cleanup job completion")]
    CleanupJobTimeout,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
