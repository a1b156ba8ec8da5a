// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Cleanup jobs: user-supplied scripts that run right before an expired
//! object is deleted. Best-effort by design; a failed or slow cleanup job
//! never blocks the deletion.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, DynamicObject, GroupVersionKind, PostParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tokio::time::{interval, sleep};

use crate::constants::{annotations, defaults, job_labels};
use crate::duration::{format_rfc3339_utc, parse_flexible_duration};
use crate::error::{Error, Result};

/// Cleanup job settings parsed from the expiring object's annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupJobConfig {
    pub config_map: String,
    pub script_key: String,
    pub service_account: String,
    pub image: String,
    pub env_from_secrets: Vec<String>,
    pub wait: bool,
    pub timeout: Duration,
    pub ttl_seconds_after_finished: i32,
    pub backoff_limit: i32,
}

/// Extract the cleanup job configuration from object annotations. Returns
/// `Ok(None)` when no cleanup job is configured (`on-delete-job` absent or
/// empty); any malformed option is an error the caller reports and then
/// ignores, proceeding with the deletion.
pub fn parse_cleanup_config(
    object_annotations: &std::collections::BTreeMap<String, String>,
) -> Result<Option<CleanupJobConfig>> {
    let Some(on_delete) = object_annotations
        .get(annotations::ON_DELETE_JOB)
        .filter(|v| !v.is_empty())
    else {
        return Ok(None);
    };

    let (config_map, script_key) = on_delete.split_once('/').ok_or_else(|| {
        Error::CleanupJobConfig(format!(
            "invalid on-delete-job format: expected 'configmap-name/script-key', got {on_delete:?}"
        ))
    })?;
    if config_map.is_empty() || script_key.is_empty() {
        return Err(Error::CleanupJobConfig(format!(
            "invalid on-delete-job format: expected 'configmap-name/script-key', got {on_delete:?}"
        )));
    }

    let mut config = CleanupJobConfig {
        config_map: config_map.to_string(),
        script_key: script_key.to_string(),
        service_account: defaults::JOB_SERVICE_ACCOUNT.to_string(),
        image: defaults::JOB_IMAGE.to_string(),
        env_from_secrets: Vec::new(),
        wait: false,
        timeout: Duration::from_secs(5 * 60),
        ttl_seconds_after_finished: defaults::JOB_TTL_SECONDS,
        backoff_limit: defaults::JOB_BACKOFF_LIMIT,
    };

    if let Some(account) = non_empty(object_annotations, annotations::JOB_SERVICE_ACCOUNT) {
        config.service_account = account.to_string();
    }
    if let Some(image) = non_empty(object_annotations, annotations::JOB_IMAGE) {
        config.image = image.to_string();
    }
    if let Some(secrets) = non_empty(object_annotations, annotations::JOB_ENV_SECRETS) {
        config.env_from_secrets = secrets
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(wait) = non_empty(object_annotations, annotations::JOB_WAIT) {
        config.wait = match wait.to_ascii_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            other => {
                return Err(Error::CleanupJobConfig(format!(
                    "invalid job-wait value: {other:?}"
                )))
            }
        };
    }
    if let Some(timeout) = non_empty(object_annotations, annotations::JOB_TIMEOUT) {
        let parsed = parse_flexible_duration(timeout)
            .map_err(|e| Error::CleanupJobConfig(format!("invalid job-timeout value: {e}")))?;
        config.timeout = parsed.to_std().map_err(|_| {
            Error::CleanupJobConfig(format!("job-timeout must be positive, got {timeout:?}"))
        })?;
    }
    if let Some(ttl) = non_empty(object_annotations, annotations::JOB_TTL) {
        config.ttl_seconds_after_finished = ttl
            .parse()
            .map_err(|_| Error::CleanupJobConfig(format!("invalid job-ttl value: {ttl:?}")))?;
    }
    if let Some(backoff) = non_empty(object_annotations, annotations::JOB_BACKOFF_LIMIT) {
        config.backoff_limit = backoff.parse().map_err(|_| {
            Error::CleanupJobConfig(format!("invalid job-backoff-limit value: {backoff:?}"))
        })?;
    }

    Ok(Some(config))
}

fn non_empty<'a>(
    object_annotations: &'a std::collections::BTreeMap<String, String>,
    key: &str,
) -> Option<&'a str> {
    object_annotations
        .get(key)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

/// envFrom projections for the listed Secret names.
fn build_env_from(secret_names: &[String]) -> Vec<Value> {
    secret_names
        .iter()
        .map(|name| json!({"secretRef": {"name": name}}))
        .collect()
}

/// Build the Job manifest: one container running the ConfigMap-projected
/// script at /scripts/cleanup-script with the source object's identity and
/// lease window in the environment.
pub fn cleanup_job_manifest(
    obj: &DynamicObject,
    gvk: &GroupVersionKind,
    config: &CleanupJobConfig,
    lease_started_at: DateTime<Utc>,
    lease_expired_at: DateTime<Utc>,
) -> Result<Value> {
    let labels_json = serde_json::to_string(obj.labels())?;
    let annotations_json = serde_json::to_string(obj.annotations())?;

    let env = json!([
        {"name": "OBJECT_NAME", "value": obj.name_any()},
        {"name": "OBJECT_NAMESPACE", "value": obj.namespace().unwrap_or_default()},
        {"name": "OBJECT_KIND", "value": gvk.kind},
        {"name": "OBJECT_GROUP", "value": gvk.group},
        {"name": "OBJECT_VERSION", "value": gvk.version},
        {"name": "OBJECT_UID", "value": obj.uid().unwrap_or_default()},
        {"name": "OBJECT_RESOURCE_VERSION", "value": obj.resource_version().unwrap_or_default()},
        {"name": "LEASE_STARTED_AT", "value": format_rfc3339_utc(lease_started_at)},
        {"name": "LEASE_EXPIRED_AT", "value": format_rfc3339_utc(lease_expired_at)},
        {"name": "OBJECT_LABELS", "value": labels_json},
        {"name": "OBJECT_ANNOTATIONS", "value": annotations_json},
    ]);

    Ok(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "generateName": format!("lease-cleanup-{}-", obj.name_any()),
            "namespace": obj.namespace(),
            "labels": {
                (job_labels::SOURCE_KIND): gvk.kind,
                (job_labels::SOURCE_NAME): obj.name_any(),
                (job_labels::CLEANUP_JOB): "true",
            }
        },
        "spec": {
            "ttlSecondsAfterFinished": config.ttl_seconds_after_finished,
            "backoffLimit": config.backoff_limit,
            "template": {
                "spec": {
                    "restartPolicy": "Never",
                    "serviceAccountName": config.service_account,
                    "volumes": [{
                        "name": "script",
                        "configMap": {
                            "name": config.config_map,
                            "defaultMode": 0o755,
                            "items": [{"key": config.script_key, "path": "cleanup-script"}]
                        }
                    }],
                    "containers": [{
                        "name": "cleanup",
                        "image": config.image,
                        "command": ["/scripts/cleanup-script"],
                        "env": env,
                        "envFrom": build_env_from(&config.env_from_secrets),
                        "volumeMounts": [{
                            "name": "script",
                            "mountPath": "/scripts",
                            "readOnly": true
                        }]
                    }]
                }
            }
        }
    }))
}

/// Submit the cleanup job in the source object's namespace.
pub async fn submit_cleanup_job(client: &Client, obj: &DynamicObject, manifest: Value) -> Result<Job> {
    let job: Job = serde_json::from_value(manifest)?;
    let namespace = obj
        .namespace()
        .unwrap_or_else(|| client.default_namespace().to_string());
    let api: Api<Job> = Api::namespaced(client.clone(), &namespace);
    api.create(&PostParams::default(), &job)
        .await
        .map_err(Error::CleanupJobSubmit)
}

/// Poll the job status until a `Complete` condition turns true, a `Failed`
/// condition turns true, or the timeout elapses.
pub async fn wait_for_job_completion(client: &Client, job: &Job, timeout: Duration) -> Result<()> {
    let namespace = job
        .namespace()
        .unwrap_or_else(|| client.default_namespace().to_string());
    let name = job.name_any();
    let api: Api<Job> = Api::namespaced(client.clone(), &namespace);

    let deadline = sleep(timeout);
    tokio::pin!(deadline);
    let mut ticker = interval(Duration::from_secs(defaults::JOB_POLL_INTERVAL_SECS));

    loop {
        tokio::select! {
            _ = &mut deadline => return Err(Error::CleanupJobTimeout),
            _ = ticker.tick() => {
                let current = api.get(&name).await?;
                let conditions = current
                    .status
                    .and_then(|status| status.conditions)
                    .unwrap_or_default();
                for condition in conditions {
                    if condition.type_ == "Complete" && condition.status == "True" {
                        return Ok(());
                    }
                    if condition.type_ == "Failed" && condition.status == "True" {
                        return Err(Error::CleanupJobFailed(
                            condition.message.unwrap_or_else(|| "job failed".to_string()),
                        ));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockService;
    use std::collections::BTreeMap;

    fn lease_annotations(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_no_job_configured() {
        assert_eq!(parse_cleanup_config(&lease_annotations(&[])).unwrap(), None);
        assert_eq!(
            parse_cleanup_config(&lease_annotations(&[(annotations::ON_DELETE_JOB, "")])).unwrap(),
            None
        );
    }

    #[test]
    fn test_defaults_applied() {
        let config = parse_cleanup_config(&lease_annotations(&[(
            annotations::ON_DELETE_JOB,
            "cleanup-scripts/teardown.sh",
        )]))
        .unwrap()
        .expect("configured");
        assert_eq!(config.config_map, "cleanup-scripts");
        assert_eq!(config.script_key, "teardown.sh");
        assert_eq!(config.service_account, "default");
        assert_eq!(config.image, defaults::JOB_IMAGE);
        assert!(!config.wait);
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.ttl_seconds_after_finished, 300);
        assert_eq!(config.backoff_limit, 3);
        assert!(config.env_from_secrets.is_empty());
    }

    #[test]
    fn test_all_options_parsed() {
        let config = parse_cleanup_config(&lease_annotations(&[
            (annotations::ON_DELETE_JOB, "cm/key"),
            (annotations::JOB_SERVICE_ACCOUNT, "cleaner"),
            (annotations::JOB_IMAGE, "alpine:3.20"),
            (annotations::JOB_WAIT, "true"),
            (annotations::JOB_TIMEOUT, "1m30s"),
            (annotations::JOB_TTL, "60"),
            (annotations::JOB_BACKOFF_LIMIT, "1"),
            (annotations::JOB_ENV_SECRETS, "aws-creds, db-creds"),
        ]))
        .unwrap()
        .expect("configured");
        assert_eq!(config.service_account, "cleaner");
        assert_eq!(config.image, "alpine:3.20");
        assert!(config.wait);
        assert_eq!(config.timeout, Duration::from_secs(90));
        assert_eq!(config.ttl_seconds_after_finished, 60);
        assert_eq!(config.backoff_limit, 1);
        assert_eq!(config.env_from_secrets, vec!["aws-creds", "db-creds"]);
    }

    #[test]
    fn test_env_secrets_trimmed_and_empty_dropped() {
        let config = parse_cleanup_config(&lease_annotations(&[
            (annotations::ON_DELETE_JOB, "cm/key"),
            (annotations::JOB_ENV_SECRETS, " a ,, b ,"),
        ]))
        .unwrap()
        .expect("configured");
        assert_eq!(config.env_from_secrets, vec!["a", "b"]);
    }

    #[test]
    fn test_invalid_on_delete_job_format() {
        for value in ["no-slash", "/key", "cm/"] {
            let result = parse_cleanup_config(&lease_annotations(&[(
                annotations::ON_DELETE_JOB,
                value,
            )]));
            assert!(result.is_err(), "expected error for {value:?}");
        }
    }

    #[test]
    fn test_invalid_options_rejected() {
        for (key, value) in [
            (annotations::JOB_WAIT, "maybe"),
            (annotations::JOB_TIMEOUT, "soon"),
            (annotations::JOB_TIMEOUT, "-5m"),
            (annotations::JOB_TTL, "forever"),
            (annotations::JOB_BACKOFF_LIMIT, "many"),
        ] {
            let result = parse_cleanup_config(&lease_annotations(&[
                (annotations::ON_DELETE_JOB, "cm/key"),
                (key, value),
            ]));
            assert!(result.is_err(), "expected error for {key}={value}");
        }
    }

    fn expiring_object() -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "doomed",
                "namespace": "team-a",
                "uid": "uid-1",
                "resourceVersion": "9",
                "labels": {"app": "demo"},
                "annotations": {(annotations::TTL): "1s"}
            }
        }))
        .unwrap()
    }

    fn test_manifest() -> Value {
        let config = CleanupJobConfig {
            config_map: "cleanup-scripts".to_string(),
            script_key: "teardown.sh".to_string(),
            service_account: "cleaner".to_string(),
            image: "alpine:3.20".to_string(),
            env_from_secrets: vec!["aws-creds".to_string()],
            wait: true,
            timeout: Duration::from_secs(60),
            ttl_seconds_after_finished: 60,
            backoff_limit: 1,
        };
        let gvk = GroupVersionKind::gvk("", "v1", "ConfigMap");
        let started = "2026-02-01T00:00:00Z".parse().unwrap();
        let expired = "2026-02-01T00:00:01Z".parse().unwrap();
        cleanup_job_manifest(&expiring_object(), &gvk, &config, started, expired).unwrap()
    }

    #[test]
    fn test_manifest_identity_and_labels() {
        let manifest = test_manifest();
        assert_eq!(
            manifest["metadata"]["generateName"],
            "lease-cleanup-doomed-"
        );
        assert_eq!(manifest["metadata"]["namespace"], "team-a");
        assert_eq!(
            manifest["metadata"]["labels"][job_labels::SOURCE_KIND],
            "ConfigMap"
        );
        assert_eq!(
            manifest["metadata"]["labels"][job_labels::SOURCE_NAME],
            "doomed"
        );
        assert_eq!(manifest["metadata"]["labels"][job_labels::CLEANUP_JOB], "true");
    }

    #[test]
    fn test_manifest_pod_template() {
        let manifest = test_manifest();
        let spec = &manifest["spec"];
        assert_eq!(spec["ttlSecondsAfterFinished"], 60);
        assert_eq!(spec["backoffLimit"], 1);

        let pod = &spec["template"]["spec"];
        assert_eq!(pod["restartPolicy"], "Never");
        assert_eq!(pod["serviceAccountName"], "cleaner");
        assert_eq!(pod["volumes"][0]["configMap"]["name"], "cleanup-scripts");
        assert_eq!(pod["volumes"][0]["configMap"]["defaultMode"], 0o755);
        assert_eq!(
            pod["volumes"][0]["configMap"]["items"][0]["key"],
            "teardown.sh"
        );
        assert_eq!(
            pod["volumes"][0]["configMap"]["items"][0]["path"],
            "cleanup-script"
        );

        let container = &pod["containers"][0];
        assert_eq!(container["image"], "alpine:3.20");
        assert_eq!(container["command"][0], "/scripts/cleanup-script");
        assert_eq!(container["volumeMounts"][0]["mountPath"], "/scripts");
        assert_eq!(container["volumeMounts"][0]["readOnly"], true);
        assert_eq!(
            container["envFrom"][0]["secretRef"]["name"],
            "aws-creds"
        );
    }

    #[test]
    fn test_manifest_environment() {
        let manifest = test_manifest();
        let env = manifest["spec"]["template"]["spec"]["containers"][0]["env"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| {
                (
                    entry["name"].as_str().unwrap().to_string(),
                    entry["value"].as_str().unwrap().to_string(),
                )
            })
            .collect::<std::collections::HashMap<_, _>>();
        assert_eq!(env["OBJECT_NAME"], "doomed");
        assert_eq!(env["OBJECT_NAMESPACE"], "team-a");
        assert_eq!(env["OBJECT_KIND"], "ConfigMap");
        assert_eq!(env["OBJECT_GROUP"], "");
        assert_eq!(env["OBJECT_VERSION"], "v1");
        assert_eq!(env["OBJECT_UID"], "uid-1");
        assert_eq!(env["OBJECT_RESOURCE_VERSION"], "9");
        assert_eq!(env["LEASE_STARTED_AT"], "2026-02-01T00:00:00Z");
        assert_eq!(env["LEASE_EXPIRED_AT"], "2026-02-01T00:00:01Z");
        assert_eq!(
            serde_json::from_str::<Value>(&env["OBJECT_LABELS"]).unwrap()["app"],
            "demo"
        );
        assert_eq!(
            serde_json::from_str::<Value>(&env["OBJECT_ANNOTATIONS"]).unwrap()
                [annotations::TTL],
            "1s"
        );
    }

    #[test]
    fn test_manifest_deserializes_as_job() {
        let job: Job = serde_json::from_value(test_manifest()).unwrap();
        assert_eq!(
            job.metadata.generate_name.as_deref(),
            Some("lease-cleanup-doomed-")
        );
    }

    fn completed_job_json(name: &str) -> String {
        serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": name, "namespace": "team-a"},
            "status": {"conditions": [{"type": "Complete", "status": "True"}]}
        })
        .to_string()
    }

    fn pending_job(name: &str) -> Job {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": name, "namespace": "team-a"}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_wait_returns_on_complete_condition() {
        let service = MockService::new().on_get(
            "/apis/batch/v1/namespaces/team-a/jobs/cleanup-1",
            200,
            &completed_job_json("cleanup-1"),
        );
        let client = service.into_client();
        let result = wait_for_job_completion(
            &client,
            &pending_job("cleanup-1"),
            Duration::from_secs(30),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_wait_surfaces_failed_condition() {
        let body = serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "cleanup-1", "namespace": "team-a"},
            "status": {"conditions": [{"type": "Failed", "status": "True", "message": "backoff limit exceeded"}]}
        })
        .to_string();
        let service =
            MockService::new().on_get("/apis/batch/v1/namespaces/team-a/jobs/cleanup-1", 200, &body);
        let client = service.into_client();
        let result = wait_for_job_completion(
            &client,
            &pending_job("cleanup-1"),
            Duration::from_secs(30),
        )
        .await;
        match result {
            Err(Error::CleanupJobFailed(message)) => {
                assert!(message.contains("backoff limit exceeded"))
            }
            other => panic!("expected CleanupJobFailed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let body = serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "cleanup-1", "namespace": "team-a"},
            "status": {"active": 1}
        })
        .to_string();
        let service =
            MockService::new().on_get("/apis/batch/v1/namespaces/team-a/jobs/cleanup-1", 200, &body);
        let client = service.into_client();
        let result = wait_for_job_completion(
            &client,
            &pending_job("cleanup-1"),
            Duration::from_secs(10),
        )
        .await;
        assert!(matches!(result, Err(Error::CleanupJobTimeout)));
    }
}
