//! The `ClusterClient` trait: the controller's sole seam onto the k8s API

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job as K8sJob;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, PropagationPolicy, WatchEvent, WatchParams};
use kube::Client;
use std::time::Duration;

use crate::k8s::crd::Check;
use crate::model::CheckKey;
use crate::Error;

/// The outcome of polling a worker Job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// The Job no longer exists (already reaped, or never created)
    Gone,
}

/// A single notification from a `Check` watch stream
pub enum ClusterEvent {
    Added(CheckKey, serde_json::Value),
    Modified(CheckKey, serde_json::Value),
    Deleted(CheckKey),
    /// The watch stream itself errored and must be resumed from scratch
    Error(String),
}

/// Everything the lifecycle engine needs from the cluster, behind a trait so
/// the runner/handler/watcher can be driven by fakes in tests instead of a
/// real API server.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    /// List every `Check` resource currently in the cluster, returning its
    /// resourceVersion for the subsequent watch to resume from.
    async fn list_checks(&self) -> Result<(Vec<(CheckKey, serde_json::Value)>, String), Error>;

    /// Watch `Check` resources starting after `resource_version`, yielding
    /// one `ClusterEvent` per notification until the stream ends or errors.
    async fn watch_checks(
        &self,
        resource_version: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<ClusterEvent>, Error>;

    /// Patch a `Check`'s status subresource
    async fn patch_status(&self, key: &CheckKey, patch: serde_json::Value) -> Result<(), Error>;

    /// Create the worker Job for a check's current attempt. A 409 Conflict
    /// (the Job already exists) is swallowed, not propagated - the caller
    /// reconciles against the existing Job instead.
    async fn create_job(&self, key: &CheckKey, job_name: &str, workload_spec: &serde_json::Value) -> Result<(), Error>;

    /// Poll a worker Job's current phase
    async fn job_phase(&self, key: &CheckKey, job_name: &str) -> Result<JobPhase, Error>;

    /// Fetch a worker Job's start time, if the cluster has recorded one
    async fn job_start_time(&self, key: &CheckKey, job_name: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>, Error>;

    /// Retrieve the combined logs of a worker Job's pod(s)
    async fn job_logs(&self, key: &CheckKey, job_name: &str) -> Result<String, Error>;

    /// Delete a worker Job, tolerating it already being gone
    async fn delete_job(&self, key: &CheckKey, job_name: &str) -> Result<(), Error>;
}

/// The real `ClusterClient`, backed by a `kube::Client`
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        KubeClusterClient { client }
    }

    fn checks_api(&self, namespace: &str) -> Api<Check> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn jobs_api(&self, namespace: &str) -> Api<K8sJob> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods_api(&self, namespace: &str) -> Api<k8s_openapi::api::core::v1::Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_checks(&self) -> Result<(Vec<(CheckKey, serde_json::Value)>, String), Error> {
        let api: Api<Check> = Api::all(self.client.clone());
        let list = api.list(&Default::default()).await?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let items = list
            .items
            .into_iter()
            .filter_map(|check| {
                let namespace = check.metadata.namespace.clone()?;
                let name = check.metadata.name.clone()?;
                let raw = serde_json::to_value(&check).ok()?;
                Some((CheckKey::new(namespace, name), raw))
            })
            .collect();
        Ok((items, resource_version))
    }

    async fn watch_checks(
        &self,
        resource_version: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<ClusterEvent>, Error> {
        let api: Api<Check> = Api::all(self.client.clone());
        let params = WatchParams::default();
        let mut stream = api.watch(&params, resource_version).await?.boxed();

        let (tx, rx) = tokio::sync::mpsc::channel(128);
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let mapped = match event {
                    Ok(WatchEvent::Added(check)) => to_cluster_event(&check, true),
                    Ok(WatchEvent::Modified(check)) => to_cluster_event(&check, false),
                    Ok(WatchEvent::Deleted(check)) => check
                        .metadata
                        .namespace
                        .clone()
                        .zip(check.metadata.name.clone())
                        .map(|(ns, name)| ClusterEvent::Deleted(CheckKey::new(ns, name))),
                    Ok(WatchEvent::Bookmark(_)) => None,
                    Ok(WatchEvent::Error(status)) => Some(ClusterEvent::Error(status.message)),
                    Err(err) => Some(ClusterEvent::Error(err.to_string())),
                };
                if let Some(event) = mapped {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn patch_status(&self, key: &CheckKey, patch: serde_json::Value) -> Result<(), Error> {
        let api = self.checks_api(&key.namespace);
        let params = PatchParams::default();
        api.patch_status(&key.name, &params, &Patch::Merge(patch)).await?;
        Ok(())
    }

    async fn create_job(&self, key: &CheckKey, job_name: &str, workload_spec: &serde_json::Value) -> Result<(), Error> {
        let raw = serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": job_name,
                "namespace": key.namespace,
                "labels": {"check-controller/check": key.name},
            },
            "spec": {
                "backoffLimit": 0,
                "ttlSecondsAfterFinished": 3600,
                "template": workload_spec,
            }
        });
        let job: K8sJob = serde_json::from_value(raw)?;
        let api = self.jobs_api(&key.namespace);
        match api.create(&PostParams::default(), &job).await {
            Ok(_) => Ok(()),
            Err(err) if Error::from(err).is_conflict() => Ok(()),
            Err(err) => Err(Error::from(err)),
        }
    }

    async fn job_phase(&self, key: &CheckKey, job_name: &str) -> Result<JobPhase, Error> {
        let api = self.jobs_api(&key.namespace);
        match api.get(job_name).await {
            Ok(job) => Ok(classify_job(&job)),
            Err(err) if Error::from(err).is_not_found() => Ok(JobPhase::Gone),
            Err(err) => Err(err.into()),
        }
    }

    async fn job_start_time(&self, key: &CheckKey, job_name: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>, Error> {
        let api = self.jobs_api(&key.namespace);
        match api.get(job_name).await {
            Ok(job) => Ok(job
                .status
                .and_then(|s| s.start_time)
                .map(|t| t.0)),
            Err(err) if Error::from(err).is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn job_logs(&self, key: &CheckKey, job_name: &str) -> Result<String, Error> {
        let pods = self.pods_api(&key.namespace);
        let list_params = kube::api::ListParams::default().labels(&format!("job-name={job_name}"));
        let pod_list = pods.list(&list_params).await?;
        let mut logs = String::new();
        for pod in pod_list.items {
            if let Some(name) = pod.metadata.name {
                if let Ok(pod_logs) = pods.logs(&name, &kube::api::LogParams::default()).await {
                    logs.push_str(&pod_logs);
                    logs.push('\n');
                }
            }
        }
        Ok(logs)
    }

    async fn delete_job(&self, key: &CheckKey, job_name: &str) -> Result<(), Error> {
        let api = self.jobs_api(&key.namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        match api.delete(job_name, &params).await {
            Ok(_) => Ok(()),
            Err(err) if Error::from(err).is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

fn to_cluster_event(check: &Check, added: bool) -> Option<ClusterEvent> {
    let namespace = check.metadata.namespace.clone()?;
    let name = check.metadata.name.clone()?;
    let raw = serde_json::to_value(check).ok()?;
    let key = CheckKey::new(namespace, name);
    Some(if added {
        ClusterEvent::Added(key, raw)
    } else {
        ClusterEvent::Modified(key, raw)
    })
}

fn classify_job(job: &K8sJob) -> JobPhase {
    let Some(status) = &job.status else {
        return JobPhase::Pending;
    };
    if status.succeeded.unwrap_or(0) > 0 {
        return JobPhase::Succeeded;
    }
    if status.failed.unwrap_or(0) > 0 {
        return JobPhase::Failed;
    }
    if status.active.unwrap_or(0) > 0 {
        return JobPhase::Running;
    }
    JobPhase::Pending
}

/// How long the watcher waits between consecutive fixed-cadence polls of a
/// worker Job's status (spec §4.6)
pub const JOB_POLL_INTERVAL: Duration = Duration::from_secs(5);
