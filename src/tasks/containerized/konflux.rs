use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{error, info};

use crate::error::{IibError, Result};
use crate::retry::{on_iib_error, with_retry, RetryPolicy};
use crate::settings::WorkerSettings;
use crate::state::WorkerState;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
const PIPELINERUN_LOOKUP_ATTEMPTS: u32 = 5;

/// Read access to Tekton `pipelineruns` of the Konflux tenant namespace
#[async_trait]
pub trait PipelineMonitor: Send + Sync {
    /// Runs labelled `pipelinesascode.tekton.dev/sha={commit_sha}`
    async fn list_pipelineruns(&self, commit_sha: &str) -> Result<Vec<Value>>;

    async fn get_pipelinerun(&self, name: &str) -> Result<Value>;
}

/// `PipelineMonitor` on the Kubernetes API, connected on first use
pub struct KubePipelineMonitor {
    namespace: String,
    client: OnceCell<kube::Client>,
}

impl KubePipelineMonitor {
    pub fn new(settings: &WorkerSettings) -> Self {
        Self {
            namespace: settings.iib_konflux_namespace.clone(),
            client: OnceCell::new(),
        }
    }

    async fn api(&self) -> Result<Api<DynamicObject>> {
        let client = self
            .client
            .get_or_try_init(|| async {
                // In-cluster service account or ~/.kube/config
                let config = kube::Config::infer().await.map_err(|e| {
                    error!("Failed to load the Kubernetes configuration: {}", e);
                    IibError::iib("Failed to initialize Kubernetes client")
                })?;
                info!("Configuring Kubernetes client for {}", config.cluster_url);
                kube::Client::try_from(config).map_err(IibError::from)
            })
            .await?;
        let gvk = GroupVersionKind::gvk("tekton.dev", "v1", "PipelineRun");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pipelineruns");
        Ok(Api::namespaced_with(client.clone(), &self.namespace, &resource))
    }
}

#[async_trait]
impl PipelineMonitor for KubePipelineMonitor {
    async fn list_pipelineruns(&self, commit_sha: &str) -> Result<Vec<Value>> {
        let params = ListParams::default().labels(&format!("pipelinesascode.tekton.dev/sha={}", commit_sha));
        let runs = self.api().await?.list(&params).await.map_err(|e| {
            error!("Kubernetes API error while fetching pipelineruns: {}", e);
            IibError::iib(format!("Failed to fetch pipelineruns for commit {}", commit_sha))
        })?;
        runs.items
            .into_iter()
            .map(|run| serde_json::to_value(run).map_err(IibError::from))
            .collect()
    }

    async fn get_pipelinerun(&self, name: &str) -> Result<Value> {
        let run = self.api().await?.get(name).await.map_err(|e| {
            error!("Kubernetes API error while monitoring pipelinerun {}: {}", name, e);
            IibError::iib(format!("Failed to monitor pipelinerun {}", name))
        })?;
        Ok(serde_json::to_value(run)?)
    }
}

/// Name of the pipelinerun triggered by `commit_sha`
///
/// Pipelines as Code creates the run shortly after the push, so an empty result is retried.
pub async fn find_pipelinerun(state: &WorkerState, commit_sha: &str) -> Result<String> {
    info!("Searching for pipelineruns with commit SHA: {}", commit_sha);
    let policy = RetryPolicy::from_settings(&state.settings).with_attempts(PIPELINERUN_LOOKUP_ATTEMPTS);
    let runs = with_retry(&policy, "find_pipelinerun", on_iib_error, || async {
        let runs = state.pipelines.list_pipelineruns(commit_sha).await?;
        if runs.is_empty() {
            return Err(IibError::iib(format!(
                "No pipelinerun found for commit {}",
                commit_sha
            )));
        }
        Ok(runs)
    })
    .await?;
    info!("Found {} pipelinerun(s) for commit {}", runs.len(), commit_sha);

    runs[0]
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| IibError::iib("Pipelinerun name not found in pipeline metadata"))
}

/// Outcome of one status poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineRunStatus {
    Running,
    Succeeded,
}

/// Interpret the first `status.conditions` entry of a pipelinerun
pub fn pipelinerun_status(name: &str, run: &Value) -> Result<PipelineRunStatus> {
    let condition = match run.pointer("/status/conditions/0") {
        Some(condition) => condition,
        None => {
            info!("Pipelinerun {} is still initializing...", name);
            return Ok(PipelineRunStatus::Running);
        }
    };
    let field = |key: &str| condition.get(key).and_then(Value::as_str).unwrap_or("");
    let reason = field("reason");
    let status = field("status");
    let message = field("message");
    info!("Pipelinerun {} status: reason={}, status={}", name, reason, status);
    if !message.is_empty() {
        info!("Pipelinerun {} message: {}", name, message);
    }

    match reason {
        "Succeeded" | "Completed" => {
            info!("Pipelinerun {} completed successfully", name);
            return Ok(PipelineRunStatus::Succeeded);
        }
        "Cancelled" => {
            return Err(IibError::iib(format!("Pipelinerun {} was cancelled", name)));
        }
        "PipelineRunTimeout" => {
            return Err(IibError::iib(format!("Pipelinerun {} failed due to timeout", name)));
        }
        "CreateRunFailed" => {
            return Err(IibError::iib(format!(
                "Pipelinerun {} failed due to resource creation failure",
                name
            )));
        }
        _ => {}
    }
    if reason == "Failed" || status == "False" {
        let mut msg = format!("Pipelinerun {} failed", name);
        if !message.is_empty() {
            msg.push_str(&format!(": {}", message));
        }
        return Err(IibError::iib(msg));
    }

    info!("Pipelinerun {} is still running... (reason: {})", name, reason);
    Ok(PipelineRunStatus::Running)
}

/// Poll a pipelinerun until it succeeds, fails or `iib_konflux_pipeline_timeout` elapses
pub async fn wait_for_pipeline_completion(state: &WorkerState, name: &str) -> Result<Value> {
    let timeout = Duration::from_secs(state.settings.iib_konflux_pipeline_timeout);
    let poll_interval = Duration::from_secs(state.settings.iib_konflux_poll_interval).max(MIN_POLL_INTERVAL);
    info!("Starting to monitor pipelinerun: {}", name);

    let started = Instant::now();
    loop {
        if started.elapsed() > timeout {
            return Err(IibError::iib(format!(
                "Timeout waiting for pipelinerun {} to complete after {} seconds",
                name,
                timeout.as_secs()
            )));
        }
        let run = state.pipelines.get_pipelinerun(name).await?;
        if pipelinerun_status(name, &run)? == PipelineRunStatus::Succeeded {
            return Ok(run);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// `IMAGE_URL` result of a finished pipelinerun
pub fn get_pipelinerun_image_url(name: &str, run: &Value) -> Result<String> {
    let results = run
        .pointer("/status/results")
        .or_else(|| run.pointer("/status/pipelineResults"))
        .and_then(Value::as_array);
    let image_url = results.and_then(|results| {
        results
            .iter()
            .find(|result| result.get("name").and_then(Value::as_str) == Some("IMAGE_URL"))
            .and_then(|result| result.get("value"))
            .and_then(Value::as_str)
    });
    match image_url.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => {
            info!("Extracted IMAGE_URL from pipelinerun {}: {}", name, url);
            Ok(url.to_string())
        }
        None => Err(IibError::iib(format!(
            "IMAGE_URL not found in pipelinerun {} results",
            name
        ))),
    }
}
