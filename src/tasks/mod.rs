// Request handlers, one module per request type

pub mod add;
pub mod add_deprecations;
pub mod build;
pub mod containerized;
pub mod create_empty_index;
pub mod fbc_operations;
pub mod merge;
pub mod prebuild;
pub mod recursive_related_bundles;
pub mod regenerate_bundle;
pub mod rm;

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::api::mark_request_failed;
use crate::error::{IibError, Result};
use crate::state::WorkerState;

/// A task as queued for the worker: `{"task": "<handler>", "args": {...}}`
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "task", content = "args")]
pub enum TaskInvocation {
    #[serde(rename = "handle_add_request")]
    Add(add::AddRequest),
    #[serde(rename = "handle_rm_request")]
    Rm(rm::RmRequest),
    #[serde(rename = "handle_merge_request")]
    Merge(merge::MergeRequest),
    #[serde(rename = "handle_regenerate_bundle_request")]
    RegenerateBundle(regenerate_bundle::RegenerateBundleRequest),
    #[serde(rename = "handle_create_empty_index_request")]
    CreateEmptyIndex(create_empty_index::CreateEmptyIndexRequest),
    #[serde(rename = "handle_fbc_operation_request")]
    FbcOperation(fbc_operations::FbcOperationRequest),
    #[serde(rename = "handle_add_deprecations_request")]
    AddDeprecations(add_deprecations::AddDeprecationsRequest),
    #[serde(rename = "handle_recursive_related_bundles_request")]
    RecursiveRelatedBundles(recursive_related_bundles::RecursiveRelatedBundlesRequest),
    #[serde(rename = "handle_containerized_add_request")]
    ContainerizedAdd(containerized::add::ContainerizedAddRequest),
    #[serde(rename = "handle_containerized_rm_request")]
    ContainerizedRm(containerized::rm::ContainerizedRmRequest),
    #[serde(rename = "handle_containerized_merge_request")]
    ContainerizedMerge(containerized::merge::ContainerizedMergeRequest),
    #[serde(rename = "handle_containerized_create_empty_index_request")]
    ContainerizedCreateEmptyIndex(containerized::create_empty_index::ContainerizedCreateEmptyIndexRequest),
    #[serde(rename = "handle_containerized_fbc_operation_request")]
    ContainerizedFbcOperation(containerized::fbc_operations::ContainerizedFbcOperationRequest),
    #[serde(rename = "handle_containerized_regenerate_bundle_request")]
    ContainerizedRegenerateBundle(containerized::regenerate_bundle::ContainerizedRegenerateBundleRequest),
}

impl TaskInvocation {
    pub fn request_id(&self) -> u64 {
        match self {
            TaskInvocation::Add(r) => r.request_id,
            TaskInvocation::Rm(r) => r.request_id,
            TaskInvocation::Merge(r) => r.request_id,
            TaskInvocation::RegenerateBundle(r) => r.request_id,
            TaskInvocation::CreateEmptyIndex(r) => r.request_id,
            TaskInvocation::FbcOperation(r) => r.request_id,
            TaskInvocation::AddDeprecations(r) => r.request_id,
            TaskInvocation::RecursiveRelatedBundles(r) => r.request_id,
            TaskInvocation::ContainerizedAdd(r) => r.request_id,
            TaskInvocation::ContainerizedRm(r) => r.request_id,
            TaskInvocation::ContainerizedMerge(r) => r.request_id,
            TaskInvocation::ContainerizedCreateEmptyIndex(r) => r.request_id,
            TaskInvocation::ContainerizedFbcOperation(r) => r.request_id,
            TaskInvocation::ContainerizedRegenerateBundle(r) => r.request_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskInvocation::Add(_) => "handle_add_request",
            TaskInvocation::Rm(_) => "handle_rm_request",
            TaskInvocation::Merge(_) => "handle_merge_request",
            TaskInvocation::RegenerateBundle(_) => "handle_regenerate_bundle_request",
            TaskInvocation::CreateEmptyIndex(_) => "handle_create_empty_index_request",
            TaskInvocation::FbcOperation(_) => "handle_fbc_operation_request",
            TaskInvocation::AddDeprecations(_) => "handle_add_deprecations_request",
            TaskInvocation::RecursiveRelatedBundles(_) => "handle_recursive_related_bundles_request",
            TaskInvocation::ContainerizedAdd(_) => "handle_containerized_add_request",
            TaskInvocation::ContainerizedRm(_) => "handle_containerized_rm_request",
            TaskInvocation::ContainerizedMerge(_) => "handle_containerized_merge_request",
            TaskInvocation::ContainerizedCreateEmptyIndex(_) => "handle_containerized_create_empty_index_request",
            TaskInvocation::ContainerizedFbcOperation(_) => "handle_containerized_fbc_operation_request",
            TaskInvocation::ContainerizedRegenerateBundle(_) => "handle_containerized_regenerate_bundle_request",
        }
    }
}

async fn run(state: &WorkerState, task: &TaskInvocation) -> Result<()> {
    match task {
        TaskInvocation::Add(r) => add::handle_add_request(state, r).await,
        TaskInvocation::Rm(r) => rm::handle_rm_request(state, r).await,
        TaskInvocation::Merge(r) => merge::handle_merge_request(state, r).await,
        TaskInvocation::RegenerateBundle(r) => regenerate_bundle::handle_regenerate_bundle_request(state, r).await,
        TaskInvocation::CreateEmptyIndex(r) => {
            create_empty_index::handle_create_empty_index_request(state, r).await
        }
        TaskInvocation::FbcOperation(r) => fbc_operations::handle_fbc_operation_request(state, r).await,
        TaskInvocation::AddDeprecations(r) => add_deprecations::handle_add_deprecations_request(state, r).await,
        TaskInvocation::RecursiveRelatedBundles(r) => {
            recursive_related_bundles::handle_recursive_related_bundles_request(state, r).await
        }
        TaskInvocation::ContainerizedAdd(r) => containerized::add::handle_containerized_add_request(state, r).await,
        TaskInvocation::ContainerizedRm(r) => containerized::rm::handle_containerized_rm_request(state, r).await,
        TaskInvocation::ContainerizedMerge(r) => {
            containerized::merge::handle_containerized_merge_request(state, r).await
        }
        TaskInvocation::ContainerizedCreateEmptyIndex(r) => {
            containerized::create_empty_index::handle_containerized_create_empty_index_request(state, r).await
        }
        TaskInvocation::ContainerizedFbcOperation(r) => {
            containerized::fbc_operations::handle_containerized_fbc_operation_request(state, r).await
        }
        TaskInvocation::ContainerizedRegenerateBundle(r) => {
            containerized::regenerate_bundle::handle_containerized_regenerate_bundle_request(state, r).await
        }
    }
}

/// Mark the request failed with the user-facing text of `err`
///
/// A request that already reached a final state is left alone.
pub async fn failed_request_callback(state: &WorkerState, request_id: u64, err: &IibError) -> Result<()> {
    match mark_request_failed(state.tracker(), request_id, &err.user_message()).await {
        Err(IibError::FinalStateOverwrite(msg)) => {
            info!("Request {} was not marked as failed: {}", request_id, msg);
            Ok(())
        }
        other => other,
    }
}

/// Run a task, reporting a failure on the request before returning it
pub async fn dispatch(state: &WorkerState, task: &TaskInvocation) -> Result<()> {
    let request_id = task.request_id();
    info!("Running {} for request {}", task.name(), request_id);
    let result = run(state, task).await;
    if let Err(e) = &result {
        error!("{} failed for request {}: {}", task.name(), request_id, e);
        if let Err(callback_err) = failed_request_callback(state, request_id, e).await {
            warn!(
                "Failed to mark request {} as failed: {}",
                request_id, callback_err
            );
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RequestState;
    use crate::testing::TestHarness;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_task_invocation_by_handler_name() {
        let task: TaskInvocation = serde_json::from_value(json!({
            "task": "handle_containerized_rm_request",
            "args": {
                "request_id": 9,
                "operators": ["etcd"],
                "from_index": "quay.io/ns/index:v4.19",
                "binary_image": "quay.io/ns/opm:v4.19",
            },
        }))
        .unwrap();
        assert!(matches!(task, TaskInvocation::ContainerizedRm(_)));
        assert_eq!(task.request_id(), 9);
        assert_eq!(task.name(), "handle_containerized_rm_request");

        let task: TaskInvocation = serde_json::from_value(json!({
            "task": "handle_containerized_fbc_operation_request",
            "args": {
                "request_id": 10,
                "fbc_fragments": ["quay.io/ns/fragment:1"],
                "from_index": "quay.io/ns/index:v4.19",
                "binary_image": "quay.io/ns/opm:v4.19",
            },
        }))
        .unwrap();
        assert!(matches!(task, TaskInvocation::ContainerizedFbcOperation(_)));
        assert_eq!(task.name(), "handle_containerized_fbc_operation_request");

        let task: TaskInvocation = serde_json::from_value(json!({
            "task": "handle_containerized_regenerate_bundle_request",
            "args": {"request_id": 11, "from_bundle_image": "quay.io/ns/etcd-bundle:1"},
        }))
        .unwrap();
        match &task {
            TaskInvocation::ContainerizedRegenerateBundle(r) => {
                assert_eq!(r.regenerate_bundle_repo_key, "regenerate-bundle")
            }
            other => panic!("unexpected task {:?}", other),
        }
        assert_eq!(task.request_id(), 11);

        let unknown = serde_json::from_value::<TaskInvocation>(json!({"task": "handle_nothing", "args": {}}));
        assert!(unknown.is_err());
    }

    #[tokio::test]
    async fn test_dispatch_marks_request_failed() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.tracker.create(4);
        let task: TaskInvocation = serde_json::from_value(json!({
            "task": "handle_rm_request",
            "args": {
                "request_id": 4,
                "operators": ["etcd"],
                "from_index": "quay.io/ns/index:v4.12",
                "binary_image": "quay.io/ns/opm:v4.12",
                "overwrite_from_index_token": "user:pass",
            },
        }))
        .unwrap();

        let err = dispatch(&harness.state, &task).await.unwrap_err();
        assert!(matches!(err, IibError::Validation(_)));
        assert_eq!(harness.tracker.state(4), Some(RequestState::Failed));
        assert_eq!(harness.tracker.state_reason(4), Some(err.to_string()));
    }

    #[tokio::test]
    async fn test_failed_request_callback_leaves_final_states() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.tracker.create(5);
        harness
            .state
            .tracker()
            .set_request_state(5, RequestState::Complete, "done")
            .await
            .unwrap();

        failed_request_callback(&harness.state, 5, &IibError::iib("late failure"))
            .await
            .unwrap();
        assert_eq!(harness.tracker.state(5), Some(RequestState::Complete));
        assert_eq!(harness.tracker.state_reason(5).as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_failed_request_callback_hides_internal_errors() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.tracker.create(6);
        let err = IibError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk on fire"));

        failed_request_callback(&harness.state, 6, &err).await.unwrap();
        assert_eq!(
            harness.tracker.state_reason(6).as_deref(),
            Some("An unknown error occurred")
        );
    }
}
