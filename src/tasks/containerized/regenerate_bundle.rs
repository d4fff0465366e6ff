use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::api::{RequestState, RequestUpdate};
use crate::error::{IibError, Result};
use crate::registry::podman::copy_files_from_image;
use crate::registry::skopeo::{get_image_arches, get_image_label, get_resolved_image};
use crate::state::WorkerState;
use crate::tasks::build::public_pull_spec;
use crate::tasks::prebuild::arches_str;
use crate::tasks::regenerate_bundle::{bundle_dockerfile, AnnotationsRewriter, BUNDLE_DOCKERFILE, PINNED_LABEL};

use super::{
    cleanup_on_failure, close_merge_request_if_exists, commit_and_create_mr_or_push, git,
    monitor_pipeline_and_extract_image, replicate_image_to_tagged_destinations, GitCheckout, PublishedChanges,
    BUILD_METADATA_FILE,
};

fn default_repo_key() -> String {
    "regenerate-bundle".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerizedRegenerateBundleRequest {
    pub request_id: u64,
    pub from_bundle_image: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub index_to_gitlab_push_map: BTreeMap<String, String>,
    /// Both the key of the bundle repository in the map and the branch to build from
    #[serde(default = "default_repo_key")]
    pub regenerate_bundle_repo_key: String,
}

/// Bundle builds carry no index labels, so this replaces `BuildMetadata`
#[derive(Debug, Serialize)]
struct BundleBuildMetadata<'a> {
    request_id: u64,
    arches: Vec<String>,
    organization: Option<&'a str>,
    package_name: &'a str,
}

async fn clone_bundle_repository(
    state: &WorkerState,
    request: &ContainerizedRegenerateBundleRequest,
    temp_dir: &Path,
) -> Result<GitCheckout> {
    let key = &request.regenerate_bundle_repo_key;
    let repo_url = request
        .index_to_gitlab_push_map
        .get(key)
        .cloned()
        .ok_or_else(|| IibError::iib(format!("Repository not found for key: {}", key)))?;
    let (token_name, token) = git::get_git_token(&state.settings, &repo_url)?;

    state
        .tracker()
        .set_request_state(request.request_id, RequestState::InProgress, "Cloning Git repository")
        .await?;
    let path = temp_dir.join("git").join(key);
    fs::create_dir_all(&path)?;
    git::clone_git_repo(state, &repo_url, key, &token_name, &token, &path).await?;
    git::configure_git_user(state, &path).await?;
    Ok(GitCheckout {
        repo_url,
        branch: key.clone(),
        catalog_dir: path.join("configs"),
        path,
    })
}

/// Lay the adjusted bundle, its Dockerfile and the build metadata out in the checkout
async fn prepare_bundle(
    state: &WorkerState,
    request: &ContainerizedRegenerateBundleRequest,
    checkout: &GitCheckout,
    resolved: &str,
    arches: &BTreeSet<String>,
    pinned_by_iib: bool,
) -> Result<String> {
    let request_id = request.request_id;
    let tracker = state.tracker();
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Extracting bundle contents")
        .await?;
    let manifests_path = checkout.path.join("manifests");
    copy_files_from_image(state, resolved, "/manifests", &manifests_path).await?;
    let metadata_path = checkout.path.join("metadata");
    copy_files_from_image(state, resolved, "/metadata", &metadata_path).await?;

    tracker
        .set_request_state(request_id, RequestState::InProgress, "Modifying bundle manifests")
        .await?;
    let labels = state
        .bundle_rewriter
        .adjust_bundle(
            &manifests_path,
            &metadata_path,
            request.organization.as_deref(),
            pinned_by_iib,
        )
        .await?;
    let package_name = AnnotationsRewriter::package_name(&metadata_path)?;

    tracker
        .set_request_state(request_id, RequestState::InProgress, "Creating Dockerfile")
        .await?;
    fs::write(checkout.path.join(BUNDLE_DOCKERFILE), bundle_dockerfile(resolved, &labels))?;

    tracker
        .set_request_state(request_id, RequestState::InProgress, "Writing build metadata")
        .await?;
    let metadata = BundleBuildMetadata {
        request_id,
        arches: arches.iter().cloned().collect(),
        organization: request.organization.as_deref(),
        package_name: &package_name,
    };
    let metadata_file = checkout.path.join(BUILD_METADATA_FILE);
    fs::write(&metadata_file, serde_json::to_string_pretty(&metadata)?)?;
    info!("Written build metadata to {}", metadata_file.display());
    Ok(package_name)
}

async fn publish(
    state: &WorkerState,
    request: &ContainerizedRegenerateBundleRequest,
    checkout: &GitCheckout,
    package_name: &str,
    changes: &mut PublishedChanges,
) -> Result<String> {
    let request_id = request.request_id;
    let commit_message = format!(
        "IIB: Regenerate bundle for request {}\n\nOrganization: {}\nPackage: {}",
        request_id,
        request.organization.as_deref().unwrap_or("None"),
        package_name
    );
    // Regenerated bundles are throw-away builds and always go through a merge request
    commit_and_create_mr_or_push(state, request_id, checkout, &commit_message, false, changes).await?;
    let commit_sha = changes
        .last_commit_sha
        .clone()
        .ok_or_else(|| IibError::iib("Error getting the last commit SHA"))?;

    let image_url = monitor_pipeline_and_extract_image(state, request_id, &commit_sha).await?;
    let output_pull_specs = replicate_image_to_tagged_destinations(state, request_id, &image_url, &[]).await?;
    let bundle_image = public_pull_spec(state, &output_pull_specs[0]);
    close_merge_request_if_exists(state, changes.merge_request.as_ref()).await;
    Ok(bundle_image)
}

/// Rebuild a bundle image for `organization` through its Git repository and Konflux
pub async fn handle_containerized_regenerate_bundle_request(
    state: &WorkerState,
    request: &ContainerizedRegenerateBundleRequest,
) -> Result<()> {
    let request_id = request.request_id;
    let tracker = state.tracker();
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Resolving from_bundle_image")
        .await?;

    let resolved = get_resolved_image(state, &request.from_bundle_image).await?;
    let arches = get_image_arches(state, &resolved).await?;
    if arches.is_empty() {
        return Err(IibError::iib(format!(
            "No arches were found in the resolved from_bundle_image {}",
            resolved
        )));
    }
    let pinned_by_iib = get_image_label(state, &resolved, PINNED_LABEL)
        .await?
        .is_some_and(|value| value.trim() == "true");
    debug!(
        "Set to regenerate the bundle image for the following arches: {}",
        arches_str(&arches)
    );
    let payload = RequestUpdate {
        from_bundle_image_resolved: Some(resolved.clone()),
        ..RequestUpdate::state(
            RequestState::InProgress,
            format!(
                "Regenerating the bundle image for the following arches: {}",
                arches_str(&arches)
            ),
        )
    };
    tracker
        .update_request(
            request_id,
            &payload,
            Some("Failed setting the resolved \"from_bundle_image\" on the request"),
        )
        .await?;

    let temp_dir = tempfile::Builder::new()
        .prefix(&format!("iib-{}-", request_id))
        .tempdir()?;
    let checkout = clone_bundle_repository(state, request, temp_dir.path()).await?;
    let package_name = prepare_bundle(state, request, &checkout, &resolved, &arches, pinned_by_iib).await?;

    let mut changes = PublishedChanges::default();
    let bundle_image = match publish(state, request, &checkout, &package_name, &mut changes).await {
        Ok(bundle_image) => bundle_image,
        Err(e) => {
            cleanup_on_failure(
                state,
                request_id,
                Some(&checkout),
                &changes,
                false,
                "",
                &format!("error: {}", e),
            )
            .await;
            return Err(IibError::iib(format!("Failed to regenerate bundle: {}", e)));
        }
    };
    info!("Regenerated {} as {}", request.from_bundle_image, bundle_image);

    let payload = RequestUpdate {
        arches: Some(arches.into_iter().collect()),
        bundle_image: Some(bundle_image),
        ..RequestUpdate::state(RequestState::Complete, "The request completed successfully")
    };
    tracker
        .update_request(
            request_id,
            &payload,
            Some("Failed setting the bundle image on the request"),
        )
        .await?;
    Ok(())
}
