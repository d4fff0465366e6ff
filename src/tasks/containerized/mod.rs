// Containerized workflow: catalog changes go through Git and a Konflux pipeline builds the index

pub mod add;
pub mod create_empty_index;
pub mod fbc_operations;
pub mod git;
pub mod gitlab;
pub mod konflux;
pub mod merge;
pub mod oras;
pub mod regenerate_bundle;
pub mod rm;

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::api::RequestState;
use crate::error::{IibError, Result};
use crate::opm::operations::copy_dir_all;
use crate::opm::INDEX_VERSION_LABEL;
use crate::registry::image_name;
use crate::registry::skopeo::skopeo_copy;
use crate::state::WorkerState;
use crate::tasks::prebuild::DISTRIBUTION_SCOPE_LABEL;

use self::gitlab::MergeRequest;

pub const BUILD_METADATA_FILE: &str = ".iib-build-metadata.json";

/// A clone of the catalog repository on the branch of the request's OCP version
#[derive(Debug, Clone)]
pub struct GitCheckout {
    pub repo_url: String,
    pub branch: String,
    pub path: PathBuf,
    pub catalog_dir: PathBuf,
}

/// What a request already published, undone by `cleanup_on_failure`
#[derive(Debug, Default)]
pub struct PublishedChanges {
    pub merge_request: Option<MergeRequest>,
    pub last_commit_sha: Option<String>,
    pub original_index_db_digest: Option<String>,
}

/// Read by the Konflux build to label and tag the index image
#[derive(Debug, Serialize)]
pub struct BuildMetadata<'a> {
    pub opm_version: &'a str,
    pub labels: BTreeMap<String, String>,
    pub binary_image: &'a str,
    pub request_id: u64,
    pub arches: Vec<String>,
}

impl<'a> BuildMetadata<'a> {
    pub fn new(
        request_id: u64,
        opm_version: &'a str,
        ocp_version: &str,
        distribution_scope: Option<&str>,
        binary_image: &'a str,
        arches: &BTreeSet<String>,
    ) -> Self {
        let labels = BTreeMap::from([
            (INDEX_VERSION_LABEL.to_string(), ocp_version.to_string()),
            (
                DISTRIBUTION_SCOPE_LABEL.to_string(),
                distribution_scope.unwrap_or_default().to_string(),
            ),
        ]);
        Self {
            opm_version,
            labels,
            binary_image,
            request_id,
            arches: arches.iter().cloned().collect(),
        }
    }
}

impl BuildMetadata<'_> {
    /// Request labels override the ones IIB sets
    pub fn with_labels(mut self, labels: &BTreeMap<String, String>) -> Self {
        self.labels.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }
}

pub fn write_build_metadata(local_repo_path: &Path, metadata: &BuildMetadata<'_>) -> Result<()> {
    let path = local_repo_path.join(BUILD_METADATA_FILE);
    fs::write(&path, serde_json::to_string_pretty(metadata)?)?;
    info!("Written build metadata to {}", path.display());
    Ok(())
}

/// Clone the repository mapped to `from_index` into `{temp_dir}/git/{branch}`
pub async fn prepare_git_repository(
    state: &WorkerState,
    request_id: u64,
    from_index: &str,
    temp_dir: &Path,
    branch: &str,
    index_to_gitlab_push_map: &BTreeMap<String, String>,
) -> Result<GitCheckout> {
    let repo_url = git::resolve_git_url(from_index, index_to_gitlab_push_map).ok_or_else(|| {
        IibError::iib(format!(
            "Git repository mapping not found for from_index: {} (base image: {}). \
             index_to_gitlab_push_map is required.",
            from_index,
            image_name(from_index)
        ))
    })?;
    let (token_name, token) = git::get_git_token(&state.settings, &repo_url)?;

    state
        .tracker()
        .set_request_state(request_id, RequestState::InProgress, "Cloning Git repository")
        .await?;
    let path = temp_dir.join("git").join(branch);
    fs::create_dir_all(&path)?;
    git::clone_git_repo(state, &repo_url, branch, &token_name, &token, &path).await?;
    git::configure_git_user(state, &path).await?;

    let catalog_dir = path.join("configs");
    if !catalog_dir.is_dir() {
        return Err(IibError::iib(format!(
            "Catalogs directory not found in {}",
            path.display()
        )));
    }
    Ok(GitCheckout {
        repo_url,
        branch: branch.to_string(),
        path,
        catalog_dir,
    })
}

/// Copy every package of `source` over the same package in `destination`
pub fn merge_catalogs_dirs(source: &Path, destination: &Path) -> Result<()> {
    info!(
        "Merging catalog {} into {}",
        source.display(),
        destination.display()
    );
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        copy_dir_all(&entry.path(), &destination.join(entry.file_name()))?;
    }
    Ok(())
}

fn is_deprecation_of(value: &Value, operators: &[String]) -> bool {
    value.get("schema").and_then(Value::as_str) == Some("olm.deprecations")
        && value
            .get("package")
            .and_then(Value::as_str)
            .map(|package| operators.iter().any(|op| op == package))
            .unwrap_or(false)
}

/// Drop `olm.deprecations` blobs of removed packages from the JSON files of a catalog
pub fn remove_operator_deprecations(configs_dir: &Path, operators: &[String]) -> Result<()> {
    let mut pending = vec![configs_dir.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            let blobs = serde_json::Deserializer::from_str(&content)
                .into_iter::<Value>()
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let kept: Vec<&Value> = blobs.iter().filter(|b| !is_deprecation_of(b, operators)).collect();
            if kept.len() == blobs.len() {
                continue;
            }
            debug!("Removing operator deprecations from {}", path.display());
            if kept.is_empty() {
                fs::remove_file(&path)?;
            } else {
                let rendered = kept
                    .iter()
                    .map(|blob| serde_json::to_string_pretty(blob))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                fs::write(&path, rendered.join("\n") + "\n")?;
            }
        }
    }
    Ok(())
}

/// Commit the checkout, then push it to the branch when overwriting `from_index`,
/// or to a feature branch with a merge request otherwise
pub async fn commit_and_create_mr_or_push(
    state: &WorkerState,
    request_id: u64,
    checkout: &GitCheckout,
    commit_message: &str,
    overwrite_from_index: bool,
    changes: &mut PublishedChanges,
) -> Result<()> {
    state
        .tracker()
        .set_request_state(
            request_id,
            RequestState::InProgress,
            "Committing changes to Git repository",
        )
        .await?;
    info!("Committing changes to Git repository. Triggering KONFLUX pipeline.");
    git::stage_all(state, &checkout.path).await?;

    if overwrite_from_index {
        git::commit_and_push(
            state,
            request_id,
            &checkout.path,
            &checkout.repo_url,
            &checkout.branch,
            Some(commit_message),
        )
        .await?;
    } else {
        let mr = git::create_mr(
            state,
            request_id,
            &checkout.path,
            &checkout.repo_url,
            &checkout.branch,
            Some(commit_message),
        )
        .await?;
        info!("Created merge request: {}", mr.web_url);
        changes.merge_request = Some(mr);
    }
    changes.last_commit_sha = Some(git::get_last_commit_sha(state, &checkout.path).await?);
    Ok(())
}

/// Wait for the pipelinerun of `commit_sha` and return the image it built
pub async fn monitor_pipeline_and_extract_image(
    state: &WorkerState,
    request_id: u64,
    commit_sha: &str,
) -> Result<String> {
    state
        .tracker()
        .set_request_state(request_id, RequestState::InProgress, "Waiting on KONFLUX build")
        .await?;
    let name = konflux::find_pipelinerun(state, commit_sha).await?;
    let run = konflux::wait_for_pipeline_completion(state, &name).await?;
    konflux::get_pipelinerun_image_url(&name, &run)
}

/// Copy the Konflux image to the request's pull spec and to one per build tag
///
/// The request's own pull spec comes first.
pub async fn replicate_image_to_tagged_destinations(
    state: &WorkerState,
    request_id: u64,
    image_url: &str,
    build_tags: &[String],
) -> Result<Vec<String>> {
    state
        .tracker()
        .set_request_state(
            request_id,
            RequestState::InProgress,
            "Copying built index to IIB registry",
        )
        .await?;
    let tags = std::iter::once(request_id.to_string()).chain(build_tags.iter().cloned());
    let mut output_pull_specs = Vec::new();
    for tag in tags {
        let destination = state.settings.rebuilt_image_pull_spec(&tag);
        skopeo_copy(
            state,
            &format!("docker://{}", image_url),
            &format!("docker://{}", destination),
            true,
            Some(&format!(
                "Failed to copy built index from Konflux to {}",
                destination
            )),
        )
        .await?;
        info!("Successfully copied image to {}", destination);
        output_pull_specs.push(destination);
    }
    Ok(output_pull_specs)
}

/// Close a merge request opened only to trigger the pipeline; failures are logged
pub async fn close_merge_request_if_exists(state: &WorkerState, mr: Option<&MergeRequest>) {
    if let Some(mr) = mr {
        match git::close_mr(state, mr).await {
            Ok(()) => info!("Closed merge request: {}", mr.web_url),
            Err(e) => warn!("Failed to close merge request: {}", e),
        }
    }
}

/// Undo what a failed request published
///
/// Cleanup errors are logged and never replace the error being reported.
pub async fn cleanup_on_failure(
    state: &WorkerState,
    request_id: u64,
    checkout: Option<&GitCheckout>,
    changes: &PublishedChanges,
    overwrite_from_index: bool,
    from_index: &str,
    reason: &str,
) {
    match (checkout, &changes.merge_request, &changes.last_commit_sha) {
        (Some(_), Some(mr), _) => {
            info!("Closing merge request due to {}", reason);
            match git::close_mr(state, mr).await {
                Ok(()) => info!("Closed merge request: {}", mr.web_url),
                Err(e) => warn!("Failed to close merge request: {}", e),
            }
        }
        (Some(checkout), None, Some(_)) if overwrite_from_index => {
            error!("Reverting commit due to {}", reason);
            if let Err(e) =
                git::revert_last_commit(state, request_id, &checkout.repo_url, &checkout.branch).await
            {
                error!("Failed to revert commit: {}", e);
            }
        }
        _ => error!("Neither MR nor commit to revert. No cleanup needed for {}", reason),
    }

    if let Some(digest) = &changes.original_index_db_digest {
        info!("Restoring index.db artifact to original digest due to {}", reason);
        if let Err(e) = oras::restore_index_db_artifact(state, from_index, digest).await {
            error!("Failed to restore index.db artifact: {}", e);
        }
    }
}
