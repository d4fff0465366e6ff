use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::api::RequestState;
use crate::error::{IibError, Result};
use crate::opm::index::get_bundles_from_db;
use crate::opm::operations::{copy_dir_all, opm_registry_rm, opm_registry_rm_permissive, opm_validate};
use crate::opm::OpmContext;
use crate::registry::auth::reset_docker_config;
use crate::state::WorkerState;
use crate::tasks::build::{update_index_image_pull_spec, PullSpecUpdate};
use crate::tasks::prebuild::{prepare_request_for_build, update_index_image_build_state, PrebuildInfo, PrebuildRequest};

use super::{
    cleanup_on_failure, close_merge_request_if_exists, commit_and_create_mr_or_push,
    monitor_pipeline_and_extract_image, oras, prepare_git_repository,
    replicate_image_to_tagged_destinations, write_build_metadata, BuildMetadata, GitCheckout, PublishedChanges,
};

const PERMISSIVE_RM_TRIGGER: &str = "Error deleting packages from database";

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerizedCreateEmptyIndexRequest {
    pub request_id: u64,
    pub from_index: String,
    pub binary_image: String,
    /// Extra labels for the new index; they override the ones IIB sets
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub index_to_gitlab_push_map: BTreeMap<String, String>,
}

/// Strip every package from the `index.db` of `from_index`
///
/// Used when no pre-built empty database is published for the repository.
async fn create_empty_index_db_from_source(
    state: &WorkerState,
    request_id: u64,
    opm: &OpmContext,
    from_index: &str,
    temp_dir: &Path,
) -> Result<PathBuf> {
    state
        .tracker()
        .set_request_state(
            request_id,
            RequestState::InProgress,
            "Creating empty index database from from_index",
        )
        .await?;
    info!("Fetching index.db from {}", from_index);
    let index_db = oras::pull_index_db_artifact(state, from_index, temp_dir).await?;

    let operators: Vec<String> = get_bundles_from_db(state, opm, &index_db)
        .await?
        .into_iter()
        .map(|bundle| bundle.package_name)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if operators.is_empty() {
        info!("Index.db is already empty, no operators to remove");
        return Ok(index_db);
    }

    info!("Removing all operators from index.db: {}", operators.join(", "));
    match opm_registry_rm(state, opm, &index_db, &operators, temp_dir).await {
        Err(e) if e.to_string().contains(PERMISSIVE_RM_TRIGGER) => {
            info!("Enable permissive mode for opm registry rm");
            opm_registry_rm_permissive(state, opm, &index_db, &operators, temp_dir).await?;
        }
        result => result?,
    }
    info!("Successfully created empty index.db by removing all operators");
    Ok(index_db)
}

/// The published empty `index.db`, else one emptied from `from_index`
async fn fetch_empty_index_db(
    state: &WorkerState,
    request_id: u64,
    opm: &OpmContext,
    from_index: &str,
    temp_dir: &Path,
) -> Result<PathBuf> {
    state
        .tracker()
        .set_request_state(request_id, RequestState::InProgress, "Fetching empty index database")
        .await?;
    let artifact_ref = oras::get_empty_indexdb_artifact_pullspec(&state.settings, from_index)?;
    info!("Fetching empty index.db from {}", artifact_ref);

    let fetched = oras::get_oras_artifact(state, &artifact_ref, temp_dir)
        .await
        .and_then(|dir| {
            let index_db = dir.join(oras::INDEX_DB_FILE);
            if index_db.is_file() {
                Ok(index_db)
            } else {
                Err(IibError::iib(format!(
                    "Empty index.db file not found at {} after fetching from {}",
                    index_db.display(),
                    artifact_ref
                )))
            }
        });
    match fetched {
        Ok(index_db) => {
            info!("Successfully fetched empty index.db from {}", artifact_ref);
            Ok(index_db)
        }
        Err(e) => {
            warn!(
                "Failed to fetch empty index.db with tag '{}': {}. Falling back to creating empty index.db from {}",
                state.settings.iib_empty_index_db_tag, e, from_index
            );
            create_empty_index_db_from_source(state, request_id, opm, from_index, temp_dir).await
        }
    }
}

/// Replace the checkout's catalog with an empty one and validate it
async fn empty_catalog(
    state: &WorkerState,
    request_id: u64,
    opm: &OpmContext,
    checkout: &GitCheckout,
    temp_dir: &Path,
) -> Result<()> {
    let tracker = state.tracker();
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Creating empty FBC catalog directory")
        .await?;
    if checkout.catalog_dir.is_dir() {
        info!("Removing all contents from catalog directory to create empty catalog");
        fs::remove_dir_all(&checkout.catalog_dir)?;
    }
    fs::create_dir_all(&checkout.catalog_dir)?;
    // Git does not track empty directories
    fs::write(checkout.catalog_dir.join(".gitkeep"), "")?;

    let catalog_copy = temp_dir.join("catalog");
    if catalog_copy.exists() {
        fs::remove_dir_all(&catalog_copy)?;
    }
    copy_dir_all(&checkout.catalog_dir, &catalog_copy)?;
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Validating empty catalog")
        .await?;
    opm_validate(state, opm, &catalog_copy).await
}

async fn publish(
    state: &WorkerState,
    request: &ContainerizedCreateEmptyIndexRequest,
    prebuild_info: &PrebuildInfo,
    checkout: &GitCheckout,
    index_db: &Path,
    changes: &mut PublishedChanges,
) -> Result<()> {
    let request_id = request.request_id;
    let commit_message = format!(
        "IIB: Create empty index for request {}\n\nCreating empty index image from {}",
        request_id, request.from_index
    );
    // The source index is never overwritten with an empty one
    commit_and_create_mr_or_push(state, request_id, checkout, &commit_message, false, changes).await?;
    let commit_sha = changes
        .last_commit_sha
        .clone()
        .ok_or_else(|| IibError::iib("Error getting the last commit SHA"))?;

    let image_url = monitor_pipeline_and_extract_image(state, request_id, &commit_sha).await?;
    let output_pull_specs = replicate_image_to_tagged_destinations(state, request_id, &image_url, &[]).await?;
    update_index_image_pull_spec(
        state,
        request_id,
        &PullSpecUpdate {
            output_pull_spec: &output_pull_specs[0],
            arches: &prebuild_info.arches,
            from_index: Some(&request.from_index),
            overwrite_from_index: false,
            overwrite_from_index_token: None,
        },
    )
    .await?;

    changes.original_index_db_digest = oras::push_index_db_artifact(
        state,
        request_id,
        &request.from_index,
        index_db,
        "create_empty_index",
        &[],
        false,
    )
    .await?;

    close_merge_request_if_exists(state, changes.merge_request.as_ref()).await;
    Ok(())
}

/// Create an index with no operators through the Git catalog of `from_index`
pub async fn handle_containerized_create_empty_index_request(
    state: &WorkerState,
    request: &ContainerizedCreateEmptyIndexRequest,
) -> Result<()> {
    let request_id = request.request_id;
    reset_docker_config(&state.settings)?;
    let tracker = state.tracker();
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Preparing request for build")
        .await?;
    let prebuild_info = prepare_request_for_build(
        state,
        request_id,
        &PrebuildRequest {
            binary_image: &request.binary_image,
            from_index: Some(&request.from_index),
            ..Default::default()
        },
    )
    .await?;
    update_index_image_build_state(state, request_id, &prebuild_info).await?;
    let opm = OpmContext::for_index(state, prebuild_info.from_index_resolved.as_deref()).await?;

    let temp_dir = tempfile::Builder::new()
        .prefix(&format!("iib-{}-", request_id))
        .tempdir()?;
    let checkout = prepare_git_repository(
        state,
        request_id,
        &request.from_index,
        temp_dir.path(),
        &prebuild_info.ocp_version,
        &request.index_to_gitlab_push_map,
    )
    .await?;
    let index_db = fetch_empty_index_db(state, request_id, &opm, &request.from_index, temp_dir.path()).await?;
    empty_catalog(state, request_id, &opm, &checkout, temp_dir.path()).await?;

    tracker
        .set_request_state(request_id, RequestState::InProgress, "Writing build metadata")
        .await?;
    let opm_version = opm.version_number(state).await?;
    write_build_metadata(
        &checkout.path,
        &BuildMetadata::new(
            request_id,
            &opm_version,
            &prebuild_info.ocp_version,
            prebuild_info.distribution_scope.as_deref(),
            &prebuild_info.binary_image_resolved,
            &prebuild_info.arches,
        )
        .with_labels(&request.labels),
    )?;

    let mut changes = PublishedChanges::default();
    if let Err(e) = publish(state, request, &prebuild_info, &checkout, &index_db, &mut changes).await {
        cleanup_on_failure(
            state,
            request_id,
            Some(&checkout),
            &changes,
            false,
            &request.from_index,
            &format!("error: {}", e),
        )
        .await;
        return Err(IibError::iib(format!("Failed to create empty index: {}", e)));
    }

    tracker
        .set_request_state(
            request_id,
            RequestState::Complete,
            "The empty index image was successfully created",
        )
        .await?;
    reset_docker_config(&state.settings)?;
    Ok(())
}
