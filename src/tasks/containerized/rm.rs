use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::api::RequestState;
use crate::error::{IibError, Result};
use crate::opm::index::get_bundles_from_db;
use crate::opm::operations::{copy_dir_all, opm_migrate, opm_registry_rm, opm_validate};
use crate::opm::OpmContext;
use crate::registry::auth::reset_docker_config;
use crate::state::WorkerState;
use crate::tasks::build::{update_index_image_pull_spec, PullSpecUpdate};
use crate::tasks::prebuild::{
    prepare_request_for_build, update_index_image_build_state, validate_overwrite_params, PrebuildInfo,
    PrebuildRequest,
};

use super::{
    cleanup_on_failure, close_merge_request_if_exists, commit_and_create_mr_or_push, merge_catalogs_dirs,
    monitor_pipeline_and_extract_image, oras, prepare_git_repository,
    remove_operator_deprecations, replicate_image_to_tagged_destinations, write_build_metadata, BuildMetadata,
    GitCheckout, PublishedChanges,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerizedRmRequest {
    pub request_id: u64,
    pub operators: Vec<String>,
    pub from_index: String,
    pub binary_image: String,
    #[serde(default)]
    pub add_arches: Vec<String>,
    #[serde(default)]
    pub overwrite_from_index: bool,
    #[serde(default)]
    pub overwrite_from_index_token: Option<String>,
    #[serde(default)]
    pub distribution_scope: Option<String>,
    #[serde(default)]
    pub build_tags: Vec<String>,
    #[serde(default)]
    pub index_to_gitlab_push_map: BTreeMap<String, String>,
}

/// What the catalog update left behind for publishing
struct RemovalOutcome {
    index_db: PathBuf,
    operators_in_db: BTreeSet<String>,
}

fn remove_packages_from_catalog(catalog_dir: &Path, operators: &[String]) -> Result<()> {
    for operator in operators {
        let package_dir = catalog_dir.join(operator);
        if package_dir.is_dir() {
            info!("Removing package {} from the catalog", operator);
            fs::remove_dir_all(package_dir)?;
        } else {
            warn!("Package {} is not in the catalog", operator);
        }
    }
    remove_operator_deprecations(catalog_dir, operators)
}

async fn update_catalog(
    state: &WorkerState,
    request: &ContainerizedRmRequest,
    opm: &OpmContext,
    checkout: &GitCheckout,
    temp_dir: &Path,
) -> Result<RemovalOutcome> {
    let request_id = request.request_id;
    let tracker = state.tracker();
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Removing operators from catalog")
        .await?;
    remove_packages_from_catalog(&checkout.catalog_dir, &request.operators)?;

    let index_db = oras::pull_index_db_artifact(state, &request.from_index, temp_dir).await?;
    tracker
        .set_request_state(
            request_id,
            RequestState::InProgress,
            "Checking and removing from index database",
        )
        .await?;
    let operators_in_db: BTreeSet<String> = get_bundles_from_db(state, opm, &index_db)
        .await?
        .into_iter()
        .map(|bundle| bundle.package_name)
        .filter(|package| request.operators.contains(package))
        .collect();

    if !operators_in_db.is_empty() {
        let operators: Vec<String> = operators_in_db.iter().cloned().collect();
        info!("Removing {} from {}", operators.join(", "), index_db.display());
        opm_registry_rm(state, opm, &index_db, &operators, temp_dir).await?;

        let migration_dir = temp_dir.join("from_db");
        fs::create_dir_all(&migration_dir)?;
        let (from_db_catalog, _) = opm_migrate(state, opm, &index_db, &migration_dir, false).await?;
        merge_catalogs_dirs(&from_db_catalog, &checkout.catalog_dir)?;
    }

    let catalog_copy = temp_dir.join("catalog");
    copy_dir_all(&checkout.catalog_dir, &catalog_copy)?;
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Validating catalog")
        .await?;
    opm_validate(state, opm, &catalog_copy).await?;

    Ok(RemovalOutcome {
        index_db,
        operators_in_db,
    })
}

async fn publish(
    state: &WorkerState,
    request: &ContainerizedRmRequest,
    prebuild_info: &PrebuildInfo,
    checkout: &GitCheckout,
    outcome: &RemovalOutcome,
    changes: &mut PublishedChanges,
) -> Result<()> {
    let request_id = request.request_id;
    let commit_message = format!(
        "IIB: Remove operators {} for request {}",
        request.operators.join(", "),
        request_id
    );
    commit_and_create_mr_or_push(
        state,
        request_id,
        checkout,
        &commit_message,
        request.overwrite_from_index,
        changes,
    )
    .await?;
    let commit_sha = changes
        .last_commit_sha
        .clone()
        .ok_or_else(|| IibError::iib("Error getting the last commit SHA"))?;

    let image_url = monitor_pipeline_and_extract_image(state, request_id, &commit_sha).await?;
    let output_pull_specs =
        replicate_image_to_tagged_destinations(state, request_id, &image_url, &request.build_tags).await?;
    update_index_image_pull_spec(
        state,
        request_id,
        &PullSpecUpdate {
            output_pull_spec: &output_pull_specs[0],
            arches: &prebuild_info.arches,
            from_index: Some(&request.from_index),
            overwrite_from_index: request.overwrite_from_index,
            overwrite_from_index_token: request.overwrite_from_index_token.as_deref(),
        },
    )
    .await?;

    if !outcome.operators_in_db.is_empty() {
        state
            .tracker()
            .set_request_state(request_id, RequestState::InProgress, "Pushing updated index database")
            .await?;
        let operators: Vec<String> = outcome.operators_in_db.iter().cloned().collect();
        changes.original_index_db_digest = oras::push_index_db_artifact(
            state,
            request_id,
            &request.from_index,
            &outcome.index_db,
            "remove_operators",
            &operators,
            request.overwrite_from_index,
        )
        .await?;
    }

    close_merge_request_if_exists(state, changes.merge_request.as_ref()).await;
    Ok(())
}

/// Remove operator packages through the Git catalog of `from_index`
pub async fn handle_containerized_rm_request(
    state: &WorkerState,
    request: &ContainerizedRmRequest,
) -> Result<()> {
    let request_id = request.request_id;
    let token = request.overwrite_from_index_token.as_deref();
    validate_overwrite_params(request.overwrite_from_index, token)?;
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
            overwrite_from_index_token: token,
            add_arches: &request.add_arches,
            distribution_scope: request.distribution_scope.as_deref(),
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
    let outcome = update_catalog(state, request, &opm, &checkout, temp_dir.path()).await?;

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
        ),
    )?;

    let mut changes = PublishedChanges::default();
    if let Err(e) = publish(state, request, &prebuild_info, &checkout, &outcome, &mut changes).await {
        cleanup_on_failure(
            state,
            request_id,
            Some(&checkout),
            &changes,
            request.overwrite_from_index,
            &request.from_index,
            &format!("error: {}", e),
        )
        .await;
        return Err(IibError::iib(format!("Failed to remove operators: {}", e)));
    }

    tracker
        .set_request_state(
            request_id,
            RequestState::Complete,
            &format!(
                "The operator(s) {} were successfully removed from the index image",
                request.operators.join(", ")
            ),
        )
        .await?;
    Ok(())
}
