use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::api::RequestState;
use crate::error::{IibError, Result};
use crate::opm::index::{get_bundles_from_db, BundleImage};
use crate::opm::operations::{
    copy_dir_all, opm_migrate, opm_registry_add, opm_registry_deprecatetruncate, opm_validate, AddBundles,
};
use crate::opm::OpmContext;
use crate::registry::auth::{reset_docker_config, RegistryTokenGuard};
use crate::registry::skopeo::skopeo_inspect_raw;
use crate::registry::with_transport;
use crate::state::WorkerState;
use crate::tasks::build::{update_index_image_pull_spec, PullSpecUpdate};
use crate::tasks::merge::{
    find_invalid_bundles, find_missing_bundles, get_bundles_from_deprecation_list, get_bundles_latest_version,
};
use crate::tasks::prebuild::{
    prepare_merge_request_for_build, update_index_image_build_state, validate_overwrite_params,
    MergePrebuildInfo,
};

use super::{
    cleanup_on_failure, close_merge_request_if_exists, commit_and_create_mr_or_push, merge_catalogs_dirs,
    monitor_pipeline_and_extract_image, oras, prepare_git_repository,
    replicate_image_to_tagged_destinations, write_build_metadata, BuildMetadata, GitCheckout, PublishedChanges,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerizedMergeRequest {
    pub request_id: u64,
    pub source_from_index: String,
    #[serde(default)]
    pub deprecation_list: Vec<String>,
    pub binary_image: String,
    #[serde(default)]
    pub target_index: Option<String>,
    #[serde(default)]
    pub overwrite_target_index: bool,
    #[serde(default)]
    pub overwrite_target_index_token: Option<String>,
    #[serde(default)]
    pub distribution_scope: Option<String>,
    #[serde(default)]
    pub build_tags: Vec<String>,
    #[serde(default)]
    pub index_to_gitlab_push_map: BTreeMap<String, String>,
}

/// The merged `index.db` and what went into it
struct MergeOutcome {
    index_db: PathBuf,
    missing_bundles: Vec<String>,
    operators_in_db: BTreeSet<String>,
}

/// Fail on the first bundle whose pull spec the registry no longer serves
async fn validate_bundle_pullspecs(state: &WorkerState, bundles: &BTreeSet<&str>) -> Result<()> {
    let results: Vec<Result<String>> = stream::iter(bundles.iter())
        .map(|bundle| async move {
            debug!("Validating that {} is present in the registry", bundle);
            skopeo_inspect_raw(state, &[&with_transport(bundle), "--raw"]).await
        })
        .buffered(state.settings.iib_merge_validation_threads.max(1))
        .collect()
        .await;
    for result in results {
        result?;
    }
    Ok(())
}

/// Fold the target-only bundles into the source `index.db`, apply the deprecations
/// and merge the migrated catalog into the checkout
async fn update_catalog(
    state: &WorkerState,
    request: &ContainerizedMergeRequest,
    prebuild_info: &MergePrebuildInfo,
    opm: &OpmContext,
    checkout: &GitCheckout,
    temp_dir: &Path,
) -> Result<MergeOutcome> {
    let request_id = request.request_id;
    let tracker = state.tracker();
    let token = request.overwrite_target_index_token.as_deref();

    let source_db = oras::pull_index_db_artifact(state, &request.source_from_index, temp_dir).await?;
    let target_db = match &request.target_index {
        Some(target_index) => Some(oras::pull_index_db_artifact(state, target_index, temp_dir).await?),
        None => None,
    };

    let (source_bundles, target_bundles) = {
        let _guard = RegistryTokenGuard::set(&state.settings, token, request.target_index.as_deref())?;
        let source_bundles = get_bundles_from_db(state, opm, &source_db).await?;
        debug!("Source index bundles {:?}", source_bundles);
        let target_bundles = match &target_db {
            Some(target_db) => get_bundles_from_db(state, opm, target_db).await?,
            None => Vec::new(),
        };
        debug!("Target index bundles {:?}", target_bundles);
        (source_bundles, target_bundles)
    };

    tracker
        .set_request_state(
            request_id,
            RequestState::InProgress,
            "Validating whether the bundles have their pullspecs present in the registry",
        )
        .await?;
    let unique_bundles: BTreeSet<&str> = source_bundles
        .iter()
        .chain(target_bundles.iter())
        .map(|bundle| bundle.bundle_path.as_str())
        .collect();
    validate_bundle_pullspecs(state, &unique_bundles).await?;

    tracker
        .set_request_state(
            request_id,
            RequestState::InProgress,
            "Adding bundles missing in source index image",
        )
        .await?;
    info!("Adding bundles from target index image which are missing from source index image");
    let missing = find_missing_bundles(&source_bundles, &target_bundles)?;
    let invalid = find_invalid_bundles(
        state,
        missing.iter().chain(source_bundles.iter()),
        &prebuild_info.target_ocp_version,
    )
    .await?;
    if !invalid.is_empty() {
        info!("{} bundles have invalid version label and will be deprecated.", invalid.len());
    }
    let missing_bundles: Vec<String> = missing.iter().map(|b| b.bundle_path.clone()).collect();

    tracker
        .set_request_state(
            request_id,
            RequestState::InProgress,
            "Adding the missing bundles to the source index.db file",
        )
        .await?;
    if target_db.is_some() && !missing_bundles.is_empty() {
        opm_registry_add(
            state,
            opm,
            temp_dir,
            &source_db,
            &AddBundles {
                bundles: &missing_bundles,
                binary_image: &prebuild_info.base.binary_image_resolved,
                ..Default::default()
            },
        )
        .await?;
    }

    tracker
        .set_request_state(request_id, RequestState::InProgress, "Processing the deprecation list")
        .await?;
    let intermediate_bundles: Vec<String> = missing_bundles
        .iter()
        .cloned()
        .chain(source_bundles.iter().map(|b| b.bundle_path.clone()))
        .collect();
    let mut deprecate =
        get_bundles_from_deprecation_list(state, &intermediate_bundles, &request.deprecation_list).await?;
    deprecate.extend(invalid.iter().map(|b| b.bundle_path.clone()));
    if !deprecate.is_empty() {
        let all_bundles: Vec<BundleImage> = source_bundles.iter().chain(target_bundles.iter()).cloned().collect();
        let latest = get_bundles_latest_version(&deprecate, &all_bundles);
        opm_registry_deprecatetruncate(state, opm, temp_dir, &source_db, &latest).await?;
    }

    let operators_in_db: BTreeSet<String> = get_bundles_from_db(state, opm, &source_db)
        .await?
        .into_iter()
        .map(|bundle| bundle.package_name)
        .collect();

    tracker
        .set_request_state(
            request_id,
            RequestState::InProgress,
            "Migrating the intermediary index.db file to FBC and generating the Dockerfile",
        )
        .await?;
    let migration_dir = temp_dir.join("from_db");
    fs::create_dir_all(&migration_dir)?;
    let (from_db_catalog, _) = opm_migrate(state, opm, &source_db, &migration_dir, false).await?;
    info!("Merging migrated catalog with Git catalog");
    merge_catalogs_dirs(&from_db_catalog, &checkout.catalog_dir)?;

    let catalog_copy = temp_dir.join("catalog");
    if catalog_copy.exists() {
        fs::remove_dir_all(&catalog_copy)?;
    }
    copy_dir_all(&checkout.catalog_dir, &catalog_copy)?;
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Validating the FBC config")
        .await?;
    opm_validate(state, opm, &catalog_copy).await?;

    Ok(MergeOutcome {
        index_db: source_db,
        missing_bundles,
        operators_in_db,
    })
}

async fn publish(
    state: &WorkerState,
    request: &ContainerizedMergeRequest,
    prebuild_info: &MergePrebuildInfo,
    checkout: &GitCheckout,
    outcome: &MergeOutcome,
    changes: &mut PublishedChanges,
) -> Result<()> {
    let request_id = request.request_id;
    let commit_message = format!(
        "IIB: Merge operators for request {}\n\nMissing bundles: {}",
        request_id,
        outcome.missing_bundles.join(", ")
    );
    commit_and_create_mr_or_push(
        state,
        request_id,
        checkout,
        &commit_message,
        request.overwrite_target_index,
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
            arches: &prebuild_info.base.arches,
            from_index: Some(&request.source_from_index),
            overwrite_from_index: request.overwrite_target_index,
            overwrite_from_index_token: request.overwrite_target_index_token.as_deref(),
        },
    )
    .await?;

    state
        .tracker()
        .set_request_state(request_id, RequestState::InProgress, "Pushing updated index database")
        .await?;
    let operators: Vec<String> = outcome.operators_in_db.iter().cloned().collect();
    changes.original_index_db_digest = oras::push_index_db_artifact(
        state,
        request_id,
        &request.source_from_index,
        &outcome.index_db,
        "merge",
        &operators,
        request.overwrite_target_index,
    )
    .await?;

    close_merge_request_if_exists(state, changes.merge_request.as_ref()).await;
    Ok(())
}

/// Merge the bundles only `target_index` has into the Git catalog of `source_from_index`
pub async fn handle_containerized_merge_request(
    state: &WorkerState,
    request: &ContainerizedMergeRequest,
) -> Result<()> {
    let request_id = request.request_id;
    let token = request.overwrite_target_index_token.as_deref();
    validate_overwrite_params(request.overwrite_target_index, token)?;
    reset_docker_config(&state.settings)?;

    let tracker = state.tracker();
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Preparing request for merge")
        .await?;
    let prebuild_info = prepare_merge_request_for_build(
        state,
        request_id,
        &request.binary_image,
        &request.source_from_index,
        request.target_index.as_deref(),
        token,
        request.distribution_scope.as_deref(),
    )
    .await?;
    update_index_image_build_state(state, request_id, &prebuild_info).await?;
    let opm = OpmContext::for_index(
        state,
        prebuild_info
            .target_index_resolved
            .as_deref()
            .or(Some(prebuild_info.source_from_index_resolved.as_str())),
    )
    .await?;

    let temp_dir = tempfile::Builder::new()
        .prefix(&format!("iib-{}-", request_id))
        .tempdir()?;
    let checkout = prepare_git_repository(
        state,
        request_id,
        &request.source_from_index,
        temp_dir.path(),
        &prebuild_info.base.ocp_version,
        &request.index_to_gitlab_push_map,
    )
    .await?;
    let outcome = update_catalog(state, request, &prebuild_info, &opm, &checkout, temp_dir.path()).await?;

    tracker
        .set_request_state(request_id, RequestState::InProgress, "Writing build metadata")
        .await?;
    let opm_version = opm.version_number(state).await?;
    write_build_metadata(
        &checkout.path,
        &BuildMetadata::new(
            request_id,
            &opm_version,
            &prebuild_info.target_ocp_version,
            prebuild_info.base.distribution_scope.as_deref(),
            &prebuild_info.base.binary_image_resolved,
            &prebuild_info.base.arches,
        ),
    )?;

    let mut changes = PublishedChanges::default();
    if let Err(e) = publish(state, request, &prebuild_info, &checkout, &outcome, &mut changes).await {
        cleanup_on_failure(
            state,
            request_id,
            Some(&checkout),
            &changes,
            request.overwrite_target_index,
            &request.source_from_index,
            &format!("error: {}", e),
        )
        .await;
        reset_docker_config(&state.settings)?;
        return Err(IibError::iib(format!("Failed to merge operators: {}", e)));
    }

    let operators: Vec<&str> = outcome.operators_in_db.iter().map(String::as_str).collect();
    tracker
        .set_request_state(
            request_id,
            RequestState::Complete,
            &format!(
                "The operator(s) {} were successfully merged from the target index image into the source index image",
                operators.join(", ")
            ),
        )
        .await?;
    Ok(())
}
