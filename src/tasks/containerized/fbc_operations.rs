use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::api::RequestState;
use crate::error::{IibError, Result};
use crate::opm::index::{extract_fbc_fragment, get_bundles_from_db};
use crate::opm::operations::{copy_dir_all, opm_migrate, opm_registry_rm, opm_validate};
use crate::opm::OpmContext;
use crate::registry::auth::{reset_docker_config, RegistryTokenGuard};
use crate::registry::skopeo::get_resolved_image;
use crate::state::WorkerState;
use crate::tasks::build::{update_index_image_pull_spec, PullSpecUpdate};
use crate::tasks::prebuild::{
    prepare_request_for_build, update_index_image_build_state, validate_overwrite_params, FbcPrebuildInfo,
    PrebuildRequest,
};

use super::{
    cleanup_on_failure, close_merge_request_if_exists, commit_and_create_mr_or_push, merge_catalogs_dirs,
    monitor_pipeline_and_extract_image, oras, prepare_git_repository,
    replicate_image_to_tagged_destinations, write_build_metadata, BuildMetadata, GitCheckout, PublishedChanges,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerizedFbcOperationRequest {
    pub request_id: u64,
    pub fbc_fragments: Vec<String>,
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

/// Fold the fragments into the checkout and the `index.db` artifact
///
/// Returns the updated database and the packages the fragments carry.
async fn add_fragments(
    state: &WorkerState,
    request: &ContainerizedFbcOperationRequest,
    opm: &OpmContext,
    checkout: &GitCheckout,
    fragments: &[String],
    temp_dir: &Path,
) -> Result<(PathBuf, BTreeSet<String>)> {
    let request_id = request.request_id;
    let index_db = oras::pull_index_db_artifact(state, &request.from_index, temp_dir).await?;

    state
        .tracker()
        .set_request_state(request_id, RequestState::InProgress, "Adding fbc fragment")
        .await?;
    let packages_in_db: BTreeSet<String> = {
        let _guard = RegistryTokenGuard::set(
            &state.settings,
            request.overwrite_from_index_token.as_deref(),
            Some(&request.from_index),
        )?;
        get_bundles_from_db(state, opm, &index_db)
            .await?
            .into_iter()
            .map(|bundle| bundle.package_name)
            .collect()
    };

    let mut fragment_operators = BTreeSet::new();
    for (i, fragment) in fragments.iter().enumerate() {
        let fragment_dir = temp_dir.join("fragments").join(i.to_string());
        fs::create_dir_all(&fragment_dir)?;
        let (fragment_path, operators) = extract_fbc_fragment(state, fragment, &fragment_dir).await?;

        let in_db: Vec<String> = operators
            .iter()
            .filter(|operator| packages_in_db.contains(*operator))
            .cloned()
            .collect();
        if !in_db.is_empty() {
            info!("Removing {:?} from {} index.db", in_db, request.from_index);
            opm_registry_rm(state, opm, &index_db, &in_db, temp_dir).await?;

            let migration_dir = temp_dir.join("from_db");
            if migration_dir.exists() {
                fs::remove_dir_all(&migration_dir)?;
            }
            fs::create_dir_all(&migration_dir)?;
            let (from_db_catalog, _) = opm_migrate(state, opm, &index_db, &migration_dir, false).await?;
            merge_catalogs_dirs(&from_db_catalog, &checkout.catalog_dir)?;
        }

        for operator in &operators {
            let destination = checkout.catalog_dir.join(operator);
            if destination.exists() {
                fs::remove_dir_all(&destination)?;
            }
            info!("Copying {} from {} into the catalog", operator, fragment);
            copy_dir_all(&fragment_path.join(operator), &destination)?;
        }
        fragment_operators.extend(operators);
    }

    opm_validate(state, opm, &checkout.catalog_dir).await?;
    Ok((index_db, fragment_operators))
}

#[allow(clippy::too_many_arguments)]
async fn publish(
    state: &WorkerState,
    request: &ContainerizedFbcOperationRequest,
    prebuild_info: &FbcPrebuildInfo,
    checkout: &GitCheckout,
    index_db: &Path,
    operators: &BTreeSet<String>,
    changes: &mut PublishedChanges,
) -> Result<()> {
    let request_id = request.request_id;
    let commit_message = format!(
        "IIB: Add data from FBC fragments for request {}\n\nFBC fragments: {}",
        request_id,
        request.fbc_fragments.join(", ")
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
            arches: &prebuild_info.base.arches,
            from_index: Some(&request.from_index),
            overwrite_from_index: request.overwrite_from_index,
            overwrite_from_index_token: request.overwrite_from_index_token.as_deref(),
        },
    )
    .await?;

    state
        .tracker()
        .set_request_state(request_id, RequestState::InProgress, "Pushing updated index database")
        .await?;
    let operators: Vec<String> = operators.iter().cloned().collect();
    changes.original_index_db_digest = oras::push_index_db_artifact(
        state,
        request_id,
        &request.from_index,
        index_db,
        "fbc_operations",
        &operators,
        request.overwrite_from_index,
    )
    .await?;

    close_merge_request_if_exists(state, changes.merge_request.as_ref()).await;
    Ok(())
}

/// Add the packages of one or more FBC fragments through the Git catalog of `from_index`
pub async fn handle_containerized_fbc_operation_request(
    state: &WorkerState,
    request: &ContainerizedFbcOperationRequest,
) -> Result<()> {
    let request_id = request.request_id;
    let token = request.overwrite_from_index_token.as_deref();
    validate_overwrite_params(request.overwrite_from_index, token)?;
    reset_docker_config(&state.settings)?;
    if request.fbc_fragments.is_empty() {
        return Err(IibError::validation("At least one fbc_fragment is required"));
    }

    let tracker = state.tracker();
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Resolving the fbc fragments")
        .await?;
    let mut fragments = Vec::with_capacity(request.fbc_fragments.len());
    for fragment in &request.fbc_fragments {
        let _guard = RegistryTokenGuard::set(&state.settings, token, Some(fragment))?;
        fragments.push(get_resolved_image(state, fragment).await?);
    }

    let base = prepare_request_for_build(
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
    let prebuild_info = FbcPrebuildInfo {
        base,
        fbc_fragment_resolved: fragments[0].clone(),
        fbc_fragments_resolved: fragments.clone(),
    };
    update_index_image_build_state(state, request_id, &prebuild_info).await?;
    let base = &prebuild_info.base;
    let opm = OpmContext::for_index(state, base.from_index_resolved.as_deref()).await?;

    let temp_dir = tempfile::Builder::new()
        .prefix(&format!("iib-{}-", request_id))
        .tempdir()?;
    let checkout = prepare_git_repository(
        state,
        request_id,
        &request.from_index,
        temp_dir.path(),
        &base.ocp_version,
        &request.index_to_gitlab_push_map,
    )
    .await?;
    let (index_db, operators) =
        add_fragments(state, request, &opm, &checkout, &fragments, temp_dir.path()).await?;

    tracker
        .set_request_state(request_id, RequestState::InProgress, "Writing build metadata")
        .await?;
    let opm_version = opm.version_number(state).await?;
    write_build_metadata(
        &checkout.path,
        &BuildMetadata::new(
            request_id,
            &opm_version,
            &base.ocp_version,
            base.distribution_scope.as_deref(),
            &base.binary_image_resolved,
            &base.arches,
        ),
    )?;

    let mut changes = PublishedChanges::default();
    if let Err(e) = publish(
        state,
        request,
        &prebuild_info,
        &checkout,
        &index_db,
        &operators,
        &mut changes,
    )
    .await
    {
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
        return Err(IibError::iib(format!("Failed to add FBC fragment: {}", e)));
    }

    tracker
        .set_request_state(
            request_id,
            RequestState::Complete,
            "The FBC fragment(s) were successfully added in the index image",
        )
        .await?;
    Ok(())
}
