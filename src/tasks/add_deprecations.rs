use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tracing::{error, info};

use crate::api::RequestState;
use crate::error::{IibError, Result};
use crate::opm::index::{get_catalog_dir, verify_operators_exists};
use crate::opm::operations::{generate_cache_locally, opm_generate_dockerfile, opm_validate, INDEX_DOCKERFILE};
use crate::opm::{OpmContext, INDEX_VERSION_LABEL};
use crate::registry::podman::cleanup;
use crate::state::WorkerState;
use crate::tasks::build::{
    add_label_to_index, build_and_push_arches, create_manifest_list, update_index_image_pull_spec,
    PullSpecUpdate,
};
use crate::tasks::prebuild::{
    prepare_request_for_build, update_index_image_build_state, validate_overwrite_params, PrebuildRequest,
    DISTRIBUTION_SCOPE_LABEL,
};

#[derive(Debug, Clone, Deserialize)]
pub struct AddDeprecationsRequest {
    pub request_id: u64,
    pub operator_package: String,
    /// An `olm.deprecations` blob, as JSON text
    pub deprecation_schema: String,
    pub from_index: String,
    pub binary_image: String,
    #[serde(default)]
    pub overwrite_from_index: bool,
    #[serde(default)]
    pub overwrite_from_index_token: Option<String>,
    #[serde(default)]
    pub build_tags: Vec<String>,
}

/// Write the deprecation schema of `operator_package` into the catalog of `from_index`
/// and generate the index Dockerfile around it
#[allow(clippy::too_many_arguments)]
async fn add_deprecations_to_index(
    state: &WorkerState,
    opm: &OpmContext,
    request_id: u64,
    temp_dir: &Path,
    from_index_resolved: &str,
    operator_package: &str,
    deprecation_schema: &Value,
    binary_image_resolved: &str,
    index_db: &Path,
) -> Result<()> {
    let tracker = state.tracker();
    tracker
        .set_request_state(
            request_id,
            RequestState::InProgress,
            "Getting all deprecations present in index image",
        )
        .await?;
    let configs_dir = get_catalog_dir(state, from_index_resolved, temp_dir).await?;
    let operator_dir = configs_dir
        .join(&state.settings.operator_deprecations_dir)
        .join(operator_package);
    fs::create_dir_all(&operator_dir)?;

    tracker
        .set_request_state(request_id, RequestState::InProgress, "Adding deprecations to from_index")
        .await?;
    let deprecations_file = operator_dir.join(format!("{}.json", operator_package));
    fs::write(&deprecations_file, serde_json::to_string(deprecation_schema)?)?;
    info!("Wrote the deprecation schema to {}", deprecations_file.display());

    opm_validate(state, opm, &configs_dir).await?;
    generate_cache_locally(state, opm, temp_dir, &configs_dir, &temp_dir.join("cache")).await?;

    info!("Dockerfile generated from {}", configs_dir.display());
    opm_generate_dockerfile(
        state,
        opm,
        &configs_dir,
        temp_dir,
        index_db,
        binary_image_resolved,
        Some(INDEX_DOCKERFILE),
    )
    .await?;
    Ok(())
}

/// Add a deprecation schema for one package to the catalog of `from_index`
pub async fn handle_add_deprecations_request(
    state: &WorkerState,
    request: &AddDeprecationsRequest,
) -> Result<()> {
    let request_id = request.request_id;
    let token = request.overwrite_from_index_token.as_deref();
    validate_overwrite_params(request.overwrite_from_index, token)?;
    let deprecation_schema: Value = serde_json::from_str(&request.deprecation_schema)
        .map_err(|e| IibError::validation(format!("The deprecation_schema is not valid JSON: {}", e)))?;

    cleanup(state).await?;
    let tracker = state.tracker();
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Resolving the index images")
        .await?;
    let prebuild_info = prepare_request_for_build(
        state,
        request_id,
        &PrebuildRequest {
            binary_image: &request.binary_image,
            from_index: Some(&request.from_index),
            overwrite_from_index_token: token,
            ..Default::default()
        },
    )
    .await?;
    update_index_image_build_state(state, request_id, &prebuild_info).await?;
    let from_index_resolved = prebuild_info
        .from_index_resolved
        .clone()
        .unwrap_or_else(|| request.from_index.clone());
    let opm = OpmContext::for_index(state, Some(&from_index_resolved)).await?;

    {
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("iib-{}-", request_id))
            .tempdir()?;
        let (operators_in_db, index_db) = verify_operators_exists(
            state,
            &opm,
            &from_index_resolved,
            temp_dir.path(),
            std::slice::from_ref(&request.operator_package),
            token,
        )
        .await?;
        if operators_in_db.is_empty() {
            let msg = format!(
                "Cannot add deprecations for {}, It is either not present in index or opted in fbc",
                request.operator_package
            );
            error!("{}", msg);
            return Err(IibError::iib(msg));
        }

        add_deprecations_to_index(
            state,
            &opm,
            request_id,
            temp_dir.path(),
            &from_index_resolved,
            &request.operator_package,
            &deprecation_schema,
            &prebuild_info.binary_image_resolved,
            &index_db,
        )
        .await?;

        add_label_to_index(
            INDEX_VERSION_LABEL,
            &prebuild_info.ocp_version,
            temp_dir.path(),
            INDEX_DOCKERFILE,
        )?;
        if let Some(scope) = &prebuild_info.distribution_scope {
            add_label_to_index(DISTRIBUTION_SCOPE_LABEL, scope, temp_dir.path(), INDEX_DOCKERFILE)?;
        }
        build_and_push_arches(
            state,
            temp_dir.path(),
            INDEX_DOCKERFILE,
            request_id,
            &prebuild_info.arches,
        )
        .await?;
    }

    let output_pull_spec =
        create_manifest_list(state, request_id, &prebuild_info.arches, &request.build_tags).await?;
    update_index_image_pull_spec(
        state,
        request_id,
        &PullSpecUpdate {
            output_pull_spec: &output_pull_spec,
            arches: &prebuild_info.arches,
            from_index: Some(&request.from_index),
            overwrite_from_index: request.overwrite_from_index,
            overwrite_from_index_token: token,
        },
    )
    .await?;
    cleanup(state).await?;
    tracker
        .set_request_state(
            request_id,
            RequestState::Complete,
            "The deprecation schema was successfully added to the index image",
        )
        .await?;
    Ok(())
}
