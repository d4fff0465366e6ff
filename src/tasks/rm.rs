use serde::Deserialize;
use tracing::info;

use crate::api::RequestState;
use crate::error::Result;
use crate::opm::operations::{opm_index_rm, opm_registry_rm_fbc, INDEX_DOCKERFILE};
use crate::opm::{OpmContext, INDEX_VERSION_LABEL};
use crate::registry::auth::RegistryTokenGuard;
use crate::registry::podman::cleanup;
use crate::registry::skopeo::is_image_fbc;
use crate::state::WorkerState;
use crate::tasks::build::{
    add_label_to_index, build_and_push_arches, create_manifest_list, update_index_image_pull_spec,
    verify_index_image, PullSpecUpdate,
};
use crate::tasks::prebuild::{
    prepare_request_for_build, update_index_image_build_state, validate_overwrite_params,
    PrebuildRequest, DISTRIBUTION_SCOPE_LABEL,
};

#[derive(Debug, Clone, Deserialize)]
pub struct RmRequest {
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
}

/// Build an index image without the requested operator packages
pub async fn handle_rm_request(state: &WorkerState, request: &RmRequest) -> Result<()> {
    let request_id = request.request_id;
    let token = request.overwrite_from_index_token.as_deref();
    validate_overwrite_params(request.overwrite_from_index, token)?;

    cleanup(state).await?;
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
    let from_index_resolved = prebuild_info
        .from_index_resolved
        .clone()
        .unwrap_or_else(|| request.from_index.clone());
    let opm = OpmContext::for_index(state, Some(&from_index_resolved)).await?;

    {
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("iib-{}-", request_id))
            .tempdir()?;

        let is_fbc = {
            let _guard = RegistryTokenGuard::set(&state.settings, token, Some(&from_index_resolved))?;
            is_image_fbc(state, &from_index_resolved).await?
        };
        if is_fbc {
            // The generated Dockerfile copies the locally built cache
            opm_registry_rm_fbc(
                state,
                &opm,
                temp_dir.path(),
                &from_index_resolved,
                &request.operators,
                &prebuild_info.binary_image_resolved,
                token,
                true,
            )
            .await?;
        } else {
            opm_index_rm(
                state,
                &opm,
                temp_dir.path(),
                &request.operators,
                &prebuild_info.binary_image_resolved,
                &from_index_resolved,
                token,
                None,
            )
            .await?;
        }

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

    verify_index_image(state, &from_index_resolved, &request.from_index, token).await?;

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
    info!("Removed {} from {}", request.operators.join(", "), request.from_index);
    state
        .tracker()
        .set_request_state(
            request_id,
            RequestState::Complete,
            "The operator(s) were successfully removed from the index image",
        )
        .await?;
    Ok(())
}
