use serde::Deserialize;
use tracing::info;

use crate::api::RequestState;
use crate::error::Result;
use crate::opm::operations::{opm_registry_add_fbc_fragment, INDEX_DOCKERFILE};
use crate::opm::{OpmContext, INDEX_VERSION_LABEL};
use crate::registry::auth::RegistryTokenGuard;
use crate::registry::podman::cleanup;
use crate::registry::skopeo::get_resolved_image;
use crate::state::WorkerState;
use crate::tasks::build::{
    add_label_to_index, build_and_push_arches, create_manifest_list, update_index_image_pull_spec,
    PullSpecUpdate,
};
use crate::tasks::prebuild::{
    prepare_request_for_build, update_index_image_build_state, validate_overwrite_params,
    FbcPrebuildInfo, PrebuildRequest, DISTRIBUTION_SCOPE_LABEL,
};

#[derive(Debug, Clone, Deserialize)]
pub struct FbcOperationRequest {
    pub request_id: u64,
    pub fbc_fragment: String,
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

/// Add the packages of an FBC fragment to the catalog of `from_index`
pub async fn handle_fbc_operation_request(
    state: &WorkerState,
    request: &FbcOperationRequest,
) -> Result<()> {
    let request_id = request.request_id;
    let token = request.overwrite_from_index_token.as_deref();
    validate_overwrite_params(request.overwrite_from_index, token)?;

    cleanup(state).await?;
    let tracker = state.tracker();
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Resolving the fbc fragment")
        .await?;
    let fbc_fragment_resolved = {
        let _guard = RegistryTokenGuard::set(&state.settings, token, Some(&request.from_index))?;
        get_resolved_image(state, &request.fbc_fragment).await?
    };

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
        fbc_fragment_resolved,
        ..Default::default()
    };
    update_index_image_build_state(state, request_id, &prebuild_info).await?;
    let base = &prebuild_info.base;
    let from_index_resolved = base
        .from_index_resolved
        .clone()
        .unwrap_or_else(|| request.from_index.clone());
    let opm = OpmContext::for_index(state, Some(&from_index_resolved)).await?;

    {
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("iib-{}-", request_id))
            .tempdir()?;

        opm_registry_add_fbc_fragment(
            state,
            &opm,
            request_id,
            temp_dir.path(),
            &from_index_resolved,
            &base.binary_image_resolved,
            &prebuild_info.fbc_fragment_resolved,
            token,
        )
        .await?;

        add_label_to_index(INDEX_VERSION_LABEL, &base.ocp_version, temp_dir.path(), INDEX_DOCKERFILE)?;
        if let Some(scope) = &base.distribution_scope {
            add_label_to_index(DISTRIBUTION_SCOPE_LABEL, scope, temp_dir.path(), INDEX_DOCKERFILE)?;
        }
        build_and_push_arches(state, temp_dir.path(), INDEX_DOCKERFILE, request_id, &base.arches).await?;
    }

    let output_pull_spec = create_manifest_list(state, request_id, &base.arches, &request.build_tags).await?;
    update_index_image_pull_spec(
        state,
        request_id,
        &PullSpecUpdate {
            output_pull_spec: &output_pull_spec,
            arches: &base.arches,
            from_index: Some(&request.from_index),
            overwrite_from_index: request.overwrite_from_index,
            overwrite_from_index_token: token,
        },
    )
    .await?;
    cleanup(state).await?;
    info!(
        "Added {} to {}",
        prebuild_info.fbc_fragment_resolved, request.from_index
    );
    tracker
        .set_request_state(
            request_id,
            RequestState::Complete,
            "The FBC fragment was successfully added in the index image",
        )
        .await?;
    Ok(())
}
