use serde::Deserialize;
use tracing::info;

use crate::api::RequestState;
use crate::error::Result;
use crate::greenwave::GreenwaveConfig;
use crate::opm::index::{get_missing_bundles, get_present_bundles};
use crate::opm::operations::{opm_index_add, opm_registry_add_fbc, AddBundles, INDEX_DOCKERFILE};
use crate::opm::{OpmContext, INDEX_VERSION_LABEL};
use crate::registry::auth::RegistryTokenGuard;
use crate::registry::podman::cleanup;
use crate::registry::skopeo::{get_resolved_bundles, is_image_fbc};
use crate::state::WorkerState;
use crate::tasks::build::{
    add_label_to_index, build_and_push_arches, create_manifest_list, update_index_image_pull_spec,
    verify_index_image, verify_labels, PullSpecUpdate,
};
use crate::tasks::prebuild::{
    prepare_request_for_build, update_index_image_build_state, validate_overwrite_params,
    PrebuildRequest, DISTRIBUTION_SCOPE_LABEL,
};

#[derive(Debug, Clone, Deserialize)]
pub struct AddRequest {
    pub request_id: u64,
    pub bundles: Vec<String>,
    pub binary_image: String,
    #[serde(default)]
    pub from_index: Option<String>,
    #[serde(default)]
    pub add_arches: Vec<String>,
    #[serde(default)]
    pub overwrite_from_index: bool,
    #[serde(default)]
    pub overwrite_from_index_token: Option<String>,
    #[serde(default)]
    pub distribution_scope: Option<String>,
    #[serde(default)]
    pub greenwave_config: Option<GreenwaveConfig>,
    #[serde(default)]
    pub graph_update_mode: Option<String>,
    #[serde(default)]
    pub build_tags: Vec<String>,
}

/// Build an index image with the requested bundles added to `from_index`
pub async fn handle_add_request(state: &WorkerState, request: &AddRequest) -> Result<()> {
    let request_id = request.request_id;
    let token = request.overwrite_from_index_token.as_deref();
    validate_overwrite_params(request.overwrite_from_index, token)?;

    cleanup(state).await?;
    let tracker = state.tracker();
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Resolving the bundles")
        .await?;
    let mut resolved_bundles = get_resolved_bundles(state, &request.bundles).await?;

    verify_labels(state, &resolved_bundles).await?;
    if let Some(greenwave_config) = &request.greenwave_config {
        state.gating.gate_bundles(state, &resolved_bundles, greenwave_config).await?;
    }

    let prebuild_info = prepare_request_for_build(
        state,
        request_id,
        &PrebuildRequest {
            binary_image: &request.binary_image,
            from_index: request.from_index.as_deref(),
            overwrite_from_index_token: token,
            add_arches: &request.add_arches,
            bundles: &request.bundles,
            distribution_scope: request.distribution_scope.as_deref(),
        },
    )
    .await?;
    update_index_image_build_state(state, request_id, &prebuild_info).await?;
    let from_index_resolved = prebuild_info.from_index_resolved.as_deref();
    let opm = OpmContext::for_index(state, from_index_resolved).await?;

    {
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("iib-{}-", request_id))
            .tempdir()?;

        let mut is_fbc = false;
        if let Some(from_index) = from_index_resolved {
            let msg = "Checking if bundles are already present in index image";
            info!("{}", msg);
            tracker
                .set_request_state(request_id, RequestState::InProgress, msg)
                .await?;

            let present_bundles = {
                let _guard = RegistryTokenGuard::set(&state.settings, token, Some(from_index))?;
                is_fbc = is_image_fbc(state, from_index).await?;
                get_present_bundles(state, &opm, from_index, temp_dir.path()).await?
            };
            let missing = get_missing_bundles(&present_bundles, &resolved_bundles);
            let excluded: Vec<&String> = resolved_bundles
                .iter()
                .filter(|bundle| !missing.contains(bundle))
                .collect();
            if !excluded.is_empty() {
                info!(
                    "Following bundles are already present in the index image: {}",
                    excluded.iter().map(|b| b.as_str()).collect::<Vec<_>>().join(" ")
                );
            }
            resolved_bundles = missing;
        }

        let params = AddBundles {
            bundles: &resolved_bundles,
            binary_image: &prebuild_info.binary_image_resolved,
            from_index: from_index_resolved,
            graph_update_mode: request.graph_update_mode.as_deref(),
            overwrite_csv: false,
            overwrite_from_index_token: token,
            container_tool: None,
        };
        if is_fbc {
            opm_registry_add_fbc(state, &opm, temp_dir.path(), &params).await?;
        } else {
            opm_index_add(state, &opm, temp_dir.path(), &params).await?;
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

    if let (Some(from_index), Some(resolved)) = (request.from_index.as_deref(), from_index_resolved) {
        verify_index_image(state, resolved, from_index, token).await?;
    }

    let output_pull_spec =
        create_manifest_list(state, request_id, &prebuild_info.arches, &request.build_tags).await?;
    update_index_image_pull_spec(
        state,
        request_id,
        &PullSpecUpdate {
            output_pull_spec: &output_pull_spec,
            arches: &prebuild_info.arches,
            from_index: request.from_index.as_deref(),
            overwrite_from_index: request.overwrite_from_index,
            overwrite_from_index_token: token,
        },
    )
    .await?;
    tracker
        .set_request_state(
            request_id,
            RequestState::Complete,
            "The operator bundle(s) were successfully added to the index image",
        )
        .await?;
    Ok(())
}
