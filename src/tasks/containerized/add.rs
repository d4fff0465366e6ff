use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::api::RequestState;
use crate::error::{IibError, Result};
use crate::opm::index::{get_bundles_from_catalog, get_missing_bundles, BundleImage};
use crate::opm::operations::{
    copy_dir_all, opm_migrate, opm_registry_add, opm_registry_deprecatetruncate, opm_validate, AddBundles,
};
use crate::opm::OpmContext;
use crate::registry::auth::reset_docker_config;
use crate::registry::skopeo::{get_image_label, get_resolved_bundles};
use crate::state::WorkerState;
use crate::tasks::build::{update_index_image_pull_spec, verify_labels, PullSpecUpdate};
use crate::tasks::merge::get_bundles_from_deprecation_list;
use crate::tasks::prebuild::{
    prepare_request_for_build, update_index_image_build_state, validate_overwrite_params, PrebuildInfo,
    PrebuildRequest, BUNDLE_PACKAGE_LABEL,
};

use super::{
    cleanup_on_failure, close_merge_request_if_exists, commit_and_create_mr_or_push, merge_catalogs_dirs,
    monitor_pipeline_and_extract_image, oras, prepare_git_repository,
    replicate_image_to_tagged_destinations, write_build_metadata, BuildMetadata, GitCheckout, PublishedChanges,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ContainerizedAddRequest {
    pub request_id: u64,
    pub bundles: Vec<String>,
    pub binary_image: String,
    pub from_index: String,
    #[serde(default)]
    pub add_arches: Vec<String>,
    #[serde(default)]
    pub overwrite_from_index: bool,
    #[serde(default)]
    pub overwrite_from_index_token: Option<String>,
    #[serde(default)]
    pub distribution_scope: Option<String>,
    #[serde(default)]
    pub graph_update_mode: Option<String>,
    #[serde(default)]
    pub deprecation_list: Vec<String>,
    #[serde(default)]
    pub build_tags: Vec<String>,
    #[serde(default)]
    pub index_to_gitlab_push_map: BTreeMap<String, String>,
}

/// Bundles of the requested packages already in the Git catalog
async fn present_bundles_in_catalog(
    state: &WorkerState,
    opm: &OpmContext,
    checkout: &GitCheckout,
    packages: impl Iterator<Item = &String>,
    temp_dir: &Path,
) -> Result<Vec<BundleImage>> {
    let extracted = temp_dir.join("extracted_packages");
    fs::create_dir_all(&extracted)?;
    let mut copied = 0;
    for package in packages {
        let source = checkout.catalog_dir.join(package);
        if source.is_dir() {
            copy_dir_all(&source, &extracted.join(package))?;
            copied += 1;
        }
    }
    if copied == 0 {
        return Ok(Vec::new());
    }
    get_bundles_from_catalog(state, opm, &extracted).await
}

/// Add bundles to the `index.db` artifact and fold the resulting catalog into the checkout
///
/// Returns the updated database.
async fn update_catalog(
    state: &WorkerState,
    request: &ContainerizedAddRequest,
    prebuild_info: &PrebuildInfo,
    opm: &OpmContext,
    checkout: &GitCheckout,
    resolved_bundles: &[String],
    temp_dir: &Path,
) -> Result<std::path::PathBuf> {
    let request_id = request.request_id;
    let index_db = oras::pull_index_db_artifact(state, &request.from_index, temp_dir).await?;

    let msg = "Checking if bundles are already present in index image";
    info!("{}", msg);
    state
        .tracker()
        .set_request_state(request_id, RequestState::InProgress, msg)
        .await?;
    let present_bundles =
        present_bundles_in_catalog(state, opm, checkout, prebuild_info.bundle_mapping.keys(), temp_dir).await?;
    let missing_bundles = get_missing_bundles(&present_bundles, resolved_bundles);
    if missing_bundles.len() < resolved_bundles.len() {
        info!(
            "{} of the requested bundles are already present in the index image",
            resolved_bundles.len() - missing_bundles.len()
        );
    }

    let overwrite_csv = matches!(prebuild_info.distribution_scope.as_deref(), Some("dev") | Some("stage"));
    opm_registry_add(
        state,
        opm,
        temp_dir,
        &index_db,
        &AddBundles {
            bundles: &missing_bundles,
            binary_image: &prebuild_info.binary_image_resolved,
            from_index: prebuild_info.from_index_resolved.as_deref(),
            graph_update_mode: request.graph_update_mode.as_deref(),
            overwrite_csv,
            overwrite_from_index_token: request.overwrite_from_index_token.as_deref(),
            container_tool: None,
        },
    )
    .await?;

    let mut deprecated_packages = Vec::new();
    if !request.deprecation_list.is_empty() {
        let mut candidates: Vec<String> = present_bundles.iter().map(|b| b.bundle_path.clone()).collect();
        candidates.extend(resolved_bundles.iter().cloned());
        let deprecate = get_bundles_from_deprecation_list(state, &candidates, &request.deprecation_list).await?;
        if !deprecate.is_empty() {
            opm_registry_deprecatetruncate(state, opm, temp_dir, &index_db, &deprecate).await?;
            for bundle in &deprecate {
                if let Some(package) = get_image_label(state, bundle, BUNDLE_PACKAGE_LABEL).await? {
                    deprecated_packages.push(package);
                }
            }
        }
    }

    let migration_dir = temp_dir.join("from_db");
    fs::create_dir_all(&migration_dir)?;
    let (from_db_catalog, _) = opm_migrate(state, opm, &index_db, &migration_dir, false).await?;
    // Truncated packages are re-emitted by the migration when anything is left of them
    for package in &deprecated_packages {
        let stale = checkout.catalog_dir.join(package);
        if stale.is_dir() {
            fs::remove_dir_all(stale)?;
        }
    }
    merge_catalogs_dirs(&from_db_catalog, &checkout.catalog_dir)?;
    opm_validate(state, opm, &checkout.catalog_dir).await?;
    Ok(index_db)
}

async fn publish(
    state: &WorkerState,
    request: &ContainerizedAddRequest,
    prebuild_info: &PrebuildInfo,
    checkout: &GitCheckout,
    index_db: &Path,
    changes: &mut PublishedChanges,
) -> Result<()> {
    let request_id = request.request_id;
    let commit_message = format!(
        "IIB: Add bundles for request {}\n\nBundles: {}",
        request_id,
        request.bundles.join(", ")
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

    state
        .tracker()
        .set_request_state(request_id, RequestState::InProgress, "Pushing updated index database")
        .await?;
    let operators: Vec<String> = prebuild_info.bundle_mapping.keys().cloned().collect();
    changes.original_index_db_digest = oras::push_index_db_artifact(
        state,
        request_id,
        &request.from_index,
        index_db,
        "add",
        &operators,
        request.overwrite_from_index,
    )
    .await?;

    close_merge_request_if_exists(state, changes.merge_request.as_ref()).await;
    Ok(())
}

/// Add bundles through the Git catalog of `from_index`, letting Konflux build the index
pub async fn handle_containerized_add_request(
    state: &WorkerState,
    request: &ContainerizedAddRequest,
) -> Result<()> {
    let request_id = request.request_id;
    let token = request.overwrite_from_index_token.as_deref();
    validate_overwrite_params(request.overwrite_from_index, token)?;
    reset_docker_config(&state.settings)?;

    let tracker = state.tracker();
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Resolving the bundles")
        .await?;
    let resolved_bundles = get_resolved_bundles(state, &request.bundles).await?;
    verify_labels(state, &resolved_bundles).await?;

    let prebuild_info = prepare_request_for_build(
        state,
        request_id,
        &PrebuildRequest {
            binary_image: &request.binary_image,
            from_index: Some(&request.from_index),
            overwrite_from_index_token: token,
            add_arches: &request.add_arches,
            bundles: &request.bundles,
            distribution_scope: request.distribution_scope.as_deref(),
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
    let index_db = update_catalog(
        state,
        request,
        &prebuild_info,
        &opm,
        &checkout,
        &resolved_bundles,
        temp_dir.path(),
    )
    .await?;

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
    if let Err(e) = publish(state, request, &prebuild_info, &checkout, &index_db, &mut changes).await {
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
        return Err(IibError::iib(format!("Failed to add bundles: {}", e)));
    }

    tracker
        .set_request_state(
            request_id,
            RequestState::Complete,
            "The operator bundle(s) were successfully added to the index image",
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opm::operations::test_support::fake_opm_filesystem;
    use crate::tasks::containerized::test_support::{fake_catalog_repo, harness, succeeded_run, KONFLUX_IMAGE, REPO};
    use crate::testing::TestHarness;
    use serde_json::json;
    use tempfile::TempDir;

    fn add_request(request_id: u64) -> ContainerizedAddRequest {
        serde_json::from_value(json!({
            "request_id": request_id,
            "bundles": ["quay.io/ns/etcd-bundle:0.9.4"],
            "binary_image": "quay.io/ns/opm:v4.19",
            "from_index": "quay.io/ns/index:v4.19",
            "add_arches": ["amd64"],
            "index_to_gitlab_push_map": {"quay.io/ns/index": REPO},
        }))
        .unwrap()
    }

    fn fake_images(harness: &TestHarness) {
        harness.fake_image("quay.io/ns/opm:v4.19", "amd64", json!({}));
        harness.fake_image(
            "quay.io/ns/index:v4.19",
            "amd64",
            json!({"com.redhat.index.delivery.version": "v4.19"}),
        );
        harness.fake_image(
            "quay.io/ns/etcd-bundle:0.9.4",
            "amd64",
            json!({"operators.operatorframework.io.bundle.package.v1": "etcd"}),
        );
        fake_opm_filesystem(harness);
        fake_catalog_repo(harness, &["kiali"]);
    }

    #[tokio::test]
    async fn test_add_opens_merge_request_and_replicates_konflux_image() {
        let dir = TempDir::new().unwrap();
        let harness = harness(dir.path(), succeeded_run());
        harness.tracker.create(1);
        fake_images(&harness);

        handle_containerized_add_request(&harness.state, &add_request(1))
            .await
            .unwrap();

        assert_eq!(harness.tracker.state(1), Some(RequestState::Complete));
        assert_eq!(
            harness.tracker.reasons(1),
            vec![
                "Resolving the bundles",
                "Resolving the container images",
                "Building the index image for the following arches: amd64",
                "Cloning Git repository",
                "Checking if bundles are already present in index image",
                "Writing build metadata",
                "Committing changes to Git repository",
                "Waiting on KONFLUX build",
                "Copying built index to IIB registry",
                "Pushing updated index database",
                "The operator bundle(s) were successfully added to the index image",
            ]
        );
        assert_eq!(
            harness.tracker.field(1, "index_image"),
            Some(json!("registry.test/iib-build:1"))
        );

        let calls = harness.runner.calls();
        let opm_add = calls.iter().find(|c| c.contains("registry add")).unwrap();
        assert!(opm_add.contains("--bundle-images quay.io/ns/etcd-bundle@sha256:"));
        assert!(!opm_add.contains("--overwrite-latest"));
        assert_eq!(
            harness
                .runner
                .count(&format!("docker://{} docker://registry.test/iib-build:1", KONFLUX_IMAGE)),
            1
        );
        assert_eq!(harness.runner.count("push origin iib-request-1-v4.19"), 1);
        assert_eq!(harness.runner.count("oras push artifacts.test/index-db:index-v4.19-1"), 1);
        assert_eq!(harness.runner.count("oras push artifacts.test/index-db:index-v4.19 "), 0);

        let opened = harness.merge_requests.opened.lock().unwrap().clone();
        assert_eq!(opened.len(), 1);
        assert_eq!(*harness.merge_requests.closed.lock().unwrap(), vec![opened[0].iid]);
    }

    #[tokio::test]
    async fn test_overwrite_pushes_branch_and_reverts_on_pipeline_failure() {
        let dir = TempDir::new().unwrap();
        let failed = json!({"conditions": [{"reason": "Failed", "status": "False", "message": "build-container failed"}]});
        let harness = harness(dir.path(), failed);
        harness.tracker.create(2);
        fake_images(&harness);
        let mut request = add_request(2);
        request.overwrite_from_index = true;
        request.overwrite_from_index_token = Some("user:pass".to_string());

        let err = handle_containerized_add_request(&harness.state, &request)
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Failed to add bundles: Pipelinerun index-on-push-x1 failed: build-container failed"
        );
        assert_eq!(harness.runner.count("push origin v4.19"), 1);
        assert_eq!(harness.runner.count("reset --hard HEAD~1"), 1);
        assert_eq!(harness.runner.count("push --force origin v4.19"), 1);
        assert_eq!(harness.runner.count("oras push"), 0);
        assert!(harness.merge_requests.opened.lock().unwrap().is_empty());
        assert_eq!(harness.tracker.state(2), Some(RequestState::InProgress));
    }

    #[tokio::test]
    async fn test_overwrite_copies_built_index_onto_from_index() {
        let dir = TempDir::new().unwrap();
        let harness = harness(dir.path(), succeeded_run());
        harness.tracker.create(5);
        fake_images(&harness);
        let mut request = add_request(5);
        request.overwrite_from_index = true;
        request.overwrite_from_index_token = Some("user:pass".to_string());

        handle_containerized_add_request(&harness.state, &request)
            .await
            .unwrap();

        assert_eq!(harness.tracker.state(5), Some(RequestState::Complete));
        assert_eq!(
            harness
                .runner
                .count("docker://registry.test/iib-build:5 docker://quay.io/ns/index:v4.19"),
            1
        );
        let calls = harness.runner.calls();
        let replicated = calls
            .iter()
            .position(|c| c.contains(&format!("docker://{} docker://registry.test/iib-build:5", KONFLUX_IMAGE)))
            .unwrap();
        let overwritten = calls
            .iter()
            .position(|c| c.contains("docker://registry.test/iib-build:5 docker://quay.io/ns/index:v4.19"))
            .unwrap();
        assert!(replicated < overwritten);
        assert!(harness.tracker.reasons(5).contains(
            &"Overwriting the index image quay.io/ns/index:v4.19 with registry.test/iib-build:5".to_string()
        ));
        assert_eq!(harness.tracker.field(5, "index_image"), Some(json!("quay.io/ns/index:v4.19")));
        assert_eq!(
            harness.tracker.field(5, "internal_index_image_copy"),
            Some(json!("registry.test/iib-build:5"))
        );
        assert!(harness.merge_requests.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_requires_repository_mapping() {
        let dir = TempDir::new().unwrap();
        let harness = harness(dir.path(), succeeded_run());
        harness.tracker.create(3);
        fake_images(&harness);
        let mut request = add_request(3);
        request.index_to_gitlab_push_map.clear();

        let err = handle_containerized_add_request(&harness.state, &request)
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Git repository mapping not found for from_index: quay.io/ns/index:v4.19"));
        assert_eq!(harness.runner.count("git"), 0);
    }
}
