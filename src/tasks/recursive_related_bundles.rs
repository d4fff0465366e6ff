use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::fs;
use std::path::Path;
use tracing::{debug, error, info};

use crate::api::{RequestState, RequestUpdate};
use crate::error::{IibError, Result};
use crate::registry::podman::{cleanup, copy_files_from_image, podman_pull};
use crate::registry::skopeo::{get_image_label, get_resolved_image};
use crate::state::WorkerState;

/// Set to `true` on images that are operator bundles themselves
pub const OPERATOR_BUNDLE_LABEL: &str = "com.redhat.delivery.operator.bundle";

#[derive(Debug, Clone, Deserialize)]
pub struct RecursiveRelatedBundlesRequest {
    pub request_id: u64,
    pub parent_bundle_image: String,
    #[serde(default)]
    pub organization: Option<String>,
}

fn push_unique(pullspecs: &mut Vec<String>, value: Option<&YamlValue>) {
    if let Some(image) = value.and_then(YamlValue::as_str) {
        if !pullspecs.iter().any(|known| known == image) {
            pullspecs.push(image.to_string());
        }
    }
}

fn sequence<'a>(value: Option<&'a YamlValue>) -> impl Iterator<Item = &'a YamlValue> {
    value.and_then(YamlValue::as_sequence).into_iter().flatten()
}

/// Every image a CSV references: related images, deployment containers and the
/// `containerImage` annotation
pub fn csv_pullspecs(csv: &YamlValue) -> Vec<String> {
    let mut pullspecs = Vec::new();
    push_unique(
        &mut pullspecs,
        csv.get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get("containerImage")),
    );
    let spec = csv.get("spec");
    for related in sequence(spec.and_then(|s| s.get("relatedImages"))) {
        push_unique(&mut pullspecs, related.get("image"));
    }
    let deployments = spec
        .and_then(|s| s.get("install"))
        .and_then(|i| i.get("spec"))
        .and_then(|s| s.get("deployments"));
    for deployment in sequence(deployments) {
        let pod = deployment
            .get("spec")
            .and_then(|s| s.get("template"))
            .and_then(|t| t.get("spec"));
        for key in ["initContainers", "containers"] {
            for container in sequence(pod.and_then(|p| p.get(key))) {
                push_unique(&mut pullspecs, container.get("image"));
            }
        }
    }
    pullspecs
}

/// Images referenced by the ClusterServiceVersion files under `manifests_path`
fn manifest_pullspecs(manifests_path: &Path) -> Result<Vec<String>> {
    let mut pullspecs = Vec::new();
    let mut entries: Vec<_> = fs::read_dir(manifests_path)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        if !is_yaml {
            continue;
        }
        let document: YamlValue = serde_yaml::from_str(&fs::read_to_string(&path)?).map_err(|e| {
            let msg = format!("The Operator Manifest is not in a valid YAML format: {}", e);
            error!("{}", msg);
            IibError::iib(msg)
        })?;
        if document.get("kind").and_then(YamlValue::as_str) != Some("ClusterServiceVersion") {
            continue;
        }
        for pullspec in csv_pullspecs(&document) {
            if !pullspecs.contains(&pullspec) {
                pullspecs.push(pullspec);
            }
        }
    }
    Ok(pullspecs)
}

/// The children of a bundle: referenced images labelled as operator bundles
async fn process_parent_bundle_image(
    state: &WorkerState,
    bundle_image_resolved: &str,
    request_id: u64,
    organization: Option<&str>,
) -> Result<Vec<String>> {
    // Pulling first keeps registry timeouts out of the later steps
    podman_pull(state, bundle_image_resolved).await?;

    let temp_dir = tempfile::Builder::new()
        .prefix(&format!("iib-{}-", request_id))
        .tempdir()?;
    let manifests_path = temp_dir.path().join("manifests");
    copy_files_from_image(state, bundle_image_resolved, "/manifests", &manifests_path).await?;
    let metadata_path = temp_dir.path().join("metadata");
    copy_files_from_image(state, bundle_image_resolved, "/metadata", &metadata_path).await?;
    if organization.is_some() {
        state
            .bundle_rewriter
            .adjust_bundle(&manifests_path, &metadata_path, organization, false)
            .await?;
    }

    let mut children = Vec::new();
    for pullspec in manifest_pullspecs(&manifests_path)? {
        let is_bundle = get_image_label(state, &pullspec, OPERATOR_BUNDLE_LABEL)
            .await?
            .is_some_and(|value| value.trim() == "true");
        if is_bundle {
            children.push(pullspec);
        }
    }
    debug!("Related bundles of {}: {:?}", bundle_image_resolved, children);
    Ok(children)
}

/// Write `{dir}/{request_id}_{suffix}.json`
pub fn write_related_bundles_file(bundles: &[String], request_id: u64, dir: &Path, suffix: &str) -> Result<()> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}_{}.json", request_id, suffix));
    fs::write(&path, serde_json::to_string(bundles)?)?;
    info!("Wrote the related bundles to {}", path.display());
    Ok(())
}

/// Walk the related bundles of `parent_bundle_image` level by level
///
/// The file lists the deepest level first and the parent last.
pub async fn handle_recursive_related_bundles_request(
    state: &WorkerState,
    request: &RecursiveRelatedBundlesRequest,
) -> Result<()> {
    let request_id = request.request_id;
    let output_dir = state
        .settings
        .iib_request_recursive_related_bundles_dir
        .clone()
        .ok_or_else(|| IibError::iib("iib_request_recursive_related_bundles_dir is not configured"))?;
    cleanup(state).await?;
    let tracker = state.tracker();
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Resolving parent_bundle_image")
        .await?;
    let parent_resolved = get_resolved_image(state, &request.parent_bundle_image).await?;
    let payload = RequestUpdate {
        parent_bundle_image_resolved: Some(parent_resolved.clone()),
        ..RequestUpdate::state(
            RequestState::InProgress,
            format!(
                "Finding recursive related bundles for the bundle: {}",
                request.parent_bundle_image
            ),
        )
    };
    tracker.update_request(request_id, &payload, None).await?;

    let max_bundles = state.settings.iib_max_recursive_related_bundles;
    let mut related_bundles = vec![parent_resolved.clone()];
    let mut current_level = vec![parent_resolved];
    let mut total = 0;
    while !current_level.is_empty() {
        let mut next_level = Vec::new();
        for bundle in &current_level {
            let children =
                process_parent_bundle_image(state, bundle, request_id, request.organization.as_deref()).await?;
            total += children.len();
            if total >= max_bundles {
                return Err(IibError::iib("Max number of related bundles exceeded. Potential DOS attack!"));
            }
            next_level.extend(children);
        }
        related_bundles.extend(next_level.iter().cloned());
        current_level = next_level;
    }

    tracker
        .update_request(
            request_id,
            &RequestUpdate::state(RequestState::InProgress, "Writing recursive related bundles to a file"),
            Some("Failed setting the bundle image on the request"),
        )
        .await?;
    related_bundles.reverse();
    write_related_bundles_file(&related_bundles, request_id, &output_dir, "recursive_related_bundles")?;

    cleanup(state).await?;
    tracker
        .update_request(
            request_id,
            &RequestUpdate::state(RequestState::Complete, "The request completed successfully"),
            Some("Failed setting the bundle image on the request"),
        )
        .await?;
    Ok(())
}
