use async_trait::async_trait;
use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::api::{RequestState, RequestUpdate};
use crate::error::{IibError, Result};
use crate::registry::podman::{cleanup, copy_files_from_image, podman_pull};
use crate::registry::skopeo::{get_image_arches, get_image_label, get_resolved_image};
use crate::state::WorkerState;
use crate::tasks::build::{build_and_push_arches, create_manifest_list, public_pull_spec};
use crate::tasks::prebuild::{arches_str, BUNDLE_PACKAGE_LABEL};

pub const PINNED_LABEL: &str = "com.redhat.iib.pinned";
pub(crate) const BUNDLE_DOCKERFILE: &str = "Dockerfile";

#[derive(Debug, Clone, Deserialize)]
pub struct RegenerateBundleRequest {
    pub request_id: u64,
    pub from_bundle_image: String,
    #[serde(default)]
    pub organization: Option<String>,
}

/// Rewrites the manifests and metadata of a bundle copied out of its image
#[async_trait]
pub trait BundleRewriter: Send + Sync {
    /// Adjust the bundle in place and return the labels to set on the new image
    async fn adjust_bundle(
        &self,
        manifests_path: &Path,
        metadata_path: &Path,
        organization: Option<&str>,
        pinned_by_iib: bool,
    ) -> Result<BTreeMap<String, String>>;
}

/// Checks that `metadata/annotations.yaml` names the bundle's package
///
/// Organization customizations such as CSV rewrites are not supported. The
/// bundle content is left as it is and a warning says so.
#[derive(Debug, Default)]
pub struct AnnotationsRewriter;

impl AnnotationsRewriter {
    /// The package name from `metadata/annotations.yaml`
    pub fn package_name(metadata_path: &Path) -> Result<String> {
        let annotations_path = metadata_path.join("annotations.yaml");
        if !annotations_path.exists() {
            return Err(IibError::iib("metadata/annotations.yaml does not exist in the bundle"));
        }
        let document: YamlValue = serde_yaml::from_str(&fs::read_to_string(&annotations_path)?)
            .map_err(|e| {
                debug!("Failed to parse {}: {}", annotations_path.display(), e);
                IibError::iib("metadata/annotations/yaml is not valid YAML")
            })?;

        let annotations = match document.get("annotations") {
            None | Some(YamlValue::Null) => None,
            Some(YamlValue::Mapping(annotations)) => Some(annotations),
            Some(_) => {
                return Err(IibError::iib(
                    "The value of metadata/annotations.yaml must be a dictionary",
                ))
            }
        };
        match annotations.and_then(|a| a.get(BUNDLE_PACKAGE_LABEL)) {
            None | Some(YamlValue::Null) => Err(IibError::iib(format!(
                "{} is not set in metadata/annotations.yaml",
                BUNDLE_PACKAGE_LABEL
            ))),
            Some(YamlValue::String(package)) => Ok(package.clone()),
            Some(_) => Err(IibError::iib(format!(
                "The value of {} in metadata/annotations.yaml is not a string",
                BUNDLE_PACKAGE_LABEL
            ))),
        }
    }
}

#[async_trait]
impl BundleRewriter for AnnotationsRewriter {
    async fn adjust_bundle(
        &self,
        _manifests_path: &Path,
        metadata_path: &Path,
        organization: Option<&str>,
        pinned_by_iib: bool,
    ) -> Result<BTreeMap<String, String>> {
        let package = Self::package_name(metadata_path)?;
        warn!(
            "Organization customizations are not supported; the bundle {} for organization {:?} \
             is rebuilt without changes (pinned by IIB: {})",
            package, organization, pinned_by_iib
        );
        Ok(BTreeMap::new())
    }
}

/// The Dockerfile rebuilding a bundle from its adjusted manifests and metadata
pub(crate) fn bundle_dockerfile(from_bundle_image: &str, labels: &BTreeMap<String, String>) -> String {
    let mut dockerfile = format!(
        "FROM {}\nCOPY ./manifests /manifests\nCOPY ./metadata /metadata\n",
        from_bundle_image
    );
    for (name, value) in labels {
        dockerfile.push_str(&format!("LABEL {}={}\n", name, value));
    }
    dockerfile
}

/// Rebuild a bundle image with its content adjusted for `organization`
pub async fn handle_regenerate_bundle_request(
    state: &WorkerState,
    request: &RegenerateBundleRequest,
) -> Result<()> {
    let request_id = request.request_id;
    cleanup(state).await?;
    let tracker = state.tracker();
    tracker
        .set_request_state(request_id, RequestState::InProgress, "Resolving from_bundle_image")
        .await?;

    let resolved = get_resolved_image(state, &request.from_bundle_image).await?;
    let arches = get_image_arches(state, &resolved).await?;
    if arches.is_empty() {
        return Err(IibError::iib(format!(
            "No arches were found in the resolved from_bundle_image {}",
            resolved
        )));
    }
    let pinned_by_iib = get_image_label(state, &resolved, PINNED_LABEL)
        .await?
        .is_some_and(|value| value.trim() == "true");
    debug!(
        "Set to regenerate the bundle image for the following arches: {}",
        arches_str(&arches)
    );

    let payload = RequestUpdate {
        from_bundle_image_resolved: Some(resolved.clone()),
        ..RequestUpdate::state(
            RequestState::InProgress,
            format!(
                "Regenerating the bundle image for the following arches: {}",
                arches_str(&arches)
            ),
        )
    };
    tracker
        .update_request(
            request_id,
            &payload,
            Some("Failed setting the resolved \"from_bundle_image\" on the request"),
        )
        .await?;

    // Pulling first keeps registry timeouts out of the later steps
    podman_pull(state, &resolved).await?;

    {
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("iib-{}-", request_id))
            .tempdir()?;
        let manifests_path = temp_dir.path().join("manifests");
        copy_files_from_image(state, &resolved, "/manifests", &manifests_path).await?;
        let metadata_path = temp_dir.path().join("metadata");
        copy_files_from_image(state, &resolved, "/metadata", &metadata_path).await?;

        let labels = state
            .bundle_rewriter
            .adjust_bundle(
                &manifests_path,
                &metadata_path,
                request.organization.as_deref(),
                pinned_by_iib,
            )
            .await?;
        fs::write(
            temp_dir.path().join(BUNDLE_DOCKERFILE),
            bundle_dockerfile(&resolved, &labels),
        )?;

        build_and_push_arches(state, temp_dir.path(), BUNDLE_DOCKERFILE, request_id, &arches).await?;
    }

    let output_pull_spec = create_manifest_list(state, request_id, &arches, &[]).await?;
    let bundle_image = public_pull_spec(state, &output_pull_spec);
    info!("Regenerated {} as {}", request.from_bundle_image, bundle_image);

    let payload = RequestUpdate {
        arches: Some(arches.into_iter().collect()),
        bundle_image: Some(bundle_image),
        ..RequestUpdate::state(RequestState::Complete, "The request completed successfully")
    };
    tracker
        .update_request(
            request_id,
            &payload,
            Some("Failed setting the bundle image on the request"),
        )
        .await?;
    Ok(())
}
