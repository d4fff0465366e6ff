// Resolving the images of a request before anything is built

use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::api::{RequestState, RequestUpdate};
use crate::error::{IibError, Result};
use crate::opm::INDEX_VERSION_LABEL;
use crate::registry::auth::RegistryTokenGuard;
use crate::registry::skopeo::{get_image_arches, get_image_label, get_image_labels, get_resolved_image};
use crate::state::WorkerState;

pub const DISTRIBUTION_SCOPE_LABEL: &str = "com.redhat.index.delivery.distribution_scope";
pub const BUNDLE_PACKAGE_LABEL: &str = "operators.operatorframework.io.bundle.package.v1";
/// OCP version assumed for indexes without the delivery version label
pub const DEFAULT_OCP_VERSION: &str = "v4.5";

/// Reject inconsistent overwrite parameters
///
/// Overwriting `from_index` always needs the caller's own credentials, and a token is
/// only meaningful when overwriting.
pub fn validate_overwrite_params(
    overwrite_from_index: bool,
    overwrite_from_index_token: Option<&str>,
) -> Result<()> {
    let has_token = overwrite_from_index_token.is_some_and(|t| !t.is_empty());
    match (overwrite_from_index, has_token) {
        (true, false) => Err(IibError::validation(
            "The \"overwrite_from_index\" parameter requires the \"overwrite_from_index_token\" parameter to be set",
        )),
        (false, true) => Err(IibError::validation(
            "The \"overwrite_from_index_token\" parameter can't be set without \"overwrite_from_index\"",
        )),
        _ => Ok(()),
    }
}

/// Images and architectures a request builds from
#[derive(Debug, Clone, Default)]
pub struct PrebuildRequest<'a> {
    pub binary_image: &'a str,
    pub from_index: Option<&'a str>,
    pub overwrite_from_index_token: Option<&'a str>,
    pub add_arches: &'a [String],
    pub bundles: &'a [String],
    pub distribution_scope: Option<&'a str>,
}

/// What every request type knows once its images are resolved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrebuildInfo {
    pub arches: BTreeSet<String>,
    pub binary_image: String,
    pub binary_image_resolved: String,
    pub bundle_mapping: BTreeMap<String, Vec<String>>,
    pub from_index_resolved: Option<String>,
    pub ocp_version: String,
    pub distribution_scope: Option<String>,
}

/// Merge requests resolve a source and an optional target index
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergePrebuildInfo {
    pub base: PrebuildInfo,
    pub source_from_index_resolved: String,
    pub target_index_resolved: Option<String>,
    pub target_ocp_version: String,
}

/// FBC operations also pin the fragments they add
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FbcPrebuildInfo {
    pub base: PrebuildInfo,
    pub fbc_fragment_resolved: String,
    /// Every pinned fragment; empty for single-fragment requests
    pub fbc_fragments_resolved: Vec<String>,
}

/// The payload written once a request's images are resolved
pub trait BuildState {
    fn build_state_update(&self) -> RequestUpdate;
}

impl BuildState for PrebuildInfo {
    fn build_state_update(&self) -> RequestUpdate {
        RequestUpdate {
            binary_image_resolved: Some(self.binary_image_resolved.clone()),
            bundle_mapping: (!self.bundle_mapping.is_empty()).then(|| self.bundle_mapping.clone()),
            from_index_resolved: self.from_index_resolved.clone(),
            distribution_scope: self.distribution_scope.clone(),
            ..RequestUpdate::state(
                RequestState::InProgress,
                format!(
                    "Building the index image for the following arches: {}",
                    arches_str(&self.arches)
                ),
            )
        }
    }
}

impl BuildState for MergePrebuildInfo {
    fn build_state_update(&self) -> RequestUpdate {
        RequestUpdate {
            source_from_index_resolved: Some(self.source_from_index_resolved.clone()),
            target_index_resolved: self.target_index_resolved.clone(),
            from_index_resolved: None,
            ..self.base.build_state_update()
        }
    }
}

impl BuildState for FbcPrebuildInfo {
    fn build_state_update(&self) -> RequestUpdate {
        RequestUpdate {
            fbc_fragment_resolved: Some(self.fbc_fragment_resolved.clone()),
            fbc_fragments_resolved: (!self.fbc_fragments_resolved.is_empty())
                .then(|| self.fbc_fragments_resolved.clone()),
            ..self.base.build_state_update()
        }
    }
}

pub fn arches_str(arches: &BTreeSet<String>) -> String {
    arches.iter().cloned().collect::<Vec<_>>().join(", ")
}

struct ResolvedIndex {
    resolved: String,
    arches: BTreeSet<String>,
    ocp_version: String,
    distribution_scope: Option<String>,
}

async fn resolve_index(state: &WorkerState, index: &str, token: Option<&str>) -> Result<ResolvedIndex> {
    let _guard = RegistryTokenGuard::set(&state.settings, token, Some(index))?;
    let resolved = get_resolved_image(state, index).await?;
    let arches = get_image_arches(state, &resolved).await?;
    let mut labels = get_image_labels(state, &resolved).await?;
    Ok(ResolvedIndex {
        resolved,
        arches,
        ocp_version: labels
            .remove(INDEX_VERSION_LABEL)
            .unwrap_or_else(|| DEFAULT_OCP_VERSION.to_string()),
        distribution_scope: labels.remove(DISTRIBUTION_SCOPE_LABEL),
    })
}

/// Resolve the images of a request and work out the arches to build
///
/// The arches are the requested ones plus those `from_index` is already built for;
/// the binary image has to support all of them. The distribution scope comes from
/// the request, else from the `from_index` label.
pub async fn prepare_request_for_build(
    state: &WorkerState,
    request_id: u64,
    request: &PrebuildRequest<'_>,
) -> Result<PrebuildInfo> {
    state
        .tracker()
        .set_request_state(request_id, RequestState::InProgress, "Resolving the container images")
        .await?;

    let mut arches: BTreeSet<String> = request.add_arches.iter().cloned().collect();

    let binary_image_resolved = get_resolved_image(state, request.binary_image).await?;
    let binary_image_arches = get_image_arches(state, &binary_image_resolved).await?;

    let mut info = PrebuildInfo {
        binary_image: request.binary_image.to_string(),
        ocp_version: DEFAULT_OCP_VERSION.to_string(),
        distribution_scope: request.distribution_scope.map(str::to_lowercase),
        ..Default::default()
    };

    if let Some(from_index) = request.from_index {
        let index = resolve_index(state, from_index, request.overwrite_from_index_token).await?;
        arches.extend(index.arches);
        info.from_index_resolved = Some(index.resolved);
        info.ocp_version = index.ocp_version;
        if info.distribution_scope.is_none() {
            info.distribution_scope = index.distribution_scope;
        }
    }

    check_arches(&arches, &binary_image_arches)?;
    debug!(
        "Set to build the index image for the following arches: {}",
        arches_str(&arches)
    );

    for bundle in request.bundles {
        if let Some(operator) = get_image_label(state, bundle, BUNDLE_PACKAGE_LABEL).await? {
            info.bundle_mapping.entry(operator).or_default().push(bundle.clone());
        }
    }

    info.arches = arches;
    info.binary_image_resolved = binary_image_resolved;
    Ok(info)
}

fn check_arches(arches: &BTreeSet<String>, binary_image_arches: &BTreeSet<String>) -> Result<()> {
    if arches.is_empty() {
        return Err(IibError::iib("No arches were provided to build the index image"));
    }
    let missing: BTreeSet<String> = arches.difference(binary_image_arches).cloned().collect();
    if !missing.is_empty() {
        return Err(IibError::iib(format!(
            "The binary image is not available for the following arches: {}",
            arches_str(&missing)
        )));
    }
    Ok(())
}

/// Merge requests build for the union of the source and target index arches
pub async fn prepare_merge_request_for_build(
    state: &WorkerState,
    request_id: u64,
    binary_image: &str,
    source_from_index: &str,
    target_index: Option<&str>,
    overwrite_target_index_token: Option<&str>,
    distribution_scope: Option<&str>,
) -> Result<MergePrebuildInfo> {
    let base = prepare_request_for_build(
        state,
        request_id,
        &PrebuildRequest {
            binary_image,
            from_index: Some(source_from_index),
            overwrite_from_index_token: overwrite_target_index_token,
            distribution_scope,
            ..Default::default()
        },
    )
    .await?;

    let mut info = MergePrebuildInfo {
        source_from_index_resolved: base.from_index_resolved.clone().unwrap_or_default(),
        target_ocp_version: base.ocp_version.clone(),
        base,
        ..Default::default()
    };

    if let Some(target_index) = target_index {
        let target = resolve_index(state, target_index, overwrite_target_index_token).await?;
        let binary_image_arches = get_image_arches(state, &info.base.binary_image_resolved).await?;
        info.base.arches.extend(target.arches);
        check_arches(&info.base.arches, &binary_image_arches)?;
        info.target_index_resolved = Some(target.resolved);
        info.target_ocp_version = target.ocp_version;
    }
    info!(
        "Merging for the following arches: {}",
        arches_str(&info.base.arches)
    );
    Ok(info)
}

/// PATCH the resolved images and move the request to the build phase
pub async fn update_index_image_build_state(
    state: &WorkerState,
    request_id: u64,
    prebuild_info: &impl BuildState,
) -> Result<()> {
    state
        .tracker()
        .update_request(
            request_id,
            &prebuild_info.build_state_update(),
            Some("Failed setting the resolved images on the request"),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRunner, TestHarness};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_validate_overwrite_params() {
        assert!(validate_overwrite_params(false, None).is_ok());
        assert!(validate_overwrite_params(true, Some("user:pass")).is_ok());

        let err = validate_overwrite_params(true, None).unwrap_err();
        assert!(matches!(err, IibError::Validation(_)));
        let err = validate_overwrite_params(false, Some("user:pass")).unwrap_err();
        assert!(matches!(err, IibError::Validation(_)));
        assert!(validate_overwrite_params(false, Some("")).is_ok());
    }

    #[test]
    fn test_check_arches() {
        let binary: BTreeSet<String> = ["amd64", "s390x"].iter().map(|s| s.to_string()).collect();
        let err = check_arches(&BTreeSet::new(), &binary).unwrap_err();
        assert_eq!(err.to_string(), "No arches were provided to build the index image");

        let wanted: BTreeSet<String> = ["ppc64le", "amd64", "arm64"].iter().map(|s| s.to_string()).collect();
        let err = check_arches(&wanted, &binary).unwrap_err();
        assert_eq!(
            err.to_string(),
            "The binary image is not available for the following arches: arm64, ppc64le"
        );
    }

    #[tokio::test]
    async fn test_prepare_without_from_index() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.tracker.create(1);
        harness.fake_image("quay.io/ns/opm:v4.12", "amd64", json!({}));
        harness.fake_image(
            "quay.io/ns/bundle:1",
            "amd64",
            json!({"operators.operatorframework.io.bundle.package.v1": "etcd"}),
        );

        let bundles = vec!["quay.io/ns/bundle:1".to_string()];
        let add_arches = vec!["amd64".to_string()];
        let info = prepare_request_for_build(
            &harness.state,
            1,
            &PrebuildRequest {
                binary_image: "quay.io/ns/opm:v4.12",
                add_arches: &add_arches,
                bundles: &bundles,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(info.arches.iter().collect::<Vec<_>>(), vec!["amd64"]);
        assert!(info.binary_image_resolved.starts_with("quay.io/ns/opm@sha256:"));
        assert_eq!(info.ocp_version, "v4.5");
        assert_eq!(info.from_index_resolved, None);
        assert_eq!(info.bundle_mapping["etcd"], bundles);
        assert_eq!(harness.tracker.reasons(1), vec!["Resolving the container images"]);
    }

    #[tokio::test]
    async fn test_prepare_unions_from_index_arches() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.tracker.create(2);
        harness.fake_image("quay.io/ns/opm:v4.12", "amd64", json!({}));
        let list = r#"{"schemaVersion": 2, "mediaType": "application/vnd.docker.distribution.manifest.list.v2+json",
            "manifests": [{"digest": "sha256:1", "platform": {"architecture": "amd64"}},
                          {"digest": "sha256:2", "platform": {"architecture": "s390x"}}]}"#;
        harness
            .runner
            .on("docker://quay.io/ns/index:v4.12 --raw", move |_| Ok(FakeRunner::ok(list)));
        harness.runner.on("docker://quay.io/ns/index@sha256", move |_| Ok(FakeRunner::ok(list)));

        let err = prepare_request_for_build(
            &harness.state,
            2,
            &PrebuildRequest {
                binary_image: "quay.io/ns/opm:v4.12",
                from_index: Some("quay.io/ns/index:v4.12"),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The binary image is not available for the following arches: s390x"
        );
    }

    #[test]
    fn test_build_state_update_payload() {
        let info = FbcPrebuildInfo {
            base: PrebuildInfo {
                arches: ["s390x", "amd64"].iter().map(|s| s.to_string()).collect(),
                binary_image_resolved: "quay.io/ns/opm@sha256:abc".to_string(),
                from_index_resolved: Some("quay.io/ns/index@sha256:def".to_string()),
                ..Default::default()
            },
            fbc_fragment_resolved: "quay.io/ns/fragment@sha256:123".to_string(),
            ..Default::default()
        };
        let payload = serde_json::to_value(info.build_state_update()).unwrap();
        assert_eq!(
            payload,
            json!({
                "state": "in_progress",
                "state_reason": "Building the index image for the following arches: amd64, s390x",
                "binary_image_resolved": "quay.io/ns/opm@sha256:abc",
                "from_index_resolved": "quay.io/ns/index@sha256:def",
                "fbc_fragment_resolved": "quay.io/ns/fragment@sha256:123",
            })
        );
    }
}
