// Build, verification and finalization steps shared by the index request types

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

use crate::api::{RequestState, RequestUpdate};
use crate::error::{IibError, Result};
use crate::registry::auth::RegistryTokenGuard;
use crate::registry::podman::{build_image, create_and_push_manifest_list, push_image};
use crate::registry::skopeo::{get_image_labels, get_resolved_image, skopeo_copy};
use crate::registry::{registry_of, with_transport};
use crate::state::WorkerState;

/// Append `LABEL key="value"` to the Dockerfile in `dir`
pub fn add_label_to_index(label: &str, value: &str, dir: &Path, dockerfile_name: &str) -> Result<()> {
    let mut dockerfile = OpenOptions::new()
        .append(true)
        .open(dir.join(dockerfile_name))?;
    let line = format!("LABEL {}=\"{}\"", label, value);
    writeln!(dockerfile, "\n{}", line)?;
    debug!("Added the following line to {}: {}", dockerfile_name, line);
    Ok(())
}

/// Build and push one image per arch, in sorted order
pub async fn build_and_push_arches(
    state: &WorkerState,
    dir: &Path,
    dockerfile_name: &str,
    request_id: u64,
    arches: &BTreeSet<String>,
) -> Result<()> {
    for arch in arches {
        build_image(state, dir, dockerfile_name, request_id, arch).await?;
        push_image(state, request_id, arch).await?;
    }
    Ok(())
}

/// Copy the manifest list of a request to the pull spec of each extra tag
pub async fn push_build_tags(state: &WorkerState, output_pull_spec: &str, build_tags: &[String]) -> Result<()> {
    for tag in build_tags {
        let destination = state.settings.rebuilt_image_pull_spec(tag);
        info!("Tagging {} as {}", output_pull_spec, destination);
        skopeo_copy(
            state,
            &with_transport(output_pull_spec),
            &with_transport(&destination),
            true,
            Some(&format!("Failed to push the manifest list to {}", destination)),
        )
        .await?;
    }
    Ok(())
}

/// Create the manifest list of the per-arch images and tag it with `build_tags`
pub async fn create_manifest_list(
    state: &WorkerState,
    request_id: u64,
    arches: &BTreeSet<String>,
    build_tags: &[String],
) -> Result<String> {
    state
        .tracker()
        .set_request_state(request_id, RequestState::InProgress, "Creating the manifest list")
        .await?;
    let output_pull_spec = create_and_push_manifest_list(state, request_id, arches).await?;
    push_build_tags(state, &output_pull_spec, build_tags).await?;
    Ok(output_pull_spec)
}

/// Replace `from_index` with the index image built for the request
///
/// When the token is for the same registry IIB pushes to, IIB's own credentials are
/// replaced while the token is installed. The manifest list is then exported to an
/// OCI layout first and copied from there.
pub async fn overwrite_from_index(
    state: &WorkerState,
    request_id: u64,
    output_pull_spec: &str,
    from_index: &str,
    overwrite_from_index_token: Option<&str>,
) -> Result<()> {
    let reason = format!(
        "Overwriting the index image {} with {}",
        from_index, output_pull_spec
    );
    info!("{}", reason);
    state
        .tracker()
        .set_request_state(request_id, RequestState::InProgress, &reason)
        .await?;

    let mut source = with_transport(output_pull_spec);
    let mut _oci_dir = None;
    if overwrite_from_index_token.is_some() && registry_of(output_pull_spec) == registry_of(from_index) {
        let temp_dir = tempfile::Builder::new().prefix("iib-").tempdir()?;
        let oci_source = format!("oci:{}", temp_dir.path().display());
        info!(
            "The registry used by IIB ({}) is also the registry where from_index ({}) will be \
             overwritten using the user supplied token. The manifest digests will change but the \
             content is the same.",
            registry_of(output_pull_spec),
            registry_of(from_index)
        );
        skopeo_copy(
            state,
            &source,
            &oci_source,
            true,
            Some(&format!("Failed to export {} to the OCI format", output_pull_spec)),
        )
        .await?;
        source = oci_source;
        _oci_dir = Some(temp_dir);
    }

    let _guard = RegistryTokenGuard::set(&state.settings, overwrite_from_index_token, Some(from_index))?;
    skopeo_copy(
        state,
        &source,
        &with_transport(from_index),
        true,
        Some(&format!(
            "Failed to overwrite the input from_index container image of {}",
            from_index
        )),
    )
    .await
}

/// Where the built index ends up and how it is reported
#[derive(Debug, Clone, Copy)]
pub struct PullSpecUpdate<'a> {
    pub output_pull_spec: &'a str,
    pub arches: &'a BTreeSet<String>,
    pub from_index: Option<&'a str>,
    pub overwrite_from_index: bool,
    pub overwrite_from_index_token: Option<&'a str>,
}

/// The pull spec users see: `from_index` when overwritten, else the output registry
pub fn public_pull_spec(state: &WorkerState, output_pull_spec: &str) -> String {
    match &state.settings.iib_index_image_output_registry {
        Some(output_registry) => {
            let public = output_pull_spec.replacen(&state.settings.iib_registry, output_registry, 1);
            info!(
                "Changed the index_image pull specification from {} to {}",
                output_pull_spec, public
            );
            public
        }
        None => output_pull_spec.to_string(),
    }
}

/// Overwrite `from_index` if asked to and record the final index image on the request
pub async fn update_index_image_pull_spec(
    state: &WorkerState,
    request_id: u64,
    update: &PullSpecUpdate<'_>,
) -> Result<()> {
    let index_image = match update.from_index.filter(|_| update.overwrite_from_index) {
        Some(from_index) => {
            overwrite_from_index(
                state,
                request_id,
                update.output_pull_spec,
                from_index,
                update.overwrite_from_index_token,
            )
            .await?;
            from_index.to_string()
        }
        None => public_pull_spec(state, update.output_pull_spec),
    };

    let payload = RequestUpdate {
        arches: Some(update.arches.iter().cloned().collect()),
        index_image: Some(index_image),
        internal_index_image_copy: Some(update.output_pull_spec.to_string()),
        ..Default::default()
    };
    state
        .tracker()
        .update_request(
            request_id,
            &payload,
            Some("Failed setting the index image on the request"),
        )
        .await?;
    Ok(())
}

/// Fail when `from_index` was pushed to by someone else while the request was building
pub async fn verify_index_image(
    state: &WorkerState,
    resolved_prebuild_from_index: &str,
    from_index: &str,
    overwrite_from_index_token: Option<&str>,
) -> Result<()> {
    let resolved_post_build = {
        let _guard = RegistryTokenGuard::set(&state.settings, overwrite_from_index_token, Some(from_index))?;
        get_resolved_image(state, from_index).await?
    };
    if resolved_post_build != resolved_prebuild_from_index {
        return Err(IibError::iib(
            "The supplied from_index image changed during the IIB request. Please resubmit the request.",
        ));
    }
    Ok(())
}

/// Every bundle must carry the configured `iib_required_labels`
pub async fn verify_labels(state: &WorkerState, bundles: &[String]) -> Result<()> {
    let required = &state.settings.iib_required_labels;
    if required.is_empty() {
        return Ok(());
    }
    for bundle in bundles {
        let labels = get_image_labels(state, bundle).await?;
        for (label, value) in required {
            if labels.get(label) != Some(value) {
                return Err(IibError::iib(format!(
                    "The bundle {} does not have the label {}={}",
                    bundle, label, value
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::WorkerSettings;
    use crate::testing::{FakeRunner, TestHarness};
    use serde_json::json;
    use tempfile::TempDir;

    fn arches(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|a| a.to_string()).collect()
    }

    #[test]
    fn test_add_label_to_index() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.Dockerfile"), "FROM scratch").unwrap();

        add_label_to_index("com.redhat.index.delivery.version", "v4.12", dir.path(), "index.Dockerfile").unwrap();
        let content = std::fs::read_to_string(dir.path().join("index.Dockerfile")).unwrap();
        assert_eq!(
            content,
            "FROM scratch\nLABEL com.redhat.index.delivery.version=\"v4.12\"\n"
        );

        let err = add_label_to_index("a", "b", dir.path(), "missing.Dockerfile").unwrap_err();
        assert!(matches!(err, IibError::Io(_)));
    }

    #[tokio::test]
    async fn test_build_and_push_in_sorted_order() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.runner.on("--raw", |_| Ok(FakeRunner::ok(r#"{"schemaVersion": 2}"#)));

        build_and_push_arches(&harness.state, dir.path(), "index.Dockerfile", 3, &arches(&["s390x", "amd64"]))
            .await
            .unwrap();
        let steps: Vec<String> = harness
            .runner
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("buildah") || c.starts_with("podman push"))
            .collect();
        assert_eq!(steps.len(), 4);
        assert!(steps[0].contains("--override-arch amd64"));
        assert!(steps[1].contains("iib-build:3-amd64 docker://registry.test/iib-build:3-amd64"));
        assert!(steps[2].contains("--override-arch s390x"));
    }

    #[tokio::test]
    async fn test_pull_spec_uses_output_registry() {
        let dir = TempDir::new().unwrap();
        let mut settings = WorkerSettings::for_tests(dir.path());
        settings.iib_index_image_output_registry = Some("registry-proxy.test".to_string());
        let harness = TestHarness::with_settings(settings);
        harness.tracker.create(4);

        update_index_image_pull_spec(
            &harness.state,
            4,
            &PullSpecUpdate {
                output_pull_spec: "registry.test/iib-build:4",
                arches: &arches(&["amd64"]),
                from_index: Some("quay.io/ns/index:v4.12"),
                overwrite_from_index: false,
                overwrite_from_index_token: None,
            },
        )
        .await
        .unwrap();
        assert_eq!(
            harness.tracker.field(4, "index_image"),
            Some(json!("registry-proxy.test/iib-build:4"))
        );
        assert_eq!(harness.tracker.field(4, "arches"), Some(json!(["amd64"])));
        assert!(harness.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_overwrite_on_same_registry_exports_to_oci_first() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.tracker.create(5);

        update_index_image_pull_spec(
            &harness.state,
            5,
            &PullSpecUpdate {
                output_pull_spec: "registry.test/iib-build:5",
                arches: &arches(&["amd64"]),
                from_index: Some("registry.test/ns/index:v4.12"),
                overwrite_from_index: true,
                overwrite_from_index_token: Some("user:pass"),
            },
        )
        .await
        .unwrap();

        let copies: Vec<String> = harness
            .runner
            .calls()
            .into_iter()
            .filter(|c| c.contains(" copy "))
            .collect();
        assert_eq!(copies.len(), 2);
        assert!(copies[0].contains("--all docker://registry.test/iib-build:5 oci:"));
        assert!(copies[1].ends_with("docker://registry.test/ns/index:v4.12"));
        assert_eq!(
            harness.tracker.field(5, "index_image"),
            Some(json!("registry.test/ns/index:v4.12"))
        );
        assert!(harness
            .tracker
            .reasons(5)
            .contains(&"Overwriting the index image registry.test/ns/index:v4.12 with registry.test/iib-build:5".to_string()));
        // The token is only installed for the copy
        assert!(!harness.state.settings.iib_docker_config.exists());
    }

    #[tokio::test]
    async fn test_verify_index_image_detects_change() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.fake_image("quay.io/ns/index:v4.12", "amd64", json!({}));
        let resolved = get_resolved_image(&harness.state, "quay.io/ns/index:v4.12").await.unwrap();

        verify_index_image(&harness.state, &resolved, "quay.io/ns/index:v4.12", None)
            .await
            .unwrap();
        let err = verify_index_image(&harness.state, "quay.io/ns/index@sha256:old", "quay.io/ns/index:v4.12", None)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The supplied from_index image changed during the IIB request. Please resubmit the request."
        );
    }

    #[tokio::test]
    async fn test_verify_labels() {
        let dir = TempDir::new().unwrap();
        let mut settings = WorkerSettings::for_tests(dir.path());
        settings
            .iib_required_labels
            .insert("com.redhat.delivery.operator.bundle".to_string(), "true".to_string());
        let harness = TestHarness::with_settings(settings);
        harness.fake_image(
            "quay.io/ns/good@sha256:1",
            "amd64",
            json!({"com.redhat.delivery.operator.bundle": "true"}),
        );
        harness.fake_image("quay.io/ns/bad@sha256:2", "amd64", json!({}));

        verify_labels(&harness.state, &["quay.io/ns/good@sha256:1".to_string()])
            .await
            .unwrap();
        let err = verify_labels(
            &harness.state,
            &["quay.io/ns/good@sha256:1".to_string(), "quay.io/ns/bad@sha256:2".to_string()],
        )
        .await
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "The bundle quay.io/ns/bad@sha256:2 does not have the label com.redhat.delivery.operator.bundle=true"
        );
    }
}
