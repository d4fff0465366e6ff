use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::command::{run_cmd, CommandSpec};
use crate::error::{IibError, Result};
use crate::registry::auth::reset_docker_config;
use crate::registry::skopeo::{skopeo_copy, skopeo_inspect};
use crate::retry::{on_iib_error, with_retry, RetryPolicy};
use crate::state::WorkerState;

/// Local tag of the single-arch image built for a request
pub fn local_pull_spec(request_id: u64, arch: &str) -> String {
    format!("iib-build:{}-{}", request_id, arch)
}

/// Pull spec of the single-arch image in the build registry
pub fn external_arch_pull_spec(state: &WorkerState, request_id: u64, arch: &str) -> String {
    format!("{}-{}", state.settings.rebuilt_image_pull_spec(request_id), arch)
}

/// `buildah bud` the Dockerfile in `dockerfile_dir` for one architecture
pub async fn build_image(
    state: &WorkerState,
    dockerfile_dir: &Path,
    dockerfile_name: &str,
    request_id: u64,
    arch: &str,
) -> Result<()> {
    let destination = local_pull_spec(request_id, arch);
    info!(
        "Building the container image with the {} dockerfile for arch {} and tagging it as {}",
        dockerfile_name, arch, destination
    );
    let dockerfile_path = dockerfile_dir.join(dockerfile_name);
    let spec = CommandSpec::new("buildah")
        .args(["bud", "--no-cache", "--override-arch", arch, "-t", destination.as_str(), "-f"])
        .arg(dockerfile_path.to_string_lossy())
        .cwd(dockerfile_dir);
    run_cmd(
        state.runner(),
        &spec,
        Some(&format!("Failed to build the container image on the arch {}", arch)),
    )
    .await?;
    Ok(())
}

/// Push the single-arch image and make sure the registry stored a schema 2 manifest
pub async fn push_image(state: &WorkerState, request_id: u64, arch: &str) -> Result<()> {
    let source = local_pull_spec(request_id, arch);
    let destination = format!("docker://{}", external_arch_pull_spec(state, request_id, arch));
    info!("Pushing the container image {} to {}", source, destination);

    let policy = RetryPolicy::from_settings(&state.settings);
    with_retry(&policy, "push_image", on_iib_error, || async {
        let spec = CommandSpec::new("podman").args(["push", "-q", source.as_str(), destination.as_str()]);
        run_cmd(
            state.runner(),
            &spec,
            Some(&format!(
                "Failed to push the container image to {} for the arch {}",
                destination, arch
            )),
        )
        .await?;

        debug!("Verifying that {} was pushed as a v2 manifest", destination);
        let raw = skopeo_inspect(state, &[&destination, "--raw"]).await?;
        if raw.get("schemaVersion").and_then(Value::as_u64) != Some(2) {
            warn!(
                "The manifest for {} ended up using schema version 1. Manually fixing it with skopeo.",
                destination
            );
            let exc_msg = format!("Failed to fix the manifest schema version on {}", destination);
            skopeo_copy(state, &destination, &destination, false, Some(&exc_msg)).await?;
        }
        Ok(())
    })
    .await
}

/// Render the manifest-tool spec for the per-arch images of a request
pub fn manifest_list_spec(state: &WorkerState, request_id: u64, arches: &BTreeSet<String>) -> String {
    let output_pull_spec = state.settings.rebuilt_image_pull_spec(request_id);
    let mut yaml = format!("image: {}\nmanifests:\n", output_pull_spec);
    for arch in arches {
        let arch_pull_spec = external_arch_pull_spec(state, request_id, arch);
        debug!(
            "Adding the manifest {} to the manifest list {}",
            arch_pull_spec, output_pull_spec
        );
        yaml.push_str(&format!(
            "- image: {}\n  platform:\n    architecture: {}\n    os: linux\n",
            arch_pull_spec, arch
        ));
    }
    yaml
}

/// Create and push the multi-arch manifest list, returning its pull spec
pub async fn create_and_push_manifest_list(
    state: &WorkerState,
    request_id: u64,
    arches: &BTreeSet<String>,
) -> Result<String> {
    let output_pull_spec = state.settings.rebuilt_image_pull_spec(request_id);
    info!("Creating the manifest list {}", output_pull_spec);

    let policy = RetryPolicy::from_settings(&state.settings).with_attempts(3);
    with_retry(&policy, "create_and_push_manifest_list", on_iib_error, || async {
        let temp_dir = tempfile::Builder::new().prefix("iib-").tempdir()?;
        let manifest_yaml = temp_dir.path().join("manifest.yaml");
        let content = manifest_list_spec(state, request_id, arches);
        debug!(
            "Created the manifest configuration with the following content:\n{}",
            content
        );
        std::fs::write(&manifest_yaml, content)?;

        let spec = CommandSpec::new("manifest-tool")
            .args(["push", "from-spec"])
            .arg(manifest_yaml.to_string_lossy());
        run_cmd(
            state.runner(),
            &spec,
            Some(&format!("Failed to push the manifest list to {}", output_pull_spec)),
        )
        .await?;
        Ok(output_pull_spec.clone())
    })
    .await
}

/// Remove all local images and reset the Docker config
pub async fn cleanup(state: &WorkerState) -> Result<()> {
    info!("Removing all existing container images");
    let spec = CommandSpec::new("podman").args(["rmi", "--all", "--force"]);
    run_cmd(
        state.runner(),
        &spec,
        Some("Failed to remove the existing container images"),
    )
    .await?;
    reset_docker_config(&state.settings)
}

pub async fn podman_pull(state: &WorkerState, image: &str) -> Result<()> {
    let spec = CommandSpec::new("podman").args(["pull", image]);
    let exc_msg = format!("Failed to pull the container image {}", image);
    let policy = RetryPolicy::from_settings(&state.settings);
    with_retry(&policy, "podman_pull", on_iib_error, || {
        run_cmd(state.runner(), &spec, Some(&exc_msg))
    })
    .await?;
    Ok(())
}

/// Copy `src_path` out of `image` into `dest_path` using a throwaway container
pub async fn copy_files_from_image(
    state: &WorkerState,
    image: &str,
    src_path: &str,
    dest_path: &Path,
) -> Result<()> {
    // The command is required by podman but never run
    let create = CommandSpec::new("podman").args(["create", image, "unused"]);
    let container_id = run_cmd(
        state.runner(),
        &create,
        Some(&format!("Failed to create a container for {}", image)),
    )
    .await?
    .trim()
    .to_string();
    if container_id.is_empty() {
        return Err(IibError::iib(format!("Failed to create a container for {}", image)));
    }

    let copy = CommandSpec::new("podman")
        .args(["cp", &format!("{}:{}", container_id, src_path)])
        .arg(dest_path.to_string_lossy());
    let copied = run_cmd(
        state.runner(),
        &copy,
        Some(&format!("Failed to copy the contents of {}:{}", container_id, src_path)),
    )
    .await;

    let remove = CommandSpec::new("podman").args(["rm", container_id.as_str()]);
    if let Err(e) = run_cmd(state.runner(), &remove, None).await {
        warn!(
            "Failed to remove the container {} for image {}: {}",
            container_id, image, e
        );
    }

    copied.map(|_| ())
}
