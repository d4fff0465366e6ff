use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::command::{run_cmd, CommandSpec};
use crate::error::{IibError, Result};
use crate::registry::{image_name, is_digest_pinned, with_transport, MANIFEST_LIST_V2, MANIFEST_V2};
use crate::retry::{on_iib_error, with_retry, RetryPolicy};
use crate::state::WorkerState;

pub const FBC_CONFIGS_LABEL: &str = "operators.operatorframework.io.index.configs.v1";

/// Run `skopeo inspect` with retries and return the raw output
pub async fn skopeo_inspect_raw(state: &WorkerState, args: &[&str]) -> Result<String> {
    let exc_msg = args
        .iter()
        .find(|arg| arg.starts_with("docker://"))
        .map(|arg| format!("Failed to inspect {}. Make sure it exists and is accessible to IIB.", arg));
    let spec = CommandSpec::new("skopeo")
        .args(["--command-timeout", state.settings.iib_skopeo_timeout.as_str(), "inspect"])
        .args(args.iter().copied());

    let policy = RetryPolicy::from_settings(&state.settings);
    with_retry(&policy, "skopeo_inspect", on_iib_error, || {
        run_cmd(state.runner(), &spec, exc_msg.as_deref())
    })
    .await
}

pub async fn skopeo_inspect(state: &WorkerState, args: &[&str]) -> Result<Value> {
    let output = skopeo_inspect_raw(state, args).await?;
    Ok(serde_json::from_str(&output)?)
}

/// Pin a pull spec to its content digest
///
/// A spec that is already pinned is returned unchanged. For schema 2 manifests the
/// digest is the sha256 of the raw manifest; older schemas use the digest skopeo reports.
pub async fn get_resolved_image(state: &WorkerState, pull_spec: &str) -> Result<String> {
    if is_digest_pinned(pull_spec) {
        return Ok(pull_spec.to_string());
    }

    debug!("Resolving {}", pull_spec);
    let name = image_name(pull_spec);
    let transport = with_transport(pull_spec);
    let raw = skopeo_inspect_raw(state, &[&transport, "--raw"]).await?;
    let manifest: Value = serde_json::from_str(&raw)?;

    let digest = if manifest.get("schemaVersion").and_then(Value::as_u64) == Some(2) {
        format!("sha256:{:x}", Sha256::digest(raw.as_bytes()))
    } else {
        let inspected = skopeo_inspect(state, &[&transport]).await?;
        inspected
            .get("Digest")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| IibError::iib(format!("Unable to determine the digest of {}", pull_spec)))?
    };

    let resolved = format!("{}@{}", name, digest);
    debug!("{} resolved to {}", pull_spec, resolved);
    Ok(resolved)
}

/// Resolve bundle pull specs to digests
///
/// For a manifest list the digest of the first listed manifest is used, whatever
/// its platform.
pub async fn get_resolved_bundles(state: &WorkerState, bundles: &[String]) -> Result<Vec<String>> {
    info!("Resolving bundles {}", bundles.join(", "));
    let mut resolved = Vec::new();
    for bundle in bundles {
        let pinned = resolve_bundle(state, bundle).await?;
        if !resolved.contains(&pinned) {
            resolved.push(pinned);
        }
    }
    Ok(resolved)
}

async fn resolve_bundle(state: &WorkerState, bundle: &str) -> Result<String> {
    let raw = skopeo_inspect(state, &[&with_transport(bundle), "--raw"]).await?;
    let media_type = raw.get("mediaType").and_then(Value::as_str);
    let schema_version = raw.get("schemaVersion").and_then(Value::as_u64);

    match media_type {
        Some(MANIFEST_LIST_V2) => {
            let digest = raw
                .pointer("/manifests/0/digest")
                .and_then(Value::as_str)
                .ok_or_else(|| IibError::iib(format!("The manifest list of {} is empty", bundle)))?;
            Ok(format!("{}@{}", image_name(bundle), digest))
        }
        Some(MANIFEST_V2) if schema_version == Some(2) => get_resolved_image(state, bundle).await,
        _ => Err(IibError::iib(format!(
            "The pull specification of {} is neither a v2 manifest list nor a v2s2 manifest. \
             Type {} and schema version {} is not supported by IIB.",
            bundle,
            media_type.unwrap_or("None"),
            schema_version.map(|v| v.to_string()).unwrap_or_else(|| "None".to_string())
        ))),
    }
}

/// Architectures an image is available for
pub async fn get_image_arches(state: &WorkerState, pull_spec: &str) -> Result<BTreeSet<String>> {
    debug!("Get the available arches for {}", pull_spec);
    let transport = with_transport(pull_spec);
    let raw = skopeo_inspect(state, &[&transport, "--raw"]).await?;

    let mut arches = BTreeSet::new();
    match raw.get("mediaType").and_then(Value::as_str) {
        Some(MANIFEST_LIST_V2) => {
            let manifests = raw
                .get("manifests")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for manifest in manifests {
                if let Some(arch) = manifest.pointer("/platform/architecture").and_then(Value::as_str) {
                    arches.insert(arch.to_string());
                }
            }
        }
        Some(MANIFEST_V2) => {
            let config = skopeo_inspect(state, &[&transport, "--config"]).await?;
            if let Some(arch) = config.get("architecture").and_then(Value::as_str) {
                arches.insert(arch.to_string());
            }
        }
        _ => {
            return Err(IibError::iib(format!(
                "The pull specification of {} is neither a v2 manifest list nor a v2 manifest",
                pull_spec
            )))
        }
    }
    Ok(arches)
}

pub async fn get_image_labels(
    state: &WorkerState,
    pull_spec: &str,
) -> Result<BTreeMap<String, String>> {
    let transport = with_transport(pull_spec);
    debug!("Getting the labels from {}", transport);
    let config = skopeo_inspect(state, &[&transport, "--config"]).await?;
    Ok(labels_from(config.pointer("/config/Labels")))
}

pub async fn get_image_label(state: &WorkerState, pull_spec: &str, label: &str) -> Result<Option<String>> {
    debug!("Getting the label of {} from {}", label, pull_spec);
    Ok(get_image_labels(state, pull_spec).await?.remove(label))
}

fn labels_from(value: Option<&Value>) -> BTreeMap<String, String> {
    value
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Digest of the image as reported by the registry
pub async fn get_image_digest(state: &WorkerState, pull_spec: &str) -> Result<String> {
    let inspected = skopeo_inspect(state, &[&with_transport(pull_spec)]).await?;
    inspected
        .get("Digest")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| IibError::iib(format!("Unable to determine the digest of {}", pull_spec)))
}

/// True when the index image carries a file-based catalog
pub async fn is_image_fbc(state: &WorkerState, image: &str) -> Result<bool> {
    let inspected = skopeo_inspect(state, &[&with_transport(image)]).await?;
    Ok(labels_from(inspected.get("Labels")).contains_key(FBC_CONFIGS_LABEL))
}

/// Labels reported by a plain `skopeo inspect`
pub async fn get_inspect_labels(state: &WorkerState, image: &str) -> Result<BTreeMap<String, String>> {
    let inspected = skopeo_inspect(state, &[&with_transport(image)]).await?;
    Ok(labels_from(inspected.get("Labels")))
}

/// `skopeo copy --format v2s2` with retries
pub async fn skopeo_copy(
    state: &WorkerState,
    source: &str,
    destination: &str,
    copy_all: bool,
    exc_msg: Option<&str>,
) -> Result<()> {
    debug!("Copying the container image {} to {}", source, destination);
    let mut spec = CommandSpec::new("skopeo").args([
        "--command-timeout",
        state.settings.iib_skopeo_timeout.as_str(),
        "copy",
        "--format",
        "v2s2",
    ]);
    if copy_all {
        spec = spec.arg("--all");
    }
    spec = spec.args([source, destination]);

    let default_msg = format!("Failed to copy {} to {}", source, destination);
    let exc_msg = exc_msg.unwrap_or(&default_msg);
    let policy = RetryPolicy::from_settings(&state.settings);
    with_retry(&policy, "skopeo_copy", on_iib_error, || {
        run_cmd(state.runner(), &spec, Some(exc_msg))
    })
    .await?;
    Ok(())
}
