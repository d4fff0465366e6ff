use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::command::{run_cmd, CommandSpec};
use crate::error::{IibError, Result};
use crate::registry::image_name;
use crate::registry::skopeo::get_image_digest;
use crate::settings::WorkerSettings;
use crate::state::WorkerState;

pub const INDEX_DB_ARTIFACT_TYPE: &str = "application/vnd.sqlite";
pub const INDEX_DB_FILE: &str = "index.db";

/// Last path segment of the repository and the tag (`latest` when absent)
pub fn name_and_tag(pull_spec: &str) -> (String, String) {
    let name = image_name(pull_spec);
    let repo = name.rsplit('/').next().unwrap_or(name).to_string();
    let tag = pull_spec
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix(':'))
        .filter(|tag| !tag.is_empty())
        .unwrap_or("latest")
        .to_string();
    (repo, tag)
}

/// `{repo}-{tag}`, the artifact tag for one index image tag
pub fn artifact_combined_tag(image_name: &str, tag: &str) -> String {
    format!("{}-{}", image_name, tag)
}

fn artifact_pullspec(settings: &WorkerSettings, tag: &str) -> Result<String> {
    let registry = settings
        .iib_index_db_artifact_registry
        .as_deref()
        .ok_or_else(|| IibError::iib("iib_index_db_artifact_registry is not configured"))?;
    Ok(settings
        .iib_index_db_artifact_template
        .replace("{registry}", registry)
        .replace("{tag}", tag))
}

/// Where the `index.db` of the `from_index` tag lives
pub fn get_indexdb_artifact_pullspec(settings: &WorkerSettings, from_index: &str) -> Result<String> {
    let (name, tag) = name_and_tag(from_index);
    artifact_pullspec(settings, &artifact_combined_tag(&name, &tag))
}

/// Where the pre-built empty `index.db` for the repository of `from_index` lives
pub fn get_empty_indexdb_artifact_pullspec(settings: &WorkerSettings, from_index: &str) -> Result<String> {
    let (name, _) = name_and_tag(from_index);
    artifact_pullspec(settings, &artifact_combined_tag(&name, &settings.iib_empty_index_db_tag))
}

/// The per-request copy of the `index.db` artifact
pub fn get_request_artifact_pullspec(
    settings: &WorkerSettings,
    from_index: &str,
    request_id: u64,
) -> Result<String> {
    let (name, tag) = name_and_tag(from_index);
    artifact_pullspec(
        settings,
        &format!("{}-{}", artifact_combined_tag(&name, &tag), request_id),
    )
}

/// `oras pull` into a fresh directory under `base_dir`
pub async fn get_oras_artifact(state: &WorkerState, artifact_ref: &str, base_dir: &Path) -> Result<PathBuf> {
    info!("Pulling OCI artifact {} to temporary directory", artifact_ref);
    let target = tempfile::Builder::new()
        .prefix("iib-oras-")
        .tempdir_in(base_dir)?
        .keep();
    let spec = CommandSpec::new("oras")
        .args(["pull", artifact_ref, "-o"])
        .arg(target.to_string_lossy());
    if let Err(e) = run_cmd(state.runner(), &spec, None).await {
        let _ = std::fs::remove_dir_all(&target);
        return Err(IibError::iib(format!(
            "Failed to pull OCI artifact {}: {}",
            artifact_ref, e
        )));
    }
    info!("Successfully pulled OCI artifact {} to {}", artifact_ref, target.display());
    Ok(target)
}

/// `oras push` of a single file, run from the file's directory so only its name is stored
pub async fn push_oras_artifact(
    state: &WorkerState,
    artifact_ref: &str,
    local_path: &Path,
    artifact_type: &str,
    annotations: &BTreeMap<String, String>,
) -> Result<()> {
    info!(
        "Pushing artifact from {} to {} with type {}",
        local_path.display(),
        artifact_ref,
        artifact_type
    );
    if !local_path.exists() {
        return Err(IibError::iib(format!(
            "Local artifact path does not exist: {}",
            local_path.display()
        )));
    }
    let file_name = local_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| IibError::iib(format!("Invalid artifact path: {}", local_path.display())))?;

    let mut spec = CommandSpec::new("oras")
        .args(["push", artifact_ref])
        .arg(format!("{}:{}", file_name, artifact_type));
    for (key, value) in annotations {
        spec = spec.arg("--annotation").arg(format!("{}={}", key, value));
    }
    if let Some(dir) = local_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        spec = spec.cwd(dir);
    }
    run_cmd(state.runner(), &spec, None).await.map_err(|e| {
        IibError::iib(format!("Failed to push OCI artifact to {}: {}", artifact_ref, e))
    })?;
    info!("Successfully pushed OCI artifact to {}", artifact_ref);
    Ok(())
}

/// Pull the `index.db` of `from_index` and return the path of the database file
pub async fn pull_index_db_artifact(state: &WorkerState, from_index: &str, base_dir: &Path) -> Result<PathBuf> {
    let artifact_ref = get_indexdb_artifact_pullspec(&state.settings, from_index)?;
    let artifact_dir = get_oras_artifact(state, &artifact_ref, base_dir).await?;
    let index_db = artifact_dir.join(INDEX_DB_FILE);
    if !index_db.is_file() {
        return Err(IibError::iib(format!(
            "Index.db file not found at {}",
            index_db.display()
        )));
    }
    Ok(index_db)
}

/// Publish an updated `index.db`: always under the request tag, and over the
/// `from_index` tag when overwriting
///
/// Returns the digest the `from_index` tag pointed at before it was replaced.
pub async fn push_index_db_artifact(
    state: &WorkerState,
    request_id: u64,
    from_index: &str,
    index_db: &Path,
    operation: &str,
    operators: &[String],
    overwrite_from_index: bool,
) -> Result<Option<String>> {
    let annotations = BTreeMap::from([
        ("request_id".to_string(), request_id.to_string()),
        ("operation".to_string(), operation.to_string()),
        ("operators".to_string(), operators.join(",")),
    ]);

    let request_ref = get_request_artifact_pullspec(&state.settings, from_index, request_id)?;
    push_oras_artifact(state, &request_ref, index_db, INDEX_DB_ARTIFACT_TYPE, &annotations).await?;
    if !overwrite_from_index {
        return Ok(None);
    }

    let index_ref = get_indexdb_artifact_pullspec(&state.settings, from_index)?;
    info!("Capturing original digest of {} for potential rollback", index_ref);
    let original_digest = get_image_digest(state, &index_ref).await?;
    info!("Original index.db digest: {}", original_digest);
    push_oras_artifact(state, &index_ref, index_db, INDEX_DB_ARTIFACT_TYPE, &annotations).await?;
    Ok(Some(original_digest))
}

/// Point the `from_index` artifact tag back at `digest`
pub async fn restore_index_db_artifact(state: &WorkerState, from_index: &str, digest: &str) -> Result<()> {
    let index_ref = get_indexdb_artifact_pullspec(&state.settings, from_index)?;
    let source_ref = format!("{}@{}", image_name(&index_ref), digest);
    info!("Restoring {} from {}", index_ref, source_ref);
    let spec = CommandSpec::new("oras").args(["copy", source_ref.as_str(), index_ref.as_str()]);
    let exc_msg = format!(
        "Failed to restore index.db artifact from {} to {}",
        source_ref, index_ref
    );
    run_cmd(state.runner(), &spec, Some(&exc_msg)).await?;
    info!("Successfully restored index.db artifact to original digest");
    Ok(())
}
