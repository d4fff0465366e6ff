// Reading index images: their databases, catalogs and the bundles they serve

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::command::{run_cmd, CommandSpec};
use crate::error::{IibError, Result};
use crate::opm::serve::{opm_registry_serve, opm_serve, ServedCatalog};
use crate::opm::OpmContext;
use crate::registry::auth::RegistryTokenGuard;
use crate::registry::podman::copy_files_from_image;
use crate::registry::skopeo::{get_inspect_labels, is_image_fbc, FBC_CONFIGS_LABEL};
use crate::registry::digest_hex;
use crate::state::WorkerState;

pub const INDEX_DB_LABEL: &str = "operators.operatorframework.io.index.database.v1";
/// Where FBC index images built by the worker keep the `index.db` they were migrated from
pub const HIDDEN_INDEX_DB_PATH: &str = "/var/lib/iib/_hidden/do.not.edit.db";
/// Working copy of the index database, relative to the request directory
pub const TEMP_INDEX_DB_PATH: &str = "database/index.db";

const DEFAULT_CONFIGS_PATH: &str = "/configs";

/// One entry of `api.Registry/ListBundles`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleImage {
    pub bundle_path: String,
    pub package_name: String,
    #[serde(default)]
    pub csv_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub channel_name: String,
}

#[derive(Debug, Deserialize)]
struct PackageName {
    name: String,
}

/// grpcurl prints one JSON document per result without separators
fn parse_stream<T: serde::de::DeserializeOwned>(output: &str) -> Result<Vec<T>> {
    serde_json::Deserializer::from_str(output)
        .into_iter::<T>()
        .map(|item| item.map_err(IibError::from))
        .collect()
}

pub fn parse_bundles(output: &str) -> Result<Vec<BundleImage>> {
    let mut seen = BTreeSet::new();
    Ok(parse_stream::<BundleImage>(output)?
        .into_iter()
        .filter(|bundle| seen.insert(bundle.bundle_path.clone()))
        .collect())
}

fn basename(path: &str) -> Result<&str> {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| IibError::iib(format!("Invalid path in the index image: {}", path)))
}

/// Copy the SQLite database of a legacy index image into `base_dir`
pub async fn get_index_database(state: &WorkerState, from_index: &str, base_dir: &Path) -> Result<PathBuf> {
    let labels = get_inspect_labels(state, from_index).await?;
    let db_path = labels.get(INDEX_DB_LABEL).ok_or_else(|| {
        IibError::iib("Index image doesn't have the label specifying its database location.")
    })?;
    let local_path = base_dir.join(basename(db_path)?);
    copy_files_from_image(state, from_index, db_path, &local_path).await?;
    Ok(local_path)
}

/// Copy the `index.db` kept inside an FBC index image to `{base_dir}/database/index.db`
pub async fn get_hidden_index_database(
    state: &WorkerState,
    from_index: &str,
    base_dir: &Path,
) -> Result<PathBuf> {
    let local_path = base_dir.join(TEMP_INDEX_DB_PATH);
    if let Some(parent) = local_path.parent() {
        fs::create_dir_all(parent)?;
    }
    copy_files_from_image(state, from_index, HIDDEN_INDEX_DB_PATH, &local_path).await?;
    Ok(local_path)
}

/// Copy the file-based catalog of `from_index` into `base_dir`
pub async fn get_catalog_dir(state: &WorkerState, from_index: &str, base_dir: &Path) -> Result<PathBuf> {
    info!("Copying the file-based catalog from {}", from_index);
    let labels = get_inspect_labels(state, from_index).await?;
    let configs = labels.get(FBC_CONFIGS_LABEL).ok_or_else(|| {
        IibError::iib(format!(
            "Index image {} doesn't have the label specifying its file-based catalog location.",
            from_index
        ))
    })?;
    let local_path = base_dir.join(basename(configs)?);
    copy_files_from_image(state, from_index, configs, &local_path).await?;
    Ok(local_path)
}

/// Copy an FBC fragment into `{base_dir}/fbc-fragment` and list its packages
pub async fn extract_fbc_fragment(
    state: &WorkerState,
    fbc_fragment: &str,
    base_dir: &Path,
) -> Result<(PathBuf, Vec<String>)> {
    info!("Extracting the fbc_fragment's catalog from {}", fbc_fragment);
    let labels = get_inspect_labels(state, fbc_fragment).await?;
    let configs = labels
        .get(FBC_CONFIGS_LABEL)
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIGS_PATH);
    let fragment_path = base_dir.join("fbc-fragment");
    copy_files_from_image(state, fbc_fragment, configs, &fragment_path).await?;

    let mut operators = Vec::new();
    if fragment_path.is_dir() {
        for entry in fs::read_dir(&fragment_path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                operators.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    operators.sort();
    if operators.is_empty() {
        return Err(IibError::iib(format!(
            "No operator packages in fbc_fragment {}",
            fbc_fragment
        )));
    }
    info!("fbc_fragment extracted at {}", fragment_path.display());
    info!("Operator packages found in fbc_fragment: {}", operators.join(", "));
    Ok((fragment_path, operators))
}

/// The working `index.db` for opm registry commands
///
/// An existing copy is reused unless `ignore_existing`. Otherwise it is copied from
/// `from_index` (the hidden database for FBC images), or created empty.
pub async fn get_or_create_temp_index_db(
    state: &WorkerState,
    base_dir: &Path,
    from_index: Option<&str>,
    overwrite_from_index_token: Option<&str>,
    ignore_existing: bool,
) -> Result<PathBuf> {
    let index_db = base_dir.join(TEMP_INDEX_DB_PATH);
    if !ignore_existing && index_db.exists() {
        debug!("Temp index.db already exists at {}", index_db.display());
        return Ok(index_db);
    }

    if let Some(from_index) = from_index {
        info!("Using the existing database from {}", from_index);
        let _guard = RegistryTokenGuard::set(&state.settings, overwrite_from_index_token, Some(from_index))?;
        if is_image_fbc(state, from_index).await? {
            return get_hidden_index_database(state, from_index, base_dir).await;
        }
        return get_index_database(state, from_index, base_dir).await;
    }

    info!("Creating empty database file {}", index_db.display());
    if let Some(parent) = index_db.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::File::create(&index_db)?;
    Ok(index_db)
}

/// Serve `from_index` locally, FBC or SQLite
async fn serve_index(
    state: &WorkerState,
    opm: &OpmContext,
    from_index: &str,
    base_dir: &Path,
) -> Result<ServedCatalog> {
    if is_image_fbc(state, from_index).await? {
        let catalog = get_catalog_dir(state, from_index, base_dir).await?;
        opm_serve(state, opm, &catalog).await
    } else {
        let db_path = get_index_database(state, from_index, base_dir).await?;
        opm_registry_serve(state, opm, &db_path).await
    }
}

/// Call one registry method and stop the service whatever the outcome
async fn query_served(
    state: &WorkerState,
    served: ServedCatalog,
    method: &str,
    exc_msg: &str,
) -> Result<String> {
    let spec = CommandSpec::new("grpcurl").args([
        "-plaintext".to_string(),
        format!("localhost:{}", served.port),
        method.to_string(),
    ]);
    let output = run_cmd(state.runner(), &spec, Some(exc_msg)).await;
    if let Err(e) = served.stop().await {
        warn!("Failed to stop the opm service: {}", e);
    }
    output
}

/// Bundles already present in the index image
pub async fn get_present_bundles(
    state: &WorkerState,
    opm: &OpmContext,
    from_index: &str,
    base_dir: &Path,
) -> Result<Vec<BundleImage>> {
    let served = serve_index(state, opm, from_index, base_dir).await?;
    let output = query_served(
        state,
        served,
        "api.Registry/ListBundles",
        "Failed to get bundle data from index image",
    )
    .await?;
    parse_bundles(&output)
}

/// Bundles served by an `index.db` already on disk
pub async fn get_bundles_from_db(
    state: &WorkerState,
    opm: &OpmContext,
    db_path: &Path,
) -> Result<Vec<BundleImage>> {
    let served = opm_registry_serve(state, opm, db_path).await?;
    let output = query_served(
        state,
        served,
        "api.Registry/ListBundles",
        "Failed to get bundle data from index image",
    )
    .await?;
    parse_bundles(&output)
}

/// Bundles of a file-based catalog directory on disk
pub async fn get_bundles_from_catalog(
    state: &WorkerState,
    opm: &OpmContext,
    catalog_dir: &Path,
) -> Result<Vec<BundleImage>> {
    let served = opm_serve(state, opm, catalog_dir).await?;
    let output = query_served(
        state,
        served,
        "api.Registry/ListBundles",
        "Failed to get bundle data from index image",
    )
    .await?;
    parse_bundles(&output)
}

/// Package names present in the index image
pub async fn get_present_operators(
    state: &WorkerState,
    opm: &OpmContext,
    from_index: &str,
    base_dir: &Path,
) -> Result<Vec<String>> {
    let served = serve_index(state, opm, from_index, base_dir).await?;
    let output = query_served(
        state,
        served,
        "api.Registry/ListPackages",
        "Failed to get package data from index image",
    )
    .await?;
    let mut names: Vec<String> = parse_stream::<PackageName>(&output)?
        .into_iter()
        .map(|p| p.name)
        .collect();
    names.dedup();
    Ok(names)
}

/// Requested bundles whose digest is not served by the index yet
pub fn get_missing_bundles(present: &[BundleImage], bundles: &[String]) -> Vec<String> {
    let present_digests: BTreeSet<&str> = present
        .iter()
        .filter_map(|bundle| digest_hex(&bundle.bundle_path))
        .collect();
    bundles
        .iter()
        .filter(|bundle| {
            let digest = digest_hex(bundle).unwrap_or(bundle.as_str());
            !present_digests.contains(digest)
        })
        .cloned()
        .collect()
}

/// Which of `operator_packages` are in the hidden database of `from_index`
///
/// Returns the packages found and the path of the copied database.
pub async fn verify_operators_exists(
    state: &WorkerState,
    opm: &OpmContext,
    from_index: &str,
    base_dir: &Path,
    operator_packages: &[String],
    overwrite_from_index_token: Option<&str>,
) -> Result<(BTreeSet<String>, PathBuf)> {
    info!(
        "Verifying if operator packages {:?} exists in index {}",
        operator_packages, from_index
    );
    let index_db = {
        let _guard = RegistryTokenGuard::set(&state.settings, overwrite_from_index_token, Some(from_index))?;
        get_hidden_index_database(state, from_index, base_dir).await?
    };

    let packages: BTreeSet<String> = get_bundles_from_db(state, opm, &index_db)
        .await?
        .into_iter()
        .map(|bundle| bundle.package_name)
        .filter(|package| operator_packages.contains(package))
        .collect();
    if !packages.is_empty() {
        info!(
            "operator packages found in index_db {}: {:?}",
            index_db.display(),
            packages
        );
    }
    Ok((packages, index_db))
}
