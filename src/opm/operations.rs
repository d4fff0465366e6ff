// opm index/registry subcommands producing the catalog and index.Dockerfile of a build

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use crate::api::RequestState;
use crate::command::run_cmd;
use crate::error::{IibError, Result};
use crate::opm::index::{
    extract_fbc_fragment, get_catalog_dir, get_hidden_index_database, get_index_database,
    get_or_create_temp_index_db, verify_operators_exists, HIDDEN_INDEX_DB_PATH,
};
use crate::opm::ports::{with_leased_ports, OPM_PPROF_PORT};
use crate::opm::OpmContext;
use crate::registry::auth::RegistryTokenGuard;
use crate::registry::skopeo::is_image_fbc;
use crate::retry::{on_iib_error, with_retry, RetryPolicy};
use crate::state::WorkerState;

pub const INDEX_DOCKERFILE: &str = "index.Dockerfile";

const OPM_CACHE_RUN: &str =
    r#"RUN ["/bin/opm", "serve", "/configs", "--cache-dir=/tmp/cache", "--cache-only"]"#;
const LOCAL_CACHE_COPY: &str = "COPY --chown=1001:0 cache /tmp/cache";

/// Inputs shared by the "add bundles" operations
#[derive(Debug, Clone, Copy, Default)]
pub struct AddBundles<'a> {
    pub bundles: &'a [String],
    pub binary_image: &'a str,
    pub from_index: Option<&'a str>,
    pub graph_update_mode: Option<&'a str>,
    pub overwrite_csv: bool,
    pub overwrite_from_index_token: Option<&'a str>,
    pub container_tool: Option<&'a str>,
}

impl AddBundles<'_> {
    fn bundle_list(&self) -> String {
        if self.bundles.is_empty() {
            r#""""#.to_string()
        } else {
            self.bundles.join(",")
        }
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// `opm registry add` into `index_db`, restoring the database if opm fails
///
/// opm can leave a half-written database behind on failure.
pub async fn opm_registry_add(
    state: &WorkerState,
    opm: &OpmContext,
    base_dir: &Path,
    index_db: &Path,
    params: &AddBundles<'_>,
) -> Result<()> {
    let mut spec = opm
        .command()
        .args(["registry", "add", "--database"])
        .arg(path_arg(index_db))
        .args(["--enable-alpha", "--bundle-images"])
        .arg(params.bundle_list());
    if let Some(tool) = params.container_tool {
        spec = spec.args(["--container-tool", tool]);
    }
    if let Some(mode) = params.graph_update_mode {
        info!("Using {} mode to update the channel graph in the index", mode);
        spec = spec.args(["--mode", mode]);
    }
    info!(
        "Generating the database file with the following bundle(s): {}",
        params.bundles.join(", ")
    );
    if params.overwrite_csv {
        info!("Using force to add bundle(s) to index");
        spec = spec.arg("--overwrite-latest");
    }

    let mut backup = index_db.as_os_str().to_owned();
    backup.push(".backup");
    let backup = PathBuf::from(backup);
    fs::copy(index_db, &backup)?;

    let result = run_cmd(
        state.runner(),
        &spec.cwd(base_dir),
        Some("Failed to add the bundles to the index image"),
    )
    .await;
    if result.is_err() {
        fs::copy(&backup, index_db)?;
    }
    fs::remove_file(&backup)?;
    result.map(|_| ())
}

/// Add bundles to an FBC index through its `index.db`, then regenerate the catalog
pub async fn opm_registry_add_fbc(
    state: &WorkerState,
    opm: &OpmContext,
    base_dir: &Path,
    params: &AddBundles<'_>,
) -> Result<()> {
    with_retry(&RetryPolicy::immediate(2), "opm_registry_add_fbc", on_iib_error, || async {
        let index_db = get_or_create_temp_index_db(
            state,
            base_dir,
            params.from_index,
            params.overwrite_from_index_token,
            true,
        )
        .await?;
        opm_registry_add(state, opm, base_dir, &index_db, params).await?;
        let (fbc_dir, _) = opm_migrate(state, opm, &index_db, base_dir, true).await?;
        opm_generate_dockerfile(
            state,
            opm,
            &fbc_dir,
            base_dir,
            &index_db,
            params.binary_image,
            Some(INDEX_DOCKERFILE),
        )
        .await?;
        Ok(())
    })
    .await
}

pub async fn opm_registry_rm(
    state: &WorkerState,
    opm: &OpmContext,
    index_db: &Path,
    operators: &[String],
    base_dir: &Path,
) -> Result<()> {
    registry_rm(state, opm, index_db, operators, base_dir, false).await
}

/// `opm registry rm --permissive`, which tolerates packages with broken references
pub async fn opm_registry_rm_permissive(
    state: &WorkerState,
    opm: &OpmContext,
    index_db: &Path,
    operators: &[String],
    base_dir: &Path,
) -> Result<()> {
    registry_rm(state, opm, index_db, operators, base_dir, true).await
}

async fn registry_rm(
    state: &WorkerState,
    opm: &OpmContext,
    index_db: &Path,
    operators: &[String],
    base_dir: &Path,
    permissive: bool,
) -> Result<()> {
    let mut spec = opm
        .command()
        .args(["registry", "rm", "--database"])
        .arg(path_arg(index_db))
        .arg("--packages")
        .arg(operators.join(","));
    if permissive {
        spec = spec.arg("--permissive");
    }
    let spec = spec.cwd(base_dir);
    run_cmd(
        state.runner(),
        &spec,
        Some("Failed to remove operators from the index image"),
    )
    .await?;
    Ok(())
}

/// Remove packages from an FBC index and generate its catalog and Dockerfile
///
/// Returns the catalog directory and, when requested, its cache directory.
#[allow(clippy::too_many_arguments)]
pub async fn opm_registry_rm_fbc(
    state: &WorkerState,
    opm: &OpmContext,
    base_dir: &Path,
    from_index: &str,
    operators: &[String],
    binary_image: &str,
    overwrite_from_index_token: Option<&str>,
    generate_cache: bool,
) -> Result<(PathBuf, Option<PathBuf>)> {
    with_retry(&RetryPolicy::immediate(2), "opm_registry_rm_fbc", on_iib_error, || async {
        info!("Removing {:?} from a FBC Image {}", operators, from_index);
        info!("Using the existing database from {}", from_index);
        let index_db = {
            let _guard =
                RegistryTokenGuard::set(&state.settings, overwrite_from_index_token, Some(from_index))?;
            get_hidden_index_database(state, from_index, base_dir).await?
        };

        opm_registry_rm(state, opm, &index_db, operators, base_dir).await?;
        let (fbc_dir, cache_dir) = opm_migrate(state, opm, &index_db, base_dir, generate_cache).await?;
        opm_generate_dockerfile(
            state,
            opm,
            &fbc_dir,
            base_dir,
            &index_db,
            binary_image,
            Some(INDEX_DOCKERFILE),
        )
        .await?;
        Ok((fbc_dir, cache_dir))
    })
    .await
}

/// Strip every package from `from_index` and produce an FBC Dockerfile
#[allow(clippy::too_many_arguments)]
pub async fn opm_create_empty_fbc(
    state: &WorkerState,
    opm: &OpmContext,
    request_id: u64,
    temp_dir: &Path,
    from_index_resolved: &str,
    from_index: &str,
    binary_image: &str,
    operators: &[String],
) -> Result<()> {
    let index_db = if is_image_fbc(state, from_index_resolved).await? {
        debug!("{} provided is FBC index image", from_index);
        get_hidden_index_database(state, from_index, temp_dir).await?
    } else {
        debug!("{} provided is SQLite index image", from_index);
        get_index_database(state, from_index, temp_dir).await?
    };

    state
        .tracker()
        .set_request_state(request_id, RequestState::InProgress, "Removing operators from index image")
        .await?;
    opm_registry_rm(state, opm, &index_db, operators, temp_dir).await?;

    let (fbc_dir, _) = opm_migrate(state, opm, &index_db, temp_dir, true).await?;
    opm_generate_dockerfile(
        state,
        opm,
        &fbc_dir,
        temp_dir,
        &index_db,
        binary_image,
        Some(INDEX_DOCKERFILE),
    )
    .await?;
    Ok(())
}

/// Merge the packages of an FBC fragment into the catalog of `from_index`
///
/// Packages of the fragment that also exist in the hidden `index.db` are removed
/// from it first, so the database and the catalog stay in step.
#[allow(clippy::too_many_arguments)]
pub async fn opm_registry_add_fbc_fragment(
    state: &WorkerState,
    opm: &OpmContext,
    request_id: u64,
    temp_dir: &Path,
    from_index: &str,
    binary_image: &str,
    fbc_fragment: &str,
    overwrite_from_index_token: Option<&str>,
) -> Result<()> {
    let tracker = state.tracker();
    tracker
        .set_request_state(
            request_id,
            RequestState::InProgress,
            "Extracting operator package from fbc_fragment",
        )
        .await?;
    let (fragment_path, fragment_operators) =
        extract_fbc_fragment(state, fbc_fragment, temp_dir).await?;

    let configs_dir = get_catalog_dir(state, from_index, temp_dir).await?;
    info!("The content of from_index configs located at {}", configs_dir.display());

    let (operators_in_db, index_db) = verify_operators_exists(
        state,
        opm,
        from_index,
        temp_dir,
        &fragment_operators,
        overwrite_from_index_token,
    )
    .await?;

    if !operators_in_db.is_empty() {
        let operators: Vec<String> = operators_in_db.into_iter().collect();
        info!("Removing {:?} from {} index.db", operators, from_index);
        opm_registry_rm(state, opm, &index_db, &operators, temp_dir).await?;

        let (migrated_dir, _) = opm_migrate(state, opm, &index_db, temp_dir, false).await?;
        info!(
            "Copying content of {} to {}",
            migrated_dir.display(),
            configs_dir.display()
        );
        for entry in fs::read_dir(&migrated_dir)? {
            let entry = entry?;
            copy_dir_all(&entry.path(), &configs_dir.join(entry.file_name()))?;
        }
    }

    for operator in &fragment_operators {
        tracker
            .set_request_state(request_id, RequestState::InProgress, "Adding fbc_fragment to from_index")
            .await?;
        let source = fragment_path.join(operator);
        let destination = configs_dir.join(operator);
        if destination.exists() {
            fs::remove_dir_all(&destination)?;
        }
        info!("Copying content of {} to {}", source.display(), destination.display());
        copy_dir_all(&source, &destination)?;
    }

    generate_cache_locally(state, opm, temp_dir, &configs_dir, &temp_dir.join("cache")).await?;

    info!("Dockerfile generated from {}", configs_dir.display());
    opm_generate_dockerfile(
        state,
        opm,
        &configs_dir,
        temp_dir,
        &index_db,
        binary_image,
        Some(INDEX_DOCKERFILE),
    )
    .await?;
    Ok(())
}

/// Recursive copy that merges into an existing destination
pub(crate) fn copy_dir_all(source: &Path, destination: &Path) -> Result<()> {
    if source.is_file() {
        fs::copy(source, destination)?;
        return Ok(());
    }
    fs::create_dir_all(destination)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// `opm index add --generate`, producing `index.Dockerfile` for a SQLite index
pub async fn opm_index_add(
    state: &WorkerState,
    opm: &OpmContext,
    base_dir: &Path,
    params: &AddBundles<'_>,
) -> Result<()> {
    let mut spec = opm
        .command()
        .args(["index", "add", "--enable-alpha", "--generate", "--bundles"])
        .arg(params.bundle_list())
        .args(["--binary-image", params.binary_image]);
    if let Some(tool) = params.container_tool {
        spec = spec.args(["--container-tool", tool]);
    }
    if let Some(mode) = params.graph_update_mode {
        info!("Using {} mode to update the channel graph in the index", mode);
        spec = spec.args(["--mode", mode]);
    }
    info!(
        "Generating the database file with the following bundle(s): {}",
        params.bundles.join(", ")
    );
    if let Some(from_index) = params.from_index {
        info!("Using the existing database from {}", from_index);
        spec = spec.args(["--from-index", from_index]);
    }
    if params.overwrite_csv {
        info!("Using force to add bundle(s) to index");
        spec = spec.arg("--overwrite-latest");
    }
    let spec = spec.cwd(base_dir);

    with_retry(&RetryPolicy::immediate(2), "opm_index_add", on_iib_error, || async {
        let _guard = RegistryTokenGuard::set(
            &state.settings,
            params.overwrite_from_index_token,
            params.from_index,
        )?;
        run_cmd(
            state.runner(),
            &spec,
            Some("Failed to add the bundles to the index image"),
        )
        .await
    })
    .await?;
    Ok(())
}

/// `opm index rm --generate`
#[allow(clippy::too_many_arguments)]
pub async fn opm_index_rm(
    state: &WorkerState,
    opm: &OpmContext,
    base_dir: &Path,
    operators: &[String],
    binary_image: &str,
    from_index: &str,
    overwrite_from_index_token: Option<&str>,
    container_tool: Option<&str>,
) -> Result<()> {
    let mut spec = opm
        .command()
        .args(["index", "rm", "--generate", "--binary-image", binary_image])
        .args(["--from-index", from_index, "--operators"])
        .arg(operators.join(","));
    if let Some(tool) = container_tool {
        spec = spec.args(["--container-tool", tool]);
    }
    info!(
        "Generating the database file from an existing database {} and excluding the following operator(s): {}",
        from_index,
        operators.join(", ")
    );
    let spec = spec.cwd(base_dir);

    with_retry(&RetryPolicy::immediate(2), "opm_index_rm", on_iib_error, || async {
        let _guard =
            RegistryTokenGuard::set(&state.settings, overwrite_from_index_token, Some(from_index))?;
        run_cmd(
            state.runner(),
            &spec,
            Some("Failed to remove operators from the index image"),
        )
        .await
    })
    .await?;
    Ok(())
}

/// `opm index deprecatetruncate --generate` for SQLite indexes
pub async fn deprecate_bundles(
    state: &WorkerState,
    opm: &OpmContext,
    bundles: &[String],
    base_dir: &Path,
    binary_image: &str,
    from_index: &str,
    overwrite_target_index_token: Option<&str>,
) -> Result<()> {
    let spec = opm
        .command()
        .args(["index", "deprecatetruncate", "--generate", "--binary-image", binary_image])
        .args(["--from-index", from_index, "--bundles"])
        .arg(bundles.join(","))
        .arg("--allow-package-removal")
        .cwd(base_dir);
    let _guard = RegistryTokenGuard::set(&state.settings, overwrite_target_index_token, Some(from_index))?;
    run_cmd(state.runner(), &spec, Some("Failed to deprecate the bundles")).await?;
    Ok(())
}

pub async fn opm_registry_deprecatetruncate(
    state: &WorkerState,
    opm: &OpmContext,
    base_dir: &Path,
    index_db: &Path,
    bundles: &[String],
) -> Result<()> {
    debug!(
        "Run opm registry deprecatetruncate on database {} and bundles {}",
        index_db.display(),
        bundles.join(" ")
    );
    let spec = opm
        .command()
        .args(["registry", "deprecatetruncate", "--database"])
        .arg(path_arg(index_db))
        .arg("--bundle-images")
        .arg(bundles.join(","))
        .arg("--allow-package-removal")
        .cwd(base_dir);
    let exc_msg = format!("Failed to deprecate the bundles on {}", index_db.display());
    run_cmd(state.runner(), &spec, Some(&exc_msg)).await?;
    Ok(())
}

/// Deprecate bundles of an FBC index through its `index.db`
pub async fn deprecate_bundles_fbc(
    state: &WorkerState,
    opm: &OpmContext,
    bundles: &[String],
    base_dir: &Path,
    binary_image: &str,
    from_index: &str,
) -> Result<()> {
    let index_db = get_or_create_temp_index_db(state, base_dir, Some(from_index), None, false).await?;
    opm_registry_deprecatetruncate(state, opm, base_dir, &index_db, bundles).await?;
    let (fbc_dir, _) = opm_migrate(state, opm, &index_db, base_dir, true).await?;
    opm_generate_dockerfile(
        state,
        opm,
        &fbc_dir,
        base_dir,
        &index_db,
        binary_image,
        Some(INDEX_DOCKERFILE),
    )
    .await?;
    Ok(())
}

/// Migrate `index_db` to `{base_dir}/catalog`, validate it and optionally build its cache
pub async fn opm_migrate(
    state: &WorkerState,
    opm: &OpmContext,
    index_db: &Path,
    base_dir: &Path,
    generate_cache: bool,
) -> Result<(PathBuf, Option<PathBuf>)> {
    let fbc_dir = base_dir.join("catalog");
    // A catalog left by an earlier migration is outdated
    if fbc_dir.exists() {
        fs::remove_dir_all(&fbc_dir)?;
    }

    let spec = opm
        .command()
        .arg("migrate")
        .arg(path_arg(index_db))
        .arg(path_arg(&fbc_dir))
        .cwd(base_dir);
    run_cmd(
        state.runner(),
        &spec,
        Some("Failed to migrate index.db to file-based catalog"),
    )
    .await?;
    info!("Migration to file-based catalog was completed.");
    opm_validate(state, opm, &fbc_dir).await?;

    if !generate_cache {
        return Ok((fbc_dir, None));
    }
    let cache_dir = base_dir.join("cache");
    if cache_dir.exists() {
        fs::remove_dir_all(&cache_dir)?;
    }
    generate_cache_locally(state, opm, base_dir, &fbc_dir, &cache_dir).await?;
    Ok((fbc_dir, Some(cache_dir)))
}

pub async fn opm_validate(state: &WorkerState, opm: &OpmContext, config_dir: &Path) -> Result<()> {
    info!("Validating files under {}", config_dir.display());
    let spec = opm.command().arg("validate").arg(path_arg(config_dir));
    let exc_msg = format!(
        "Failed to validate the content from config_dir {}",
        config_dir.display()
    );
    run_cmd(state.runner(), &spec, Some(&exc_msg)).await?;
    Ok(())
}

/// Generate the Dockerfile of a file-based catalog
///
/// The image ships the locally built cache instead of building it at image build
/// time, and carries `index_db` at the hidden database path. An existing
/// Dockerfile is kept as is.
pub async fn opm_generate_dockerfile(
    state: &WorkerState,
    opm: &OpmContext,
    fbc_dir: &Path,
    base_dir: &Path,
    index_db: &Path,
    binary_image: &str,
    dockerfile_name: Option<&str>,
) -> Result<PathBuf> {
    let fbc_name = fbc_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let opm_default_name = format!("{}.Dockerfile", fbc_name);
    let dockerfile_path = base_dir.join(dockerfile_name.unwrap_or(&opm_default_name));

    if dockerfile_path.is_file() {
        info!(
            "Skipping generation of Dockerfile. Dockerfile for file-based catalog already exists at {}",
            dockerfile_path.display()
        );
        return Ok(dockerfile_path);
    }

    let fbc_dir = std::path::absolute(fbc_dir)?;
    let spec = opm
        .command()
        .args(["generate", "dockerfile"])
        .arg(path_arg(&fbc_dir))
        .args(["--binary-image", binary_image])
        .cwd(base_dir);
    info!("Generating Dockerfile with binary image {}", binary_image);
    run_cmd(
        state.runner(),
        &spec,
        Some("Failed to generate Dockerfile for file-based catalog"),
    )
    .await?;

    let generated = base_dir.join(&opm_default_name);
    if !generated.is_file() {
        let msg = format!("Cannot find generated Dockerfile at {}", generated.display());
        error!("{}", msg);
        return Err(IibError::iib(msg));
    }
    if generated != dockerfile_path {
        fs::rename(&generated, &dockerfile_path)?;
    }

    insert_cache_into_dockerfile(&dockerfile_path)?;

    let relative_db = index_db
        .strip_prefix(base_dir)
        .unwrap_or(index_db)
        .to_string_lossy()
        .into_owned();
    let mut content = fs::read_to_string(&dockerfile_path)?;
    content.push_str(&format!("\nADD {} {}\n", relative_db, HIDDEN_INDEX_DB_PATH));
    fs::write(&dockerfile_path, content)?;

    info!("Dockerfile was successfully generated.");
    Ok(dockerfile_path)
}

fn insert_cache_into_dockerfile(dockerfile_path: &Path) -> Result<()> {
    let content = fs::read_to_string(dockerfile_path)?.replace(OPM_CACHE_RUN, LOCAL_CACHE_COPY);
    fs::write(dockerfile_path, &content)?;
    if !content.lines().any(|line| line.contains(LOCAL_CACHE_COPY)) {
        return Err(IibError::iib(
            "Dockerfile edit to insert locally built cache failed.",
        ));
    }
    Ok(())
}

/// Pre-build the serve cache of `fbc_dir` into `cache_dir`
pub async fn generate_cache_locally(
    state: &WorkerState,
    opm: &OpmContext,
    base_dir: &Path,
    fbc_dir: &Path,
    cache_dir: &Path,
) -> Result<()> {
    let fbc_dir = std::path::absolute(fbc_dir)?;
    with_leased_ports(state, opm, &[OPM_PPROF_PORT], |ports| {
        let fbc_dir = fbc_dir.clone();
        async move {
            let mut spec = opm
                .command()
                .arg("serve")
                .arg(path_arg(&fbc_dir))
                .arg(format!("--cache-dir={}", cache_dir.display()))
                .args(["--cache-only", "--termination-log", "/dev/null"]);
            if let Some(pprof) = ports.pprof_port() {
                spec = spec.args(["--pprof-addr".to_string(), format!("127.0.0.1:{}", pprof)]);
            }

            info!("Generating cache for the file-based catalog");
            if cache_dir.exists() {
                fs::remove_dir_all(cache_dir)?;
            }
            run_cmd(
                state.runner(),
                &spec.cwd(base_dir),
                Some("Failed to generate cache for file-based catalog"),
            )
            .await?;

            if !cache_dir.is_dir() {
                let msg = format!("Cannot find generated cache at {}", cache_dir.display());
                error!("{}", msg);
                return Err(IibError::iib(msg));
            }
            Ok(())
        }
    })
    .await
}


#[cfg(test)]
mod tests {
    use super::test_support::fake_opm_filesystem;
    use super::*;
    use crate::testing::{FakeRunner, TestHarness};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_generate_dockerfile_inserts_cache_and_hidden_db() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        fake_opm_filesystem(&harness);
        let opm = OpmContext::default_for(&harness.state.settings);
        let fbc_dir = dir.path().join("catalog");
        let index_db = dir.path().join("database/index.db");

        let path = opm_generate_dockerfile(
            &harness.state,
            &opm,
            &fbc_dir,
            dir.path(),
            &index_db,
            "quay.io/ns/opm@sha256:123",
            Some(INDEX_DOCKERFILE),
        )
        .await
        .unwrap();

        assert_eq!(path, dir.path().join("index.Dockerfile"));
        assert!(!dir.path().join("catalog.Dockerfile").exists());
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("COPY --chown=1001:0 cache /tmp/cache"));
        assert!(!content.contains("--cache-only"));
        assert!(content.ends_with("\nADD database/index.db /var/lib/iib/_hidden/do.not.edit.db\n"));

        // Existing Dockerfile is not regenerated
        opm_generate_dockerfile(
            &harness.state,
            &opm,
            &fbc_dir,
            dir.path(),
            &index_db,
            "quay.io/ns/opm@sha256:123",
            Some(INDEX_DOCKERFILE),
        )
        .await
        .unwrap();
        assert_eq!(harness.runner.count("opm generate dockerfile"), 1);
    }

    #[tokio::test]
    async fn test_generate_dockerfile_without_cache_line_fails() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.runner.on("opm generate dockerfile", |spec| {
            let cwd = spec.cwd.clone().unwrap();
            fs::write(cwd.join("catalog.Dockerfile"), "FROM scratch\n").unwrap();
            Ok(FakeRunner::ok(""))
        });
        let opm = OpmContext::default_for(&harness.state.settings);

        let err = opm_generate_dockerfile(
            &harness.state,
            &opm,
            &dir.path().join("catalog"),
            dir.path(),
            &dir.path().join("index.db"),
            "quay.io/ns/opm:1",
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "Dockerfile edit to insert locally built cache failed.");
    }

    #[tokio::test]
    async fn test_migrate_generates_cache_with_pprof_port() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        fake_opm_filesystem(&harness);
        let opm = OpmContext::default_for(&harness.state.settings);
        let index_db = dir.path().join("index.db");

        let (fbc_dir, cache_dir) = opm_migrate(&harness.state, &opm, &index_db, dir.path(), true)
            .await
            .unwrap();
        assert_eq!(fbc_dir, dir.path().join("catalog"));
        assert_eq!(cache_dir, Some(dir.path().join("cache")));

        let calls = harness.runner.calls();
        assert_eq!(
            calls[0],
            format!("opm migrate {} {}", index_db.display(), fbc_dir.display())
        );
        assert_eq!(calls[1], format!("opm validate {}", fbc_dir.display()));
        let serve = calls.iter().find(|c| c.contains("--cache-only")).unwrap();
        assert!(serve.contains("--pprof-addr 127.0.0.1:50"));
    }

    #[tokio::test]
    async fn test_registry_add_restores_database_on_failure() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        let index_db = dir.path().join("index.db");
        fs::write(&index_db, "original").unwrap();
        let db = index_db.clone();
        harness.runner.on("opm registry add", move |_| {
            fs::write(&db, "corrupted").unwrap();
            Ok(FakeRunner::fail(1, "Error: error loading bundle into db"))
        });
        let opm = OpmContext::default_for(&harness.state.settings);
        let bundles = vec!["quay.io/ns/bundle:1".to_string()];
        let params = AddBundles {
            bundles: &bundles,
            binary_image: "quay.io/ns/opm:1",
            graph_update_mode: Some("semver"),
            overwrite_csv: true,
            ..Default::default()
        };

        let err = opm_registry_add(&harness.state, &opm, dir.path(), &index_db, &params)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to add the bundles to the index image: error loading bundle into db"
        );
        assert_eq!(fs::read_to_string(&index_db).unwrap(), "original");
        assert!(!dir.path().join("index.db.backup").exists());
        assert!(harness.runner.calls()[0].ends_with(
            "--enable-alpha --bundle-images quay.io/ns/bundle:1 --mode semver --overwrite-latest"
        ));
    }

    #[tokio::test]
    async fn test_index_add_is_retried_once() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness
            .runner
            .on("opm index add", |_| Ok(FakeRunner::fail(1, "timeout")));
        let opm = OpmContext::default_for(&harness.state.settings);
        let params = AddBundles {
            binary_image: "quay.io/ns/opm:1",
            from_index: Some("quay.io/ns/index:v4.12"),
            ..Default::default()
        };

        let err = opm_index_add(&harness.state, &opm, dir.path(), &params)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to add the bundles to the index image");
        assert_eq!(harness.runner.count("opm index add"), 2);
        assert_eq!(
            harness.runner.calls()[0],
            "opm index add --enable-alpha --generate --bundles \"\" --binary-image quay.io/ns/opm:1 --from-index quay.io/ns/index:v4.12"
        );
    }

    #[tokio::test]
    async fn test_add_fbc_fragment_replaces_packages() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.tracker.create(9);
        fake_opm_filesystem(&harness);
        harness.runner.on("inspect docker://", |_| {
            Ok(FakeRunner::ok(
                r#"{"Labels": {"operators.operatorframework.io.index.configs.v1": "/configs"}}"#,
            ))
        });
        harness.runner.on("podman create quay.io/ns/fragment", |_| Ok(FakeRunner::ok("frag\n")));
        harness.runner.on("podman create quay.io/ns/index", |_| Ok(FakeRunner::ok("idx\n")));
        harness.runner.on("podman cp frag:/configs", |spec| {
            let dest = Path::new(spec.args.last().unwrap());
            fs::create_dir_all(dest.join("etcd")).unwrap();
            fs::write(dest.join("etcd/catalog.json"), "new").unwrap();
            Ok(FakeRunner::ok(""))
        });
        harness.runner.on("podman cp idx:/configs", |spec| {
            let dest = Path::new(spec.args.last().unwrap());
            fs::create_dir_all(dest.join("etcd")).unwrap();
            fs::write(dest.join("etcd/old.json"), "old").unwrap();
            fs::create_dir_all(dest.join("prometheus")).unwrap();
            Ok(FakeRunner::ok(""))
        });
        harness
            .runner
            .on("list api.Registry", |_| Ok(FakeRunner::ok("api.Registry.ListBundles\n")));
        harness.runner.on("api.Registry/ListBundles", |_| {
            Ok(FakeRunner::ok(
                r#"{"packageName": "etcd", "bundlePath": "quay.io/ns/etcd@sha256:1"}"#,
            ))
        });
        let opm = OpmContext::default_for(&harness.state.settings);

        opm_registry_add_fbc_fragment(
            &harness.state,
            &opm,
            9,
            dir.path(),
            "quay.io/ns/index@sha256:abc",
            "quay.io/ns/opm:1",
            "quay.io/ns/fragment@sha256:def",
            None,
        )
        .await
        .unwrap();

        let configs = dir.path().join("configs");
        assert_eq!(fs::read_to_string(configs.join("etcd/catalog.json")).unwrap(), "new");
        assert!(!configs.join("etcd/old.json").exists());
        assert!(configs.join("prometheus").is_dir());
        assert_eq!(harness.runner.count("registry rm --database"), 1);
        assert!(harness
            .runner
            .calls()
            .iter()
            .any(|c| c.contains("--packages etcd")));
        assert!(dir.path().join("index.Dockerfile").exists());
        assert_eq!(
            harness.tracker.reasons(9),
            vec![
                "Extracting operator package from fbc_fragment".to_string(),
                "Adding fbc_fragment to from_index".to_string(),
            ]
        );
    }
}
