// Merging the bundles of an older (N) index image into a newer (N+1) one

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::api::RequestState;
use crate::error::{IibError, Result};
use crate::opm::index::{get_present_bundles, BundleImage, TEMP_INDEX_DB_PATH};
use crate::opm::operations::{
    deprecate_bundles, deprecate_bundles_fbc, opm_generate_dockerfile, opm_index_add, opm_migrate,
    opm_registry_add_fbc, AddBundles, INDEX_DOCKERFILE,
};
use crate::opm::{compare_versions, OpmContext, INDEX_VERSION_LABEL};
use crate::registry::auth::RegistryTokenGuard;
use crate::registry::digest_hex;
use crate::registry::podman::{build_image, cleanup, external_arch_pull_spec, push_image};
use crate::registry::skopeo::{get_image_label, get_resolved_bundles, is_image_fbc};
use crate::state::WorkerState;
use crate::tasks::build::{
    add_label_to_index, build_and_push_arches, create_manifest_list, update_index_image_pull_spec,
    PullSpecUpdate,
};
use crate::tasks::prebuild::{
    prepare_merge_request_for_build, update_index_image_build_state, validate_overwrite_params,
    DISTRIBUTION_SCOPE_LABEL,
};

pub const OCP_VERSIONS_LABEL: &str = "com.redhat.openshift.versions";

#[derive(Debug, Clone, Deserialize)]
pub struct MergeRequest {
    pub request_id: u64,
    pub source_from_index: String,
    #[serde(default)]
    pub deprecation_list: Vec<String>,
    pub binary_image: String,
    #[serde(default)]
    pub target_index: Option<String>,
    #[serde(default)]
    pub overwrite_target_index: bool,
    #[serde(default)]
    pub overwrite_target_index_token: Option<String>,
    #[serde(default)]
    pub distribution_scope: Option<String>,
    #[serde(default)]
    pub build_tags: Vec<String>,
}

fn parse_version(version: &str) -> Option<String> {
    let version = version.trim().replace('v', "");
    let numeric = !version.is_empty()
        && version
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit()));
    numeric.then_some(version)
}

/// Whether an `com.redhat.openshift.versions` label value admits `ocp_version`
///
/// `=v4.6` matches only that version, `v4.5-v4.7` is an inclusive range, for
/// `v4.5,v4.6` the first entry is the minimum and `v4.5` alone is a minimum.
/// `None` means the label could not be parsed.
fn label_admits(label: &str, ocp_version: &str) -> Option<bool> {
    let at_most = |v: &str| parse_version(v).map(|v| compare_versions(&v, ocp_version) != Ordering::Greater);

    if let Some(exact) = label.strip_prefix('=') {
        return parse_version(exact).map(|v| compare_versions(&v, ocp_version) == Ordering::Equal);
    }
    if let Some((min, max)) = label.split_once('-') {
        let max = parse_version(max)?;
        return Some(at_most(min)? && compare_versions(ocp_version, &max) != Ordering::Greater);
    }
    if label.contains(',') {
        return label.split(',').next().and_then(at_most);
    }
    at_most(label)
}

/// Check the bundle's supported OCP versions against the index's version
pub async fn is_bundle_version_valid(
    state: &WorkerState,
    bundle_path: &str,
    valid_ocp_version: &str,
) -> Result<bool> {
    let ocp_version = parse_version(valid_ocp_version).ok_or_else(|| {
        IibError::iib(format!(
            "Invalid OCP version, \"{}\", specified in Index Image",
            valid_ocp_version
        ))
    })?;

    let label = get_image_label(state, bundle_path, OCP_VERSIONS_LABEL).await?;
    debug!(
        "Bundle version {:?}, Index image version {}",
        label, valid_ocp_version
    );
    match label.as_deref().and_then(|l| label_admits(l, &ocp_version)) {
        Some(valid) => Ok(valid),
        None => {
            warn!(
                "Bundle {} has an invalid `{}` label value set: {:?}",
                bundle_path, OCP_VERSIONS_LABEL, label
            );
            Ok(false)
        }
    }
}

/// The present bundles from `bundles` that are listed in `deprecation_list`
pub async fn get_bundles_from_deprecation_list(
    state: &WorkerState,
    bundles: &[String],
    deprecation_list: &[String],
) -> Result<Vec<String>> {
    if deprecation_list.is_empty() {
        return Ok(Vec::new());
    }
    let resolved = get_resolved_bundles(state, deprecation_list).await?;
    let deprecate: Vec<String> = bundles
        .iter()
        .filter(|bundle| resolved.contains(bundle))
        .cloned()
        .collect();
    for bundle in resolved.iter().filter(|b| !bundles.contains(b)) {
        warn!(
            "Bundle {} in the deprecation list is not present in the index image and will be ignored",
            bundle
        );
    }
    info!("Bundles that will be deprecated from the index image: {:?}", deprecate);
    Ok(deprecate)
}

/// Reduce `bundles` to the newest one of each package
///
/// Deprecating the newest bundle of a package truncates every older one, and
/// opm fails on bundles an earlier truncation already removed. Bundles unknown
/// to `all_bundles` are kept as they are.
pub(crate) fn get_bundles_latest_version(bundles: &[String], all_bundles: &[BundleImage]) -> Vec<String> {
    let mut latest: Vec<&BundleImage> = Vec::new();
    let mut unknown = Vec::new();
    for bundle in bundles {
        let Some(found) = all_bundles.iter().find(|b| &b.bundle_path == bundle) else {
            unknown.push(bundle.clone());
            continue;
        };
        match latest.iter_mut().find(|b| b.package_name == found.package_name) {
            Some(current) if compare_versions(&found.version, &current.version) == Ordering::Greater => {
                *current = found;
            }
            Some(_) => {}
            None => latest.push(found),
        }
    }
    let mut result: Vec<String> = latest.into_iter().map(|b| b.bundle_path.clone()).collect();
    result.extend(unknown);
    debug!("Latest bundles to deprecate: {:?}", result);
    result
}

fn bundle_digest<'a>(bundle: &'a BundleImage, index: &str) -> Result<&'a str> {
    digest_hex(&bundle.bundle_path).ok_or_else(|| {
        IibError::iib(format!(
            "Bundle {} in the {} index image is not defined via digest",
            bundle.bundle_path, index
        ))
    })
}

/// Target bundles that are in the source neither by digest nor by CSV name
pub(crate) fn find_missing_bundles(source: &[BundleImage], target: &[BundleImage]) -> Result<Vec<BundleImage>> {
    let mut source_digests = BTreeSet::new();
    let mut source_csv_names = BTreeSet::new();
    for bundle in source {
        source_digests.insert(bundle_digest(bundle, "source")?);
        source_csv_names.insert(bundle.csv_name.as_str());
    }

    let mut missing = Vec::new();
    for bundle in target {
        let digest = bundle_digest(bundle, "target")?;
        if !source_digests.contains(digest) && !source_csv_names.contains(bundle.csv_name.as_str()) {
            missing.push(bundle.clone());
        }
    }
    Ok(missing)
}

/// Validate bundle version labels with at most `iib_merge_validation_threads` in flight
pub(crate) async fn find_invalid_bundles<'a>(
    state: &WorkerState,
    bundles: impl Iterator<Item = &'a BundleImage>,
    ocp_version: &str,
) -> Result<Vec<BundleImage>> {
    let checked: Vec<Result<(BundleImage, bool)>> = stream::iter(bundles)
        .map(|bundle| async move {
            let valid = is_bundle_version_valid(state, &bundle.bundle_path, ocp_version).await?;
            Ok((bundle.clone(), valid))
        })
        .buffered(state.settings.iib_merge_validation_threads.max(1))
        .collect()
        .await;

    let mut invalid = Vec::new();
    for result in checked {
        let (bundle, valid) = result?;
        if !valid {
            invalid.push(bundle);
        }
    }
    Ok(invalid)
}

/// Inputs of the intermediate index build
struct MissingBundlesBuild<'a> {
    request_id: u64,
    base_dir: &'a Path,
    binary_image: &'a str,
    source_from_index: &'a str,
    source_fbc: bool,
    arch: &'a str,
    ocp_version: &'a str,
    distribution_scope: Option<&'a str>,
    overwrite_target_index_token: Option<&'a str>,
}

/// Add the target-only bundles to the source index and push it for one arch
///
/// Returns the bundles that were added and the bundles of the new index whose
/// version label excludes the target OCP version.
async fn add_bundles_missing_in_source(
    state: &WorkerState,
    opm: &OpmContext,
    source_bundles: &[BundleImage],
    target_bundles: &[BundleImage],
    build: &MissingBundlesBuild<'_>,
) -> Result<(Vec<BundleImage>, Vec<BundleImage>)> {
    state
        .tracker()
        .set_request_state(
            build.request_id,
            RequestState::InProgress,
            "Adding bundles missing in source index image",
        )
        .await?;
    info!("Adding bundles from target index image which are missing from source index image");

    let missing = find_missing_bundles(source_bundles, target_bundles)?;
    let invalid = find_invalid_bundles(
        state,
        missing.iter().chain(source_bundles.iter()),
        build.ocp_version,
    )
    .await?;
    if !invalid.is_empty() {
        info!(
            "{} bundles have invalid version label and will be deprecated.",
            invalid.len()
        );
    }

    let missing_paths: Vec<String> = missing.iter().map(|b| b.bundle_path.clone()).collect();
    let params = AddBundles {
        bundles: &missing_paths,
        binary_image: build.binary_image,
        from_index: Some(build.source_from_index),
        overwrite_from_index_token: build.overwrite_target_index_token,
        container_tool: Some("podman"),
        ..Default::default()
    };
    if build.source_fbc {
        opm_registry_add_fbc(state, opm, build.base_dir, &params).await?;
    } else {
        opm_index_add(state, opm, build.base_dir, &params).await?;
    }

    add_label_to_index(INDEX_VERSION_LABEL, build.ocp_version, build.base_dir, INDEX_DOCKERFILE)?;
    if let Some(scope) = build.distribution_scope {
        add_label_to_index(DISTRIBUTION_SCOPE_LABEL, scope, build.base_dir, INDEX_DOCKERFILE)?;
    }
    build_image(state, build.base_dir, INDEX_DOCKERFILE, build.request_id, build.arch).await?;
    push_image(state, build.request_id, build.arch).await?;
    info!("New index image created");

    Ok((missing, invalid))
}

/// Build an index from `source_from_index` with the bundles only `target_index` has,
/// deprecating the listed and the version-incompatible bundles
pub async fn handle_merge_request(state: &WorkerState, request: &MergeRequest) -> Result<()> {
    let request_id = request.request_id;
    let token = request.overwrite_target_index_token.as_deref();
    validate_overwrite_params(request.overwrite_target_index, token)?;

    cleanup(state).await?;
    let prebuild_info = prepare_merge_request_for_build(
        state,
        request_id,
        &request.binary_image,
        &request.source_from_index,
        request.target_index.as_deref(),
        token,
        request.distribution_scope.as_deref(),
    )
    .await?;
    update_index_image_build_state(state, request_id, &prebuild_info).await?;
    let source_resolved = prebuild_info.source_from_index_resolved.as_str();
    let target_resolved = prebuild_info.target_index_resolved.as_deref();
    let binary_image = prebuild_info.base.binary_image_resolved.as_str();
    let arches = &prebuild_info.base.arches;
    let opm = OpmContext::for_index(state, target_resolved.or(Some(source_resolved))).await?;
    let tracker = state.tracker();

    {
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("iib-{}-", request_id))
            .tempdir()?;
        let base_dir = temp_dir.path();

        let source_fbc = is_image_fbc(state, source_resolved).await?;
        let target_fbc = match target_resolved {
            Some(target) => is_image_fbc(state, target).await?,
            None => false,
        };
        if source_fbc {
            info!("Processing source index image as File-Based Catalog image");
        }
        if target_fbc {
            info!("Processing target index image as File-Based Catalog image");
        }
        if source_fbc && !target_fbc {
            let msg = "Cannot merge source File-Based Catalog index image into target SQLite index image.";
            error!("{}", msg);
            return Err(IibError::iib(msg));
        }

        tracker
            .set_request_state(
                request_id,
                RequestState::InProgress,
                "Getting bundles present in the index images",
            )
            .await?;
        let (source_bundles, target_bundles) = {
            let _guard = RegistryTokenGuard::set(&state.settings, token, Some(&request.source_from_index))?;
            info!("Getting bundles present in the source index image");
            let source_bundles = get_present_bundles(state, &opm, source_resolved, base_dir).await?;
            let target_bundles = match target_resolved {
                Some(target) => {
                    info!("Getting bundles present in the target index image");
                    get_present_bundles(state, &opm, target, base_dir).await?
                }
                None => Vec::new(),
            };
            (source_bundles, target_bundles)
        };

        let Some(arch) = arches.iter().next() else {
            return Err(IibError::iib("No arches were provided to build the index image"));
        };
        let (missing, invalid) = add_bundles_missing_in_source(
            state,
            &opm,
            &source_bundles,
            &target_bundles,
            &MissingBundlesBuild {
                request_id,
                base_dir,
                binary_image,
                source_from_index: source_resolved,
                source_fbc,
                arch,
                ocp_version: &prebuild_info.target_ocp_version,
                distribution_scope: prebuild_info.base.distribution_scope.as_deref(),
                overwrite_target_index_token: token,
            },
        )
        .await?;

        tracker
            .set_request_state(
                request_id,
                RequestState::InProgress,
                "Deprecating bundles in the deprecation list",
            )
            .await?;
        info!("Deprecating bundles in the deprecation list");
        let intermediate_bundles: Vec<String> = missing
            .iter()
            .chain(source_bundles.iter())
            .map(|b| b.bundle_path.clone())
            .collect();
        let mut deprecation_bundles =
            get_bundles_from_deprecation_list(state, &intermediate_bundles, &request.deprecation_list).await?;
        // Invalid bundles are known to be in the new index
        for bundle in invalid {
            if !deprecation_bundles.contains(&bundle.bundle_path) {
                deprecation_bundles.push(bundle.bundle_path);
            }
        }

        if !deprecation_bundles.is_empty() {
            // Built from the source index, so it has the same catalog type
            let intermediate_image = external_arch_pull_spec(state, request_id, arch);
            if source_fbc {
                deprecate_bundles_fbc(state, &opm, &deprecation_bundles, base_dir, binary_image, &intermediate_image)
                    .await?;
            } else {
                // opm deprecates only from an index image in a registry
                build_image(state, base_dir, INDEX_DOCKERFILE, request_id, arch).await?;
                push_image(state, request_id, arch).await?;
                deprecate_bundles(
                    state,
                    &opm,
                    &deprecation_bundles,
                    base_dir,
                    binary_image,
                    &intermediate_image,
                    token,
                )
                .await?;
            }
        }

        if target_fbc {
            let index_db = base_dir.join(TEMP_INDEX_DB_PATH);
            let (fbc_dir, _) = opm_migrate(state, &opm, &index_db, base_dir, true).await?;
            if !source_fbc {
                let dockerfile = base_dir.join(INDEX_DOCKERFILE);
                if dockerfile.is_file() {
                    info!("Removing previously generated dockerfile.");
                    fs::remove_file(&dockerfile)?;
                }
                opm_generate_dockerfile(
                    state,
                    &opm,
                    &fbc_dir,
                    base_dir,
                    &index_db,
                    binary_image,
                    Some(INDEX_DOCKERFILE),
                )
                .await?;
            }
        }

        add_label_to_index(
            INDEX_VERSION_LABEL,
            &prebuild_info.target_ocp_version,
            base_dir,
            INDEX_DOCKERFILE,
        )?;
        if let Some(scope) = &prebuild_info.base.distribution_scope {
            add_label_to_index(DISTRIBUTION_SCOPE_LABEL, scope, base_dir, INDEX_DOCKERFILE)?;
        }
        build_and_push_arches(state, base_dir, INDEX_DOCKERFILE, request_id, arches).await?;
    }

    let output_pull_spec = create_manifest_list(state, request_id, arches, &request.build_tags).await?;
    update_index_image_pull_spec(
        state,
        request_id,
        &PullSpecUpdate {
            output_pull_spec: &output_pull_spec,
            arches,
            from_index: request.target_index.as_deref(),
            overwrite_from_index: request.overwrite_target_index,
            overwrite_from_index_token: token,
        },
    )
    .await?;
    tracker
        .set_request_state(
            request_id,
            RequestState::Complete,
            "The index image was successfully cleaned and updated.",
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRunner, TestHarness};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tempfile::TempDir;

    fn bundle(path: &str, csv: &str) -> BundleImage {
        BundleImage {
            bundle_path: path.to_string(),
            package_name: "pkg".to_string(),
            csv_name: csv.to_string(),
            version: String::new(),
            channel_name: String::new(),
        }
    }

    #[test]
    fn test_get_bundles_latest_version() {
        let versioned = |path: &str, package: &str, version: &str| BundleImage {
            package_name: package.to_string(),
            version: version.to_string(),
            ..bundle(path, "")
        };
        let all = vec![
            versioned("quay.io/ns/etcd@sha256:1", "etcd", "0.9.2"),
            versioned("quay.io/ns/etcd@sha256:2", "etcd", "0.9.10"),
            versioned("quay.io/ns/etcd@sha256:3", "etcd", "0.9.4"),
            versioned("quay.io/ns/kiali@sha256:1", "kiali", "1.2.0"),
        ];
        let requested: Vec<String> = [
            "quay.io/ns/etcd@sha256:1",
            "quay.io/ns/etcd@sha256:2",
            "quay.io/ns/etcd@sha256:3",
            "quay.io/ns/kiali@sha256:1",
            "quay.io/ns/unknown@sha256:9",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        assert_eq!(
            get_bundles_latest_version(&requested, &all),
            vec![
                "quay.io/ns/etcd@sha256:2",
                "quay.io/ns/kiali@sha256:1",
                "quay.io/ns/unknown@sha256:9",
            ]
        );
    }

    #[test]
    fn test_label_admits() {
        // rows: ocp version, columns: label
        let labels = ["v4.5", "=v4.6", "v4.5-v4.7", "v4.5,v4.6", "v4.6,v4.5"];
        let expected = [
            ("4.5", [true, false, true, true, false]),
            ("4.6", [true, true, true, true, true]),
            ("4.7", [true, false, true, true, true]),
            ("4.8", [true, false, false, true, true]),
        ];
        for (ocp, row) in expected {
            for (label, admitted) in labels.iter().zip(row) {
                assert_eq!(label_admits(label, ocp), Some(admitted), "{} against {}", label, ocp);
            }
        }
        assert_eq!(label_admits("v4.9", "4.10"), Some(true));
        assert_eq!(label_admits("latest", "4.10"), None);
        assert_eq!(label_admits("v4.5-", "4.10"), None);
    }

    #[tokio::test]
    async fn test_is_bundle_version_valid() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.fake_image("quay.io/ns/ranged:1", "amd64", json!({OCP_VERSIONS_LABEL: "v4.10-v4.12"}));
        harness.fake_image("quay.io/ns/unlabeled:1", "amd64", json!({}));
        let state = &harness.state;

        assert!(is_bundle_version_valid(state, "quay.io/ns/ranged:1", "v4.11").await.unwrap());
        assert!(!is_bundle_version_valid(state, "quay.io/ns/ranged:1", "v4.13").await.unwrap());
        assert!(!is_bundle_version_valid(state, "quay.io/ns/unlabeled:1", "v4.11").await.unwrap());

        let err = is_bundle_version_valid(state, "quay.io/ns/ranged:1", "vX.Y").await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid OCP version, \"vX.Y\", specified in Index Image");
    }

    #[test]
    fn test_find_missing_bundles() {
        let source = vec![
            bundle("quay.io/ns/a@sha256:aaa", "a.v1"),
            bundle("quay.io/ns/b@sha256:bbb", "b.v1"),
        ];
        let target = vec![
            bundle("registry.other/a@sha256:aaa", "a.v1-rebuilt"),
            bundle("quay.io/ns/b@sha256:fff", "b.v1"),
            bundle("quay.io/ns/c@sha256:ccc", "c.v1"),
        ];
        let missing = find_missing_bundles(&source, &target).unwrap();
        assert_eq!(missing, vec![bundle("quay.io/ns/c@sha256:ccc", "c.v1")]);

        let err = find_missing_bundles(&[bundle("quay.io/ns/a:1", "a.v1")], &target).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Bundle quay.io/ns/a:1 in the source index image is not defined via digest"
        );
        let err = find_missing_bundles(&source, &[bundle("quay.io/ns/c:1", "c.v1")]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Bundle quay.io/ns/c:1 in the target index image is not defined via digest"
        );
    }

    fn merge_request(request_id: u64) -> MergeRequest {
        serde_json::from_value(json!({
            "request_id": request_id,
            "source_from_index": "quay.io/ns/source-index:v4.12",
            "target_index": "quay.io/ns/target-index:v4.13",
            "binary_image": "quay.io/ns/opm:v4.13",
            "deprecation_list": ["quay.io/ns/old-bundle:1"],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_fbc_source_into_sqlite_target_fails() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.tracker.create(20);
        harness.fake_image("quay.io/ns/opm:v4.13", "amd64", json!({}));
        harness.fake_image(
            "quay.io/ns/source-index:v4.12",
            "amd64",
            json!({"operators.operatorframework.io.index.configs.v1": "/configs"}),
        );
        harness.fake_image("quay.io/ns/target-index:v4.13", "amd64", json!({}));

        let err = handle_merge_request(&harness.state, &merge_request(20)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot merge source File-Based Catalog index image into target SQLite index image."
        );
        assert_eq!(harness.runner.count("grpcurl"), 0);
    }

    #[tokio::test]
    async fn test_merge_sqlite_indexes() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.tracker.create(21);
        let db_label = json!("/database/index.db");
        harness.fake_image("quay.io/ns/opm:v4.13", "amd64", json!({}));
        harness.fake_image(
            "quay.io/ns/source-index:v4.12",
            "amd64",
            json!({INDEX_VERSION_LABEL: "v4.12", "operators.operatorframework.io.index.database.v1": db_label}),
        );
        harness.fake_image(
            "quay.io/ns/target-index:v4.13",
            "amd64",
            json!({INDEX_VERSION_LABEL: "v4.13", "operators.operatorframework.io.index.database.v1": db_label}),
        );
        harness.fake_image("quay.io/ns/etcd-bundle:1", "amd64", json!({OCP_VERSIONS_LABEL: "v4.12"}));
        harness.fake_image("quay.io/ns/old-bundle:1", "amd64", json!({OCP_VERSIONS_LABEL: "v4.10"}));
        harness.fake_image("quay.io/ns/legacy-bundle:1", "amd64", json!({OCP_VERSIONS_LABEL: "=v4.11"}));
        harness.fake_image("quay.io/ns/new-bundle:1", "amd64", json!({OCP_VERSIONS_LABEL: "v4.12-v4.14"}));
        harness.fake_index_build();
        harness.runner.on("podman create", |_| Ok(FakeRunner::ok("ctr\n")));
        harness
            .runner
            .on("opm version", |_| Ok(FakeRunner::ok(r#"OpmVersion:"v1.26.0""#)));
        harness
            .runner
            .on("list api.Registry", |_| Ok(FakeRunner::ok("api.Registry.ListBundles\n")));

        let old_bundle = get_resolved_bundles(&harness.state, &["quay.io/ns/old-bundle:1".to_string()])
            .await
            .unwrap()
            .remove(0);
        let entry = |path: &str, csv: &str| json!({"packageName": "pkg", "bundlePath": path, "csvName": csv}).to_string();
        let source_listing = [
            entry("quay.io/ns/etcd-bundle@sha256:aaa", "etcd.v1"),
            entry(&old_bundle, "old.v1"),
            entry("quay.io/ns/legacy-bundle@sha256:ccc", "legacy.v1"),
        ]
        .join("\n");
        let target_listing = [
            entry("quay.io/ns/etcd-bundle@sha256:aaa", "etcd.v1"),
            entry("quay.io/ns/new-bundle@sha256:bbb", "new.v1"),
        ]
        .join("\n");
        let listings = AtomicUsize::new(0);
        harness.runner.on("api.Registry/ListBundles", move |_| {
            let output = match listings.fetch_add(1, AtomicOrdering::SeqCst) {
                0 => &source_listing,
                _ => &target_listing,
            };
            Ok(FakeRunner::ok(output))
        });

        handle_merge_request(&harness.state, &merge_request(21)).await.unwrap();

        let calls = harness.runner.calls();
        let add = calls.iter().find(|c| c.starts_with("opm index add")).unwrap();
        assert!(add.contains("--bundles quay.io/ns/new-bundle@sha256:bbb --binary-image"));
        assert!(add.contains("--container-tool podman"));
        assert!(add.contains("--from-index quay.io/ns/source-index@sha256:"));

        let deprecate = calls
            .iter()
            .find(|c| c.starts_with("opm index deprecatetruncate"))
            .unwrap();
        assert!(deprecate.contains("--from-index registry.test/iib-build:21-amd64"));
        assert!(deprecate.contains(&format!(
            "--bundles {},quay.io/ns/legacy-bundle@sha256:ccc --allow-package-removal",
            old_bundle
        )));
        assert_eq!(harness.runner.count("buildah bud"), 3);

        assert_eq!(
            harness.tracker.reasons(21),
            vec![
                "Resolving the container images",
                "Building the index image for the following arches: amd64",
                "Getting bundles present in the index images",
                "Adding bundles missing in source index image",
                "Deprecating bundles in the deprecation list",
                "Creating the manifest list",
                "The index image was successfully cleaned and updated.",
            ]
        );
        let target_resolved = harness.tracker.field(21, "target_index_resolved").unwrap();
        assert!(target_resolved.as_str().unwrap().starts_with("quay.io/ns/target-index@sha256:"));
        assert_eq!(
            harness.tracker.field(21, "index_image"),
            Some(json!("registry.test/iib-build:21"))
        );
    }
}
