use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::info;

use crate::api::RequestState;
use crate::error::Result;
use crate::opm::index::get_present_operators;
use crate::opm::operations::{opm_create_empty_fbc, opm_index_rm, INDEX_DOCKERFILE};
use crate::opm::{OpmContext, INDEX_VERSION_LABEL};
use crate::registry::podman::cleanup;
use crate::registry::skopeo::is_image_fbc;
use crate::state::WorkerState;
use crate::tasks::build::{
    add_label_to_index, build_and_push_arches, create_manifest_list, update_index_image_pull_spec,
    PullSpecUpdate,
};
use crate::tasks::prebuild::{
    prepare_request_for_build, update_index_image_build_state, PrebuildRequest, DISTRIBUTION_SCOPE_LABEL,
};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEmptyIndexRequest {
    pub request_id: u64,
    pub from_index: String,
    pub binary_image: String,
    /// Extra labels for the new index; they override the ones IIB sets
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Build an index image with every operator package of `from_index` removed
pub async fn handle_create_empty_index_request(
    state: &WorkerState,
    request: &CreateEmptyIndexRequest,
) -> Result<()> {
    let request_id = request.request_id;
    cleanup(state).await?;
    let prebuild_info = prepare_request_for_build(
        state,
        request_id,
        &PrebuildRequest {
            binary_image: &request.binary_image,
            from_index: Some(&request.from_index),
            ..Default::default()
        },
    )
    .await?;
    update_index_image_build_state(state, request_id, &prebuild_info).await?;
    let from_index_resolved = prebuild_info
        .from_index_resolved
        .clone()
        .unwrap_or_else(|| request.from_index.clone());
    let opm = OpmContext::for_index(state, Some(&from_index_resolved)).await?;
    let tracker = state.tracker();

    {
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("iib-{}-", request_id))
            .tempdir()?;

        tracker
            .set_request_state(
                request_id,
                RequestState::InProgress,
                "Checking operators present in index image",
            )
            .await?;
        let operators = get_present_operators(state, &opm, &from_index_resolved, temp_dir.path()).await?;
        info!("Removing the operators {} from {}", operators.join(", "), request.from_index);

        if is_image_fbc(state, &from_index_resolved).await? {
            opm_create_empty_fbc(
                state,
                &opm,
                request_id,
                temp_dir.path(),
                &from_index_resolved,
                &request.from_index,
                &prebuild_info.binary_image_resolved,
                &operators,
            )
            .await?;
        } else {
            tracker
                .set_request_state(request_id, RequestState::InProgress, "Removing operators from index image")
                .await?;
            opm_index_rm(
                state,
                &opm,
                temp_dir.path(),
                &operators,
                &prebuild_info.binary_image_resolved,
                &from_index_resolved,
                None,
                None,
            )
            .await?;
        }

        tracker
            .set_request_state(
                request_id,
                RequestState::InProgress,
                "Getting and updating labels for new index image",
            )
            .await?;
        let mut labels = BTreeMap::from([(INDEX_VERSION_LABEL.to_string(), prebuild_info.ocp_version.clone())]);
        if let Some(scope) = &prebuild_info.distribution_scope {
            labels.insert(DISTRIBUTION_SCOPE_LABEL.to_string(), scope.clone());
        }
        labels.extend(request.labels.clone());
        for (label, value) in &labels {
            add_label_to_index(label, value, temp_dir.path(), INDEX_DOCKERFILE)?;
        }

        build_and_push_arches(
            state,
            temp_dir.path(),
            INDEX_DOCKERFILE,
            request_id,
            &prebuild_info.arches,
        )
        .await?;
    }

    let output_pull_spec = create_manifest_list(state, request_id, &prebuild_info.arches, &[]).await?;
    update_index_image_pull_spec(
        state,
        request_id,
        &PullSpecUpdate {
            output_pull_spec: &output_pull_spec,
            arches: &prebuild_info.arches,
            from_index: Some(&request.from_index),
            overwrite_from_index: false,
            overwrite_from_index_token: None,
        },
    )
    .await?;
    tracker
        .set_request_state(
            request_id,
            RequestState::Complete,
            "The empty index image was successfully created",
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opm::operations::test_support::fake_opm_filesystem;
    use crate::testing::{FakeRunner, TestHarness};
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    const PACKAGES: &str = "{\n  \"name\": \"etcd\"\n}\n{\n  \"name\": \"prometheus\"\n}\n";

    fn setup(harness: &TestHarness, index_labels: serde_json::Value) -> Arc<Mutex<String>> {
        harness.fake_image("quay.io/ns/opm:v4.12", "amd64", json!({}));
        harness.fake_image("quay.io/ns/index:v4.12", "amd64", index_labels);
        harness.fake_index_build();
        harness.runner.on("podman create", |_| Ok(FakeRunner::ok("ctr\n")));
        harness
            .runner
            .on("list api.Registry", |_| Ok(FakeRunner::ok("api.Registry.ListPackages\n")));
        harness
            .runner
            .on("api.Registry/ListPackages", |_| Ok(FakeRunner::ok(PACKAGES)));

        let built = Arc::new(Mutex::new(String::new()));
        let dockerfile = built.clone();
        harness.runner.on("buildah bud", move |spec| {
            let path = spec.args.last().unwrap();
            *dockerfile.lock().unwrap() = std::fs::read_to_string(path).unwrap();
            Ok(FakeRunner::ok(""))
        });
        built
    }

    fn request(request_id: u64) -> CreateEmptyIndexRequest {
        serde_json::from_value(json!({
            "request_id": request_id,
            "from_index": "quay.io/ns/index:v4.12",
            "binary_image": "quay.io/ns/opm:v4.12",
            "labels": {"com.redhat.index.delivery.version": "v4.12-empty", "vendor": "acme"},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_empty_sqlite_index() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.tracker.create(40);
        let dockerfile = setup(
            &harness,
            json!({
                INDEX_VERSION_LABEL: "v4.12",
                "operators.operatorframework.io.index.database.v1": "/database/index.db",
            }),
        );
        harness
            .runner
            .on("opm version", |_| Ok(FakeRunner::ok(r#"OpmVersion:"v1.26.0""#)));

        handle_create_empty_index_request(&harness.state, &request(40)).await.unwrap();

        let calls = harness.runner.calls();
        let rm = calls.iter().find(|c| c.starts_with("opm index rm")).unwrap();
        assert!(rm.contains("--operators etcd,prometheus"));

        let dockerfile = dockerfile.lock().unwrap().clone();
        assert!(dockerfile.contains("LABEL com.redhat.index.delivery.version=\"v4.12-empty\""));
        assert!(dockerfile.contains("LABEL vendor=\"acme\""));
        assert!(!dockerfile.contains("version=\"v4.12\""));

        assert_eq!(
            harness.tracker.reasons(40),
            vec![
                "Resolving the container images",
                "Building the index image for the following arches: amd64",
                "Checking operators present in index image",
                "Removing operators from index image",
                "Getting and updating labels for new index image",
                "Creating the manifest list",
                "The empty index image was successfully created",
            ]
        );
        assert_eq!(
            harness.tracker.field(40, "index_image"),
            Some(json!("registry.test/iib-build:40"))
        );
    }

    #[tokio::test]
    async fn test_create_empty_fbc_index() {
        let dir = TempDir::new().unwrap();
        let harness = TestHarness::new(dir.path());
        harness.tracker.create(41);
        let dockerfile = setup(
            &harness,
            json!({
                INDEX_VERSION_LABEL: "v4.14",
                "operators.operatorframework.io.index.configs.v1": "/configs",
            }),
        );
        fake_opm_filesystem(&harness);

        handle_create_empty_index_request(&harness.state, &request(41)).await.unwrap();

        assert_eq!(harness.runner.count("opm index rm"), 0);
        let calls = harness.runner.calls();
        let rm = calls.iter().find(|c| c.starts_with("opm registry rm")).unwrap();
        assert!(rm.ends_with("--packages etcd,prometheus"));
        assert_eq!(harness.runner.count("podman cp ctr:/var/lib/iib/_hidden/do.not.edit.db"), 1);

        let dockerfile = dockerfile.lock().unwrap().clone();
        assert!(dockerfile.contains("COPY --chown=1001:0 cache /tmp/cache"));
        assert!(dockerfile.contains("LABEL vendor=\"acme\""));
        assert_eq!(harness.tracker.state(41), Some(RequestState::Complete));
    }
}
