// Container registry tooling: skopeo, podman/buildah, manifest-tool and registry credentials

pub mod auth;
pub mod podman;
pub mod skopeo;

pub const MANIFEST_LIST_V2: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Repository part of a pull spec, without tag or digest
///
/// `quay.io/ns/img:1.0` and `quay.io/ns/img@sha256:..` both give `quay.io/ns/img`.
/// A registry port (`host:5000/img`) is not mistaken for a tag.
pub fn image_name(pull_spec: &str) -> &str {
    if let Some((name, _)) = pull_spec.split_once('@') {
        return name;
    }
    match pull_spec.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => name,
        _ => pull_spec,
    }
}

/// Registry host of a pull spec (`quay.io` for `quay.io/ns/img:1`)
///
/// Follows the Docker convention: the first path segment is a registry only if it
/// looks like a host name, otherwise the image lives on `docker.io`.
pub fn registry_of(pull_spec: &str) -> &str {
    let spec = pull_spec.strip_prefix("docker://").unwrap_or(pull_spec);
    match spec.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => {
            first
        }
        _ => "docker.io",
    }
}

pub fn is_digest_pinned(pull_spec: &str) -> bool {
    pull_spec.contains("@sha256:")
}

/// Digest part of a pinned pull spec, without the `sha256:` prefix
pub fn digest_hex(pull_spec: &str) -> Option<&str> {
    pull_spec.split_once("@sha256:").map(|(_, hex)| hex)
}

/// Prefix `docker://` unless a transport is already present
pub fn with_transport(pull_spec: &str) -> String {
    if pull_spec.starts_with("docker://") {
        pull_spec.to_string()
    } else {
        format!("docker://{}", pull_spec)
    }
}
