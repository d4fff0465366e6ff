use config::{Config, ConfigError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static::lazy_static! {
    static ref ENV_VAR_PATTERN: regex::Regex =
        regex::Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
}

/// Worker configuration
///
/// Loaded from `{IIB_CONFIG_DIR}/default.*`, then the run-mode file, then `local.*`.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Base URL of the request-tracking API, e.g. `https://iib.example.com/api/v1/`
    pub iib_api_url: String,
    /// Registry the built images are pushed to
    pub iib_registry: String,

    #[serde(default = "default_api_timeout")]
    pub iib_api_timeout: u64,

    #[serde(default = "default_total_attempts")]
    pub iib_total_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub iib_retry_delay: u64,
    #[serde(default = "default_retry_jitter")]
    pub iib_retry_jitter: u64,
    #[serde(default = "default_retry_multiplier")]
    pub iib_retry_multiplier: u32,

    #[serde(default = "default_grpc_init_wait_time")]
    pub iib_grpc_init_wait_time: u64,
    #[serde(default = "default_grpc_max_tries")]
    pub iib_grpc_max_tries: u32,
    /// Seconds between liveness/readiness checks of a served catalog
    #[serde(default = "default_grpc_poll_interval")]
    pub iib_grpc_poll_interval: u64,

    /// Port range per purpose, `[start, end)`
    #[serde(default = "default_opm_port_ranges")]
    pub iib_opm_port_ranges: BTreeMap<String, (u16, u16)>,
    #[serde(default = "default_pprof_min_version")]
    pub iib_opm_pprof_lock_required_min_version: String,
    /// Directory holding the port lock files, defaults to the system temp dir
    #[serde(default)]
    pub iib_port_lock_dir: Option<PathBuf>,

    #[serde(default = "default_skopeo_timeout")]
    pub iib_skopeo_timeout: String,
    #[serde(default = "default_image_push_template")]
    pub iib_image_push_template: String,
    #[serde(default)]
    pub iib_index_image_output_registry: Option<String>,
    #[serde(default)]
    pub iib_required_labels: BTreeMap<String, String>,
    /// Greenwave API base URL; gated add requests fail when unset
    #[serde(default)]
    pub iib_greenwave_url: Option<String>,

    #[serde(default = "default_docker_config_template")]
    pub iib_docker_config_template: PathBuf,
    #[serde(default = "default_docker_config")]
    pub iib_docker_config: PathBuf,

    #[serde(default)]
    pub iib_request_logs_dir: Option<PathBuf>,

    /// OCP version (`v4.15`) to opm binary name
    #[serde(default)]
    pub iib_ocp_opm_mapping: BTreeMap<String, String>,
    #[serde(default = "default_opm")]
    pub iib_default_opm: String,

    /// Git repository URL to `token_name:token_value`
    #[serde(default)]
    pub iib_index_configs_gitlab_tokens_map: BTreeMap<String, String>,

    #[serde(default = "default_konflux_namespace")]
    pub iib_konflux_namespace: String,
    #[serde(default = "default_konflux_pipeline_timeout")]
    pub iib_konflux_pipeline_timeout: u64,
    #[serde(default = "default_konflux_poll_interval")]
    pub iib_konflux_poll_interval: u64,

    #[serde(default)]
    pub iib_index_db_artifact_registry: Option<String>,
    #[serde(default = "default_index_db_artifact_template")]
    pub iib_index_db_artifact_template: String,
    /// Artifact tag suffix of the pre-built empty `index.db`
    #[serde(default = "default_empty_index_db_tag")]
    pub iib_empty_index_db_tag: String,

    #[serde(default = "default_merge_validation_threads")]
    pub iib_merge_validation_threads: usize,

    /// Catalog subdirectory holding per-package deprecation schemas
    #[serde(default = "default_operator_deprecations_dir")]
    pub operator_deprecations_dir: String,
    #[serde(default = "default_max_recursive_related_bundles")]
    pub iib_max_recursive_related_bundles: usize,
    #[serde(default)]
    pub iib_request_recursive_related_bundles_dir: Option<PathBuf>,
}

fn default_api_timeout() -> u64 {
    120
}

fn default_total_attempts() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    10
}

fn default_retry_jitter() -> u64 {
    10
}

fn default_retry_multiplier() -> u32 {
    5
}

fn default_grpc_init_wait_time() -> u64 {
    100
}

fn default_grpc_max_tries() -> u32 {
    5
}

fn default_grpc_poll_interval() -> u64 {
    5
}

fn default_opm_port_ranges() -> BTreeMap<String, (u16, u16)> {
    let mut ranges = BTreeMap::new();
    ranges.insert("opm_port".to_string(), (50051, 50151));
    ranges.insert("opm_pprof_port".to_string(), (50151, 50251));
    ranges
}

fn default_pprof_min_version() -> String {
    "1.29.0".to_string()
}

fn default_skopeo_timeout() -> String {
    "300s".to_string()
}

fn default_image_push_template() -> String {
    "{registry}/iib-build:{request_id}".to_string()
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"))
}

fn default_docker_config_template() -> PathBuf {
    home_dir().join(".docker").join("config.json.template")
}

fn default_docker_config() -> PathBuf {
    home_dir().join(".docker").join("config.json")
}

fn default_opm() -> String {
    "opm".to_string()
}

fn default_konflux_namespace() -> String {
    "iib-tenant".to_string()
}

fn default_konflux_pipeline_timeout() -> u64 {
    1800
}

fn default_konflux_poll_interval() -> u64 {
    30
}

fn default_index_db_artifact_template() -> String {
    "{registry}/index-db:{tag}".to_string()
}

fn default_empty_index_db_tag() -> String {
    "empty".to_string()
}

fn default_merge_validation_threads() -> usize {
    5
}

fn default_operator_deprecations_dir() -> String {
    "operator-deprecations".to_string()
}

fn default_max_recursive_related_bundles() -> usize {
    15
}

impl WorkerSettings {
    /// Substitute environment variables in a string value
    /// Replaces ${VAR_NAME} or ${VAR_NAME:-default} with environment variable values
    fn substitute_env_vars_in_string(s: &str) -> String {
        ENV_VAR_PATTERN
            .replace_all(s, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default_value = caps.get(2).map(|m| m.as_str());

                match env::var(var_name) {
                    Ok(val) => val,
                    Err(_) => default_value.unwrap_or("").to_string(),
                }
            })
            .to_string()
    }

    fn config_value_to_json(value: &config::Value) -> serde_json::Value {
        use config::ValueKind;

        match &value.kind {
            ValueKind::Nil => serde_json::Value::Null,
            ValueKind::Boolean(b) => serde_json::Value::Bool(*b),
            ValueKind::I64(i) => serde_json::Value::Number((*i).into()),
            ValueKind::I128(i) => serde_json::Value::Number((*i as i64).into()),
            ValueKind::U64(u) => serde_json::Value::Number((*u).into()),
            ValueKind::U128(u) => serde_json::Value::Number((*u as u64).into()),
            ValueKind::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueKind::String(s) => {
                serde_json::Value::String(Self::substitute_env_vars_in_string(s))
            }
            ValueKind::Table(table) => {
                let mut map = serde_json::Map::new();
                for (k, v) in table.iter() {
                    map.insert(k.clone(), Self::config_value_to_json(v));
                }
                serde_json::Value::Object(map)
            }
            ValueKind::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(Self::config_value_to_json).collect())
            }
        }
    }

    /// Try to add a config file with multiple extension attempts (.toml, .yaml, .yml)
    fn try_add_config_file(
        builder: &mut config::ConfigBuilder<config::builder::DefaultState>,
        config_dir: &Path,
        name: &str,
        required: bool,
    ) -> Result<bool, ConfigError> {
        for ext in ["toml", "yaml", "yml"] {
            let path = config_dir.join(format!("{}.{}", name, ext));
            if path.exists() {
                tracing::info!("Loading config file: {}", path.display());
                *builder = builder.clone().add_source(config::File::from(path));
                return Ok(true);
            }
        }

        if required {
            Err(ConfigError::Message(format!(
                "Required config file not found: {}/{}.{{toml,yaml,yml}}",
                config_dir.display(),
                name
            )))
        } else {
            tracing::debug!(
                "Optional config file not found: {}/{}.{{toml,yaml,yml}}",
                config_dir.display(),
                name
            );
            Ok(false)
        }
    }

    /// Load settings using `IIB_CONFIG_DIR` (default `config`) and `IIB_CONFIG_RUN_MODE`
    /// (default `production`)
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("IIB_CONFIG_RUN_MODE").unwrap_or_else(|_| "production".into());
        let config_dir = env::var("IIB_CONFIG_DIR").unwrap_or_else(|_| "config".into());
        Self::from_dir(Path::new(&config_dir), &run_mode)
    }

    pub fn from_dir(config_dir: &Path, run_mode: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        Self::try_add_config_file(&mut builder, config_dir, "default", true)?;
        Self::try_add_config_file(&mut builder, config_dir, run_mode, false)?;
        Self::try_add_config_file(&mut builder, config_dir, "local", false)?;

        let config = builder.build()?;
        let root_value = config
            .cache
            .into_table()
            .map_err(|e| ConfigError::Message(format!("Failed to get config table: {}", e)))?;

        let mut json_map = serde_json::Map::new();
        for (k, v) in root_value.iter() {
            json_map.insert(k.clone(), Self::config_value_to_json(v));
        }

        let mut unused_fields = Vec::new();
        let settings: WorkerSettings =
            serde_ignored::deserialize(serde_json::Value::Object(json_map), |path| {
                unused_fields.push(path.to_string());
            })
            .map_err(|e| ConfigError::Message(format!("Failed to deserialize settings: {}", e)))?;

        for field in &unused_fields {
            tracing::warn!("Unknown configuration field in worker config: {}", field);
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Checks that do not touch the host
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iib_api_url.trim().is_empty() {
            return Err(ConfigError::Message(
                "iib_api_url must be set to the URL of the request-tracking API".to_string(),
            ));
        }
        if self.iib_registry.trim().is_empty() {
            return Err(ConfigError::Message(
                "iib_registry must be set to the registry the worker pushes to".to_string(),
            ));
        }
        Self::validate_format_string(
            &self.iib_image_push_template,
            "iib_image_push_template",
            "{request_id}",
        )?;
        Self::validate_format_string(
            &self.iib_index_db_artifact_template,
            "iib_index_db_artifact_template",
            "{tag}",
        )?;

        let mut range_len = None;
        for (purpose, (start, end)) in &self.iib_opm_port_ranges {
            if start >= end {
                return Err(ConfigError::Message(format!(
                    "iib_opm_port_ranges: the range for '{}' is empty ({}..{})",
                    purpose, start, end
                )));
            }
            let len = end - start;
            match range_len {
                None => range_len = Some(len),
                Some(expected) if expected != len => {
                    return Err(ConfigError::Message(
                        "iib_opm_port_ranges: all port ranges must have the same length"
                            .to_string(),
                    ));
                }
                Some(_) => {}
            }
        }

        for (repo, token) in &self.iib_index_configs_gitlab_tokens_map {
            let mut parts = token.splitn(2, ':');
            let name = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default();
            if name.is_empty() || value.is_empty() {
                return Err(ConfigError::Message(format!(
                    "Invalid token format for '{}' in 'iib_index_configs_gitlab_tokens_map'. \
                     Expected 'token_name:token_value'.",
                    repo
                )));
            }
        }

        if self.iib_total_attempts == 0 || self.iib_grpc_max_tries == 0 {
            return Err(ConfigError::Message(
                "iib_total_attempts and iib_grpc_max_tries must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Every opm binary referenced by the configuration must be installed
    pub fn validate_binaries(&self) -> Result<(), ConfigError> {
        let binaries = std::iter::once(&self.iib_default_opm).chain(self.iib_ocp_opm_mapping.values());
        for binary in binaries {
            if find_in_path(binary).is_none() {
                return Err(ConfigError::Message(format!(
                    "{} is not installed",
                    binary
                )));
            }
        }
        Ok(())
    }

    fn validate_format_string(
        format_str: &str,
        field_name: &str,
        required_placeholder: &str,
    ) -> Result<(), ConfigError> {
        if !format_str.contains(required_placeholder) {
            return Err(ConfigError::Message(format!(
                "'{}' must contain '{}' placeholder. Got: '{}'",
                field_name, required_placeholder, format_str
            )));
        }
        Ok(())
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.iib_api_timeout)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.iib_port_lock_dir.clone().unwrap_or_else(env::temp_dir)
    }

    /// Pull spec of the image built for a request (or a build tag)
    pub fn rebuilt_image_pull_spec(&self, request_id: impl std::fmt::Display) -> String {
        self.iib_image_push_template
            .replace("{registry}", &self.iib_registry)
            .replace("{request_id}", &request_id.to_string())
    }

    /// Settings suitable for unit tests: nothing is read from disk
    #[cfg(test)]
    pub fn for_tests(scratch: &Path) -> Self {
        WorkerSettings {
            iib_api_url: "http://iib.test/api/v1/".to_string(),
            iib_registry: "registry.test".to_string(),
            iib_api_timeout: default_api_timeout(),
            iib_total_attempts: 2,
            iib_retry_delay: 0,
            iib_retry_jitter: 0,
            iib_retry_multiplier: 1,
            iib_grpc_init_wait_time: 1,
            iib_grpc_max_tries: 2,
            iib_grpc_poll_interval: 0,
            iib_opm_port_ranges: default_opm_port_ranges(),
            iib_opm_pprof_lock_required_min_version: default_pprof_min_version(),
            iib_port_lock_dir: Some(scratch.join("locks")),
            iib_skopeo_timeout: default_skopeo_timeout(),
            iib_image_push_template: default_image_push_template(),
            iib_index_image_output_registry: None,
            iib_required_labels: BTreeMap::new(),
            iib_greenwave_url: None,
            iib_docker_config_template: scratch.join("config.json.template"),
            iib_docker_config: scratch.join("config.json"),
            iib_request_logs_dir: None,
            iib_ocp_opm_mapping: BTreeMap::new(),
            iib_default_opm: default_opm(),
            iib_index_configs_gitlab_tokens_map: BTreeMap::new(),
            iib_konflux_namespace: default_konflux_namespace(),
            iib_konflux_pipeline_timeout: 1,
            iib_konflux_poll_interval: 0,
            iib_index_db_artifact_registry: Some("artifacts.test".to_string()),
            iib_index_db_artifact_template: default_index_db_artifact_template(),
            iib_empty_index_db_tag: default_empty_index_db_tag(),
            iib_merge_validation_threads: 2,
            operator_deprecations_dir: default_operator_deprecations_dir(),
            iib_max_recursive_related_bundles: default_max_recursive_related_bundles(),
            iib_request_recursive_related_bundles_dir: Some(scratch.join("recursive_related_bundles")),
        }
    }
}

/// Locate an executable on `PATH`, or accept an explicit path
fn find_in_path(binary: &str) -> Option<PathBuf> {
    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(binary))
            .find(|path| path.is_file())
    })
}
