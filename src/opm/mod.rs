// opm: the operator index tool, its serve processes and the ports they bind

pub mod index;
pub mod operations;
pub mod ports;
pub mod serve;

use std::cmp::Ordering;
use tracing::{info, warn};

use crate::command::{run_cmd, CommandSpec};
use crate::error::{IibError, Result};
use crate::registry::skopeo::get_image_label;
use crate::settings::WorkerSettings;
use crate::state::WorkerState;

lazy_static::lazy_static! {
    static ref OPM_VERSION: regex::Regex = regex::Regex::new(r#"OpmVersion:"v([\d.]+)""#).unwrap();
}

pub const INDEX_VERSION_LABEL: &str = "com.redhat.index.delivery.version";

/// The opm binary used for one request
///
/// Picked once from the index image's OCP version and passed down explicitly, so
/// concurrent requests never share a selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmContext {
    pub binary: String,
}

impl OpmContext {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn default_for(settings: &WorkerSettings) -> Self {
        Self::new(settings.iib_default_opm.clone())
    }

    /// Select the binary mapped to the index's `com.redhat.index.delivery.version`
    pub async fn for_index(state: &WorkerState, index: Option<&str>) -> Result<Self> {
        info!("Determining the OPM version to use");
        let settings = &state.settings;
        let Some(index) = index.filter(|_| !settings.iib_ocp_opm_mapping.is_empty()) else {
            warn!("Either iib_ocp_opm_mapping config or from_index/target_index is not set, using the default opm");
            return Ok(Self::default_for(settings));
        };

        let ctx = match get_image_label(state, index, INDEX_VERSION_LABEL).await? {
            Some(version) => settings
                .iib_ocp_opm_mapping
                .get(&version)
                .map(Self::new)
                .unwrap_or_else(|| Self::default_for(settings)),
            None => Self::default_for(settings),
        };
        info!("OPM version set to {}", ctx.binary);
        Ok(ctx)
    }

    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(self.binary.as_str())
    }

    /// Version number reported by `opm version`, e.g. `1.28.0`
    pub async fn version_number(&self, state: &WorkerState) -> Result<String> {
        info!("Determining the OPM version number");
        let output = run_cmd(state.runner(), &self.command().arg("version"), None).await?;
        parse_opm_version(&output)
    }
}

fn parse_opm_version(output: &str) -> Result<String> {
    OPM_VERSION
        .captures(output)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| IibError::iib("Opm version not found in the output of \"OPM version\" command"))
}

/// Compare dotted numeric versions; missing components count as zero
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim_start_matches('v')
            .split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ord = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
