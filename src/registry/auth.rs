use base64::Engine;
use serde_json::{json, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;
use crate::registry::registry_of;
use crate::settings::WorkerSettings;

/// Replace the Docker config with a symlink to the configured template
pub fn reset_docker_config(settings: &WorkerSettings) -> Result<()> {
    reset_config_file(
        &settings.iib_docker_config,
        &settings.iib_docker_config_template,
    )
}

fn reset_config_file(config_path: &Path, template: &Path) -> Result<()> {
    debug!("Removing the Docker config at {}", config_path.display());
    remove_if_exists(config_path)?;

    if template.exists() {
        debug!(
            "Creating a symlink from {} to {}",
            template.display(),
            config_path.display()
        );
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(template, config_path)?;
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Registry credentials installed for the lifetime of the guard
///
/// While held, the Docker config contains `auths[<registry of image>]` built from a
/// `user:password` token on top of the template. Dropping the guard resets the config.
/// Without a token or an image the guard does nothing.
#[must_use]
pub struct RegistryTokenGuard {
    config_path: PathBuf,
    template: PathBuf,
    active: bool,
}

impl RegistryTokenGuard {
    pub fn set(
        settings: &WorkerSettings,
        token: Option<&str>,
        container_image: Option<&str>,
    ) -> Result<Self> {
        let mut guard = Self {
            config_path: settings.iib_docker_config.clone(),
            template: settings.iib_docker_config_template.clone(),
            active: false,
        };

        let Some(token) = token.filter(|t| !t.is_empty()) else {
            debug!("Not changing the Docker configuration since no overwrite_from_index_token was provided");
            return Ok(guard);
        };
        let Some(image) = container_image.filter(|i| !i.is_empty()) else {
            debug!("Not changing the Docker configuration since no from_index was provided");
            return Ok(guard);
        };

        // Reset on drop even if writing the config below fails halfway
        guard.active = true;

        debug!(
            "Removing the Docker config symlink at {}",
            guard.config_path.display()
        );
        remove_if_exists(&guard.config_path)?;

        let mut docker_config: Value = if guard.template.exists() {
            serde_json::from_str(&fs::read_to_string(&guard.template)?)?
        } else {
            json!({})
        };

        let registry = registry_of(image);
        debug!(
            "Setting the override token for the registry {} in the Docker config",
            registry
        );
        let encoded = base64::engine::general_purpose::STANDARD.encode(token.as_bytes());
        let auths = docker_config
            .as_object_mut()
            .map(|obj| obj.entry("auths").or_insert_with(|| json!({})));
        if let Some(Value::Object(auths)) = auths {
            auths.insert(registry.to_string(), json!({ "auth": encoded }));
        }

        if let Some(parent) = guard.config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&guard.config_path, serde_json::to_string(&docker_config)?)?;
        Ok(guard)
    }
}

impl Drop for RegistryTokenGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(e) = reset_config_file(&self.config_path, &self.template) {
            warn!("Failed to reset the Docker config: {}", e);
        }
    }
}
