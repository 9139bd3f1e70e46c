use std::collections::HashSet;

use crate::config::AppConfig;
use crate::error::{AppError, Result};

const MAX_ID_LEN: usize = 64;

pub fn validate_instance_id(instance_id: &str) -> Result<()> {
    let is_safe = !instance_id.is_empty()
        && instance_id.len() <= MAX_ID_LEN
        && instance_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));

    if !is_safe {
        return Err(AppError::config(format!("Invalid instance id: {instance_id:?}")));
    }
    Ok(())
}

/// Schema checks applied on load and before every persisted mutation.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    let settings = &config.settings;
    if settings.start_app_port == 0 || settings.start_control_port == 0 {
        return Err(AppError::config("start ports must be nonzero"));
    }
    if settings.app_entrypoint.trim().is_empty() {
        return Err(AppError::config("app_entrypoint must not be empty"));
    }
    if !settings.app_health_path.starts_with('/') {
        return Err(AppError::config("app_health_path must start with '/'"));
    }

    let mut ids = HashSet::new();
    let mut ports = HashSet::new();
    let mut profiles = HashSet::new();

    for inst in &config.instances {
        validate_instance_id(&inst.id)?;
        if !ids.insert(inst.id.as_str()) {
            return Err(AppError::config(format!("duplicate instance id {}", inst.id)));
        }
        if inst.kind.trim().is_empty() {
            return Err(AppError::config(format!("instance {} has no type", inst.id)));
        }
        if inst.app_port == inst.control_port {
            return Err(AppError::config(format!(
                "instance {} uses port {} twice",
                inst.id, inst.app_port
            )));
        }
        for port in [inst.app_port, inst.control_port] {
            if port == 0 {
                return Err(AppError::config(format!("instance {} has port 0", inst.id)));
            }
            if !ports.insert(port) {
                return Err(AppError::config(format!(
                    "port {} is assigned to more than one instance",
                    port
                )));
            }
        }
        if inst.profile_dir.trim().is_empty() || !profiles.insert(inst.profile_dir.as_str()) {
            return Err(AppError::config(format!(
                "instance {} has an empty or shared profile_dir",
                inst.id
            )));
        }
    }

    Ok(())
}
