use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::validation::validate_config;

/// Persisted orchestrator configuration: `{settings, instances[]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

impl AppConfig {
    pub fn instance(&self, id: &str) -> Option<&InstanceConfig> {
        self.instances.iter().find(|inst| inst.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Browser executable; per-OS install locations are tried when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_path: Option<String>,
    /// Interpreter that runs the app entrypoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_runtime_path: Option<String>,
    #[serde(default = "default_app_entrypoint")]
    pub app_entrypoint: String,
    #[serde(default = "default_app_health_path")]
    pub app_health_path: String,
    /// Shared application bundle; `<data>/bundle` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_dir: Option<String>,
    #[serde(default = "default_start_app_port")]
    pub start_app_port: u16,
    #[serde(default = "default_start_control_port")]
    pub start_control_port: u16,
    /// Base directory for browser profiles; `<data>/profiles` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles_dir: Option<String>,
}

fn default_app_entrypoint() -> String {
    "index.js".to_string()
}

fn default_app_health_path() -> String {
    "/health".to_string()
}

fn default_start_app_port() -> u16 {
    3100
}

fn default_start_control_port() -> u16 {
    9300
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            browser_path: None,
            app_runtime_path: None,
            app_entrypoint: default_app_entrypoint(),
            app_health_path: default_app_health_path(),
            bundle_dir: None,
            start_app_port: default_start_app_port(),
            start_control_port: default_start_control_port(),
            profiles_dir: None,
        }
    }
}

impl Settings {
    pub fn app_runtime(&self) -> &str {
        self.app_runtime_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or("node")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub app_port: u16,
    pub control_port: u16,
    pub profile_dir: String,
    #[serde(default)]
    pub launch_args: Vec<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Cached, lock-protected access to `config.toml`.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    cache: RwLock<Arc<AppConfig>>,
}

impl ConfigStore {
    /// Load the config, writing defaults when the file is absent or invalid.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = load_or_regenerate(&path)?;
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            cache: RwLock::new(Arc::new(config)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Arc<AppConfig> {
        let config = self.cache.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&config)
    }

    /// Execute a read-modify-write operation on the config file while holding a lock.
    /// The closure's changes are validated and written atomically before the cache is swapped.
    pub fn with_config_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut AppConfig) -> Result<T>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut updated = (*self.load()).clone();
        let result = f(&mut updated)?;
        validate_config(&updated)?;
        save_config_to_disk(&self.path, &updated)?;

        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(updated);

        Ok(result)
    }
}

fn load_config_from_disk(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path).map_err(|e| AppError::config(e.to_string()))?;
    let config: AppConfig = toml::from_str(content.trim_start_matches('\u{feff}'))?;
    validate_config(&config)?;
    Ok(config)
}

fn load_or_regenerate(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        let config = AppConfig::default();
        save_config_to_disk(path, &config)?;
        return Ok(config);
    }

    match load_config_from_disk(path) {
        Ok(config) => Ok(config),
        Err(e) => {
            let backup = path.with_extension("toml.bak");
            log::warn!(
                "Config {:?} is invalid ({}), backing up to {:?} and writing defaults",
                path,
                e,
                backup
            );
            if let Err(e) = fs::rename(path, &backup) {
                log::warn!("Failed to back up invalid config: {}", e);
            }
            let config = AppConfig::default();
            save_config_to_disk(path, &config)?;
            Ok(config)
        }
    }
}

fn save_config_to_disk(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::io(e.to_string()))?;
    }
    let content = toml::to_string_pretty(config)?;
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, content).map_err(|e| AppError::config(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| AppError::config(e.to_string()))
}
