//! Centralized path layout for the orchestrator's data directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::process::ProcessKind;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "AGENT_FLEET_HOME";

/// Root data directory plus the fixed layout beneath it.
#[derive(Debug, Clone)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$AGENT_FLEET_HOME`, else `~/.agent_fleet`.
    pub fn from_env() -> Result<Self> {
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            return Ok(Self::new(dir));
        }
        let home =
            dirs::home_dir().ok_or_else(|| AppError::io("Cannot find home directory"))?;
        Ok(Self::new(home.join(".agent_fleet")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn templates_path(&self) -> PathBuf {
        self.root.join("templates.toml")
    }

    /// Default shared bundle location when no override is configured.
    pub fn default_bundle_dir(&self) -> PathBuf {
        self.root.join("bundle")
    }

    pub fn default_profiles_dir(&self) -> PathBuf {
        self.root.join("profiles")
    }

    pub fn runtime_base_dir(&self) -> PathBuf {
        self.root.join("runtime")
    }

    pub fn runtime_dir(&self, instance_id: &str) -> PathBuf {
        self.runtime_base_dir().join(instance_id)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_path(&self, instance_id: &str, kind: ProcessKind) -> PathBuf {
        self.logs_dir()
            .join(format!("{}.{}.log", instance_id, kind.as_str()))
    }

    pub fn pids_dir(&self) -> PathBuf {
        self.root.join("pids")
    }

    pub fn pid_marker_path(&self, instance_id: &str, kind: ProcessKind) -> PathBuf {
        self.pids_dir()
            .join(format!("{}.{}.pid", instance_id, kind.as_str()))
    }

    /// Ensure all required data directories exist.
    pub fn ensure_data_dirs(&self) -> Result<()> {
        let dirs = [
            self.root.clone(),
            self.runtime_base_dir(),
            self.logs_dir(),
            self.pids_dir(),
        ];
        for dir in &dirs {
            fs::create_dir_all(dir)
                .map_err(|e| AppError::io(format!("Failed to create {:?}: {}", dir, e)))?;
        }
        Ok(())
    }
}
