//! Instance template catalog.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Defaults an instance is created from. Never mutated by running instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceTemplate {
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    /// May contain `{{port}}` and `{{profileDir}}` placeholders.
    #[serde(default)]
    pub launch_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Shape of `templates.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateCatalog {
    #[serde(default)]
    pub templates: BTreeMap<String, InstanceTemplate>,
}

impl TemplateCatalog {
    /// Load `templates.toml`, falling back to the built-in catalog when the file is
    /// absent, unreadable, or empty.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::builtin();
        }
        match read_catalog(path) {
            Ok(catalog) if !catalog.templates.is_empty() => catalog,
            Ok(_) => {
                log::warn!("Template file {:?} defines no templates, using built-in catalog", path);
                Self::builtin()
            }
            Err(e) => {
                log::warn!(
                    "Failed to load templates from {:?}: {}, using built-in catalog",
                    path,
                    e
                );
                Self::builtin()
            }
        }
    }

    pub fn builtin() -> Self {
        let templates = BTreeMap::from([
            (
                "default".to_string(),
                InstanceTemplate {
                    display_name: "Agent".to_string(),
                    description: "Windowed browser paired with an app server".to_string(),
                    launch_args: vec![
                        "--window-size=1280,800".to_string(),
                        "--disable-background-timer-throttling".to_string(),
                        "--disable-renderer-backgrounding".to_string(),
                    ],
                    env: BTreeMap::new(),
                },
            ),
            (
                "headless".to_string(),
                InstanceTemplate {
                    display_name: "Headless Agent".to_string(),
                    description: "Headless browser paired with an app server".to_string(),
                    launch_args: vec![
                        "--headless=new".to_string(),
                        "--disable-gpu".to_string(),
                        "--window-size=1280,800".to_string(),
                    ],
                    env: BTreeMap::from([("HEADLESS".to_string(), "1".to_string())]),
                },
            ),
        ]);
        Self { templates }
    }

    pub fn get(&self, kind: &str) -> Result<&InstanceTemplate> {
        self.templates
            .get(kind)
            .ok_or_else(|| AppError::template_not_found(kind))
    }
}

fn read_catalog(path: &Path) -> Result<TemplateCatalog> {
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}
