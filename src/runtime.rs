//! Per-instance runtime directories materialized from the shared application bundle.

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::paths::Paths;
use crate::process::ENV_FILES;
use crate::validation::validate_instance_id;

#[derive(Debug, Clone)]
pub struct RuntimeProvisioner {
    paths: Paths,
}

impl RuntimeProvisioner {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }

    /// Configured bundle directory, else `<data>/bundle`.
    pub fn bundle_dir(&self, settings: &Settings) -> PathBuf {
        settings
            .bundle_dir
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.paths.default_bundle_dir())
    }

    /// Whether the bundle exists and contains the entrypoint.
    pub fn bundle_present(&self, settings: &Settings) -> bool {
        self.bundle_dir(settings)
            .join(&settings.app_entrypoint)
            .is_file()
    }

    /// Rebuild `runtime/<id>` from the bundle and return its path.
    pub fn prepare(&self, instance_id: &str, settings: &Settings) -> Result<PathBuf> {
        validate_instance_id(instance_id)?;

        let bundle = self.bundle_dir(settings);
        if !bundle.join(&settings.app_entrypoint).is_file() {
            return Err(AppError::runtime_missing(bundle.to_string_lossy()));
        }

        let runtime_dir = self.paths.runtime_dir(instance_id);
        if fs::symlink_metadata(&runtime_dir).is_ok() {
            fs::remove_dir_all(&runtime_dir).map_err(|e| {
                AppError::io(format!("Failed to clear runtime {:?}: {}", runtime_dir, e))
            })?;
        }
        fs::create_dir_all(&runtime_dir)?;

        let linked = mirror_tree(&bundle, &runtime_dir)?;
        if let Some(parent) = bundle.parent() {
            copy_adjacent_env_files(parent, &runtime_dir)?;
        }

        let entrypoint = runtime_dir.join(&settings.app_entrypoint);
        if !entrypoint.is_file() {
            return Err(AppError::runtime_missing(entrypoint.to_string_lossy()));
        }

        log::info!(
            "Prepared runtime for {} at {:?} ({} files)",
            instance_id,
            runtime_dir,
            linked
        );
        Ok(runtime_dir)
    }

    pub fn is_ready(&self, instance_id: &str, settings: &Settings) -> bool {
        self.paths
            .runtime_dir(instance_id)
            .join(&settings.app_entrypoint)
            .is_file()
    }

    /// Total size in bytes of the instance runtime directory.
    pub fn size_of(&self, instance_id: &str) -> Result<u64> {
        validate_instance_id(instance_id)?;
        let dir = self.paths.runtime_dir(instance_id);
        if !dir.exists() {
            return Ok(0);
        }

        let mut total = 0;
        for entry in WalkDir::new(&dir) {
            let entry = entry?;
            if entry.file_type().is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    }

    pub fn cleanup(&self, instance_id: &str) -> Result<()> {
        validate_instance_id(instance_id)?;
        let dir = self.paths.runtime_dir(instance_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|e| AppError::io(format!("Failed to remove runtime {:?}: {}", dir, e)))?;
        }
        Ok(())
    }

    /// Remove every runtime directory. Failures are logged and skipped.
    pub fn cleanup_all(&self) -> Result<()> {
        let base = self.paths.runtime_base_dir();
        if !base.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&base)? {
            let path = entry?.path();
            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            if let Err(e) = result {
                log::warn!("Failed to remove runtime {:?}: {}", path, e);
            }
        }
        Ok(())
    }
}

fn link_or_copy(src: &Path, dest: &Path) -> Result<()> {
    if let Err(e) = fs::hard_link(src, dest) {
        log::debug!("hard_link {:?} failed ({}), falling back to copy", src, e);
        fs::copy(src, dest)
            .map_err(|e| AppError::io(format!("Failed to copy {:?} to {:?}: {}", src, dest, e)))?;
    }
    Ok(())
}

#[cfg(unix)]
fn recreate_symlink(src: &Path, dest: &Path) -> Result<()> {
    let target = fs::read_link(src)?;
    std::os::unix::fs::symlink(&target, dest)
        .map_err(|e| AppError::io(format!("Failed to create symlink at {:?}: {}", dest, e)))
}

/// Symlinks are materialized as copies of what they point at.
#[cfg(not(unix))]
fn recreate_symlink(src: &Path, dest: &Path) -> Result<()> {
    let resolved = fs::metadata(src)?;
    if resolved.is_dir() {
        fs::create_dir_all(dest)?;
        mirror_tree(&fs::canonicalize(src)?, dest).map(|_| ())
    } else {
        fs::copy(src, dest)?;
        Ok(())
    }
}

/// Mirror `src` into the existing directory `dest`. Returns the number of files linked or copied.
fn mirror_tree(src: &Path, dest: &Path) -> Result<usize> {
    let mut files = 0;
    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| AppError::io(e.to_string()))?;
        let out = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&out)?;
        } else if file_type.is_symlink() {
            recreate_symlink(entry.path(), &out)?;
        } else {
            link_or_copy(entry.path(), &out)?;
            files += 1;
        }
    }
    Ok(files)
}

/// Copy env definition files sitting next to the bundle, keeping any the bundle already had.
fn copy_adjacent_env_files(from: &Path, runtime_dir: &Path) -> Result<()> {
    for name in ENV_FILES {
        let src = from.join(name);
        let dest = runtime_dir.join(name);
        if src.is_file() && !dest.exists() {
            fs::copy(&src, &dest)
                .map_err(|e| AppError::io(format!("Failed to copy {:?}: {}", src, e)))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        provisioner: RuntimeProvisioner,
        settings: Settings,
        bundle: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("app").join("bundle");
        fs::create_dir_all(bundle.join("lib")).unwrap();
        fs::write(bundle.join("index.js"), "console.log('hi')").unwrap();
        fs::write(bundle.join("lib").join("util.js"), "module.exports = {}").unwrap();

        let settings = Settings {
            bundle_dir: Some(bundle.to_string_lossy().into_owned()),
            ..Settings::default()
        };
        Fixture {
            provisioner: RuntimeProvisioner::new(Paths::new(dir.path().join("data"))),
            settings,
            bundle,
            _dir: dir,
        }
    }

    #[test]
    fn prepare_mirrors_bundle() {
        let f = fixture();

        let runtime = f.provisioner.prepare("agent-1", &f.settings).unwrap();

        assert!(runtime.join("index.js").is_file());
        assert_eq!(
            fs::read_to_string(runtime.join("lib").join("util.js")).unwrap(),
            "module.exports = {}"
        );
        assert!(f.provisioner.is_ready("agent-1", &f.settings));
        assert!(f.provisioner.size_of("agent-1").unwrap() > 0);
    }

    #[test]
    fn prepare_replaces_stale_runtime() {
        let f = fixture();
        let runtime = f.provisioner.prepare("agent-1", &f.settings).unwrap();
        fs::write(runtime.join("leftover.tmp"), "x").unwrap();

        let runtime = f.provisioner.prepare("agent-1", &f.settings).unwrap();
        assert!(!runtime.join("leftover.tmp").exists());
    }

    #[test]
    fn adjacent_env_files_do_not_override_bundle_copies() {
        let f = fixture();
        let parent = f.bundle.parent().unwrap();
        fs::write(parent.join(".env"), "FROM=parent\n").unwrap();
        fs::write(parent.join(".env.local"), "LOCAL=1\n").unwrap();
        fs::write(f.bundle.join(".env"), "FROM=bundle\n").unwrap();

        let runtime = f.provisioner.prepare("agent-1", &f.settings).unwrap();

        assert_eq!(fs::read_to_string(runtime.join(".env")).unwrap(), "FROM=bundle\n");
        assert_eq!(fs::read_to_string(runtime.join(".env.local")).unwrap(), "LOCAL=1\n");
    }

    #[test]
    fn missing_bundle_is_runtime_missing() {
        let f = fixture();
        fs::remove_file(f.bundle.join("index.js")).unwrap();

        let err = f.provisioner.prepare("agent-1", &f.settings).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::RuntimeMissing);
        assert!(!f.provisioner.bundle_present(&f.settings));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_recreated() {
        let f = fixture();
        std::os::unix::fs::symlink("lib/util.js", f.bundle.join("util-link.js")).unwrap();

        let runtime = f.provisioner.prepare("agent-1", &f.settings).unwrap();

        let link = runtime.join("util-link.js");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("lib/util.js"));
    }

    #[test]
    fn cleanup_removes_runtimes() {
        let f = fixture();
        f.provisioner.prepare("agent-1", &f.settings).unwrap();
        f.provisioner.prepare("agent-2", &f.settings).unwrap();

        f.provisioner.cleanup("agent-1").unwrap();
        assert!(!f.provisioner.is_ready("agent-1", &f.settings));
        assert!(f.provisioner.is_ready("agent-2", &f.settings));

        f.provisioner.cleanup_all().unwrap();
        assert!(!f.provisioner.is_ready("agent-2", &f.settings));
        assert_eq!(f.provisioner.size_of("agent-2").unwrap(), 0);
    }
}
