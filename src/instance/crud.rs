//! Instance CRUD operations and settings access.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::state::OperationGuard;
use super::types::{InstanceEventKind, InstanceStatus, InstanceSummary, RuntimeStatus};
use super::Orchestrator;
use crate::config::{InstanceConfig, Settings};
use crate::error::{AppError, ErrorKind, Result};
use crate::paths::Paths;
use crate::process::{AppDriver, BrowserDriver, PortAllocator};
use crate::templates::TemplateCatalog;
use crate::validation::validate_instance_id;

fn profiles_base(paths: &Paths, settings: &Settings) -> PathBuf {
    settings
        .profiles_dir
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| paths.default_profiles_dir())
}

/// `<type>-<8 hex>`, with the type reduced to id-safe characters.
fn generate_id(kind: &str, taken: impl Fn(&str) -> bool) -> String {
    let prefix: String = kind
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
        .take(48)
        .collect();
    let prefix = if prefix.is_empty() { "agent".to_string() } else { prefix };
    loop {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", prefix, &suffix[..8]);
        if !taken(&id) {
            return id;
        }
    }
}

impl<B: BrowserDriver, A: AppDriver> Orchestrator<B, A> {
    /// Create `count` instances of template `kind`.
    ///
    /// Ids, ports, and profile dirs are assigned and persisted under the config lock, so
    /// concurrent adds never hand out the same port.
    pub fn add_instances(
        &self,
        kind: &str,
        count: usize,
        explicit_id: Option<&str>,
    ) -> Result<Vec<InstanceConfig>> {
        let template = self.templates.get(kind)?.clone();
        if count == 0 {
            return Err(AppError::config("count must be at least 1"));
        }
        if let Some(id) = explicit_id {
            if count != 1 {
                return Err(AppError::config("an explicit id requires count 1"));
            }
            validate_instance_id(id)?;
        }

        let kind = kind.to_string();
        let explicit_id = explicit_id.map(str::to_string);
        let created = self.config.with_config_mut(|config| {
            if let Some(id) = &explicit_id {
                if config.instance(id).is_some() {
                    return Err(AppError::config(format!("instance {} already exists", id)));
                }
            }

            let base = profiles_base(&self.paths, &config.settings);
            let mut created = Vec::with_capacity(count);
            for _ in 0..count {
                let id = match &explicit_id {
                    Some(id) => id.clone(),
                    None => generate_id(&kind, |candidate| config.instance(candidate).is_some()),
                };
                let (app_port, control_port) =
                    PortAllocator::allocate_pair(&config.instances, &config.settings)?;

                let instance = InstanceConfig {
                    name: format!("{} {}", template.display_name, id),
                    description: template.description.clone(),
                    kind: kind.clone(),
                    app_port,
                    control_port,
                    profile_dir: base.join(&id).to_string_lossy().into_owned(),
                    launch_args: template.launch_args.clone(),
                    created_at: chrono::Utc::now().to_rfc3339(),
                    env: template.env.clone(),
                    id,
                };
                config.instances.push(instance.clone());
                created.push(instance);
            }
            Ok(created)
        })?;

        for instance in &created {
            log::info!(
                "Added instance {} (app port {}, control port {})",
                instance.id,
                instance.app_port,
                instance.control_port
            );
            self.state.set_runtime(&instance.id, RuntimeStatus::default());
            self.state.emit(&instance.id, InstanceEventKind::Added);
        }
        Ok(created)
    }

    /// Stop and delete an instance. The browser profile directory is kept.
    ///
    /// An in-flight start or stop is allowed to finish first; the instance is then stopped
    /// whatever state that operation left it in.
    pub async fn remove_instance(&self, instance_id: &str) -> Result<()> {
        self.instance_config(instance_id)?;
        let _guard = self.lock_when_free(instance_id).await?;
        let cfg = self.instance_config(instance_id)?;

        let known = self.state.runtime(instance_id);
        self.stop_processes(&cfg, &known).await?;

        self.config.with_config_mut(|config| {
            config.instances.retain(|inst| inst.id != instance_id);
            Ok(())
        })?;
        self.state.forget(instance_id);
        self.remove_pid_markers(instance_id);
        if let Err(e) = self.runtime.cleanup(instance_id) {
            log::warn!("Failed to remove runtime of {}: {}", instance_id, e);
        }

        log::info!("Removed instance {}", instance_id);
        self.state.emit(instance_id, InstanceEventKind::Removed);
        Ok(())
    }

    /// Upper bound for one start or stop to run to completion.
    fn operation_budget(&self) -> Duration {
        let t = &self.timeouts;
        t.browser_startup
            + t.app_startup
            + (t.graceful_shutdown + t.page_flush_delay + t.lock_release_delay + t.port_release) * 2
    }

    /// Take the operation lock, waiting out an operation already in flight.
    async fn lock_when_free(&self, instance_id: &str) -> Result<OperationGuard<'_>> {
        let deadline = Instant::now() + self.operation_budget();
        loop {
            match self.state.try_lock(instance_id) {
                Ok(guard) => return Ok(guard),
                Err(e)
                    if e.kind() == ErrorKind::OperationInProgress && Instant::now() < deadline =>
                {
                    log::debug!("Waiting for in-flight operation on {}", instance_id);
                    tokio::time::sleep(self.timeouts.poll_interval).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn list_instances(&self) -> Vec<InstanceSummary> {
        self.config
            .load()
            .instances
            .iter()
            .map(|inst| InstanceSummary {
                config: inst.clone(),
                status: self.state.status(&inst.id),
                runtime: self.state.runtime(&inst.id),
            })
            .collect()
    }

    pub fn get_status(&self, instance_id: &str) -> Result<InstanceStatus> {
        self.instance_config(instance_id)?;
        Ok(self.state.status(instance_id))
    }

    pub fn get_settings(&self) -> Settings {
        self.config.load().settings.clone()
    }

    /// Replace the settings. Invalid settings are rejected and nothing is written.
    pub fn update_settings(&self, settings: Settings) -> Result<Settings> {
        self.config.with_config_mut(move |config| {
            config.settings = settings;
            Ok(config.settings.clone())
        })
    }

    pub fn templates(&self) -> &TemplateCatalog {
        &self.templates
    }
}
