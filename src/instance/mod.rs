//! Fleet orchestration: instance CRUD, lifecycle sequencing, and status tracking.
//!
//! Layout under the data directory:
//! - config.toml - settings and instance definitions
//! - runtime/{id}/ - per-instance copy of the application bundle
//! - logs/{id}.browser.log, logs/{id}.app.log - managed process output
//! - pids/{id}.browser.pid, pids/{id}.app.pid - pids of a running instance
//! - pids/{id}.lock - held while a start/stop/remove of the instance is in flight

mod cleanup;
mod crud;
mod lifecycle;
mod state;
mod types;

use std::sync::Arc;

use tokio::sync::broadcast;

pub use types::{
    InstanceEvent, InstanceEventKind, InstanceStatus, InstanceSummary, OperationOutcome,
    RuntimeStatus,
};

use crate::config::{ConfigStore, InstanceConfig};
use crate::error::{AppError, Result};
use crate::paths::Paths;
use crate::process::{
    platform_inspector, AppController, AppDriver, BrowserController, BrowserDriver,
    ProcessInspector, Timeouts,
};
use crate::runtime::RuntimeProvisioner;
use crate::templates::TemplateCatalog;
use state::FleetState;

/// Owns the persisted config, the template catalog, the controllers, and all runtime state.
pub struct Orchestrator<B = BrowserController, A = AppController> {
    paths: Paths,
    timeouts: Timeouts,
    config: ConfigStore,
    templates: TemplateCatalog,
    runtime: RuntimeProvisioner,
    inspector: Arc<dyn ProcessInspector>,
    browser: B,
    app: A,
    state: FleetState,
}

impl Orchestrator {
    /// Orchestrator with the real browser and app controllers.
    pub fn open(paths: Paths) -> Result<Self> {
        Self::open_with(paths, Timeouts::default())
    }

    pub fn open_with(paths: Paths, timeouts: Timeouts) -> Result<Self> {
        let browser = BrowserController::new(paths.clone(), timeouts);
        let app = AppController::new(paths.clone(), timeouts);
        Self::with_drivers(paths, timeouts, browser, app)
    }
}

impl<B: BrowserDriver, A: AppDriver> Orchestrator<B, A> {
    pub fn with_drivers(paths: Paths, timeouts: Timeouts, browser: B, app: A) -> Result<Self> {
        paths.ensure_data_dirs()?;
        let config = ConfigStore::open(paths.config_path())?;
        let templates = TemplateCatalog::load(&paths.templates_path());
        let inspector = platform_inspector();
        let state = FleetState::new(
            config.load().instances.iter().map(|inst| inst.id.as_str()),
            paths.pids_dir(),
            Arc::clone(&inspector),
        );

        log::info!(
            "Orchestrator opened at {:?} with {} instance(s)",
            paths.root(),
            config.load().instances.len()
        );

        Ok(Self {
            runtime: RuntimeProvisioner::new(paths.clone()),
            paths,
            timeouts,
            config,
            templates,
            inspector,
            browser,
            app,
            state,
        })
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.state.subscribe()
    }

    fn instance_config(&self, instance_id: &str) -> Result<InstanceConfig> {
        self.config
            .load()
            .instance(instance_id)
            .cloned()
            .ok_or_else(|| AppError::instance_not_found(instance_id))
    }
}
