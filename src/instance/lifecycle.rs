//! Instance lifecycle management (start/stop/restart, probing, monitoring).

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;

use super::types::{
    InstanceEventKind, InstanceStatus, OperationOutcome, RuntimeStatus, Transition,
};
use super::Orchestrator;
use crate::config::{InstanceConfig, Settings};
use crate::error::{AppError, Result};
use crate::process::{AppDriver, BrowserDriver, PortAllocator, ProcessKind};

impl<B: BrowserDriver, A: AppDriver> Orchestrator<B, A> {
    /// Start an instance: provision the runtime, then the browser, then the app.
    ///
    /// A running instance is left alone. If the app fails after the browser came up, the
    /// browser is stopped again and `PartialStartFailure` is returned.
    pub async fn start_instance(&self, instance_id: &str) -> Result<()> {
        let cfg = self.instance_config(instance_id)?;
        if self.state.status(instance_id) == InstanceStatus::Running {
            log::debug!("Instance {} is already running", instance_id);
            return Ok(());
        }

        let _guard = self.state.try_lock(instance_id)?;
        self.state.begin(instance_id, Transition::Starting);
        self.state.emit(instance_id, InstanceEventKind::Starting);

        let settings = self.config.load().settings.clone();
        let result = self.launch_pair(&cfg, &settings).await;
        self.state.finish(instance_id);

        match result {
            Ok((browser_pid, app_pid)) => {
                self.write_pid_markers(instance_id, browser_pid, app_pid);
                self.state
                    .set_runtime(instance_id, RuntimeStatus::running(browser_pid, app_pid));
                log::info!(
                    "Instance {} running (browser pid {}, app pid {})",
                    instance_id,
                    browser_pid,
                    app_pid
                );
                self.state.emit(instance_id, InstanceEventKind::Running);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to start instance {}: {}", instance_id, e);
                self.state.set_runtime(instance_id, RuntimeStatus::failed(&e));
                self.state.emit(instance_id, InstanceEventKind::Error);
                Err(e)
            }
        }
    }

    async fn launch_pair(&self, cfg: &InstanceConfig, settings: &Settings) -> Result<(u32, u32)> {
        for port in [cfg.control_port, cfg.app_port] {
            if PortAllocator::is_in_use(port) {
                return Err(AppError::port_conflict(port));
            }
        }

        let runtime_dir = self.runtime.prepare(&cfg.id, settings)?;
        let browser_pid = self.browser.launch(cfg, settings).await?;

        match self.app.launch(cfg, &runtime_dir, settings).await {
            Ok(app_pid) => Ok((browser_pid, app_pid)),
            Err(e) => {
                log::warn!(
                    "App of {} failed to start ({}), rolling back browser {}",
                    cfg.id,
                    e,
                    browser_pid
                );
                if let Err(stop_err) = self
                    .browser
                    .stop(
                        &cfg.id,
                        cfg.control_port,
                        Path::new(&cfg.profile_dir),
                        Some(browser_pid),
                    )
                    .await
                {
                    log::error!("Rollback of browser for {} failed: {}", cfg.id, stop_err);
                }
                Err(AppError::partial_start_failure(&e))
            }
        }
    }

    /// Stop an instance: the app first, then the browser.
    ///
    /// A stopped instance whose ports are both free is a no-op.
    pub async fn stop_instance(&self, instance_id: &str) -> Result<()> {
        let cfg = self.instance_config(instance_id)?;
        if self.state.status(instance_id) == InstanceStatus::Stopped
            && !PortAllocator::is_in_use(cfg.app_port)
            && !PortAllocator::is_in_use(cfg.control_port)
        {
            log::debug!("Instance {} is already stopped", instance_id);
            return Ok(());
        }

        let _guard = self.state.try_lock(instance_id)?;
        self.state.begin(instance_id, Transition::Stopping);
        self.state.emit(instance_id, InstanceEventKind::Stopping);

        let known = self.state.runtime(instance_id);
        let result = self.stop_processes(&cfg, &known).await;
        self.state.finish(instance_id);

        match result {
            Ok(()) => {
                self.state.set_runtime(instance_id, RuntimeStatus::default());
                log::info!("Instance {} stopped", instance_id);
                self.state.emit(instance_id, InstanceEventKind::Stopped);
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to stop instance {}: {}", instance_id, e);
                self.state.set_runtime(instance_id, RuntimeStatus::failed(&e));
                self.state.emit(instance_id, InstanceEventKind::Error);
                Err(e)
            }
        }
    }

    /// Stop both processes, attempting the browser even if the app stop failed.
    pub(super) async fn stop_processes(
        &self,
        cfg: &InstanceConfig,
        known: &RuntimeStatus,
    ) -> Result<()> {
        let app_pid = known
            .app_pid
            .or_else(|| self.read_pid_marker(&cfg.id, ProcessKind::App));
        let browser_pid = known
            .browser_pid
            .or_else(|| self.read_pid_marker(&cfg.id, ProcessKind::Browser));

        let app_result = self.app.stop(&cfg.id, cfg.app_port, app_pid).await;
        let browser_result = self
            .browser
            .stop(
                &cfg.id,
                cfg.control_port,
                Path::new(&cfg.profile_dir),
                browser_pid,
            )
            .await;
        self.remove_pid_markers(&cfg.id);

        for port in [cfg.app_port, cfg.control_port] {
            if !PortAllocator::wait_for_release(port, self.timeouts.port_release).await {
                log::warn!("Port {} of {} was not released after stop", port, cfg.id);
            }
        }

        app_result.and(browser_result)
    }

    pub async fn restart_instance(&self, instance_id: &str) -> Result<()> {
        self.stop_instance(instance_id).await?;
        tokio::time::sleep(self.timeouts.restart_settle).await;
        self.start_instance(instance_id).await
    }

    fn instance_ids(&self) -> Vec<String> {
        self.config
            .load()
            .instances
            .iter()
            .map(|inst| inst.id.clone())
            .collect()
    }

    pub async fn start_all(&self) -> Vec<OperationOutcome> {
        let mut outcomes = Vec::new();
        for id in self.instance_ids() {
            let result = self.start_instance(&id).await;
            outcomes.push(OperationOutcome::from_result(&id, result));
        }
        outcomes
    }

    pub async fn stop_all(&self) -> Vec<OperationOutcome> {
        let mut outcomes = Vec::new();
        for id in self.instance_ids() {
            let result = self.stop_instance(&id).await;
            outcomes.push(OperationOutcome::from_result(&id, result));
        }
        outcomes
    }

    pub async fn restart_all(&self) -> Vec<OperationOutcome> {
        let mut outcomes = Vec::new();
        for id in self.instance_ids() {
            let result = self.restart_instance(&id).await;
            outcomes.push(OperationOutcome::from_result(&id, result));
        }
        outcomes
    }

    /// Rebuild runtime status from live health checks. An instance counts as running
    /// only when both the control endpoint and the app answer.
    pub async fn probe_all(&self) {
        let config = self.config.load();
        let health_path = config.settings.app_health_path.as_str();

        let probes = config.instances.iter().map(|inst| async move {
            let control_healthy = self.browser.is_healthy(inst.control_port).await;
            let app_healthy = self.app.is_healthy(inst.app_port, health_path).await;
            (inst, control_healthy, app_healthy)
        });

        for (inst, control_healthy, app_healthy) in join_all(probes).await {
            if self.state.transition(&inst.id).is_some() {
                continue;
            }
            let status = if control_healthy && app_healthy {
                RuntimeStatus {
                    is_running: true,
                    browser_pid: self
                        .inspector
                        .pid_for_port(inst.control_port)
                        .or_else(|| self.read_pid_marker(&inst.id, ProcessKind::Browser)),
                    app_pid: self
                        .inspector
                        .pid_for_port(inst.app_port)
                        .or_else(|| self.read_pid_marker(&inst.id, ProcessKind::App)),
                    app_healthy,
                    control_healthy,
                    last_error: None,
                }
            } else {
                if control_healthy || app_healthy {
                    log::warn!(
                        "Instance {} is half-alive (control: {}, app: {}), treating as stopped",
                        inst.id,
                        control_healthy,
                        app_healthy
                    );
                }
                RuntimeStatus {
                    app_healthy,
                    control_healthy,
                    ..RuntimeStatus::default()
                }
            };
            self.state.set_runtime(&inst.id, status);
        }
    }

    /// One monitor pass: instances believed running that fail a health check are marked
    /// with an error.
    pub async fn check_running(&self) {
        let config = self.config.load();
        let health_path = config.settings.app_health_path.as_str();

        for inst in &config.instances {
            if self.state.transition(&inst.id).is_some() || !self.state.runtime(&inst.id).is_running
            {
                continue;
            }

            let control_healthy = self.browser.is_healthy(inst.control_port).await;
            let app_healthy = self.app.is_healthy(inst.app_port, health_path).await;
            if control_healthy && app_healthy {
                continue;
            }

            let message = format!(
                "health check lost (control: {}, app: {})",
                control_healthy, app_healthy
            );
            log::error!("Instance {} {}", inst.id, message);
            self.state.update_runtime(&inst.id, |status| {
                status.is_running = false;
                status.control_healthy = control_healthy;
                status.app_healthy = app_healthy;
                status.last_error = Some(message);
            });
            self.state.emit(&inst.id, InstanceEventKind::Error);
        }
    }

    /// Run `check_running` every `interval` until the returned handle is aborted.
    pub fn spawn_monitor(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.check_running().await;
            }
        })
    }

    pub(super) fn write_pid_markers(&self, instance_id: &str, browser_pid: u32, app_pid: u32) {
        for (kind, pid) in [(ProcessKind::Browser, browser_pid), (ProcessKind::App, app_pid)] {
            let path = self.paths.pid_marker_path(instance_id, kind);
            if let Err(e) = fs::write(&path, pid.to_string()) {
                log::warn!("Failed to write pid marker {:?}: {}", path, e);
            }
        }
    }

    pub(super) fn read_pid_marker(&self, instance_id: &str, kind: ProcessKind) -> Option<u32> {
        fs::read_to_string(self.paths.pid_marker_path(instance_id, kind))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    pub(super) fn remove_pid_markers(&self, instance_id: &str) {
        for kind in [ProcessKind::Browser, ProcessKind::App] {
            let path = self.paths.pid_marker_path(instance_id, kind);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("Failed to remove pid marker {:?}: {}", path, e);
                }
            }
        }
    }
}
