//! Application server: env composition, launch from a runtime directory, readiness polling.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use reqwest::Client;
use tokio::process::Command;

use super::control::{self, Readiness};
use super::inspect::{platform_inspector, ProcessInspector};
use super::{envfile, health, logfile, AppDriver, PortAllocator, ProcessKind, Timeouts};
use crate::config::{InstanceConfig, Settings};
use crate::error::{AppError, Result};
use crate::paths::Paths;

pub struct AppController {
    paths: Paths,
    timeouts: Timeouts,
    client: Client,
    inspector: Arc<dyn ProcessInspector>,
}

impl AppController {
    pub fn new(paths: Paths, timeouts: Timeouts) -> Self {
        Self::with_inspector(paths, timeouts, platform_inspector())
    }

    #[allow(clippy::expect_used)]
    pub fn with_inspector(
        paths: Paths,
        timeouts: Timeouts,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Self {
        let client = Client::builder()
            .no_proxy()
            .build()
            .expect("Failed to create HTTP client");
        Self {
            paths,
            timeouts,
            client,
            inspector,
        }
    }
}

/// Environment for the app process. Later layers win: inherited env, env files in the
/// runtime directory, orchestrator-managed values, then the instance's own `env`.
pub(crate) fn compose_env(
    cfg: &InstanceConfig,
    runtime_dir: &Path,
    inherited: impl IntoIterator<Item = (String, String)>,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = inherited.into_iter().collect();
    env.extend(envfile::load_env_files(runtime_dir));

    env.insert("PORT".to_string(), cfg.app_port.to_string());
    env.insert("HOST".to_string(), "0.0.0.0".to_string());
    env.insert("BROWSER_CONTROL_PORT".to_string(), cfg.control_port.to_string());
    env.insert(
        "BROWSER_CONTROL_URL".to_string(),
        format!("http://127.0.0.1:{}", cfg.control_port),
    );
    env.insert("INSTANCE_ID".to_string(), cfg.id.clone());

    env.extend(cfg.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

impl AppDriver for AppController {
    async fn launch(
        &self,
        cfg: &InstanceConfig,
        runtime_dir: &Path,
        settings: &Settings,
    ) -> Result<u32> {
        if PortAllocator::is_in_use(cfg.app_port) {
            return Err(AppError::port_conflict(cfg.app_port));
        }

        let entrypoint = runtime_dir.join(&settings.app_entrypoint);
        if !entrypoint.is_file() {
            return Err(AppError::runtime_missing(entrypoint.to_string_lossy()));
        }

        let runtime = settings.app_runtime();
        let runtime_exe = which::which(runtime).map_err(|e| {
            log::debug!("App runtime {:?} not found: {}", runtime, e);
            AppError::executable_not_found(runtime)
        })?;

        let env = compose_env(cfg, runtime_dir, std::env::vars());
        let log_path = self.paths.log_path(&cfg.id, ProcessKind::App);
        let (stdout, stderr) = logfile::open_fresh(&log_path, &format!("app {}", cfg.id))?;

        log::info!(
            "Launching app for {} on port {}: {:?} {}",
            cfg.id,
            cfg.app_port,
            runtime_exe,
            settings.app_entrypoint
        );
        let mut cmd = Command::new(&runtime_exe);
        cmd.arg(&settings.app_entrypoint)
            .current_dir(runtime_dir)
            .env_clear()
            .envs(&env)
            .stdout(stdout)
            .stderr(stderr);
        control::detach(&mut cmd);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::executable_not_found(runtime)
            } else {
                AppError::process(format!("Failed to spawn app: {}", e))
            }
        })?;
        let spawned_pid = child
            .id()
            .ok_or_else(|| AppError::process("App exited before its pid was read"))?;
        let mut exit = control::spawn_reaper(child, format!("App {}", cfg.id));

        let client = &self.client;
        let health_path = settings.app_health_path.as_str();
        let (port, probe) = (cfg.app_port, self.timeouts.probe);
        let readiness = control::wait_until_ready(
            &mut exit,
            self.timeouts.app_startup,
            self.timeouts.poll_interval,
            || health::app_healthy(client, port, health_path, probe),
        )
        .await;

        let error = match readiness {
            Readiness::Ready => None,
            Readiness::Exited(code) => Some(AppError::process(format!(
                "app exited during startup (code: {:?})",
                code
            ))),
            Readiness::TimedOut => Some(AppError::startup_timeout(
                "app",
                self.timeouts.app_startup.as_secs(),
            )),
        };
        if let Some(error) = error {
            let exited = !self.inspector.is_alive(spawned_pid);
            control::abort_launch(self.inspector.as_ref(), spawned_pid, exited, cfg.app_port);
            return Err(error.with_log_tail(&logfile::tail_or_empty(&log_path)));
        }

        let pid = self.inspector.pid_for_port(cfg.app_port).unwrap_or(spawned_pid);
        log::info!("App for {} is healthy (pid: {})", cfg.id, pid);
        Ok(pid)
    }

    async fn stop(&self, instance_id: &str, app_port: u16, known_pid: Option<u32>) -> Result<()> {
        let pid = self
            .inspector
            .pid_for_port(app_port)
            .or_else(|| known_pid.filter(|pid| self.inspector.is_alive(*pid)));
        let Some(pid) = pid else {
            log::debug!("App for {} is not running", instance_id);
            return Ok(());
        };

        log::info!("Stopping app for {} (pid: {})", instance_id, pid);
        control::kill_descendants(self.inspector.as_ref(), pid);
        control::terminate(
            self.inspector.as_ref(),
            pid,
            self.timeouts.graceful_shutdown,
            self.timeouts.poll_interval,
        )
        .await?;

        if let Some(holder) = self.inspector.pid_for_port(app_port) {
            log::warn!(
                "Port {} is still held by {} after stopping {}, force killing",
                app_port,
                holder,
                instance_id
            );
            control::force_kill(holder)?;
        }

        log::info!("App for {} stopped", instance_id);
        Ok(())
    }

    async fn is_healthy(&self, app_port: u16, health_path: &str) -> bool {
        health::app_healthy(&self.client, app_port, health_path, self.timeouts.probe).await
    }
}
