//! Process management: ports, inspection, signals, and the two per-instance controllers.

mod app;
mod browser;
mod control;
mod envfile;
mod health;
mod inspect;
mod logfile;
mod ports;

#[cfg(target_os = "windows")]
pub(crate) mod win_api;

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{InstanceConfig, Settings};
use crate::error::Result;

pub use app::AppController;
pub use browser::{build_browser_args, BrowserController, LockCleanup};
pub use control::{force_kill, kill_tree};
pub use envfile::{load_env_files, parse_env, ENV_FILES};
pub use inspect::{platform_inspector, ProcessEntry, ProcessInspector};
pub use logfile::{clear_log, read_log_tail};
pub use ports::PortAllocator;

/// Browser readiness budget.
const BROWSER_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// App readiness budget.
const APP_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between readiness and exit polls.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Timeout for graceful shutdown before force killing.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay after closing pages so the browser can flush its storage.
const PAGE_FLUSH_DELAY: Duration = Duration::from_millis(1500);

/// Delay after the browser is gone so the OS releases profile file locks.
const LOCK_RELEASE_DELAY: Duration = Duration::from_secs(1);

/// Pause between stop and start on restart.
const RESTART_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Timeout of a single health probe request.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// How long to wait for a port to be released after stop.
const PORT_RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of log lines attached to startup failures.
pub const LOG_TAIL_LINES: usize = 30;

/// Every bounded wait used by the controllers and the orchestrator.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub browser_startup: Duration,
    pub app_startup: Duration,
    pub poll_interval: Duration,
    pub graceful_shutdown: Duration,
    pub page_flush_delay: Duration,
    pub lock_release_delay: Duration,
    pub restart_settle: Duration,
    pub probe: Duration,
    pub port_release: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            browser_startup: BROWSER_STARTUP_TIMEOUT,
            app_startup: APP_STARTUP_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            graceful_shutdown: GRACEFUL_SHUTDOWN_TIMEOUT,
            page_flush_delay: PAGE_FLUSH_DELAY,
            lock_release_delay: LOCK_RELEASE_DELAY,
            restart_settle: RESTART_SETTLE_DELAY,
            probe: PROBE_TIMEOUT,
            port_release: PORT_RELEASE_TIMEOUT,
        }
    }
}

/// Which half of an instance a log file or pid marker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Browser,
    App,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::App => "app",
        }
    }
}

/// Launch/stop contract for the browser half of an instance.
///
/// Implementations return results and never touch orchestrator state.
pub trait BrowserDriver: Send + Sync + 'static {
    /// Launch the browser and return the pid bound to the control port.
    fn launch(
        &self,
        cfg: &InstanceConfig,
        settings: &Settings,
    ) -> impl Future<Output = Result<u32>> + Send;

    /// Storage-safe shutdown. A browser that is not running is not an error.
    fn stop(
        &self,
        instance_id: &str,
        control_port: u16,
        profile_dir: &Path,
        known_pid: Option<u32>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn is_healthy(&self, control_port: u16) -> impl Future<Output = bool> + Send;

    /// Remove stale profile lock markers unless a process still owns the profile.
    fn cleanup_profile_locks(&self, profile_dir: &Path) -> Result<LockCleanup>;
}

/// Launch/stop contract for the application server half of an instance.
pub trait AppDriver: Send + Sync + 'static {
    /// Launch the app from a prepared runtime directory and return the pid bound to the app port.
    fn launch(
        &self,
        cfg: &InstanceConfig,
        runtime_dir: &Path,
        settings: &Settings,
    ) -> impl Future<Output = Result<u32>> + Send;

    /// Stop the app. An app that is not running is not an error.
    fn stop(
        &self,
        instance_id: &str,
        app_port: u16,
        known_pid: Option<u32>,
    ) -> impl Future<Output = Result<()>> + Send;

    fn is_healthy(&self, app_port: u16, health_path: &str) -> impl Future<Output = bool> + Send;
}
