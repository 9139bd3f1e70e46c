//! Controlled browser: launch with an isolated profile, storage-safe shutdown.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Client;
use serde::Serialize;
use tokio::process::Command;

use super::control::{self, Readiness};
use super::inspect::{platform_inspector, ProcessInspector};
use super::{health, logfile, BrowserDriver, PortAllocator, ProcessKind, Timeouts};
use crate::config::{InstanceConfig, Settings};
use crate::error::{AppError, Result};
use crate::paths::Paths;

/// Lock markers a Chromium-family browser leaves in its profile directory.
const PROFILE_LOCK_FILES: [&str; 4] = [
    "SingletonLock",
    "SingletonSocket",
    "SingletonCookie",
    "lockfile",
];

/// Marker whose presence means the profile is held by a running browser.
#[cfg(target_os = "windows")]
const PRIMARY_LOCK_FILE: &str = "lockfile";
#[cfg(not(target_os = "windows"))]
const PRIMARY_LOCK_FILE: &str = "SingletonLock";

/// Result of a profile lock cleanup request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LockCleanup {
    Removed { files: Vec<String> },
    Skipped { pid: u32 },
}

pub struct BrowserController {
    paths: Paths,
    timeouts: Timeouts,
    client: Client,
    inspector: Arc<dyn ProcessInspector>,
}

impl BrowserController {
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

    fn profile_arg(profile_dir: &str) -> String {
        format!("--user-data-dir={}", profile_dir)
    }

    /// First live process started with our `--user-data-dir`.
    fn profile_owner(&self, profile_dir: &str) -> Option<u32> {
        self.inspector
            .pids_with_arg(&Self::profile_arg(profile_dir))
            .into_iter()
            .next()
    }

    fn ensure_profile_free(&self, profile_dir: &str) -> Result<()> {
        if let Some(pid) = self.profile_owner(profile_dir) {
            return Err(AppError::profile_locked(profile_dir, Some(pid)));
        }

        let marker = Path::new(profile_dir).join(PRIMARY_LOCK_FILE);
        if fs::symlink_metadata(&marker).is_ok() {
            let owner = lock_owner_pid(&marker).filter(|pid| self.inspector.is_alive(*pid));
            return Err(AppError::profile_locked(profile_dir, owner));
        }
        Ok(())
    }

    async fn close_pages(&self, instance_id: &str, control_port: u16) {
        let pages = health::list_pages(&self.client, control_port, self.timeouts.probe).await;
        if pages.is_empty() {
            return;
        }

        log::info!("Closing {} page(s) of {} before shutdown", pages.len(), instance_id);
        for page in &pages {
            let closed =
                health::close_page(&self.client, control_port, &page.id, self.timeouts.probe).await;
            if !closed {
                log::warn!(
                    "Failed to close page {} ({}) of {}",
                    page.id,
                    page.url,
                    instance_id
                );
            }
        }
        tokio::time::sleep(self.timeouts.page_flush_delay).await;
    }
}

impl BrowserDriver for BrowserController {
    async fn launch(&self, cfg: &InstanceConfig, settings: &Settings) -> Result<u32> {
        if PortAllocator::is_in_use(cfg.control_port) {
            return Err(AppError::port_conflict(cfg.control_port));
        }
        self.ensure_profile_free(&cfg.profile_dir)?;

        let exe = resolve_executable(settings)?;
        fs::create_dir_all(&cfg.profile_dir).map_err(|e| {
            AppError::io(format!(
                "Failed to create profile {}: {}",
                cfg.profile_dir, e
            ))
        })?;

        let args = build_browser_args(&cfg.launch_args, cfg.control_port, &cfg.profile_dir);
        let log_path = self.paths.log_path(&cfg.id, ProcessKind::Browser);
        let (stdout, stderr) = logfile::open_fresh(&log_path, &format!("browser {}", cfg.id))?;

        log::info!(
            "Launching browser for {} on control port {}: {:?}",
            cfg.id,
            cfg.control_port,
            exe
        );
        let mut cmd = Command::new(&exe);
        cmd.args(&args).stdout(stdout).stderr(stderr);
        control::detach(&mut cmd);

        let child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::executable_not_found(&exe.to_string_lossy())
            } else {
                AppError::process(format!("Failed to spawn browser: {}", e))
            }
        })?;
        let spawned_pid = child
            .id()
            .ok_or_else(|| AppError::process("Browser exited before its pid was read"))?;
        let mut exit = control::spawn_reaper(child, format!("Browser {}", cfg.id));

        let client = &self.client;
        let (port, probe) = (cfg.control_port, self.timeouts.probe);
        let readiness = control::wait_until_ready(
            &mut exit,
            self.timeouts.browser_startup,
            self.timeouts.poll_interval,
            || health::browser_ready(client, port, probe),
        )
        .await;

        let error = match readiness {
            Readiness::Ready => None,
            Readiness::Exited(code) => Some(AppError::process(format!(
                "browser exited during startup (code: {:?})",
                code
            ))),
            Readiness::TimedOut => Some(AppError::startup_timeout(
                "browser",
                self.timeouts.browser_startup.as_secs(),
            )),
        };
        if let Some(error) = error {
            let exited = !self.inspector.is_alive(spawned_pid);
            control::abort_launch(self.inspector.as_ref(), spawned_pid, exited, cfg.control_port);
            return Err(error.with_log_tail(&logfile::tail_or_empty(&log_path)));
        }

        let pid = self
            .inspector
            .pid_for_port(cfg.control_port)
            .unwrap_or(spawned_pid);
        log::info!("Browser for {} is ready (pid: {})", cfg.id, pid);
        Ok(pid)
    }

    async fn stop(
        &self,
        instance_id: &str,
        control_port: u16,
        profile_dir: &Path,
        known_pid: Option<u32>,
    ) -> Result<()> {
        let pid = self
            .inspector
            .pid_for_port(control_port)
            .or_else(|| known_pid.filter(|pid| self.inspector.is_alive(*pid)));
        let Some(pid) = pid else {
            log::debug!("Browser for {} is not running", instance_id);
            return Ok(());
        };

        log::info!("Stopping browser for {} (pid: {})", instance_id, pid);
        self.close_pages(instance_id, control_port).await;

        control::terminate(
            self.inspector.as_ref(),
            pid,
            self.timeouts.graceful_shutdown,
            self.timeouts.poll_interval,
        )
        .await?;

        let profile = profile_dir.to_string_lossy();
        for straggler in self.inspector.pids_with_arg(&Self::profile_arg(&profile)) {
            log::warn!(
                "Process {} still holds profile {} after stop, force killing",
                straggler,
                profile
            );
            if let Err(e) = control::force_kill(straggler) {
                log::warn!("Failed to kill {}: {}", straggler, e);
            }
        }

        tokio::time::sleep(self.timeouts.lock_release_delay).await;
        log::info!("Browser for {} stopped", instance_id);
        Ok(())
    }

    async fn is_healthy(&self, control_port: u16) -> bool {
        health::browser_ready(&self.client, control_port, self.timeouts.probe).await
    }

    fn cleanup_profile_locks(&self, profile_dir: &Path) -> Result<LockCleanup> {
        if let Some(pid) = self.profile_owner(&profile_dir.to_string_lossy()) {
            log::info!("Profile {:?} is in use by {}, leaving locks in place", profile_dir, pid);
            return Ok(LockCleanup::Skipped { pid });
        }

        let mut files = Vec::new();
        for name in PROFILE_LOCK_FILES {
            let path = profile_dir.join(name);
            if fs::symlink_metadata(&path).is_err() {
                continue;
            }
            fs::remove_file(&path)
                .map_err(|e| AppError::io(format!("Failed to remove {:?}: {}", path, e)))?;
            files.push(name.to_string());
        }
        if !files.is_empty() {
            log::info!("Removed stale locks {:?} from {:?}", files, profile_dir);
        }
        Ok(LockCleanup::Removed { files })
    }
}

/// Final argument list: mandatory flags first, then the configured arguments with
/// placeholders substituted. Configured flags that collide with a mandatory one are dropped.
pub fn build_browser_args(
    launch_args: &[String],
    control_port: u16,
    profile_dir: &str,
) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", control_port),
        format!("--user-data-dir={}", profile_dir),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
    ];
    let reserved: Vec<String> = args.iter().map(|a| flag_name(a).to_string()).collect();

    for raw in launch_args {
        let arg = raw
            .replace("{{port}}", &control_port.to_string())
            .replace("{{profileDir}}", profile_dir);
        if reserved.iter().any(|r| r == flag_name(&arg)) {
            log::debug!("Dropping launch arg {:?}, it is managed by the orchestrator", arg);
            continue;
        }
        args.push(arg);
    }
    args
}

fn flag_name(arg: &str) -> &str {
    arg.split_once('=').map_or(arg, |(name, _)| name)
}

/// `SingletonLock` points at `<hostname>-<pid>`.
fn lock_owner_pid(marker: &Path) -> Option<u32> {
    let target = fs::read_link(marker).ok()?;
    let target = target.to_string_lossy();
    target.rsplit('-').next()?.parse().ok()
}

fn resolve_executable(settings: &Settings) -> Result<PathBuf> {
    if let Some(custom) = settings
        .browser_path
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
    {
        return which::which(custom).map_err(|e| {
            log::debug!("Browser {:?} not found: {}", custom, e);
            AppError::executable_not_found(custom)
        });
    }

    default_browser_locations()
        .into_iter()
        .find(|p| p.is_file())
        .or_else(|| {
            [
                "google-chrome-stable",
                "google-chrome",
                "chromium",
                "chromium-browser",
                "microsoft-edge",
            ]
            .into_iter()
            .find_map(|name| which::which(name).ok())
        })
        .ok_or_else(|| AppError::executable_not_found("browser"))
}

#[cfg(target_os = "windows")]
fn default_browser_locations() -> Vec<PathBuf> {
    let mut out = Vec::new();
    for var in ["ProgramFiles", "ProgramFiles(x86)", "LOCALAPPDATA"] {
        if let Some(base) = std::env::var_os(var) {
            let base = PathBuf::from(base);
            out.push(base.join(r"Google\Chrome\Application\chrome.exe"));
            out.push(base.join(r"Microsoft\Edge\Application\msedge.exe"));
        }
    }
    out
}

#[cfg(target_os = "macos")]
fn default_browser_locations() -> Vec<PathBuf> {
    [
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
        "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn default_browser_locations() -> Vec<PathBuf> {
    [
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}
