//! Recovery helpers: stale profile locks, orphaned port holders, and process logs.

use std::path::Path;

use super::types::{InstanceEventKind, RuntimeStatus};
use super::Orchestrator;
use crate::error::Result;
use crate::process::{self, AppDriver, BrowserDriver, LockCleanup, ProcessKind};

impl<B: BrowserDriver, A: AppDriver> Orchestrator<B, A> {
    /// Remove stale lock markers from the instance profile unless a process still owns it.
    pub fn cleanup_profile_locks(&self, instance_id: &str) -> Result<LockCleanup> {
        let cfg = self.instance_config(instance_id)?;
        self.browser
            .cleanup_profile_locks(Path::new(&cfg.profile_dir))
    }

    /// Kill whatever is listening on the instance's ports. Returns the killed pids.
    pub fn kill_port_occupants(&self, instance_id: &str) -> Result<Vec<u32>> {
        let cfg = self.instance_config(instance_id)?;
        let _guard = self.state.try_lock(instance_id)?;

        let mut killed = Vec::new();
        for port in [cfg.app_port, cfg.control_port] {
            let Some(pid) = self.inspector.pid_for_port(port) else {
                continue;
            };
            log::warn!("Killing pid {} holding port {} of {}", pid, port, instance_id);
            process::kill_tree(self.inspector.as_ref(), pid)?;
            killed.push(pid);
        }

        if !killed.is_empty() {
            self.remove_pid_markers(instance_id);
            self.state.set_runtime(instance_id, RuntimeStatus::default());
            self.state.emit(instance_id, InstanceEventKind::Stopped);
        }
        Ok(killed)
    }

    pub fn read_log_tail(
        &self,
        instance_id: &str,
        kind: ProcessKind,
        lines: usize,
    ) -> Result<Vec<String>> {
        self.instance_config(instance_id)?;
        process::read_log_tail(&self.paths.log_path(instance_id, kind), lines)
    }

    pub fn clear_log(&self, instance_id: &str, kind: ProcessKind) -> Result<()> {
        self.instance_config(instance_id)?;
        process::clear_log(&self.paths.log_path(instance_id, kind))
    }

    /// Whether the shared application bundle is in place.
    pub fn runtime_bundle_present(&self) -> bool {
        self.runtime.bundle_present(&self.config.load().settings)
    }
}
