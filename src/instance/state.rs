//! Keyed in-memory state owned by the orchestrator.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write as _};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;

use super::types::{InstanceEvent, InstanceEventKind, InstanceStatus, RuntimeStatus, Transition};
use crate::error::{AppError, Result};
use crate::process::ProcessInspector;

const EVENT_CAPACITY: usize = 128;

/// A lock file without a readable pid younger than this is still being written.
const UNWRITTEN_LOCK_GRACE: Duration = Duration::from_secs(5);

pub(crate) struct FleetState {
    runtime: RwLock<HashMap<String, RuntimeStatus>>,
    transitions: RwLock<HashMap<String, Transition>>,
    locks: Mutex<HashSet<String>>,
    /// `<id>.lock` files here extend the operation lock across processes.
    lock_dir: PathBuf,
    inspector: Arc<dyn ProcessInspector>,
    events: broadcast::Sender<InstanceEvent>,
}

/// Holds the per-instance operation lock until dropped.
pub(crate) struct OperationGuard<'a> {
    state: &'a FleetState,
    instance_id: String,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        let path = self.state.lock_path(&self.instance_id);
        if let Err(e) = fs::remove_file(&path) {
            log::warn!("Failed to remove operation lock {:?}: {}", path, e);
        }
        let mut locks = self.state.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(&self.instance_id);
    }
}

impl FleetState {
    pub(crate) fn new<'a>(
        ids: impl IntoIterator<Item = &'a str>,
        lock_dir: PathBuf,
        inspector: Arc<dyn ProcessInspector>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let runtime = ids
            .into_iter()
            .map(|id| (id.to_string(), RuntimeStatus::default()))
            .collect();
        Self {
            runtime: RwLock::new(runtime),
            transitions: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashSet::new()),
            lock_dir,
            inspector,
            events,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, instance_id: &str, kind: InstanceEventKind) {
        log::debug!("Instance {} event: {:?}", instance_id, kind);
        let _ = self.events.send(InstanceEvent {
            instance_id: instance_id.to_string(),
            kind,
        });
    }

    /// Take the operation lock for `instance_id`, failing if another operation holds it,
    /// in this process or in another one sharing the data directory.
    pub(crate) fn try_lock(&self, instance_id: &str) -> Result<OperationGuard<'_>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.contains(instance_id) {
            return Err(AppError::operation_in_progress(instance_id));
        }
        self.claim_lock_file(instance_id)?;
        locks.insert(instance_id.to_string());
        Ok(OperationGuard {
            state: self,
            instance_id: instance_id.to_string(),
        })
    }

    fn lock_path(&self, instance_id: &str) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", instance_id))
    }

    /// Create `<id>.lock` holding our pid. A lock left by a dead process is replaced.
    fn claim_lock_file(&self, instance_id: &str) -> Result<()> {
        let path = self.lock_path(instance_id);
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !self.lock_is_stale(&path) {
                        return Err(AppError::operation_in_progress(instance_id));
                    }
                    log::warn!("Removing stale operation lock {:?}", path);
                    if let Err(e) = fs::remove_file(&path) {
                        if e.kind() != ErrorKind::NotFound {
                            return Err(e.into());
                        }
                    }
                }
                Err(e) => {
                    return Err(AppError::io(format!(
                        "Failed to create operation lock {:?}: {}",
                        path, e
                    )))
                }
            }
        }
        Err(AppError::operation_in_progress(instance_id))
    }

    fn lock_is_stale(&self, path: &std::path::Path) -> bool {
        let holder = fs::read_to_string(path)
            .ok()
            .and_then(|content| content.trim().parse::<u32>().ok());
        match holder {
            Some(pid) => !self.inspector.is_alive(pid),
            None => fs::metadata(path)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > UNWRITTEN_LOCK_GRACE),
        }
    }

    pub(crate) fn begin(&self, instance_id: &str, transition: Transition) {
        let mut transitions = self.transitions.write().unwrap_or_else(|e| e.into_inner());
        transitions.insert(instance_id.to_string(), transition);
    }

    pub(crate) fn finish(&self, instance_id: &str) {
        let mut transitions = self.transitions.write().unwrap_or_else(|e| e.into_inner());
        transitions.remove(instance_id);
    }

    pub(crate) fn transition(&self, instance_id: &str) -> Option<Transition> {
        let transitions = self.transitions.read().unwrap_or_else(|e| e.into_inner());
        transitions.get(instance_id).copied()
    }

    pub(crate) fn runtime(&self, instance_id: &str) -> RuntimeStatus {
        let runtime = self.runtime.read().unwrap_or_else(|e| e.into_inner());
        runtime.get(instance_id).cloned().unwrap_or_default()
    }

    pub(crate) fn set_runtime(&self, instance_id: &str, status: RuntimeStatus) {
        let mut runtime = self.runtime.write().unwrap_or_else(|e| e.into_inner());
        runtime.insert(instance_id.to_string(), status);
    }

    /// Apply `f` to the status of `instance_id` if it is still tracked.
    pub(crate) fn update_runtime(&self, instance_id: &str, f: impl FnOnce(&mut RuntimeStatus)) {
        let mut runtime = self.runtime.write().unwrap_or_else(|e| e.into_inner());
        if let Some(status) = runtime.get_mut(instance_id) {
            f(status);
        }
    }

    pub(crate) fn forget(&self, instance_id: &str) {
        self.runtime
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(instance_id);
        self.finish(instance_id);
    }

    /// Transition first, else the status derived from runtime facts.
    pub(crate) fn status(&self, instance_id: &str) -> InstanceStatus {
        match self.transition(instance_id) {
            Some(t) => t.into(),
            None => self.runtime(instance_id).derive_status(),
        }
    }
}
