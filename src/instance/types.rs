//! Instance-related type definitions.

use serde::Serialize;

use crate::config::InstanceConfig;
use crate::error::AppError;

/// User-facing lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// In-flight operation recorded while a start or stop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Starting,
    Stopping,
}

impl From<Transition> for InstanceStatus {
    fn from(t: Transition) -> Self {
        match t {
            Transition::Starting => Self::Starting,
            Transition::Stopping => Self::Stopping,
        }
    }
}

/// Last known runtime facts about an instance. Only the orchestrator writes these.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuntimeStatus {
    pub is_running: bool,
    pub browser_pid: Option<u32>,
    pub app_pid: Option<u32>,
    pub app_healthy: bool,
    pub control_healthy: bool,
    pub last_error: Option<String>,
}

impl RuntimeStatus {
    pub(crate) fn running(browser_pid: u32, app_pid: u32) -> Self {
        Self {
            is_running: true,
            browser_pid: Some(browser_pid),
            app_pid: Some(app_pid),
            app_healthy: true,
            control_healthy: true,
            last_error: None,
        }
    }

    pub(crate) fn failed(error: &AppError) -> Self {
        Self {
            last_error: Some(error.message()),
            ..Self::default()
        }
    }

    /// Status when no transition is in flight.
    pub fn derive_status(&self) -> InstanceStatus {
        if self.last_error.is_some() {
            InstanceStatus::Error
        } else if self.is_running && self.app_healthy && self.control_healthy {
            InstanceStatus::Running
        } else {
            InstanceStatus::Stopped
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceEventKind {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Added,
    Removed,
}

/// Broadcast whenever an instance changes state or membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceEvent {
    pub instance_id: String,
    pub kind: InstanceEventKind,
}

/// One row of `list`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    #[serde(flatten)]
    pub config: InstanceConfig,
    pub status: InstanceStatus,
    pub runtime: RuntimeStatus,
}

/// Per-instance result of a bulk operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationOutcome {
    pub instance_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
}

impl OperationOutcome {
    pub(crate) fn from_result(instance_id: &str, result: crate::error::Result<()>) -> Self {
        match result {
            Ok(()) => Self {
                instance_id: instance_id.to_string(),
                ok: true,
                error: None,
            },
            Err(e) => Self {
                instance_id: instance_id.to_string(),
                ok: false,
                error: Some(e),
            },
        }
    }
}
