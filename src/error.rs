//! Orchestrator error types.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// Orchestrator error carrying a kind and a flat string payload.
#[derive(Debug, Clone)]
pub struct AppError {
    payload: BTreeMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A port needed by the instance is already bound
    PortConflict,
    /// The browser profile directory is locked or in use
    ProfileLocked,
    /// No browser or app runtime executable could be found
    ExecutableNotFound,
    /// The shared bundle or the instance runtime directory is missing
    RuntimeMissing,
    /// A managed process did not become ready in time
    StartupTimeout,
    /// The app failed after the browser had started; the browser was rolled back
    PartialStartFailure,
    /// A process ignored the graceful signal and had to be killed
    GracefulShutdownTimeout,
    /// Another start/stop/restart is in flight for the instance
    OperationInProgress,
    /// Instance not found
    InstanceNotFound,
    /// Template not found in the catalog
    TemplateNotFound,
    /// Configuration failed to parse or validate
    ConfigValidation,
    /// File system error
    Io,
    /// Network error
    Network,
    /// Process error
    Process,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::InstanceNotFound => 1001,
            Self::TemplateNotFound => 1002,
            Self::OperationInProgress => 1003,
            Self::ConfigValidation => 2001,
            Self::Io => 2002,
            Self::Network => 2003,
            Self::PortConflict => 3001,
            Self::ProfileLocked => 3002,
            Self::ExecutableNotFound => 3003,
            Self::RuntimeMissing => 3004,
            Self::StartupTimeout => 3005,
            Self::PartialStartFailure => 3006,
            Self::GracefulShutdownTimeout => 3007,
            Self::Process => 3008,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: BTreeMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            BTreeMap::new()
        } else {
            BTreeMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn port_conflict(port: u16) -> Self {
        Self::new(
            ErrorKind::PortConflict,
            BTreeMap::from([("port".to_string(), port.to_string())]),
        )
    }

    pub fn ports_exhausted(start: u16) -> Self {
        Self::new(
            ErrorKind::PortConflict,
            BTreeMap::from([
                ("port".to_string(), start.to_string()),
                ("detail".to_string(), "no free port above start".to_string()),
            ]),
        )
    }

    pub fn profile_locked(profile_dir: &str, pid: Option<u32>) -> Self {
        let mut payload = BTreeMap::from([("profile_dir".to_string(), profile_dir.to_string())]);
        if let Some(pid) = pid {
            payload.insert("pid".to_string(), pid.to_string());
        }
        Self::new(ErrorKind::ProfileLocked, payload)
    }

    pub fn executable_not_found(what: &str) -> Self {
        Self::new(
            ErrorKind::ExecutableNotFound,
            BTreeMap::from([("executable".to_string(), what.to_string())]),
        )
    }

    pub fn runtime_missing(path: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::RuntimeMissing,
            BTreeMap::from([("path".to_string(), path.into())]),
        )
    }

    pub fn startup_timeout(process: &str, secs: u64) -> Self {
        Self::new(
            ErrorKind::StartupTimeout,
            BTreeMap::from([
                ("process".to_string(), process.to_string()),
                ("timeout_secs".to_string(), secs.to_string()),
            ]),
        )
    }

    /// Wrap the app-side failure that forced a browser rollback.
    pub fn partial_start_failure(cause: &Self) -> Self {
        let mut payload = cause.payload.clone();
        payload.insert("cause".to_string(), cause.message());
        Self::new(ErrorKind::PartialStartFailure, payload)
    }

    pub fn graceful_shutdown_timeout(pid: u32, secs: u64) -> Self {
        Self::new(
            ErrorKind::GracefulShutdownTimeout,
            BTreeMap::from([
                ("pid".to_string(), pid.to_string()),
                ("timeout_secs".to_string(), secs.to_string()),
            ]),
        )
    }

    pub fn operation_in_progress(id: &str) -> Self {
        Self::new(
            ErrorKind::OperationInProgress,
            BTreeMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn instance_not_found(id: &str) -> Self {
        Self::new(
            ErrorKind::InstanceNotFound,
            BTreeMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn template_not_found(kind: &str) -> Self {
        Self::new(
            ErrorKind::TemplateNotFound,
            BTreeMap::from([("type".to_string(), kind.to_string())]),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::ConfigValidation, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Network, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    /// Attach the tail of a process log for diagnostics.
    pub fn with_log_tail(mut self, lines: &[String]) -> Self {
        if !lines.is_empty() {
            self.payload.insert("log_tail".to_string(), lines.join("\n"));
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn payload(&self) -> &BTreeMap<String, String> {
        &self.payload
    }

    pub fn log_tail(&self) -> Option<&str> {
        self.payload.get("log_tail").map(String::as_str)
    }

    /// Human-readable message for the command layer.
    pub fn message(&self) -> String {
        let get = |key: &str| self.payload.get(key).map(String::as_str).unwrap_or("?");
        let base = match self.kind {
            ErrorKind::PortConflict => format!("port {} is already in use", get("port")),
            ErrorKind::ProfileLocked => match self.payload.get("pid") {
                Some(pid) => format!(
                    "profile {} is in use by process {}",
                    get("profile_dir"),
                    pid
                ),
                None => format!(
                    "profile {} is locked; clean up stale locks if no browser is running",
                    get("profile_dir")
                ),
            },
            ErrorKind::ExecutableNotFound => {
                format!("{} executable not found", get("executable"))
            }
            ErrorKind::RuntimeMissing => format!("runtime not found at {}", get("path")),
            ErrorKind::StartupTimeout => format!(
                "{} did not become ready within {}s",
                get("process"),
                get("timeout_secs")
            ),
            ErrorKind::PartialStartFailure => format!(
                "app failed to start, browser was stopped: {}",
                get("cause")
            ),
            ErrorKind::GracefulShutdownTimeout => format!(
                "process {} did not exit within {}s, force killing",
                get("pid"),
                get("timeout_secs")
            ),
            ErrorKind::OperationInProgress => {
                format!("an operation is already in progress for {}", get("id"))
            }
            ErrorKind::InstanceNotFound => format!("instance {} not found", get("id")),
            ErrorKind::TemplateNotFound => format!("template {} not found", get("type")),
            ErrorKind::ConfigValidation
            | ErrorKind::Io
            | ErrorKind::Network
            | ErrorKind::Process
            | ErrorKind::Other => format!("{:?}", self.kind),
        };
        match (self.kind, self.payload.get("detail")) {
            (ErrorKind::PortConflict, Some(detail)) => format!("{base} ({detail})"),
            (_, Some(detail)) => format!("{base}: {detail}"),
            (_, None) => base,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 4)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("message", &self.message())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}

impl From<walkdir::Error> for AppError {
    fn from(err: walkdir::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
