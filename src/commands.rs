//! Command layer: clap subcommands dispatched to the orchestrator, answered with a JSON envelope.

use clap::{Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::instance::Orchestrator;
use crate::process::{AppDriver, BrowserDriver, ProcessKind, LOG_TAIL_LINES};

/// `{ok: true, data}` or `{ok: false, error}`.
#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
}

impl CommandResponse {
    pub fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result.and_then(|data| serde_json::to_value(data).map_err(AppError::from)) {
            Ok(data) => Self {
                ok: true,
                data: Some(data),
                error: None,
            },
            Err(error) => Self {
                ok: false,
                data: None,
                error: Some(error),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ProcessArg {
    Browser,
    App,
}

impl From<ProcessArg> for ProcessKind {
    fn from(arg: ProcessArg) -> Self {
        match arg {
            ProcessArg::Browser => Self::Browser,
            ProcessArg::App => Self::App,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    /// Show the current settings
    Get,
    /// Set one setting; an empty value restores its default
    Set { key: String, value: String },
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List instances with their status
    List,
    /// Create instances from a template
    Add {
        #[arg(long = "type", default_value = "default")]
        kind: String,
        #[arg(long, default_value_t = 1)]
        count: usize,
        #[arg(long)]
        id: Option<String>,
    },
    /// Stop and delete an instance
    Remove { id: String },
    /// Start one instance, or all when no id is given
    Start { id: Option<String> },
    /// Stop one instance, or all when no id is given
    Stop { id: Option<String> },
    /// Restart one instance, or all when no id is given
    Restart { id: Option<String> },
    /// Status of one instance
    Status { id: String },
    /// Read or change settings
    Settings {
        #[command(subcommand)]
        action: SettingsCommand,
    },
    /// List instance templates
    Templates,
    /// Show or clear the log tail of an instance process
    Logs {
        id: String,
        #[arg(long, value_enum, default_value = "app")]
        process: ProcessArg,
        #[arg(long, default_value_t = LOG_TAIL_LINES)]
        lines: usize,
        #[arg(long)]
        clear: bool,
    },
    /// Check that the shared application bundle is in place
    BundleStatus,
    /// Remove stale browser profile locks of an instance
    CleanupLocks { id: String },
    /// Kill processes holding the ports of an instance
    KillPort { id: String },
}

/// Apply `key=value` to the settings through their serialized form.
pub fn apply_setting(settings: &Settings, key: &str, value: &str) -> Result<Settings> {
    let mut fields = match serde_json::to_value(settings)? {
        Value::Object(map) => map,
        _ => return Err(AppError::other("settings did not serialize to an object")),
    };
    let known = serde_json::to_value(Settings {
        browser_path: Some(String::new()),
        app_runtime_path: Some(String::new()),
        bundle_dir: Some(String::new()),
        profiles_dir: Some(String::new()),
        ..Settings::default()
    })?;
    let Some(template) = known.get(key) else {
        return Err(AppError::config(format!("unknown setting {:?}", key)));
    };

    if value.is_empty() {
        fields.remove(key);
    } else if template.is_number() {
        let port: u16 = value
            .parse()
            .map_err(|_| AppError::config(format!("{} must be a port number", key)))?;
        fields.insert(key.to_string(), json!(port));
    } else {
        fields.insert(key.to_string(), json!(value));
    }

    Ok(serde_json::from_value(Value::Object(fields))?)
}

pub async fn dispatch<B, A>(orchestrator: &Orchestrator<B, A>, command: Command) -> CommandResponse
where
    B: BrowserDriver,
    A: AppDriver,
{
    match command {
        Command::List => CommandResponse::from_result(Ok(orchestrator.list_instances())),
        Command::Add { kind, count, id } => {
            CommandResponse::from_result(orchestrator.add_instances(&kind, count, id.as_deref()))
        }
        Command::Remove { id } => {
            CommandResponse::from_result(orchestrator.remove_instance(&id).await)
        }
        Command::Start { id: Some(id) } => {
            CommandResponse::from_result(orchestrator.start_instance(&id).await)
        }
        Command::Start { id: None } => {
            CommandResponse::from_result(Ok(orchestrator.start_all().await))
        }
        Command::Stop { id: Some(id) } => {
            CommandResponse::from_result(orchestrator.stop_instance(&id).await)
        }
        Command::Stop { id: None } => {
            CommandResponse::from_result(Ok(orchestrator.stop_all().await))
        }
        Command::Restart { id: Some(id) } => {
            CommandResponse::from_result(orchestrator.restart_instance(&id).await)
        }
        Command::Restart { id: None } => {
            CommandResponse::from_result(Ok(orchestrator.restart_all().await))
        }
        Command::Status { id } => CommandResponse::from_result(orchestrator.get_status(&id)),
        Command::Settings {
            action: SettingsCommand::Get,
        } => CommandResponse::from_result(Ok(orchestrator.get_settings())),
        Command::Settings {
            action: SettingsCommand::Set { key, value },
        } => CommandResponse::from_result(
            apply_setting(&orchestrator.get_settings(), &key, &value)
                .and_then(|settings| orchestrator.update_settings(settings)),
        ),
        Command::Templates => {
            CommandResponse::from_result(Ok(&orchestrator.templates().templates))
        }
        Command::Logs {
            id,
            process,
            lines,
            clear,
        } => {
            if clear {
                CommandResponse::from_result(orchestrator.clear_log(&id, process.into()))
            } else {
                CommandResponse::from_result(orchestrator.read_log_tail(&id, process.into(), lines))
            }
        }
        Command::BundleStatus => CommandResponse::from_result(Ok(
            json!({ "present": orchestrator.runtime_bundle_present() }),
        )),
        Command::CleanupLocks { id } => {
            CommandResponse::from_result(orchestrator.cleanup_profile_locks(&id))
        }
        Command::KillPort { id } => {
            CommandResponse::from_result(orchestrator.kill_port_occupants(&id))
        }
    }
}
