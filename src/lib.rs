//! Orchestrates fleets of agent instances, each a controlled browser paired with an
//! application server on its own ports, profile, and runtime directory.

pub mod commands;
pub mod config;
pub mod error;
pub mod instance;
pub mod paths;
pub mod process;
pub mod runtime;
pub mod templates;
pub mod validation;

pub use error::{AppError, ErrorKind, Result};
pub use instance::Orchestrator;
