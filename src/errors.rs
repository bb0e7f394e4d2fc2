//! Typed error hierarchy for mender.
//!
//! Three top-level enums cover the three subsystems:
//! - `SandboxError` — provisioning and in-sandbox execution failures
//! - `OrchestratorError` — task pipeline failures (anything here lands the
//!   task in `Failed`, never in `Escalated`)
//! - `ToolError` — verifier tool surface failures, always reported as
//!   structured results rather than propagated

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from sandbox provisioning and execution.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to provision sandbox: {reason}")]
    Provisioning { reason: String },

    #[error("Docker API error: {0}")]
    Docker(String),

    #[error("Command exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("Execution failed: {reason}")]
    Exec { reason: String },

    #[error("Sandbox {id} is no longer alive")]
    Dead { id: String },

    #[error("Workspace I/O error at {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors from the orchestrator pipeline. These are internal faults: gate
/// failures and empty patches are retry events, not errors, and never appear
/// here.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("No sandbox available within {0:?} and on-demand provisioning failed")]
    AcquireFailed(Duration),

    #[error("Failed to write patch into sandbox at {path}: {source}")]
    PatchWrite {
        path: PathBuf,
        #[source]
        source: SandboxError,
    },

    #[error("Gate command failed to execute: {0}")]
    GateCommand(#[source] SandboxError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the verifier tool surface. `ToolRegistry::execute` converts
/// these into error-shaped JSON results; they never cross the registry
/// boundary as Rust errors.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool '{name}'")]
    UnknownTool { name: String },

    #[error("Invalid parameters for '{tool}': {message}")]
    InvalidParams { tool: String, message: String },

    #[error("Tool '{tool}' failed: {source}")]
    Execution {
        tool: String,
        #[source]
        source: SandboxError,
    },
}
