//! Backup engine module: encrypted credential storage, scheduled logical
//! dumps, rolling retention, restore orchestration, and the audit ledger.

pub mod engine;
pub mod ledger;
pub mod lock;
pub mod naming;
pub mod retention;
pub mod scheduler;
pub mod settings;
pub mod setup;
pub mod tools;
pub mod vault;

use serde::{Deserialize, Serialize};

/// Error type for backup engine operations
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("backup is not configured")]
    NotConfigured,

    #[error("backup settings are incomplete: {0}")]
    IncompleteSettings(String),

    #[error("operation already in progress: {operation}")]
    OperationInProgress { operation: String },

    #[error("required tool not found: {tool}")]
    ToolNotFound { tool: &'static str },

    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    #[error("invalid backup file name: {name}")]
    InvalidFileName { name: String },

    #[error("backup artifact missing: {path}")]
    MissingArtifact { path: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for backup engine operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// What an audited run attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunAction {
    Backup,
    Restore,
    Setup,
}

impl RunAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunAction::Backup => "backup",
            RunAction::Restore => "restore",
            RunAction::Setup => "setup",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "backup" => Some(RunAction::Backup),
            "restore" => Some(RunAction::Restore),
            "setup" => Some(RunAction::Setup),
            _ => None,
        }
    }
}

/// How a run was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Manual,
    Automatic,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Manual => "manual",
            RunMode::Automatic => "automatic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(RunMode::Manual),
            "automatic" => Some(RunMode::Automatic),
            _ => None,
        }
    }
}

/// Lifecycle status of a run: created `Running`, finished exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }
}

/// Who triggered a manual operation, as supplied by the session layer.
/// Automatic runs carry no actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub email: String,
}
