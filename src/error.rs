//! Error types for the worker supervisor.

use std::path::PathBuf;

/// Top-level error type for the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Instance error: {0}")]
    Instance(#[from] InstanceError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Client-visible lifecycle errors. Everything else a worker does wrong is
/// reported through the instance's status and event stream instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstanceError {
    #[error("Instance {id} not found")]
    NotFound { id: String },

    #[error("Instance {id} is already running")]
    AlreadyRunning { id: String },

    #[error("Instance {id} is running; stop it first or force the delete")]
    StillRunning { id: String },
}

/// The worker executable could not be launched.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker {program} started without a {stream} pipe")]
    MissingPipe {
        program: String,
        stream: &'static str,
    },
}

/// Config artifact write/remove failures.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Failed to write config artifact {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove config artifact {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Snapshot read/write failures. Never fatal to the serving path.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt snapshot {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Notification dispatch failures.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notifier {name} is misconfigured: {reason}")]
    Misconfigured { name: String, reason: String },

    #[error("Notifier {name} failed to deliver: {reason}")]
    DeliveryFailed { name: String, reason: String },
}

/// Result type alias for the supervisor.
pub type Result<T> = std::result::Result<T, Error>;
