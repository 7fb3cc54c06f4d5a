//! Error types for the orchestration engine.

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    Open(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Corrupt record: {entity} {id}: {reason}")]
    Corrupt {
        entity: String,
        id: String,
        reason: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} already has a live controller pair")]
    AlreadyRunning { id: Uuid },

    #[error("Task {id} in status {from}, cannot transition to {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("Report rejected for task {id}: {reason}")]
    ReportRejected { id: Uuid, reason: String },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Subprocess session errors.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed to spawn session: {0}")]
    Spawn(String),

    #[error("Session {id} not found")]
    SessionNotFound { id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Scheduled-job errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Delivery failed for job {id}: {reason}")]
    Delivery { id: Uuid, reason: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
