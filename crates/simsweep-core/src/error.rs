use std::path::PathBuf;

use crate::registry::CaseId;

/// Faults that stop a sweep invocation before durable state is touched.
///
/// Per-case execution problems are not represented here; they are recorded
/// as [`crate::CaseStatus`] data and never surface as `Err`.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("configuration error for parameter '{key}': {message}")]
    Configuration { key: String, message: String },

    #[error("sweep location already exists: {} (use force to rebuild)", .path.display())]
    AlreadyExists { path: PathBuf },

    #[error("no sweep registry found at {}", .path.display())]
    RegistryMissing { path: PathBuf },

    #[error("malformed registry {}: {message}", .path.display())]
    MalformedRegistry { path: PathBuf, message: String },

    #[error("rendering case {case_id} failed: {message}")]
    Render { case_id: CaseId, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SweepError {
    pub(crate) fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        SweepError::Configuration {
            key: key.into(),
            message: message.into(),
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        SweepError::MalformedRegistry {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code for JSON error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            SweepError::Configuration { .. } => "configuration_error",
            SweepError::AlreadyExists { .. } => "already_exists",
            SweepError::RegistryMissing { .. } => "registry_missing",
            SweepError::MalformedRegistry { .. } => "malformed_registry",
            SweepError::Render { .. } => "render_failed",
            SweepError::Io(_) | SweepError::Csv(_) | SweepError::Json(_) => "io_error",
        }
    }
}

pub type Result<T, E = SweepError> = std::result::Result<T, E>;
