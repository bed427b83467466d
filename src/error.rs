//! Structured error kinds shared by the import pipeline.
//!
//! Every variant maps to a stable `kind()` string so interactive callers, the
//! progress poller and the scheduler can branch on it without parsing messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unreachable: {0}")]
    Unreachable(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("source not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("path escapes the configured import root: {0}")]
    OutsideRoot(String),

    #[error("malformed source: {0}")]
    Malformed(String),
}

impl SourceError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::AuthFailed(_) => "auth_failed",
            Self::NotFound(_) => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::OutsideRoot(_) => "outside_root",
            Self::Malformed(_) => "malformed",
        }
    }

    pub(crate) fn from_io(err: std::io::Error, location: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(location.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(location.to_string()),
            _ => Self::Unreachable(format!("{location}: {err}")),
        }
    }
}

#[derive(Debug, Error)]
#[error("record store rejected {kind} record: {message}")]
pub struct RecordError {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("an import is already running (locked by {locked_by})")]
    AlreadyRunning { locked_by: String },

    #[error("invalid configuration: {}", errors.join("; "))]
    InvalidConfig { errors: Vec<String> },

    #[error("no column mapping saved for this import; review the source columns first")]
    MissingMapping,

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("import failed after {processed} rows: {message}")]
    ExecutionFailed { processed: u64, message: String },

    #[error("import state storage failed: {0}")]
    Storage(#[from] StoreError),
}

impl ImportError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyRunning { .. } => "already_running",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::MissingMapping => "missing_mapping",
            Self::Source(_) => "source",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::Storage(_) => "storage",
        }
    }

    pub fn details(&self) -> Vec<String> {
        match self {
            Self::InvalidConfig { errors } => errors.clone(),
            Self::Source(err) => vec![err.kind().to_string()],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("timer substrate does not support introspection")]
    IntrospectionUnsupported,

    #[error(transparent)]
    Storage(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unsupported frequency: {0}")]
    InvalidFrequency(String),

    #[error("a source is required to schedule an import")]
    MissingSource,

    #[error("unknown import source: {0}")]
    InvalidSource(String),

    #[error("timer substrate unavailable: {0}")]
    SubstrateUnavailable(String),

    #[error(transparent)]
    Timer(#[from] TimerError),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl SchedulerError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidFrequency(_) => "invalid_frequency",
            Self::MissingSource => "missing_source",
            Self::InvalidSource(_) => "invalid_source",
            Self::SubstrateUnavailable(_) => "substrate_unavailable",
            Self::Timer(_) => "timer",
            Self::Storage(_) => "storage",
        }
    }
}

impl From<rusqlite::Error> for TimerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StoreError::Sqlite(err))
    }
}

impl From<rusqlite::Error> for ImportError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StoreError::Sqlite(err))
    }
}
