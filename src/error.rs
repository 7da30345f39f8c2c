//! Error taxonomy (spec §7).
//!
//! Generators and the process runner surface one of these kinds; the
//! dispatcher maps them onto a job's terminal `state`/`error` fields.
//! Everything below the domain boundary (I/O, JSON, ambient plumbing) is
//! folded into `Other` rather than growing the taxonomy, the same split the
//! teacher draws between its typed settings/tool errors and `anyhow::Result`
//! at the outer seams.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("canceled")]
    Canceled,

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("process exited with status {code:?}: {stderr}")]
    NonzeroExit { code: Option<i32>, stderr: String },

    #[error("dependency missing: {0}")]
    DependencyMissing(String),

    #[error("generator would have written a stub artifact for {kind} at {path:?}")]
    StubRejected { kind: &'static str, path: PathBuf },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The job state a dispatcher should transition to when this error
    /// terminates a generator run, and whether `error` should be populated
    /// (spec §7: `canceled` leaves `error` unset).
    pub fn job_state(&self) -> (crate::domain::job::JobState, Option<String>) {
        use crate::domain::job::JobState;
        match self {
            Error::Canceled => (JobState::Canceled, None),
            other => (JobState::Failed, Some(other.to_string())),
        }
    }
}
