use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::plan::Phase;

#[derive(Error, Debug)]
pub enum AssemblyError {
    // Definition errors
    #[error("Pipeline configuration error: {0}")]
    Config(String),

    #[error("Pipeline validation failed: {0}")]
    Validation(String),

    // Stage errors
    #[error("Fetch failed for stage '{stage}': {reason}")]
    Fetch { stage: String, reason: String },

    #[error("Build failed for stage '{stage}': {reason}")]
    Build { stage: String, reason: String },

    #[error("Extraction failed for stage '{stage}': {reason}")]
    Extraction { stage: String, reason: String },

    #[error("Merge failed for artifact from '{stage}': {reason}")]
    Merge { stage: String, reason: String },

    #[error("Install failed for '{package}': {reason}")]
    Install { package: String, reason: String },

    #[error("'{command}' in stage '{stage}' timed out after {seconds} seconds")]
    Timeout {
        stage: String,
        command: String,
        seconds: u64,
    },

    #[error("Stage '{stage}' was cancelled")]
    Cancelled { stage: String },

    #[error("Workspace is locked by another build: {path}")]
    Locked { path: String },

    // Pipeline-level wrapper naming the failing phase
    #[error("Pipeline failed during {phase}: {source}")]
    StageFailed {
        phase: Phase,
        #[source]
        source: Box<AssemblyError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AssemblyError {
    /// Phase a fatal error belongs to, when it can be derived from the kind.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Fetch { .. } => Some(Phase::Fetching),
            Self::Build { .. } => Some(Phase::Compiling),
            Self::Extraction { .. } => Some(Phase::Extracting),
            Self::Merge { .. } => Some(Phase::Merging),
            Self::Install { .. } => Some(Phase::Installing),
            Self::StageFailed { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// True for cancellation, including when wrapped in `StageFailed`.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::StageFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    pub(crate) fn in_phase(self, phase: Phase) -> Self {
        match self {
            already @ Self::StageFailed { .. } => already,
            other => Self::StageFailed {
                phase,
                source: Box::new(other),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, AssemblyError>;

/// Non-fatal problem found while rewriting interpreter lines.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RewriteWarning {
    pub path: PathBuf,
    pub reason: String,
}

impl fmt::Display for RewriteWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.reason)
    }
}
