//! Typed error hierarchy for the workflow engine.
//!
//! A single `DomainError` enum covers every failure the engine itself can
//! produce, replacing the prose error "kinds" with real variants. Each
//! variant maps to an `ErrorKind` tag (see [`DomainError::kind`]) that
//! survives a round trip through a checkpoint's JSON payload, so a resuming
//! process can recover the kind without re-parsing an error string.

use thiserror::Error;

/// Coarse classification of a [`DomainError`], persisted in error checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    State,
    Transient,
    PermanentAgent,
    Budget,
    Merge,
    Policy,
    Parse,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::State => "state",
            ErrorKind::Transient => "transient",
            ErrorKind::PermanentAgent => "permanent_agent",
            ErrorKind::Budget => "budget",
            ErrorKind::Merge => "merge",
            ErrorKind::Policy => "policy",
            ErrorKind::Parse => "parse",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Errors produced by the workflow engine.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("no state to resume for workflow {workflow_id}")]
    NoStateToResume { workflow_id: String },

    #[error("missing consolidated analysis for workflow {workflow_id}")]
    MissingConsolidatedAnalysis { workflow_id: String },

    #[error("workflow {workflow_id} was cancelled")]
    Cancelled { workflow_id: String },

    #[error("transient failure: {message}")]
    Transient { message: String, retryable: bool },

    #[error("agent '{agent}' failed permanently: {message}")]
    PermanentAgent { agent: String, message: String },

    #[error("cost budget exceeded for {scope}: {spent:.4} > {limit:.4}")]
    Budget {
        scope: String,
        spent: f64,
        limit: f64,
    },

    #[error("merge conflict merging {task_branch} into {target_branch}")]
    Merge {
        task_branch: String,
        target_branch: String,
    },

    #[error("operation '{operation}' denied: {reason}")]
    Policy { operation: String, reason: String },

    #[error("failed to parse {what}: {message}")]
    Parse { what: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error("consensus failed for workflow {workflow_id} at round {round}: score {score:.2} below abort threshold {threshold:.2}")]
    ConsensusFailure {
        workflow_id: String,
        round: u32,
        score: f64,
        threshold: f64,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DomainError {
    /// Coarse tag used when writing error checkpoints.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DomainError::Validation(_) => ErrorKind::Validation,
            DomainError::NoStateToResume { .. }
            | DomainError::MissingConsolidatedAnalysis { .. }
            | DomainError::Cancelled { .. } => ErrorKind::State,
            DomainError::Transient { .. } => ErrorKind::Transient,
            DomainError::PermanentAgent { .. } => ErrorKind::PermanentAgent,
            DomainError::Budget { .. } => ErrorKind::Budget,
            DomainError::Merge { .. } => ErrorKind::Merge,
            DomainError::Policy { .. } => ErrorKind::Policy,
            DomainError::Parse { .. } => ErrorKind::Parse,
            DomainError::Internal(_) | DomainError::Other(_) | DomainError::ConsensusFailure { .. } => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether the retry executor should retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DomainError::Transient { retryable: true, .. })
    }

    /// Whether this error represents user cancellation rather than failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DomainError::Cancelled { .. })
    }

    /// Process exit code for the CLI, per `ErrorKind`.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Validation | ErrorKind::Policy | ErrorKind::Parse => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_retryable_flag_drives_is_retryable() {
        let retryable = DomainError::Transient {
            message: "timeout".into(),
            retryable: true,
        };
        assert!(retryable.is_retryable());

        let not_retryable = DomainError::Transient {
            message: "bad request".into(),
            retryable: false,
        };
        assert!(!not_retryable.is_retryable());
    }

    #[test]
    fn cancellation_is_not_a_plain_failure() {
        let err = DomainError::Cancelled {
            workflow_id: "wf-1".into(),
        };
        assert!(err.is_cancellation());
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[test]
    fn kind_mapping_is_stable() {
        assert_eq!(
            DomainError::Budget {
                scope: "task".into(),
                spent: 1.1,
                limit: 1.0
            }
            .kind(),
            ErrorKind::Budget
        );
        assert_eq!(
            DomainError::Merge {
                task_branch: "a".into(),
                target_branch: "b".into()
            }
            .kind(),
            ErrorKind::Merge
        );
    }

    #[test]
    fn exit_codes_separate_user_errors_from_runtime_errors() {
        assert_eq!(DomainError::Validation("bad".into()).exit_code(), 2);
        assert_eq!(DomainError::Internal("boom".into()).exit_code(), 1);
    }
}
