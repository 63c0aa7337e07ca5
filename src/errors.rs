//! Typed error hierarchy for the job lifecycle.
//!
//! `JobError` covers both the command surface (authorization and state
//! validation, reported synchronously to the caller) and the execution
//! phase (repo sync, agent, publish — these move the job to `Failed`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("No repository configured for key '{0}'")]
    UnknownRepoMapping(String),

    #[error("Actor {0} is not an authorized owner")]
    NotAuthorized(String),

    #[error("Action '{action}' is not valid in state '{from}'")]
    InvalidState { from: String, action: String },

    #[error("Job {0} was already claimed for execution")]
    AlreadyClaimed(i64),

    #[error("Job {0} has no instructions to act on")]
    NoInstructions(i64),

    #[error("Job {0} not found")]
    JobNotFound(i64),

    #[error("Repository sync failed: {0}")]
    RepoSyncError(String),

    #[error("Agent run failed: {0}")]
    AgentFailure(String),

    #[error("Publishing changes failed: {0}")]
    PublishFailure(String),

    /// Recorded as `last_error` by startup recovery; the literal doubles
    /// as the marker owners see when a restart cut an attempt short.
    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    /// Execution-phase errors terminate the attempt and move the job to
    /// `Failed`; command-surface errors are reported and mutate nothing.
    pub fn is_execution_error(&self) -> bool {
        matches!(
            self,
            Self::RepoSyncError(_) | Self::AgentFailure(_) | Self::PublishFailure(_)
        )
    }
}
