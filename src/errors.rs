//! Typed error taxonomy for the subsystems that need to classify failures
//! rather than just bubble up an opaque `anyhow::Error`. Orchestration code
//! (the driver, the scheduler) still works in `anyhow::Result` and attaches
//! `.context(...)`; these enums exist at the seams where a caller needs to
//! `match` on *what kind* of thing went wrong (spec.md §7).

use thiserror::Error;

/// Errors raised by [`crate::workspace::WorkspaceManager`].
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("credential validation failed: {0}")]
    InvalidCredential(String),

    #[error("clone repository failed: {0}")]
    CloneFailed(String),

    #[error("checkout failed: {0}")]
    CheckoutFailed(String),

    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("no changes to commit")]
    NoChanges,

    #[error("push failed: {0:?}")]
    PushFailed(PushFailureKind),

    #[error("workspace reset failed: {0}")]
    ResetFailed(String),

    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("git subprocess timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Classification of a failed `git push`, derived from matching output
/// substrings (spec.md §4.4 `Push`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFailureKind {
    Authentication,
    Permission,
    Network,
    Other(String),
}

/// Errors raised by [`crate::container::ContainerExecutor`].
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("docker unavailable: {0}")]
    DockerUnavailable(String),

    #[error("container exited with error: {stderr_excerpt}")]
    RuntimeError { stderr_excerpt: String },

    #[error("container run timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("container run was cancelled")]
    Cancelled,

    #[error("failed to spawn subprocess: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors raised while validating or decrypting a [`crate::models::Credential`].
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("username and password must both be non-empty")]
    EmptyPasswordFields,

    #[error("token secret must be non-empty")]
    EmptyToken,

    #[error("ssh private key does not look like a PEM private key")]
    MalformedSshKey,

    #[error("decryption failed: {0}")]
    DecryptFailed(String),
}

/// Errors raised by [`crate::result_parser::ResultParser`].
#[derive(Debug, Error)]
pub enum ResultParseError {
    #[error("no result record found in execution log")]
    NotFound,

    #[error("result record missing required field: {0}")]
    MissingField(&'static str),
}
