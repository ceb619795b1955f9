use thiserror::Error;

/// Failure taxonomy for the delivery layer. Request-level failures travel as
/// data on the request (`Outcome::Failed` plus a message); this enum is used
/// at API boundaries and for the orchestrator's terminal outcomes.
#[derive(Debug, Error)]
pub enum ContentError {
    /// The requested path/key is absent from every manifest.
    #[error("not found: {0}")]
    NotFound(String),

    /// Network or file failure. Retryable at the caller's discretion.
    #[error("transient i/o failure: {0}")]
    Transient(String),

    /// The remote version set is not strictly newer than the local one.
    /// Benign, reported as "nothing to update" rather than surfaced.
    #[error("remote version set is not newer than the local one")]
    VersionConflict,

    /// An expected file is missing from a downloaded patch archive. Fatal to
    /// the patch step only.
    #[error("corrupt patch: {0}")]
    CorruptPatch(String),

    /// The remote player version forces an external installer redirect.
    /// Fatal to the session.
    #[error("player update required: remote {remote} vs local {local}")]
    MajorVersionMismatch { remote: String, local: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
