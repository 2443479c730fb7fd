// src/core/errors.rs

//! Defines the primary error type for the agent.

use thiserror::Error;

/// The main error enum, covering the store, the database driver, and the
/// membership protocol.
///
/// Race outcomes (`AlreadyExists`, `NoNode`) are ordinary values during
/// elections and are absorbed at call sites; `SessionLost` is the single
/// fatal variant and terminates the agent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CmError {
    #[error("store error: {0}")]
    Store(String),

    #[error("coordination session lost")]
    SessionLost,

    #[error("node already exists: {0}")]
    AlreadyExists(String),

    #[error("no such node: {0}")]
    NoNode(String),

    #[error("database error: {0}")]
    Db(String),

    #[error("physical replication is not streaming on {0}")]
    DbNotStreaming(String),

    #[error("supplement pool '{0}' is empty")]
    SupplementExhausted(String),

    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("io error: {0}")]
    Io(String),
}

impl CmError {
    /// Whether this error is an expected race outcome that callers may
    /// swallow.
    pub fn is_race(&self) -> bool {
        matches!(self, CmError::AlreadyExists(_) | CmError::NoNode(_))
    }
}

impl From<std::io::Error> for CmError {
    fn from(e: std::io::Error) -> Self {
        CmError::Io(e.to_string())
    }
}

impl From<tokio_postgres::Error> for CmError {
    fn from(e: tokio_postgres::Error) -> Self {
        CmError::Db(e.to_string())
    }
}

/// Result alias used throughout the agent.
pub type CmResult<T> = Result<T, CmError>;

/// Collapses an `AlreadyExists` outcome into success. Used where losing a
/// creation race is the expected path.
pub fn absorb_exists(res: CmResult<()>) -> CmResult<()> {
    match res {
        Err(CmError::AlreadyExists(_)) => Ok(()),
        other => other,
    }
}

/// Collapses a `NoNode` outcome into success. Used for best-effort deletes.
pub fn absorb_no_node(res: CmResult<()>) -> CmResult<()> {
    match res {
        Err(CmError::NoNode(_)) => Ok(()),
        other => other,
    }
}
