//! Crate-wide error type.
//!
//! This covers the exceptional-control-flow part of the error taxonomy
//! in the scheduler's error handling design: job failures and
//! termination are scheduling *outcomes* (see [`crate::job::JobStatus`]
//! and [`crate::scheduler::SchedStatus`]), not `SchedError` variants.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SchedError>;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum SchedError {
    #[error("timed out waiting for buildbox-casd to become ready after {0:?}")]
    CasHelperStartTimeout(std::time::Duration),

    #[error("failed to spawn buildbox-casd: {0}")]
    CasHelperSpawn(#[source] std::io::Error),

    #[error("buildbox-casd could not be located on PATH: {0}")]
    CasHelperNotFound(String),

    #[error("gRPC channel to buildbox-casd failed: {0}")]
    Channel(#[from] tonic::transport::Error),

    #[error("lookup for plugin id {0} failed: no such plugin is registered")]
    PluginLookupMiss(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SchedError {
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
