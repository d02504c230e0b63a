//! Typed configuration structs the core is constructed from.
//!
//! YAML loading and plugin registration stay out of scope (spec §1);
//! these are the plain, `serde`-derived structs an owning application
//! builds directly or deserializes from its own config format upstream
//! of this crate, the way `SupervisorConfig`
//! (`rust-srec/src/scheduler/actor/supervisor.rs`) is constructed.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Feeds the resource manager's per-kind `max` (spec §4.A). CACHE has no
/// field here: its quota is either the CAS helper's on-disk quota
/// (`CasdConfig::cache_quota`) or unbounded, guarded solely by the
/// exclusive-interest protocol (DESIGN.md Open Question 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuotas {
    pub builders: u32,
    pub fetchers: u32,
    pub pushers: u32,
}

impl Default for ResourceQuotas {
    fn default() -> Self {
        Self {
            builders: 4,
            fetchers: 4,
            pushers: 4,
        }
    }
}

/// Log verbosity passed through to `buildbox-casd --log-level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CasdLogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl CasdLogLevel {
    pub fn as_arg(self) -> &'static str {
        match self {
            CasdLogLevel::Error => "error",
            CasdLogLevel::Warning => "warning",
            CasdLogLevel::Info => "info",
            CasdLogLevel::Debug => "debug",
            CasdLogLevel::Trace => "trace",
        }
    }
}

impl Default for CasdLogLevel {
    fn default() -> Self {
        CasdLogLevel::Info
    }
}

/// Feeds the CAS helper process manager (spec §4.F).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasdConfig {
    pub storage_path: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: CasdLogLevel,
    pub cache_quota: Option<u64>,
    pub protect_session_blobs: bool,
}

impl CasdConfig {
    pub fn new(storage_path: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            log_dir: log_dir.into(),
            log_level: CasdLogLevel::default(),
            cache_quota: None,
            protect_session_blobs: false,
        }
    }

    pub fn with_cache_quota(mut self, quota: u64) -> Self {
        self.cache_quota = Some(quota);
        self
    }

    pub fn with_protect_session_blobs(mut self, protect: bool) -> Self {
        self.protect_session_blobs = protect;
        self
    }
}
