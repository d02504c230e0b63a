//! CAS helper process manager: supervises a persistent `buildbox-casd`
//! subprocess (spec §4.F).
//!
//! Grounded on `original_source/.../casdprocessmanager.py` for the exact
//! spawn arguments, log rotation count, and termination ladder timings;
//! styled after `rust-srec/src/scheduler/resource.rs`'s `tracing`-based
//! status reporting.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::process::Child;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::config::CasdConfig;
use crate::error::{Result, SchedError};
use crate::messenger::{Message, Messenger};

/// Maximum log files retained in `log_dir`; rotation deletes the oldest
/// until at most `MAX_LOG_FILES - 1` remain before adding the new one
/// (Testable Property 6: ≤ 10 files after any construction).
const MAX_LOG_FILES: usize = 10;

const QUICK_TERMINATE_WAIT: Duration = Duration::from_millis(500);
const GRACEFUL_TERMINATE_WAIT: Duration = Duration::from_secs(15);
const POST_KILL_WAIT: Duration = Duration::from_secs(15);

/// Owns the `buildbox-casd` child process and its rendezvous socket for
/// the lifetime of a scheduling session.
pub struct CasdProcessManager {
    child: Child,
    socket_dir: tempfile::TempDir,
    socket_path: PathBuf,
    log_path: PathBuf,
}

impl CasdProcessManager {
    /// Spawn `buildbox-casd` per `config`. The socket directory is
    /// created outside `config.storage_path` to avoid UDS path-length
    /// limits under deeply nested storage roots.
    pub async fn spawn(config: &CasdConfig) -> Result<Self> {
        let binary = resolve_binary("buildbox-casd")?;

        let socket_dir = tempfile::tempdir().map_err(SchedError::Io)?;
        let socket_path = socket_dir.path().join("casd.sock");
        let connection = format!("unix:{}", socket_path.display());

        let log_path = rotate_and_allocate_log(&config.log_dir)?;
        let log_file = std::fs::File::create(&log_path).map_err(SchedError::Io)?;
        let log_file_err = log_file.try_clone().map_err(SchedError::Io)?;

        let mut command = process_utils::tokio_command(&binary);
        command
            .arg(format!("--bind={connection}"))
            .arg(format!("--log-level={}", config.log_level.as_arg()));

        if let Some(quota) = config.cache_quota {
            command.arg(format!("--quota-high={quota}"));
            command.arg(format!("--quota-low={}", quota / 2));
            if config.protect_session_blobs {
                command.arg("--protect-session-blobs");
            }
        }

        command
            .arg(&config.storage_path)
            .current_dir(&config.storage_path)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(log_file_err));

        block_sigint_in_child(&mut command);

        let child = command.spawn().map_err(SchedError::CasHelperSpawn)?;

        info!(socket = %socket_path.display(), log = %log_path.display(), "spawned buildbox-casd");

        Ok(Self { child, socket_dir, socket_path, log_path })
    }

    /// `unix:<path>` connection string for building a [`super::channel::CasdChannel`].
    pub fn connection(&self) -> String {
        format!("unix:{}", self.socket_path.display())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Tear down the child per the termination ladder (spec §4.F):
    /// already-exited check, quick terminate, graceful wait, kill, and
    /// socket directory cleanup. Reports anomalies through `messenger`.
    pub async fn release_resources(mut self, messenger: &dyn Messenger) {
        match self.child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                messenger.message(
                    Message::bug("buildbox-casd exited unexpectedly")
                        .with_detail(format!("exit status: {status}, log: {}", self.log_path.display())),
                );
                return;
            }
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "failed to poll buildbox-casd before teardown");
            }
        }

        send_terminate(&self.child);
        if timeout(QUICK_TERMINATE_WAIT, self.child.wait()).await.is_ok() {
            return;
        }

        info!("terminating buildbox-casd");
        if timeout(GRACEFUL_TERMINATE_WAIT, self.child.wait()).await.is_err() {
            warn!("buildbox-casd did not exit gracefully; killing");
            let _ = self.child.start_kill();
            if timeout(POST_KILL_WAIT, self.child.wait()).await.is_err() {
                error!("buildbox-casd did not exit even after kill");
            }
        }

        if let Ok(Some(status)) = self.child.try_wait() {
            if !status.success() {
                messenger.message(
                    Message::bug("buildbox-casd exited non-zero during teardown")
                        .with_detail(format!("exit status: {status}, log: {}", self.log_path.display())),
                );
            }
        }

        drop(self.socket_dir);
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {}

#[cfg(unix)]
fn block_sigint_in_child(command: &mut tokio::process::Command) {
    use std::os::unix::process::CommandExt;
    unsafe {
        command.pre_exec(|| {
            libc::signal(libc::SIGINT, libc::SIG_IGN);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn block_sigint_in_child(_command: &mut tokio::process::Command) {}

fn resolve_binary(name: &str) -> Result<PathBuf> {
    let path_var = std::env::var_os("PATH").ok_or_else(|| SchedError::CasHelperNotFound(name.to_string()))?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    Err(SchedError::CasHelperNotFound(name.to_string()))
}

fn rotate_and_allocate_log(log_dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(log_dir).map_err(SchedError::Io)?;

    let mut entries: Vec<(PathBuf, std::time::SystemTime)> = std::fs::read_dir(log_dir)
        .map_err(SchedError::Io)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "log"))
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((entry.path(), modified))
        })
        .collect();
    entries.sort_by_key(|(_, modified)| *modified);

    while entries.len() >= MAX_LOG_FILES {
        let (oldest, _) = entries.remove(0);
        if let Err(err) = std::fs::remove_file(&oldest) {
            warn!(path = %oldest.display(), error = %err, "failed to remove rotated casd log");
        }
    }

    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    Ok(log_dir.join(format!("{epoch}.log")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_keeps_at_most_max_minus_one_before_adding_new_log() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..12 {
            std::fs::write(dir.path().join(format!("{i}.log")), b"").unwrap();
        }

        let new_log = rotate_and_allocate_log(dir.path()).unwrap();
        std::fs::write(&new_log, b"").unwrap();

        let remaining = std::fs::read_dir(dir.path()).unwrap().count();
        assert!(remaining <= MAX_LOG_FILES, "expected <= {MAX_LOG_FILES} files, got {remaining}");
    }

    #[test]
    fn resolve_binary_fails_cleanly_for_a_name_not_on_path() {
        let err = resolve_binary("definitely-not-a-real-binary-xyz").unwrap_err();
        assert!(matches!(err, SchedError::CasHelperNotFound(_)));
    }
}
