//! Cooperative cancellation and the per-job sentinel files.
//!
//! Cancellation is edge-triggered and monotonic: once set, a token stays
//! set. Workers check the token between bounded units of work (after each
//! partition tile, at solver depth boundaries, before each verification).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::warn;

/// Cloneable cancellation handle shared by every worker of a job.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    /// Marker file mirrored by `cancel()` so that sibling jobs watching
    /// the sentinel directory observe the signal too.
    file: Arc<Mutex<Option<PathBuf>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    /// Request cancellation. Safe to call from any thread, any number of
    /// times; there is no un-cancel.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Some(path) = self.file.lock().unwrap().as_ref() {
            if let Err(e) = std::fs::write(path, b"cancel") {
                warn!("could not write cancel sentinel {:?}: {}", path, e);
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Also consult the sentinel file; called at coarse boundaries where a
    /// stat() is affordable.
    pub fn check_sentinel(&self) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let exists = self
            .file
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.exists())
            .unwrap_or(false);
        if exists {
            self.flag.store(true, Ordering::SeqCst);
        }
        exists
    }

    pub(crate) fn bind_file(&self, path: PathBuf) {
        *self.file.lock().unwrap() = Some(path);
    }

    pub(crate) fn unbind_file(&self) {
        *self.file.lock().unwrap() = None;
    }
}

/// The `cancel`/`solved` marker pair for one solve job. Both live in a
/// single per-job directory; the driver removes them on termination.
pub struct JobSentinels {
    cancel_path: PathBuf,
    solved_path: PathBuf,
    solved_flag: Arc<AtomicBool>,
}

impl JobSentinels {
    pub fn create_in(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create sentinel dir {:?}", dir))?;
        let sentinels = JobSentinels {
            cancel_path: dir.join("cancel"),
            solved_path: dir.join("solved"),
            solved_flag: Arc::new(AtomicBool::new(false)),
        };
        // Stale markers from a crashed sibling must not abort a new job.
        let _ = std::fs::remove_file(&sentinels.cancel_path);
        let _ = std::fs::remove_file(&sentinels.solved_path);
        Ok(sentinels)
    }

    pub fn cancel_path(&self) -> &Path {
        &self.cancel_path
    }

    /// Mark that a child solver has crossed the solve threshold. The first
    /// writer wins; siblings observe the flag and stop.
    pub fn mark_solved(&self) {
        self.solved_flag.store(true, Ordering::SeqCst);
        if let Err(e) = std::fs::write(&self.solved_path, b"solved") {
            warn!("could not write solved sentinel {:?}: {}", self.solved_path, e);
        }
    }

    pub fn is_solved(&self) -> bool {
        self.solved_flag.load(Ordering::SeqCst)
    }

    /// Flag plus file check, for observation across jobs.
    pub fn check_solved_sentinel(&self) -> bool {
        if self.is_solved() {
            return true;
        }
        let exists = self.solved_path.exists();
        if exists {
            self.solved_flag.store(true, Ordering::SeqCst);
        }
        exists
    }

    pub fn cleanup(&self) {
        let _ = std::fs::remove_file(&self.cancel_path);
        let _ = std::fs::remove_file(&self.solved_path);
    }
}

/// Wall-clock deadline for one solve job. Expiration behaves identically
/// to cancellation, except for the error it maps to.
#[derive(Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn after(limit: Option<Duration>) -> Self {
        Deadline { at: limit.map(|d| Instant::now() + d) }
    }

    pub fn none() -> Self {
        Deadline { at: None }
    }

    pub fn expired(&self) -> bool {
        self.at.is_some_and(|t| Instant::now() >= t)
    }
}
