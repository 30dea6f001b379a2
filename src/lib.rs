#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![warn(clippy::format_push_string)]

pub mod controller;
pub mod format;
pub mod ids;
pub mod job;
pub mod progress_styles;
pub mod scheduler;
pub mod site;
pub mod store;
pub mod wrapper;

use std::io;
use std::path::PathBuf;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget};

/// Default name of the state database file.
pub const DEFAULT_DATABASE_NAME: &str = "submitted.sql3";

/// The reserved queue name that always routes through the local scheduler.
pub const LOCAL_QUEUE_NAME: &str = "local";

/// The environment variable the `--local` CLI flag falls back to. The local scheduler sets
/// this explicitly on every wrapper process it spawns, since a CLI flag given to the parent
/// `jobctl` invocation never propagates to a child process on its own.
pub const LOCAL_ENV_VAR: &str = "JOBCTL_LOCAL";

/// Exit code recorded when a child process could not be spawned.
pub const SPAWN_FAILURE_RESULT: i64 = 117;

/// Exit code recorded when the execution wrapper panics or errors internally.
pub const WRAPPER_FAILURE_RESULT: i64 = 69;

/// Exit code recorded when a grid job vanishes from the queue unexpectedly.
pub const VANISHED_RESULT: i64 = 70;

/// Sentinel array index used to finalize an array job with no remaining tasks.
pub const FINALIZE_SENTINEL: i64 = -1;

/// Errors that may be encountered when using the jobctl engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // IO errors
    #[error("I/O error: {0}")]
    IO(#[from] io::Error),

    #[error("Unable to read '{0}': {1}")]
    FileRead(PathBuf, #[source] io::Error),

    #[error("Unable to write '{0}': {1}")]
    FileWrite(PathBuf, #[source] io::Error),

    #[error("Unable to remove '{0}': {1}")]
    FileRemove(PathBuf, #[source] io::Error),

    #[error("Unable to create directory '{0}': {1}")]
    DirectoryCreate(PathBuf, #[source] io::Error),

    #[error("Unable to spawn '{0}': {1}.")]
    SpawnProcess(String, #[source] io::Error),

    // serialization errors
    #[error("Unable to parse '{0}'.\n{1}")]
    TOMLParse(PathBuf, #[source] toml::de::Error),

    #[error("Unable to parse JSON: {0}")]
    JSONParse(#[source] serde_json::Error),

    #[error("Unable to serialize JSON: {0}")]
    JSONSerialize(#[source] serde_json::Error),

    // state store errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error(
        "Database '{0}' was created by a newer/older version of jobctl (found schema {1}, expected {2})."
    )]
    SchemaVersion(PathBuf, i64, i64),

    #[error("Dead lock detected: this session already holds the lock.")]
    DeadLock,

    #[error("No session lock is held.")]
    NotLocked,

    #[error(
        "The database is busy: another process has held the write lock for too long. Try again later."
    )]
    StoreBusy,

    // id / input parse errors
    #[error("Invalid id selection '{0}': {1}")]
    InvalidIdSelection(String, String),

    #[error("Invalid array specification '{0}': {1}")]
    InvalidArraySpec(String, String),

    // job model errors
    #[error("Job {0} not found.")]
    JobNotFound(i64),

    #[error("Dependency from job {0} to itself was ignored.")]
    SelfDependency(i64),

    // external tool errors
    #[error("Error encountered while executing '{0}': {1}.")]
    ExternalTool(String, String),

    #[error("Unexpected output from '{0}': {1}")]
    UnexpectedOutput(String, String),

    #[error("Interrupted")]
    Interrupted,
}

/// Hold a `MultiProgress` and all of its progress bars.
///
/// A dropped `ProgressBar` is automatically removed from its `MultiProgress`, so this
/// container keeps every bar alive for as long as the operation that owns it runs.
pub struct MultiProgressContainer {
    pub progress_bars: Vec<ProgressBar>,
    pub multi_progress: MultiProgress,
}

impl MultiProgressContainer {
    pub fn new(multi_progress: MultiProgress) -> MultiProgressContainer {
        MultiProgressContainer {
            progress_bars: Vec::new(),
            multi_progress,
        }
    }

    pub fn hidden() -> MultiProgressContainer {
        MultiProgressContainer::new(MultiProgress::with_draw_target(ProgressDrawTarget::hidden()))
    }

    /// Add a progress bar to the container, or hide it.
    pub fn add_or_hide(&mut self, mut progress_bar: ProgressBar, hide: bool) -> ProgressBar {
        if hide {
            progress_bar.set_draw_target(ProgressDrawTarget::hidden());
        } else {
            progress_bar = self.multi_progress.add(progress_bar);
            self.progress_bars.push(progress_bar.clone());
        }
        progress_bar
    }

    /// Suspend progress bar redraws while executing `f`.
    pub fn suspend<F: FnOnce() -> R, R>(&self, f: F) -> R {
        self.multi_progress.suspend(f)
    }
}
