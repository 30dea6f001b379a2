// The two execution backends: a local parallel scheduler and an SGE-style grid adapter,
// unified behind one `Backend` trait so the controller never needs to know which is live.

pub mod grid;
pub mod local;

use std::path::Path;

use crate::job::Job;
use crate::site::Site;
use crate::Error;

pub use grid::GridBackend;
pub use local::LocalBackend;

/// A record of a job or array task's live state, as reported by a backend's `communicate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveStatus {
    pub external_id: String,
    pub task_index: Option<i64>,
    pub queue_name: Option<String>,
    pub running: bool,
}

/// The operations a job-execution backend must provide. `LocalBackend` runs child processes
/// on this host; `GridBackend` forwards to an SGE-style cluster via `qsub`/`qstat`/`qdel`.
pub trait Backend {
    /// Submit a newly-queued job for execution, returning the backend-assigned external id.
    ///
    /// # Errors
    /// Returns `Err(Error)` on spawn failure (local) or external-tool failure (grid).
    fn submit(&self, job: &Job) -> Result<String, Error>;

    /// Re-submit a job that was previously stopped or has failed.
    ///
    /// # Errors
    /// Returns `Err(Error)` on spawn failure (local) or external-tool failure (grid).
    fn resubmit(&self, job: &Job) -> Result<String, Error>;

    /// Stop a running or queued job.
    ///
    /// # Errors
    /// Returns `Err(Error)` when the backend cannot be reached or the job cannot be stopped.
    fn stop(&self, job: &Job) -> Result<(), Error>;

    /// Query the backend for the live status of outstanding jobs, to reconcile the state
    /// store after a crash or a grid-side failure.
    ///
    /// # Errors
    /// Returns `Err(Error)` when the backend cannot be reached.
    fn communicate(&self, jobs: &[Job]) -> Result<Vec<LiveStatus>, Error>;
}

/// Construct the backend selected by `--local`, configured from the site file.
pub fn select(local: bool, database: &Path, site: Site) -> Box<dyn Backend> {
    if local {
        Box::new(LocalBackend::new(site))
    } else {
        Box::new(GridBackend::new(database.to_path_buf(), site))
    }
}
