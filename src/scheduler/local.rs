// The local scheduler: a single-threaded reap -> admit -> terminate-check -> sleep loop that
// runs child processes on this host, honoring a parallelism cap and `nice` level from the
// site configuration.

use log::{info, warn};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::job::{self, Job, Status};
use crate::progress_styles;
use crate::site::Site;
use crate::store::Store;
use crate::wrapper::{JOB_ID_VAR, TASK_ID_VAR};
use crate::{Error, MultiProgressContainer, SPAWN_FAILURE_RESULT};

use super::{Backend, LiveStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One admitted task: a running wrapper child process, keyed by `(job_id, task_index)` in
/// the scheduler's `running` map.
struct Running {
    child: Child,
}

/// The local execution backend. `submit`/`resubmit`/`stop` only update the state store --
/// the actual work happens in `run()`, the scheduler's event loop.
pub struct LocalBackend {
    site: Site,
}

impl LocalBackend {
    pub fn new(site: Site) -> LocalBackend {
        LocalBackend { site }
    }

    /// Run the scheduler loop until every job has reached a terminal state or `cancel` is
    /// set, admitting up to `parallelism` concurrent wrapper processes (falling back to the
    /// site's `default_parallel` when `parallelism` is `None`).
    ///
    /// # Errors
    /// Returns `Err(Error)` on unrecoverable store errors. Individual job spawn failures are
    /// recorded in the store, not propagated.
    pub fn run(
        &self,
        database: &Path,
        parallelism: Option<u32>,
        cancel: Arc<AtomicBool>,
        progress: &mut MultiProgressContainer,
        hide_progress: bool,
        run_all_queues: bool,
        no_log_files: bool,
    ) -> Result<(), Error> {
        let parallelism = parallelism.unwrap_or(self.site.default_parallel).max(1);
        let mut store = Store::open(database)?;
        let exe = std::env::current_exe().map_err(Error::IO)?;

        let bar = progress.add_or_hide(progress_styles::scheduler_bar(), hide_progress);
        let mut running: HashMap<(i64, Option<i64>), Running> = HashMap::new();

        loop {
            reap(&mut running);

            let relevant: Vec<_> = store
                .get_jobs(None)?
                .into_iter()
                .filter(|j| run_all_queues || j.queue_name == crate::LOCAL_QUEUE_NAME)
                .collect();
            let total = relevant.len();
            let done = relevant.iter().filter(|j| j.status.is_terminal()).count();

            if done >= total && running.is_empty() {
                break;
            }

            if cancel.load(Ordering::SeqCst) {
                progress.suspend(|| warn!("Cancellation requested, terminating running jobs."));
                for (_, mut task) in running.drain() {
                    let _ = task.child.kill();
                }
                return Err(Error::Interrupted);
            }

            while running.len() < parallelism as usize {
                let Some((job, task_index)) = next_admissible(&mut store, run_all_queues)? else {
                    break;
                };
                let job_id = job.unique_id;

                match spawn(&exe, database, &self.site, &job, task_index, no_log_files, run_all_queues) {
                    Ok(child) => {
                        running.insert((job_id, task_index), Running { child });
                    }
                    Err(error) => {
                        progress.suspend(|| {
                            warn!("Job {job_id} failed to spawn: {error}.");
                        });
                        store.with_session(|store| {
                            job::execute(store, job_id, task_index, None)?;
                            job::finish(store, job_id, SPAWN_FAILURE_RESULT, task_index)
                        })?;
                    }
                }
            }

            bar.set_message(progress_styles::scheduler_message(
                running.len(),
                parallelism,
                done,
                total,
            ));
            bar.tick();

            std::thread::sleep(POLL_INTERVAL);
        }

        progress.suspend(|| info!("All jobs finished."));
        Ok(())
    }
}

impl Backend for LocalBackend {
    fn submit(&self, job: &Job) -> Result<String, Error> {
        Ok(job.unique_id.to_string())
    }

    fn resubmit(&self, job: &Job) -> Result<String, Error> {
        Ok(job.unique_id.to_string())
    }

    fn stop(&self, _job: &Job) -> Result<(), Error> {
        // The running scheduler loop owns the child processes; stopping a job outside of
        // that loop only needs to update the store, which the caller (controller) does.
        Ok(())
    }

    fn communicate(&self, _jobs: &[Job]) -> Result<Vec<LiveStatus>, Error> {
        Ok(Vec::new())
    }
}

fn next_admissible(
    store: &mut Store,
    run_all_queues: bool,
) -> Result<Option<(Job, Option<i64>)>, Error> {
    for job in store.get_jobs(None)? {
        if job.status != Status::Queued {
            continue;
        }
        if !run_all_queues && job.queue_name != crate::LOCAL_QUEUE_NAME {
            continue;
        }

        if job.is_array() {
            if let Some(task) = job.tasks.iter().find(|t| t.status == Status::Submitted) {
                let index = task.index;
                return Ok(Some((job, Some(index))));
            }
        } else {
            return Ok(Some((job, None)));
        }
    }
    Ok(None)
}

/// Open (creating parent directories as needed) the stdout/stderr files a spawned wrapper's
/// output is redirected to, or `Stdio::inherit()` for each stream if the job has no
/// `log_dir` or log capture is disabled.
fn log_stdio(job: &Job, task_index: Option<i64>, no_log_files: bool) -> Result<(Stdio, Stdio), Error> {
    if no_log_files {
        return Ok((Stdio::inherit(), Stdio::inherit()));
    }
    let Some((out_path, err_path)) = job::log_paths(job, task_index) else {
        return Ok((Stdio::inherit(), Stdio::inherit()));
    };

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::DirectoryCreate(parent.to_path_buf(), e))?;
    }
    let out = File::create(&out_path).map_err(|e| Error::FileWrite(out_path, e))?;
    let err = File::create(&err_path).map_err(|e| Error::FileWrite(err_path, e))?;
    Ok((Stdio::from(out), Stdio::from(err)))
}

fn spawn(
    exe: &Path,
    database: &Path,
    site: &Site,
    job: &Job,
    task_index: Option<i64>,
    no_log_files: bool,
    run_all_queues: bool,
) -> Result<Child, Error> {
    let mut command = if site.default_nice != 0 {
        let mut command = Command::new("nice");
        command.arg("-n").arg(site.default_nice.to_string()).arg(exe);
        command
    } else {
        Command::new(exe)
    };

    let (stdout, stderr) = log_stdio(job, task_index, no_log_files)?;

    command
        .arg("run-job")
        .arg("--database")
        .arg(database)
        .env(JOB_ID_VAR, job.unique_id.to_string())
        .env(
            TASK_ID_VAR,
            task_index.map_or_else(|| "undefined".to_string(), |i| i.to_string()),
        )
        // The spawned wrapper re-parses its own CLI options from argv/env, and a CLI flag
        // never propagates to a child process -- only env vars do. Setting this explicitly
        // (rather than relying on whatever the submitting shell happened to export) is what
        // lets the wrapper decide correctly whether to dispatch a newly-unblocked dependent
        // through the local or grid backend.
        .env(crate::LOCAL_ENV_VAR, if run_all_queues { "true" } else { "false" })
        .stdout(stdout)
        .stderr(stderr);

    command
        .spawn()
        .map_err(|e| Error::SpawnProcess(exe.display().to_string(), e))
}

fn reap(running: &mut HashMap<(i64, Option<i64>), Running>) {
    let mut finished = Vec::new();

    for (key, task) in running.iter_mut() {
        if let Ok(Some(_status)) = task.child.try_wait() {
            finished.push(*key);
        }
    }

    // The wrapper itself already recorded the job's result via `job::finish` and closed its
    // captured output streams on exit; reaping here only needs to free the admission slot.
    for key in finished {
        running.remove(&key);
    }
}
