// The controller facade: one uniform entry point per CLI subcommand, dispatching to
// whichever `Backend` was selected at construction. Nothing above this layer needs to know
// whether jobs run locally or on a grid.

use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::ids::ArraySpec;
use crate::job::{self, Job, Status};
use crate::scheduler::{self, Backend, LiveStatus};
use crate::site::Site;
use crate::store::{DeleteFilter, NewJob, Store};
use crate::{Error, MultiProgressContainer};

/// Everything a `submit` call needs beyond what has a sensible default.
pub struct SubmitRequest {
    pub command: Vec<String>,
    pub name: Option<String>,
    pub dependencies: Vec<i64>,
    pub array_spec: Option<ArraySpec>,
    pub exec_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub queue_name: String,
    pub stop_on_failure: bool,
    pub grid_arguments: serde_json::Value,
}

/// Everything a `resubmit` call needs beyond what has a sensible default.
pub struct ResubmitRequest {
    pub ids: Option<Vec<i64>>,
    pub also_success: bool,
    pub running_jobs: bool,
    pub overwrite_command: Option<Vec<String>>,
    pub keep_logs: bool,
    pub grid_arguments: serde_json::Value,
}

/// The uniform facade over the job engine: owns the state store and the selected backend.
pub struct Controller {
    store: Store,
    database: PathBuf,
    backend: Box<dyn Backend>,
    site: Site,
    local: bool,
}

impl Controller {
    /// Open the state store at `database` and select the backend named by `local`.
    ///
    /// # Errors
    /// Forwards `Store::open` and `Site::open` errors.
    pub fn open(database: &Path, local: bool, site_config: Option<&Path>) -> Result<Controller, Error> {
        let site = Site::open(site_config)?;
        let store = Store::open(database)?;
        let backend = scheduler::select(local, database, site.clone());
        Ok(Controller {
            store,
            database: database.to_path_buf(),
            backend,
            site,
            local,
        })
    }

    pub fn site(&self) -> &Site {
        &self.site
    }

    /// Submit a new job, queuing it immediately if it has no pending dependencies.
    ///
    /// # Errors
    /// Forwards store and backend errors.
    pub fn submit(&mut self, request: SubmitRequest) -> Result<Job, Error> {
        let (job, newly_queued) = self.store.with_session(|store| {
            let job = store.add_job(NewJob {
                command: request.command,
                name: request.name,
                dependencies: request.dependencies,
                array_spec: request.array_spec.map(|s| (s.first, s.last, s.step)),
                exec_dir: request.exec_dir,
                log_dir: request.log_dir,
                queue_name: request.queue_name,
                stop_on_failure: request.stop_on_failure,
                grid_arguments: request.grid_arguments,
            })?;
            let newly_queued = job::queue(store, job.unique_id)?;
            Ok((store.get_job(job.unique_id)?, newly_queued))
        })?;

        dispatch_queued(&mut self.store, self.backend.as_ref(), &newly_queued)?;
        let job = self.store.get_job(job.unique_id)?;

        info!("Submitted job {} ('{}').", job.unique_id, job.name);
        Ok(job)
    }

    /// Resubmit jobs matching `request.ids`.
    ///
    /// Without `also_success`, only `submitted` and `failure` jobs are eligible; with it,
    /// every terminal job named by `ids` is eligible. `running_jobs` additionally makes
    /// `executing` jobs eligible, stopping them on their backend first.
    ///
    /// `overwrite_command`, when set, replaces the command every resubmitted job runs.
    /// `grid_arguments` overrides (merged over each job's existing ones) apply only to
    /// non-local jobs. Previous log files are removed unless `keep_logs` is set.
    ///
    /// # Errors
    /// Forwards store and backend errors.
    pub fn resubmit(&mut self, request: ResubmitRequest) -> Result<Vec<Job>, Error> {
        let candidates = self.store.get_jobs(request.ids.as_deref())?;
        let mut resubmitted = Vec::new();

        for job in candidates {
            let eligible = match job.status {
                Status::Submitted | Status::Failure => true,
                Status::Success => request.also_success,
                Status::Executing => request.running_jobs,
                Status::Queued | Status::Waiting => false,
            };
            if !eligible {
                continue;
            }

            if job.status == Status::Executing && job.queue_name != crate::LOCAL_QUEUE_NAME {
                self.backend.stop(&job)?;
            }

            if !request.keep_logs {
                remove_job_logs(&job)?;
            }

            let merged_grid_arguments = merge_grid_arguments(&job.grid_arguments, &request.grid_arguments);
            let command_json = match &request.overwrite_command {
                Some(command) => Some(serde_json::to_string(command).map_err(Error::JSONSerialize)?),
                None => None,
            };
            let grid_arguments_json =
                serde_json::to_string(&merged_grid_arguments).map_err(Error::JSONSerialize)?;

            let newly_queued = self.store.with_session(|store| {
                store.conn().execute(
                    "UPDATE jobs SET status = 'submitted', result = NULL, machine_name = NULL,
                     start_time = NULL, finish_time = NULL, submit_time = ?1,
                     command = COALESCE(?2, command), grid_arguments = ?3
                     WHERE unique_id = ?4",
                    rusqlite::params![
                        crate::store::now_millis(),
                        command_json,
                        grid_arguments_json,
                        job.unique_id
                    ],
                )?;
                if job.is_array() {
                    store.conn().execute(
                        "UPDATE array_tasks SET status = 'submitted', result = NULL, machine_name = NULL,
                         start_time = NULL, finish_time = NULL
                         WHERE job_id = ?1",
                        rusqlite::params![job.unique_id],
                    )?;
                }
                job::queue(store, job.unique_id)
            })?;

            let refreshed = self.store.get_job(job.unique_id)?;
            if refreshed.status == Status::Queued && refreshed.queue_name != crate::LOCAL_QUEUE_NAME {
                let external_id = self.backend.resubmit(&refreshed)?;
                self.store.with_session(|store| {
                    store
                        .conn()
                        .execute(
                            "UPDATE jobs SET external_id = ?1 WHERE unique_id = ?2",
                            rusqlite::params![external_id, refreshed.unique_id],
                        )
                        .map_err(Error::from)
                })?;
            }

            let cascaded: Vec<i64> = newly_queued.into_iter().filter(|&id| id != job.unique_id).collect();
            dispatch_queued(&mut self.store, self.backend.as_ref(), &cascaded)?;

            resubmitted.push(self.store.get_job(job.unique_id)?);
        }

        Ok(resubmitted)
    }

    /// The ids of the jobs `id` directly waits on.
    ///
    /// # Errors
    /// Forwards store errors.
    pub fn dependencies_of(&self, id: i64) -> Result<Vec<i64>, Error> {
        self.store.dependencies_of(id)
    }

    /// List jobs matching `ids` (all jobs when `None`).
    ///
    /// # Errors
    /// Forwards store errors.
    pub fn list(&self, ids: Option<&[i64]>) -> Result<Vec<Job>, Error> {
        self.store.get_jobs(ids)
    }

    /// Stop jobs matching `ids`: cancel them on their backend and mark them failed.
    ///
    /// # Errors
    /// Forwards store and backend errors.
    pub fn stop(&mut self, ids: Option<&[i64]>) -> Result<Vec<Job>, Error> {
        let candidates = self.store.get_jobs(ids)?;
        let mut stopped = Vec::new();

        for job in candidates {
            if job.status.is_terminal() {
                continue;
            }

            if job.queue_name != crate::LOCAL_QUEUE_NAME {
                self.backend.stop(&job)?;
            }

            let newly_queued = self.store.with_session(|store| {
                store.conn().execute(
                    "UPDATE jobs SET status = 'failure', result = NULL, finish_time = ?1 WHERE unique_id = ?2",
                    rusqlite::params![crate::store::now_millis(), job.unique_id],
                )?;
                let mut newly_queued = Vec::new();
                for dependent in store.dependents_of(job.unique_id)? {
                    newly_queued.extend(job::queue(store, dependent)?);
                }
                Ok(newly_queued)
            })?;
            dispatch_queued(&mut self.store, self.backend.as_ref(), &newly_queued)?;

            stopped.push(self.store.get_job(job.unique_id)?);
        }

        Ok(stopped)
    }

    /// Delete jobs matching `filter`, removing the database file if nothing remains.
    ///
    /// # Errors
    /// Forwards store and I/O errors.
    pub fn delete(self, filter: DeleteFilter) -> Result<Vec<i64>, Error> {
        let Controller { mut store, .. } = self;
        let deleted = store.with_session(|store| store.delete(&filter))?;
        store.close_if_empty()?;
        Ok(deleted)
    }

    /// Query the backend for the live status of outstanding jobs and reconcile the store:
    /// a job the grid no longer knows about but that was never finalized is marked failed
    /// with `VANISHED_RESULT`.
    ///
    /// Only jobs actually dispatched to the grid (`Queued` or `Executing`) are polled -- a
    /// job still `Waiting` on a dependency was never handed to `qsub` and has no external
    /// id worth asking the grid about.
    ///
    /// # Errors
    /// Forwards store and backend errors.
    pub fn communicate(&mut self, ids: Option<&[i64]>) -> Result<Vec<LiveStatus>, Error> {
        let jobs: Vec<Job> = self
            .store
            .get_jobs(ids)?
            .into_iter()
            .filter(|j| {
                matches!(j.status, Status::Queued | Status::Executing) && j.queue_name != crate::LOCAL_QUEUE_NAME
            })
            .collect();

        let statuses = self.backend.communicate(&jobs)?;

        for (job, status) in jobs.iter().zip(statuses.iter()) {
            if status.running {
                continue;
            }

            warn!(
                "Job {} ('{}') vanished from the grid without finishing.",
                job.unique_id, job.name
            );
            let newly_queued = self.store.with_session(|store| {
                job::finish(store, job.unique_id, crate::VANISHED_RESULT, None)
            })?;
            dispatch_queued(&mut self.store, self.backend.as_ref(), &newly_queued)?;
        }

        Ok(statuses)
    }

    /// Run the local scheduler loop against every locally-routed job (queue name `"local"`
    /// jobs always run here regardless of backend; with `--local`, every job does).
    ///
    /// # Errors
    /// Forwards scheduler errors.
    pub fn run_scheduler(
        &mut self,
        parallelism: Option<u32>,
        cancel: Arc<AtomicBool>,
        progress: &mut MultiProgressContainer,
        hide_progress: bool,
        no_log_files: bool,
    ) -> Result<(), Error> {
        let backend = scheduler::LocalBackend::new(self.site.clone());
        backend.run(
            &self.database,
            parallelism,
            cancel,
            progress,
            hide_progress,
            self.local,
            no_log_files,
        )
    }

    /// Run the execution wrapper for the job identified by `JOB_ID`/`SGE_TASK_ID`.
    ///
    /// `local`/`site_config` mirror the options the enclosing `jobctl` invocation was given:
    /// the wrapper needs them to build its own `Backend` if finishing this job newly queues a
    /// non-local dependent (see `dispatch_queued`).
    ///
    /// # Errors
    /// Forwards wrapper errors.
    pub fn run_job(database: &Path, local: bool, site_config: Option<&Path>) -> Result<i32, Error> {
        crate::wrapper::run_job(database, local, site_config)
    }
}

/// Hand every newly-`Queued`, non-local job id in `queued_ids` to `backend`, persisting the
/// external id it returns. Local-queue jobs are skipped: the local scheduler discovers them
/// itself by polling the store, it has no separate dispatch step.
///
/// Must be called with no session held -- `Backend::submit` shells out to `qsub` (or spawns a
/// local child, for resubmission bookkeeping), which should never happen while the store's
/// write lock is held.
///
/// # Errors
/// Forwards store and backend errors.
pub(crate) fn dispatch_queued(store: &mut Store, backend: &dyn Backend, queued_ids: &[i64]) -> Result<(), Error> {
    for &id in queued_ids {
        let job = store.get_job(id)?;
        if job.status != Status::Queued || job.queue_name == crate::LOCAL_QUEUE_NAME {
            continue;
        }

        let external_id = backend.submit(&job)?;
        store.with_session(|store| {
            store
                .conn()
                .execute(
                    "UPDATE jobs SET external_id = ?1 WHERE unique_id = ?2",
                    rusqlite::params![external_id, job.unique_id],
                )
                .map_err(Error::from)
        })?;
    }
    Ok(())
}

/// Remove a job's previously captured stdout/stderr log files (not the `log_dir` itself), if
/// any. Used by `resubmit` unless `keep_logs` is set, so the files a rerun produces aren't
/// mixed in with a previous attempt's output.
fn remove_job_logs(job: &Job) -> Result<(), Error> {
    let indices: Vec<Option<i64>> = if job.is_array() {
        job.tasks.iter().map(|t| Some(t.index)).collect()
    } else {
        vec![None]
    };

    for index in indices {
        let Some((out, err)) = job::log_paths(job, index) else {
            continue;
        };
        for path in [out, err] {
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| Error::FileRemove(path, e))?;
            }
        }
    }

    Ok(())
}

/// Merge `overrides` into `base`, with `overrides`' keys winning. Either argument may be
/// anything other than a JSON object, in which case it contributes nothing.
fn merge_grid_arguments(base: &serde_json::Value, overrides: &serde_json::Value) -> serde_json::Value {
    let mut merged = match base {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if let serde_json::Value::Object(overrides) = overrides {
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
    }
    serde_json::Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Controller) {
        let dir = tempfile::tempdir().unwrap();
        let database = dir.path().join("submitted.sql3");
        let controller = Controller::open(&database, true, None).unwrap();
        (dir, controller)
    }

    fn submit_request() -> SubmitRequest {
        SubmitRequest {
            command: vec!["/bin/true".to_string()],
            name: None,
            dependencies: Vec::new(),
            array_spec: None,
            exec_dir: None,
            log_dir: None,
            queue_name: crate::LOCAL_QUEUE_NAME.to_string(),
            stop_on_failure: false,
            grid_arguments: serde_json::json!({}),
        }
    }

    #[test]
    fn resubmit_clears_machine_name_and_refreshes_submit_time() {
        let (_dir, mut controller) = open_temp();
        let job = controller.submit(submit_request()).unwrap();

        controller
            .store
            .with_session(|store| {
                store.conn().execute(
                    "UPDATE jobs SET status = 'failure', machine_name = 'old-host', submit_time = 1
                     WHERE unique_id = ?1",
                    rusqlite::params![job.unique_id],
                )
            })
            .unwrap();

        let resubmitted = controller
            .resubmit(ResubmitRequest {
                ids: Some(vec![job.unique_id]),
                also_success: false,
                running_jobs: false,
                overwrite_command: None,
                keep_logs: true,
                grid_arguments: serde_json::json!({}),
            })
            .unwrap();

        assert_eq!(resubmitted.len(), 1);
        assert_eq!(resubmitted[0].machine_name, None);
        assert!(resubmitted[0].submit_time > 1);
    }

    #[test]
    fn resubmit_overwrite_command_replaces_the_job_command() {
        let (_dir, mut controller) = open_temp();
        let job = controller.submit(submit_request()).unwrap();

        controller
            .store
            .with_session(|store| {
                job::execute(store, job.unique_id, None, Some("host"))?;
                job::finish(store, job.unique_id, 0, None)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(controller.list(None).unwrap()[0].status, Status::Success);

        let resubmitted = controller
            .resubmit(ResubmitRequest {
                ids: Some(vec![job.unique_id]),
                also_success: true,
                running_jobs: false,
                overwrite_command: Some(vec!["/bin/false".to_string()]),
                keep_logs: true,
                grid_arguments: serde_json::json!({}),
            })
            .unwrap();

        assert_eq!(resubmitted[0].command, vec!["/bin/false".to_string()]);
    }

    #[test]
    fn merge_grid_arguments_overrides_existing_keys() {
        let base = serde_json::json!({"mem_free": "4G", "io_big": true});
        let overrides = serde_json::json!({"mem_free": "8G"});
        let merged = merge_grid_arguments(&base, &overrides);
        assert_eq!(merged["mem_free"], "8G");
        assert_eq!(merged["io_big"], true);
    }
}
