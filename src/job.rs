// The job state machine: submitted -> queued -> waiting -> executing -> success/failure.
//
// These free functions operate on a `Store` that the caller has already locked (normally via
// `Store::with_session`). Keeping them outside `Store` keeps the state machine's cascade
// logic -- which walks dependency edges and recurses -- separate from the storage layer.

use log::{debug, trace};
use rusqlite::Row;
use std::path::PathBuf;

use crate::ids::ArraySpec;
use crate::store::{now_millis, Store};
use crate::Error;

/// A job's place in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Submitted,
    Queued,
    Waiting,
    Executing,
    Success,
    Failure,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Submitted => "submitted",
            Status::Queued => "queued",
            Status::Waiting => "waiting",
            Status::Executing => "executing",
            Status::Success => "success",
            Status::Failure => "failure",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Success | Status::Failure)
    }

    fn parse(value: &str) -> Result<Status, Error> {
        match value {
            "submitted" => Ok(Status::Submitted),
            "queued" => Ok(Status::Queued),
            "waiting" => Ok(Status::Waiting),
            "executing" => Ok(Status::Executing),
            "success" => Ok(Status::Success),
            "failure" => Ok(Status::Failure),
            other => Err(Error::UnexpectedOutput(
                "status column".to_string(),
                other.to_string(),
            )),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single array task belonging to an array job.
#[derive(Debug, Clone)]
pub struct ArrayTask {
    pub job_id: i64,
    pub index: i64,
    pub status: Status,
    pub result: Option<i64>,
    pub machine_name: Option<String>,
    pub start_time: Option<i64>,
    pub finish_time: Option<i64>,
}

impl ArrayTask {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<ArrayTask> {
        let status: String = row.get("status")?;
        Ok(ArrayTask {
            job_id: row.get("job_id")?,
            index: row.get("task_index")?,
            status: Status::parse(&status).map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    0,
                    "status".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            result: row.get("result")?,
            machine_name: row.get("machine_name")?,
            start_time: row.get("start_time")?,
            finish_time: row.get("finish_time")?,
        })
    }
}

/// A job.
#[derive(Debug, Clone)]
pub struct Job {
    pub unique_id: i64,
    pub external_id: String,
    pub name: String,
    pub command: Vec<String>,
    pub exec_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub array_spec: Option<ArraySpec>,
    pub queue_name: String,
    pub machine_name: Option<String>,
    pub grid_arguments: serde_json::Value,
    pub stop_on_failure: bool,
    pub status: Status,
    pub result: Option<i64>,
    pub submit_time: i64,
    pub start_time: Option<i64>,
    pub finish_time: Option<i64>,
    /// Populated by `Store::get_job`/`Store::get_jobs`; empty for non-array jobs.
    pub tasks: Vec<ArrayTask>,
}

impl Job {
    pub fn is_array(&self) -> bool {
        self.array_spec.is_some()
    }

    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Job> {
        let status: String = row.get("status")?;
        let command: String = row.get("command")?;
        let grid_arguments: String = row.get("grid_arguments")?;
        let exec_dir: Option<String> = row.get("exec_dir")?;
        let log_dir: Option<String> = row.get("log_dir")?;
        let array_first: Option<i64> = row.get("array_first")?;
        let array_last: Option<i64> = row.get("array_last")?;
        let array_step: Option<i64> = row.get("array_step")?;
        let stop_on_failure: i64 = row.get("stop_on_failure")?;

        Ok(Job {
            unique_id: row.get("unique_id")?,
            external_id: row.get("external_id")?,
            name: row.get("name")?,
            command: serde_json::from_str(&command).unwrap_or_default(),
            exec_dir: exec_dir.map(PathBuf::from),
            log_dir: log_dir.map(PathBuf::from),
            array_spec: match (array_first, array_last, array_step) {
                (Some(first), Some(last), Some(step)) => Some(ArraySpec { first, last, step }),
                _ => None,
            },
            queue_name: row.get("queue_name")?,
            machine_name: row.get("machine_name")?,
            grid_arguments: serde_json::from_str(&grid_arguments).unwrap_or(serde_json::Value::Null),
            stop_on_failure: stop_on_failure != 0,
            status: Status::parse(&status).map_err(|_| {
                rusqlite::Error::InvalidColumnType(
                    0,
                    "status".to_string(),
                    rusqlite::types::Type::Text,
                )
            })?,
            result: row.get("result")?,
            submit_time: row.get("submit_time")?,
            start_time: row.get("start_time")?,
            finish_time: row.get("finish_time")?,
            tasks: Vec::new(),
        })
    }
}

/// Transition a job from `submitted` (or re-evaluate one already `waiting`) into `queued` or
/// `waiting`, depending on the state of the jobs it depends on, then propagate the change to
/// its dependents.
///
/// If any waited job has failed and `stop_on_failure` is set, the job is itself marked
/// `failure` without running, and the cascade continues outward.
///
/// Returns the ids of every job (this one, or a dependent reached by the cascade) that newly
/// transitioned into `Queued`. A non-local job only ever reaches a backend through one of
/// these transitions, so callers that own a `Backend` must dispatch every id this returns.
///
/// # Errors
/// Requires a live session. Forwards database errors.
pub fn queue(store: &mut Store, job_id: i64) -> Result<Vec<i64>, Error> {
    let job = store.get_job(job_id)?;

    if job.status.is_terminal() || job.status == Status::Executing {
        return Ok(Vec::new());
    }

    let waited_ids = store.dependencies_of(job_id)?;
    let mut waited_jobs = Vec::with_capacity(waited_ids.len());
    for waited_id in waited_ids {
        waited_jobs.push(store.get_job(waited_id)?);
    }

    let any_failed = waited_jobs.iter().any(|w| w.status == Status::Failure);
    let all_succeeded = waited_jobs.iter().all(|w| w.status == Status::Success);

    let new_status = if any_failed && job.stop_on_failure {
        Status::Failure
    } else if all_succeeded {
        Status::Queued
    } else {
        Status::Waiting
    };

    if new_status == job.status {
        return Ok(Vec::new());
    }

    trace!("Job {job_id} transitioning {} -> {new_status}.", job.status);

    if new_status == Status::Failure {
        // Never ran: cascaded from a failed dependency under `stop_on_failure`, so there is
        // no process exit code to record.
        let now = now_millis();
        store.conn().execute(
            "UPDATE jobs SET status = ?1, finish_time = ?2 WHERE unique_id = ?3",
            rusqlite::params![new_status.as_str(), now, job_id],
        )?;
    } else {
        store.conn().execute(
            "UPDATE jobs SET status = ?1 WHERE unique_id = ?2",
            rusqlite::params![new_status.as_str(), job_id],
        )?;
    }

    let mut newly_queued = if new_status == Status::Queued {
        vec![job_id]
    } else {
        Vec::new()
    };

    for dependent in store.dependents_of(job_id)? {
        newly_queued.extend(queue(store, dependent)?);
    }

    Ok(newly_queued)
}

/// Mark a job (or, for an array job, one of its tasks) as `executing`.
///
/// # Errors
/// Requires a live session. Forwards database errors.
pub fn execute(
    store: &mut Store,
    job_id: i64,
    array_index: Option<i64>,
    machine_name: Option<&str>,
) -> Result<(), Error> {
    let now = now_millis();

    if let Some(index) = array_index {
        store.conn().execute(
            "UPDATE array_tasks SET status = 'executing', machine_name = ?1, start_time = ?2
             WHERE job_id = ?3 AND task_index = ?4",
            rusqlite::params![machine_name, now, job_id, index],
        )?;
    }

    store.conn().execute(
        "UPDATE jobs SET status = 'executing', machine_name = ?1, start_time = COALESCE(start_time, ?2)
         WHERE unique_id = ?3",
        rusqlite::params![machine_name, now, job_id],
    )?;

    debug!("Job {job_id} (task {array_index:?}) executing on {machine_name:?}.");
    Ok(())
}

/// Record the result of a job (or one of its array tasks), finalizing the job when every
/// task has reached a terminal state.
///
/// Array job rollup: the job's final result is the first non-zero task result in ascending
/// task-index order, or zero (success) if every task succeeded.
///
/// Returns the ids of any dependents that newly transitioned into `Queued` as a result (see
/// `queue`'s doc comment for why callers with a `Backend` must dispatch these).
///
/// # Errors
/// Requires a live session. Forwards database errors.
pub fn finish(
    store: &mut Store,
    job_id: i64,
    result: i64,
    array_index: Option<i64>,
) -> Result<Vec<i64>, Error> {
    let now = now_millis();

    if let Some(index) = array_index {
        let status = if result == 0 { "success" } else { "failure" };
        store.conn().execute(
            "UPDATE array_tasks SET status = ?1, result = ?2, finish_time = ?3
             WHERE job_id = ?4 AND task_index = ?5",
            rusqlite::params![status, result, now, job_id, index],
        )?;

        let tasks = store.get_array_tasks(job_id)?;
        if !tasks.iter().all(|t| t.status.is_terminal()) {
            return Ok(Vec::new());
        }

        let rollup = tasks
            .iter()
            .find(|t| t.result != Some(0))
            .and_then(|t| t.result)
            .unwrap_or(0);

        finalize(store, job_id, rollup, now)?;
    } else {
        finalize(store, job_id, result, now)?;
    }

    let mut newly_queued = Vec::new();
    for dependent in store.dependents_of(job_id)? {
        newly_queued.extend(queue(store, dependent)?);
    }

    Ok(newly_queued)
}

fn finalize(store: &mut Store, job_id: i64, result: i64, now: i64) -> Result<(), Error> {
    let status = if result == 0 { "success" } else { "failure" };
    store.conn().execute(
        "UPDATE jobs SET status = ?1, result = ?2, finish_time = ?3 WHERE unique_id = ?4",
        rusqlite::params![status, result, now, job_id],
    )?;
    debug!("Job {job_id} finished with status {status} (result {result}).");
    Ok(())
}

/// The stdout/stderr file paths a job invocation's output is captured to, or `None` if the
/// job has no `log_dir`. `task_index` selects one array task's pair; pass `None` for a
/// non-array job.
pub fn log_paths(job: &Job, task_index: Option<i64>) -> Option<(PathBuf, PathBuf)> {
    let log_dir = job.log_dir.as_ref()?;
    let file_name = |suffix: char| match task_index {
        Some(index) => format!("{}.{suffix}{}.{index}", job.name, job.external_id),
        None => format!("{}.{suffix}{}", job.name, job.external_id),
    };
    Some((log_dir.join(file_name('o')), log_dir.join(file_name('e'))))
}

/// Re-derive a job's status from its array tasks' current states. Used after a scheduler
/// restart to reconcile state left inconsistent by a crash mid-transition. A no-op for
/// non-array jobs or jobs already terminal.
///
/// Returns the ids of any dependents that newly transitioned into `Queued` as a result.
///
/// # Errors
/// Requires a live session. Forwards database errors.
pub fn refresh(store: &mut Store, job_id: i64) -> Result<Vec<i64>, Error> {
    let job = store.get_job(job_id)?;
    if !job.is_array() || job.status.is_terminal() {
        return Ok(Vec::new());
    }

    if job.tasks.iter().all(|t| t.status.is_terminal()) && !job.tasks.is_empty() {
        let rollup = job
            .tasks
            .iter()
            .find(|t| t.result != Some(0))
            .and_then(|t| t.result)
            .unwrap_or(0);
        finalize(store, job_id, rollup, now_millis())?;
        let mut newly_queued = Vec::new();
        for dependent in store.dependents_of(job_id)? {
            newly_queued.extend(queue(store, dependent)?);
        }
        return Ok(newly_queued);
    }

    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DeleteFilter, NewJob};

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("submitted.sql3")).unwrap();
        (dir, store)
    }

    fn new_job(dependencies: Vec<i64>, stop_on_failure: bool) -> NewJob {
        NewJob {
            command: vec!["/bin/true".to_string()],
            name: None,
            dependencies,
            array_spec: None,
            exec_dir: None,
            log_dir: None,
            queue_name: "local".to_string(),
            stop_on_failure,
            grid_arguments: serde_json::json!({}),
        }
    }

    #[test]
    fn queue_with_no_dependencies_is_immediate() {
        let (_dir, mut store) = open_temp();
        store
            .with_session(|store| {
                store.add_job(new_job(vec![], false))?;
                queue(store, 1)
            })
            .unwrap();
        assert_eq!(store.get_job(1).unwrap().status, Status::Queued);
    }

    #[test]
    fn queue_with_pending_dependency_waits() {
        let (_dir, mut store) = open_temp();
        store
            .with_session(|store| {
                store.add_job(new_job(vec![], false))?;
                store.add_job(new_job(vec![1], false))?;
                queue(store, 2)
            })
            .unwrap();
        assert_eq!(store.get_job(2).unwrap().status, Status::Waiting);
    }

    #[test]
    fn finishing_dependency_queues_dependent() {
        let (_dir, mut store) = open_temp();
        store
            .with_session(|store| {
                store.add_job(new_job(vec![], false))?;
                store.add_job(new_job(vec![1], false))?;
                queue(store, 1)?;
                queue(store, 2)?;
                execute(store, 1, None, Some("host"))?;
                finish(store, 1, 0, None)
            })
            .unwrap();
        assert_eq!(store.get_job(1).unwrap().status, Status::Success);
        assert_eq!(store.get_job(2).unwrap().status, Status::Queued);
    }

    #[test]
    fn stop_on_failure_cascades() {
        let (_dir, mut store) = open_temp();
        store
            .with_session(|store| {
                store.add_job(new_job(vec![], false))?;
                store.add_job(new_job(vec![1], true))?;
                store.add_job(new_job(vec![2], true))?;
                queue(store, 1)?;
                queue(store, 2)?;
                queue(store, 3)?;
                execute(store, 1, None, Some("host"))?;
                finish(store, 1, 1, None)
            })
            .unwrap();
        assert_eq!(store.get_job(1).unwrap().status, Status::Failure);
        assert_eq!(store.get_job(2).unwrap().status, Status::Failure);
        assert_eq!(store.get_job(3).unwrap().status, Status::Failure);
    }

    #[test]
    fn without_stop_on_failure_dependent_keeps_waiting() {
        let (_dir, mut store) = open_temp();
        store
            .with_session(|store| {
                store.add_job(new_job(vec![], false))?;
                store.add_job(new_job(vec![1], false))?;
                queue(store, 1)?;
                queue(store, 2)?;
                execute(store, 1, None, Some("host"))?;
                finish(store, 1, 1, None)
            })
            .unwrap();
        assert_eq!(store.get_job(1).unwrap().status, Status::Failure);
        assert_eq!(store.get_job(2).unwrap().status, Status::Waiting);
    }

    #[test]
    fn array_job_rollup_picks_first_nonzero_in_index_order() {
        let (_dir, mut store) = open_temp();
        store
            .with_session(|store| {
                let mut j = new_job(vec![], false);
                j.array_spec = Some((1, 3, 1));
                store.add_job(j)?;
                queue(store, 1)?;
                execute(store, 1, Some(1), Some("host"))?;
                finish(store, 1, 0, Some(1))?;
                execute(store, 1, Some(2), Some("host"))?;
                finish(store, 1, 5, Some(2))?;
                execute(store, 1, Some(3), Some("host"))?;
                finish(store, 1, 9, Some(3))
            })
            .unwrap();
        let job = store.get_job(1).unwrap();
        assert_eq!(job.status, Status::Failure);
        assert_eq!(job.result, Some(5));
    }

    #[test]
    fn array_job_all_success_rolls_up_to_success() {
        let (_dir, mut store) = open_temp();
        store
            .with_session(|store| {
                let mut j = new_job(vec![], false);
                j.array_spec = Some((1, 2, 1));
                store.add_job(j)?;
                queue(store, 1)?;
                execute(store, 1, Some(1), Some("host"))?;
                finish(store, 1, 0, Some(1))?;
                execute(store, 1, Some(2), Some("host"))?;
                finish(store, 1, 0, Some(2))
            })
            .unwrap();
        let job = store.get_job(1).unwrap();
        assert_eq!(job.status, Status::Success);
        assert_eq!(job.result, Some(0));
    }

    #[test]
    fn result_implies_terminal_status() {
        let (_dir, mut store) = open_temp();
        store
            .with_session(|store| {
                store.add_job(new_job(vec![], false))?;
                queue(store, 1)?;
                execute(store, 1, None, Some("host"))?;
                finish(store, 1, 0, None)
            })
            .unwrap();
        let job = store.get_job(1).unwrap();
        assert_eq!(job.result.is_some(), job.status.is_terminal());
    }

    #[test]
    fn submit_is_idempotent_until_queued() {
        let (_dir, mut store) = open_temp();
        let job = store
            .with_session(|store| store.add_job(new_job(vec![], false)))
            .unwrap();
        assert_eq!(job.status, Status::Submitted);
        let again = store.get_job(job.unique_id).unwrap();
        assert_eq!(again.status, Status::Submitted);
    }

    #[test]
    fn full_round_trip_then_resubmit() {
        let (_dir, mut store) = open_temp();
        store
            .with_session(|store| {
                store.add_job(new_job(vec![], false))?;
                queue(store, 1)?;
                execute(store, 1, None, Some("host"))?;
                finish(store, 1, 0, None)
            })
            .unwrap();
        assert_eq!(store.get_job(1).unwrap().status, Status::Success);

        store
            .with_session(|store| {
                store.conn().execute(
                    "UPDATE jobs SET status = 'submitted', result = NULL, start_time = NULL, finish_time = NULL WHERE unique_id = 1",
                    [],
                )?;
                queue(store, 1)
            })
            .unwrap();
        assert_eq!(store.get_job(1).unwrap().status, Status::Queued);

        store
            .with_session(|store| store.delete(&DeleteFilter::default()))
            .unwrap();
        assert!(store.get_jobs(None).unwrap().is_empty());
    }
}
