// The execution wrapper: what actually runs on the machine a job lands on, whether that
// machine is this host (spawned directly by the local scheduler) or a grid compute node
// (spawned by SGE via the script `qsub` submitted, which in turn invokes `jobctl run-job`).
//
// Reads JOB_ID/SGE_TASK_ID from its environment, not from argv, because that's how SGE
// identifies a job to the script it runs -- the local scheduler sets the same two variables
// itself so the rest of this logic never needs to know which backend launched it.

use log::{info, warn};
use std::env;
use std::path::Path;
use std::process::Command;

use crate::controller::dispatch_queued;
use crate::job;
use crate::scheduler;
use crate::site::Site;
use crate::store::Store;
use crate::{Error, SPAWN_FAILURE_RESULT, WRAPPER_FAILURE_RESULT};

/// The two environment variables a wrapper invocation is identified by.
pub const JOB_ID_VAR: &str = "JOB_ID";
pub const TASK_ID_VAR: &str = "SGE_TASK_ID";

/// Read the wrapper's identity from the environment.
///
/// # Errors
/// Returns `Err(Error::UnexpectedOutput)` when `JOB_ID` is absent or not an integer, or when
/// `SGE_TASK_ID` is present but not an integer.
pub fn identity_from_env() -> Result<(i64, Option<i64>), Error> {
    let job_id = env::var(JOB_ID_VAR).map_err(|_| {
        Error::UnexpectedOutput(JOB_ID_VAR.to_string(), "not set".to_string())
    })?;
    let job_id: i64 = job_id
        .parse()
        .map_err(|_| Error::UnexpectedOutput(JOB_ID_VAR.to_string(), job_id))?;

    let task_index = match env::var(TASK_ID_VAR) {
        Ok(value) if value == "undefined" => None,
        Ok(value) => Some(
            value
                .parse::<i64>()
                .map_err(|_| Error::UnexpectedOutput(TASK_ID_VAR.to_string(), value))?,
        ),
        Err(_) => None,
    };

    Ok((job_id, task_index))
}

/// Run the job (or array task) identified by the environment, recording its result in the
/// store. Returns the process exit code the wrapper binary should itself exit with.
///
/// `local`/`site_config` mirror the enclosing `jobctl` invocation's own options: if finishing
/// this job newly queues a non-local dependent (one reached by the cascade in `job::finish`),
/// this wrapper is the only thing around to dispatch it to a `Backend` -- it runs as its own
/// process, with no `Controller` in scope.
///
/// # Errors
/// Returns `Err(Error)` on store or lock failures. A failure to spawn the job's own command
/// is recorded in the store as `SPAWN_FAILURE_RESULT` and is *not* an `Err` here -- the
/// wrapper ran successfully, the job it ran did not.
pub fn run_job(database: &Path, local: bool, site_config: Option<&Path>) -> Result<i32, Error> {
    let (job_id, task_index) = identity_from_env()?;
    let mut store = Store::open(database)?;

    let target = store.with_session(|store| {
        let target = store.get_job(job_id)?;
        if target.status.is_terminal() {
            info!("Job {job_id} was already finalized before this wrapper ran; exiting.");
            return Ok(None);
        }
        job::execute(store, job_id, task_index, hostname().as_deref())?;
        Ok(Some(target))
    })?;

    let Some(target) = target else {
        return Ok(0);
    };

    let result = match run_command(&target) {
        Ok(code) => code,
        Err(error) => {
            warn!("Job {job_id} failed to spawn: {error}.");
            SPAWN_FAILURE_RESULT
        }
    };

    let newly_queued = store.with_session(|store| job::finish(store, job_id, result, task_index))?;

    if !newly_queued.is_empty() {
        let site = Site::open(site_config)?;
        let backend = scheduler::select(local, database, site);
        dispatch_queued(&mut store, backend.as_ref(), &newly_queued)?;
    }

    if result != 0 {
        Ok(i32::try_from(WRAPPER_FAILURE_RESULT).unwrap_or(i32::MAX))
    } else {
        Ok(0)
    }
}

fn run_command(target: &crate::job::Job) -> Result<i64, Error> {
    let Some((program, args)) = target.command.split_first() else {
        return Err(Error::SpawnProcess(
            String::new(),
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        ));
    };

    let mut command = Command::new(program);
    command.args(args);
    if let Some(exec_dir) = &target.exec_dir {
        command.current_dir(exec_dir);
    }

    let status = command
        .status()
        .map_err(|e| Error::SpawnProcess(program.clone(), e))?;

    Ok(status.code().map_or(WRAPPER_FAILURE_RESULT, i64::from))
}

/// The machine name recorded against an executing job. `$HOSTNAME` is a shell-internal
/// variable most shells never export into a child process's environment, so this shells out
/// to the `hostname` command instead, the same way the rest of this crate talks to external
/// tools (`qsub`, `qstat`, `qdel`) rather than guessing at environment conventions.
fn hostname() -> Option<String> {
    let output = Command::new("hostname").output().ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_requires_job_id() {
        env::remove_var(JOB_ID_VAR);
        env::remove_var(TASK_ID_VAR);
        assert!(identity_from_env().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn identity_reads_job_and_task() {
        env::set_var(JOB_ID_VAR, "5");
        env::set_var(TASK_ID_VAR, "3");
        assert_eq!(identity_from_env().unwrap(), (5, Some(3)));
        env::remove_var(JOB_ID_VAR);
        env::remove_var(TASK_ID_VAR);
    }

    #[test]
    #[serial_test::serial]
    fn identity_treats_undefined_task_as_non_array() {
        env::set_var(JOB_ID_VAR, "5");
        env::set_var(TASK_ID_VAR, "undefined");
        assert_eq!(identity_from_env().unwrap(), (5, None));
        env::remove_var(JOB_ID_VAR);
        env::remove_var(TASK_ID_VAR);
    }
}
