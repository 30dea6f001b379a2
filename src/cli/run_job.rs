use clap::Args;
use std::error::Error;
use std::io::Write;

use crate::cli::GlobalOptions;
use jobctl::controller::Controller;
use jobctl::MultiProgressContainer;

#[derive(Args, Debug)]
pub struct Arguments {}

/// Run the execution wrapper for the job identified by `JOB_ID`/`SGE_TASK_ID`. Returns the
/// exit code the process should itself exit with -- distinct from every other subcommand,
/// whose success or failure is reported by `main`'s own `Result<(), _>` convention.
pub fn run_job<W: Write>(
    options: &GlobalOptions,
    _args: Arguments,
    _multi_progress: &mut MultiProgressContainer,
    _output: &mut W,
) -> Result<i32, Box<dyn Error>> {
    Ok(Controller::run_job(
        &options.database,
        options.local,
        options.site_config.as_deref(),
    )?)
}
