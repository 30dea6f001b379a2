pub mod communicate;
pub mod delete;
pub mod list;
pub mod report;
pub mod resubmit;
pub mod run_job;
pub mod run_scheduler;
pub mod stop;
pub mod submit;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None, subcommand_required = true)]
pub struct Options {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalOptions {
    /// Run jobs on the local scheduler instead of the grid.
    #[arg(long, global = true, env = "JOBCTL_LOCAL", display_order = 2)]
    pub local: bool,

    /// Path to the state database.
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        default_value = "submitted.sql3",
        env = "JOBCTL_DATABASE",
        display_order = 2
    )]
    pub database: PathBuf,

    /// When to print colored output.
    #[arg(long, value_name="WHEN", value_enum, default_value_t=ColorMode::Auto, global=true, env="JOBCTL_COLOR", display_order=2)]
    pub color: ColorMode,

    /// Disable progress bars.
    #[arg(long, global = true, env = "JOBCTL_NO_PROGRESS", display_order = 2)]
    pub no_progress: bool,

    /// Override the site configuration file location.
    #[arg(long, value_name = "PATH", global = true, env = "JOBCTL_HOME", display_order = 2)]
    pub site_config: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum ColorMode {
    /// Automatically detect when to print colored output.
    Auto,

    /// Always print colored output.
    Always,

    /// Never print colored output.
    Never,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a new job.
    Submit(submit::Arguments),

    /// Resubmit jobs that were stopped, failed, or never ran.
    Resubmit(resubmit::Arguments),

    /// List jobs and their current status.
    List(list::Arguments),

    /// Print each job's captured stdout/stderr logs.
    Report(report::Arguments),

    /// Stop running or queued jobs.
    Stop(stop::Arguments),

    /// Delete jobs from the state database.
    Delete(delete::Arguments),

    /// Run the local scheduler loop until every local job finishes.
    RunScheduler(run_scheduler::Arguments),

    /// Run the execution wrapper for a single job (invoked by the scheduler or by `qsub`).
    RunJob(run_job::Arguments),

    /// Reconcile the state database against the grid's own view of outstanding jobs.
    Communicate(communicate::Arguments),
}
