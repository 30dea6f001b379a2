use clap::Args;
use log::info;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::error::Error;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::cli::GlobalOptions;
use jobctl::controller::Controller;
use jobctl::MultiProgressContainer;

#[derive(Args, Debug)]
pub struct Arguments {
    /// Maximum number of concurrently executing jobs (defaults to the site's configured
    /// parallelism).
    #[arg(short = 'P', long)]
    parallelism: Option<u32>,

    /// Do not capture stdout/stderr to `log_dir`; inherit this process's streams instead.
    #[arg(long)]
    no_log_files: bool,
}

/// Run the local scheduler loop until every local job finishes or the process is signaled.
pub fn run_scheduler<W: Write>(
    options: &GlobalOptions,
    args: Arguments,
    multi_progress: &mut MultiProgressContainer,
    _output: &mut W,
) -> Result<(), Box<dyn Error>> {
    let cancel = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, Arc::clone(&cancel))?;
    flag::register(SIGTERM, Arc::clone(&cancel))?;

    let mut controller = Controller::open(&options.database, options.local, options.site_config.as_deref())?;
    controller.run_scheduler(
        args.parallelism,
        cancel,
        multi_progress,
        options.no_progress,
        args.no_log_files,
    )?;

    info!("Scheduler finished.");
    Ok(())
}
