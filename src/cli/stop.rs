use clap::Args;
use log::info;
use std::error::Error;
use std::io::Write;

use crate::cli::GlobalOptions;
use jobctl::controller::Controller;
use jobctl::ids::parse_ids_many;
use jobctl::MultiProgressContainer;

#[derive(Args, Debug)]
pub struct Arguments {
    /// Id selections to stop (e.g. `1-3+7`); defaults to every non-terminal job.
    ids: Vec<String>,
}

/// Stop running or queued jobs.
pub fn stop<W: Write>(
    options: &GlobalOptions,
    args: Arguments,
    _multi_progress: &mut MultiProgressContainer,
    output: &mut W,
) -> Result<(), Box<dyn Error>> {
    let ids = parse_ids_many(&args.ids)?;
    let mut controller = Controller::open(&options.database, options.local, options.site_config.as_deref())?;
    let stopped = controller.stop(ids.as_deref())?;

    for job in &stopped {
        writeln!(output, "{}", job.unique_id)?;
    }
    info!("Stopped {} job(s).", stopped.len());
    Ok(())
}
