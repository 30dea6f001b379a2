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
    /// Id selections to reconcile (e.g. `1-3+7`); defaults to every outstanding job.
    ids: Vec<String>,
}

/// Reconcile the state database against the grid's own view of outstanding jobs, marking
/// jobs that vanished from the queue without finishing as failed.
pub fn communicate<W: Write>(
    options: &GlobalOptions,
    args: Arguments,
    _multi_progress: &mut MultiProgressContainer,
    output: &mut W,
) -> Result<(), Box<dyn Error>> {
    let ids = parse_ids_many(&args.ids)?;
    let mut controller = Controller::open(&options.database, options.local, options.site_config.as_deref())?;
    let statuses = controller.communicate(ids.as_deref())?;

    for status in &statuses {
        writeln!(
            output,
            "{}: {}",
            status.external_id,
            if status.running { "running" } else { "vanished" }
        )?;
    }
    info!("Reconciled {} job(s) against the grid.", statuses.len());
    Ok(())
}
