use clap::Args;
use log::info;
use std::error::Error;
use std::io::Write;

use crate::cli::GlobalOptions;
use jobctl::controller::Controller;
use jobctl::ids::parse_ids_many;
use jobctl::store::DeleteFilter;
use jobctl::MultiProgressContainer;

#[derive(Args, Debug)]
pub struct Arguments {
    /// Id selections to delete (e.g. `1-3+7`); defaults to every job.
    ids: Vec<String>,

    /// Also remove the job's captured log files.
    #[arg(long)]
    also_logs: bool,

    /// Also remove the job's log directory, if it becomes empty.
    #[arg(long)]
    also_log_dir: bool,
}

/// Delete jobs from the state database.
pub fn delete<W: Write>(
    options: &GlobalOptions,
    args: Arguments,
    _multi_progress: &mut MultiProgressContainer,
    output: &mut W,
) -> Result<(), Box<dyn Error>> {
    let ids = parse_ids_many(&args.ids)?;
    let controller = Controller::open(&options.database, options.local, options.site_config.as_deref())?;

    let deleted = controller.delete(DeleteFilter {
        ids,
        status: None,
        also_logs: args.also_logs,
        also_log_dir: args.also_log_dir,
    })?;

    for id in &deleted {
        writeln!(output, "{id}")?;
    }
    info!("Deleted {} job(s).", deleted.len());
    Ok(())
}
