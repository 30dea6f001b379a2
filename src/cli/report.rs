use clap::Args;
use std::error::Error;
use std::fs;
use std::io::Write;

use crate::cli::GlobalOptions;
use jobctl::controller::Controller;
use jobctl::ids::parse_ids_many;
use jobctl::job::{log_paths, Job};
use jobctl::MultiProgressContainer;

#[derive(Args, Debug)]
pub struct Arguments {
    /// Id selections to report on (e.g. `1-3+7`); defaults to every job.
    ids: Vec<String>,

    /// Restrict to specific array task indices, for array jobs.
    #[arg(long = "array-ids", value_name = "IDS")]
    array_ids: Vec<i64>,

    /// Restrict to jobs in one of these states (e.g. `failure`).
    #[arg(long)]
    status: Vec<String>,

    /// Restrict to jobs whose name matches exactly.
    #[arg(long)]
    name: Option<String>,

    /// Only print captured stderr.
    #[arg(long, conflicts_with = "output_only")]
    errors_only: bool,

    /// Only print captured stdout.
    #[arg(long, conflicts_with = "errors_only")]
    output_only: bool,
}

/// Print the captured stdout/stderr logs for matching jobs (and array tasks), concatenated
/// in ascending id/index order.
pub fn report<W: Write>(
    options: &GlobalOptions,
    args: Arguments,
    _multi_progress: &mut MultiProgressContainer,
    output: &mut W,
) -> Result<(), Box<dyn Error>> {
    let ids = parse_ids_many(&args.ids)?;
    let controller = Controller::open(&options.database, options.local, options.site_config.as_deref())?;
    let mut jobs = controller.list(ids.as_deref())?;

    if !args.status.is_empty() {
        jobs.retain(|job| args.status.iter().any(|s| s == job.status.as_str()));
    }
    if let Some(name) = &args.name {
        jobs.retain(|job| &job.name == name);
    }

    let print_stdout = !args.errors_only;
    let print_stderr = !args.output_only;

    for job in &jobs {
        if job.is_array() {
            let indices: Vec<i64> = if args.array_ids.is_empty() {
                job.tasks.iter().map(|t| t.index).collect()
            } else {
                args.array_ids.clone()
            };
            for index in indices {
                print_one(output, job, Some(index), print_stdout, print_stderr)?;
            }
        } else {
            print_one(output, job, None, print_stdout, print_stderr)?;
        }
    }

    Ok(())
}

fn print_one<W: Write>(
    output: &mut W,
    job: &Job,
    task_index: Option<i64>,
    print_stdout: bool,
    print_stderr: bool,
) -> Result<(), Box<dyn Error>> {
    let header = match task_index {
        Some(index) => format!("==> job {} ('{}') task {index} <==", job.unique_id, job.name),
        None => format!("==> job {} ('{}') <==", job.unique_id, job.name),
    };
    writeln!(output, "{header}")?;

    let Some((out_path, err_path)) = log_paths(job, task_index) else {
        writeln!(output, "(no log_dir recorded for this job)")?;
        writeln!(output)?;
        return Ok(());
    };

    if print_stdout {
        print_captured(output, &out_path)?;
    }
    if print_stderr {
        print_captured(output, &err_path)?;
    }
    writeln!(output)?;
    Ok(())
}

fn print_captured<W: Write>(output: &mut W, path: &std::path::Path) -> Result<(), Box<dyn Error>> {
    match fs::read(path) {
        Ok(contents) => {
            output.write_all(&contents)?;
            if contents.last() != Some(&b'\n') {
                writeln!(output)?;
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            writeln!(output, "(no log file at {})", path.display())?;
        }
        Err(e) => return Err(Box::new(e)),
    }
    Ok(())
}
