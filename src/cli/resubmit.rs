use clap::Args;
use log::info;
use std::error::Error;
use std::io::Write;

use crate::cli::GlobalOptions;
use jobctl::controller::{Controller, ResubmitRequest};
use jobctl::ids::parse_ids_many;
use jobctl::MultiProgressContainer;

#[derive(Args, Debug)]
pub struct Arguments {
    /// Id selections to resubmit (e.g. `1-3+7`); defaults to every job.
    ids: Vec<String>,

    /// Also resubmit jobs that already succeeded (default: only `submitted`/`failure`).
    #[arg(long)]
    also_success: bool,

    /// Also resubmit jobs that are currently executing, stopping them first.
    #[arg(long)]
    running_jobs: bool,

    /// Replace the command every resubmitted job runs. Takes every remaining token, so pass
    /// it last.
    #[arg(long = "overwrite-command", value_name = "COMMAND", num_args = 1.., allow_hyphen_values = true)]
    overwrite_command: Vec<String>,

    /// Keep each job's previous stdout/stderr log files instead of removing them.
    #[arg(long)]
    keep_logs: bool,

    /// Request a minimum amount of free memory (e.g. `4G`).
    #[arg(long)]
    mem_free: Option<String>,

    /// Request a virtual memory limit (e.g. `8G`).
    #[arg(long)]
    h_vmem: Option<String>,

    /// Request a number of GPUs (e.g. `1`).
    #[arg(long)]
    gpumem: Option<String>,

    /// Request a parallel environment (e.g. `smp:4`).
    #[arg(long)]
    parallel_env: Option<String>,

    /// Restrict to a host mask.
    #[arg(long)]
    hosts: Option<String>,

    /// Request the `io_big` resource.
    #[arg(long)]
    io_big: bool,
}

fn grid_arguments(args: &Arguments) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    if let Some(v) = &args.mem_free {
        map.insert("mem_free".to_string(), serde_json::Value::String(v.clone()));
    }
    if let Some(v) = &args.h_vmem {
        map.insert("h_vmem".to_string(), serde_json::Value::String(v.clone()));
    }
    if let Some(v) = &args.gpumem {
        map.insert("gpumem".to_string(), serde_json::Value::String(v.clone()));
    }
    if let Some(v) = &args.parallel_env {
        map.insert("parallel_env".to_string(), serde_json::Value::String(v.clone()));
    }
    if let Some(v) = &args.hosts {
        map.insert("hosts".to_string(), serde_json::Value::String(v.clone()));
    }
    if args.io_big {
        map.insert("io_big".to_string(), serde_json::Value::Bool(true));
    }
    serde_json::Value::Object(map)
}

/// Resubmit jobs, moving them back to `submitted` and re-running dependency checks.
pub fn resubmit<W: Write>(
    options: &GlobalOptions,
    args: Arguments,
    _multi_progress: &mut MultiProgressContainer,
    output: &mut W,
) -> Result<(), Box<dyn Error>> {
    let ids = parse_ids_many(&args.ids)?;
    let overwrite_command = (!args.overwrite_command.is_empty()).then(|| args.overwrite_command.clone());
    let grid_arguments = grid_arguments(&args);

    let mut controller = Controller::open(&options.database, options.local, options.site_config.as_deref())?;
    let resubmitted = controller.resubmit(ResubmitRequest {
        ids,
        also_success: args.also_success,
        running_jobs: args.running_jobs,
        overwrite_command,
        keep_logs: args.keep_logs,
        grid_arguments,
    })?;

    for job in &resubmitted {
        writeln!(output, "{}", job.unique_id)?;
    }
    info!("Resubmitted {} job(s).", resubmitted.len());
    Ok(())
}
