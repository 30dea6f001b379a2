use clap::Args;
use log::info;
use std::error::Error;
use std::io::Write;
use std::path::PathBuf;

use crate::cli::GlobalOptions;
use jobctl::controller::{Controller, SubmitRequest};
use jobctl::ids::{parse_ids_many, ArraySpec};
use jobctl::MultiProgressContainer;

#[derive(Args, Debug)]
pub struct Arguments {
    /// The job's command and arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,

    /// A human-readable name for the job (defaults to the command's file stem).
    #[arg(long)]
    name: Option<String>,

    /// Id selections this job depends on (e.g. `1-3+7`). May be given more than once.
    #[arg(long = "depends-on", value_name = "IDS")]
    depends_on: Vec<String>,

    /// Submit as an array job over a parametric range `first-last[:step]`.
    #[arg(long)]
    array: Option<String>,

    /// Working directory for the job (defaults to the current directory).
    #[arg(long)]
    exec_dir: Option<PathBuf>,

    /// Directory for captured stdout/stderr log files.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// The grid queue to submit to (`local` always runs on the local scheduler).
    #[arg(long, default_value = "local")]
    queue: String,

    /// Stop this job's dependents if it fails, instead of leaving them waiting forever.
    #[arg(long)]
    stop_on_failure: bool,

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

/// Submit a new job.
pub fn submit<W: Write>(
    options: &GlobalOptions,
    args: Arguments,
    _multi_progress: &mut MultiProgressContainer,
    output: &mut W,
) -> Result<(), Box<dyn Error>> {
    let dependencies = parse_ids_many(&args.depends_on)?.unwrap_or_default();
    let array_spec = args.array.as_deref().map(ArraySpec::parse).transpose()?;
    let grid_arguments = grid_arguments(&args);

    let mut controller = Controller::open(&options.database, options.local, options.site_config.as_deref())?;
    let job = controller.submit(SubmitRequest {
        command: args.command,
        name: args.name,
        dependencies,
        array_spec,
        exec_dir: args.exec_dir,
        log_dir: args.log_dir,
        queue_name: args.queue,
        stop_on_failure: args.stop_on_failure,
        grid_arguments,
    })?;

    info!("Submitted job {} ('{}').", job.unique_id, job.name);
    writeln!(output, "{}", job.unique_id)?;
    Ok(())
}
