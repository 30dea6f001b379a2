use clap::Args;
use console::Style;
use std::error::Error;
use std::io::Write;

use crate::cli::GlobalOptions;
use jobctl::controller::Controller;
use jobctl::ids::parse_ids_many;
use jobctl::job::{Job, Status};
use jobctl::MultiProgressContainer;

use crate::ui::{Alignment, Item, Row, Table};

#[derive(Args, Debug)]
pub struct Arguments {
    /// Id selections to list (e.g. `1-3+7`); defaults to every job.
    ids: Vec<String>,

    /// Restrict to jobs whose name matches exactly. May be given more than once.
    #[arg(long = "names", value_name = "NAME")]
    names: Vec<String>,

    /// Restrict to jobs in one of these states (e.g. `failure`). May be given more than once.
    #[arg(long = "status", value_name = "STATUS")]
    status: Vec<String>,

    /// Print one row per array task instead of one row per array job.
    #[arg(long)]
    print_array_jobs: bool,

    /// Print the ids each job depends on in an extra column.
    #[arg(long)]
    print_dependencies: bool,

    /// Print submit/start/finish timestamps in extra columns.
    #[arg(long)]
    print_times: bool,

    /// Print one labeled block per job instead of a table.
    #[arg(long)]
    long: bool,

    /// Print only matching job ids, one per line.
    #[arg(long)]
    ids_only: bool,
}

fn status_style(status: Status) -> Style {
    match status {
        Status::Success => Style::new().green(),
        Status::Failure => Style::new().red(),
        Status::Executing => Style::new().cyan(),
        Status::Queued | Status::Submitted => Style::new().yellow(),
        Status::Waiting => Style::new().dim(),
    }
}

fn time_cell(value: Option<i64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// List jobs and their current status.
pub fn list<W: Write>(
    options: &GlobalOptions,
    args: Arguments,
    _multi_progress: &mut MultiProgressContainer,
    output: &mut W,
) -> Result<(), Box<dyn Error>> {
    let ids = parse_ids_many(&args.ids)?;
    let controller = Controller::open(&options.database, options.local, options.site_config.as_deref())?;
    let mut jobs = controller.list(ids.as_deref())?;

    if !args.names.is_empty() {
        jobs.retain(|job| args.names.iter().any(|n| n == &job.name));
    }
    if !args.status.is_empty() {
        jobs.retain(|job| args.status.iter().any(|s| s == job.status.as_str()));
    }

    if args.ids_only {
        for job in &jobs {
            writeln!(output, "{}", job.unique_id)?;
            if args.print_array_jobs {
                for task in &job.tasks {
                    writeln!(output, "{}.{}", job.unique_id, task.index)?;
                }
            }
        }
        return Ok(());
    }

    if args.long {
        return write_long(output, &controller, &jobs, &args);
    }

    let mut table = Table::new().with_hide_header(jobs.is_empty());
    table.header = vec![
        Item::new("ID".to_string(), Style::new().bold()),
        Item::new("NAME".to_string(), Style::new().bold()),
        Item::new("STATUS".to_string(), Style::new().bold()),
        Item::new("RESULT".to_string(), Style::new().bold()),
        Item::new("QUEUE".to_string(), Style::new().bold()),
    ];
    if args.print_dependencies {
        table.header.push(Item::new("DEPENDS-ON".to_string(), Style::new().bold()));
    }
    if args.print_times {
        table.header.push(Item::new("SUBMITTED".to_string(), Style::new().bold()));
        table.header.push(Item::new("STARTED".to_string(), Style::new().bold()));
        table.header.push(Item::new("FINISHED".to_string(), Style::new().bold()));
    }

    for job in &jobs {
        if args.print_array_jobs && job.is_array() {
            for task in &job.tasks {
                table.rows.push(task_row(
                    &controller,
                    job,
                    task,
                    args.print_dependencies,
                    args.print_times,
                )?);
            }
        } else {
            table.rows.push(job_row(
                &controller,
                job,
                args.print_dependencies,
                args.print_times,
            )?);
        }
    }

    table.write(output)?;
    Ok(())
}

fn dependencies_cell(controller: &Controller, job: &Job) -> Result<String, Box<dyn Error>> {
    let depends_on = controller.dependencies_of(job.unique_id)?;
    Ok(if depends_on.is_empty() {
        "-".to_string()
    } else {
        depends_on.iter().map(i64::to_string).collect::<Vec<_>>().join(",")
    })
}

fn job_row(
    controller: &Controller,
    job: &Job,
    print_dependencies: bool,
    print_times: bool,
) -> Result<Row, Box<dyn Error>> {
    let mut items = vec![
        Item::new(job.unique_id.to_string(), Style::new()).with_alignment(Alignment::Right),
        Item::new(job.name.clone(), Style::new()),
        Item::new(job.status.to_string(), status_style(job.status)),
        Item::new(
            job.result.map_or_else(|| "-".to_string(), |r| r.to_string()),
            Style::new(),
        )
        .with_alignment(Alignment::Right),
        Item::new(job.queue_name.clone(), Style::new()),
    ];
    if print_dependencies {
        items.push(Item::new(dependencies_cell(controller, job)?, Style::new()));
    }
    if print_times {
        items.push(Item::new(time_cell(Some(job.submit_time)), Style::new()).with_alignment(Alignment::Right));
        items.push(Item::new(time_cell(job.start_time), Style::new()).with_alignment(Alignment::Right));
        items.push(Item::new(time_cell(job.finish_time), Style::new()).with_alignment(Alignment::Right));
    }
    Ok(Row::Items(items))
}

fn task_row(
    controller: &Controller,
    job: &Job,
    task: &jobctl::job::ArrayTask,
    print_dependencies: bool,
    print_times: bool,
) -> Result<Row, Box<dyn Error>> {
    let mut items = vec![
        Item::new(format!("{}.{}", job.unique_id, task.index), Style::new()).with_alignment(Alignment::Right),
        Item::new(job.name.clone(), Style::new()),
        Item::new(task.status.to_string(), status_style(task.status)),
        Item::new(
            task.result.map_or_else(|| "-".to_string(), |r| r.to_string()),
            Style::new(),
        )
        .with_alignment(Alignment::Right),
        Item::new(job.queue_name.clone(), Style::new()),
    ];
    if print_dependencies {
        items.push(Item::new(dependencies_cell(controller, job)?, Style::new()));
    }
    if print_times {
        items.push(Item::new(time_cell(Some(job.submit_time)), Style::new()).with_alignment(Alignment::Right));
        items.push(Item::new(time_cell(task.start_time), Style::new()).with_alignment(Alignment::Right));
        items.push(Item::new(time_cell(task.finish_time), Style::new()).with_alignment(Alignment::Right));
    }
    Ok(Row::Items(items))
}

fn write_long<W: Write>(
    output: &mut W,
    controller: &Controller,
    jobs: &[Job],
    args: &Arguments,
) -> Result<(), Box<dyn Error>> {
    for (i, job) in jobs.iter().enumerate() {
        writeln!(output, "id:           {}", job.unique_id)?;
        writeln!(output, "name:         {}", job.name)?;
        writeln!(output, "status:       {}", job.status)?;
        writeln!(output, "result:       {}", job.result.map_or_else(|| "-".to_string(), |r| r.to_string()))?;
        writeln!(output, "queue:        {}", job.queue_name)?;
        writeln!(output, "command:      {}", job.command.join(" "))?;
        if args.print_dependencies {
            writeln!(output, "depends-on:   {}", dependencies_cell(controller, job)?)?;
        }
        if args.print_times {
            writeln!(output, "submitted:    {}", time_cell(Some(job.submit_time)))?;
            writeln!(output, "started:      {}", time_cell(job.start_time))?;
            writeln!(output, "finished:     {}", time_cell(job.finish_time))?;
        }
        if args.print_array_jobs && job.is_array() {
            writeln!(output, "tasks:")?;
            for task in &job.tasks {
                writeln!(
                    output,
                    "  {}.{}  {}  result={}",
                    job.unique_id,
                    task.index,
                    task.status,
                    task.result.map_or_else(|| "-".to_string(), |r| r.to_string())
                )?;
            }
        }
        if i + 1 != jobs.len() {
            writeln!(output)?;
        }
    }
    Ok(())
}
