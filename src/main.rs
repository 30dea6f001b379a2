#![warn(clippy::pedantic)]

use clap::Parser;
use indicatif::{MultiProgress, ProgressDrawTarget};
use indicatif_log_bridge::LogWrapper;
use log::error;
use std::error::Error;
use std::io::{self, Write};
use std::process::ExitCode;

mod cli;
mod ui;

use cli::{ColorMode, Commands, Options};
use jobctl::MultiProgressContainer;
use ui::MultiProgressWriter;

fn main_detail() -> Result<ExitCode, Box<dyn Error>> {
    let options = Options::parse();

    let log_style;
    match options.global.color {
        ColorMode::Never => {
            log_style = "never";
            console::set_colors_enabled(false);
        }
        ColorMode::Always => {
            log_style = "always";
            console::set_colors_enabled(true);
        }
        ColorMode::Auto => {
            log_style = "auto";
        }
    }

    let log_level = match options.verbose.log_level_filter() {
        clap_verbosity_flag::LevelFilter::Off => "off",
        clap_verbosity_flag::LevelFilter::Error => "error",
        clap_verbosity_flag::LevelFilter::Warn => "warn",
        clap_verbosity_flag::LevelFilter::Info => "info",
        clap_verbosity_flag::LevelFilter::Debug => "debug",
        clap_verbosity_flag::LevelFilter::Trace => "trace",
    };

    let multi_progress = if options.global.no_progress {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    } else {
        MultiProgress::new()
    };

    let mut output = MultiProgressWriter::new(io::stdout(), multi_progress.clone());

    let env = env_logger::Env::default()
        .filter_or("JOBCTL_LOG", log_level)
        .write_style_or("JOBCTL_LOG_STYLE", log_style);

    let logger = env_logger::Builder::from_env(env)
        .format_timestamp(None)
        .build();

    LogWrapper::new(multi_progress.clone(), logger).try_init()?;

    let mut multi_progress_container = MultiProgressContainer::new(multi_progress.clone());

    let exit_code = match options.command {
        None => ExitCode::SUCCESS,
        Some(Commands::Submit(args)) => {
            cli::submit::submit(&options.global, args, &mut multi_progress_container, &mut output)?;
            ExitCode::SUCCESS
        }
        Some(Commands::Resubmit(args)) => {
            cli::resubmit::resubmit(&options.global, args, &mut multi_progress_container, &mut output)?;
            ExitCode::SUCCESS
        }
        Some(Commands::List(args)) => {
            cli::list::list(&options.global, args, &mut multi_progress_container, &mut output)?;
            ExitCode::SUCCESS
        }
        Some(Commands::Report(args)) => {
            cli::report::report(&options.global, args, &mut multi_progress_container, &mut output)?;
            ExitCode::SUCCESS
        }
        Some(Commands::Stop(args)) => {
            cli::stop::stop(&options.global, args, &mut multi_progress_container, &mut output)?;
            ExitCode::SUCCESS
        }
        Some(Commands::Delete(args)) => {
            cli::delete::delete(&options.global, args, &mut multi_progress_container, &mut output)?;
            ExitCode::SUCCESS
        }
        Some(Commands::RunScheduler(args)) => {
            cli::run_scheduler::run_scheduler(
                &options.global,
                args,
                &mut multi_progress_container,
                &mut output,
            )?;
            ExitCode::SUCCESS
        }
        Some(Commands::RunJob(args)) => {
            let code =
                cli::run_job::run_job(&options.global, args, &mut multi_progress_container, &mut output)?;
            u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
        }
        Some(Commands::Communicate(args)) => {
            cli::communicate::communicate(&options.global, args, &mut multi_progress_container, &mut output)?;
            ExitCode::SUCCESS
        }
    };

    output.flush()?;
    drop(output);

    Ok(exit_code)
}

fn main() -> ExitCode {
    match main_detail() {
        Ok(code) => code,
        Err(error) => {
            error!("{error}");
            ExitCode::FAILURE
        }
    }
}
