// ProgressBar styles shared across the crate. Kept in one place so the spinner/template
// strings stay consistent wherever they're used.

use indicatif::{ProgressBar, ProgressStyle};

/// The local scheduler's "N/P running, M finished" spinner, ticked once per loop iteration.
pub fn scheduler_tick() -> ProgressStyle {
    ProgressStyle::with_template("{spinner} {msg}")
        .expect("static template is valid")
        .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ")
}

/// Build a hidden-by-default scheduler progress bar; the caller decides whether to attach it
/// to a `MultiProgress` or leave its draw target hidden.
pub fn scheduler_bar() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(scheduler_tick());
    bar.enable_steady_tick(std::time::Duration::from_millis(120));
    bar
}

/// Render the scheduler status line shown alongside the spinner.
pub fn scheduler_message(admitted: usize, parallelism: u32, done: usize, total: usize) -> String {
    format!("{admitted}/{parallelism} running, {done}/{total} finished")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_formats_counts() {
        assert_eq!(scheduler_message(2, 4, 3, 10), "2/4 running, 3/10 finished");
    }
}
