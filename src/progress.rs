use crate::batch::IterationError;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;

/// Observer for batch lifecycle events.
///
/// Every method has a no-op default so observers only implement what they
/// report on.
pub trait BatchObserver {
    fn on_pool_ready(&mut self, workers: usize) {
        let _ = workers;
    }
    fn on_pool_teardown(&mut self, workers: usize) {
        let _ = workers;
    }
    fn on_batch_start(&mut self, total: usize) {
        let _ = total;
    }
    fn on_iteration_start(&mut self, index: usize, response: &str) {
        let _ = (index, response);
    }
    fn on_iteration_success(&mut self, index: usize, response: &str) {
        let _ = (index, response);
    }
    fn on_iteration_failure(&mut self, index: usize, response: &str, error: &IterationError) {
        let _ = (index, response, error);
    }
    fn on_batch_finish(&mut self, succeeded: usize, failed: usize) {
        let _ = (succeeded, failed);
    }
}

#[derive(Default)]
pub struct NoopObserver;

impl BatchObserver for NoopObserver {}

/// Terminal progress bar over response variables. Hidden when stderr is not
/// a terminal.
pub struct ProgressBarObserver {
    bar: Option<ProgressBar>,
}

impl ProgressBarObserver {
    pub fn new() -> Self {
        Self { bar: None }
    }

    fn create_progress_bar(len: u64) -> ProgressBar {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let pb = ProgressBar::with_draw_target(Some(len), draw_target);
        let style = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
        pb.set_style(style);
        pb
    }
}

impl Default for ProgressBarObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchObserver for ProgressBarObserver {
    fn on_pool_ready(&mut self, workers: usize) {
        log::debug!("Tuning will use {workers} workers.");
    }

    fn on_batch_start(&mut self, total: usize) {
        self.bar = Some(Self::create_progress_bar(total as u64));
    }

    fn on_iteration_start(&mut self, index: usize, response: &str) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("tuning #{index} {response}"));
        }
    }

    fn on_iteration_success(&mut self, index: usize, response: &str) {
        let _ = (index, response);
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
    }

    fn on_iteration_failure(&mut self, index: usize, response: &str, error: &IterationError) {
        if let Some(bar) = &self.bar {
            bar.println(format!("Response #{index} ({response}) failed: {error}"));
            bar.inc(1);
        }
    }

    fn on_batch_finish(&mut self, succeeded: usize, failed: usize) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message(format!("{succeeded} fitted, {failed} failed"));
        }
    }
}
