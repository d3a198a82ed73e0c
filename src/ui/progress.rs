use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::pipeline::PipelineState;
use crate::ui::icons::{BUILD, CHECK, CLOCK, PLAN, RUNNING};

/// Spinner shown while a non-streaming stage is waiting on the network.
///
/// Hidden automatically when stderr is not a terminal. Cloning shares the
/// same bar, so a clone can live inside the coordinator's state sink.
#[derive(Clone)]
pub struct StageProgress {
    bar: ProgressBar,
}

impl StageProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(template) = ProgressStyle::default_spinner().template("{spinner} {msg}") {
            bar.set_style(template);
        }
        Self { bar }
    }

    /// Start spinning with `message`.
    pub fn start(&self, message: impl Into<String>) {
        self.bar.set_message(message.into());
        self.bar.enable_steady_tick(Duration::from_millis(100));
    }

    /// Stop the spinner and leave `message` in its place.
    pub fn finish(&self, message: impl Into<String>) {
        if self.bar.is_finished() {
            return;
        }
        self.bar.finish_and_clear();
        eprintln!("{}", message.into());
    }

    /// Stop the spinner without printing anything.
    pub fn clear(&self) {
        if !self.bar.is_finished() {
            self.bar.finish_and_clear();
        }
    }

    /// Render one pipeline state transition.
    ///
    /// Planning spins; Building prints a header because generated tokens
    /// stream to stdout right after it.
    pub fn on_state(&self, state: PipelineState) {
        match state {
            PipelineState::Planning => self.start(format!("{}Planning...", PLAN)),
            PipelineState::Building => {
                self.finish(format!("{}Plan ready", CHECK));
                eprintln!("{}{}", BUILD, style("Generating program").bold());
            }
            PipelineState::AwaitingArtifact => {}
            PipelineState::Executing => {
                eprintln!();
                eprintln!("{}{}", RUNNING, style("Executing in sandbox").bold());
            }
            PipelineState::DryRunSkip => {
                eprintln!();
                eprintln!("{}Dry run: execution skipped", CLOCK);
            }
            PipelineState::Terminal => self.clear(),
        }
    }
}

impl Default for StageProgress {
    fn default() -> Self {
        Self::new()
    }
}
