//! Terminal progress bars for pipeline events.

use colored::Colorize;
use distill_training::{ProgressEvent, ProgressSink, Stage};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;

/// Renders stage progress with indicatif; one bar per running stage.
#[derive(Default)]
pub struct BarProgressSink {
    bar: Mutex<Option<ProgressBar>>,
}

impl BarProgressSink {
    fn with_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(guard) = self.bar.lock()
            && let Some(bar) = guard.as_ref()
        {
            f(bar);
        }
    }

    fn start(&self, stage: Stage, total: Option<u64>) {
        let bar = match total {
            Some(total) => {
                let bar = ProgressBar::new(total);
                let template =
                    "{spinner:.cyan} {prefix:.bold} [{bar:40.cyan/blue}] {pos}/{len} {msg}";
                if let Ok(style) = ProgressStyle::default_bar().template(template) {
                    bar.set_style(style.progress_chars("=> "));
                }
                bar
            }
            None => ProgressBar::new_spinner(),
        };
        bar.set_prefix(stage.as_str());
        if let Ok(mut guard) = self.bar.lock() {
            *guard = Some(bar);
        }
    }
}

impl ProgressSink for BarProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { stage, total, .. } => self.start(stage, total),
            ProgressEvent::Message { message, .. } => self.with_bar(|bar| bar.println(message)),
            ProgressEvent::Step { step, loss, avg_loss, step_seconds, .. } => self.with_bar(|bar| {
                bar.set_position(step + 1);
                bar.set_message(format!(
                    "loss={loss:.4} avg={avg_loss:.4} {step_seconds:.2}s/step"
                ));
            }),
            ProgressEvent::Checkpoint { name, step, .. } => self.with_bar(|bar| {
                bar.println(format!(
                    "  {} checkpoint {} (step {})",
                    "✓".green(),
                    name.cyan(),
                    step
                ));
            }),
            ProgressEvent::Items { done, .. } => self.with_bar(|bar| bar.set_position(done)),
            ProgressEvent::Finished { .. } => {
                if let Ok(mut guard) = self.bar.lock()
                    && let Some(bar) = guard.take()
                {
                    bar.finish_and_clear();
                }
            }
        }
    }
}
