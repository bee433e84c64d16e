//! Terminal rendering of the pipeline's progress stream.

use std::io::IsTerminal;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::progress::{
    format_size, LogSink, ProgressEvent, ProgressSink, ProgressUpdate, TransferObservation,
};

/// Item bar plus a byte bar for the transfer in flight. Everything is also
/// logged, through `suspend` so log lines don't tear the bars.
pub struct Renderer {
    _multi: MultiProgress,
    items: ProgressBar,
    bytes: ProgressBar,
}

impl Renderer {
    /// Hidden when the user passed `--no-progress-bar` or stdout is not a TTY.
    pub fn new(no_progress_bar: bool) -> Self {
        let hidden = no_progress_bar || !std::io::stdout().is_terminal();
        let multi = if hidden {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };

        let items = multi.add(ProgressBar::new(0));
        items.set_style(
            ProgressStyle::with_template(
                "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} items {msg}",
            )
            .expect("valid template")
            .progress_chars("=> "),
        );
        let bytes = multi.add(ProgressBar::new(0));
        bytes.set_style(
            ProgressStyle::with_template(
                "{msg:30!} [{bar:40.green/white}] {bytes}/{total_bytes} ({bytes_per_sec})",
            )
            .expect("valid template")
            .progress_chars("=> "),
        );

        Self {
            _multi: multi,
            items,
            bytes,
        }
    }

    pub fn apply(&self, update: &ProgressUpdate) {
        match update {
            ProgressUpdate::Event { event, stats } => {
                self.items.suspend(|| LogSink.event(event, stats));
                self.on_event(event);
            }
            ProgressUpdate::Transfer {
                filename,
                observation,
            } => self.on_transfer(filename, observation),
        }
    }

    fn on_event(&self, event: &ProgressEvent) {
        if event.is_terminal() {
            self.items.inc(1);
        }
        match event {
            ProgressEvent::Started { total } => self.items.set_length(*total as u64),
            ProgressEvent::Downloading { filename, size, .. } => {
                self.bytes.reset();
                self.bytes.set_length(size.unwrap_or(0));
                self.bytes.set_message(filename.clone());
            }
            ProgressEvent::Uploading { filename, .. } => {
                self.bytes.set_message(format!("relocating {}", filename));
            }
            ProgressEvent::Skipped { .. }
            | ProgressEvent::Completed { .. }
            | ProgressEvent::Failed { .. }
            | ProgressEvent::Error { .. } => {}
            ProgressEvent::Finished { total_bytes, .. } => {
                self.bytes.finish_and_clear();
                self.items
                    .finish_with_message(format_size(Some(*total_bytes)));
            }
        }
    }

    fn on_transfer(&self, filename: &str, observation: &TransferObservation) {
        match observation {
            TransferObservation::Bytes {
                received, total, ..
            } => {
                if let Some(total) = total {
                    self.bytes.set_length(*total);
                }
                self.bytes.set_position(*received);
            }
            other => self.items.suspend(|| LogSink.transfer(filename, other)),
        }
    }
}
