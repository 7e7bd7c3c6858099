//! Progress bar driven by transfer events

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use resumable_types::{ProgressRecord, TransferEvent};

/// Single progress bar for one transfer
pub struct TransferProgress {
    pb: ProgressBar,
}

impl TransferProgress {
    /// Create a bar starting from what the store already holds
    pub fn new(record: &ProgressRecord) -> Self {
        let pb = ProgressBar::new(record.total_size.unwrap_or(0));

        if let Ok(bar_style) = ProgressStyle::default_bar().template(concat!(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] ",
            "{bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
        )) {
            pb.set_style(bar_style.progress_chars("█▓▒░  "));
        }

        pb.set_position(record.received_bytes());
        if record.last_range.is_some() {
            pb.set_message(format!("{}", style("resumed").dim()));
        }

        Self { pb }
    }

    /// Hidden bar for non-interactive output
    pub fn hidden() -> Self {
        Self {
            pb: ProgressBar::hidden(),
        }
    }

    pub fn handle_event(&self, event: &TransferEvent) {
        match event {
            TransferEvent::ChunkReceived {
                range,
                total_size,
                bytes,
            } => {
                match (range, total_size) {
                    (Some(range), Some(total)) => {
                        self.pb.set_length(*total);
                        self.pb.set_position(range.next_start());
                    }
                    // Whole resource in one body
                    _ => {
                        self.pb.set_length(*bytes);
                        self.pb.set_position(*bytes);
                    }
                }
                self.pb.set_message("");
            }

            TransferEvent::Restarted { reason } => {
                self.pb.set_position(0);
                self.pb
                    .set_message(format!("{} restarted: {}", style("↺").yellow(), reason));
            }

            TransferEvent::RetryScheduled {
                attempt,
                delay_ms,
                error,
                ..
            } => {
                self.pb.set_message(format!(
                    "{} retry {} in {}ms: {}",
                    style("⏸").yellow(),
                    attempt,
                    delay_ms,
                    error
                ));
            }

            TransferEvent::Completed { .. } => {
                self.pb.finish_with_message(format!(
                    "{} Download complete",
                    style("✓").green().bold()
                ));
            }

            TransferEvent::GaveUp { error, .. } => {
                self.pb.abandon_with_message(format!(
                    "{} Failed: {}",
                    style("✗").red().bold(),
                    error
                ));
            }

            TransferEvent::StateChanged { .. } => {}
        }
    }

    /// Stop drawing, leaving the last message on screen
    pub fn abandon(&self, message: String) {
        self.pb.abandon_with_message(message);
    }
}
