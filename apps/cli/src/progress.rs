//! Progress bar utilities for CLI downloads

use crate::output::{display_name, format_eta, format_speed};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use resumedl_types::{CoreEvent, DownloadSnapshot, DownloadState};
use std::collections::HashMap;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// Manages progress bars for the downloads a command follows
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: HashMap<u32, ProgressBar>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Create a progress bar for a download
    pub fn add_download(&mut self, download: &DownloadSnapshot) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(download.total_bytes.unwrap_or(0)));
        let style = ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  ");
        pb.set_style(style);
        pb.set_prefix(display_name(download));
        pb.set_message(display_name(download));
        pb.set_position(download.received_bytes);

        self.bars.insert(download.id, pb.clone());
        pb
    }

    /// Update a progress bar from an event
    pub fn handle_event(&self, event: &CoreEvent) {
        match event {
            CoreEvent::DownloadProgress {
                id,
                received,
                total,
                bytes_per_sec,
            } => {
                if let Some(pb) = self.bars.get(id) {
                    if let Some(total) = total {
                        pb.set_length(*total);
                    }
                    pb.set_position(*received);
                    let eta = match total {
                        Some(total) if *bytes_per_sec > 0 => total.saturating_sub(*received) / bytes_per_sec,
                        _ => 0,
                    };
                    pb.set_message(format!(
                        "{} ({}, {})",
                        pb.prefix(),
                        format_speed(*bytes_per_sec),
                        format_eta(eta)
                    ));
                }
            }

            CoreEvent::DownloadUpdated { download } => {
                let Some(pb) = self.bars.get(&download.id) else {
                    return;
                };
                if let Some(total) = download.total_bytes {
                    pb.set_length(total);
                }
                pb.set_position(download.received_bytes);

                match download.state {
                    DownloadState::Complete => {
                        pb.finish_with_message(format!("{} {}", style("✓").green().bold(), display_name(download)));
                    }
                    DownloadState::Interrupted => {
                        let reason = download.interrupt_reason.map(|r| r.as_str()).unwrap_or("unknown");
                        pb.abandon_with_message(format!("{} Interrupted: {}", style("✗").red().bold(), reason));
                    }
                    DownloadState::Cancelled => {
                        pb.abandon_with_message(format!("{} Cancelled", style("○").dim()));
                    }
                    DownloadState::InProgress if download.paused => {
                        pb.set_message(format!("{} Paused", style("⏸").yellow()));
                    }
                    _ => {}
                }
            }

            _ => {}
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, pb) in self.bars.drain() {
            if !pb.is_finished() {
                pb.finish_and_clear();
            }
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}
