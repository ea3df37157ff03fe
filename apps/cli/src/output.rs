//! Output formatting utilities

use console::{style, StyledObject};
use resumedl_types::{DownloadSnapshot, DownloadState};
use serde::Serialize;

/// Print a value as pretty JSON
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format speed as human-readable
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec as f64))
}

/// Format duration as human-readable
pub fn format_eta(seconds: u64) -> String {
    if seconds == 0 {
        return "-".to_string();
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Name shown for a download: the target file name, else the last URL segment.
pub fn display_name(download: &DownloadSnapshot) -> String {
    download
        .target_path
        .as_ref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .or_else(|| {
            download
                .url()
                .and_then(|u| u.path_segments())
                .and_then(|mut segments| segments.next_back())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "download".to_string())
}

pub fn state_label(download: &DownloadSnapshot) -> String {
    match (download.state, download.interrupt_reason) {
        (DownloadState::InProgress, _) if download.paused => "paused".to_string(),
        (DownloadState::Interrupted, Some(reason)) => format!("interrupted ({})", reason.as_str()),
        (DownloadState::InProgress, _) => "in progress".to_string(),
        (DownloadState::Complete, _) => "complete".to_string(),
        (DownloadState::Cancelled, _) => "cancelled".to_string(),
        (DownloadState::Interrupted, None) => "interrupted".to_string(),
        (DownloadState::Detached, _) => "detached".to_string(),
    }
}

pub fn status_icon(state: DownloadState) -> StyledObject<&'static str> {
    match state {
        DownloadState::Complete => style("✓").green(),
        DownloadState::InProgress => style("↓").cyan(),
        DownloadState::Interrupted => style("✗").red(),
        DownloadState::Cancelled => style("○").dim(),
        DownloadState::Detached => style("·").dim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(0), "-");
        assert_eq!(format_eta(42), "42s");
        assert_eq!(format_eta(125), "2m 5s");
        assert_eq!(format_eta(3725), "1h 2m 5s");
    }

    #[test]
    fn test_format_speed() {
        assert!(format_speed(2048).ends_with("/s"));
    }
}
