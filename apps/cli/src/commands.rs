//! CLI command implementations

use crate::output::{display_name, format_bytes, print_json, state_label, status_icon};
use crate::progress::DownloadProgress;
use crate::OutputFormat;
use anyhow::{bail, Context, Result};
use console::style;
use resumedl_core::{HistoryDatabase, ResumeDl, HISTORY_FILE};
use resumedl_types::{CoreEvent, DownloadSnapshot, DownloadState, EngineSettings};
use std::path::PathBuf;
use tokio::sync::broadcast;

/// How following a download ended
enum Followed {
    Settled(DownloadSnapshot),
    Detached,
}

// ============================================================================
// Download Commands
// ============================================================================

pub async fn get(settings: EngineSettings, data_dir: PathBuf, url: &str, format: OutputFormat) -> Result<()> {
    let core = ResumeDl::new(settings, Some(data_dir))
        .await
        .context("failed to start the download engine")?;

    let events = core.subscribe();
    let id = core
        .add_download(url, None)
        .await
        .with_context(|| format!("failed to start downloading {}", url))?;
    let snapshot = core.manager().snapshot(id).await?;

    finish(core, events, snapshot, format).await
}

pub async fn resume_download(settings: EngineSettings, data_dir: PathBuf, id: u32, format: OutputFormat) -> Result<()> {
    let core = ResumeDl::new(settings, Some(data_dir))
        .await
        .context("failed to start the download engine")?;

    let events = core.subscribe();
    let before = core
        .manager()
        .snapshot(id)
        .await
        .with_context(|| format!("no download with ID {}", id))?;
    if before.state != DownloadState::Interrupted {
        core.shutdown().await?;
        bail!("download {} is {}, nothing to resume", id, state_label(&before));
    }

    core.manager().resume(id).await?;
    let snapshot = core.manager().snapshot(id).await?;
    if snapshot.state == DownloadState::Interrupted {
        core.shutdown().await?;
        bail!("download {} cannot be resumed ({})", id, state_label(&snapshot));
    }

    finish(core, events, snapshot, format).await
}

/// Follow a started download to its end and report it.
async fn finish(
    core: ResumeDl,
    events: broadcast::Receiver<CoreEvent>,
    snapshot: DownloadSnapshot,
    format: OutputFormat,
) -> Result<()> {
    let id = snapshot.id;
    let mut progress = DownloadProgress::new();
    if matches!(format, OutputFormat::Human) {
        progress.add_download(&snapshot);
    }

    let settled = match follow(&core, events, snapshot, &progress).await? {
        Followed::Settled(download) => download,
        Followed::Detached => {
            progress.clear();
            // History keeps the download running; the next run restores it
            // as interrupted with its partial file.
            core.shutdown().await?;
            eprintln!(
                "{} Stopped. Run `resumedl resume {}` to continue.",
                style("⏸").yellow(),
                id
            );
            return Ok(());
        }
    };
    core.shutdown().await?;

    match format {
        OutputFormat::Json => print_json(&settled)?,
        OutputFormat::Human | OutputFormat::Table => print_download_summary(&settled, true),
    }

    match settled.state {
        DownloadState::Complete => Ok(()),
        _ => bail!("download {} did not complete: {}", id, state_label(&settled)),
    }
}

/// Wait until download `id` settles, or the user presses Ctrl-C.
async fn follow(
    core: &ResumeDl,
    mut events: broadcast::Receiver<CoreEvent>,
    current: DownloadSnapshot,
    progress: &DownloadProgress,
) -> Result<Followed> {
    let id = current.id;
    if is_settled(&current) {
        return Ok(Followed::Settled(current));
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    progress.handle_event(&event);
                    match event {
                        CoreEvent::DownloadUpdated { download } if download.id == id && is_settled(&download) => {
                            return Ok(Followed::Settled(download));
                        }
                        CoreEvent::DownloadRemoved { id: removed, .. } if removed == id => {
                            bail!("download {} was removed", id);
                        }
                        _ => {}
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => bail!("download engine stopped"),
            },
            _ = &mut ctrl_c => {
                core.manager().pause(id).await?;
                return Ok(Followed::Detached);
            }
        }
    }
}

fn is_settled(download: &DownloadSnapshot) -> bool {
    matches!(
        download.state,
        DownloadState::Complete | DownloadState::Cancelled | DownloadState::Interrupted
    )
}

pub async fn list_downloads(data_dir: PathBuf, show_all: bool, format: OutputFormat) -> Result<()> {
    let db = HistoryDatabase::new(data_dir.join(HISTORY_FILE))
        .await
        .context("failed to open the download history")?;
    let downloads = db.load_all().await?;

    match format {
        OutputFormat::Json => {
            print_json(&downloads)?;
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct DownloadRow {
                id: u32,
                name: String,
                state: String,
                progress: String,
                size: String,
            }

            let rows: Vec<DownloadRow> = downloads
                .iter()
                .map(|d| DownloadRow {
                    id: d.id,
                    name: truncate(&display_name(d), 40),
                    state: state_label(d),
                    progress: format!("{:.1}%", d.progress()),
                    size: d.total_bytes.map(format_bytes).unwrap_or_else(|| "?".to_string()),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if downloads.is_empty() {
                println!("{}", style("No downloads found").dim());
                return Ok(());
            }

            for download in &downloads {
                print_download_summary(download, show_all);
            }
            println!();
            println!("{} download(s) total", style(downloads.len()).bold());
        }
    }

    Ok(())
}

fn print_download_summary(download: &DownloadSnapshot, detailed: bool) {
    let progress = format!("{:.1}%", download.progress());

    println!(
        "{} {} {} {} [{}]",
        status_icon(download.state),
        style(download.id).dim(),
        style(display_name(download)).bold(),
        style(&progress).dim(),
        style(state_label(download)).dim()
    );

    if detailed {
        if let Some(url) = download.url() {
            println!("    URL: {}", url);
        }
        if let Some(path) = download.target_path.as_ref() {
            println!("    Path: {}", path.display());
        }
        match download.total_bytes {
            Some(size) => println!(
                "    Size: {} / {}",
                format_bytes(download.received_bytes),
                format_bytes(size)
            ),
            None => println!("    Received: {}", format_bytes(download.received_bytes)),
        }
        if !download.hash.is_empty() {
            println!("    SHA-256: {}", download.hash);
        }
        println!();
    }
}

fn truncate(name: &str, max: usize) -> String {
    if name.chars().count() > max {
        let head: String = name.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        name.to_string()
    }
}

pub async fn remove_download(settings: EngineSettings, data_dir: PathBuf, id: u32, _format: OutputFormat) -> Result<()> {
    let core = ResumeDl::new(settings, Some(data_dir))
        .await
        .context("failed to start the download engine")?;
    let result = core.manager().remove(id).await;
    core.shutdown().await?;
    result.with_context(|| format!("failed to remove download {}", id))?;

    println!("{} Download removed", style("✓").green().bold());
    Ok(())
}

// ============================================================================
// Probe Commands
// ============================================================================

pub async fn probe_urls(settings: EngineSettings, urls: Vec<String>, format: OutputFormat) -> Result<()> {
    let core = ResumeDl::new(settings, None)
        .await
        .context("failed to start the download engine")?;

    let mut results = Vec::with_capacity(urls.len());
    for url in &urls {
        results.push((url.clone(), core.probe(url).await));
    }
    core.shutdown().await?;

    match format {
        OutputFormat::Json => {
            let infos: Vec<_> = results.iter().filter_map(|(_, r)| r.as_ref().ok()).collect();
            print_json(&infos)?;
        }
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct LinkRow {
                filename: String,
                size: String,
                resumable: String,
            }

            let rows: Vec<LinkRow> = results
                .iter()
                .map(|(url, result)| match result {
                    Ok(info) => LinkRow {
                        filename: truncate(&info.filename, 40),
                        size: info.size.map(format_bytes).unwrap_or_else(|| "?".to_string()),
                        resumable: if info.resumable { "Yes" } else { "No" }.to_string(),
                    },
                    Err(e) => LinkRow {
                        filename: truncate(url, 40),
                        size: format!("error: {}", e),
                        resumable: "-".to_string(),
                    },
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            for (url, result) in &results {
                match result {
                    Ok(info) => {
                        println!("{} {}", style("✓").green(), style(&info.filename).bold());
                        println!("    URL: {}", info.final_url.as_deref().unwrap_or(url));
                        if let Some(size) = info.size {
                            println!("    Size: {}", format_bytes(size));
                        }
                        if let Some(content_type) = &info.content_type {
                            println!("    Type: {}", content_type);
                        }
                        println!(
                            "    Resumable: {}",
                            if info.resumable { style("yes").green() } else { style("no").yellow() }
                        );
                    }
                    Err(e) => println!("{} {}: {}", style("✗").red(), url, style(e).red()),
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short.iso", 40), "short.iso");
        let long = "a".repeat(50);
        let cut = truncate(&long, 40);
        assert_eq!(cut.chars().count(), 40);
        assert!(cut.ends_with("..."));
    }
}
