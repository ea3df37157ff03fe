//! resumedl core - resumable, multi-stream download engine
//!
//! This crate moves bytes from one or more network feeds into a single
//! destination file, tracks which ranges are saved, survives interruption
//! and decides how and whether to resume.
//!
//! `ResumeDl` wires the engine to HTTP and to a SQLite history; the
//! `engine` module exposes the parts for custom delegates and feeds.

pub mod engine;
mod error;
pub mod slices;

pub use engine::*;
pub use error::*;

use resumedl_types::{CoreEvent, DownloadSnapshot, EngineSettings, LinkInfo, RequestInfo};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

/// File name of the history database inside the data directory
pub const HISTORY_FILE: &str = "history.db";

/// The main resumedl instance
pub struct ResumeDl {
    manager: DownloadManagerHandle,
    fetcher: HttpFetcher,
    settings: EngineSettings,
    manager_task: JoinHandle<()>,
    history_task: Option<JoinHandle<()>>,
}

impl ResumeDl {
    /// Start the engine. With a `data_dir`, downloads are restored from and
    /// recorded to `<data_dir>/history.db`.
    pub async fn new(settings: EngineSettings, data_dir: Option<PathBuf>) -> Result<Self, EngineError> {
        let history = match data_dir {
            Some(dir) => Some(HistoryDatabase::new(dir.join(HISTORY_FILE)).await?),
            None => None,
        };
        let stored = match &history {
            Some(db) => db.load_all().await?,
            None => Vec::new(),
        };

        let fetcher = HttpFetcher::new(&settings)?;
        let delegate_fetcher = fetcher.clone();
        let download_dir = settings.default_download_path.clone();
        let (manager, manager_task) = DownloadManager::spawn(settings.clone(), stored, move |handle| {
            Arc::new(HttpDelegate::new(delegate_fetcher, handle, download_dir)) as Arc<dyn DownloadDelegate>
        });
        let history_task = history.map(|db| HistoryWriter::spawn(db, manager.subscribe()));

        info!("resumedl started, saving to {:?}", settings.default_download_path);
        Ok(Self {
            manager,
            fetcher,
            settings,
            manager_task,
            history_task,
        })
    }

    /// Handle for per-download operations
    pub fn manager(&self) -> &DownloadManagerHandle {
        &self.manager
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.manager.subscribe()
    }

    pub async fn probe(&self, url: &str) -> Result<LinkInfo, EngineError> {
        let url = parse_url(url)?;
        self.fetcher.probe(&url).await
    }

    /// Add a new download. `streams` overrides the configured parallel
    /// stream count.
    pub async fn add_download(&self, url: &str, streams: Option<u32>) -> Result<u32, EngineError> {
        let url = parse_url(url)?;
        let link = match self.fetcher.probe(&url).await {
            Ok(link) => link,
            Err(e) => {
                warn!("Probe of {} failed ({}), downloading without metadata", url, e);
                LinkInfo {
                    url: url.to_string(),
                    final_url: None,
                    filename: suggested_filename(None, Some(&url)),
                    size: None,
                    content_type: None,
                    etag: None,
                    last_modified: None,
                    resumable: false,
                }
            }
        };

        let streams = streams.unwrap_or(self.settings.parallel_streams);
        let attempt = self.fetcher.first_attempt(&url, &link, streams).await;
        self.manager.create(RequestInfo::new(url), attempt).await
    }

    pub async fn downloads(&self) -> Result<Vec<DownloadSnapshot>, EngineError> {
        self.manager.list().await
    }

    /// Cancel running downloads, stop the engine and flush the history.
    pub async fn shutdown(self) -> Result<(), EngineError> {
        self.manager.shutdown().await?;
        drop(self.manager);
        if let Err(e) = self.manager_task.await {
            warn!("Download manager task failed: {}", e);
        }
        if let Some(task) = self.history_task {
            // Stops at the going-down event the manager sent above.
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("History writer did not stop in time");
            }
        }
        Ok(())
    }
}

fn parse_url(url: &str) -> Result<Url, EngineError> {
    Url::parse(url).map_err(|_| EngineError::InvalidUrl(url.to_string()))
}
