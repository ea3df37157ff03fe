//! HTTP feeds - reqwest requests turned into download attempts
//!
//! `HttpFetcher` probes URLs and issues ranged GET requests. Each response
//! body is pumped into a data pipe on its own task. All requests of one
//! attempt share an `HttpRequestHandle`, so pausing or cancelling the
//! attempt reaches every stream.
//!
//! `HttpDelegate` is a `DownloadDelegate` for unattended use: it saves into
//! the default download directory and resumes by issuing new requests.

use crate::engine::delegate::{
    DownloadAttempt, DownloadDelegate, InputStream, RequestHandle, ResumeParameters, SaveInfo, TargetCallback,
    TargetDecision,
};
use crate::engine::feed::{data_pipe, ByteFeed, DataPipeConsumer};
use crate::engine::manager::DownloadManagerHandle;
use crate::engine::rename::uniquify_path;
use crate::error::{interrupt_reason_from_reqwest, EngineError};
use crate::slices::find_slices_to_download;
use futures::StreamExt;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode};
use resumedl_types::{DownloadSnapshot, EngineSettings, InterruptReason, LinkInfo, ResponseInfo, SliceToDownload};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Files smaller than this are never split into parallel streams
const MIN_PARALLEL_SIZE: u64 = 1024 * 1024;

/// Validators sent with ranged requests so a changed resource is detected
#[derive(Debug, Clone, Default)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    fn if_range(&self) -> Option<&str> {
        self.etag.as_deref().or(self.last_modified.as_deref())
    }
}

/// Flow control shared by every request of one attempt
#[derive(Clone)]
pub struct HttpRequestHandle {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl HttpRequestHandle {
    fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(paused),
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Pump `response` into a data pipe until it ends or is cancelled.
    fn pump(&self, response: reqwest::Response) -> DataPipeConsumer {
        let (mut producer, consumer) = data_pipe();
        let cancel = self.cancel.clone();
        let mut paused = self.paused.subscribe();
        let url = response.url().clone();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            loop {
                if !wait_while_paused(&mut paused, &cancel).await {
                    debug!("Request for {} cancelled while paused", url);
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Request for {} cancelled", url);
                        producer.complete(Err(InterruptReason::UserCanceled));
                        return;
                    }
                    chunk = body.next() => match chunk {
                        Some(Ok(bytes)) => {
                            if !producer.send(bytes) {
                                debug!("Consumer of {} is gone", url);
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            warn!("Body of {} failed: {}", url, e);
                            producer.complete(Err(interrupt_reason_from_reqwest(&e)));
                            return;
                        }
                        None => {
                            producer.complete(Ok(()));
                            return;
                        }
                    },
                }
            }
        });

        consumer
    }
}

/// Returns false if cancelled before being unpaused.
async fn wait_while_paused(paused: &mut watch::Receiver<bool>, cancel: &CancellationToken) -> bool {
    loop {
        if !*paused.borrow_and_update() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            changed = paused.changed() => {
                // Nobody can unpause anymore.
                if changed.is_err() {
                    return true;
                }
            }
        }
    }
}

impl RequestHandle for HttpRequestHandle {
    fn pause_request(&self) {
        self.paused.send_replace(true);
    }

    fn resume_request(&self) {
        self.paused.send_replace(false);
    }

    fn cancel_request(&self) {
        self.cancel.cancel();
    }
}

/// Issues the network requests behind download attempts
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(settings: &EngineSettings) -> Result<Self, EngineError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { client })
    }

    /// Probe a URL for metadata
    pub async fn probe(&self, url: &Url) -> Result<LinkInfo, EngineError> {
        info!("Probing URL: {}", url);

        let response = self.client.head(url.as_str()).send().await?;
        if !response.status().is_success() {
            return Err(EngineError::ServerError {
                status: response.status().as_u16(),
                message: format!("HEAD {}", url),
            });
        }

        let headers = response.headers();
        let mut size = header_u64(headers, header::CONTENT_LENGTH);
        let mut resumable = header_str(headers, header::ACCEPT_RANGES).is_some_and(|v| v == "bytes");
        let final_url = response.url().clone();
        let content_disposition = header_str(headers, header::CONTENT_DISPOSITION);
        let content_type = header_str(headers, header::CONTENT_TYPE);
        let etag = header_str(headers, header::ETAG);
        let last_modified = header_str(headers, header::LAST_MODIFIED);

        // Some CDNs only reveal the size through a ranged GET.
        if size.is_none() || !resumable {
            debug!("HEAD was inconclusive, trying partial GET on {}", final_url);
            match self
                .client
                .get(final_url.as_str())
                .header(header::RANGE, "bytes=0-0")
                .send()
                .await
            {
                Ok(partial) if partial.status() == StatusCode::PARTIAL_CONTENT => {
                    resumable = true;
                    if let Some(total) = content_range_total(partial.headers()) {
                        size = Some(total);
                    }
                }
                Ok(partial) if partial.status() == StatusCode::OK => {
                    resumable = false;
                    size = size.or_else(|| header_u64(partial.headers(), header::CONTENT_LENGTH));
                }
                Ok(partial) => debug!("Partial GET returned {}", partial.status()),
                Err(e) => warn!("Partial GET probe failed: {} - continuing without size info", e),
            }
        }

        Ok(LinkInfo {
            url: url.to_string(),
            final_url: (final_url != *url).then(|| final_url.to_string()),
            filename: suggested_filename(content_disposition.as_deref(), Some(&final_url)),
            size,
            content_type,
            etag,
            last_modified,
            resumable,
        })
    }

    /// Start a new download of `url`, split into up to `streams` parallel
    /// streams when the server allows it.
    pub async fn first_attempt(&self, url: &Url, link: &LinkInfo, streams: u32) -> DownloadAttempt {
        let slices = match link.size {
            Some(size) if link.resumable && streams > 1 && size >= MIN_PARALLEL_SIZE => split_evenly(size, streams),
            _ => Vec::new(),
        };
        // The main stream runs to EOF; the first sibling write caps it.
        let rest = slices.into_iter().skip(1).collect();
        let save_info = SaveInfo {
            suggested_name: Some(link.filename.clone()),
            total_bytes: link.size,
            ..Default::default()
        };
        let validators = Validators {
            etag: link.etag.clone(),
            last_modified: link.last_modified.clone(),
        };
        self.attempt(url, save_info, &validators, rest).await
    }

    /// Continue an interrupted download. A sparse download fetches every
    /// gap of its ledger; the first gap becomes the main stream.
    pub async fn resume_attempt(&self, parameters: &ResumeParameters) -> DownloadAttempt {
        let validators = Validators {
            etag: parameters.etag.clone(),
            last_modified: parameters.last_modified.clone(),
        };
        let mut save_info = parameters.save_info();
        let mut rest = Vec::new();
        if !parameters.received_slices.is_empty() {
            let mut gaps = find_slices_to_download(&parameters.received_slices);
            // Nothing lies past the end of a resource of known size.
            if let Some(total) = parameters.total_bytes {
                gaps.retain(|gap| gap.offset < total);
            }
            let mut gaps = gaps.into_iter();
            if let Some(first) = gaps.next() {
                save_info.offset = first.offset;
                save_info.length = first.length;
            }
            rest = gaps.collect();
        }
        self.attempt(&parameters.url, save_info, &validators, rest).await
    }

    async fn attempt(
        &self,
        url: &Url,
        save_info: SaveInfo,
        validators: &Validators,
        parallel: Vec<SliceToDownload>,
    ) -> DownloadAttempt {
        let response = match self.open_range(url, save_info.offset, save_info.length, validators).await {
            Ok(response) => response,
            Err(reason) => {
                warn!("Request for {} failed to start: {}", url, reason.as_str());
                return DownloadAttempt::FailedToStart { reason, save_info };
            }
        };

        let response_info = response_info(url, &response, save_info.offset);
        // Validators of this response guard the sibling requests.
        let sibling_validators = Validators {
            etag: response_info.etag.clone().or_else(|| validators.etag.clone()),
            last_modified: response_info
                .last_modified
                .clone()
                .or_else(|| validators.last_modified.clone()),
        };
        let final_url = response.url().clone();
        let handle = HttpRequestHandle::new();
        let feed = handle.pump(response);

        let mut parallel_streams = Vec::with_capacity(parallel.len());
        for slice in parallel {
            let feed = match self
                .open_range(&final_url, slice.offset, slice.length, &sibling_validators)
                .await
            {
                Ok(response) => Some(Box::new(handle.pump(response)) as Box<dyn ByteFeed>),
                Err(reason) => {
                    warn!("Parallel request at {} failed: {}", slice.offset, reason.as_str());
                    None
                }
            };
            parallel_streams.push(InputStream {
                offset: slice.offset,
                length: slice.length,
                feed,
            });
        }

        debug!(
            "Started {} from byte {} with {} parallel streams",
            url,
            save_info.offset,
            parallel_streams.len()
        );
        DownloadAttempt::Started {
            save_info,
            response: response_info,
            feed: Box::new(feed),
            request_handle: Box::new(handle),
            parallel_streams,
        }
    }

    /// GET `[offset, offset + length)` of `url`, checking that the server
    /// honored the range.
    async fn open_range(
        &self,
        url: &Url,
        offset: u64,
        length: Option<u64>,
        validators: &Validators,
    ) -> Result<reqwest::Response, InterruptReason> {
        let mut request = self.client.get(url.as_str());
        let ranged = offset > 0 || length.is_some();
        if ranged {
            request = request.header(header::RANGE, range_header(offset, length));
            if offset > 0 {
                if let Some(validator) = validators.if_range() {
                    request = request.header(header::IF_RANGE, validator);
                }
            }
        }

        let response = request.send().await.map_err(|e| interrupt_reason_from_reqwest(&e))?;
        let status = response.status();
        if let Some(reason) = InterruptReason::from_http_status(status.as_u16()) {
            return Err(reason);
        }

        if ranged && status == StatusCode::PARTIAL_CONTENT {
            if content_range_start(response.headers()) != Some(offset) {
                warn!("Server answered a range other than the one requested from {}", offset);
                return Err(InterruptReason::ServerBadContent);
            }
        } else if offset > 0 {
            // A full body where a range was asked for: the resource changed
            // or ranges are unsupported.
            return Err(InterruptReason::ServerNoRange);
        }

        Ok(response)
    }
}

fn range_header(offset: u64, length: Option<u64>) -> String {
    match length {
        Some(length) => format!("bytes={}-{}", offset, offset + length.max(1) - 1),
        None => format!("bytes={}-", offset),
    }
}

/// Split `[0, size)` into `streams` slices; the last one is open-ended.
fn split_evenly(size: u64, streams: u32) -> Vec<SliceToDownload> {
    let count = u64::from(streams.max(1));
    let chunk = size / count;
    (0..count)
        .map(|i| {
            if i + 1 == count {
                SliceToDownload::open(i * chunk)
            } else {
                SliceToDownload::new(i * chunk, Some(chunk))
            }
        })
        .collect()
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|s| s.to_string())
}

fn header_u64(headers: &HeaderMap, name: header::HeaderName) -> Option<u64> {
    headers.get(name).and_then(|v| v.to_str().ok()).and_then(|s| s.trim().parse().ok())
}

/// First byte of a `Content-Range: bytes a-b/total` header
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = header_str(headers, header::CONTENT_RANGE)?;
    let range = value.strip_prefix("bytes ")?;
    range.split('-').next()?.trim().parse().ok()
}

/// Total size of a `Content-Range: bytes a-b/total` header, if known
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = header_str(headers, header::CONTENT_RANGE)?;
    let total = value.rsplit('/').next()?;
    if total == "*" {
        return None;
    }
    total.trim().parse().ok()
}

fn response_info(requested: &Url, response: &reqwest::Response, offset: u64) -> ResponseInfo {
    let headers = response.headers();
    let mut url_chain = vec![requested.clone()];
    if response.url() != requested {
        url_chain.push(response.url().clone());
    }

    let total_bytes = if response.status() == StatusCode::PARTIAL_CONTENT {
        content_range_total(headers)
    } else {
        header_u64(headers, header::CONTENT_LENGTH).map(|length| length + offset)
    };
    let mime_type = header_str(headers, header::CONTENT_TYPE);

    ResponseInfo {
        url_chain,
        content_disposition: header_str(headers, header::CONTENT_DISPOSITION),
        original_mime_type: mime_type.clone(),
        mime_type,
        total_bytes,
        etag: header_str(headers, header::ETAG),
        last_modified: header_str(headers, header::LAST_MODIFIED),
    }
}

/// File name from a `Content-Disposition` header, else the last URL path
/// segment, else "download".
pub fn suggested_filename(content_disposition: Option<&str>, url: Option<&Url>) -> String {
    let from_header = content_disposition.and_then(|v| {
        v.split("filename=")
            .nth(1)
            .map(|s| s.split(';').next().unwrap_or(s).trim().trim_matches('"').to_string())
    });
    let from_url = || {
        url.and_then(|u| u.path_segments())
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::decode(s).map(|d| d.into_owned()).unwrap_or_else(|_| s.to_string()))
    };

    let name = from_header.filter(|s| !s.is_empty()).or_else(from_url).unwrap_or_default();
    // Never let a server pick a directory.
    let name = name.rsplit(['/', '\\']).next().unwrap_or_default().to_string();
    if name.is_empty() || name == "." || name == ".." {
        "download".to_string()
    } else {
        name
    }
}

/// Delegate that saves into the default download directory and resumes by
/// re-requesting the missing ranges.
pub struct HttpDelegate {
    fetcher: HttpFetcher,
    manager: DownloadManagerHandle,
    download_dir: PathBuf,
}

impl HttpDelegate {
    pub fn new(fetcher: HttpFetcher, manager: DownloadManagerHandle, download_dir: PathBuf) -> Self {
        Self {
            fetcher,
            manager,
            download_dir,
        }
    }
}

impl DownloadDelegate for HttpDelegate {
    fn determine_download_target(&self, download: &DownloadSnapshot, callback: TargetCallback) {
        let name = suggested_filename(download.content_disposition.as_deref(), download.url());
        let mut target = self.download_dir.join(name);
        if target.exists() {
            target = uniquify_path(&target);
        }
        debug!("Download {} targets {:?}", download.id, target);
        callback.run(TargetDecision::with_default_intermediate(target));
    }

    fn resume_interrupted_download(&self, parameters: ResumeParameters, download_id: u32) {
        info!("Resuming download {} from byte {}", download_id, parameters.offset);
        let fetcher = self.fetcher.clone();
        let manager = self.manager.clone();
        tokio::spawn(async move {
            let attempt = fetcher.resume_attempt(&parameters).await;
            manager.attach(download_id, attempt);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_suggested_filename() {
        let url = Url::parse("https://example.com/files/My%20File.zip?x=1").unwrap();
        assert_eq!(suggested_filename(None, Some(&url)), "My File.zip");
        assert_eq!(
            suggested_filename(Some("attachment; filename=\"report.pdf\""), Some(&url)),
            "report.pdf"
        );
        assert_eq!(
            suggested_filename(Some("attachment; filename=../../etc/passwd"), None),
            "passwd"
        );
        let root = Url::parse("https://example.com/").unwrap();
        assert_eq!(suggested_filename(None, Some(&root)), "download");
    }

    #[test]
    fn test_content_range_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("bytes 100-199/1000"));
        assert_eq!(content_range_start(&headers), Some(100));
        assert_eq!(content_range_total(&headers), Some(1000));

        headers.insert(header::CONTENT_RANGE, HeaderValue::from_static("bytes 0-0/*"));
        assert_eq!(content_range_start(&headers), Some(0));
        assert_eq!(content_range_total(&headers), None);
    }

    #[test]
    fn test_split_evenly_ends_open() {
        let slices = split_evenly(1000, 4);
        assert_eq!(
            slices,
            vec![
                SliceToDownload::new(0, Some(250)),
                SliceToDownload::new(250, Some(250)),
                SliceToDownload::new(500, Some(250)),
                SliceToDownload::open(750),
            ]
        );
        assert_eq!(split_evenly(10, 0), vec![SliceToDownload::open(0)]);
    }

    #[test]
    fn test_range_header() {
        assert_eq!(range_header(0, Some(250)), "bytes=0-249");
        assert_eq!(range_header(750, None), "bytes=750-");
    }

    #[tokio::test]
    async fn test_request_handle_flow_control() {
        let handle = HttpRequestHandle::new();
        let mut paused = handle.paused.subscribe();

        handle.pause_request();
        assert!(handle.is_paused());
        let waiter = {
            let cancel = handle.cancel.clone();
            tokio::spawn(async move { wait_while_paused(&mut paused, &cancel).await })
        };
        handle.resume_request();
        assert!(waiter.await.unwrap());

        handle.cancel_request();
        assert!(handle.is_cancelled());
    }
}
