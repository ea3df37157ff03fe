//! Collaborator interfaces of a download job
//!
//! The job never decides file names, never issues network requests and never
//! opens files itself. Those decisions belong to a `DownloadDelegate`, which
//! answers either synchronously or later through one of the callback types
//! below. Every callback posts back into the control context.

use crate::engine::feed::ByteFeed;
use crate::engine::observer::{ControlPoster, JobEvent};
use resumedl_types::{DangerType, DownloadSnapshot, InterruptReason, ReceivedSlice, ResponseInfo, TargetDisposition};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use url::Url;
use uuid::Uuid;

/// Where and how the bytes of an attempt should be saved
#[derive(Clone, Default)]
pub struct SaveInfo {
    /// Existing partial file to continue; `None` for a fresh temporary file
    pub file_path: Option<PathBuf>,
    pub suggested_name: Option<String>,
    /// First byte the main feed delivers
    pub offset: u64,
    /// Bytes the main feed may write; `None` for the rest of the file
    pub length: Option<u64>,
    /// Size of the whole resource, if the server announced it
    pub total_bytes: Option<u64>,
    /// Digest of the bytes before `offset`, used to verify the partial file
    pub hash_of_partial_file: Vec<u8>,
    /// Digest state of the bytes before `offset`; skips re-hashing when set
    pub hash_state: Option<Sha256>,
    pub prompt_for_save_location: bool,
}

impl std::fmt::Debug for SaveInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveInfo")
            .field("file_path", &self.file_path)
            .field("suggested_name", &self.suggested_name)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("total_bytes", &self.total_bytes)
            .field("hash_of_partial_file", &hex::encode(&self.hash_of_partial_file))
            .field("has_hash_state", &self.hash_state.is_some())
            .field("prompt_for_save_location", &self.prompt_for_save_location)
            .finish()
    }
}

/// An extra feed covering part of the file, used for parallel downloads.
pub struct InputStream {
    pub offset: u64,
    pub length: Option<u64>,
    /// `None` when the request for this range could not be made
    pub feed: Option<Box<dyn ByteFeed>>,
}

/// Flow control over the network request behind an attempt.
pub trait RequestHandle: Send {
    fn pause_request(&self);
    fn resume_request(&self);
    fn cancel_request(&self);
}

/// The outcome of asking the network for the bytes of a download
pub enum DownloadAttempt {
    Started {
        save_info: SaveInfo,
        response: ResponseInfo,
        feed: Box<dyn ByteFeed>,
        request_handle: Box<dyn RequestHandle>,
        parallel_streams: Vec<InputStream>,
    },
    FailedToStart {
        reason: InterruptReason,
        save_info: SaveInfo,
    },
}

impl DownloadAttempt {
    pub fn save_info(&self) -> &SaveInfo {
        match self {
            DownloadAttempt::Started { save_info, .. } => save_info,
            DownloadAttempt::FailedToStart { save_info, .. } => save_info,
        }
    }
}

impl std::fmt::Debug for DownloadAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadAttempt::Started {
                save_info,
                response,
                parallel_streams,
                ..
            } => f
                .debug_struct("Started")
                .field("save_info", save_info)
                .field("response", response)
                .field("parallel_streams", &parallel_streams.len())
                .finish_non_exhaustive(),
            DownloadAttempt::FailedToStart { reason, save_info } => f
                .debug_struct("FailedToStart")
                .field("reason", reason)
                .field("save_info", save_info)
                .finish(),
        }
    }
}

/// Everything needed to issue the request that continues a download.
#[derive(Clone)]
pub struct ResumeParameters {
    pub guid: Uuid,
    pub url: Url,
    pub referrer_url: Option<Url>,
    pub file_path: Option<PathBuf>,
    pub offset: u64,
    pub total_bytes: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub hash_of_partial_file: Vec<u8>,
    pub hash_state: Option<Sha256>,
    pub received_slices: Vec<ReceivedSlice>,
}

impl ResumeParameters {
    /// Save info for the main feed of the resumed request.
    pub fn save_info(&self) -> SaveInfo {
        SaveInfo {
            file_path: self.file_path.clone(),
            suggested_name: None,
            offset: self.offset,
            length: None,
            total_bytes: self.total_bytes,
            hash_of_partial_file: self.hash_of_partial_file.clone(),
            hash_state: self.hash_state.clone(),
            prompt_for_save_location: false,
        }
    }
}

impl std::fmt::Debug for ResumeParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeParameters")
            .field("guid", &self.guid)
            .field("url", &self.url.as_str())
            .field("file_path", &self.file_path)
            .field("offset", &self.offset)
            .field("total_bytes", &self.total_bytes)
            .field("etag", &self.etag)
            .field("last_modified", &self.last_modified)
            .field("received_slices", &self.received_slices)
            .finish_non_exhaustive()
    }
}

/// The delegate's answer to "where should this download go?"
///
/// An empty `target_path` cancels the download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDecision {
    pub target_path: PathBuf,
    pub disposition: TargetDisposition,
    pub danger_type: DangerType,
    /// Where the bytes live until completion; same directory as the target
    pub intermediate_path: PathBuf,
}

impl TargetDecision {
    pub fn cancel() -> Self {
        Self {
            target_path: PathBuf::new(),
            disposition: TargetDisposition::Overwrite,
            danger_type: DangerType::NotDangerous,
            intermediate_path: PathBuf::new(),
        }
    }

    /// Target `target_path`, downloading into `<target_path>.crdownload`.
    pub fn with_default_intermediate(target_path: PathBuf) -> Self {
        let mut intermediate = target_path.clone().into_os_string();
        intermediate.push(".crdownload");
        Self {
            target_path,
            disposition: TargetDisposition::Overwrite,
            danger_type: DangerType::NotDangerous,
            intermediate_path: PathBuf::from(intermediate),
        }
    }
}

/// Delivers a `TargetDecision` to the job.
pub struct TargetCallback(pub(crate) ControlPoster);

impl TargetCallback {
    pub fn run(self, decision: TargetDecision) {
        self.0.post(JobEvent::TargetDetermined(decision));
    }
}

/// Asks the job to re-check completion after the delegate deferred it.
pub struct CompletionRetry(pub(crate) ControlPoster);

impl CompletionRetry {
    pub fn run(self) {
        self.0.post(JobEvent::CompletionReady);
    }
}

/// Tells the job that the delegate's deferred open step has finished.
pub struct OpenCallback(pub(crate) ControlPoster);

impl OpenCallback {
    pub fn run(self, auto_opened: bool) {
        self.0.post(JobEvent::DelayedOpened { auto_opened });
    }
}

/// Policy and side effects a download job defers to.
///
/// All methods are called on the control context and must not block.
pub trait DownloadDelegate: Send + Sync {
    /// Decide the target and intermediate paths, now or later.
    fn determine_download_target(&self, download: &DownloadSnapshot, callback: TargetCallback);

    /// Return false to hold completion; call `retry` once it may proceed.
    fn should_complete_download(&self, _download: &DownloadSnapshot, _retry: CompletionRetry) -> bool {
        true
    }

    /// Return false to finish the open step later through `callback`.
    fn should_open_download(&self, _download: &DownloadSnapshot, _callback: OpenCallback) -> bool {
        true
    }

    /// Issue the request continuing an interrupted download. The resulting
    /// attempt is attached back to `download_id`.
    fn resume_interrupted_download(&self, parameters: ResumeParameters, download_id: u32);

    fn should_open_file_based_on_extension(&self, _path: &Path) -> bool {
        false
    }

    fn open_download(&self, _download: &DownloadSnapshot) {}

    /// Identifier passed along when annotating finished files.
    fn application_client_id(&self) -> String {
        String::new()
    }
}
