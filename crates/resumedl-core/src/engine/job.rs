//! Download job - the lifecycle state machine of one download
//!
//! A job moves a download from its first response to a completed file at the
//! target path, or to an interrupted/cancelled end state. It:
//! - Owns the writer context while bytes are flowing
//! - Asks the delegate for the target path and for permission to complete
//! - Decides on interruption whether and how to resume
//! - Drops any message from a writer or delegate issued before the job last
//!   released its writer or started a resumption
//!
//! All methods run on the control context and never block.

use crate::engine::delegate::{
    CompletionRetry, DownloadAttempt, DownloadDelegate, OpenCallback, RequestHandle, ResumeParameters,
    TargetCallback, TargetDecision,
};
use crate::engine::observer::{CallbackToken, ControlMessage, ControlPoster, JobEvent};
use crate::engine::record::RecordInfo;
use crate::engine::resume::{resume_mode, ResumeContext};
use crate::engine::writer::{WriterEngine, WriterHandle, WriterSettings, WriterTask};
use crate::error::EngineError;
use chrono::Utc;
use resumedl_types::{
    CoreEvent, DangerType, DownloadSnapshot, DownloadState, EngineSettings, InterruptReason, ReceivedSlice,
    ResponseInfo, ResumeMode, TargetDisposition,
};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// Internal lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalState {
    Initial,
    TargetPending,
    InterruptedTargetPending,
    TargetResolved,
    InProgress,
    Completing,
    Complete,
    Interrupted,
    Resuming,
    Cancelled,
}

impl InternalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InternalState::Initial => "INITIAL",
            InternalState::TargetPending => "TARGET_PENDING",
            InternalState::InterruptedTargetPending => "INTERRUPTED_TARGET_PENDING",
            InternalState::TargetResolved => "TARGET_RESOLVED",
            InternalState::InProgress => "IN_PROGRESS",
            InternalState::Completing => "COMPLETING",
            InternalState::Complete => "COMPLETE",
            InternalState::Interrupted => "INTERRUPTED",
            InternalState::Resuming => "RESUMING",
            InternalState::Cancelled => "CANCELLED",
        }
    }

    pub fn external(&self) -> DownloadState {
        match self {
            InternalState::Complete => DownloadState::Complete,
            InternalState::Cancelled => DownloadState::Cancelled,
            InternalState::Interrupted => DownloadState::Interrupted,
            _ => DownloadState::InProgress,
        }
    }

    pub fn can_transition_to(&self, to: InternalState) -> bool {
        use InternalState::*;
        match self {
            Initial => matches!(to, TargetPending | InterruptedTargetPending),
            TargetPending => matches!(to, InterruptedTargetPending | TargetResolved | Cancelled),
            InterruptedTargetPending => matches!(to, Interrupted | Cancelled),
            TargetResolved => matches!(to, InProgress | Interrupted | Cancelled),
            InProgress => matches!(to, Completing | Cancelled | Interrupted),
            Completing => matches!(to, Complete),
            Interrupted => matches!(to, Resuming | Cancelled),
            Resuming => matches!(to, TargetPending | InterruptedTargetPending | TargetResolved | Cancelled),
            Complete | Cancelled => false,
        }
    }
}

impl std::fmt::Display for InternalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job operates on besides itself
pub struct JobContext<'a> {
    pub id: u32,
    pub guid: Uuid,
    pub info: &'a mut RecordInfo,
    pub delegate: &'a dyn DownloadDelegate,
    pub settings: &'a EngineSettings,
    pub control_tx: &'a mpsc::UnboundedSender<ControlMessage>,
    pub events: &'a broadcast::Sender<CoreEvent>,
}

/// A file handed out by `steal_dangerous_download`
pub enum AcquiredFile {
    Ready(PathBuf),
    /// The writer context will reply once the file is released or copied
    Pending(oneshot::Receiver<Result<PathBuf, InterruptReason>>),
}

/// Lifecycle state machine of one download
pub struct DownloadJob {
    state: InternalState,
    /// Bumped whenever outstanding callbacks must be ignored
    generation: u64,
    writer: Option<WriterHandle>,
    request_handle: Option<Box<dyn RequestHandle>>,
    last_reason: Option<InterruptReason>,
    /// Error held back until target determination has finished
    destination_error: Option<InterruptReason>,
    danger_type: DangerType,
    paused: bool,
    auto_resume_count: u32,
    /// Digest state of the committed prefix, kept for resumption
    hash_state: Option<Sha256>,
    bytes_per_sec: u64,
    open_when_complete: bool,
    auto_opened: bool,
    opened: bool,
    delegate_delayed_complete: bool,
    file_externally_removed: bool,
    removed: bool,
}

impl Default for DownloadJob {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadJob {
    pub fn new() -> Self {
        Self {
            state: InternalState::Initial,
            generation: 0,
            writer: None,
            request_handle: None,
            last_reason: None,
            destination_error: None,
            danger_type: DangerType::NotDangerous,
            paused: false,
            auto_resume_count: 0,
            hash_state: None,
            bytes_per_sec: 0,
            open_when_complete: false,
            auto_opened: false,
            opened: false,
            delegate_delayed_complete: false,
            file_externally_removed: false,
            removed: false,
        }
    }

    /// A job for a download restored from history; `None` if the snapshot
    /// had no job.
    pub fn from_snapshot(snapshot: &DownloadSnapshot) -> Option<Self> {
        let mut job = Self::new();
        job.danger_type = snapshot.danger_type;
        job.opened = snapshot.opened;
        job.auto_resume_count = snapshot.auto_resume_count;
        match snapshot.state {
            DownloadState::Detached => return None,
            DownloadState::Complete => job.state = InternalState::Complete,
            DownloadState::Cancelled => job.state = InternalState::Cancelled,
            DownloadState::Interrupted => {
                job.state = InternalState::Interrupted;
                job.last_reason = snapshot.interrupt_reason;
            }
            DownloadState::InProgress => {
                job.state = InternalState::Interrupted;
                job.last_reason = Some(InterruptReason::Crash);
            }
        }
        Some(job)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> InternalState {
        self.state
    }

    pub fn external_state(&self) -> DownloadState {
        self.state.external()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_reason(&self) -> Option<InterruptReason> {
        self.last_reason
    }

    pub fn danger_type(&self) -> DangerType {
        self.danger_type
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    pub fn auto_resume_count(&self) -> u32 {
        self.auto_resume_count
    }

    pub fn is_dangerous(&self) -> bool {
        self.danger_type.is_dangerous()
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn has_writer(&self) -> bool {
        self.writer.is_some()
    }

    pub fn open_when_complete(&self) -> bool {
        self.open_when_complete
    }

    pub fn file_externally_removed(&self) -> bool {
        self.file_externally_removed
    }

    pub fn resume_mode(&self, cx: &JobContext<'_>) -> ResumeMode {
        resume_mode(&ResumeContext {
            url: cx.info.request.url(),
            has_current_path: cx.info.destination.current_path.is_some(),
            has_validators: cx.info.response.has_validators(),
            auto_resume_count: self.auto_resume_count,
            max_auto_resume_attempts: cx.settings.max_auto_resume_attempts,
            paused: self.paused,
            reason: self.last_reason,
        })
    }

    pub fn can_resume(&self, cx: &JobContext<'_>) -> bool {
        match self.state {
            InternalState::Initial
            | InternalState::Completing
            | InternalState::Complete
            | InternalState::Cancelled
            | InternalState::Resuming
            | InternalState::InterruptedTargetPending => false,
            InternalState::TargetPending | InternalState::TargetResolved | InternalState::InProgress => self.paused,
            InternalState::Interrupted => self.resume_mode(cx).requires_user(),
        }
    }

    pub fn is_done(&self, cx: &JobContext<'_>) -> bool {
        match self.state {
            InternalState::Complete | InternalState::Cancelled => true,
            InternalState::Interrupted => !self.can_resume(cx),
            _ => false,
        }
    }

    pub fn current_speed(&self) -> u64 {
        if self.paused {
            0
        } else {
            self.bytes_per_sec
        }
    }

    /// Whole percent received, or `None` while completion is held by the
    /// delegate or the size is unknown.
    pub fn percent_complete(&self, info: &RecordInfo) -> Option<u32> {
        if self.delegate_delayed_complete {
            return None;
        }
        match info.response.total_bytes {
            Some(total) if total > 0 => Some((info.destination.received_bytes as f64 * 100.0 / total as f64) as u32),
            _ => None,
        }
    }

    pub fn time_remaining(&self, info: &RecordInfo) -> Option<Duration> {
        let total = info.response.total_bytes.filter(|total| *total > 0)?;
        let speed = self.current_speed();
        if speed == 0 {
            return None;
        }
        let remaining = total.saturating_sub(info.destination.received_bytes);
        Some(Duration::from_secs(remaining / speed))
    }

    pub fn debug_string(&self, cx: &JobContext<'_>, verbose: bool) -> String {
        let chain = &cx.info.request.url_chain;
        let url_list = if chain.is_empty() {
            "<none>".to_string()
        } else if verbose {
            chain.iter().map(Url::as_str).collect::<Vec<_>>().join(" -> ")
        } else {
            chain[0].to_string()
        };

        if !verbose {
            return format!("{{ id = {} state = {} url = \"{}\" }}", cx.id, self.state, url_list);
        }

        let destination = &cx.info.destination;
        format!(
            "{{ id = {} state = {} total = {:?} received = {} reason = {} paused = {} resume_mode = {:?} \
             auto_resume_count = {} danger = {:?} all_data_saved = {} last_modified = '{}' etag = '{}' \
             has_writer = {} url_chain = \"{}\" current_path = {:?} target_path = {:?} }}",
            cx.id,
            self.state,
            cx.info.response.total_bytes,
            destination.received_bytes,
            self.last_reason.map_or("NONE", |r| r.as_str()),
            self.paused,
            self.resume_mode(cx),
            self.auto_resume_count,
            self.danger_type,
            destination.all_data_saved,
            cx.info.response.last_modified.as_deref().unwrap_or_default(),
            cx.info.response.etag.as_deref().unwrap_or_default(),
            self.writer.is_some(),
            url_list,
            destination.current_path,
            destination.target_path,
        )
    }

    // ========================================================================
    // Public operations
    // ========================================================================

    pub fn pause(&mut self, cx: &mut JobContext<'_>) {
        if self.paused {
            return;
        }
        match self.state {
            InternalState::InProgress | InternalState::TargetPending => {
                if let Some(handle) = self.request_handle.as_ref() {
                    handle.pause_request();
                }
                self.paused = true;
                self.update_observers(cx);
            }
            _ => {}
        }
    }

    pub fn resume(&mut self, cx: &mut JobContext<'_>) {
        match self.state {
            InternalState::InProgress | InternalState::TargetPending => {
                if !self.paused {
                    return;
                }
                if let Some(handle) = self.request_handle.as_ref() {
                    handle.resume_request();
                }
                self.paused = false;
                self.update_observers(cx);
            }
            InternalState::Interrupted => {
                // User input resets the counter.
                self.auto_resume_count = 0;
                self.resume_interrupted_download(cx);
                self.update_observers(cx);
            }
            _ => {}
        }
    }

    pub fn cancel(&mut self, user_cancel: bool, cx: &mut JobContext<'_>) {
        debug!("Cancel {}", self.debug_string(cx, false));
        let reason = if user_cancel {
            InterruptReason::UserCanceled
        } else {
            InterruptReason::UserShutdown
        };
        self.interrupt_and_discard_partial_state(reason, cx);
        self.update_observers(cx);
    }

    /// Cancel the download and mark the record for removal.
    pub fn remove(&mut self, cx: &mut JobContext<'_>) {
        self.interrupt_and_discard_partial_state(InterruptReason::UserCanceled, cx);
        self.update_observers(cx);
        self.removed = true;
        let _ = cx.events.send(CoreEvent::DownloadRemoved { id: cx.id, guid: cx.guid });
    }

    pub fn validate_dangerous_download(&mut self, cx: &mut JobContext<'_>) {
        if self.is_done(cx) || !self.is_dangerous() {
            return;
        }
        info!("Download {} validated by the user", cx.id);
        self.danger_type = DangerType::UserValidated;
        self.update_observers(cx);
        self.maybe_complete_download(cx);
    }

    /// Hand the file of a dangerous download to the caller. With
    /// `delete_after` the download is removed and the caller owns the file;
    /// otherwise the caller gets a copy.
    pub fn steal_dangerous_download(
        &mut self,
        delete_after: bool,
        cx: &mut JobContext<'_>,
    ) -> Result<AcquiredFile, EngineError> {
        if !self.is_dangerous() || !cx.info.destination.all_data_saved {
            return Err(EngineError::InvalidOperation(format!(
                "download {} is not a finished dangerous download",
                cx.id
            )));
        }

        if delete_after {
            let acquired = match self.writer.take() {
                Some(writer) => {
                    let (tx, rx) = oneshot::channel();
                    writer.post(WriterTask::Release {
                        destroy_file: false,
                        reply: Some(tx),
                    });
                    self.generation += 1;
                    AcquiredFile::Pending(rx)
                }
                None => AcquiredFile::Ready(self.current_path_or_error(cx)?),
            };
            cx.info.destination.current_path = None;
            self.remove(cx);
            Ok(acquired)
        } else if let Some(writer) = self.writer.as_ref() {
            let (tx, rx) = oneshot::channel();
            writer.post(WriterTask::CopyFile { reply: tx });
            Ok(AcquiredFile::Pending(rx))
        } else {
            Ok(AcquiredFile::Ready(self.current_path_or_error(cx)?))
        }
    }

    fn current_path_or_error(&self, cx: &JobContext<'_>) -> Result<PathBuf, EngineError> {
        cx.info
            .destination
            .current_path
            .clone()
            .ok_or_else(|| EngineError::InvalidOperation(format!("download {} has no file", cx.id)))
    }

    /// Open the finished file, or toggle opening on completion.
    pub fn open_download(&mut self, cx: &mut JobContext<'_>) {
        if !self.is_done(cx) {
            self.open_when_complete = !self.open_when_complete;
            self.update_observers(cx);
            return;
        }
        if self.state != InternalState::Complete || self.file_externally_removed {
            return;
        }
        self.opened = true;
        let _ = cx.events.send(CoreEvent::DownloadOpened { id: cx.id });
        let snapshot = self.snapshot(cx);
        cx.delegate.open_download(&snapshot);
    }

    /// Delete the file of a completed download. Returns true if the file
    /// is gone afterwards.
    pub fn delete_file(&mut self, cx: &mut JobContext<'_>) -> bool {
        if self.state != InternalState::Complete {
            return false;
        }
        let Some(path) = cx.info.destination.current_path.clone() else {
            return true;
        };
        if self.file_externally_removed {
            return true;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                self.on_downloaded_file_removed(cx);
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.on_downloaded_file_removed(cx);
                true
            }
            Err(e) => {
                warn!("Failed to delete {:?}: {}", path, e);
                false
            }
        }
    }

    pub fn on_downloaded_file_removed(&mut self, cx: &mut JobContext<'_>) {
        self.file_externally_removed = true;
        self.update_observers(cx);
    }

    // ========================================================================
    // Message dispatch
    // ========================================================================

    /// Handle an asynchronous result addressed to this job.
    pub fn handle_event(&mut self, token: CallbackToken, event: JobEvent, cx: &mut JobContext<'_>) {
        if token.generation != self.generation {
            debug!(
                "Dropping stale {} for download {} (generation {} != {})",
                event.name(),
                cx.id,
                token.generation,
                self.generation
            );
            return;
        }

        match event {
            JobEvent::FileInitialized(result) => self.on_download_file_initialized(result, cx),
            JobEvent::DestinationUpdate {
                bytes_so_far,
                bytes_per_sec,
                received_slices,
            } => self.destination_update(bytes_so_far, bytes_per_sec, received_slices, cx),
            JobEvent::DestinationError {
                reason,
                bytes_so_far,
                hash_state,
            } => self.destination_error(reason, bytes_so_far, hash_state, cx),
            JobEvent::DestinationCompleted {
                total_bytes,
                hash_state,
            } => self.destination_completed(total_bytes, hash_state, cx),
            JobEvent::TargetDetermined(decision) => self.on_download_target_determined(decision, cx),
            JobEvent::RenamedToIntermediateName(result) => self.on_download_renamed_to_intermediate_name(result, cx),
            JobEvent::RenamedToFinalName(result) => self.on_download_renamed_to_final_name(result, cx),
            JobEvent::CompletionReady => self.maybe_complete_download(cx),
            JobEvent::DelayedOpened { auto_opened } => self.delayed_download_opened(auto_opened, cx),
        }
    }

    fn poster(&self, cx: &JobContext<'_>) -> ControlPoster {
        ControlPoster::new(
            CallbackToken {
                download_id: cx.id,
                generation: self.generation,
            },
            cx.control_tx.clone(),
        )
    }

    // ========================================================================
    // Destination observer
    // ========================================================================

    fn destination_update(
        &mut self,
        bytes_so_far: u64,
        bytes_per_sec: u64,
        received_slices: Vec<ReceivedSlice>,
        cx: &mut JobContext<'_>,
    ) {
        if !matches!(
            self.state,
            InternalState::TargetPending | InternalState::InProgress | InternalState::InterruptedTargetPending
        ) {
            debug!("Ignoring destination update in {}", self.state);
            return;
        }
        cx.info.destination.received_slices = received_slices;
        self.update_progress(bytes_so_far, bytes_per_sec, cx);
        let _ = cx.events.send(CoreEvent::DownloadProgress {
            id: cx.id,
            received: cx.info.destination.received_bytes,
            total: cx.info.response.total_bytes,
            bytes_per_sec: self.current_speed(),
        });
        self.update_observers(cx);
    }

    fn destination_error(
        &mut self,
        reason: InterruptReason,
        bytes_so_far: u64,
        hash_state: Option<Sha256>,
        cx: &mut JobContext<'_>,
    ) {
        debug!("Destination error for download {}: {}", cx.id, reason.as_str());
        // Recognized once the target is known and the intermediate rename
        // has happened.
        if self.state == InternalState::TargetPending {
            cx.info.destination.received_bytes = bytes_so_far;
            self.hash_state = hash_state;
            cx.info.destination.hash.clear();
            self.destination_error = Some(reason);
            return;
        }
        self.interrupt_with_partial_state(bytes_so_far, hash_state, reason, cx);
        self.update_observers(cx);
    }

    fn destination_completed(&mut self, total_bytes: u64, hash_state: Option<Sha256>, cx: &mut JobContext<'_>) {
        debug!("All data saved for download {}", cx.id);
        self.on_all_data_saved(total_bytes, hash_state, cx);
        self.maybe_complete_download(cx);
    }

    fn on_all_data_saved(&mut self, total_bytes: u64, hash_state: Option<Sha256>, cx: &mut JobContext<'_>) {
        if cx.info.destination.all_data_saved {
            warn!("Download {} reported complete twice", cx.id);
        }
        cx.info.destination.all_data_saved = true;
        cx.info.response.total_bytes = Some(total_bytes);
        self.update_progress(total_bytes, 0, cx);
        self.set_hash_state(hash_state, cx);
        // Done with the data; no resumption will need the digest state.
        self.hash_state = None;
        self.update_observers(cx);
    }

    // ========================================================================
    // Progression cascade
    // ========================================================================

    /// Bind an attempt (a first start or a resumption) to this job.
    pub fn on_attached(&mut self, attempt: DownloadAttempt, cx: &mut JobContext<'_>) {
        if !matches!(self.state, InternalState::Initial | InternalState::Resuming) {
            warn!("Download {} cannot take an attempt in {}", cx.id, self.state);
            if let DownloadAttempt::Started { request_handle, .. } = attempt {
                request_handle.cancel_request();
            }
            return;
        }

        self.destination_error = None;
        cx.info.destination.target_disposition = if attempt.save_info().prompt_for_save_location {
            TargetDisposition::Prompt
        } else {
            TargetDisposition::Overwrite
        };

        match attempt {
            DownloadAttempt::FailedToStart { reason, save_info } => {
                let offset = save_info.offset;
                let hash_state = save_info.hash_state;

                if cx.info.destination.target_path.is_none() {
                    // Interrupted downloads still need a target path.
                    cx.info.destination.received_bytes = offset;
                    self.hash_state = hash_state;
                    cx.info.destination.hash.clear();
                    self.destination_error = Some(reason);
                    self.transition_to(InternalState::InterruptedTargetPending, cx);
                    self.determine_download_target(cx);
                    return;
                }

                // A resumption attempt that ended before it started.
                self.transition_to(InternalState::TargetResolved, cx);
                self.interrupt_with_partial_state(offset, hash_state, reason, cx);
                self.update_observers(cx);
            }
            DownloadAttempt::Started {
                save_info,
                response,
                feed,
                request_handle,
                parallel_streams,
            } => {
                self.apply_response(response, cx);
                if self.paused {
                    request_handle.pause_request();
                }
                self.request_handle = Some(request_handle);
                self.transition_to(InternalState::TargetPending, cx);

                let is_sparse = !parallel_streams.is_empty() || !cx.info.destination.received_slices.is_empty();
                let received_slices = if is_sparse {
                    cx.info.destination.received_slices.clone()
                } else {
                    Vec::new()
                };
                let observer = self.poster(cx);
                let default_directory = cx.settings.default_download_path.clone();
                let settings = WriterSettings::from(cx.settings);
                let writer = WriterHandle::spawn(move |queue| {
                    WriterEngine::new(
                        save_info,
                        default_directory,
                        Some(feed),
                        received_slices,
                        is_sparse,
                        Box::new(observer),
                        queue,
                        settings,
                    )
                });
                for stream in parallel_streams {
                    writer.post(WriterTask::AddInputStream {
                        offset: stream.offset,
                        length: stream.length,
                        feed: stream.feed,
                    });
                }
                writer.post(WriterTask::Initialize);
                self.writer = Some(writer);
                self.update_observers(cx);
            }
        }
    }

    /// Merge a response into the record. On resumption only the validators
    /// and content metadata are replaced and new redirects are appended.
    fn apply_response(&mut self, response: ResponseInfo, cx: &mut JobContext<'_>) {
        let resuming = self.state == InternalState::Resuming;
        let chain = &mut cx.info.request.url_chain;
        let mut new_urls = response.url_chain.iter().peekable();
        if new_urls.peek().copied() == chain.last() {
            new_urls.next();
        }
        let appended: Vec<Url> = new_urls.cloned().collect();
        if resuming && !appended.is_empty() {
            debug!("Resumption of download {} followed {} new redirects", cx.id, appended.len());
        }
        chain.extend(appended);

        let current = &mut cx.info.response;
        if resuming {
            if current.etag != response.etag || current.last_modified != response.last_modified {
                debug!("Validators of download {} changed on resumption", cx.id);
            }
            current.etag = response.etag;
            current.last_modified = response.last_modified;
            current.content_disposition = response.content_disposition;
            current.mime_type = response.mime_type;
            if response.total_bytes.is_some() {
                current.total_bytes = response.total_bytes;
            }
        } else {
            *current = ResponseInfo {
                url_chain: Vec::new(),
                ..response
            };
        }
    }

    fn on_download_file_initialized(&mut self, result: Result<(), InterruptReason>, cx: &mut JobContext<'_>) {
        if self.state != InternalState::TargetPending {
            warn!("Initialization result for download {} in {}", cx.id, self.state);
            return;
        }
        if let Err(reason) = result {
            // The partial file cannot be recovered.
            cx.info.destination.received_bytes = 0;
            self.hash_state = None;
            cx.info.destination.hash.clear();
            self.destination_error = Some(reason);
            self.transition_to(InternalState::InterruptedTargetPending, cx);
        }
        self.determine_download_target(cx);
    }

    fn determine_download_target(&mut self, cx: &mut JobContext<'_>) {
        debug!("Determining target for {}", self.debug_string(cx, false));

        // A resumed download keeps the target it already has.
        if let (Some(target), Some(current)) = (
            cx.info.destination.target_path.clone(),
            cx.info.destination.current_path.clone(),
        ) {
            let decision = TargetDecision {
                target_path: target,
                disposition: cx.info.destination.target_disposition,
                danger_type: self.danger_type,
                intermediate_path: current,
            };
            self.on_download_target_determined(decision, cx);
            return;
        }

        let snapshot = self.snapshot(cx);
        let callback = TargetCallback(self.poster(cx));
        cx.delegate.determine_download_target(&snapshot, callback);
    }

    fn on_download_target_determined(&mut self, decision: TargetDecision, cx: &mut JobContext<'_>) {
        if !matches!(
            self.state,
            InternalState::TargetPending | InternalState::InterruptedTargetPending
        ) {
            warn!("Target for download {} arrived in {}", cx.id, self.state);
            return;
        }

        if decision.target_path.as_os_str().is_empty() {
            self.cancel(true, cx);
            return;
        }

        debug!(
            "Download {} target {:?} (intermediate {:?}, danger {:?})",
            cx.id, decision.target_path, decision.intermediate_path, decision.danger_type
        );
        cx.info.destination.target_path = Some(decision.target_path.clone());
        cx.info.destination.target_disposition = decision.disposition;
        self.danger_type = decision.danger_type;

        if self.state == InternalState::InterruptedTargetPending {
            let reason = self.destination_error.take().unwrap_or(InterruptReason::FileFailed);
            let hash_state = self.hash_state.take();
            self.interrupt_with_partial_state(cx.info.destination.received_bytes, hash_state, reason, cx);
            self.update_observers(cx);
            return;
        }

        // The final rename must stay within one directory.
        if decision.intermediate_path.parent() != decision.target_path.parent() {
            error!(
                "Intermediate {:?} and target {:?} of download {} are in different directories",
                decision.intermediate_path, decision.target_path, cx.id
            );
            self.transition_to(InternalState::TargetResolved, cx);
            self.interrupt_and_discard_partial_state(InterruptReason::FileFailed, cx);
            self.update_observers(cx);
            return;
        }

        if cx.info.destination.current_path.as_ref() == Some(&decision.intermediate_path) {
            self.on_download_renamed_to_intermediate_name(Ok(decision.intermediate_path), cx);
            return;
        }

        let callback = self.poster(cx).rename_callback(JobEvent::RenamedToIntermediateName);
        match self.writer.as_ref() {
            Some(writer) => writer.post(WriterTask::RenameAndUniquify {
                path: decision.intermediate_path,
                callback,
            }),
            None => callback(Err(InterruptReason::FileFailed)),
        }
    }

    fn on_download_renamed_to_intermediate_name(
        &mut self,
        result: Result<PathBuf, InterruptReason>,
        cx: &mut JobContext<'_>,
    ) {
        if self.state != InternalState::TargetPending {
            warn!("Intermediate rename of download {} finished in {}", cx.id, self.state);
            return;
        }
        self.transition_to(InternalState::TargetResolved, cx);

        // A failed rename outranks a held-back destination error since the
        // partial state has to go.
        let full_path = match result {
            Ok(path) => path,
            Err(reason) => {
                self.interrupt_and_discard_partial_state(reason, cx);
                self.update_observers(cx);
                return;
            }
        };

        cx.info.destination.current_path = Some(full_path);

        if let Some(reason) = self.destination_error.take() {
            let hash_state = self.hash_state.take();
            self.interrupt_with_partial_state(cx.info.destination.received_bytes, hash_state, reason, cx);
            self.update_observers(cx);
            return;
        }

        self.transition_to(InternalState::InProgress, cx);
        self.update_observers(cx);
        self.maybe_complete_download(cx);
    }

    fn is_download_ready_for_completion(&self, cx: &JobContext<'_>) -> bool {
        if self.state != InternalState::InProgress {
            return false;
        }
        if !cx.info.destination.all_data_saved {
            return false;
        }
        if self.is_dangerous() {
            return false;
        }
        let snapshot = self.snapshot(cx);
        cx.delegate
            .should_complete_download(&snapshot, CompletionRetry(self.poster(cx)))
    }

    fn maybe_complete_download(&mut self, cx: &mut JobContext<'_>) {
        if !self.is_download_ready_for_completion(cx) {
            return;
        }
        self.on_download_completing(cx);
    }

    fn on_download_completing(&mut self, cx: &mut JobContext<'_>) {
        if self.state != InternalState::InProgress {
            return;
        }
        let Some(target) = cx.info.destination.target_path.clone() else {
            error!("Download {} is completing without a target", cx.id);
            return;
        };
        debug!("Completing {}", self.debug_string(cx, false));

        // Always rename, even to the same name; the annotation is needed.
        let callback = self.poster(cx).rename_callback(JobEvent::RenamedToFinalName);
        let task = WriterTask::RenameAndAnnotate {
            path: target,
            client_guid: cx.delegate.application_client_id(),
            source_url: cx.info.request.url().cloned(),
            referrer_url: cx.info.request.referrer_url.clone(),
            callback,
        };
        match self.writer.as_ref() {
            Some(writer) => writer.post(task),
            None => error!("Download {} is completing without a writer", cx.id),
        }
    }

    fn on_download_renamed_to_final_name(&mut self, result: Result<PathBuf, InterruptReason>, cx: &mut JobContext<'_>) {
        // A cancel or interrupt got here first.
        if self.state != InternalState::InProgress {
            return;
        }

        let full_path = match result {
            Ok(path) => path,
            Err(reason) => {
                self.interrupt_and_discard_partial_state(reason, cx);
                self.update_observers(cx);
                return;
            }
        };

        if cx.info.destination.target_path.as_ref() != Some(&full_path) {
            warn!(
                "Download {} landed at {:?} instead of {:?}",
                cx.id, full_path, cx.info.destination.target_path
            );
        }
        cx.info.destination.current_path = Some(full_path);

        self.release_download_file(false, cx);
        // Committed to completing; later cancels and interrupts are ignored.
        self.transition_to(InternalState::Completing, cx);

        let snapshot = self.snapshot(cx);
        if cx.delegate.should_open_download(&snapshot, OpenCallback(self.poster(cx))) {
            self.completed(cx);
        } else {
            self.delegate_delayed_complete = true;
            self.update_observers(cx);
        }
    }

    fn delayed_download_opened(&mut self, auto_opened: bool, cx: &mut JobContext<'_>) {
        if self.state != InternalState::Completing {
            warn!("Delayed open of download {} in {}", cx.id, self.state);
            return;
        }
        self.auto_opened = auto_opened;
        self.completed(cx);
    }

    fn completed(&mut self, cx: &mut JobContext<'_>) {
        cx.info.destination.end_time = Some(Utc::now());
        self.delegate_delayed_complete = false;
        self.transition_to(InternalState::Complete, cx);
        info!(
            "Download {} complete: {:?} ({} bytes)",
            cx.id, cx.info.destination.current_path, cx.info.destination.received_bytes
        );

        let should_open = self.open_when_complete
            || cx
                .info
                .destination
                .target_path
                .as_deref()
                .is_some_and(|path| cx.delegate.should_open_file_based_on_extension(path));
        if !self.auto_opened && should_open {
            self.open_download(cx);
            self.auto_opened = true;
        }
        self.update_observers(cx);
    }

    // ========================================================================
    // Interruption and resumption
    // ========================================================================

    fn interrupt_and_discard_partial_state(&mut self, reason: InterruptReason, cx: &mut JobContext<'_>) {
        self.interrupt_with_partial_state(0, None, reason, cx);
    }

    fn interrupt_with_partial_state(
        &mut self,
        bytes_so_far: u64,
        hash_state: Option<Sha256>,
        reason: InterruptReason,
        cx: &mut JobContext<'_>,
    ) {
        debug!(
            "Interrupting download {} ({}) at {} bytes",
            cx.id,
            reason.as_str(),
            bytes_so_far
        );

        // Interrupts from renames and from writes travel separately and can
        // race with each other and with cancels; this is where they meet.
        match self.state {
            InternalState::Cancelled | InternalState::Completing | InternalState::Complete => return,

            InternalState::Initial => {
                error!("Download {} interrupted before it started", cx.id);
                return;
            }

            InternalState::InterruptedTargetPending
            | InternalState::InProgress
            | InternalState::TargetPending
            | InternalState::TargetResolved => {
                self.last_reason = Some(reason);
                if self.writer.is_some() {
                    let mode = self.resume_mode(cx);
                    self.release_download_file(!mode.is_continue(), cx);
                }
            }

            InternalState::Resuming | InternalState::Interrupted => {
                // The first non-cancel reason wins.
                if !matches!(reason, InterruptReason::UserCanceled | InterruptReason::UserShutdown) {
                    return;
                }
                self.last_reason = Some(reason);
                if let Some(path) = cx.info.destination.current_path.take() {
                    // Cancelling an interrupted download: the partial file is
                    // no longer usable.
                    if let Err(e) = std::fs::remove_file(&path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            warn!("Failed to delete {:?}: {}", path, e);
                        }
                    }
                }
            }
        }

        // Resumption goes through another round of downloading.
        cx.info.destination.all_data_saved = false;

        if cx.info.destination.current_path.is_none() {
            self.hash_state = None;
            cx.info.destination.hash.clear();
            cx.info.destination.received_bytes = 0;
            cx.info.destination.received_slices.clear();
        } else {
            self.update_progress(bytes_so_far, 0, cx);
            self.set_hash_state(hash_state, cx);
        }

        if let Some(handle) = self.request_handle.take() {
            handle.cancel_request();
        }

        if matches!(reason, InterruptReason::UserCanceled | InterruptReason::UserShutdown) {
            if self.is_dangerous() {
                info!("Discarding dangerous download {} ({:?})", cx.id, self.danger_type);
            }
            self.transition_to(InternalState::Cancelled, cx);
            return;
        }

        warn!(
            "Download {} interrupted: {} ({} bytes received)",
            cx.id,
            reason.as_str(),
            cx.info.destination.received_bytes
        );
        self.transition_to(InternalState::Interrupted, cx);
        self.auto_resume_if_valid(cx);
    }

    /// Stop the writer context, keeping or deleting the file.
    fn release_download_file(&mut self, destroy_file: bool, cx: &mut JobContext<'_>) {
        if let Some(writer) = self.writer.take() {
            writer.post(WriterTask::Release {
                destroy_file,
                reply: None,
            });
        }
        if destroy_file {
            // Never reuse a deleted intermediate file.
            cx.info.destination.current_path = None;
        }
        self.generation += 1;
    }

    fn auto_resume_if_valid(&mut self, cx: &mut JobContext<'_>) {
        let mode = self.resume_mode(cx);
        if !mode.is_immediate() {
            return;
        }
        self.auto_resume_count += 1;
        info!(
            "Automatically resuming download {} (attempt {}, {:?})",
            cx.id, self.auto_resume_count, mode
        );
        self.resume_interrupted_download(cx);
    }

    fn resume_interrupted_download(&mut self, cx: &mut JobContext<'_>) {
        if self.state != InternalState::Interrupted {
            return;
        }
        let Some(url) = cx.info.request.url().cloned() else {
            warn!("Download {} has no URL to resume", cx.id);
            return;
        };

        // A new request; nothing pending may reach this job anymore.
        self.generation += 1;

        if self.resume_mode(cx).is_restart() {
            let destination = &mut cx.info.destination;
            destination.received_bytes = 0;
            destination.received_slices.clear();
            destination.hash.clear();
            cx.info.response.last_modified = None;
            cx.info.response.etag = None;
            self.hash_state = None;
        }

        let parameters = ResumeParameters {
            guid: cx.guid,
            url,
            referrer_url: cx.info.request.referrer_url.clone(),
            file_path: cx.info.destination.current_path.clone(),
            offset: cx.info.destination.received_bytes,
            total_bytes: cx.info.response.total_bytes,
            etag: cx.info.response.etag.clone(),
            last_modified: cx.info.response.last_modified.clone(),
            hash_of_partial_file: cx.info.destination.hash.clone(),
            hash_state: self.hash_state.take(),
            received_slices: cx.info.destination.received_slices.clone(),
        };

        self.transition_to(InternalState::Resuming, cx);
        cx.delegate.resume_interrupted_download(parameters, cx.id);
        // In case the download was interrupted while paused.
        self.paused = false;
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn update_progress(&mut self, bytes_so_far: u64, bytes_per_sec: u64, cx: &mut JobContext<'_>) {
        cx.info.destination.received_bytes = bytes_so_far;
        self.bytes_per_sec = bytes_per_sec;
        // More data than announced: the size is unknown after all.
        if cx.info.response.total_bytes.is_some_and(|total| bytes_so_far > total) {
            cx.info.response.total_bytes = None;
        }
    }

    fn set_hash_state(&mut self, hash_state: Option<Sha256>, cx: &mut JobContext<'_>) {
        cx.info.destination.hash = hash_state
            .as_ref()
            .map(|state| state.clone().finalize().to_vec())
            .unwrap_or_default();
        self.hash_state = hash_state;
    }

    fn transition_to(&mut self, new_state: InternalState, cx: &JobContext<'_>) {
        if self.state == new_state {
            return;
        }
        let old_state = self.state;
        if !old_state.can_transition_to(new_state) {
            error!("Invalid state transition of download {}: {} -> {}", cx.id, old_state, new_state);
        }
        self.state = new_state;

        let destination = &cx.info.destination;
        match new_state {
            InternalState::InProgress => {
                let same_directory = match (&destination.current_path, &destination.target_path) {
                    (Some(current), Some(target)) => current.parent() == target.parent(),
                    _ => false,
                };
                if !same_directory {
                    error!(
                        "Download {} in progress with current {:?} and target {:?}",
                        cx.id, destination.current_path, destination.target_path
                    );
                }
            }
            InternalState::Completing => {
                if !destination.all_data_saved {
                    error!("Download {} completing before all data was saved", cx.id);
                }
            }
            _ => {}
        }

        debug!("Download {}: {} -> {}", cx.id, old_state, new_state);
    }

    fn snapshot(&self, cx: &JobContext<'_>) -> DownloadSnapshot {
        cx.info.snapshot(cx.id, cx.guid, Some(self))
    }

    fn update_observers(&self, cx: &JobContext<'_>) {
        let _ = cx.events.send(CoreEvent::DownloadUpdated {
            download: self.snapshot(cx),
        });
    }
}

impl std::fmt::Debug for DownloadJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadJob")
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("has_writer", &self.writer.is_some())
            .field("last_reason", &self.last_reason)
            .field("danger_type", &self.danger_type)
            .field("paused", &self.paused)
            .field("auto_resume_count", &self.auto_resume_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::delegate::SaveInfo;
    use crate::engine::feed::{byte_stream, ByteStreamWriter};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use resumedl_types::RequestInfo;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Default)]
    struct MockDelegate {
        danger_type: Mutex<DangerType>,
        cancel_target: AtomicBool,
        resumes: Mutex<Vec<ResumeParameters>>,
        opened: AtomicUsize,
        dir: Mutex<PathBuf>,
        /// Puts the intermediate file somewhere other than `dir`
        intermediate_dir: Mutex<Option<PathBuf>>,
    }

    impl DownloadDelegate for MockDelegate {
        fn determine_download_target(&self, _download: &DownloadSnapshot, callback: TargetCallback) {
            if self.cancel_target.load(Ordering::SeqCst) {
                callback.run(TargetDecision::cancel());
                return;
            }
            let mut decision = TargetDecision::with_default_intermediate(self.dir.lock().join("file.bin"));
            decision.danger_type = *self.danger_type.lock();
            if let Some(other) = self.intermediate_dir.lock().as_ref() {
                decision.intermediate_path = other.join("file.bin.crdownload");
            }
            callback.run(decision);
        }

        fn resume_interrupted_download(&self, parameters: ResumeParameters, _download_id: u32) {
            self.resumes.lock().push(parameters);
        }

        fn open_download(&self, _download: &DownloadSnapshot) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RequestFlags {
        paused: AtomicBool,
        resumed: AtomicBool,
        cancelled: AtomicBool,
    }

    struct MockRequest(Arc<RequestFlags>);

    impl RequestHandle for MockRequest {
        fn pause_request(&self) {
            self.0.paused.store(true, Ordering::SeqCst);
        }

        fn resume_request(&self) {
            self.0.resumed.store(true, Ordering::SeqCst);
        }

        fn cancel_request(&self) {
            self.0.cancelled.store(true, Ordering::SeqCst);
        }
    }

    struct Fixture {
        dir: TempDir,
        info: RecordInfo,
        guid: Uuid,
        delegate: Arc<MockDelegate>,
        settings: EngineSettings,
        control_tx: mpsc::UnboundedSender<ControlMessage>,
        control_rx: mpsc::UnboundedReceiver<ControlMessage>,
        events: broadcast::Sender<CoreEvent>,
        flags: Arc<RequestFlags>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let delegate = Arc::new(MockDelegate::default());
            *delegate.dir.lock() = dir.path().to_path_buf();
            let settings = EngineSettings {
                default_download_path: dir.path().to_path_buf(),
                ..Default::default()
            };
            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let (events, _) = broadcast::channel(1024);
            Self {
                dir,
                info: RecordInfo::new(RequestInfo::new(url())),
                guid: Uuid::new_v4(),
                delegate,
                settings,
                control_tx,
                control_rx,
                events,
                flags: Arc::new(RequestFlags::default()),
            }
        }

        fn cx(&mut self) -> JobContext<'_> {
            JobContext {
                id: 1,
                guid: self.guid,
                info: &mut self.info,
                delegate: &*self.delegate,
                settings: &self.settings,
                control_tx: &self.control_tx,
                events: &self.events,
            }
        }

        /// A started attempt fed by a byte stream; the writer end is returned.
        fn started(&self, etag: Option<&str>) -> (DownloadAttempt, ByteStreamWriter) {
            let (writer, reader) = byte_stream();
            let attempt = DownloadAttempt::Started {
                save_info: SaveInfo::default(),
                response: ResponseInfo {
                    url_chain: vec![url()],
                    total_bytes: Some(11),
                    etag: etag.map(str::to_string),
                    ..Default::default()
                },
                feed: Box::new(reader),
                request_handle: Box::new(MockRequest(self.flags.clone())),
                parallel_streams: Vec::new(),
            };
            (attempt, writer)
        }

        async fn run_until(&mut self, job: &mut DownloadJob, done: impl Fn(&DownloadJob, &RecordInfo) -> bool) {
            tokio::time::timeout(Duration::from_secs(10), async {
                while !done(job, &self.info) {
                    let message = self.control_rx.recv().await.unwrap();
                    let mut cx = self.cx();
                    job.handle_event(message.token, message.event, &mut cx);
                }
            })
            .await
            .expect("job did not reach the expected state");
        }
    }

    fn url() -> Url {
        Url::parse("https://example.com/file.bin").unwrap()
    }

    #[test]
    fn test_transition_table() {
        use InternalState::*;
        assert!(Initial.can_transition_to(TargetPending));
        assert!(!Initial.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completing));
        assert!(!Completing.can_transition_to(Cancelled));
        assert!(Resuming.can_transition_to(TargetResolved));
        assert!(!Complete.can_transition_to(Interrupted));
        assert!(!Cancelled.can_transition_to(Resuming));
        assert_eq!(Completing.external(), DownloadState::InProgress);
        assert_eq!(Interrupted.external(), DownloadState::Interrupted);
        assert_eq!(InterruptedTargetPending.as_str(), "INTERRUPTED_TARGET_PENDING");
    }

    #[tokio::test]
    async fn test_download_runs_to_completion() {
        let mut fx = Fixture::new();
        let mut job = DownloadJob::new();
        let (attempt, writer) = fx.started(None);
        writer.write(Bytes::from_static(b"hello world"));
        writer.close(Ok(()));

        job.on_attached(attempt, &mut fx.cx());
        // Not done yet: toggles opening on completion.
        job.open_download(&mut fx.cx());
        assert!(job.open_when_complete());

        fx.run_until(&mut job, |job, _| job.state() == InternalState::Complete).await;

        let target = fx.dir.path().join("file.bin");
        assert_eq!(std::fs::read(&target).unwrap(), b"hello world");
        assert_eq!(fx.info.destination.current_path.as_ref(), Some(&target));
        assert_eq!(fx.info.destination.hash, Sha256::digest(b"hello world").to_vec());
        assert_eq!(job.percent_complete(&fx.info), Some(100));
        assert!(!job.has_writer());
        assert!(job.is_opened());
        assert_eq!(fx.delegate.opened.load(Ordering::SeqCst), 1);
        assert!(!fx.flags.cancelled.load(Ordering::SeqCst));

        assert!(job.delete_file(&mut fx.cx()));
        assert!(!target.exists());
        assert!(job.file_externally_removed());
    }

    #[tokio::test]
    async fn test_network_error_resumes_then_needs_user() {
        let mut fx = Fixture::new();
        let mut job = DownloadJob::new();
        let (attempt, writer) = fx.started(Some("\"v1\""));
        writer.write(Bytes::from_static(b"hello"));
        writer.close(Err(InterruptReason::NetworkTimeout));

        job.on_attached(attempt, &mut fx.cx());
        let delegate = fx.delegate.clone();
        fx.run_until(&mut job, |_, _| !delegate.resumes.lock().is_empty()).await;

        assert_eq!(job.state(), InternalState::Resuming);
        assert_eq!(job.auto_resume_count(), 1);
        assert!(fx.flags.cancelled.load(Ordering::SeqCst));
        let parameters = fx.delegate.resumes.lock()[0].clone();
        assert_eq!(parameters.offset, 5);
        assert_eq!(parameters.etag.as_deref(), Some("\"v1\""));
        assert!(parameters.hash_state.is_some());
        let partial = parameters.file_path.clone().unwrap();
        assert!(partial.to_string_lossy().ends_with("file.bin.crdownload"));
        assert!(partial.exists());

        // The resumed request fails for a reason that needs the user.
        job.on_attached(
            DownloadAttempt::FailedToStart {
                reason: InterruptReason::NetworkFailed,
                save_info: parameters.save_info(),
            },
            &mut fx.cx(),
        );
        assert_eq!(job.state(), InternalState::Interrupted);
        assert_eq!(job.last_reason(), Some(InterruptReason::NetworkFailed));
        assert_eq!(fx.info.destination.received_bytes, 5);
        assert!(job.can_resume(&fx.cx()));
        assert!(!job.is_done(&fx.cx()));

        job.cancel(true, &mut fx.cx());
        assert_eq!(job.state(), InternalState::Cancelled);
        assert!(fx.info.destination.current_path.is_none());
        assert!(!partial.exists());
        assert!(job.is_done(&fx.cx()));
    }

    #[tokio::test]
    async fn test_pause_resume_and_cancel_reach_the_request() {
        let mut fx = Fixture::new();
        let mut job = DownloadJob::new();
        let (attempt, _writer) = fx.started(None);

        job.on_attached(attempt, &mut fx.cx());
        job.pause(&mut fx.cx());
        assert!(job.is_paused());
        assert!(fx.flags.paused.load(Ordering::SeqCst));
        assert!(job.can_resume(&fx.cx()));
        assert_eq!(job.current_speed(), 0);

        job.resume(&mut fx.cx());
        assert!(!job.is_paused());
        assert!(fx.flags.resumed.load(Ordering::SeqCst));

        fx.run_until(&mut job, |job, _| job.state() == InternalState::InProgress)
            .await;
        let intermediate = fx.info.destination.current_path.clone().unwrap();
        assert!(intermediate.exists());

        job.cancel(true, &mut fx.cx());
        assert_eq!(job.state(), InternalState::Cancelled);
        assert_eq!(job.last_reason(), Some(InterruptReason::UserCanceled));
        assert!(fx.flags.cancelled.load(Ordering::SeqCst));
        assert!(fx.info.destination.current_path.is_none());
        assert!(!job.can_resume(&fx.cx()));
        assert!(job.is_done(&fx.cx()));
    }

    #[tokio::test]
    async fn test_empty_target_cancels() {
        let mut fx = Fixture::new();
        fx.delegate.cancel_target.store(true, Ordering::SeqCst);
        let mut job = DownloadJob::new();
        let (attempt, _writer) = fx.started(None);

        job.on_attached(attempt, &mut fx.cx());
        fx.run_until(&mut job, |job, _| job.state() == InternalState::Cancelled)
            .await;
        assert!(fx.info.destination.target_path.is_none());
    }

    #[tokio::test]
    async fn test_dangerous_download_waits_for_validation() {
        let mut fx = Fixture::new();
        *fx.delegate.danger_type.lock() = DangerType::DangerousFile;
        let mut job = DownloadJob::new();
        let (attempt, writer) = fx.started(None);
        writer.write(Bytes::from_static(b"hello world"));
        writer.close(Ok(()));

        job.on_attached(attempt, &mut fx.cx());
        fx.run_until(&mut job, |job, info| {
            job.state() == InternalState::InProgress && info.destination.all_data_saved
        })
        .await;
        assert!(job.is_dangerous());

        let copy = match job.steal_dangerous_download(false, &mut fx.cx()).unwrap() {
            AcquiredFile::Pending(rx) => rx.await.unwrap().unwrap(),
            AcquiredFile::Ready(path) => path,
        };
        assert_eq!(std::fs::read(&copy).unwrap(), b"hello world");
        assert_eq!(job.state(), InternalState::InProgress);

        job.validate_dangerous_download(&mut fx.cx());
        assert_eq!(job.danger_type(), DangerType::UserValidated);
        fx.run_until(&mut job, |job, _| job.state() == InternalState::Complete).await;
        assert!(fx.dir.path().join("file.bin").exists());
    }

    #[tokio::test]
    async fn test_intermediate_outside_target_directory_interrupts() {
        let mut fx = Fixture::new();
        let elsewhere = fx.dir.path().join("elsewhere");
        std::fs::create_dir_all(&elsewhere).unwrap();
        *fx.delegate.intermediate_dir.lock() = Some(elsewhere.clone());
        let mut job = DownloadJob::new();
        let (attempt, writer) = fx.started(Some("\"v1\""));
        writer.write(Bytes::from_static(b"hello"));

        job.on_attached(attempt, &mut fx.cx());
        fx.run_until(&mut job, |job, _| job.state() == InternalState::Interrupted)
            .await;

        assert_eq!(job.last_reason(), Some(InterruptReason::FileFailed));
        assert!(fx.info.destination.current_path.is_none());
        assert_eq!(job.resume_mode(&fx.cx()), ResumeMode::UserRestart);
        assert!(fx.delegate.resumes.lock().is_empty());

        // The partial file is deleted on the writer context.
        let only_subdir = || {
            std::fs::read_dir(fx.dir.path())
                .unwrap()
                .map(|entry| entry.unwrap().path())
                .all(|path| path == elsewhere)
        };
        tokio::time::timeout(Duration::from_secs(10), async {
            while !only_subdir() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("partial file was not deleted");
        assert_eq!(std::fs::read_dir(&elsewhere).unwrap().count(), 0);
        drop(writer);
    }

    #[tokio::test]
    async fn test_stale_events_are_dropped() {
        let mut fx = Fixture::new();
        let mut job = DownloadJob::new();
        let token = CallbackToken {
            download_id: 1,
            generation: job.generation() + 1,
        };
        job.handle_event(
            token,
            JobEvent::DestinationCompleted {
                total_bytes: 10,
                hash_state: None,
            },
            &mut fx.cx(),
        );
        assert!(!fx.info.destination.all_data_saved);
        assert_eq!(fx.info.response.total_bytes, None);
    }

    #[test]
    fn test_remove_emits_event() {
        let mut fx = Fixture::new();
        let mut events = fx.events.subscribe();
        let mut job = DownloadJob::from_snapshot(&{
            let mut snapshot = fx.info.snapshot(1, fx.guid, None);
            snapshot.state = DownloadState::Interrupted;
            snapshot.interrupt_reason = Some(InterruptReason::NetworkFailed);
            snapshot
        })
        .unwrap();

        job.remove(&mut fx.cx());
        assert!(job.is_removed());
        assert_eq!(job.state(), InternalState::Cancelled);

        let mut removed = false;
        while let Ok(event) = events.try_recv() {
            if let CoreEvent::DownloadRemoved { id, guid } = event {
                assert_eq!((id, guid), (1, fx.guid));
                removed = true;
            }
        }
        assert!(removed);
    }
}
