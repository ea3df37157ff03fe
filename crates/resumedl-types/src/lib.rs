//! Shared types for resumedl
//!
//! This crate contains the data structures shared between the download
//! engine, its history store and the CLI: the download record parts, the
//! interrupt taxonomy, received byte slices, events and settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

// ============================================================================
// Byte Ranges
// ============================================================================

/// A contiguous byte range `[offset, offset + length)` already committed to
/// the destination file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReceivedSlice {
    pub offset: u64,
    pub length: u64,
}

impl ReceivedSlice {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// One past the last byte of this slice.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// A byte range that still has to be fetched. `length == None` means
/// "from `offset` to the end of the file".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceToDownload {
    pub offset: u64,
    pub length: Option<u64>,
}

impl SliceToDownload {
    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    /// Open-ended range starting at `offset`.
    pub fn open(offset: u64) -> Self {
        Self {
            offset,
            length: None,
        }
    }
}

// ============================================================================
// Interrupt Reasons
// ============================================================================

/// Why a download stopped before completion.
///
/// This is a closed set. The absence of an error is never a variant; it is
/// expressed as `Ok(())` or `None` at the call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptReason {
    #[error("file failed")]
    FileFailed,
    #[error("access denied")]
    FileAccessDenied,
    #[error("disk is full")]
    FileNoSpace,
    #[error("path too long")]
    FileNameTooLong,
    #[error("file too large")]
    FileTooLarge,
    #[error("virus detected")]
    FileVirusInfected,
    #[error("temporary file error")]
    FileTransientError,
    #[error("blocked")]
    FileBlocked,
    #[error("security check failed")]
    FileSecurityCheckFailed,
    #[error("file is shorter than expected")]
    FileTooShort,
    #[error("partial file does not match the expected hash")]
    FileHashMismatch,

    #[error("network error")]
    NetworkFailed,
    #[error("network timeout")]
    NetworkTimeout,
    #[error("network disconnected")]
    NetworkDisconnected,
    #[error("server down")]
    NetworkServerDown,
    #[error("invalid network request")]
    NetworkInvalidRequest,

    #[error("server failed")]
    ServerFailed,
    #[error("server does not support range requests")]
    ServerNoRange,
    #[error("server sent bad content")]
    ServerBadContent,
    #[error("unauthorized")]
    ServerUnauthorized,
    #[error("server certificate problem")]
    ServerCertProblem,
    #[error("forbidden")]
    ServerForbidden,
    #[error("server unreachable")]
    ServerUnreachable,

    #[error("canceled by user")]
    UserCanceled,
    #[error("shut down")]
    UserShutdown,

    #[error("crash")]
    Crash,
}

/// Broad grouping of interrupt reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptCategory {
    Network,
    Filesystem,
    ContentIntegrity,
    Policy,
    User,
    Crash,
}

impl InterruptReason {
    pub fn category(&self) -> InterruptCategory {
        use InterruptReason::*;
        match self {
            NetworkFailed | NetworkTimeout | NetworkDisconnected | NetworkServerDown
            | NetworkInvalidRequest | ServerFailed | ServerUnauthorized | ServerCertProblem
            | ServerForbidden | ServerUnreachable => InterruptCategory::Network,
            FileFailed | FileAccessDenied | FileNoSpace | FileNameTooLong | FileTooLarge
            | FileTransientError => InterruptCategory::Filesystem,
            FileTooShort | FileHashMismatch | ServerNoRange | ServerBadContent => {
                InterruptCategory::ContentIntegrity
            }
            FileVirusInfected | FileBlocked | FileSecurityCheckFailed => InterruptCategory::Policy,
            UserCanceled | UserShutdown => InterruptCategory::User,
            Crash => InterruptCategory::Crash,
        }
    }

    /// Stable identifier used in logs and the history store.
    pub fn as_str(&self) -> &'static str {
        use InterruptReason::*;
        match self {
            FileFailed => "FILE_FAILED",
            FileAccessDenied => "FILE_ACCESS_DENIED",
            FileNoSpace => "FILE_NO_SPACE",
            FileNameTooLong => "FILE_NAME_TOO_LONG",
            FileTooLarge => "FILE_TOO_LARGE",
            FileVirusInfected => "FILE_VIRUS_INFECTED",
            FileTransientError => "FILE_TRANSIENT_ERROR",
            FileBlocked => "FILE_BLOCKED",
            FileSecurityCheckFailed => "FILE_SECURITY_CHECK_FAILED",
            FileTooShort => "FILE_TOO_SHORT",
            FileHashMismatch => "FILE_HASH_MISMATCH",
            NetworkFailed => "NETWORK_FAILED",
            NetworkTimeout => "NETWORK_TIMEOUT",
            NetworkDisconnected => "NETWORK_DISCONNECTED",
            NetworkServerDown => "NETWORK_SERVER_DOWN",
            NetworkInvalidRequest => "NETWORK_INVALID_REQUEST",
            ServerFailed => "SERVER_FAILED",
            ServerNoRange => "SERVER_NO_RANGE",
            ServerBadContent => "SERVER_BAD_CONTENT",
            ServerUnauthorized => "SERVER_UNAUTHORIZED",
            ServerCertProblem => "SERVER_CERT_PROBLEM",
            ServerForbidden => "SERVER_FORBIDDEN",
            ServerUnreachable => "SERVER_UNREACHABLE",
            UserCanceled => "USER_CANCELED",
            UserShutdown => "USER_SHUTDOWN",
            Crash => "CRASH",
        }
    }

    /// Map an HTTP status code of a download response to a reason.
    /// Returns `None` for statuses that carry a body worth saving.
    pub fn from_http_status(status: u16) -> Option<Self> {
        match status {
            200..=299 => None,
            401 => Some(InterruptReason::ServerUnauthorized),
            403 => Some(InterruptReason::ServerForbidden),
            404 | 410 => Some(InterruptReason::ServerBadContent),
            416 => Some(InterruptReason::ServerNoRange),
            400..=499 => Some(InterruptReason::NetworkInvalidRequest),
            503 => Some(InterruptReason::NetworkServerDown),
            _ => Some(InterruptReason::ServerFailed),
        }
    }
}

// ============================================================================
// Download State
// ============================================================================

/// Externally visible state of a download record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    /// No job is attached to the record.
    Detached,
    InProgress,
    Complete,
    Cancelled,
    Interrupted,
}

/// How (or whether) an interrupted download may continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    Invalid,
    ImmediateContinue,
    ImmediateRestart,
    UserContinue,
    UserRestart,
}

impl ResumeMode {
    pub fn is_restart(&self) -> bool {
        matches!(self, ResumeMode::ImmediateRestart | ResumeMode::UserRestart)
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, ResumeMode::ImmediateContinue | ResumeMode::UserContinue)
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, ResumeMode::ImmediateContinue | ResumeMode::ImmediateRestart)
    }

    pub fn requires_user(&self) -> bool {
        matches!(self, ResumeMode::UserContinue | ResumeMode::UserRestart)
    }
}

/// Danger classification assigned by the delegate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerType {
    #[default]
    NotDangerous,
    DangerousFile,
    DangerousUrl,
    DangerousContent,
    MaybeDangerousContent,
    UncommonContent,
    UserValidated,
    DangerousHost,
    PotentiallyUnwanted,
}

impl DangerType {
    /// Whether completion must wait for the user to validate the download.
    pub fn is_dangerous(&self) -> bool {
        !matches!(self, DangerType::NotDangerous | DangerType::UserValidated | DangerType::MaybeDangerousContent)
    }
}

/// What to do when the target path already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetDisposition {
    #[default]
    Overwrite,
    Prompt,
}

/// How the download was initiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    #[default]
    Link,
    Typed,
    FormSubmit,
    Reload,
    Generated,
}

// ============================================================================
// Record Parts
// ============================================================================

/// Information about the request that started the download. Set once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInfo {
    pub url_chain: Vec<Url>,
    pub referrer_url: Option<Url>,
    pub site_url: Option<Url>,
    pub tab_url: Option<Url>,
    pub tab_referrer_url: Option<Url>,
    pub transition_type: TransitionType,
    pub has_user_gesture: bool,
    pub start_time: DateTime<Utc>,
}

impl RequestInfo {
    pub fn new(url: Url) -> Self {
        Self {
            url_chain: vec![url],
            referrer_url: None,
            site_url: None,
            tab_url: None,
            tab_referrer_url: None,
            transition_type: TransitionType::Link,
            has_user_gesture: false,
            start_time: Utc::now(),
        }
    }

    /// The last URL of the redirect chain.
    pub fn url(&self) -> Option<&Url> {
        self.url_chain.last()
    }

    pub fn original_url(&self) -> Option<&Url> {
        self.url_chain.first()
    }
}

/// Information from the response. Replaced wholesale on each resumption.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInfo {
    /// Redirects followed by this response, appended to the request chain.
    #[serde(default)]
    pub url_chain: Vec<Url>,
    pub content_disposition: Option<String>,
    pub mime_type: Option<String>,
    pub original_mime_type: Option<String>,
    /// `None` when the server did not announce a length.
    pub total_bytes: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ResponseInfo {
    pub fn has_validators(&self) -> bool {
        self.etag.as_deref().is_some_and(|s| !s.is_empty())
            || self.last_modified.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Where the bytes go and how many have landed. Mutated only by the job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DestinationInfo {
    pub target_path: Option<PathBuf>,
    pub current_path: Option<PathBuf>,
    pub target_disposition: TargetDisposition,
    pub received_bytes: u64,
    pub received_slices: Vec<ReceivedSlice>,
    pub all_data_saved: bool,
    /// Finalized digest of the bytes committed so far (empty when unknown).
    pub hash: Vec<u8>,
    pub end_time: Option<DateTime<Utc>>,
}

// ============================================================================
// Snapshot
// ============================================================================

/// Flattened view of a download record, handed to observers and to the
/// history store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub id: u32,
    pub guid: Uuid,
    pub url_chain: Vec<Url>,
    pub referrer_url: Option<Url>,
    pub tab_url: Option<Url>,
    pub transition_type: TransitionType,
    pub has_user_gesture: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub content_disposition: Option<String>,
    pub mime_type: Option<String>,
    pub original_mime_type: Option<String>,
    pub total_bytes: Option<u64>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub target_path: Option<PathBuf>,
    pub current_path: Option<PathBuf>,
    pub received_bytes: u64,
    pub received_slices: Vec<ReceivedSlice>,
    pub all_data_saved: bool,
    /// Hex-encoded content digest.
    pub hash: String,
    pub state: DownloadState,
    pub internal_state: String,
    pub interrupt_reason: Option<InterruptReason>,
    pub danger_type: DangerType,
    pub paused: bool,
    pub opened: bool,
    pub auto_resume_count: u32,
}

impl DownloadSnapshot {
    pub fn url(&self) -> Option<&Url> {
        self.url_chain.last()
    }

    pub fn progress(&self) -> f64 {
        match self.total_bytes {
            Some(total) if total > 0 => (self.received_bytes as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the core to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    DownloadCreated {
        download: DownloadSnapshot,
    },
    DownloadUpdated {
        download: DownloadSnapshot,
    },
    DownloadProgress {
        id: u32,
        received: u64,
        total: Option<u64>,
        bytes_per_sec: u64,
    },
    DownloadOpened {
        id: u32,
    },
    DownloadRemoved {
        id: u32,
        guid: Uuid,
    },
    /// The manager is stopping; updates after this are teardown, not history
    ManagerGoingDown,
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine tuning knobs. The defaults are the values the engine is specified
/// against; tests rely on them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub default_download_path: PathBuf,
    /// Number of parallel streams requested for range-capable servers
    pub parallel_streams: u32,
    /// Automatic resumption attempts before the user has to step in
    pub max_auto_resume_attempts: u32,
    /// Retries for a rename failing with a transient error
    pub max_rename_retries: u32,
    pub initial_rename_retry_delay_ms: u64,
    /// Longest a single stream may hold the writer context per turn
    pub max_time_blocking_writer_ms: u64,
    pub update_period_ms: u64,
    pub user_agent: String,
}

impl EngineSettings {
    pub fn initial_rename_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_rename_retry_delay_ms)
    }

    pub fn max_time_blocking_writer(&self) -> Duration {
        Duration::from_millis(self.max_time_blocking_writer_ms)
    }

    pub fn update_period(&self) -> Duration {
        Duration::from_millis(self.update_period_ms)
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_download_path: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            parallel_streams: 4,
            max_auto_resume_attempts: 5,
            max_rename_retries: 3,
            initial_rename_retry_delay_ms: 200,
            max_time_blocking_writer_ms: 1000,
            update_period_ms: 500,
            user_agent: concat!("resumedl/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

// ============================================================================
// API Types
// ============================================================================

/// Information about a link (from probing)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    pub url: String,
    pub final_url: Option<String>,
    pub filename: String,
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub resumable: bool,
}
