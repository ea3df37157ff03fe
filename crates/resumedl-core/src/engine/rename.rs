//! Rename parameters and path helpers shared by the retrying rename routine

use resumedl_types::InterruptReason;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use url::Url;

/// Highest numeric suffix tried when uniquifying a path.
const MAX_UNIQUE_FILES: u32 = 100;

/// Invoked once with the final path, or the reason the rename gave up.
pub type RenameCallback = Box<dyn FnOnce(Result<PathBuf, InterruptReason>) + Send>;

/// What to do besides moving the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenameOption {
    /// Append ` (N)` before the extension if the target already exists
    Uniquify,
    /// Record where the file came from once it has its final name
    AnnotateWithSourceInformation {
        client_guid: String,
        source_url: Option<Url>,
        referrer_url: Option<Url>,
    },
}

/// State carried across attempts of one rename
pub struct RenameParameters {
    pub option: RenameOption,
    pub new_path: PathBuf,
    pub retries_left: u32,
    pub time_of_first_failure: Option<Instant>,
    pub callback: RenameCallback,
}

impl RenameParameters {
    pub fn new(option: RenameOption, new_path: PathBuf, retries: u32, callback: RenameCallback) -> Self {
        Self {
            option,
            new_path,
            retries_left: retries,
            time_of_first_failure: None,
            callback,
        }
    }
}

impl std::fmt::Debug for RenameParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenameParameters")
            .field("option", &self.option)
            .field("new_path", &self.new_path)
            .field("retries_left", &self.retries_left)
            .finish_non_exhaustive()
    }
}

/// Delay before retry number `attempt` (0-based): `initial * 2^attempt`.
pub fn retry_delay_for_failed_rename(initial: Duration, attempt: u32) -> Duration {
    initial.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
}

/// Only transient failures are worth another try.
pub fn should_retry_failed_rename(reason: InterruptReason) -> bool {
    reason == InterruptReason::FileTransientError
}

/// Insert `suffix` between the file stem and its extension.
pub fn insert_before_extension(path: &Path, suffix: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}{}", stem, suffix),
    };
    path.with_file_name(name)
}

/// Smallest `N` such that `path (N)` does not exist, `Some(0)` if `path`
/// itself is free, `None` if every candidate is taken.
pub fn unique_path_number(path: &Path) -> Option<u32> {
    if !path.exists() {
        return Some(0);
    }
    (1..=MAX_UNIQUE_FILES).find(|n| !insert_before_extension(path, &format!(" ({})", n)).exists())
}

/// `path` itself if free, otherwise the first free ` (N)` variant.
pub fn uniquify_path(path: &Path) -> PathBuf {
    match unique_path_number(path) {
        Some(n) if n > 0 => insert_before_extension(path, &format!(" ({})", n)),
        _ => path.to_path_buf(),
    }
}
