//! Base file - the destination file on disk
//!
//! All operations are synchronous and run on the writer context. Errors are
//! reported as `InterruptReason`s so they can flow straight into the job.

use crate::error::interrupt_reason_from_io;
use resumedl_types::InterruptReason;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

/// Moves a file from the first path to the second.
pub type FileMover = Arc<dyn Fn(&Path, &Path) -> io::Result<()> + Send + Sync>;

fn default_mover() -> FileMover {
    Arc::new(|from: &Path, to: &Path| std::fs::rename(from, to))
}

type FileResult<T = ()> = Result<T, InterruptReason>;

/// The destination file of a download
pub struct BaseFile {
    full_path: PathBuf,
    file: Option<File>,
    bytes_so_far: u64,
    /// Running digest; only kept for files written front to back
    secure_hash: Option<Sha256>,
    detached: bool,
    /// Set once initialized; cleared by detach, cancel or a lost handle
    valid: bool,
    mover: FileMover,
}

impl Default for BaseFile {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseFile {
    pub fn new() -> Self {
        Self::with_mover(default_mover())
    }

    /// Create a file whose renames go through `mover`.
    pub fn with_mover(mover: FileMover) -> Self {
        Self {
            full_path: PathBuf::new(),
            file: None,
            bytes_so_far: 0,
            secure_hash: None,
            detached: false,
            valid: false,
            mover,
        }
    }

    /// Open (or create) the destination and validate the existing prefix.
    ///
    /// With no `full_path` a fresh temporary file is created in
    /// `default_directory`. For non-sparse files the first `bytes_so_far`
    /// bytes are hashed (unless `hash_state` is supplied) and compared to
    /// `expected_hash`, and anything past `bytes_so_far` is discarded.
    pub fn initialize(
        &mut self,
        full_path: Option<&Path>,
        default_directory: &Path,
        bytes_so_far: u64,
        expected_hash: &[u8],
        hash_state: Option<Sha256>,
        is_sparse: bool,
    ) -> FileResult {
        self.full_path = match full_path {
            Some(path) if !path.as_os_str().is_empty() => path.to_path_buf(),
            _ => {
                std::fs::create_dir_all(default_directory).map_err(|e| self.log_error("create_dir", &e))?;
                default_directory.join(format!("download-{}.tmp", Uuid::new_v4()))
            }
        };
        self.bytes_so_far = bytes_so_far;
        self.secure_hash = if is_sparse { None } else { hash_state };

        self.open()?;

        let length = self.file_mut()?.metadata().map_err(|e| self.log_error("metadata", &e))?.len();
        if length < bytes_so_far {
            warn!(
                "File {:?} is {} bytes, expected at least {}",
                self.full_path, length, bytes_so_far
            );
            self.close();
            return Err(InterruptReason::FileTooShort);
        }

        if !is_sparse {
            if self.secure_hash.is_none() {
                self.secure_hash = Some(self.calculate_partial_hash(expected_hash)?);
            }
            if length > bytes_so_far {
                debug!("Truncating {:?} to {} bytes", self.full_path, bytes_so_far);
                self.file_mut()?
                    .set_len(bytes_so_far)
                    .map_err(|e| self.log_error("truncate", &e))?;
            }
        }

        self.valid = true;
        Ok(())
    }

    fn calculate_partial_hash(&mut self, expected_hash: &[u8]) -> FileResult<Sha256> {
        let mut hasher = Sha256::new();
        let to_read = self.bytes_so_far;
        if to_read > 0 {
            let file = self.file_mut()?;
            file.seek(SeekFrom::Start(0)).map_err(|e| interrupt_reason_from_io(&e))?;
            let mut remaining = to_read;
            let mut buffer = vec![0u8; 64 * 1024];
            while remaining > 0 {
                let chunk = remaining.min(buffer.len() as u64) as usize;
                file.read_exact(&mut buffer[..chunk]).map_err(|e| interrupt_reason_from_io(&e))?;
                hasher.update(&buffer[..chunk]);
                remaining -= chunk as u64;
            }
        }

        if !expected_hash.is_empty() && hasher.clone().finalize().as_slice() != expected_hash {
            warn!("Partial file {:?} does not match the expected hash", self.full_path);
            self.close();
            return Err(InterruptReason::FileHashMismatch);
        }
        Ok(hasher)
    }

    /// Write `data` at `offset`.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> FileResult {
        let file = self.file_mut()?;
        let result = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data));
        if let Err(e) = result {
            return Err(self.log_error("write", &e));
        }
        self.bytes_so_far += data.len() as u64;
        if let Some(hash) = self.secure_hash.as_mut() {
            hash.update(data);
        }
        Ok(())
    }

    /// Move the file to `new_path`, keeping it open for writing.
    ///
    /// If the move fails the file is reopened at its old path; should that
    /// fail too, the file is no longer in progress.
    pub fn rename(&mut self, new_path: &Path) -> FileResult {
        if new_path == self.full_path {
            return Ok(());
        }

        let was_in_progress = self.in_progress();
        self.close();

        let moved = (self.mover)(&self.full_path, new_path);
        let result = match moved {
            Ok(()) => {
                debug!("Renamed {:?} -> {:?}", self.full_path, new_path);
                self.full_path = new_path.to_path_buf();
                Ok(())
            }
            Err(e) => Err(self.log_error("rename", &e)),
        };

        if was_in_progress {
            let reopened = self.open();
            if reopened.is_err() {
                self.valid = false;
            }
            // A failed move takes precedence over the failed reopen.
            result?;
            reopened
        } else {
            result
        }
    }

    /// Record where the file came from. Nothing is written to the file
    /// system; the provenance is only logged.
    pub fn annotate_with_source_information(
        &self,
        client_guid: &str,
        source_url: Option<&Url>,
        referrer_url: Option<&Url>,
    ) -> FileResult {
        info!(
            "Annotated {:?} (client {}, source {}, referrer {})",
            self.full_path,
            client_guid,
            source_url.map_or("<none>", Url::as_str),
            referrer_url.map_or("<none>", Url::as_str),
        );
        Ok(())
    }

    /// Close the file and stop tracking it; the file stays on disk.
    pub fn detach(&mut self) {
        self.detached = true;
        self.valid = false;
        self.close();
    }

    /// Close and delete the file.
    pub fn cancel(&mut self) {
        self.valid = false;
        self.close();
        if self.full_path.as_os_str().is_empty() {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.full_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to delete {:?}: {}", self.full_path, e);
            }
        }
    }

    /// Close the file, handing back the digest state of the committed bytes.
    pub fn finish(&mut self) -> Option<Sha256> {
        self.close();
        self.secure_hash.take()
    }

    /// Copy the file to a fresh temporary path next to it.
    pub fn copy_to_temporary(&mut self) -> FileResult<PathBuf> {
        if let Some(file) = self.file.as_mut() {
            file.flush().map_err(|e| interrupt_reason_from_io(&e))?;
        }
        let directory = self.full_path.parent().unwrap_or_else(|| Path::new("."));
        let copy = directory.join(format!("download-{}.tmp", Uuid::new_v4()));
        std::fs::copy(&self.full_path, &copy).map_err(|e| self.log_error("copy", &e))?;
        Ok(copy)
    }

    pub fn full_path(&self) -> &Path {
        &self.full_path
    }

    pub fn bytes_so_far(&self) -> u64 {
        self.bytes_so_far
    }

    /// Whether the file is open for writing.
    pub fn in_progress(&self) -> bool {
        self.file.is_some()
    }

    /// Whether this object still owns a file, open or finished.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    fn open(&mut self) -> FileResult {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.full_path)
            .map_err(|e| self.log_error("open", &e))?;
        self.file = Some(file);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush() {
                warn!("Failed to flush {:?}: {}", self.full_path, e);
            }
        }
    }

    fn file_mut(&mut self) -> FileResult<&mut File> {
        self.file.as_mut().ok_or(InterruptReason::FileFailed)
    }

    fn log_error(&self, operation: &str, error: &io::Error) -> InterruptReason {
        let reason = interrupt_reason_from_io(error);
        warn!(
            "File operation {} on {:?} failed: {} ({})",
            operation,
            self.full_path,
            error,
            reason.as_str()
        );
        reason
    }
}

impl Drop for BaseFile {
    fn drop(&mut self) {
        if self.detached {
            self.close();
        } else if self.in_progress() {
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sha(data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    #[test]
    fn test_creates_temporary_file_in_default_directory() {
        let dir = TempDir::new().unwrap();
        let mut file = BaseFile::new();
        file.initialize(None, dir.path(), 0, &[], None, false).unwrap();
        assert!(file.in_progress());
        assert!(file.is_valid());
        assert_eq!(file.full_path().parent(), Some(dir.path()));
        assert!(file.full_path().exists());
        file.detach();
    }

    #[test]
    fn test_write_and_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let mut file = BaseFile::new();
        file.initialize(Some(&path), dir.path(), 0, &[], None, false).unwrap();
        file.write_at(0, b"hello ").unwrap();
        file.write_at(6, b"world").unwrap();
        assert_eq!(file.bytes_so_far(), 11);

        let hash = file.finish().unwrap();
        assert!(file.is_valid());
        assert!(!file.in_progress());
        assert_eq!(hash.finalize().to_vec(), sha(b"hello world"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn test_too_short_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"abc").unwrap();
        let mut file = BaseFile::new();
        let result = file.initialize(Some(&path), dir.path(), 10, &[], None, false);
        assert_eq!(result, Err(InterruptReason::FileTooShort));
    }

    #[test]
    fn test_partial_hash_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"abcdef").unwrap();

        let mut file = BaseFile::new();
        let result = file.initialize(Some(&path), dir.path(), 3, &sha(b"xyz"), None, false);
        assert_eq!(result, Err(InterruptReason::FileHashMismatch));

        let mut file = BaseFile::new();
        file.initialize(Some(&path), dir.path(), 3, &sha(b"abc"), None, false).unwrap();
        // Bytes past the verified prefix are discarded.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3);
        file.detach();
    }

    #[test]
    fn test_sparse_file_keeps_contents_and_skips_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sparse.bin");
        std::fs::write(&path, vec![7u8; 100]).unwrap();

        let mut file = BaseFile::new();
        file.initialize(Some(&path), dir.path(), 40, &sha(b"ignored"), None, true).unwrap();
        file.write_at(90, b"zz").unwrap();
        assert!(file.finish().is_none());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
    }

    #[test]
    fn test_rename_keeps_file_open() {
        let dir = TempDir::new().unwrap();
        let mut file = BaseFile::new();
        file.initialize(Some(&dir.path().join("a")), dir.path(), 0, &[], None, false).unwrap();
        file.write_at(0, b"1").unwrap();

        let target = dir.path().join("b");
        file.rename(&target).unwrap();
        assert_eq!(file.full_path(), target.as_path());
        assert!(file.in_progress());
        file.write_at(1, b"2").unwrap();
        file.detach();
        assert_eq!(std::fs::read(&target).unwrap(), b"12");
    }

    #[test]
    fn test_failed_rename_reopens_old_path() {
        let dir = TempDir::new().unwrap();
        let mover: FileMover = Arc::new(|_: &Path, _: &Path| -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Interrupted, "busy"))
        });
        let mut file = BaseFile::with_mover(mover);
        let original = dir.path().join("a");
        file.initialize(Some(&original), dir.path(), 0, &[], None, false).unwrap();

        let result = file.rename(&dir.path().join("b"));
        assert_eq!(result, Err(InterruptReason::FileTransientError));
        assert_eq!(file.full_path(), original.as_path());
        assert!(file.in_progress());
    }

    #[test]
    fn test_drop_deletes_unless_detached() {
        let dir = TempDir::new().unwrap();
        let kept = dir.path().join("kept");
        let deleted = dir.path().join("deleted");

        let mut file = BaseFile::new();
        file.initialize(Some(&kept), dir.path(), 0, &[], None, false).unwrap();
        file.detach();
        drop(file);

        let mut file = BaseFile::new();
        file.initialize(Some(&deleted), dir.path(), 0, &[], None, false).unwrap();
        drop(file);

        assert!(kept.exists());
        assert!(!deleted.exists());
    }
}
