//! Writer engine - drains byte feeds into the destination file
//!
//! Each download owns one writer context: a blocking task that processes
//! `WriterTask`s one at a time. The engine:
//! - Multiplexes one or more source streams into a single file
//! - Keeps the received-slice ledger for sparse (parallel) downloads
//! - Bounds the time a single stream may hold the context
//! - Retries transient rename failures with exponential backoff
//! - Reports progress and the final outcome through a `DestinationObserver`

use crate::engine::base_file::BaseFile;
use crate::engine::feed::{ByteFeed, StreamState};
use crate::engine::delegate::SaveInfo;
use crate::engine::observer::DestinationObserver;
use crate::engine::rename::{
    retry_delay_for_failed_rename, should_retry_failed_rename, uniquify_path, RenameCallback, RenameOption,
    RenameParameters,
};
use crate::engine::source_stream::SourceStream;
use crate::slices::{add_or_merge_received_slice_into_sorted_array, find_slices_to_download, slice_index_containing, total_received};
use resumedl_types::{EngineSettings, InterruptReason, ReceivedSlice};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Reply channel for tasks that hand a file path back to the job
pub type FileReply = oneshot::Sender<Result<PathBuf, InterruptReason>>;

/// Work items processed by a writer context
pub enum WriterTask {
    Initialize,
    /// A feed may have data; ignored if `generation` is stale
    StreamActive { offset: u64, generation: u64 },
    AddInputStream {
        offset: u64,
        length: Option<u64>,
        feed: Option<Box<dyn ByteFeed>>,
    },
    RenameAndUniquify {
        path: PathBuf,
        callback: RenameCallback,
    },
    RenameAndAnnotate {
        path: PathBuf,
        client_guid: String,
        source_url: Option<Url>,
        referrer_url: Option<Url>,
        callback: RenameCallback,
    },
    RetryRename {
        parameters: RenameParameters,
        generation: u64,
    },
    /// Deferred progress update for bytes written since the last one
    ProgressTimer { generation: u64 },
    /// Copy the file to a temporary path, leaving the download untouched
    CopyFile { reply: FileReply },
    /// Stop the context, deleting the file or leaving it on disk
    Release {
        destroy_file: bool,
        reply: Option<FileReply>,
    },
}

impl std::fmt::Debug for WriterTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriterTask::Initialize => f.write_str("Initialize"),
            WriterTask::StreamActive { offset, generation } => {
                write!(f, "StreamActive({}, gen {})", offset, generation)
            }
            WriterTask::AddInputStream { offset, length, .. } => {
                write!(f, "AddInputStream({}, {:?})", offset, length)
            }
            WriterTask::RenameAndUniquify { path, .. } => write!(f, "RenameAndUniquify({:?})", path),
            WriterTask::RenameAndAnnotate { path, .. } => write!(f, "RenameAndAnnotate({:?})", path),
            WriterTask::RetryRename { parameters, generation } => {
                write!(f, "RetryRename({:?}, gen {})", parameters.new_path, generation)
            }
            WriterTask::ProgressTimer { generation } => write!(f, "ProgressTimer(gen {})", generation),
            WriterTask::CopyFile { .. } => f.write_str("CopyFile"),
            WriterTask::Release { destroy_file, .. } => write!(f, "Release(destroy: {})", destroy_file),
        }
    }
}

/// Posts tasks back into a writer context without keeping it alive.
#[derive(Clone)]
pub struct WriterQueue {
    tx: mpsc::WeakUnboundedSender<WriterTask>,
    runtime: Option<Handle>,
}

impl WriterQueue {
    pub fn new(tx: mpsc::WeakUnboundedSender<WriterTask>, runtime: Option<Handle>) -> Self {
        Self { tx, runtime }
    }

    /// Queue `task`. Returns false if the context is gone.
    pub fn post(&self, task: WriterTask) -> bool {
        match self.tx.upgrade() {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        }
    }

    /// Queue `task` after `delay`.
    pub fn post_delayed(&self, task: WriterTask, delay: Duration) {
        let Some(runtime) = self.runtime.as_ref() else {
            warn!("No runtime for delayed {:?}, posting immediately", task);
            self.post(task);
            return;
        };
        let tx = self.tx.clone();
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(task);
            }
        });
    }
}

/// Timing knobs of a writer engine
#[derive(Debug, Clone)]
pub struct WriterSettings {
    pub max_time_blocking: Duration,
    pub update_period: Duration,
    pub max_rename_retries: u32,
    pub initial_rename_retry_delay: Duration,
}

impl From<&EngineSettings> for WriterSettings {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            max_time_blocking: settings.max_time_blocking_writer(),
            update_period: settings.update_period(),
            max_rename_retries: settings.max_rename_retries,
            initial_rename_retry_delay: settings.initial_rename_retry_delay(),
        }
    }
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

/// Bytes per second over the interval between two progress updates
struct RateEstimator {
    window_start: Instant,
    window_bytes: u64,
    last_rate: u64,
}

impl RateEstimator {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            window_bytes: 0,
            last_rate: 0,
        }
    }

    fn increment(&mut self, bytes: u64) {
        self.window_bytes += bytes;
    }

    fn since_last_sample(&self) -> Duration {
        self.window_start.elapsed()
    }

    /// Close the current window and return its rate.
    fn sample(&mut self) -> u64 {
        let elapsed = self.window_start.elapsed().as_secs_f64();
        if elapsed > 0.0 && self.window_bytes > 0 {
            self.last_rate = (self.window_bytes as f64 / elapsed) as u64;
        } else if self.window_bytes == 0 {
            self.last_rate = 0;
        }
        self.window_start = Instant::now();
        self.window_bytes = 0;
        self.last_rate
    }
}

/// Everything a writer context owns
pub struct WriterEngine {
    file: BaseFile,
    save_info: SaveInfo,
    default_directory: PathBuf,
    is_sparse: bool,
    /// Streams keyed by their starting offset
    source_streams: BTreeMap<u64, SourceStream>,
    /// Sorted, disjoint ranges already on disk (sparse files only)
    received_slices: Vec<ReceivedSlice>,
    observer: Box<dyn DestinationObserver>,
    queue: WriterQueue,
    settings: WriterSettings,
    /// Bumped on error and completion; stale self-posted tasks are dropped
    generation: u64,
    initialized: bool,
    rate: RateEstimator,
    /// A `ProgressTimer` is queued
    update_scheduled: bool,
    download_start: Option<Instant>,
}

impl WriterEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        save_info: SaveInfo,
        default_directory: PathBuf,
        feed: Option<Box<dyn ByteFeed>>,
        received_slices: Vec<ReceivedSlice>,
        is_sparse: bool,
        observer: Box<dyn DestinationObserver>,
        queue: WriterQueue,
        settings: WriterSettings,
    ) -> Self {
        let mut source_streams = BTreeMap::new();
        source_streams.insert(save_info.offset, SourceStream::new(save_info.offset, save_info.length, feed));
        Self {
            file: BaseFile::new(),
            save_info,
            default_directory,
            is_sparse,
            source_streams,
            received_slices,
            observer,
            queue,
            settings,
            generation: 0,
            initialized: false,
            rate: RateEstimator::new(),
            update_scheduled: false,
            download_start: None,
        }
    }

    /// Replace the destination file object before initialization.
    pub fn with_file(mut self, file: BaseFile) -> Self {
        self.file = file;
        self
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn received_slices(&self) -> &[ReceivedSlice] {
        &self.received_slices
    }

    pub fn source_streams(&self) -> impl Iterator<Item = &SourceStream> {
        self.source_streams.values()
    }

    /// Process one task. `Break` means the context should stop.
    pub fn handle(&mut self, task: WriterTask) -> ControlFlow<()> {
        trace!("Writer task {:?}", task);
        match task {
            WriterTask::Initialize => self.initialize(),
            WriterTask::StreamActive { offset, generation } => {
                if generation == self.generation {
                    self.stream_active(offset);
                }
            }
            WriterTask::AddInputStream { offset, length, feed } => self.add_input_stream(offset, length, feed),
            WriterTask::RenameAndUniquify { path, callback } => self.rename_and_uniquify(path, callback),
            WriterTask::RenameAndAnnotate {
                path,
                client_guid,
                source_url,
                referrer_url,
                callback,
            } => self.rename_and_annotate(path, client_guid, source_url, referrer_url, callback),
            WriterTask::RetryRename { parameters, generation } => {
                if generation == self.generation {
                    self.rename_with_retry(parameters);
                } else {
                    debug!("Dropping stale rename retry to {:?}", parameters.new_path);
                }
            }
            WriterTask::ProgressTimer { generation } => {
                self.update_scheduled = false;
                if generation == self.generation {
                    self.send_update();
                }
            }
            WriterTask::CopyFile { reply } => {
                let _ = reply.send(self.file.copy_to_temporary());
            }
            WriterTask::Release { destroy_file, reply } => {
                self.release(destroy_file, reply);
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Open the destination, then start draining every registered stream.
    pub fn initialize(&mut self) {
        if self.initialized {
            warn!("Writer for {:?} initialized twice", self.file.full_path());
            return;
        }

        let bytes_so_far = if self.is_sparse {
            total_received(&self.received_slices)
        } else {
            self.save_info.offset
        };
        let hash_state = self.save_info.hash_state.take();
        let result = self.file.initialize(
            self.save_info.file_path.as_deref(),
            &self.default_directory,
            bytes_so_far,
            &self.save_info.hash_of_partial_file,
            hash_state,
            self.is_sparse,
        );
        if let Err(reason) = result {
            warn!("Failed to initialize destination: {}", reason.as_str());
            self.observer.file_initialized(Err(reason));
            return;
        }

        info!(
            "Writing to {:?} from byte {} ({} streams, sparse: {})",
            self.file.full_path(),
            bytes_so_far,
            self.source_streams.len(),
            self.is_sparse
        );
        self.initialized = true;
        self.download_start = Some(Instant::now());
        self.send_update();
        self.observer.file_initialized(Ok(()));

        if !self.source_streams.values().any(SourceStream::has_feed) {
            warn!("No stream of {:?} has a feed", self.file.full_path());
            self.abort(None, InterruptReason::NetworkFailed);
            return;
        }

        let generation = self.generation;
        let offsets: Vec<u64> = self.source_streams.keys().copied().collect();
        for offset in offsets {
            // Stop once an earlier stream completed or failed the download.
            if self.generation != generation {
                break;
            }
            self.register_and_activate_stream(offset);
        }
    }

    /// Register an extra stream for `[offset, offset + length)`.
    pub fn add_input_stream(&mut self, offset: u64, length: Option<u64>, feed: Option<Box<dyn ByteFeed>>) {
        if self.source_streams.contains_key(&offset) {
            warn!("A stream at offset {} already exists", offset);
            return;
        }

        let mut stream = SourceStream::new(offset, length, feed);
        // Skip whatever an earlier attempt already saved.
        for slice in &self.received_slices {
            stream.truncate_length_with_written_data_block(slice.offset, slice.length);
        }
        debug!("Adding {:?}", stream);
        self.source_streams.insert(offset, stream);

        if self.initialized {
            self.register_and_activate_stream(offset);
        }
    }

    fn register_and_activate_stream(&mut self, offset: u64) {
        let queue = self.queue.clone();
        let generation = self.generation;
        let Some(stream) = self.source_streams.get_mut(&offset) else {
            return;
        };
        if stream.is_finished() {
            return;
        }
        if !stream.has_feed() {
            debug!("Stream at {} has no feed", offset);
            stream.finish();
            self.on_stream_finished();
            return;
        }
        stream.register_ready_callback(Arc::new(move || {
            queue.post(WriterTask::StreamActive { offset, generation });
        }));
        self.stream_active(offset);
    }

    /// Drain the stream at `offset` until it is empty, fails, finishes or
    /// has held the context for longer than the blocking budget.
    fn stream_active(&mut self, offset: u64) {
        let start = Instant::now();
        let mut state;
        let mut result: Result<(), InterruptReason> = Ok(());
        let mut should_terminate = false;
        let mut total_incoming = 0u64;
        let mut num_buffers = 0usize;
        let mut elapsed;

        loop {
            let Some(stream) = self.source_streams.get_mut(&offset) else {
                return;
            };
            if stream.is_finished() {
                return;
            }

            state = stream.read();
            match &state {
                StreamState::Empty | StreamState::WaitForCompletion => {}
                StreamState::HasData(data) => {
                    num_buffers += 1;
                    let mut len = data.len() as u64;
                    if let Some(remaining) = stream.remaining() {
                        if len >= remaining {
                            should_terminate = true;
                            len = remaining;
                        }
                    }
                    let position = stream.write_position();
                    result = self.write_data_to_file(position, &data[..len as usize]);
                    total_incoming += len;
                    if result.is_ok() {
                        if let Some(stream) = self.source_streams.get_mut(&offset) {
                            stream.on_write_bytes(len);
                        }
                        self.add_new_slice(position, len, offset);
                        self.maybe_send_periodic_update();
                    }
                }
                StreamState::Complete => {
                    result = stream.status();
                    self.send_update();
                }
            }

            elapsed = start.elapsed();
            let keep_going = matches!(state, StreamState::HasData(_))
                && result.is_ok()
                && elapsed <= self.settings.max_time_blocking
                && !should_terminate;
            if !keep_going {
                break;
            }
        }

        if matches!(state, StreamState::HasData(_))
            && result.is_ok()
            && !should_terminate
            && elapsed > self.settings.max_time_blocking
        {
            // Yield to other streams; pick up where we left off later.
            self.queue.post(WriterTask::StreamActive {
                offset,
                generation: self.generation,
            });
        }

        if total_incoming > 0 {
            trace!(
                "Stream {} wrote {} bytes in {} buffers over {:?}",
                offset,
                total_incoming,
                num_buffers,
                elapsed
            );
        }

        match result {
            Err(reason) => {
                warn!("Stream at {} failed: {}", offset, reason.as_str());
                self.abort(Some(offset), reason);
            }
            Ok(()) if matches!(state, StreamState::Complete) || should_terminate => {
                if let Some(stream) = self.source_streams.get_mut(&offset) {
                    stream.finish();
                }
                self.send_update();
                self.on_stream_finished();
            }
            Ok(()) => {}
        }
    }

    /// Complete the download, or fail it if every stream is done but the
    /// ledger still has a hole no stream will fill.
    fn on_stream_finished(&mut self) {
        if self.is_download_completed() {
            self.on_download_completed();
        } else if self.source_streams.values().all(SourceStream::is_finished) {
            warn!(
                "All streams of {:?} finished, {} bytes received, {} ranges missing",
                self.file.full_path(),
                total_received(&self.received_slices),
                find_slices_to_download(&self.received_slices).len()
            );
            self.abort(None, InterruptReason::NetworkFailed);
        }
    }

    fn write_data_to_file(&mut self, offset: u64, data: &[u8]) -> Result<(), InterruptReason> {
        self.rate.increment(data.len() as u64);
        self.file.write_at(offset, data)
    }

    /// Record `[position, position + len)` in the ledger and shrink every
    /// sibling stream that would otherwise overwrite it.
    fn add_new_slice(&mut self, position: u64, len: u64, writer_offset: u64) {
        if !self.is_sparse || len == 0 {
            return;
        }
        add_or_merge_received_slice_into_sorted_array(ReceivedSlice::new(position, len), &mut self.received_slices);

        for (&key, stream) in self.source_streams.iter_mut() {
            if key == writer_offset {
                continue;
            }
            if stream.truncate_length_with_written_data_block(position, len) {
                debug!("Stream at {} finished by data written from {}", key, writer_offset);
            }
        }

        for stream in self.source_streams.values_mut() {
            let index = if stream.bytes_written() > 0 {
                slice_index_containing(&self.received_slices, stream.offset())
            } else {
                None
            };
            stream.set_index(index);
        }
    }

    /// True once every stream has finished and, for sparse files, the ledger
    /// covers the file with a single trailing hole at most.
    pub fn is_download_completed(&self) -> bool {
        let mut stream_for_last_slice: Option<&SourceStream> = None;
        for stream in self.source_streams.values() {
            if stream.bytes_written() > 0
                && stream_for_last_slice.map_or(true, |last| stream.offset() >= last.offset())
            {
                stream_for_last_slice = Some(stream);
            }
            if !stream.is_finished() {
                return false;
            }
        }

        if !self.is_sparse {
            return true;
        }

        if find_slices_to_download(&self.received_slices).len() > 1 {
            return false;
        }

        let received = total_received(&self.received_slices);
        if self.save_info.total_bytes.is_some_and(|total| received >= total) {
            return true;
        }

        // The last slice must have been written by a stream that ran to EOF.
        stream_for_last_slice.map_or(true, |stream| stream.length().is_none())
    }

    fn on_download_completed(&mut self) {
        self.generation += 1;
        let hash_state = self.file.finish();
        let total_bytes = self.file.bytes_so_far();
        if let Some(start) = self.download_start {
            let elapsed = start.elapsed();
            info!(
                "Completed {:?}: {} bytes in {:.2}s",
                self.file.full_path(),
                total_bytes,
                elapsed.as_secs_f64()
            );
        }
        self.observer.destination_completed(total_bytes, hash_state);
    }

    fn abort(&mut self, offset: Option<u64>, reason: InterruptReason) {
        if let Some(stream) = offset.and_then(|offset| self.source_streams.get_mut(&offset)) {
            stream.clear_ready_callback();
        }
        self.generation += 1;
        self.send_update();
        let hash_state = self.file.finish();
        self.observer
            .destination_error(reason, self.file.bytes_so_far(), hash_state);
    }

    /// Report now if a period has passed, otherwise make sure a timer will.
    fn maybe_send_periodic_update(&mut self) {
        let since_last = self.rate.since_last_sample();
        if since_last >= self.settings.update_period {
            self.send_update();
        } else if !self.update_scheduled {
            self.update_scheduled = true;
            self.queue.post_delayed(
                WriterTask::ProgressTimer {
                    generation: self.generation,
                },
                self.settings.update_period - since_last,
            );
        }
    }

    fn send_update(&mut self) {
        let rate = self.rate.sample();
        self.observer
            .destination_update(self.file.bytes_so_far(), rate, self.received_slices.clone());
    }

    // ========================================================================
    // Renames
    // ========================================================================

    pub fn rename_and_uniquify(&mut self, path: PathBuf, callback: RenameCallback) {
        let parameters = RenameParameters::new(RenameOption::Uniquify, path, self.settings.max_rename_retries, callback);
        self.rename_with_retry(parameters);
    }

    pub fn rename_and_annotate(
        &mut self,
        path: PathBuf,
        client_guid: String,
        source_url: Option<Url>,
        referrer_url: Option<Url>,
        callback: RenameCallback,
    ) {
        let option = RenameOption::AnnotateWithSourceInformation {
            client_guid,
            source_url,
            referrer_url,
        };
        let parameters = RenameParameters::new(option, path, self.settings.max_rename_retries, callback);
        self.rename_with_retry(parameters);
    }

    fn rename_with_retry(&mut self, mut parameters: RenameParameters) {
        let mut new_path = parameters.new_path.clone();
        if parameters.option == RenameOption::Uniquify && new_path != self.file.full_path() {
            new_path = uniquify_path(&new_path);
        }

        let mut result = self.file.rename(&new_path);

        if let Err(reason) = result {
            if should_retry_failed_rename(reason) && self.file.is_valid() && parameters.retries_left > 0 {
                let attempt = self.settings.max_rename_retries - parameters.retries_left;
                parameters.retries_left -= 1;
                parameters.time_of_first_failure.get_or_insert_with(Instant::now);
                let delay = retry_delay_for_failed_rename(self.settings.initial_rename_retry_delay, attempt);
                debug!(
                    "Rename to {:?} failed ({}), retry {} in {:?}",
                    new_path,
                    reason.as_str(),
                    attempt + 1,
                    delay
                );
                self.queue.post_delayed(
                    WriterTask::RetryRename {
                        parameters,
                        generation: self.generation,
                    },
                    delay,
                );
                return;
            }
        }

        if let Some(first_failure) = parameters.time_of_first_failure {
            debug!(
                "Rename to {:?} settled {:?} after the first failure",
                new_path,
                first_failure.elapsed()
            );
        }

        if result.is_ok() {
            if let RenameOption::AnnotateWithSourceInformation {
                client_guid,
                source_url,
                referrer_url,
            } = &parameters.option
            {
                result = self
                    .file
                    .annotate_with_source_information(client_guid, source_url.as_ref(), referrer_url.as_ref());
            }
        }

        match result {
            Ok(()) => (parameters.callback)(Ok(new_path)),
            Err(reason) => {
                self.send_update();
                for stream in self.source_streams.values_mut() {
                    stream.clear_ready_callback();
                }
                (parameters.callback)(Err(reason));
            }
        }
    }

    fn release(&mut self, destroy_file: bool, reply: Option<FileReply>) {
        for stream in self.source_streams.values_mut() {
            stream.clear_ready_callback();
        }
        let path = self.file.full_path().to_path_buf();
        if destroy_file {
            debug!("Deleting {:?}", path);
            self.file.cancel();
        } else {
            debug!("Detaching {:?}", path);
            self.file.detach();
        }
        if let Some(reply) = reply {
            let _ = reply.send(Ok(path));
        }
    }
}

/// Owning end of a writer context. Dropping it stops the context once the
/// queued tasks are drained.
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<WriterTask>,
}

impl WriterHandle {
    /// Start a writer context on the blocking pool. `build` receives the
    /// queue the engine should use for self-posted tasks.
    pub fn spawn<F>(build: F) -> Self
    where
        F: FnOnce(WriterQueue) -> WriterEngine,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = WriterQueue::new(tx.downgrade(), Handle::try_current().ok());
        let engine = build(queue);
        tokio::task::spawn_blocking(move || run_writer(engine, rx));
        Self { tx }
    }

    pub fn post(&self, task: WriterTask) {
        if self.tx.send(task).is_err() {
            warn!("Writer context is gone");
        }
    }
}

fn run_writer(mut engine: WriterEngine, mut rx: mpsc::UnboundedReceiver<WriterTask>) {
    while let Some(task) = rx.blocking_recv() {
        if engine.handle(task).is_break() {
            break;
        }
    }
    debug!("Writer context for {:?} stopped", engine.file.full_path());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::base_file::FileMover;
    use crate::engine::feed::{byte_stream, data_pipe};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use sha2::{Digest, Sha256};
    use std::io;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Initialized(Result<(), InterruptReason>),
        Update(u64, Vec<ReceivedSlice>),
        Error(InterruptReason, u64),
        Completed(u64, Option<Vec<u8>>),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Seen>>>);

    impl Recorder {
        fn seen(&self) -> Vec<Seen> {
            self.0.lock().clone()
        }

        fn terminal(&self) -> Option<Seen> {
            self.seen()
                .into_iter()
                .find(|s| matches!(s, Seen::Error(..) | Seen::Completed(..)))
        }
    }

    impl DestinationObserver for Recorder {
        fn file_initialized(&self, result: Result<(), InterruptReason>) {
            self.0.lock().push(Seen::Initialized(result));
        }

        fn destination_update(&self, bytes_so_far: u64, _bytes_per_sec: u64, received_slices: Vec<ReceivedSlice>) {
            self.0.lock().push(Seen::Update(bytes_so_far, received_slices));
        }

        fn destination_error(&self, reason: InterruptReason, bytes_so_far: u64, _hash_state: Option<sha2::Sha256>) {
            self.0.lock().push(Seen::Error(reason, bytes_so_far));
        }

        fn destination_completed(&self, total_bytes: u64, hash_state: Option<sha2::Sha256>) {
            let hash = hash_state.map(|h| h.finalize().to_vec());
            self.0.lock().push(Seen::Completed(total_bytes, hash));
        }
    }

    struct Harness {
        engine: WriterEngine,
        /// Keeps the queue open for delayed posts
        _tx: mpsc::UnboundedSender<WriterTask>,
        rx: mpsc::UnboundedReceiver<WriterTask>,
        recorder: Recorder,
    }

    impl Harness {
        fn new(save_info: SaveInfo, dir: &Path, feed: Box<dyn ByteFeed>, is_sparse: bool, settings: WriterSettings) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let recorder = Recorder::default();
            let queue = WriterQueue::new(tx.downgrade(), Handle::try_current().ok());
            let engine = WriterEngine::new(
                save_info,
                dir.to_path_buf(),
                Some(feed),
                Vec::new(),
                is_sparse,
                Box::new(recorder.clone()),
                queue,
                settings,
            );
            Self {
                engine,
                _tx: tx,
                rx,
                recorder,
            }
        }

        /// Run every queued task, including ones queued while running.
        fn drain(&mut self) {
            while let Ok(task) = self.rx.try_recv() {
                if self.engine.handle(task).is_break() {
                    break;
                }
            }
        }
    }

    fn save_info_at(path: &Path, offset: u64, length: Option<u64>) -> SaveInfo {
        SaveInfo {
            file_path: Some(path.to_path_buf()),
            offset,
            length,
            ..Default::default()
        }
    }

    #[test]
    fn test_single_stream_completes_with_hash() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("single.bin");
        let (writer, reader) = byte_stream();
        let mut harness = Harness::new(save_info_at(&path, 0, None), dir.path(), Box::new(reader), false, WriterSettings::default());

        harness.engine.initialize();
        assert_eq!(harness.recorder.seen()[1], Seen::Initialized(Ok(())));

        writer.write(Bytes::from_static(b"hello "));
        writer.write(Bytes::from_static(b"world"));
        writer.close(Ok(()));
        harness.drain();

        let expected = Sha256::digest(b"hello world").to_vec();
        assert_eq!(harness.recorder.terminal(), Some(Seen::Completed(11, Some(expected))));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn test_feed_error_is_reported_with_progress() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.bin");
        let (writer, reader) = byte_stream();
        let mut harness = Harness::new(save_info_at(&path, 0, None), dir.path(), Box::new(reader), false, WriterSettings::default());

        harness.engine.initialize();
        writer.write(Bytes::from(vec![1u8; 64]));
        drop(writer);
        harness.drain();

        assert_eq!(
            harness.recorder.terminal(),
            Some(Seen::Error(InterruptReason::NetworkDisconnected, 64))
        );
    }

    #[test]
    fn test_too_short_partial_file_fails_initialization() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"abc").unwrap();
        let (_writer, reader) = byte_stream();
        let mut harness = Harness::new(save_info_at(&path, 10, None), dir.path(), Box::new(reader), false, WriterSettings::default());

        harness.engine.initialize();
        assert_eq!(
            harness.recorder.seen(),
            vec![Seen::Initialized(Err(InterruptReason::FileTooShort))]
        );
    }

    #[test]
    fn test_length_limits_stream() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("limited.bin");
        let (writer, reader) = byte_stream();
        let mut harness = Harness::new(save_info_at(&path, 0, Some(4)), dir.path(), Box::new(reader), false, WriterSettings::default());

        harness.engine.initialize();
        writer.write(Bytes::from_static(b"abcdefgh"));
        harness.drain();

        assert!(matches!(harness.recorder.terminal(), Some(Seen::Completed(4, _))));
        assert_eq!(std::fs::read(&path).unwrap(), b"abcd");
    }

    #[test]
    fn test_zero_blocking_budget_still_drains_everything() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("budget.bin");
        let (writer, reader) = byte_stream();
        let settings = WriterSettings {
            max_time_blocking: Duration::ZERO,
            ..WriterSettings::default()
        };
        let mut harness = Harness::new(save_info_at(&path, 0, None), dir.path(), Box::new(reader), false, settings);

        harness.engine.initialize();
        for _ in 0..10 {
            writer.write(Bytes::from(vec![9u8; 100]));
        }
        writer.close(Ok(()));
        harness.drain();

        assert!(matches!(harness.recorder.terminal(), Some(Seen::Completed(1000, _))));
    }

    #[test]
    fn test_two_streams_fill_file_in_parallel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("parallel.bin");
        let content: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();

        let (first_writer, first_reader) = byte_stream();
        let mut harness = Harness::new(save_info_at(&path, 0, None), dir.path(), Box::new(first_reader), true, WriterSettings::default());
        let (mut second_producer, second_consumer) = data_pipe();
        harness.engine.add_input_stream(500, None, Some(Box::new(second_consumer)));
        harness.engine.initialize();

        // The second stream writes its first chunk: the first stream is now
        // capped at 500 bytes.
        second_producer.send(Bytes::copy_from_slice(&content[500..750]));
        harness.drain();
        assert_eq!(
            harness.engine.source_streams().next().unwrap().length(),
            Some(500)
        );

        first_writer.write(Bytes::copy_from_slice(&content[..500]));
        second_producer.send(Bytes::copy_from_slice(&content[750..]));
        harness.drain();
        assert_eq!(harness.recorder.terminal(), None);

        second_producer.complete(Ok(()));
        harness.drain();

        assert_eq!(harness.recorder.terminal(), Some(Seen::Completed(1000, None)));
        assert_eq!(harness.engine.received_slices(), &[ReceivedSlice::new(0, 1000)]);
        assert_eq!(std::fs::read(&path).unwrap(), content);
        drop(first_writer);
    }

    #[test]
    fn test_sibling_without_feed_fails_instead_of_stalling() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hole.bin");
        let (writer, reader) = byte_stream();
        let mut harness = Harness::new(save_info_at(&path, 0, Some(500)), dir.path(), Box::new(reader), true, WriterSettings::default());
        harness.engine.add_input_stream(500, None, None);
        harness.engine.initialize();

        writer.write(Bytes::from(vec![3u8; 500]));
        writer.close(Ok(()));
        harness.drain();

        assert_eq!(harness.recorder.terminal(), Some(Seen::Error(InterruptReason::NetworkFailed, 500)));
        assert_eq!(harness.engine.received_slices(), &[ReceivedSlice::new(0, 500)]);
    }

    #[test]
    fn test_short_sibling_fails_with_partial_ledger() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short_sibling.bin");
        let (first_writer, first_reader) = byte_stream();
        let save_info = SaveInfo {
            total_bytes: Some(1000),
            ..save_info_at(&path, 0, Some(500))
        };
        let mut harness = Harness::new(save_info, dir.path(), Box::new(first_reader), true, WriterSettings::default());
        let (second_writer, second_reader) = byte_stream();
        harness.engine.add_input_stream(500, Some(500), Some(Box::new(second_reader)));
        harness.engine.initialize();

        first_writer.write(Bytes::from(vec![1u8; 500]));
        first_writer.close(Ok(()));
        second_writer.write(Bytes::from(vec![2u8; 100]));
        second_writer.close(Ok(()));
        harness.drain();

        assert_eq!(harness.recorder.terminal(), Some(Seen::Error(InterruptReason::NetworkFailed, 600)));
        assert_eq!(harness.engine.received_slices(), &[ReceivedSlice::new(0, 600)]);
    }

    #[test]
    fn test_bounded_streams_covering_total_complete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bounded.bin");
        let (first_writer, first_reader) = byte_stream();
        let save_info = SaveInfo {
            total_bytes: Some(1000),
            ..save_info_at(&path, 0, Some(500))
        };
        let mut harness = Harness::new(save_info, dir.path(), Box::new(first_reader), true, WriterSettings::default());
        let (second_writer, second_reader) = byte_stream();
        harness.engine.add_input_stream(500, Some(500), Some(Box::new(second_reader)));
        harness.engine.initialize();

        second_writer.write(Bytes::from(vec![2u8; 500]));
        second_writer.close(Ok(()));
        harness.drain();
        assert_eq!(harness.recorder.terminal(), None);

        first_writer.write(Bytes::from(vec![1u8; 500]));
        first_writer.close(Ok(()));
        harness.drain();

        assert_eq!(harness.recorder.terminal(), Some(Seen::Completed(1000, None)));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1000);
    }

    #[test]
    fn test_stream_starting_inside_received_data_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("skip.bin");
        let (_writer, reader) = byte_stream();
        let mut harness = Harness::new(save_info_at(&path, 0, None), dir.path(), Box::new(reader), true, WriterSettings::default());
        harness.engine.received_slices = vec![ReceivedSlice::new(100, 50)];

        let (_extra_writer, extra_reader) = byte_stream();
        harness.engine.add_input_stream(120, None, Some(Box::new(extra_reader)));
        let extra = harness.engine.source_streams.get(&120).unwrap();
        assert!(extra.is_finished());
        assert_eq!(harness.engine.source_streams.get(&0).unwrap().length(), None);
    }

    #[test]
    fn test_no_feed_at_all_is_a_network_failure() {
        let dir = TempDir::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let recorder = Recorder::default();
        let mut engine = WriterEngine::new(
            save_info_at(&dir.path().join("none.bin"), 0, None),
            dir.path().to_path_buf(),
            None,
            Vec::new(),
            false,
            Box::new(recorder.clone()),
            WriterQueue::new(tx.downgrade(), None),
            WriterSettings::default(),
        );
        engine.initialize();
        assert_eq!(recorder.terminal(), Some(Seen::Error(InterruptReason::NetworkFailed, 0)));
    }

    #[test]
    fn test_release_detaches_and_reports_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kept.bin");
        let (_writer, reader) = byte_stream();
        let mut harness = Harness::new(save_info_at(&path, 0, None), dir.path(), Box::new(reader), false, WriterSettings::default());
        harness.engine.initialize();

        let (reply_tx, mut reply_rx) = oneshot::channel();
        let flow = harness.engine.handle(WriterTask::Release {
            destroy_file: false,
            reply: Some(reply_tx),
        });
        assert!(flow.is_break());
        assert_eq!(reply_rx.try_recv().unwrap(), Ok(path.clone()));
        drop(harness);
        assert!(path.exists());
    }

    fn flaky_mover(failures: usize) -> (FileMover, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let mover: FileMover = Arc::new(move |from: &Path, to: &Path| -> io::Result<()> {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            if attempt < failures {
                Err(io::Error::new(io::ErrorKind::Interrupted, "file busy"))
            } else {
                std::fs::rename(from, to)
            }
        });
        (mover, attempts)
    }

    type RenameSlot = Arc<Mutex<Option<Result<PathBuf, InterruptReason>>>>;

    fn rename_slot() -> (RenameSlot, RenameCallback) {
        let slot: RenameSlot = Arc::default();
        let inner = slot.clone();
        (slot, Box::new(move |result| *inner.lock() = Some(result)))
    }

    fn assert_delay(elapsed: Duration, expected_ms: u64) {
        let expected = Duration::from_millis(expected_ms);
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(20),
            "expected ~{:?}, waited {:?}",
            expected,
            elapsed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_rename_failures_back_off_then_succeed() {
        let dir = TempDir::new().unwrap();
        let (_writer, reader) = byte_stream();
        let mut harness = Harness::new(
            save_info_at(&dir.path().join("a.bin"), 0, None),
            dir.path(),
            Box::new(reader),
            false,
            WriterSettings::default(),
        );
        let (mover, attempts) = flaky_mover(2);
        harness.engine = harness.engine.with_file(BaseFile::with_mover(mover));
        harness.engine.initialize();

        let target = dir.path().join("b.bin");
        let (slot, callback) = rename_slot();
        harness.engine.rename_and_uniquify(target.clone(), callback);
        assert!(slot.lock().is_none());

        for expected_ms in [200, 400] {
            let started = tokio::time::Instant::now();
            let task = harness.rx.recv().await.unwrap();
            assert_delay(started.elapsed(), expected_ms);
            let _ = harness.engine.handle(task);
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(slot.lock().clone(), Some(Ok(target.clone())));
        assert!(target.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_gives_up_after_max_retries() {
        let dir = TempDir::new().unwrap();
        let (_writer, reader) = byte_stream();
        let (mover, attempts) = flaky_mover(usize::MAX);
        let mut harness = Harness::new(
            save_info_at(&dir.path().join("a.bin"), 0, None),
            dir.path(),
            Box::new(reader),
            false,
            WriterSettings::default(),
        );
        harness.engine.file = BaseFile::with_mover(mover);
        harness.engine.initialize();

        let (slot, callback) = rename_slot();
        harness.engine.rename_and_uniquify(dir.path().join("b.bin"), callback);

        for expected_ms in [200, 400, 800] {
            let started = tokio::time::Instant::now();
            let task = harness.rx.recv().await.unwrap();
            assert_delay(started.elapsed(), expected_ms);
            let _ = harness.engine.handle(task);
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(slot.lock().clone(), Some(Err(InterruptReason::FileTransientError)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(harness.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_reported_without_further_writes() {
        let dir = TempDir::new().unwrap();
        let (writer, reader) = byte_stream();
        let mut harness = Harness::new(
            save_info_at(&dir.path().join("quiet.bin"), 0, None),
            dir.path(),
            Box::new(reader),
            false,
            WriterSettings::default(),
        );
        harness.engine.initialize();

        writer.write(Bytes::from_static(b"hello"));
        harness.drain();
        assert_ne!(harness.recorder.seen().last(), Some(&Seen::Update(5, Vec::new())));

        // The stream stays open and silent; the timer reports the bytes.
        let task = harness.rx.recv().await.unwrap();
        assert!(matches!(task, WriterTask::ProgressTimer { .. }));
        let _ = harness.engine.handle(task);
        assert_eq!(harness.recorder.seen().last(), Some(&Seen::Update(5, Vec::new())));
        assert_eq!(harness.recorder.terminal(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_rename_retry_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (writer, reader) = byte_stream();
        let (mover, attempts) = flaky_mover(1);
        let mut harness = Harness::new(
            save_info_at(&dir.path().join("a.bin"), 0, None),
            dir.path(),
            Box::new(reader),
            false,
            WriterSettings::default(),
        );
        harness.engine.file = BaseFile::with_mover(mover);
        harness.engine.initialize();

        let (slot, callback) = rename_slot();
        harness.engine.rename_and_uniquify(dir.path().join("b.bin"), callback);

        // A stream error invalidates pending retries.
        drop(writer);
        harness.drain();
        assert_eq!(
            harness.recorder.terminal(),
            Some(Seen::Error(InterruptReason::NetworkDisconnected, 0))
        );

        let task = harness.rx.recv().await.unwrap();
        let _ = harness.engine.handle(task);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(slot.lock().is_none());
    }
}
