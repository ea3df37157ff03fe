//! Source stream - one feed bound to one offset range of the destination

use crate::engine::feed::{ByteFeed, ReadyCallback, StreamState};
use resumedl_types::InterruptReason;

/// A feed writing into `[offset, offset + length)` of the destination file.
///
/// `length == None` means the stream runs to the end of the file. The length
/// may only shrink, and only through
/// [`truncate_length_with_written_data_block`](Self::truncate_length_with_written_data_block).
pub struct SourceStream {
    offset: u64,
    length: Option<u64>,
    bytes_written: u64,
    finished: bool,
    /// Index of the ledger slice this stream is extending, once it has written
    index: Option<usize>,
    feed: Option<Box<dyn ByteFeed>>,
}

impl SourceStream {
    pub fn new(offset: u64, length: Option<u64>, feed: Option<Box<dyn ByteFeed>>) -> Self {
        Self {
            offset,
            length,
            bytes_written: 0,
            finished: false,
            index: None,
            feed,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn set_index(&mut self, index: Option<usize>) {
        self.index = index;
    }

    pub fn has_feed(&self) -> bool {
        self.feed.is_some()
    }

    /// First byte this stream has not written yet.
    pub fn write_position(&self) -> u64 {
        self.offset + self.bytes_written
    }

    /// Bytes that may still be written before the declared length is reached.
    pub fn remaining(&self) -> Option<u64> {
        self.length.map(|length| length.saturating_sub(self.bytes_written))
    }

    pub fn on_write_bytes(&mut self, bytes: u64) {
        self.bytes_written += bytes;
    }

    /// Mark the stream finished and drop its feed, which stops the producer.
    pub fn finish(&mut self) {
        self.finished = true;
        self.clear_ready_callback();
        self.feed = None;
    }

    pub fn read(&mut self) -> StreamState {
        match self.feed.as_mut() {
            Some(feed) => feed.read(),
            None => StreamState::Complete,
        }
    }

    pub fn status(&self) -> Result<(), InterruptReason> {
        self.feed.as_ref().map_or(Ok(()), |feed| feed.status())
    }

    pub fn register_ready_callback(&mut self, callback: ReadyCallback) {
        if let Some(feed) = self.feed.as_mut() {
            feed.register_ready_callback(Some(callback));
        }
    }

    pub fn clear_ready_callback(&mut self) {
        if let Some(feed) = self.feed.as_mut() {
            feed.register_ready_callback(None);
        }
    }

    /// Shrink this stream after a sibling committed `[offset, offset + length)`.
    ///
    /// A block covering this stream's start finishes it outright. A block
    /// starting inside the stream's range caps the length at that block; if
    /// everything up to the new cap is already written the stream finishes.
    /// Returns true if the stream became finished.
    pub fn truncate_length_with_written_data_block(&mut self, offset: u64, length: u64) -> bool {
        if length == 0 || self.finished {
            return false;
        }

        if offset <= self.offset {
            if offset + length > self.offset {
                self.length = Some(self.bytes_written);
                self.finish();
                return true;
            }
            return false;
        }

        let cap = offset - self.offset;
        if self.length.map_or(true, |current| current > cap) {
            self.length = Some(cap);
        }

        if self.length.is_some_and(|length| self.bytes_written >= length) {
            self.finish();
            return true;
        }
        false
    }
}

impl std::fmt::Debug for SourceStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceStream")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("bytes_written", &self.bytes_written)
            .field("finished", &self.finished)
            .field("index", &self.index)
            .field("has_feed", &self.feed.is_some())
            .finish()
    }
}
