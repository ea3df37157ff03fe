//! Byte feeds - inbound data sources drained by the writer
//!
//! Two kinds of feed exist:
//! - A pull-based byte stream (`ByteStreamWriter` / `ByteStreamReader`): the
//!   producer pushes buffers and finally closes with a status. The reader
//!   never sees a pending completion.
//! - A push-based data pipe (`DataPipeProducer` / `DataPipeConsumer`): the
//!   body channel can close before the request's final status is known,
//!   which surfaces as `StreamState::WaitForCompletion`.
//!
//! The writer only depends on the `ByteFeed` capability.

use bytes::Bytes;
use parking_lot::Mutex;
use resumedl_types::InterruptReason;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Result of a single read from a feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing available right now
    Empty,
    /// A buffer ready to be copied to disk
    HasData(Bytes),
    /// The producer closed the body, the final status is still pending
    WaitForCompletion,
    /// Drained; `ByteFeed::status` holds the final status
    Complete,
}

/// Callback fired whenever a feed may have become readable.
pub type ReadyCallback = Arc<dyn Fn() + Send + Sync>;

/// Capability shared by every inbound byte source.
pub trait ByteFeed: Send {
    /// Read the next buffer, if any.
    fn read(&mut self) -> StreamState;

    /// Install (or with `None`, clear) the readiness callback.
    fn register_ready_callback(&mut self, callback: Option<ReadyCallback>);

    /// Final status of the feed. Only meaningful after `StreamState::Complete`.
    fn status(&self) -> Result<(), InterruptReason>;
}

fn notify(callback: Option<ReadyCallback>) {
    if let Some(callback) = callback {
        callback();
    }
}

// ============================================================================
// Pull-based byte stream
// ============================================================================

#[derive(Default)]
struct ByteStreamShared {
    buffers: VecDeque<Bytes>,
    status: Option<Result<(), InterruptReason>>,
    callback: Option<ReadyCallback>,
}

/// Create a connected byte stream pair.
pub fn byte_stream() -> (ByteStreamWriter, ByteStreamReader) {
    let shared = Arc::new(Mutex::new(ByteStreamShared::default()));
    (
        ByteStreamWriter {
            shared: shared.clone(),
        },
        ByteStreamReader {
            shared,
            status: Ok(()),
        },
    )
}

/// Producer half of a byte stream
pub struct ByteStreamWriter {
    shared: Arc<Mutex<ByteStreamShared>>,
}

impl ByteStreamWriter {
    /// Queue a buffer. Returns false once the stream has been closed.
    pub fn write(&self, data: Bytes) -> bool {
        let callback = {
            let mut shared = self.shared.lock();
            if shared.status.is_some() {
                return false;
            }
            if data.is_empty() {
                return true;
            }
            shared.buffers.push_back(data);
            shared.callback.clone()
        };
        notify(callback);
        true
    }

    /// Close the stream with its final status.
    pub fn close(&self, status: Result<(), InterruptReason>) {
        let callback = {
            let mut shared = self.shared.lock();
            if shared.status.is_some() {
                return;
            }
            shared.status = Some(status);
            shared.callback.clone()
        };
        notify(callback);
    }
}

impl Drop for ByteStreamWriter {
    fn drop(&mut self) {
        // A producer vanishing mid-body is a broken connection.
        self.close(Err(InterruptReason::NetworkDisconnected));
    }
}

/// Consumer half of a byte stream
pub struct ByteStreamReader {
    shared: Arc<Mutex<ByteStreamShared>>,
    status: Result<(), InterruptReason>,
}

impl ByteFeed for ByteStreamReader {
    fn read(&mut self) -> StreamState {
        let mut shared = self.shared.lock();
        if let Some(data) = shared.buffers.pop_front() {
            return StreamState::HasData(data);
        }
        match shared.status {
            Some(status) => {
                self.status = status;
                StreamState::Complete
            }
            None => StreamState::Empty,
        }
    }

    fn register_ready_callback(&mut self, callback: Option<ReadyCallback>) {
        self.shared.lock().callback = callback;
    }

    fn status(&self) -> Result<(), InterruptReason> {
        self.status
    }
}

// ============================================================================
// Push-based data pipe
// ============================================================================

#[derive(Default)]
struct PipeShared {
    status: Option<Result<(), InterruptReason>>,
    callback: Option<ReadyCallback>,
}

/// Create a connected data pipe.
pub fn data_pipe() -> (DataPipeProducer, DataPipeConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Mutex::new(PipeShared::default()));
    (
        DataPipeProducer {
            body: Some(tx),
            shared: shared.clone(),
        },
        DataPipeConsumer {
            body: rx,
            shared,
            status: Ok(()),
        },
    )
}

/// Producer half of a data pipe
pub struct DataPipeProducer {
    body: Option<mpsc::UnboundedSender<Bytes>>,
    shared: Arc<Mutex<PipeShared>>,
}

impl DataPipeProducer {
    /// Push a body chunk. Returns false once the body has been closed or the
    /// consumer is gone.
    pub fn send(&self, data: Bytes) -> bool {
        let Some(body) = &self.body else {
            return false;
        };
        if data.is_empty() {
            return true;
        }
        if body.send(data).is_err() {
            return false;
        }
        let callback = self.shared.lock().callback.clone();
        notify(callback);
        true
    }

    /// Close the body without reporting a status yet.
    pub fn finish_body(&mut self) {
        if self.body.take().is_some() {
            let callback = self.shared.lock().callback.clone();
            notify(callback);
        }
    }

    /// Report the final status of the transfer. Implies `finish_body`.
    pub fn complete(&mut self, status: Result<(), InterruptReason>) {
        self.body.take();
        let callback = {
            let mut shared = self.shared.lock();
            if shared.status.is_some() {
                return;
            }
            shared.status = Some(status);
            shared.callback.clone()
        };
        notify(callback);
    }
}

impl Drop for DataPipeProducer {
    fn drop(&mut self) {
        self.complete(Err(InterruptReason::NetworkDisconnected));
    }
}

/// Consumer half of a data pipe
pub struct DataPipeConsumer {
    body: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Mutex<PipeShared>>,
    status: Result<(), InterruptReason>,
}

impl ByteFeed for DataPipeConsumer {
    fn read(&mut self) -> StreamState {
        match self.body.try_recv() {
            Ok(data) => StreamState::HasData(data),
            Err(TryRecvError::Empty) => StreamState::Empty,
            Err(TryRecvError::Disconnected) => match self.shared.lock().status {
                Some(status) => {
                    self.status = status;
                    StreamState::Complete
                }
                None => StreamState::WaitForCompletion,
            },
        }
    }

    fn register_ready_callback(&mut self, callback: Option<ReadyCallback>) {
        self.shared.lock().callback = callback;
    }

    fn status(&self) -> Result<(), InterruptReason> {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback() -> (ReadyCallback, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        let callback: ReadyCallback = Arc::new(move || {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (callback, count)
    }

    #[test]
    fn test_byte_stream_drains_then_completes() {
        let (writer, mut reader) = byte_stream();
        let (callback, fired) = counting_callback();
        reader.register_ready_callback(Some(callback));

        assert_eq!(reader.read(), StreamState::Empty);
        assert!(writer.write(Bytes::from_static(b"abc")));
        writer.close(Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        assert_eq!(reader.read(), StreamState::HasData(Bytes::from_static(b"abc")));
        assert_eq!(reader.read(), StreamState::Complete);
        assert_eq!(reader.status(), Ok(()));
        assert!(!writer.write(Bytes::from_static(b"late")));
    }

    #[test]
    fn test_byte_stream_writer_drop_is_an_error() {
        let (writer, mut reader) = byte_stream();
        drop(writer);
        assert_eq!(reader.read(), StreamState::Complete);
        assert_eq!(reader.status(), Err(InterruptReason::NetworkDisconnected));
    }

    #[test]
    fn test_data_pipe_waits_for_completion() {
        let (mut producer, mut consumer) = data_pipe();
        let (callback, fired) = counting_callback();
        consumer.register_ready_callback(Some(callback));

        assert!(producer.send(Bytes::from_static(b"xy")));
        producer.finish_body();
        assert_eq!(consumer.read(), StreamState::HasData(Bytes::from_static(b"xy")));
        assert_eq!(consumer.read(), StreamState::WaitForCompletion);

        producer.complete(Err(InterruptReason::ServerFailed));
        assert_eq!(consumer.read(), StreamState::Complete);
        assert_eq!(consumer.status(), Err(InterruptReason::ServerFailed));
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cleared_callback_is_not_fired() {
        let (writer, mut reader) = byte_stream();
        let (callback, fired) = counting_callback();
        reader.register_ready_callback(Some(callback));
        reader.register_ready_callback(None);
        writer.write(Bytes::from_static(b"z"));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
