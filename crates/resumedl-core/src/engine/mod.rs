//! Download Engine
//!
//! Bytes flow from network feeds through a writer context into one
//! destination file; a job per download drives the lifecycle:
//! - Parallel streams into a single sparse file, with a ledger of saved ranges
//! - Time-boxed writer contexts on the blocking pool
//! - Renames retried with backoff on transient errors
//! - Interruption classified into a resume policy
//! - History persisted in SQLite

mod base_file;
mod delegate;
mod feed;
mod http;
mod job;
mod manager;
mod observer;
mod persistence;
mod record;
mod rename;
mod resume;
mod source_stream;
mod writer;

pub use base_file::*;
pub use delegate::*;
pub use feed::*;
pub use http::*;
pub use job::*;
pub use manager::*;
pub use observer::*;
pub use persistence::*;
pub use record::*;
pub use rename::*;
pub use resume::*;
pub use source_stream::*;
pub use writer::*;
