//! Messages flowing from writer contexts and delegates into the control context
//!
//! Every message carries a `CallbackToken`. A job bumps its generation when it
//! drops its writer or starts a resumption, which turns every message issued
//! before that point into a stale one that is silently discarded.

use crate::engine::delegate::TargetDecision;
use crate::engine::rename::RenameCallback;
use resumedl_types::{InterruptReason, ReceivedSlice};
use sha2::Sha256;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::debug;

/// Identifies the job (and the incarnation of its callbacks) a message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackToken {
    pub download_id: u32,
    pub generation: u64,
}

/// Asynchronous results delivered to a job
pub enum JobEvent {
    FileInitialized(Result<(), InterruptReason>),
    DestinationUpdate {
        bytes_so_far: u64,
        bytes_per_sec: u64,
        received_slices: Vec<ReceivedSlice>,
    },
    DestinationError {
        reason: InterruptReason,
        bytes_so_far: u64,
        hash_state: Option<Sha256>,
    },
    DestinationCompleted {
        total_bytes: u64,
        hash_state: Option<Sha256>,
    },
    RenamedToIntermediateName(Result<PathBuf, InterruptReason>),
    RenamedToFinalName(Result<PathBuf, InterruptReason>),
    TargetDetermined(TargetDecision),
    /// The delegate is ready to let the download complete
    CompletionReady,
    DelayedOpened {
        auto_opened: bool,
    },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::FileInitialized(_) => "file_initialized",
            JobEvent::DestinationUpdate { .. } => "destination_update",
            JobEvent::DestinationError { .. } => "destination_error",
            JobEvent::DestinationCompleted { .. } => "destination_completed",
            JobEvent::RenamedToIntermediateName(_) => "renamed_to_intermediate_name",
            JobEvent::RenamedToFinalName(_) => "renamed_to_final_name",
            JobEvent::TargetDetermined(_) => "target_determined",
            JobEvent::CompletionReady => "completion_ready",
            JobEvent::DelayedOpened { .. } => "delayed_opened",
        }
    }
}

impl std::fmt::Debug for JobEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A job event addressed to a specific job incarnation
#[derive(Debug)]
pub struct ControlMessage {
    pub token: CallbackToken,
    pub event: JobEvent,
}

/// Posts events for one job incarnation into the control context.
#[derive(Clone)]
pub struct ControlPoster {
    token: CallbackToken,
    tx: mpsc::UnboundedSender<ControlMessage>,
}

impl ControlPoster {
    pub fn new(token: CallbackToken, tx: mpsc::UnboundedSender<ControlMessage>) -> Self {
        Self { token, tx }
    }

    pub fn token(&self) -> CallbackToken {
        self.token
    }

    pub fn post(&self, event: JobEvent) {
        if let Err(e) = self.tx.send(ControlMessage {
            token: self.token,
            event,
        }) {
            debug!(
                "Control context gone, dropping {} for download {}",
                e.0.event.name(),
                self.token.download_id
            );
        }
    }

    /// Wrap a rename completion into a job event.
    pub fn rename_callback(&self, wrap: fn(Result<PathBuf, InterruptReason>) -> JobEvent) -> RenameCallback {
        let poster = self.clone();
        Box::new(move |result| poster.post(wrap(result)))
    }
}

/// Receives progress and the final outcome from a writer engine.
pub trait DestinationObserver: Send {
    fn file_initialized(&self, result: Result<(), InterruptReason>);

    fn destination_update(&self, bytes_so_far: u64, bytes_per_sec: u64, received_slices: Vec<ReceivedSlice>);

    fn destination_error(&self, reason: InterruptReason, bytes_so_far: u64, hash_state: Option<Sha256>);

    fn destination_completed(&self, total_bytes: u64, hash_state: Option<Sha256>);
}

impl DestinationObserver for ControlPoster {
    fn file_initialized(&self, result: Result<(), InterruptReason>) {
        self.post(JobEvent::FileInitialized(result));
    }

    fn destination_update(&self, bytes_so_far: u64, bytes_per_sec: u64, received_slices: Vec<ReceivedSlice>) {
        self.post(JobEvent::DestinationUpdate {
            bytes_so_far,
            bytes_per_sec,
            received_slices,
        });
    }

    fn destination_error(&self, reason: InterruptReason, bytes_so_far: u64, hash_state: Option<Sha256>) {
        self.post(JobEvent::DestinationError {
            reason,
            bytes_so_far,
            hash_state,
        });
    }

    fn destination_completed(&self, total_bytes: u64, hash_state: Option<Sha256>) {
        self.post(JobEvent::DestinationCompleted {
            total_bytes,
            hash_state,
        });
    }
}
