//! Download Manager - the control context
//!
//! A single task owns every download record and processes, one at a time:
//! - Commands from `DownloadManagerHandle` (create, pause, resume, cancel, ...)
//! - Results posted back by writer contexts and delegates
//!
//! Nothing here blocks; file I/O happens on the writer contexts.

use crate::engine::delegate::{DownloadAttempt, DownloadDelegate};
use crate::engine::job::{AcquiredFile, DownloadJob, JobContext};
use crate::engine::observer::ControlMessage;
use crate::engine::record::DownloadRecord;
use crate::error::EngineError;
use resumedl_types::{CoreEvent, DownloadSnapshot, DownloadState, EngineSettings, RequestInfo};
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Operations on a single download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobAction {
    Pause,
    Resume,
    Cancel,
    Remove,
    ValidateDangerous,
    Open,
}

enum Command {
    Create {
        request: RequestInfo,
        attempt: DownloadAttempt,
        reply: Reply<u32>,
    },
    Attach {
        id: u32,
        attempt: DownloadAttempt,
    },
    Act {
        id: u32,
        action: JobAction,
        reply: Reply<()>,
    },
    Steal {
        id: u32,
        delete_after: bool,
        reply: Reply<PathBuf>,
    },
    DeleteFile {
        id: u32,
        reply: Reply<bool>,
    },
    Snapshot {
        id: u32,
        reply: Reply<DownloadSnapshot>,
    },
    List {
        reply: oneshot::Sender<Vec<DownloadSnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable entry point into the control context
#[derive(Clone)]
pub struct DownloadManagerHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<CoreEvent>,
}

impl DownloadManagerHandle {
    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Register a new download and bind its first attempt. Returns the id.
    pub async fn create(&self, request: RequestInfo, attempt: DownloadAttempt) -> Result<u32, EngineError> {
        self.call(|reply| Command::Create {
            request,
            attempt,
            reply,
        })
        .await
    }

    /// Bind a resumption attempt to an existing download. Safe to call from
    /// delegate callbacks.
    pub fn attach(&self, id: u32, attempt: DownloadAttempt) {
        if self.commands.send(Command::Attach { id, attempt }).is_err() {
            debug!("Manager gone, dropping attempt for download {}", id);
        }
    }

    pub async fn pause(&self, id: u32) -> Result<(), EngineError> {
        self.act(id, JobAction::Pause).await
    }

    pub async fn resume(&self, id: u32) -> Result<(), EngineError> {
        self.act(id, JobAction::Resume).await
    }

    pub async fn cancel(&self, id: u32) -> Result<(), EngineError> {
        self.act(id, JobAction::Cancel).await
    }

    /// Cancel the download and forget it.
    pub async fn remove(&self, id: u32) -> Result<(), EngineError> {
        self.act(id, JobAction::Remove).await
    }

    pub async fn validate_dangerous(&self, id: u32) -> Result<(), EngineError> {
        self.act(id, JobAction::ValidateDangerous).await
    }

    /// Open the finished file, or toggle opening on completion.
    pub async fn open(&self, id: u32) -> Result<(), EngineError> {
        self.act(id, JobAction::Open).await
    }

    /// Take the file of a dangerous download. See
    /// `DownloadJob::steal_dangerous_download`.
    pub async fn steal_dangerous(&self, id: u32, delete_after: bool) -> Result<PathBuf, EngineError> {
        self.call(|reply| Command::Steal {
            id,
            delete_after,
            reply,
        })
        .await
    }

    pub async fn delete_file(&self, id: u32) -> Result<bool, EngineError> {
        self.call(|reply| Command::DeleteFile { id, reply }).await
    }

    pub async fn snapshot(&self, id: u32) -> Result<DownloadSnapshot, EngineError> {
        self.call(|reply| Command::Snapshot { id, reply }).await
    }

    pub async fn list(&self) -> Result<Vec<DownloadSnapshot>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::List { reply: tx })
            .map_err(|_| EngineError::ManagerClosed)?;
        rx.await.map_err(|_| EngineError::ManagerClosed)
    }

    /// Cancel running downloads and stop the control context.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { reply: tx })
            .map_err(|_| EngineError::ManagerClosed)?;
        rx.await.map_err(|_| EngineError::ManagerClosed)
    }

    async fn act(&self, id: u32, action: JobAction) -> Result<(), EngineError> {
        self.call(|reply| Command::Act { id, action, reply }).await
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(build(tx)).map_err(|_| EngineError::ManagerClosed)?;
        rx.await.map_err(|_| EngineError::ManagerClosed)?
    }
}

/// Owner of all download records
pub struct DownloadManager {
    records: BTreeMap<u32, DownloadRecord>,
    next_id: u32,
    delegate: Arc<dyn DownloadDelegate>,
    settings: EngineSettings,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    control_rx: mpsc::UnboundedReceiver<ControlMessage>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<CoreEvent>,
}

impl DownloadManager {
    /// Start the control context.
    ///
    /// `history` seeds the manager with previously stored downloads.
    /// `make_delegate` receives a handle so the delegate can attach resumed
    /// attempts.
    pub fn spawn<F>(
        settings: EngineSettings,
        history: Vec<DownloadSnapshot>,
        make_delegate: F,
    ) -> (DownloadManagerHandle, JoinHandle<()>)
    where
        F: FnOnce(DownloadManagerHandle) -> Arc<dyn DownloadDelegate>,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1000);
        let handle = DownloadManagerHandle {
            commands: command_tx,
            events: events.clone(),
        };

        let mut manager = Self {
            records: BTreeMap::new(),
            next_id: 1,
            delegate: make_delegate(handle.clone()),
            settings,
            control_tx,
            control_rx,
            commands: command_rx,
            events,
        };
        manager.restore(history);

        let task = tokio::spawn(manager.run());
        (handle, task)
    }

    fn restore(&mut self, history: Vec<DownloadSnapshot>) {
        for snapshot in history {
            match DownloadRecord::from_snapshot(&snapshot) {
                Some(record) => {
                    self.next_id = self.next_id.max(record.id() + 1);
                    self.records.insert(record.id(), record);
                }
                None => warn!("Skipping stored download {} without a URL", snapshot.guid),
            }
        }
        if !self.records.is_empty() {
            info!("Restored {} downloads from history", self.records.len());
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(message) = self.control_rx.recv() => self.dispatch(message),
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command).is_break() {
                            break;
                        }
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
            }
        }
        info!("Download manager stopped");
    }

    fn dispatch(&mut self, message: ControlMessage) {
        let ControlMessage { token, event } = message;
        let id = token.download_id;
        if self
            .with_job(id, |job, cx| job.handle_event(token, event, cx))
            .is_err()
        {
            debug!("No job for message to download {}", id);
        }
        self.prune(id);
    }

    /// Process one command. `Break` stops the control context.
    fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Create {
                request,
                attempt,
                reply,
            } => {
                let id = self.next_id;
                self.next_id += 1;
                let mut record = DownloadRecord::new(id, request);
                record.assign_job(DownloadJob::new());
                info!("Created download {} for {:?}", id, record.info().request.url().map(|u| u.as_str()));
                let _ = self.events.send(CoreEvent::DownloadCreated {
                    download: record.snapshot(),
                });
                self.records.insert(id, record);
                let result = self.with_job(id, |job, cx| job.on_attached(attempt, cx)).map(|_| id);
                let _ = reply.send(result);
            }
            Command::Attach { id, attempt } => {
                if let Err(e) = self.with_job(id, |job, cx| job.on_attached(attempt, cx)) {
                    warn!("Cannot attach attempt: {}", e);
                }
            }
            Command::Act { id, action, reply } => {
                let result = self.with_job(id, |job, cx| match action {
                    JobAction::Pause => job.pause(cx),
                    JobAction::Resume => job.resume(cx),
                    JobAction::Cancel => job.cancel(true, cx),
                    JobAction::Remove => job.remove(cx),
                    JobAction::ValidateDangerous => job.validate_dangerous_download(cx),
                    JobAction::Open => job.open_download(cx),
                });
                let _ = reply.send(result);
                self.prune(id);
            }
            Command::Steal {
                id,
                delete_after,
                reply,
            } => {
                let acquired = self
                    .with_job(id, |job, cx| job.steal_dangerous_download(delete_after, cx))
                    .and_then(|result| result);
                self.prune(id);
                match acquired {
                    Ok(AcquiredFile::Ready(path)) => {
                        let _ = reply.send(Ok(path));
                    }
                    Ok(AcquiredFile::Pending(rx)) => {
                        tokio::spawn(async move {
                            let result = match rx.await {
                                Ok(Ok(path)) => Ok(path),
                                Ok(Err(reason)) => Err(EngineError::Interrupted(reason)),
                                Err(_) => Err(EngineError::ManagerClosed),
                            };
                            let _ = reply.send(result);
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::DeleteFile { id, reply } => {
                let _ = reply.send(self.with_job(id, |job, cx| job.delete_file(cx)));
            }
            Command::Snapshot { id, reply } => {
                let result = self
                    .records
                    .get(&id)
                    .map(DownloadRecord::snapshot)
                    .ok_or(EngineError::NotFound(id));
                let _ = reply.send(result);
            }
            Command::List { reply } => {
                let _ = reply.send(self.records.values().map(DownloadRecord::snapshot).collect());
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    /// Run `f` against the job of download `id` with a fresh context.
    fn with_job<R>(
        &mut self,
        id: u32,
        f: impl FnOnce(&mut DownloadJob, &mut JobContext<'_>) -> R,
    ) -> Result<R, EngineError> {
        let record = self.records.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        let guid = record.guid();
        let job = record
            .job
            .as_mut()
            .ok_or_else(|| EngineError::InvalidOperation(format!("download {} has no job", id)))?;
        let mut cx = JobContext {
            id,
            guid,
            info: &mut record.info,
            delegate: self.delegate.as_ref(),
            settings: &self.settings,
            control_tx: &self.control_tx,
            events: &self.events,
        };
        Ok(f(job, &mut cx))
    }

    /// Drop the record of a removed download.
    fn prune(&mut self, id: u32) {
        let removed = self
            .records
            .get(&id)
            .and_then(DownloadRecord::job)
            .is_some_and(DownloadJob::is_removed);
        if removed {
            debug!("Dropping record of removed download {}", id);
            self.records.remove(&id);
        }
    }

    fn shutdown(&mut self) {
        let running: Vec<u32> = self
            .records
            .iter()
            .filter(|(_, record)| record.state() == DownloadState::InProgress)
            .map(|(id, _)| *id)
            .collect();
        if !running.is_empty() {
            info!("Shutting down with {} running downloads", running.len());
        }
        // History keeps the running state; restore turns it into a resumable
        // interruption.
        let _ = self.events.send(CoreEvent::ManagerGoingDown);
        for id in running {
            let _ = self.with_job(id, |job, cx| job.cancel(false, cx));
        }
    }
}
