//! Download record - identity and observable state of one download
//!
//! The record owns the request, response and destination information and,
//! while the download is managed, the job driving it. Everything observers
//! see is flattened from here into a `DownloadSnapshot`.

use crate::engine::job::DownloadJob;
use resumedl_types::{DestinationInfo, DownloadSnapshot, DownloadState, RequestInfo, ResponseInfo};
use uuid::Uuid;

/// The mutable parts of a record. Jobs receive `&mut RecordInfo` for the
/// duration of each operation.
#[derive(Debug, Clone)]
pub struct RecordInfo {
    pub request: RequestInfo,
    pub response: ResponseInfo,
    pub destination: DestinationInfo,
}

impl RecordInfo {
    pub fn new(request: RequestInfo) -> Self {
        Self {
            request,
            response: ResponseInfo::default(),
            destination: DestinationInfo::default(),
        }
    }

    /// Flatten this record, with the job-owned fields taken from `job`.
    pub fn snapshot(&self, id: u32, guid: Uuid, job: Option<&DownloadJob>) -> DownloadSnapshot {
        let request = &self.request;
        let response = &self.response;
        let destination = &self.destination;
        DownloadSnapshot {
            id,
            guid,
            url_chain: request.url_chain.clone(),
            referrer_url: request.referrer_url.clone(),
            tab_url: request.tab_url.clone(),
            transition_type: request.transition_type,
            has_user_gesture: request.has_user_gesture,
            start_time: request.start_time,
            end_time: destination.end_time,
            content_disposition: response.content_disposition.clone(),
            mime_type: response.mime_type.clone(),
            original_mime_type: response.original_mime_type.clone(),
            total_bytes: response.total_bytes,
            etag: response.etag.clone(),
            last_modified: response.last_modified.clone(),
            target_path: destination.target_path.clone(),
            current_path: destination.current_path.clone(),
            received_bytes: destination.received_bytes,
            received_slices: destination.received_slices.clone(),
            all_data_saved: destination.all_data_saved,
            hash: hex::encode(&destination.hash),
            state: job.map_or(DownloadState::Detached, DownloadJob::external_state),
            internal_state: job.map_or("DETACHED", |job| job.state().as_str()).to_string(),
            interrupt_reason: job.and_then(DownloadJob::last_reason),
            danger_type: job.map(DownloadJob::danger_type).unwrap_or_default(),
            paused: job.is_some_and(DownloadJob::is_paused),
            opened: job.is_some_and(DownloadJob::is_opened),
            auto_resume_count: job.map_or(0, DownloadJob::auto_resume_count),
        }
    }
}

/// A download known to the manager
pub struct DownloadRecord {
    guid: Uuid,
    id: u32,
    pub(crate) info: RecordInfo,
    pub(crate) job: Option<DownloadJob>,
}

impl DownloadRecord {
    pub fn new(id: u32, request: RequestInfo) -> Self {
        Self {
            guid: Uuid::new_v4(),
            id,
            info: RecordInfo::new(request),
            job: None,
        }
    }

    /// Rebuild a record from a stored snapshot. Downloads that were still
    /// running when the snapshot was taken come back interrupted. Returns
    /// `None` for a snapshot without any URL.
    pub fn from_snapshot(snapshot: &DownloadSnapshot) -> Option<Self> {
        let mut request = RequestInfo::new(snapshot.url_chain.first().cloned()?);
        request.url_chain = snapshot.url_chain.clone();
        request.referrer_url = snapshot.referrer_url.clone();
        request.tab_url = snapshot.tab_url.clone();
        request.transition_type = snapshot.transition_type;
        request.has_user_gesture = snapshot.has_user_gesture;
        request.start_time = snapshot.start_time;

        let response = ResponseInfo {
            url_chain: Vec::new(),
            content_disposition: snapshot.content_disposition.clone(),
            mime_type: snapshot.mime_type.clone(),
            original_mime_type: snapshot.original_mime_type.clone(),
            total_bytes: snapshot.total_bytes,
            etag: snapshot.etag.clone(),
            last_modified: snapshot.last_modified.clone(),
        };

        let destination = DestinationInfo {
            target_path: snapshot.target_path.clone(),
            current_path: snapshot.current_path.clone(),
            received_bytes: snapshot.received_bytes,
            received_slices: snapshot.received_slices.clone(),
            all_data_saved: snapshot.all_data_saved,
            hash: hex::decode(&snapshot.hash).unwrap_or_default(),
            end_time: snapshot.end_time,
            ..Default::default()
        };

        Some(Self {
            guid: snapshot.guid,
            id: snapshot.id,
            info: RecordInfo {
                request,
                response,
                destination,
            },
            job: DownloadJob::from_snapshot(snapshot),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn guid(&self) -> Uuid {
        self.guid
    }

    pub fn info(&self) -> &RecordInfo {
        &self.info
    }

    pub fn job(&self) -> Option<&DownloadJob> {
        self.job.as_ref()
    }

    pub fn assign_job(&mut self, job: DownloadJob) {
        self.job = Some(job);
    }

    pub fn detach_job(&mut self) -> Option<DownloadJob> {
        self.job.take()
    }

    pub fn state(&self) -> DownloadState {
        self.job.as_ref().map_or(DownloadState::Detached, DownloadJob::external_state)
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        self.info.snapshot(self.id, self.guid, self.job.as_ref())
    }
}

impl std::fmt::Debug for DownloadRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadRecord")
            .field("id", &self.id)
            .field("guid", &self.guid)
            .field("state", &self.state())
            .field("url", &self.info.request.url().map(|u| u.as_str()))
            .finish()
    }
}
