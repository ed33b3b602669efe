//! Background job queue with polled status.
//!
//! Callers submit a closure, get a [`JobHandle`] back immediately, and
//! poll for [`JobState`]. Jobs run detached on the tokio runtime and are
//! not cancellable mid-run; the running job reports progress counters
//! through its [`ProgressHandle`].

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(pub String);

impl JobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobState {
    InProgress {
        #[serde(skip_serializing_if = "Option::is_none")]
        progress: Option<Progress>,
    },
    Completed {
        result: serde_json::Value,
    },
    Failed {
        error: String,
    },
}

// Guarded sections never await, so a sync lock is safe here.
type JobMap = Arc<RwLock<HashMap<String, JobState>>>;

/// Progress reporter owned by a running job.
#[derive(Clone)]
pub struct ProgressHandle {
    job_id: String,
    jobs: JobMap,
}

impl ProgressHandle {
    pub fn update(&self, current: u64, total: u64) {
        if let Ok(mut jobs) = self.jobs.write() {
            if let Some(state @ JobState::InProgress { .. }) = jobs.get_mut(&self.job_id) {
                *state = JobState::InProgress {
                    progress: Some(Progress { current, total }),
                };
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct JobQueue {
    jobs: JobMap,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a job. The closure receives a [`ProgressHandle`] and runs on
    /// a detached tokio task; its result (or error) becomes the terminal
    /// job state. The handle is registered before this returns, so an
    /// immediate poll always sees the job.
    pub fn submit<F, Fut>(&self, job: F) -> JobHandle
    where
        F: FnOnce(ProgressHandle) -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<serde_json::Value, EngineError>> + Send + 'static,
    {
        let id = Uuid::new_v4().to_string();
        let handle = JobHandle(id.clone());

        if let Ok(mut jobs) = self.jobs.write() {
            jobs.insert(id.clone(), JobState::InProgress { progress: None });
        }

        let jobs = self.jobs.clone();
        let progress = ProgressHandle {
            job_id: id.clone(),
            jobs: self.jobs.clone(),
        };

        tokio::spawn(async move {
            let outcome = job(progress).await;
            let state = match outcome {
                Ok(result) => JobState::Completed { result },
                Err(e) => JobState::Failed {
                    error: e.to_string(),
                },
            };
            if let Ok(mut map) = jobs.write() {
                map.insert(id, state);
            }
        });

        handle
    }

    pub fn poll(&self, handle: &JobHandle) -> Option<JobState> {
        self.poll_id(&handle.0)
    }

    pub fn poll_id(&self, id: &str) -> Option<JobState> {
        self.jobs.read().ok()?.get(id).cloned()
    }
}
