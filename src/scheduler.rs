//! Delayed background jobs.
//!
//! Jobs are keyed by what they do and who they are for; scheduling a key
//! that is already pending replaces the old job, which is what gives the
//! open-chat summary its debounce behavior.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobKey {
    Summary { uid: String, session_id: String },
    CheckInAdvance { uid: String },
}

#[derive(Default)]
pub struct JobScheduler {
    jobs: Mutex<HashMap<JobKey, JoinHandle<()>>>,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `job` after `delay`. A pending job under the same key is
    /// aborted and replaced.
    pub fn schedule_in<F>(&self, key: JobKey, delay: Duration, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            job.await;
        });

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.retain(|_, pending| !pending.is_finished());
        if let Some(previous) = jobs.insert(key.clone(), handle) {
            if !previous.is_finished() {
                tracing::debug!("Replacing pending job {:?}", key);
                previous.abort();
            }
        }
    }

    /// Cancels a pending job. Returns whether one was pending.
    pub fn cancel(&self, key: &JobKey) -> bool {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.remove(key) {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, key: &JobKey) -> bool {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(key).map(|h| !h.is_finished()).unwrap_or(false)
    }
}
