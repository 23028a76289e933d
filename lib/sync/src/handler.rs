//! Adapts the executor to the broker's job handler seam.

use crate::executor::{SyncExecutor, SyncOutcome};
use async_trait::async_trait;
use classync_scheduler::{JobDisposition, JobHandler, SyncJob};

/// Runs delivered sync jobs and tells the broker what to do with them.
///
/// Missing schedules are acknowledged so that a deleted schedule never shows
/// up as a failed job.
#[derive(Clone)]
pub struct SyncJobHandler {
    executor: SyncExecutor,
}

impl SyncJobHandler {
    #[must_use]
    pub fn new(executor: SyncExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl JobHandler for SyncJobHandler {
    async fn handle(&self, job: &SyncJob) -> JobDisposition {
        match self.executor.run(job.schedule_id).await {
            Ok(SyncOutcome::Completed { .. } | SyncOutcome::EntityNotFound) => {
                JobDisposition::Done
            }
            Err(error) if error.is_retryable() => JobDisposition::Retry {
                reason: error.to_string(),
            },
            Err(error) => JobDisposition::Fatal {
                reason: error.to_string(),
            },
        }
    }
}
