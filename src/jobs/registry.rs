//! In-memory job lifecycle tracking and admission control.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::jobs::{JobId, JobStage, MediaType};

/// How long terminal jobs stay visible before being dropped from the registry.
pub const REGISTRY_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct JobRecord {
    pub kind: MediaType,
    pub stage: JobStage,
    pub started_at: SystemTime,
}

/// Tracks every live job and rejects duplicate concurrent submissions for the
/// same (album, filename), the only guard against two encoders writing the
/// same output directories.
pub struct JobRegistry {
    grace: Duration,
    jobs: Mutex<HashMap<JobId, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_grace(REGISTRY_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            grace,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Admit a new job. Returns false while a job for the same id is still
    /// queued or running; a terminal record is replaced (re-upload of a
    /// finished file is a new job).
    pub fn admit(&self, id: &JobId, kind: MediaType) -> bool {
        let mut jobs = self.jobs.lock().expect("registry lock");
        if let Some(existing) = jobs.get(id) {
            if !existing.stage.is_terminal() {
                return false;
            }
        }
        jobs.insert(
            id.clone(),
            JobRecord {
                kind,
                stage: JobStage::Queued,
                started_at: SystemTime::now(),
            },
        );
        true
    }

    /// Record the stage a job is currently in. Terminal records are never
    /// transitioned back out of.
    pub fn update_stage(&self, id: &JobId, stage: JobStage) {
        let mut jobs = self.jobs.lock().expect("registry lock");
        if let Some(record) = jobs.get_mut(id) {
            if !record.stage.is_terminal() {
                record.stage = stage;
            }
        }
    }

    /// Mark a job terminal and schedule its removal after the grace period.
    pub fn finish(self: &Arc<Self>, id: &JobId, stage: JobStage) {
        debug_assert!(stage.is_terminal());
        {
            let mut jobs = self.jobs.lock().expect("registry lock");
            if let Some(record) = jobs.get_mut(id) {
                if record.stage.is_terminal() {
                    return;
                }
                record.stage = stage;
            }
        }

        let registry = Arc::clone(self);
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(registry.grace).await;
            let mut jobs = registry.jobs.lock().expect("registry lock");
            // Only drop the record if it is still the finished one.
            if jobs.get(&id).map(|r| r.stage.is_terminal()).unwrap_or(false) {
                jobs.remove(&id);
            }
        });
    }

    pub fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.jobs.lock().expect("registry lock").get(id).cloned()
    }

    /// Snapshot of every tracked job, for admin visibility.
    pub fn snapshot(&self) -> Vec<(JobId, JobRecord)> {
        self.jobs
            .lock()
            .expect("registry lock")
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
