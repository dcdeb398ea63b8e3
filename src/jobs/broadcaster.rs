//! Per-job progress pub/sub with latest-event retention.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;

use crate::jobs::{JobId, JobRegistry, JobStage, ProgressEvent};

/// How long terminal job state is retained for late subscribers.
pub const RETENTION_GRACE: Duration = Duration::from_secs(30);

struct JobChannel {
    latest: Option<ProgressEvent>,
    sender: broadcast::Sender<ProgressEvent>,
}

impl JobChannel {
    fn new() -> Self {
        // Capacity of 100 events should be sufficient for now
        let (sender, _) = broadcast::channel(100);
        Self {
            latest: None,
            sender,
        }
    }
}

/// Fans out one job's ordered event stream to any number of subscribers and
/// retains the most recent event so a subscriber attaching mid-job never sees
/// a blank initial state.
pub struct ProgressBroadcaster {
    grace: Duration,
    jobs: Mutex<HashMap<JobId, JobChannel>>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::with_grace(RETENTION_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            grace,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Store `event` as the job's latest state and forward it to every
    /// attached subscriber. A terminal event schedules the channel's purge
    /// after the retention grace period.
    pub fn publish(self: &Arc<Self>, event: ProgressEvent) {
        let id = JobId::new(event.album.clone(), event.filename.clone());
        let terminal = event.state.is_terminal();

        {
            let mut jobs = self.jobs.lock().expect("broadcaster lock");
            let channel = jobs.entry(id.clone()).or_insert_with(JobChannel::new);
            channel.latest = Some(event.clone());
            // Send fails only when nobody is subscribed, which is fine.
            let _ = channel.sender.send(event);
        }

        if terminal {
            let broadcaster = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(broadcaster.grace).await;
                let mut jobs = broadcaster.jobs.lock().expect("broadcaster lock");
                // The same (album, filename) may have been re-admitted since;
                // only drop the channel while its latest event is still the
                // terminal one that scheduled this purge.
                let still_terminal = jobs
                    .get(&id)
                    .and_then(|channel| channel.latest.as_ref())
                    .map(|event| event.state.is_terminal())
                    .unwrap_or(false);
                if still_terminal {
                    jobs.remove(&id);
                }
            });
        }
    }

    /// Attach to a job's stream. Returns the retained latest event (replayed
    /// to the caller first) and a receiver for subsequent live events.
    ///
    /// Subscribing may create the channel before the job publishes anything,
    /// so a channel that never sees an event and loses its last receiver is
    /// swept out again; terminal publishes own the lifecycle otherwise.
    pub fn subscribe(
        self: &Arc<Self>,
        id: &JobId,
    ) -> (Option<ProgressEvent>, broadcast::Receiver<ProgressEvent>) {
        let mut jobs = self.jobs.lock().expect("broadcaster lock");
        if let Some(channel) = jobs.get(id) {
            return (channel.latest.clone(), channel.sender.subscribe());
        }

        let channel = jobs.entry(id.clone()).or_insert_with(JobChannel::new);
        let receiver = channel.sender.subscribe();

        let broadcaster = Arc::clone(self);
        let id = id.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(broadcaster.grace).await;
                let mut jobs = broadcaster.jobs.lock().expect("broadcaster lock");
                match jobs.get(&id) {
                    Some(channel) if channel.latest.is_none() => {
                        if channel.sender.receiver_count() == 0 {
                            jobs.remove(&id);
                            return;
                        }
                        // Still watched; check again after another grace.
                    }
                    _ => return,
                }
            }
        });

        (None, receiver)
    }

    #[cfg(test)]
    fn is_tracked(&self, id: &JobId) -> bool {
        self.jobs.lock().expect("broadcaster lock").contains_key(id)
    }

    /// Most recent event for a job, if any is retained.
    pub fn latest(&self, id: &JobId) -> Option<ProgressEvent> {
        self.jobs
            .lock()
            .expect("broadcaster lock")
            .get(id)
            .and_then(|channel| channel.latest.clone())
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// One job's handle onto the event stream: publishes progress and keeps the
/// registry's stage in sync. Cloneable so stream-consumer tasks can report.
#[derive(Clone)]
pub struct JobProgress {
    id: JobId,
    broadcaster: Arc<ProgressBroadcaster>,
    registry: Arc<JobRegistry>,
}

impl JobProgress {
    pub fn new(id: JobId, broadcaster: Arc<ProgressBroadcaster>, registry: Arc<JobRegistry>) -> Self {
        Self {
            id,
            broadcaster,
            registry,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn update(&self, stage: JobStage, percent: u8, message: Option<String>) {
        self.registry.update_stage(&self.id, stage.clone());
        let mut event = ProgressEvent::new(&self.id, stage, percent);
        event.message = message;
        self.broadcaster.publish(event);
    }

    pub fn complete(&self, title: Option<String>) {
        self.registry.finish(&self.id, JobStage::Complete);
        let mut event = ProgressEvent::new(&self.id, JobStage::Complete, 100);
        event.title = title;
        self.broadcaster.publish(event);
    }

    pub fn fail(&self, message: String) {
        // Keep the last reported percent so clients don't see progress reset.
        let percent = self
            .broadcaster
            .latest(&self.id)
            .map(|event| event.progress)
            .unwrap_or(0);
        self.registry.finish(&self.id, JobStage::Error);
        self.broadcaster
            .publish(ProgressEvent::new(&self.id, JobStage::Error, percent).with_error(message));
    }
}
