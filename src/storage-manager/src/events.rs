//! Notifications published by the storage manager.
//!
//! Audit and HL7 forwarders subscribe to the bus; events emitted while
//! nobody listens are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArchiveEvent {
    /// The write volume of a group changed
    VolumeSwitched {
        group_id: String,
        from: Option<i64>,
        to: i64,
        path: String,
    },
    /// No volume of the group can take further writes
    VolumeExhausted { group_id: String },
    /// A study, or a single series of it, was removed from a group
    StudyDeleted {
        group_id: String,
        study_iuid: String,
        series_iuid: Option<String>,
        volume_id: i64,
        files: usize,
        bytes: u64,
    },
    /// A delete order ran out of retries
    DeleteOrderFailed {
        group_id: String,
        study_iuid: String,
        failure_count: u32,
        error: String,
    },
    OrphanFilesDeleted {
        group_id: String,
        files: usize,
        bytes: u64,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ArchiveEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ArchiveEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ArchiveEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("Archive event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
