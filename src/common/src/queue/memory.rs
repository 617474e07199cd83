use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Envelope, Queue, QueueError, QueueResult};

#[derive(Debug, Default)]
struct QueueState {
    pending: Vec<Envelope>,
    leased: HashMap<Uuid, Envelope>,
    dead: Vec<Envelope>,
}

/// In-memory queue for tests and single-process deployments.
///
/// Messages do not survive a restart; `release_leases` emulates the
/// redelivery a durable backend performs when it is reopened.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return every leased, unacknowledged message to the pending set
    pub async fn release_leases(&self) {
        let mut queues = self.queues.lock().await;
        for state in queues.values_mut() {
            let leased: Vec<Envelope> = state.leased.drain().map(|(_, e)| e).collect();
            state.pending.extend(leased);
        }
    }

    /// Number of leased, unacknowledged messages
    pub async fn leased(&self, queue: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue)
            .map(|state| state.leased.len())
            .unwrap_or(0)
    }

    /// All pending envelopes, due or not, in delivery order
    pub async fn snapshot(&self, queue: &str) -> Vec<Envelope> {
        let queues = self.queues.lock().await;
        let mut pending = queues
            .get(queue)
            .map(|state| state.pending.clone())
            .unwrap_or_default();
        pending.sort_by_key(|e| e.deliver_at);
        pending
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn publish(&self, envelope: Envelope) -> QueueResult<()> {
        let mut queues = self.queues.lock().await;
        queues
            .entry(envelope.queue.clone())
            .or_default()
            .pending
            .push(envelope);
        Ok(())
    }

    async fn receive(&self, queue: &str) -> QueueResult<Option<Envelope>> {
        let now = Utc::now();
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(None);
        };

        let next = state
            .pending
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_due(now))
            .min_by_key(|(_, e)| e.deliver_at)
            .map(|(idx, _)| idx);

        Ok(next.map(|idx| {
            let envelope = state.pending.swap_remove(idx);
            state.leased.insert(envelope.id, envelope.clone());
            envelope
        }))
    }

    async fn ack(&self, queue: &str, id: Uuid) -> QueueResult<()> {
        let mut queues = self.queues.lock().await;
        queues
            .get_mut(queue)
            .and_then(|state| state.leased.remove(&id))
            .map(|_| ())
            .ok_or(QueueError::NotLeased(id))
    }

    async fn dead_letter(&self, envelope: Envelope) -> QueueResult<()> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(envelope.queue.clone()).or_default();
        if state.leased.remove(&envelope.id).is_none() {
            return Err(QueueError::NotLeased(envelope.id));
        }
        state.dead.push(envelope);
        Ok(())
    }

    async fn dead_letters(&self, queue: &str) -> QueueResult<Vec<Envelope>> {
        Ok(self
            .queues
            .lock()
            .await
            .get(queue)
            .map(|state| state.dead.clone())
            .unwrap_or_default())
    }

    async fn pending(&self, queue: &str) -> QueueResult<usize> {
        Ok(self
            .queues
            .lock()
            .await
            .get(queue)
            .map(|state| state.pending.len())
            .unwrap_or(0))
    }
}
