//! Directory-backed durable queue.
//!
//! Layout: `<root>/<queue>/{pending,leased,dead}/<message id>.json`. A
//! message is written to a temporary file and renamed into `pending/`, so a
//! crash never leaves a partial message visible. Leasing renames the file
//! into `leased/`; opening the queue moves every leased file back into
//! `pending/`.

use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Envelope, Queue, QueueError, QueueResult};

const PENDING: &str = "pending";
const LEASED: &str = "leased";
const DEAD: &str = "dead";

#[derive(Debug)]
pub struct FileQueue {
    root: PathBuf,
    /// Serializes lease decisions between consumers of this process
    receive_lock: Mutex<()>,
}

impl FileQueue {
    /// Open the queue rooted at `root`, redelivering unacknowledged leases.
    pub async fn open(root: impl AsRef<Path>) -> QueueResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let queue = Self {
            root,
            receive_lock: Mutex::new(()),
        };
        let restored = queue.restore_leases().await?;
        if restored > 0 {
            tracing::info!(
                root = %queue.root.display(),
                restored,
                "Returned unacknowledged messages to pending"
            );
        }
        Ok(queue)
    }

    fn dir(&self, queue: &str, state: &str) -> PathBuf {
        self.root.join(queue).join(state)
    }

    fn message_path(&self, queue: &str, state: &str, id: Uuid) -> PathBuf {
        self.dir(queue, state).join(format!("{id}.json"))
    }

    async fn restore_leases(&self) -> QueueResult<usize> {
        let mut restored = 0;
        let mut queues = fs::read_dir(&self.root).await?;
        while let Some(entry) = queues.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let leased_dir = entry.path().join(LEASED);
            let pending_dir = entry.path().join(PENDING);
            let mut leased = match fs::read_dir(&leased_dir).await {
                Ok(dir) => dir,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            fs::create_dir_all(&pending_dir).await?;
            while let Some(file) = leased.next_entry().await? {
                fs::rename(file.path(), pending_dir.join(file.file_name())).await?;
                restored += 1;
            }
        }
        Ok(restored)
    }

    async fn write_atomically(&self, path: &Path, envelope: &Envelope) -> QueueResult<()> {
        let parent = path
            .parent()
            .ok_or_else(|| QueueError::PublishError(format!("invalid path {}", path.display())))?;
        fs::create_dir_all(parent).await?;

        let tmp = parent.join(format!(".{}.tmp", envelope.id));
        let bytes = serde_json::to_vec_pretty(envelope)?;
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_dir_envelopes(&self, dir: &Path) -> QueueResult<Vec<Envelope>> {
        let mut envelopes = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(envelopes),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                // Leased by another consumer between listing and reading
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_slice::<Envelope>(&bytes) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable queue message"
                    );
                }
            }
        }
        Ok(envelopes)
    }
}

#[async_trait]
impl Queue for FileQueue {
    async fn publish(&self, envelope: Envelope) -> QueueResult<()> {
        let path = self.message_path(&envelope.queue, PENDING, envelope.id);
        self.write_atomically(&path, &envelope).await
    }

    async fn receive(&self, queue: &str) -> QueueResult<Option<Envelope>> {
        let _guard = self.receive_lock.lock().await;
        let now = Utc::now();

        let mut due: Vec<Envelope> = self
            .read_dir_envelopes(&self.dir(queue, PENDING))
            .await?
            .into_iter()
            .filter(|e| e.is_due(now))
            .collect();
        due.sort_by_key(|e| e.deliver_at);

        for envelope in due {
            let from = self.message_path(queue, PENDING, envelope.id);
            let to = self.message_path(queue, LEASED, envelope.id);
            fs::create_dir_all(self.dir(queue, LEASED)).await?;
            match fs::rename(&from, &to).await {
                Ok(()) => return Ok(Some(envelope)),
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(QueueError::ReceiveError(format!(
                        "failed to lease {}: {e}",
                        envelope.id
                    )));
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, queue: &str, id: Uuid) -> QueueResult<()> {
        match fs::remove_file(self.message_path(queue, LEASED, id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(QueueError::NotLeased(id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn dead_letter(&self, envelope: Envelope) -> QueueResult<()> {
        let leased = self.message_path(&envelope.queue, LEASED, envelope.id);
        if fs::metadata(&leased).await.is_err() {
            return Err(QueueError::NotLeased(envelope.id));
        }
        let dead = self.message_path(&envelope.queue, DEAD, envelope.id);
        self.write_atomically(&dead, &envelope).await?;
        fs::remove_file(&leased).await?;
        Ok(())
    }

    async fn dead_letters(&self, queue: &str) -> QueueResult<Vec<Envelope>> {
        let mut dead = self.read_dir_envelopes(&self.dir(queue, DEAD)).await?;
        dead.sort_by_key(|e| e.enqueued_at);
        Ok(dead)
    }

    async fn pending(&self, queue: &str) -> QueueResult<usize> {
        Ok(self
            .read_dir_envelopes(&self.dir(queue, PENDING))
            .await?
            .len())
    }
}
