//! Snapshot persistence.
//!
//! Gameplay state is authoritative in memory; storage is best-effort
//! durability. Session actors hand snapshots to a [`SaveQueue`] and move on.
//! The queue writes them in priority order on its own task, retries failures
//! at lower priority, and only ever keeps the newest snapshot per session.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::state::session::SessionId;
use crate::state::snapshot::SessionSnapshot;

/// Priority for a first save attempt. Each failure drops it by one.
pub const DEFAULT_SAVE_PRIORITY: u8 = 10;

/// Pause after a failed write before the next one.
pub const RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Durable storage for session snapshots.
pub trait SnapshotStore: Send + Sync + 'static {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), PersistenceError>;

    fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>, PersistenceError>;

    fn remove(&self, session_id: &str) -> Result<(), PersistenceError>;

    /// Ids of every stored session.
    fn list(&self) -> Result<Vec<SessionId>, PersistenceError>;
}

/// Snapshots kept as JSON in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<SessionId, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<SessionId, String>>, PersistenceError> {
        self.entries
            .lock()
            .map_err(|_| PersistenceError::Unavailable("memory store lock poisoned".into()))
    }
}

impl SnapshotStore for MemoryStore {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), PersistenceError> {
        let text = serde_json::to_string(snapshot)?;
        self.entries()?.insert(snapshot.session_id.clone(), text);
        Ok(())
    }

    fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>, PersistenceError> {
        match self.entries()?.get(session_id) {
            Some(text) => Ok(Some(serde_json::from_str(text)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, session_id: &str) -> Result<(), PersistenceError> {
        self.entries()?.remove(session_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<SessionId>, PersistenceError> {
        let mut ids: Vec<SessionId> = self.entries()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

enum SaveMessage {
    Save(SessionSnapshot),
    Remove(SessionId),
    Flush(oneshot::Sender<()>),
}

struct QueuedSave {
    priority: u8,
    seq: u64,
    attempts: u32,
    snapshot: SessionSnapshot,
}

// Highest priority first, then oldest first.
impl Ord for QueuedSave {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedSave {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedSave {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedSave {}

/// Handle to the background save task.
pub struct SaveQueue {
    tx: mpsc::UnboundedSender<SaveMessage>,
    task: JoinHandle<()>,
}

impl SaveQueue {
    /// Spawn the save task. Must be called inside a tokio runtime.
    pub fn start(store: Arc<dyn SnapshotStore>, max_attempts: u32) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(save_loop(store, rx, max_attempts.max(1)));
        Self { tx, task }
    }

    /// Queue a snapshot. Never blocks; a closed queue only costs durability.
    pub fn enqueue(&self, snapshot: SessionSnapshot) {
        if self.tx.send(SaveMessage::Save(snapshot)).is_err() {
            warn!("Save queue closed, snapshot dropped");
        }
    }

    /// Drop queued saves for a session and delete its stored snapshot.
    pub fn remove(&self, session_id: SessionId) {
        if self.tx.send(SaveMessage::Remove(session_id)).is_err() {
            warn!("Save queue closed, removal dropped");
        }
    }

    /// Wait until everything queued so far has been written or given up on.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(SaveMessage::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Flush, then stop the task.
    pub async fn shutdown(self) {
        self.flush().await;
        drop(self.tx);
        if let Err(err) = self.task.await {
            debug!("save task ended abnormally: {err}");
        }
    }
}

async fn save_loop(
    store: Arc<dyn SnapshotStore>,
    mut rx: mpsc::UnboundedReceiver<SaveMessage>,
    max_attempts: u32,
) {
    let mut heap: BinaryHeap<QueuedSave> = BinaryHeap::new();
    // Newest queued seq per session; anything older is stale.
    let mut latest: HashMap<SessionId, u64> = HashMap::new();
    let mut waiting: Vec<oneshot::Sender<()>> = Vec::new();
    let mut next_seq: u64 = 0;

    loop {
        if heap.is_empty() {
            for done in waiting.drain(..) {
                let _ = done.send(());
            }
            match rx.recv().await {
                Some(message) => accept(message, &store, &mut heap, &mut latest, &mut waiting, &mut next_seq),
                None => break,
            }
        }
        while let Ok(message) = rx.try_recv() {
            accept(message, &store, &mut heap, &mut latest, &mut waiting, &mut next_seq);
        }

        let Some(mut item) = heap.pop() else {
            continue;
        };
        let session_id = item.snapshot.session_id.clone();
        if latest.get(&session_id) != Some(&item.seq) {
            continue;
        }

        item.attempts += 1;
        match store.save(&item.snapshot) {
            Ok(()) => {
                latest.remove(&session_id);
                debug!(session_id = %session_id, attempts = item.attempts, "Snapshot saved");
            }
            Err(err) if item.attempts >= max_attempts => {
                latest.remove(&session_id);
                error!(
                    session_id = %session_id,
                    attempts = item.attempts,
                    error = %err,
                    "Snapshot dropped after repeated save failures"
                );
            }
            Err(err) => {
                warn!(
                    session_id = %session_id,
                    attempts = item.attempts,
                    error = %err,
                    "Snapshot save failed, re-queued"
                );
                item.priority = item.priority.saturating_sub(1);
                heap.push(item);
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
    }

    debug!("save loop stopped");
}

fn accept(
    message: SaveMessage,
    store: &Arc<dyn SnapshotStore>,
    heap: &mut BinaryHeap<QueuedSave>,
    latest: &mut HashMap<SessionId, u64>,
    waiting: &mut Vec<oneshot::Sender<()>>,
    next_seq: &mut u64,
) {
    match message {
        SaveMessage::Save(snapshot) => {
            *next_seq += 1;
            latest.insert(snapshot.session_id.clone(), *next_seq);
            heap.push(QueuedSave {
                priority: DEFAULT_SAVE_PRIORITY,
                seq: *next_seq,
                attempts: 0,
                snapshot,
            });
        }
        SaveMessage::Remove(session_id) => {
            latest.remove(&session_id);
            if let Err(err) = store.remove(&session_id) {
                warn!(session_id = %session_id, error = %err, "Snapshot removal failed");
            }
        }
        SaveMessage::Flush(done) => waiting.push(done),
    }
}
