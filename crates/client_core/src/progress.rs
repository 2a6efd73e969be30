//! Push-message decoding and the progress store.
//!
//! The store maps a job or batch identifier to the latest known snapshot.
//! Events are applied strictly in arrival order:
//!
//! - `progress` at 0% means the job (re)started and replaces the whole store
//!   with that single entry, so stale snapshots of unrelated jobs disappear.
//! - `progress` above 0% and `batch_progress` upsert only their own entry.
//! - `completion` merges onto the existing entry, forces 100%, sets the
//!   terminal status and schedules removal after the retention delay.

use std::{collections::BTreeMap, collections::HashMap, sync::Arc, time::Duration};

use shared::{
    domain::{JobId, ProgressStatus},
    protocol::{ProgressEvent, KEEPALIVE_PING, KEEPALIVE_PONG},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{error::DecodeError, events::SessionEvent};

#[derive(Debug, Clone, PartialEq)]
pub enum PushMessage {
    Keepalive,
    Event(ProgressEvent),
}

pub fn decode_push_message(raw: &str) -> Result<PushMessage, DecodeError> {
    let trimmed = raw.trim();
    if trimmed == KEEPALIVE_PONG || trimmed == KEEPALIVE_PING {
        return Ok(PushMessage::Keepalive);
    }
    serde_json::from_str::<ProgressEvent>(trimmed)
        .map(PushMessage::Event)
        .map_err(|source| DecodeError {
            raw: raw.to_string(),
            source,
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Job,
    Batch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub id: JobId,
    pub kind: SnapshotKind,
    pub percent: u8,
    pub status: ProgressStatus,
    pub current_step: Option<String>,
    pub file_name: Option<String>,
    pub error_message: Option<String>,
    /// Per-file sub-status for batches.
    pub files: BTreeMap<String, serde_json::Value>,
    pub created_at: Instant,
}

impl ProgressSnapshot {
    fn from_event(event: ProgressEvent, created_at: Instant) -> Self {
        let mut snapshot = Self {
            id: event.id().clone(),
            kind: SnapshotKind::Job,
            percent: 0,
            status: ProgressStatus::Processing,
            current_step: None,
            file_name: None,
            error_message: None,
            files: BTreeMap::new(),
            created_at,
        };
        snapshot.overwrite(event);
        snapshot
    }

    /// Replaces every field the event carries. Completion is the only event
    /// that leaves absent fields untouched.
    fn overwrite(&mut self, event: ProgressEvent) {
        let percent = event.percent();
        let status = event.status();
        match event {
            ProgressEvent::Progress {
                step, file_name, ..
            } => {
                self.kind = SnapshotKind::Job;
                self.current_step = step;
                self.file_name = file_name;
                self.error_message = None;
                self.files.clear();
            }
            ProgressEvent::BatchProgress { files, .. } => {
                self.kind = SnapshotKind::Batch;
                self.current_step = None;
                self.file_name = None;
                self.error_message = None;
                self.files = files;
            }
            ProgressEvent::Completion { error_message, .. } => {
                if error_message.is_some() {
                    self.error_message = error_message;
                }
            }
        }
        self.percent = percent;
        self.status = status;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    /// A fresh start cleared every other entry.
    Reset,
    Upserted,
    /// Terminal completion applied; the entry should expire.
    Completed,
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    snapshot: ProgressSnapshot,
}

#[derive(Debug, Default)]
pub struct ProgressStore {
    entries: HashMap<JobId, Entry>,
    next_seq: u64,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: ProgressEvent, now: Instant) -> StoreChange {
        match &event {
            ProgressEvent::Progress { percent: 0, .. } => {
                self.entries.clear();
                self.insert_new(ProgressSnapshot::from_event(event, now));
                StoreChange::Reset
            }
            ProgressEvent::Progress { .. } | ProgressEvent::BatchProgress { .. } => {
                self.upsert(event, now);
                StoreChange::Upserted
            }
            ProgressEvent::Completion { .. } => {
                self.upsert(event, now);
                StoreChange::Completed
            }
        }
    }

    fn upsert(&mut self, event: ProgressEvent, now: Instant) {
        match self.entries.get_mut(event.id()) {
            Some(entry) => entry.snapshot.overwrite(event),
            None => self.insert_new(ProgressSnapshot::from_event(event, now)),
        }
    }

    fn insert_new(&mut self, snapshot: ProgressSnapshot) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(snapshot.id.clone(), Entry { seq, snapshot });
    }

    pub fn clear(&mut self, id: &JobId) -> Option<ProgressSnapshot> {
        self.entries.remove(id).map(|entry| entry.snapshot)
    }

    pub fn get(&self, id: &JobId) -> Option<&ProgressSnapshot> {
        self.entries.get(id).map(|entry| &entry.snapshot)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Identifiers in insertion order. Updates do not move an entry.
    pub fn ids(&self) -> Vec<JobId> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
            .into_iter()
            .map(|entry| entry.snapshot.id.clone())
            .collect()
    }

    pub fn latest_id(&self) -> Option<&JobId> {
        self.entries
            .values()
            .max_by_key(|entry| entry.seq)
            .map(|entry| &entry.snapshot.id)
    }

    pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries
            .into_iter()
            .map(|entry| entry.snapshot.clone())
            .collect()
    }
}

/// Shared handle over the progress store plus the expiry timers it owns.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    store: Mutex<ProgressStore>,
    expiries: Mutex<Vec<JoinHandle<()>>>,
    retention: Duration,
    events: broadcast::Sender<SessionEvent>,
}

impl ProgressTracker {
    pub fn new(retention: Duration, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                store: Mutex::new(ProgressStore::new()),
                expiries: Mutex::new(Vec::new()),
                retention,
                events,
            }),
        }
    }

    /// Decodes one raw push frame and applies it. Keepalives and malformed
    /// frames never reach the store.
    pub async fn ingest(&self, raw: &str) {
        match decode_push_message(raw) {
            Ok(PushMessage::Keepalive) => debug!("push: keepalive acknowledged"),
            Ok(PushMessage::Event(event)) => self.apply(event).await,
            Err(err) => warn!(error = %err, raw = %err.raw, "push: dropping malformed payload"),
        }
    }

    pub async fn apply(&self, event: ProgressEvent) {
        let id = event.id().clone();
        let kind = event.kind();
        let (change, snapshot) = {
            let mut store = self.inner.store.lock().await;
            let change = store.apply(event, Instant::now());
            (change, store.get(&id).cloned())
        };
        debug!(job_id = %id, kind, ?change, "progress: applied event");

        if change == StoreChange::Completed {
            self.schedule_expiry(id).await;
        }
        if let Some(snapshot) = snapshot {
            let _ = self.inner.events.send(SessionEvent::ProgressUpdated(snapshot));
        }
    }

    /// Every completion arms its own timer, duplicates included. The first one
    /// to fire removes the entry; later ones find nothing and stay silent.
    async fn schedule_expiry(&self, id: JobId) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(inner.retention).await;
            let removed = inner.store.lock().await.clear(&id);
            if removed.is_some() {
                info!(job_id = %id, "progress: terminal entry expired");
                let _ = inner.events.send(SessionEvent::JobExpired { id });
            }
        });
        let mut expiries = self.inner.expiries.lock().await;
        expiries.retain(|pending| !pending.is_finished());
        expiries.push(handle);
    }

    pub async fn clear(&self, id: &JobId) -> Option<ProgressSnapshot> {
        self.inner.store.lock().await.clear(id)
    }

    pub async fn snapshot(&self, id: &JobId) -> Option<ProgressSnapshot> {
        self.inner.store.lock().await.get(id).cloned()
    }

    pub async fn snapshots(&self) -> Vec<ProgressSnapshot> {
        self.inner.store.lock().await.snapshots()
    }

    pub async fn ids(&self) -> Vec<JobId> {
        self.inner.store.lock().await.ids()
    }

    pub async fn with_store<R>(&self, f: impl FnOnce(&ProgressStore) -> R) -> R {
        let store = self.inner.store.lock().await;
        f(&store)
    }

    /// Aborts pending expiry timers. Entries stay where they are.
    pub async fn shutdown(&self) {
        let mut expiries = self.inner.expiries.lock().await;
        for handle in expiries.drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/progress_tests.rs"]
mod tests;
