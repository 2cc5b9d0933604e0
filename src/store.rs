//! Client-facing job store.
//!
//! Polls and push streams read from here, never from the registry. Only the
//! registry's sync path writes (`write` is crate-private), and a write is
//! accepted only if it is newer than what is stored and the stored record is
//! not already terminal. Accepted writes are broadcast to subscribers.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use reelsmith_common::{JobId, JobStatus, JobView};
use tokio::sync::broadcast;
use tracing::debug;

use crate::errors::StoreError;

const DEFAULT_BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct JobStore {
    records: Arc<DashMap<JobId, JobView>>,
    updates: broadcast::Sender<JobView>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl JobStore {
    pub fn new(capacity: usize) -> Self {
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            records: Arc::new(DashMap::new()),
            updates,
        }
    }

    /// Apply a replicated write. Resolves once the record is stored.
    pub(crate) async fn write(&self, view: JobView) -> Result<(), StoreError> {
        if view.status == JobStatus::Done
            && view.output_path.as_deref().is_none_or(str::is_empty)
        {
            return Err(StoreError::MissingOutput { id: view.id });
        }

        match self.records.entry(view.id) {
            Entry::Occupied(mut slot) => {
                let stored = slot.get();
                if stored.status.is_terminal() {
                    return Err(StoreError::AlreadyTerminal {
                        id: view.id,
                        status: stored.status,
                    });
                }
                if view.revision <= stored.revision {
                    return Err(StoreError::Stale {
                        id: view.id,
                        revision: view.revision,
                        stored: stored.revision,
                    });
                }
                slot.insert(view.clone());
                self.accepted(view);
            }
            Entry::Vacant(slot) => {
                let _guard = slot.insert(view.clone());
                self.accepted(view);
            }
        }
        Ok(())
    }

    /// Broadcast while the entry is still locked, so subscribers see
    /// revisions of one job in order.
    fn accepted(&self, view: JobView) {
        debug!(
            job_id = %view.id,
            status = %view.status,
            percent = view.percent,
            revision = view.revision,
            "Store write accepted"
        );
        // No subscribers is fine.
        let _ = self.updates.send(view);
    }

    /// Drop a record. Only the registry's eviction path calls this.
    pub(crate) fn remove(&self, id: JobId) -> Option<JobView> {
        self.records.remove(&id).map(|(_, view)| view)
    }

    pub fn get(&self, id: JobId) -> Option<JobView> {
        self.records.get(&id).map(|r| r.value().clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobView> {
        self.updates.subscribe()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
