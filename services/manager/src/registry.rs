//! Concurrent map of live workers.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lift_id::WorkerId;
use serde::Serialize;
use thiserror::Error;

use crate::worker::{WorkerInfo, WorkerProcess};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("worker not found: {0}")]
    NotFound(WorkerId),
}

/// Snapshot of every registered worker, in no particular order.
#[derive(Debug, Clone, Serialize)]
pub struct AllWorkerInfo {
    pub count: usize,
    pub infos: Vec<WorkerInfo>,
}

/// Workers by id, with a live count kept in step with inserts and removals.
#[derive(Default)]
pub struct Registry {
    workers: DashMap<WorkerId, WorkerProcess>,
    count: AtomicUsize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a worker. Returns false, leaving the map untouched, if the id
    /// is already present.
    ///
    /// The count moves while the entry's shard lock is held, so a racing
    /// remove of the same id always sees the increment first.
    pub fn add(&self, id: WorkerId, worker: WorkerProcess) -> bool {
        match self.workers.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                self.count.fetch_add(1, Ordering::AcqRel);
                slot.insert(worker);
                true
            }
        }
    }

    /// Remove a worker. Returns false if it was not present.
    pub fn remove(&self, id: &WorkerId) -> bool {
        match self.workers.entry(*id) {
            Entry::Occupied(slot) => {
                self.count.fetch_sub(1, Ordering::AcqRel);
                slot.remove();
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn item(&self, id: &WorkerId) -> Result<WorkerProcess, RegistryError> {
        self.workers
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or(RegistryError::NotFound(*id))
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Best-effort snapshot. Adds and removals racing with the scan may or
    /// may not be reflected.
    pub fn unsorted_info(&self) -> AllWorkerInfo {
        let workers: Vec<WorkerProcess> = self
            .workers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let infos: Vec<WorkerInfo> = workers.iter().map(WorkerProcess::info).collect();

        AllWorkerInfo {
            count: infos.len(),
            infos,
        }
    }

    /// Handles to every registered worker.
    pub fn workers(&self) -> Vec<WorkerProcess> {
        self.workers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}
