//! Worker table: spawn, reap, prune.
//!
//! Identities come from a monotonic counter and are never reused; reaping
//! always targets the highest live identity so the set stays dense. All
//! mutation happens under one mutex.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct WorkerEntry {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct PoolInner {
    workers: BTreeMap<u64, WorkerEntry>,
    next_id: u64,
    /// Reaped workers finishing their current iteration; joined at
    /// shutdown so their in-flight results still post.
    draining: Vec<JoinHandle<()>>,
}

/// The worker table. Size stays within `min_workers..=soft_cap` except
/// transiently while a spawn or reap is applied.
#[derive(Debug)]
pub(crate) struct WorkerPool {
    min_workers: usize,
    soft_cap: usize,
    inner: Mutex<PoolInner>,
}

impl WorkerPool {
    pub(crate) fn new(min_workers: usize, soft_cap: usize) -> Self {
        let min_workers = min_workers.max(1);
        Self {
            min_workers,
            soft_cap: soft_cap.max(min_workers),
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub(crate) fn min_workers(&self) -> usize {
        self.min_workers
    }

    pub(crate) fn soft_cap(&self) -> usize {
        self.soft_cap
    }

    pub(crate) fn count(&self) -> usize {
        self.lock().workers.len()
    }

    /// Remove workers whose task has already terminated (and finished
    /// drainers). Returns how many table entries were dropped.
    pub(crate) fn prune(&self) -> usize {
        let mut inner = self.lock();
        let dead: Vec<u64> = inner
            .workers
            .iter()
            .filter(|(_, entry)| entry.join.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            inner.workers.remove(id);
        }
        inner.draining.retain(|join| !join.is_finished());
        dead.len()
    }

    /// Spawn one worker unless the table is at the soft cap. `start`
    /// receives the new identity and its per-worker stop receiver.
    pub(crate) fn spawn<F>(&self, start: F) -> Option<u64>
    where
        F: FnOnce(u64, watch::Receiver<bool>) -> JoinHandle<()>,
    {
        let mut inner = self.lock();
        if inner.workers.len() >= self.soft_cap {
            return None;
        }
        let id = inner.next_id;
        inner.next_id += 1;

        let (stop_tx, stop_rx) = watch::channel(false);
        let join = start(id, stop_rx);
        inner.workers.insert(id, WorkerEntry { stop: stop_tx, join });
        Some(id)
    }

    /// Signal the highest-identity worker to stop after its current
    /// iteration and retire it from the table. Never reaps below
    /// `min_workers`.
    pub(crate) fn reap_highest(&self) -> Option<u64> {
        let mut inner = self.lock();
        if inner.workers.len() <= self.min_workers {
            return None;
        }
        let id = *inner.workers.keys().next_back()?;
        let entry = inner.workers.remove(&id)?;
        let _ = entry.stop.send(true);
        inner.draining.push(entry.join);
        Some(id)
    }

    /// Signal every worker to stop after its current iteration.
    pub(crate) fn stop_all(&self) {
        let inner = self.lock();
        for entry in inner.workers.values() {
            let _ = entry.stop.send(true);
        }
    }

    /// Take every join handle (live and draining) for the shutdown wait.
    pub(crate) fn take_handles(&self) -> Vec<JoinHandle<()>> {
        let mut inner = self.lock();
        let mut handles: Vec<JoinHandle<()>> = inner.draining.drain(..).collect();
        let ids: Vec<u64> = inner.workers.keys().copied().collect();
        for id in ids {
            if let Some(entry) = inner.workers.remove(&id) {
                handles.push(entry.join);
            }
        }
        handles
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("worker pool lock poisoned")
    }
}
