// ============================================================================
// Tick Scheduling and Pending Saves
// ============================================================================
//
// All store work that must coalesce happens at tick boundaries:
//
// - TickQueue: idempotent "schedule if not already scheduled" flags,
//   drained once per tick.
// - PersistenceScheduler: the pending-save queue. A flush takes the whole
//   queue at once; anything scheduled afterwards belongs to the next tick.
//
// ============================================================================

use crate::core::{Result, StoreError};
use crate::identity::ClientId;
use crate::record::{CommitKind, RecordRef};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TickTask {
    FlushSaves,
    RecordChanges,
}

#[derive(Debug, Default)]
pub struct TickQueue {
    scheduled: Vec<TickTask>,
    drain_claimed: bool,
}

impl TickQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true only for the first request of a task within a tick.
    pub fn schedule(&mut self, task: TickTask) -> bool {
        if self.scheduled.contains(&task) {
            return false;
        }
        self.scheduled.push(task);
        true
    }

    pub fn unschedule(&mut self, task: TickTask) {
        self.scheduled.retain(|scheduled| *scheduled != task);
    }

    pub fn is_idle(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Drain the scheduled set in scheduling order.
    pub fn take(&mut self) -> Vec<TickTask> {
        std::mem::take(&mut self.scheduled)
    }

    /// Claim the right to spawn the drain for this tick.
    pub fn claim_drain(&mut self) -> bool {
        !std::mem::replace(&mut self.drain_claimed, true)
    }

    pub fn release_drain(&mut self) {
        self.drain_claimed = false;
    }
}

pub type SaveResult = Result<RecordRef>;

/// Completion of one scheduled save; clone freely.
pub type SaveFuture = Shared<BoxFuture<'static, SaveResult>>;

#[derive(Debug, Clone)]
pub struct PendingSave {
    pub record: RecordRef,
    pub kind: CommitKind,
}

/// One flush worth of pending saves, split by adapter hook.
#[derive(Debug, Default)]
pub struct SaveBuckets {
    pub created: Vec<RecordRef>,
    pub updated: Vec<RecordRef>,
    pub deleted: Vec<RecordRef>,
}

impl SaveBuckets {
    pub fn partition(saves: Vec<PendingSave>) -> Self {
        let mut buckets = Self::default();
        for save in saves {
            match save.kind {
                CommitKind::Create => buckets.created.push(save.record),
                CommitKind::Update => buckets.updated.push(save.record),
                CommitKind::Delete => buckets.deleted.push(save.record),
            }
        }
        buckets
    }

    pub fn len(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
pub struct PersistenceScheduler {
    queue: Vec<PendingSave>,
    queued: HashMap<ClientId, SaveFuture>,
    /// Completions waiting for an acknowledgement, flushed or not
    resolvers: HashMap<ClientId, oneshot::Sender<SaveResult>>,
}

impl PersistenceScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queued_future(&self, client_id: ClientId) -> Option<SaveFuture> {
        self.queued.get(&client_id).cloned()
    }

    pub fn enqueue(&mut self, record: RecordRef, kind: CommitKind) -> SaveFuture {
        let client_id = record.client_id();
        if let Some(existing) = self.queued.get(&client_id) {
            return existing.clone();
        }

        let (tx, rx) = oneshot::channel();
        let future = rx
            .map(|received| {
                received.unwrap_or_else(|_| {
                    Err(StoreError::CommitFailed("save completion was dropped".into()))
                })
            })
            .boxed()
            .shared();

        self.resolvers.insert(client_id, tx);
        self.queued.insert(client_id, future.clone());
        self.queue.push(PendingSave { record, kind });
        future
    }

    /// Snapshot and clear the queue.
    pub fn take_queue(&mut self) -> Vec<PendingSave> {
        self.queued.clear();
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_awaiting_ack(&self, client_id: ClientId) -> bool {
        self.resolvers.contains_key(&client_id)
    }

    /// Complete the save of a record. Returns false if nobody was waiting.
    pub fn resolve(&mut self, client_id: ClientId, result: SaveResult) -> bool {
        match self.resolvers.remove(&client_id) {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    /// Drop a record from the queue and fail its completion.
    pub fn cancel(&mut self, client_id: ClientId, error: StoreError) {
        self.queue.retain(|save| save.record.client_id() != client_id);
        self.queued.remove(&client_id);
        self.resolve(client_id, Err(error));
    }

    pub fn cancel_all(&mut self, error: StoreError) {
        self.queue.clear();
        self.queued.clear();
        for (_, tx) in self.resolvers.drain() {
            let _ = tx.send(Err(error.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use std::sync::Arc;

    fn record(client: u64) -> RecordRef {
        Arc::new(Record::new("widget".into(), ClientId(client), None))
    }

    #[test]
    fn test_tick_queue_schedules_once() {
        let mut ticks = TickQueue::new();
        assert!(ticks.schedule(TickTask::FlushSaves));
        assert!(!ticks.schedule(TickTask::FlushSaves));
        assert!(ticks.schedule(TickTask::RecordChanges));

        assert_eq!(
            ticks.take(),
            vec![TickTask::FlushSaves, TickTask::RecordChanges]
        );
        assert!(ticks.is_idle());
        assert!(ticks.schedule(TickTask::FlushSaves));
    }

    #[test]
    fn test_drain_claimed_once_per_tick() {
        let mut ticks = TickQueue::new();
        assert!(ticks.claim_drain());
        assert!(!ticks.claim_drain());
        ticks.release_drain();
        assert!(ticks.claim_drain());
    }

    #[test]
    fn test_enqueue_is_idempotent_until_taken() {
        let mut scheduler = PersistenceScheduler::new();
        let a = record(1);
        scheduler.enqueue(a.clone(), CommitKind::Update);
        scheduler.enqueue(a.clone(), CommitKind::Update);
        assert_eq!(scheduler.len(), 1);

        let taken = scheduler.take_queue();
        assert_eq!(taken.len(), 1);
        assert!(scheduler.is_empty());
        assert!(scheduler.is_awaiting_ack(ClientId(1)));

        scheduler.enqueue(a, CommitKind::Update);
        assert_eq!(scheduler.len(), 1);
    }

    #[test]
    fn test_partition_by_kind() {
        let saves = vec![
            PendingSave { record: record(1), kind: CommitKind::Create },
            PendingSave { record: record(2), kind: CommitKind::Update },
            PendingSave { record: record(3), kind: CommitKind::Delete },
            PendingSave { record: record(4), kind: CommitKind::Update },
        ];
        let buckets = SaveBuckets::partition(saves);
        assert_eq!(buckets.created.len(), 1);
        assert_eq!(buckets.updated.len(), 2);
        assert_eq!(buckets.deleted.len(), 1);
        assert_eq!(buckets.updated[1].client_id(), ClientId(4));
    }

    #[tokio::test]
    async fn test_resolve_completes_future() {
        let mut scheduler = PersistenceScheduler::new();
        let a = record(1);
        let future = scheduler.enqueue(a.clone(), CommitKind::Create);
        assert!(scheduler.resolve(ClientId(1), Ok(a.clone())));
        assert!(!scheduler.resolve(ClientId(1), Ok(a.clone())));

        let saved = future.await.unwrap();
        assert!(Arc::ptr_eq(&saved, &a));
    }

    #[tokio::test]
    async fn test_cancel_fails_future() {
        let mut scheduler = PersistenceScheduler::new();
        let future = scheduler.enqueue(record(1), CommitKind::Update);
        scheduler.cancel(ClientId(1), StoreError::Destroyed);
        assert!(scheduler.is_empty());
        assert_eq!(future.await.unwrap_err(), StoreError::Destroyed);
    }
}
