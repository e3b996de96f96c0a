//! Shared piece work queue.
//!
//! The only state shared between peer workers. Every operation runs under a
//! single mutex, so claiming and releasing an item is atomic and no piece is
//! ever in flight on two workers at once. Waiters are woken through a
//! [`Notify`] whenever work returns, completes, or the run ends.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use super::bitfield::Bitfield;
use super::{PieceIndex, PieceWork};

/// Result of asking the queue for work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Exclusive ownership of one piece until it completes or is released.
    Piece(PieceWork),
    /// Work remains but none of it is available from this peer.
    Unavailable,
    /// The run is over; the worker should close its connection.
    Finished,
}

/// Point-in-time view of queue progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub live_workers: usize,
    pub parked_workers: usize,
    pub finished: bool,
}

#[derive(Debug)]
struct QueueState {
    pending: BTreeMap<PieceIndex, PieceWork>,
    in_flight: BTreeSet<PieceIndex>,
    completed: BTreeSet<PieceIndex>,
    total: usize,
    live_workers: usize,
    parked_workers: usize,
    finished: bool,
}

impl QueueState {
    fn is_stalled(&self) -> bool {
        !self.finished
            && !self.pending.is_empty()
            && self.in_flight.is_empty()
            && self.live_workers > 0
            && self.parked_workers == self.live_workers
    }
}

/// Work queue shared by every peer worker of one run.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    changed: Notify,
}

impl WorkQueue {
    /// Creates a queue holding every item of `work`, ordered by index.
    pub fn new(work: Vec<PieceWork>) -> Self {
        let total = work.len();
        let pending = work.into_iter().map(|item| (item.index, item)).collect();

        Self {
            state: Mutex::new(QueueState {
                pending,
                in_flight: BTreeSet::new(),
                completed: BTreeSet::new(),
                total,
                live_workers: 0,
                parked_workers: 0,
                finished: false,
            }),
            changed: Notify::new(),
        }
    }

    /// Counts a new worker as live until the returned slot is dropped.
    pub fn register_worker(self: &Arc<Self>) -> WorkerSlot {
        self.state.lock().live_workers += 1;
        WorkerSlot {
            queue: Arc::clone(self),
        }
    }

    /// Claims the lowest-indexed pending piece the peer advertises.
    ///
    /// Pieces the peer lacks stay in the queue untouched.
    pub fn claim(&self, available: &Bitfield) -> Claim {
        let mut state = self.state.lock();
        if state.finished || state.completed.len() == state.total {
            return Claim::Finished;
        }

        let index = state
            .pending
            .keys()
            .copied()
            .find(|index| available.has_piece(index.as_usize()));

        match index.and_then(|index| state.pending.remove(&index)) {
            Some(work) => {
                state.in_flight.insert(work.index);
                Claim::Piece(work)
            }
            None => Claim::Unavailable,
        }
    }

    /// Returns a claimed piece so another worker can pick it up.
    pub fn release(&self, work: PieceWork) {
        {
            let mut state = self.state.lock();
            state.in_flight.remove(&work.index);
            if !state.completed.contains(&work.index) {
                tracing::debug!("Piece {} returned to queue", work.index);
                state.pending.insert(work.index, work);
            }
        }
        self.changed.notify_waiters();
    }

    /// Marks a claimed piece as verified.
    ///
    /// Returns false if the piece was already complete.
    pub fn complete(&self, index: PieceIndex) -> bool {
        let newly_completed = {
            let mut state = self.state.lock();
            state.in_flight.remove(&index);
            state.pending.remove(&index);
            state.completed.insert(index)
        };
        self.changed.notify_waiters();
        newly_completed
    }

    /// Marks the calling worker as idle until the guard is dropped.
    ///
    /// Parking does not wake other waiters; stall detection is evaluated
    /// when a parked worker's own deadline expires.
    pub fn park(&self) -> ParkGuard<'_> {
        self.state.lock().parked_workers += 1;
        ParkGuard { queue: self }
    }

    /// Ends the run; every waiter wakes and later claims see `Finished`.
    pub fn shutdown(&self) {
        self.state.lock().finished = true;
        self.changed.notify_waiters();
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// True when work remains but no live worker can make progress on it.
    pub fn is_stalled(&self) -> bool {
        self.state.lock().is_stalled()
    }

    /// Future resolving at the next release, completion, worker exit, or shutdown.
    ///
    /// Create it (and `enable` it) before inspecting queue state, so a
    /// change between the check and the wait is not missed.
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    pub fn snapshot(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            total: state.total,
            pending: state.pending.len(),
            in_flight: state.in_flight.len(),
            completed: state.completed.len(),
            live_workers: state.live_workers,
            parked_workers: state.parked_workers,
            finished: state.finished,
        }
    }

    fn worker_exited(&self) {
        {
            let mut state = self.state.lock();
            state.live_workers = state.live_workers.saturating_sub(1);
        }
        self.changed.notify_waiters();
    }
}

/// Registration of one live worker; dropping it records the exit.
#[derive(Debug)]
pub struct WorkerSlot {
    queue: Arc<WorkQueue>,
}

impl WorkerSlot {
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.queue.worker_exited();
    }
}

/// Idle marker for a parked worker.
#[derive(Debug)]
pub struct ParkGuard<'a> {
    queue: &'a WorkQueue,
}

impl Drop for ParkGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock();
        state.parked_workers = state.parked_workers.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn work(count: u32) -> Vec<PieceWork> {
        (0..count)
            .map(|i| PieceWork {
                index: PieceIndex::new(i),
                length: 100,
                hash: [i as u8; 20],
            })
            .collect()
    }

    fn full_bitfield(count: usize) -> Bitfield {
        let mut bitfield = Bitfield::with_piece_count(count);
        for i in 0..count {
            bitfield.set_piece(i);
        }
        bitfield
    }

    fn claimed(claim: Claim) -> PieceWork {
        match claim {
            Claim::Piece(work) => work,
            other => panic!("expected a piece, got {other:?}"),
        }
    }

    #[test]
    fn test_claims_in_index_order_and_exclusively() {
        let queue = WorkQueue::new(work(3));
        let all = full_bitfield(3);

        let first = claimed(queue.claim(&all));
        let second = claimed(queue.claim(&all));
        assert_eq!(first.index, PieceIndex::new(0));
        assert_eq!(second.index, PieceIndex::new(1));

        let stats = queue.snapshot();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_flight, 2);
    }

    #[test]
    fn test_claim_skips_pieces_peer_lacks() {
        let queue = WorkQueue::new(work(4));
        let mut bitfield = Bitfield::with_piece_count(4);
        bitfield.set_piece(2);

        let item = claimed(queue.claim(&bitfield));
        assert_eq!(item.index, PieceIndex::new(2));
        assert_eq!(queue.claim(&bitfield), Claim::Unavailable);
        assert_eq!(queue.snapshot().pending, 3);
    }

    #[test]
    fn test_unavailable_leaves_queue_unchanged() {
        let queue = WorkQueue::new(work(3));
        let before = queue.snapshot();

        assert_eq!(
            queue.claim(&Bitfield::with_piece_count(3)),
            Claim::Unavailable
        );
        assert_eq!(queue.snapshot(), before);
    }

    #[test]
    fn test_release_returns_item_for_another_worker() {
        let queue = WorkQueue::new(work(2));
        let all = full_bitfield(2);

        let item = claimed(queue.claim(&all));
        queue.release(item.clone());

        let again = claimed(queue.claim(&all));
        assert_eq!(again, item);
    }

    #[test]
    fn test_complete_is_reported_once_and_finishes() {
        let queue = WorkQueue::new(work(1));
        let all = full_bitfield(1);

        let item = claimed(queue.claim(&all));
        assert!(queue.complete(item.index));
        assert!(!queue.complete(item.index));

        // A late release of completed work must not requeue it.
        queue.release(item);
        assert_eq!(queue.snapshot().pending, 0);
        assert_eq!(queue.claim(&all), Claim::Finished);
    }

    #[test]
    fn test_stall_requires_every_live_worker_parked() {
        let queue = Arc::new(WorkQueue::new(work(2)));
        let first = queue.register_worker();
        let second = queue.register_worker();
        assert!(!queue.is_stalled());

        let parked = queue.park();
        assert!(!queue.is_stalled());

        drop(second);
        assert!(queue.is_stalled());
        assert_eq!(queue.snapshot().live_workers, 1);

        drop(parked);
        assert!(!queue.is_stalled());
        assert_eq!(queue.snapshot().parked_workers, 0);
        drop(first);
    }

    #[test]
    fn test_in_flight_work_is_not_a_stall() {
        let queue = Arc::new(WorkQueue::new(work(2)));
        let _slot = queue.register_worker();
        let _item = claimed(queue.claim(&full_bitfield(2)));

        let _parked = queue.park();
        assert!(!queue.is_stalled());
    }

    #[tokio::test]
    async fn test_changed_wakes_on_release() {
        let queue = Arc::new(WorkQueue::new(work(1)));
        let item = claimed(queue.claim(&full_bitfield(1)));

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let notified = queue.changed();
                tokio::pin!(notified);
                notified.as_mut().enable();
                notified.await;
                queue.claim(&full_bitfield(1))
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.release(item);

        let claim = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(claim, Claim::Piece(_)));
    }

    #[tokio::test]
    async fn test_shutdown_finishes_claims() {
        let queue = WorkQueue::new(work(3));
        queue.shutdown();

        assert!(queue.is_finished());
        assert_eq!(queue.claim(&full_bitfield(3)), Claim::Finished);
    }
}
