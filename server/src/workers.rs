//! Worker queues executing fetch sub-requests.
//!
//! A fixed set of worker threads, one request queue each, fronted by a
//! bounded pool of request slots per queue. The dispatch protocol is:
//! take a free tag from a queue's slot pool, push work under that tag to a
//! worker, wait on the tag, return the tag. Taking a tag fails instead of
//! blocking when the pool is exhausted.
//!
//! Workers are assigned to NUMA nodes round-robin and optionally pinned to
//! their node's CPUs, which lets the dispatcher route a fetch to a worker
//! local to the memory the row lives on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::affinity;
use crate::error::{CacheError, CacheResult};

/// Unit of work executed on a worker queue.
pub type FetchWork = Box<dyn FnOnce() -> CacheResult<()> + Send + 'static>;

/// Handle to a request slot, valid from take until return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTag {
    queue: usize,
    index: usize,
}

struct Slot {
    work: Mutex<Option<FetchWork>>,
    result: Mutex<Option<CacheResult<()>>>,
    completed: Condvar,
}

struct SlotPool {
    slots: Vec<Slot>,
    free: Mutex<Vec<usize>>,
}

impl SlotPool {
    fn new(count: usize) -> Self {
        let slots = (0..count)
            .map(|_| Slot {
                work: Mutex::new(None),
                result: Mutex::new(None),
                completed: Condvar::new(),
            })
            .collect();
        Self {
            slots,
            free: Mutex::new((0..count).rev().collect()),
        }
    }
}

struct PoolShared {
    pools: Vec<SlotPool>,
    shutdown: AtomicBool,
}

impl PoolShared {
    fn slot(&self, tag: RequestTag) -> CacheResult<&Slot> {
        self.pools
            .get(tag.queue)
            .and_then(|pool| pool.slots.get(tag.index))
            .ok_or_else(|| CacheError::Unexpected(format!("invalid request tag {tag:?}")))
    }

    fn complete(&self, tag: RequestTag, rc: CacheResult<()>) {
        if let Ok(slot) = self.slot(tag) {
            *slot.result.lock() = Some(rc);
            slot.completed.notify_all();
        }
    }
}

/// Fixed pool of worker threads with per-queue request slots.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    senders: Vec<Sender<RequestTag>>,
    handles: Vec<JoinHandle<()>>,
    node_of_worker: Vec<u32>,
    next_by_node: AtomicUsize,
}

impl WorkerPool {
    /// Spawn `queues` workers, each with its own request queue and a pool
    /// of `slots_per_queue` request slots. Workers are assigned to `nodes`
    /// round-robin and pinned to their node's CPUs when `pin` is set.
    pub fn spawn(queues: usize, slots_per_queue: usize, nodes: &[u32], pin: bool) -> Self {
        let shared = Arc::new(PoolShared {
            pools: (0..queues).map(|_| SlotPool::new(slots_per_queue)).collect(),
            shutdown: AtomicBool::new(false),
        });

        let mut senders = Vec::with_capacity(queues);
        let mut handles = Vec::with_capacity(queues);
        let mut node_of_worker = Vec::with_capacity(queues);

        for worker_id in 0..queues {
            let node = nodes[worker_id % nodes.len()];
            node_of_worker.push(node);

            let (tx, rx) = unbounded();
            senders.push(tx);

            let shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("fetch-worker-{worker_id}"))
                .spawn(move || {
                    if pin {
                        if let Err(e) = affinity::pin_to_node(node) {
                            tracing::debug!("worker {worker_id} not pinned to node {node}: {e}");
                        }
                    }
                    worker_loop(&shared, rx);
                })
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            shared,
            senders,
            handles,
            node_of_worker,
            next_by_node: AtomicUsize::new(0),
        }
    }

    /// Number of worker queues.
    pub fn num_queues(&self) -> usize {
        self.senders.len()
    }

    /// Worker serving the given NUMA node, round-robin among the workers
    /// assigned to it. Falls back to round-robin over all workers for nodes
    /// no worker is assigned to.
    pub fn worker_for_node(&self, node: u32) -> usize {
        let step = self.next_by_node.fetch_add(1, Ordering::Relaxed);
        let candidates: Vec<usize> = self
            .node_of_worker
            .iter()
            .enumerate()
            .filter(|(_, &n)| n == node)
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            step % self.num_queues()
        } else {
            candidates[step % candidates.len()]
        }
    }

    /// A uniformly random worker.
    pub fn random_worker(&self) -> usize {
        rand::rng().random_range(0..self.num_queues())
    }

    /// Take a free request slot from the queue's pool. Errors instead of
    /// blocking when the pool is exhausted.
    pub fn get_free_request_tag(&self, queue: usize) -> CacheResult<RequestTag> {
        let pool = self
            .shared
            .pools
            .get(queue)
            .ok_or_else(|| CacheError::Unexpected(format!("no such queue: {queue}")))?;
        let index = pool.free.lock().pop().ok_or(CacheError::OutOfMemory)?;
        Ok(RequestTag { queue, index })
    }

    /// Hand a unit of work to a worker under the given tag.
    pub fn push_request(
        &self,
        worker_id: usize,
        tag: RequestTag,
        work: FetchWork,
    ) -> CacheResult<()> {
        let slot = self.shared.slot(tag)?;
        *slot.result.lock() = None;
        *slot.work.lock() = Some(work);
        let sender = self
            .senders
            .get(worker_id)
            .ok_or_else(|| CacheError::Unexpected(format!("no such worker: {worker_id}")))?;
        sender.send(tag).map_err(|_| CacheError::Interrupted)
    }

    /// Block until the tagged request resolves.
    pub fn wait(&self, tag: RequestTag) -> CacheResult<()> {
        let slot = match self.shared.slot(tag) {
            Ok(slot) => slot,
            Err(e) => return Err(e),
        };
        let mut result = slot.result.lock();
        loop {
            if let Some(rc) = result.take() {
                return rc;
            }
            slot.completed.wait(&mut result);
        }
    }

    /// Return the slot to its pool. Always performed by the dispatcher,
    /// whatever the request's outcome.
    pub fn return_request_tag(&self, tag: RequestTag) {
        if let Ok(slot) = self.shared.slot(tag) {
            *slot.work.lock() = None;
            *slot.result.lock() = None;
            self.shared.pools[tag.queue].free.lock().push(tag.index);
        }
    }

    fn shutdown(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        // Dropping the senders disconnects the queues; workers drain what
        // is left, resolving it as interrupted, then exit.
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared, rx: Receiver<RequestTag>) {
    while let Ok(tag) = rx.recv() {
        if shared.shutdown.load(Ordering::Acquire) {
            shared.complete(tag, Err(CacheError::Interrupted));
            continue;
        }
        let work = match shared.slot(tag) {
            Ok(slot) => slot.work.lock().take(),
            Err(_) => None,
        };
        let rc = match work {
            Some(work) => work(),
            None => Err(CacheError::Unexpected("empty request slot".to_string())),
        };
        shared.complete(tag, rc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn pool(queues: usize, slots: usize) -> WorkerPool {
        WorkerPool::spawn(queues, slots, &[0], false)
    }

    #[test]
    fn test_request_roundtrip() {
        let pool = pool(2, 4);
        let counter = Arc::new(AtomicU64::new(0));

        let tag = pool.get_free_request_tag(0).unwrap();
        let counter2 = Arc::clone(&counter);
        pool.push_request(
            1,
            tag,
            Box::new(move || {
                counter2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();

        assert!(pool.wait(tag).is_ok());
        pool.return_request_tag(tag);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_work_error_propagates() {
        let pool = pool(1, 2);
        let tag = pool.get_free_request_tag(0).unwrap();
        pool.push_request(
            0,
            tag,
            Box::new(|| Err(CacheError::SizeMismatch("short read".to_string()))),
        )
        .unwrap();

        assert!(matches!(pool.wait(tag), Err(CacheError::SizeMismatch(_))));
        pool.return_request_tag(tag);
    }

    #[test]
    fn test_slot_exhaustion_errors_instead_of_blocking() {
        let pool = pool(1, 1);
        let tag = pool.get_free_request_tag(0).unwrap();
        assert_eq!(
            pool.get_free_request_tag(0),
            Err(CacheError::OutOfMemory)
        );
        pool.return_request_tag(tag);
        assert!(pool.get_free_request_tag(0).is_ok());
    }

    #[test]
    fn test_slots_reusable_across_requests() {
        let pool = pool(1, 1);
        for _ in 0..16 {
            let tag = pool.get_free_request_tag(0).unwrap();
            pool.push_request(0, tag, Box::new(|| Ok(()))).unwrap();
            assert!(pool.wait(tag).is_ok());
            pool.return_request_tag(tag);
        }
    }

    #[test]
    fn test_worker_for_node_prefers_matching_workers() {
        let pool = WorkerPool::spawn(4, 1, &[0, 1], false);
        for _ in 0..8 {
            let w = pool.worker_for_node(1);
            assert_eq!(w % 2, 1, "worker {w} is not assigned to node 1");
        }
    }

    #[test]
    fn test_unknown_queue_rejected() {
        let pool = pool(1, 1);
        assert!(pool.get_free_request_tag(5).is_err());
    }
}
