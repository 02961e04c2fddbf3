use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::ptr_queue::{CardPtr, PtrQueue, PtrQueueSet, PtrQueueSetOps};
use crate::Config;

/// The refinement callback supplied by the collector. Returning `false`
/// stops the current buffer early; the remainder is re-enqueued.
pub trait CardPtrClosure: Send + Sync {
    fn do_card_ptr(&self, card: CardPtr, worker_id: usize) -> bool;
}

struct FreeIds {
    free: Vec<i32>,
    claimed: usize,
}

/// Hands out small worker ids in `[0, size)` to mutator threads doing
/// inline buffer processing, so each picks a distinct parallel lane.
pub struct FreeIdSet {
    size: usize,
    state: Mutex<FreeIds>,
    cond: Condvar,
}

impl FreeIdSet {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            state: Mutex::new(FreeIds {
                free: (0..size as i32).rev().collect(),
                claimed: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Blocking claim, for consumers that can afford to wait.
    pub fn claim_par_id(&self) -> i32 {
        let mut st = self.state.lock();
        while st.free.is_empty() {
            self.cond.wait(&mut st);
        }
        st.claimed += 1;
        match st.free.pop() {
            Some(id) => id,
            None => -1,
        }
    }

    /// Mutator-side claim: never blocks, `-1` when all lanes are busy.
    pub fn claim_par_id_nonblocking(&self) -> i32 {
        let mut st = self.state.lock();
        match st.free.pop() {
            Some(id) => {
                st.claimed += 1;
                id
            }
            None => -1,
        }
    }

    pub fn release_par_id(&self, id: i32) {
        debug_assert!(id >= 0 && (id as usize) < self.size);
        let mut st = self.state.lock();
        debug_assert!(st.claimed > 0);
        debug_assert!(!st.free.contains(&id), "Releasing an unclaimed id");
        st.free.push(id);
        st.claimed -= 1;
        self.cond.notify_one();
    }
}

/// A mutator thread's dirty-card queue: the buffer plus the worker id the
/// thread currently holds for inline processing (`-1` when none).
pub struct DirtyCardQueue {
    queue: PtrQueue,
    claimed_par_id: Cell<i32>,
}

// Owns its buffer outright; the card pointers inside are plain addresses.
unsafe impl Send for DirtyCardQueue {}

impl DirtyCardQueue {
    pub fn new(active: bool) -> Self {
        Self {
            queue: PtrQueue::new(active),
            claimed_par_id: Cell::new(-1),
        }
    }

    pub fn is_active(&self) -> bool {
        self.queue.is_active()
    }

    pub fn set_active(&mut self, active: bool) {
        self.queue.set_active(active);
    }

    pub fn size(&self) -> usize {
        self.queue.size()
    }

    pub fn claimed_par_id(&self) -> i32 {
        self.claimed_par_id.get()
    }

    pub fn set_claimed_par_id(&self, id: i32) {
        self.claimed_par_id.set(id);
    }

    /// Write-barrier entry point for the owning thread.
    pub fn enqueue(&mut self, set: &DirtyCardQueueSet, card: CardPtr) {
        let hook = MutatorHook {
            set,
            claimed: &self.claimed_par_id,
        };
        self.queue.enqueue(&hook, card);
    }

    pub fn flush(&mut self, set: &DirtyCardQueueSet) {
        self.queue.flush(set.base());
    }

    pub fn reset(&mut self) {
        self.queue.reset();
    }

    pub(crate) fn take_buffer(&mut self) -> Option<(Box<[CardPtr]>, usize)> {
        self.queue.take_buffer()
    }
}

/// Adapter giving `PtrQueue` the dirty-card overflow behavior: under
/// backpressure the mutator is asked to process its own buffer inline.
struct MutatorHook<'a> {
    set: &'a DirtyCardQueueSet,
    claimed: &'a Cell<i32>,
}

impl<'a> PtrQueueSetOps for MutatorHook<'a> {
    fn base(&self) -> &PtrQueueSet {
        &self.set.base
    }

    fn process_or_enqueue_complete_buffer(
        &self,
        buf: Box<[CardPtr]>,
        index: usize,
    ) -> Option<Box<[CardPtr]>> {
        self.set.process_or_enqueue_with(self.claimed, buf, index)
    }
}

/// Process-wide dirty-card queue state: the base completed-buffer
/// machinery, a shared queue for threads without one of their own, the
/// worker-id lanes and the registry of attached per-thread queues used by
/// the safepoint bulk operations.
pub struct DirtyCardQueueSet {
    base: PtrQueueSet,
    closure: Mutex<Option<Arc<dyn CardPtrClosure>>>,
    shared_dirty_card_queue: Mutex<PtrQueue>,
    free_ids: FreeIdSet,
    /// Attached mutator queues. Only safepoint operations walk this while
    /// the owning threads are stopped.
    queues: Mutex<Vec<NonNull<DirtyCardQueue>>>,
    processed_buffers_mut: AtomicUsize,
    processed_buffers_rs_thread: AtomicUsize,
    cards_processed: AtomicUsize,
}

unsafe impl Send for DirtyCardQueueSet {}
unsafe impl Sync for DirtyCardQueueSet {}

impl DirtyCardQueueSet {
    pub fn new(config: &Config) -> Self {
        Self {
            base: PtrQueueSet::new(
                config.buffer_size,
                config.process_completed_threshold,
                config.max_completed_queue,
                true,
            ),
            closure: Mutex::new(None),
            shared_dirty_card_queue: Mutex::new(PtrQueue::new(true)),
            free_ids: FreeIdSet::new(config.num_par_ids),
            queues: Mutex::new(Vec::new()),
            processed_buffers_mut: AtomicUsize::new(0),
            processed_buffers_rs_thread: AtomicUsize::new(0),
            cards_processed: AtomicUsize::new(0),
        }
    }

    pub fn base(&self) -> &PtrQueueSet {
        &self.base
    }

    pub fn num_par_ids(&self) -> usize {
        self.free_ids.size()
    }

    pub fn free_ids(&self) -> &FreeIdSet {
        &self.free_ids
    }

    pub fn set_closure(&self, cl: Arc<dyn CardPtrClosure>) {
        *self.closure.lock() = Some(cl);
    }

    pub fn processed_buffers_mut(&self) -> usize {
        self.processed_buffers_mut.load(Ordering::Relaxed)
    }

    pub fn processed_buffers_rs_thread(&self) -> usize {
        self.processed_buffers_rs_thread.load(Ordering::Relaxed)
    }

    /// Cards pushed through the closure so far; the refinement policy reads
    /// this before and after a traversal.
    pub fn cards_processed(&self) -> usize {
        self.cards_processed.load(Ordering::Relaxed)
    }

    /// Attach a thread's queue so safepoint operations can reach it. The
    /// pointer must stay valid until `deregister_queue`.
    pub unsafe fn register_queue(&self, q: NonNull<DirtyCardQueue>) {
        self.queues.lock().push(q);
    }

    pub fn deregister_queue(&self, q: NonNull<DirtyCardQueue>) {
        self.queues.lock().retain(|p| *p != q);
    }

    /// Enqueue a dirtied card from outside any mutator thread.
    pub fn shared_enqueue(&self, card: CardPtr) {
        let mut q = self.shared_dirty_card_queue.lock();
        q.enqueue(&self.base, card);
    }

    /// Full-buffer decision: grow the completed queue while below the cap,
    /// otherwise ask the mutator to do the refinement work itself. Never
    /// rejects an enqueue.
    fn process_or_enqueue_with(
        &self,
        claimed: &Cell<i32>,
        buf: Box<[CardPtr]>,
        index: usize,
    ) -> Option<Box<[CardPtr]>> {
        let max = self.base.max_completed_queue();
        if max == -1 || (self.base.completed_buffers_num() as isize) < max {
            self.base.enqueue_complete_buffer(buf, index);
            return None;
        }
        if self.mut_process_buffer(claimed, &buf, index) {
            Some(buf)
        } else {
            self.base.enqueue_complete_buffer(buf, index);
            None
        }
    }

    /// Inline mutator-side processing. Reuses a worker id the thread
    /// already holds, or claims one without blocking; releases only a
    /// freshly claimed id. With no id and no lane free, gives up so the
    /// caller enqueues globally instead.
    pub fn mut_process_buffer(
        &self,
        claimed: &Cell<i32>,
        buf: &[CardPtr],
        index: usize,
    ) -> bool {
        let mut already_claimed = true;
        let mut worker = claimed.get();
        if worker == -1 {
            already_claimed = false;
            worker = self.free_ids.claim_par_id_nonblocking();
            if worker == -1 {
                return false;
            }
            claimed.set(worker);
        }
        let cl = match self.closure.lock().clone() {
            Some(cl) => cl,
            None => {
                if !already_claimed {
                    self.free_ids.release_par_id(worker);
                    claimed.set(-1);
                }
                return false;
            }
        };
        let res = self
            .apply_closure_to_buffer(&*cl, buf, index, worker as usize)
            .is_none();
        if res {
            self.processed_buffers_mut.fetch_add(1, Ordering::Relaxed);
        }
        if !already_claimed {
            self.free_ids.release_par_id(worker);
            claimed.set(-1);
        }
        res
    }

    /// Apply the closure to `buf[index..]` in order. `None` when the whole
    /// buffer was consumed; `Some(i)` when the closure stopped early with
    /// entry `i` unprocessed.
    pub fn apply_closure_to_buffer(
        &self,
        cl: &dyn CardPtrClosure,
        buf: &[CardPtr],
        index: usize,
        worker_id: usize,
    ) -> Option<usize> {
        debug_assert!(index <= buf.len());
        for i in index..buf.len() {
            if !cl.do_card_ptr(buf[i], worker_id) {
                return Some(i);
            }
            self.cards_processed.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Drain one completed buffer FIFO, if more than `stop_at` are pending.
    /// An early closure stop re-enqueues the remainder. Returns whether a
    /// buffer was fully processed.
    pub fn apply_closure_to_completed_buffer(
        &self,
        worker_id: usize,
        stop_at: usize,
        during_pause: bool,
    ) -> bool {
        debug_assert!(!during_pause || stop_at == 0, "Stop and drain during a pause");
        let node = match self.base.get_completed_buffer_lock(stop_at) {
            Some(n) => n,
            None => return false,
        };
        let cl = match self.closure.lock().clone() {
            Some(cl) => cl,
            None => {
                self.base.enqueue_complete_buffer(node.buf, node.index);
                return false;
            }
        };
        match self.apply_closure_to_buffer(&*cl, &node.buf, node.index, worker_id) {
            None => {
                self.processed_buffers_rs_thread
                    .fetch_add(1, Ordering::Relaxed);
                self.base.deallocate_buffer(node.buf);
                true
            }
            Some(stopped_at) => {
                self.base.enqueue_complete_buffer(node.buf, stopped_at);
                false
            }
        }
    }

    pub fn apply_closure_to_all_completed_buffers(&self, worker_id: usize) {
        while self.apply_closure_to_completed_buffer(worker_id, 0, false) {}
    }

    /// Safepoint only: run the closure over every attached thread's
    /// buffered cards and the shared queue, in place.
    pub fn iterate_closure_all_threads(&self, worker_id: usize) {
        let cl = match self.closure.lock().clone() {
            Some(cl) => cl,
            None => return,
        };
        let queues = self.queues.lock();
        for q in queues.iter() {
            unsafe {
                let dq = &mut *q.as_ptr();
                if let Some((buf, index)) = dq.take_buffer() {
                    let res = self.apply_closure_to_buffer(&*cl, &buf, index, worker_id);
                    debug_assert!(res.is_none(), "Closure must not stop at a safepoint");
                    self.base.deallocate_buffer(buf);
                }
            }
        }
        drop(queues);
        let mut shared = self.shared_dirty_card_queue.lock();
        if let Some((buf, index)) = shared.take_buffer() {
            let res = self.apply_closure_to_buffer(&*cl, &buf, index, worker_id);
            debug_assert!(res.is_none(), "Closure must not stop at a safepoint");
            self.base.deallocate_buffer(buf);
        }
    }

    /// Safepoint only: a concurrent cycle aborted, so all in-flight card
    /// logs are stale. Drop every completed buffer and reset every
    /// per-thread queue.
    pub fn abandon_logs(&self) {
        while let Some(node) = self.base.get_completed_buffer_lock(0) {
            self.base.deallocate_buffer(node.buf);
        }
        let queues = self.queues.lock();
        for q in queues.iter() {
            unsafe {
                (*q.as_ptr()).reset();
            }
        }
        drop(queues);
        self.shared_dirty_card_queue.lock().reset();
    }

    /// Safepoint only: splice every partially-filled per-thread buffer (and
    /// the shared queue) onto the completed list so the upcoming drain sees
    /// everything. The queue cap is lifted for the duration so the bulk
    /// enqueue cannot trip inline processing.
    pub fn concatenate_logs(&self) {
        let saved_max = self.base.max_completed_queue();
        self.base.set_max_completed_queue(-1);
        let queues = self.queues.lock();
        for q in queues.iter() {
            unsafe {
                let dq = &mut *q.as_ptr();
                if dq.size() > 0 {
                    if let Some((buf, index)) = dq.take_buffer() {
                        self.base.enqueue_complete_buffer(buf, index);
                    }
                }
            }
        }
        drop(queues);
        let mut shared = self.shared_dirty_card_queue.lock();
        if shared.size() > 0 {
            if let Some((buf, index)) = shared.take_buffer() {
                self.base.enqueue_complete_buffer(buf, index);
            }
        }
        drop(shared);
        self.base.set_max_completed_queue(saved_max);
    }
}
