use crossbeam_utils::atomic::AtomicCell;
use parking_lot::{Condvar, Mutex};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};

/// A card-table byte address recorded by a write barrier.
pub type CardPtr = *mut u8;

/// A buffer handed off to the global completed list, together with the
/// cursor it was filled down to. Entries occupy `[index, buf.len())`.
pub struct BufferNode {
    pub(crate) next: *mut BufferNode,
    pub index: usize,
    pub buf: Box<[CardPtr]>,
}

unsafe impl Send for BufferNode {}

fn new_buffer(size: usize) -> Box<[CardPtr]> {
    vec![null_mut(); size].into_boxed_slice()
}

/// Per-thread append-only buffer of dirty-card pointers. The cursor starts
/// at the buffer size and decrements toward zero; `[index, size)` holds the
/// valid entries.
pub struct PtrQueue {
    buf: Option<Box<[CardPtr]>>,
    index: usize,
    active: bool,
}

impl PtrQueue {
    pub fn new(active: bool) -> Self {
        Self {
            buf: None,
            index: 0,
            active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Number of entries currently buffered.
    pub fn size(&self) -> usize {
        match &self.buf {
            Some(buf) => buf.len() - self.index,
            None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn enqueue<S: PtrQueueSetOps>(&mut self, set: &S, ptr: CardPtr) {
        if !self.active {
            return;
        }
        self.enqueue_known_active(set, ptr);
    }

    pub fn enqueue_known_active<S: PtrQueueSetOps>(&mut self, set: &S, ptr: CardPtr) {
        if self.buf.is_none() || self.index == 0 {
            self.handle_zero_index(set);
        }
        debug_assert!(self.index > 0, "Queue index invariant violated");
        if let Some(buf) = self.buf.as_mut() {
            self.index -= 1;
            buf[self.index] = ptr;
        }
    }

    /// Full (or no) buffer on the enqueue path. Either the current buffer is
    /// processed inline and reused, or it goes to the completed list and a
    /// fresh pooled buffer takes its place.
    fn handle_zero_index<S: PtrQueueSetOps>(&mut self, set: &S) {
        if let Some(buf) = self.buf.take() {
            debug_assert_eq!(self.index, 0);
            match set.process_or_enqueue_complete_buffer(buf, self.index) {
                Some(buf) => {
                    // processed in place by the mutator, reuse as-is
                    self.index = buf.len();
                    self.buf = Some(buf);
                    return;
                }
                None => {}
            }
        }
        let buf = set.base().allocate_buffer();
        self.index = buf.len();
        self.buf = Some(buf);
    }

    /// Thread-death / safepoint flush: an untouched buffer goes back to the
    /// pool, a partially-filled one onto the completed list.
    pub fn flush(&mut self, set: &PtrQueueSet) {
        if let Some(buf) = self.buf.take() {
            if self.index == buf.len() {
                set.deallocate_buffer(buf);
            } else {
                set.enqueue_complete_buffer(buf, self.index);
            }
            self.index = 0;
        }
    }

    /// Discard all buffered entries, keeping the buffer.
    pub fn reset(&mut self) {
        if let Some(buf) = &self.buf {
            self.index = buf.len();
        }
    }

    /// Take the current buffer and cursor, leaving the queue bufferless.
    pub(crate) fn take_buffer(&mut self) -> Option<(Box<[CardPtr]>, usize)> {
        let index = self.index;
        self.index = 0;
        self.buf.take().map(|b| (b, index))
    }
}

/// The hook a queue uses when its buffer fills. The dirty-card set overrides
/// the default to let mutators process their own buffers under backpressure.
pub trait PtrQueueSetOps {
    fn base(&self) -> &PtrQueueSet;

    /// Gives the buffer back (`Some`) when it was consumed in place and may
    /// be reused; `None` means it went onto the completed list.
    fn process_or_enqueue_complete_buffer(
        &self,
        buf: Box<[CardPtr]>,
        index: usize,
    ) -> Option<Box<[CardPtr]>> {
        self.base().enqueue_complete_buffer(buf, index);
        None
    }
}

impl PtrQueueSetOps for PtrQueueSet {
    fn base(&self) -> &PtrQueueSet {
        self
    }
}

struct CompletedTail {
    tail: *mut BufferNode,
}

struct BufPool {
    head: *mut BufferNode,
    len: usize,
}

/// Process-wide queue state: a recycling pool of free buffers and the FIFO
/// list of completed buffers, with a monitor for a blocked consumer.
///
/// The completed list's head is an `AtomicCell` so the opportunistic CAS
/// drain can pop without the lock; everything else goes through `cbl`.
pub struct PtrQueueSet {
    buffer_size: usize,
    completed_head: AtomicCell<*mut BufferNode>,
    cbl: Mutex<CompletedTail>,
    cbl_cond: Condvar,
    n_completed: AtomicUsize,
    process_completed: AtomicBool,
    process_completed_threshold: isize,
    max_completed_queue: AtomicIsize,
    buf_free_list: Mutex<BufPool>,
    notify_when_complete: bool,
}

unsafe impl Send for PtrQueueSet {}
unsafe impl Sync for PtrQueueSet {}

impl PtrQueueSet {
    pub fn new(
        buffer_size: usize,
        process_completed_threshold: isize,
        max_completed_queue: isize,
        notify_when_complete: bool,
    ) -> Self {
        assert!(buffer_size > 0);
        Self {
            buffer_size,
            completed_head: AtomicCell::new(null_mut()),
            cbl: Mutex::new(CompletedTail { tail: null_mut() }),
            cbl_cond: Condvar::new(),
            n_completed: AtomicUsize::new(0),
            process_completed: AtomicBool::new(false),
            process_completed_threshold,
            max_completed_queue: AtomicIsize::new(max_completed_queue),
            buf_free_list: Mutex::new(BufPool {
                head: null_mut(),
                len: 0,
            }),
            notify_when_complete,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn max_completed_queue(&self) -> isize {
        self.max_completed_queue.load(Ordering::Relaxed)
    }

    pub fn set_max_completed_queue(&self, m: isize) {
        self.max_completed_queue.store(m, Ordering::Relaxed);
    }

    pub fn completed_buffers_num(&self) -> usize {
        self.n_completed.load(Ordering::Acquire)
    }

    pub fn process_completed(&self) -> bool {
        self.process_completed.load(Ordering::Acquire)
    }

    pub fn set_process_completed(&self, v: bool) {
        self.process_completed.store(v, Ordering::Release);
    }

    /// Pop a recycled buffer, or make a fresh one. Recycling keeps the hot
    /// write-barrier path off the global allocator.
    pub fn allocate_buffer(&self) -> Box<[CardPtr]> {
        let mut pool = self.buf_free_list.lock();
        if pool.head.is_null() {
            return new_buffer(self.buffer_size);
        }
        unsafe {
            let node = Box::from_raw(pool.head);
            pool.head = node.next;
            pool.len -= 1;
            node.buf
        }
    }

    pub fn deallocate_buffer(&self, buf: Box<[CardPtr]>) {
        debug_assert_eq!(buf.len(), self.buffer_size);
        let mut pool = self.buf_free_list.lock();
        let node = Box::into_raw(Box::new(BufferNode {
            next: pool.head,
            index: 0,
            buf,
        }));
        pool.head = node;
        pool.len += 1;
    }

    /// Halve the free pool, bounding memory kept across quiet periods.
    pub fn reduce_free_list(&self) {
        let mut pool = self.buf_free_list.lock();
        let target = pool.len / 2;
        while pool.len > target {
            unsafe {
                let node = Box::from_raw(pool.head);
                pool.head = node.next;
                pool.len -= 1;
            }
        }
    }

    pub fn free_list_len(&self) -> usize {
        self.buf_free_list.lock().len
    }

    /// O(1) append to the completed FIFO; wakes a waiting consumer once the
    /// threshold is crossed.
    pub fn enqueue_complete_buffer(&self, buf: Box<[CardPtr]>, index: usize) {
        let node = Box::into_raw(Box::new(BufferNode {
            next: null_mut(),
            index,
            buf,
        }));
        let mut cbl = self.cbl.lock();
        if cbl.tail.is_null() {
            debug_assert!(self.completed_head.load().is_null());
            self.completed_head.store(node);
        } else {
            unsafe {
                (*cbl.tail).next = node;
            }
        }
        cbl.tail = node;
        let n = self.n_completed.fetch_add(1, Ordering::AcqRel) + 1;
        if !self.process_completed()
            && self.process_completed_threshold >= 0
            && n as isize >= self.process_completed_threshold
        {
            self.set_process_completed(true);
            if self.notify_when_complete {
                self.cbl_cond.notify_one();
            }
        }
        drop(cbl);
    }

    /// FIFO pop under the monitor. Returns `None` once no more than
    /// `stop_at` buffers remain, clearing the process flag when the list
    /// drains empty.
    pub fn get_completed_buffer_lock(&self, stop_at: usize) -> Option<Box<BufferNode>> {
        let mut cbl = self.cbl.lock();
        if self.completed_buffers_num() <= stop_at {
            if self.completed_buffers_num() == 0 {
                self.set_process_completed(false);
            }
            return None;
        }
        let head = self.completed_head.load();
        debug_assert!(!head.is_null());
        unsafe {
            let node = Box::from_raw(head);
            self.completed_head.store(node.next);
            if node.next.is_null() {
                debug_assert_eq!(cbl.tail, head);
                cbl.tail = null_mut();
            }
            self.n_completed.fetch_sub(1, Ordering::AcqRel);
            if self.completed_buffers_num() == 0 {
                self.set_process_completed(false);
            }
            Some(node)
        }
    }

    /// Lock-free opportunistic pop. Precondition (documented, not
    /// enforced): no producer may run concurrently; other CAS consumers are
    /// fine.
    pub fn get_completed_buffer_cas(&self) -> Option<Box<BufferNode>> {
        loop {
            let head = self.completed_head.load();
            if head.is_null() {
                return None;
            }
            let next = unsafe { (*head).next };
            if self.completed_head.compare_exchange(head, next).is_err() {
                continue;
            }
            if next.is_null() {
                // emptied the list; repair the tail under the lock
                let mut cbl = self.cbl.lock();
                if cbl.tail == head {
                    cbl.tail = null_mut();
                }
            }
            self.n_completed.fetch_sub(1, Ordering::AcqRel);
            return Some(unsafe { Box::from_raw(head) });
        }
    }

    /// Consumer-side block until the completed count crosses the threshold.
    pub fn wait_for_completed_buffer(&self) {
        let mut cbl = self.cbl.lock();
        while !self.process_completed() {
            self.cbl_cond.wait(&mut cbl);
        }
    }

    /// Debug check: the stored length matches the actual list length.
    pub fn assert_completed_buffer_list_len_correct(&self) {
        let cbl = self.cbl.lock();
        let mut n = 0;
        let mut p = self.completed_head.load();
        while !p.is_null() {
            n += 1;
            p = unsafe { (*p).next };
        }
        assert_eq!(n, self.completed_buffers_num(), "Completed list length drifted");
        drop(cbl);
    }
}

impl Drop for PtrQueueSet {
    fn drop(&mut self) {
        while self.get_completed_buffer_lock(0).is_some() {}
        let mut pool = self.buf_free_list.lock();
        while !pool.head.is_null() {
            unsafe {
                let node = Box::from_raw(pool.head);
                pool.head = node.next;
                pool.len -= 1;
            }
        }
    }
}
