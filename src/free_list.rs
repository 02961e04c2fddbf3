use modular_bitfield::prelude::*;

/// Stable identity of a chunk record inside a [`ChunkArena`].
///
/// Chunks used to be identified by their own first words reinterpreted as a
/// header; here the header lives in a side table and the handle is the only
/// way to reach it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChunkHandle(u32);

impl ChunkHandle {
    pub const NULL: ChunkHandle = ChunkHandle(u32::MAX);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Packed chunk header word: size in words plus the free and cant-coalesce
/// bits, same encoding a chunk used to carry in-place.
#[bitfield]
#[derive(Clone, Copy)]
pub struct ChunkHeader {
    pub size: B62,
    pub free: bool,
    pub cant_coalesce: bool,
}

struct ChunkRecord {
    /// Word offset from the region start.
    offset: usize,
    header: ChunkHeader,
    prev: ChunkHandle,
    next: ChunkHandle,
}

/// Side table of chunk records. A record is either free (free bit set,
/// linked into exactly one [`FreeList`]) or allocated out (free bit clear,
/// no list membership).
pub struct ChunkArena {
    records: Vec<ChunkRecord>,
    free_slots: Vec<u32>,
}

impl ChunkArena {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            free_slots: Vec::new(),
        }
    }

    /// Create a record for a free span. The chunk starts unlinked.
    pub fn intern(&mut self, offset: usize, words: usize) -> ChunkHandle {
        let record = ChunkRecord {
            offset,
            header: ChunkHeader::new()
                .with_size(words as u64)
                .with_free(false)
                .with_cant_coalesce(false),
            prev: ChunkHandle::NULL,
            next: ChunkHandle::NULL,
        };
        match self.free_slots.pop() {
            Some(slot) => {
                self.records[slot as usize] = record;
                ChunkHandle(slot)
            }
            None => {
                self.records.push(record);
                ChunkHandle((self.records.len() - 1) as u32)
            }
        }
    }

    /// Drop a record, recycling its slot. The chunk must be unlinked.
    pub fn release(&mut self, c: ChunkHandle) {
        debug_assert!(self.prev(c).is_null() && self.next(c).is_null());
        self.free_slots.push(c.0);
    }

    pub fn offset(&self, c: ChunkHandle) -> usize {
        self.records[c.index()].offset
    }

    pub fn size(&self, c: ChunkHandle) -> usize {
        self.records[c.index()].header.size() as usize
    }

    pub fn set_size(&mut self, c: ChunkHandle, words: usize) {
        let rec = &mut self.records[c.index()];
        rec.header.set_size(words as u64);
    }

    pub fn is_free(&self, c: ChunkHandle) -> bool {
        self.records[c.index()].header.free()
    }

    pub fn set_free(&mut self, c: ChunkHandle, free: bool) {
        let rec = &mut self.records[c.index()];
        rec.header.set_free(free);
    }

    pub fn cant_coalesce(&self, c: ChunkHandle) -> bool {
        self.records[c.index()].header.cant_coalesce()
    }

    pub fn dont_coalesce(&mut self, c: ChunkHandle) {
        let rec = &mut self.records[c.index()];
        rec.header.set_cant_coalesce(true);
    }

    pub fn prev(&self, c: ChunkHandle) -> ChunkHandle {
        self.records[c.index()].prev
    }

    pub fn next(&self, c: ChunkHandle) -> ChunkHandle {
        self.records[c.index()].next
    }

    pub fn set_prev(&mut self, c: ChunkHandle, p: ChunkHandle) {
        self.records[c.index()].prev = p;
    }

    pub fn set_next(&mut self, c: ChunkHandle, n: ChunkHandle) {
        self.records[c.index()].next = n;
    }

    /// True when `left` ends exactly where `right` begins.
    pub fn adjacent(&self, left: ChunkHandle, right: ChunkHandle) -> bool {
        self.offset(left) + self.size(left) == self.offset(right)
    }

    /// Merge two adjacent free chunks into one record. Both must be
    /// unlinked; `right`'s record is recycled.
    pub fn merge(&mut self, left: ChunkHandle, right: ChunkHandle) -> ChunkHandle {
        debug_assert!(self.adjacent(left, right), "Chunks are not adjacent");
        debug_assert!(
            !self.is_free(left) && !self.is_free(right),
            "Cannot merge chunks still on a free list"
        );
        debug_assert!(!self.cant_coalesce(left) && !self.cant_coalesce(right));
        debug_assert!(self.prev(left).is_null() && self.next(left).is_null());
        debug_assert!(self.prev(right).is_null() && self.next(right).is_null());
        let merged = self.size(left) + self.size(right);
        self.set_size(left, merged);
        self.release(right);
        left
    }
}

/// Exponentially decayed birth/death statistics for one size class, driving
/// the sweeper's coalescing policy. Heuristic only; nothing here affects
/// memory safety.
#[derive(Clone, Copy)]
pub struct AllocationStats {
    prev_sweep: usize,
    before_sweep: usize,
    demand_rate: f32,
    deviation: f32,
    desired: isize,
    coal_desired: isize,
    surplus: isize,
    bfr_surp: isize,
    hint: usize,
    coal_births: usize,
    coal_deaths: usize,
    split_births: usize,
    split_deaths: usize,
    returned_bytes: usize,
}

/// Weight of the old estimate when folding in a fresh demand sample.
const DECAY_WEIGHT: f32 = 0.75;
/// Deviations of padding added on top of the decayed average.
const PADDING: f32 = 2.0;

impl AllocationStats {
    pub fn new() -> Self {
        Self {
            prev_sweep: 0,
            before_sweep: 0,
            demand_rate: 0.0,
            deviation: 0.0,
            desired: 0,
            coal_desired: 0,
            surplus: 0,
            bfr_surp: 0,
            hint: 0,
            coal_births: 0,
            coal_deaths: 0,
            split_births: 0,
            split_deaths: 0,
            returned_bytes: 0,
        }
    }

    /// Fold the demand observed since the previous sweep into the decayed
    /// rate estimate and recompute `desired` for the upcoming inter-sweep
    /// interval.
    pub fn compute_desired(
        &mut self,
        count: usize,
        inter_sweep_current: f32,
        inter_sweep_estimate: f32,
        intra_sweep_estimate: f32,
    ) {
        let demand = self.prev_sweep as isize - count as isize
            + self.split_births as isize
            + self.coal_births as isize
            - self.split_deaths as isize
            - self.coal_deaths as isize;
        let interval = if inter_sweep_current > 0.0 {
            inter_sweep_current
        } else {
            1.0
        };
        let rate = demand as f32 / interval;
        self.demand_rate = DECAY_WEIGHT * self.demand_rate + (1.0 - DECAY_WEIGHT) * rate;
        self.deviation =
            DECAY_WEIGHT * self.deviation + (1.0 - DECAY_WEIGHT) * (rate - self.demand_rate).abs();
        let padded = self.demand_rate + PADDING * self.deviation;
        self.desired = (padded * (inter_sweep_estimate + intra_sweep_estimate)) as isize;
    }

    pub fn prev_sweep(&self) -> usize {
        self.prev_sweep
    }

    pub fn set_prev_sweep(&mut self, v: usize) {
        self.prev_sweep = v;
    }

    pub fn before_sweep(&self) -> usize {
        self.before_sweep
    }

    pub fn set_before_sweep(&mut self, v: usize) {
        self.before_sweep = v;
    }

    pub fn desired(&self) -> isize {
        self.desired
    }

    pub fn set_desired(&mut self, v: isize) {
        self.desired = v;
    }

    pub fn coal_desired(&self) -> isize {
        self.coal_desired
    }

    pub fn set_coal_desired(&mut self, v: isize) {
        self.coal_desired = v;
    }

    pub fn surplus(&self) -> isize {
        self.surplus
    }

    pub fn set_surplus(&mut self, v: isize) {
        self.surplus = v;
    }

    pub fn increment_surplus(&mut self) {
        self.surplus += 1;
    }

    pub fn decrement_surplus(&mut self) {
        self.surplus -= 1;
    }

    pub fn bfr_surp(&self) -> isize {
        self.bfr_surp
    }

    pub fn set_bfr_surp(&mut self, v: isize) {
        self.bfr_surp = v;
    }

    pub fn hint(&self) -> usize {
        self.hint
    }

    pub fn set_hint(&mut self, v: usize) {
        self.hint = v;
    }

    pub fn coal_births(&self) -> usize {
        self.coal_births
    }

    pub fn increment_coal_births(&mut self) {
        self.coal_births += 1;
    }

    pub fn coal_deaths(&self) -> usize {
        self.coal_deaths
    }

    pub fn increment_coal_deaths(&mut self) {
        self.coal_deaths += 1;
    }

    pub fn split_births(&self) -> usize {
        self.split_births
    }

    pub fn increment_split_births(&mut self) {
        self.split_births += 1;
    }

    pub fn split_deaths(&self) -> usize {
        self.split_deaths
    }

    pub fn increment_split_deaths(&mut self) {
        self.split_deaths += 1;
    }

    pub fn returned_bytes(&self) -> usize {
        self.returned_bytes
    }

    pub fn add_returned_bytes(&mut self, bytes: usize) {
        self.returned_bytes += bytes;
    }

    pub fn clear_census(&mut self, count: usize) {
        self.prev_sweep = count;
        self.coal_births = 0;
        self.coal_deaths = 0;
        self.split_births = 0;
        self.split_deaths = 0;
    }
}

/// Doubly-linked FIFO of same-sized free chunks with allocation statistics.
///
/// Holds no lock of its own. Exclusive access comes through `&mut`; in
/// production the dictionary that owns the arena and its lists lives behind
/// the space's `parking_lot::Mutex`, so the guard is the proof of lock.
pub struct FreeList {
    size: usize,
    head: ChunkHandle,
    tail: ChunkHandle,
    count: usize,
    stats: AllocationStats,
}

impl FreeList {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            head: ChunkHandle::NULL,
            tail: ChunkHandle::NULL,
            count: 0,
            stats: AllocationStats::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn head(&self) -> ChunkHandle {
        self.head
    }

    pub fn tail(&self) -> ChunkHandle {
        self.tail
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub fn stats(&self) -> &AllocationStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut AllocationStats {
        &mut self.stats
    }

    pub fn surplus(&self) -> isize {
        self.stats.surplus()
    }

    pub fn desired(&self) -> isize {
        self.stats.desired()
    }

    pub fn coal_desired(&self) -> isize {
        self.stats.coal_desired()
    }

    pub fn hint(&self) -> usize {
        self.stats.hint()
    }

    pub fn return_chunk_at_head(&mut self, arena: &mut ChunkArena, c: ChunkHandle) {
        debug_assert_eq!(arena.size(c), self.size, "Chunk size does not match list");
        debug_assert!(!arena.is_free(c), "Chunk is already on a list");
        arena.set_free(c, true);
        arena.set_prev(c, ChunkHandle::NULL);
        arena.set_next(c, self.head);
        if self.head.is_null() {
            debug_assert!(self.tail.is_null() && self.count == 0);
            self.tail = c;
        } else {
            arena.set_prev(self.head, c);
        }
        self.head = c;
        self.count += 1;
        self.stats
            .add_returned_bytes(self.size * crate::globals::WORD_SIZE);
    }

    pub fn return_chunk_at_tail(&mut self, arena: &mut ChunkArena, c: ChunkHandle) {
        debug_assert_eq!(arena.size(c), self.size, "Chunk size does not match list");
        debug_assert!(!arena.is_free(c), "Chunk is already on a list");
        arena.set_free(c, true);
        arena.set_next(c, ChunkHandle::NULL);
        arena.set_prev(c, self.tail);
        if self.tail.is_null() {
            debug_assert!(self.head.is_null() && self.count == 0);
            self.head = c;
        } else {
            arena.set_next(self.tail, c);
        }
        self.tail = c;
        self.count += 1;
        self.stats
            .add_returned_bytes(self.size * crate::globals::WORD_SIZE);
    }

    /// Remove and return the head chunk, unlinked.
    pub fn get_chunk_at_head(&mut self, arena: &mut ChunkArena) -> Option<ChunkHandle> {
        if self.head.is_null() {
            return None;
        }
        let c = self.head;
        self.remove_chunk(arena, c);
        Some(c)
    }

    /// Unlink an arbitrary member chunk in O(1) via its prev/next handles.
    pub fn remove_chunk(&mut self, arena: &mut ChunkArena, c: ChunkHandle) {
        debug_assert_eq!(arena.size(c), self.size, "Chunk size does not match list");
        debug_assert!(self.count > 0);
        let prev = arena.prev(c);
        let next = arena.next(c);
        if prev.is_null() {
            debug_assert_eq!(self.head, c);
            self.head = next;
        } else {
            arena.set_next(prev, next);
        }
        if next.is_null() {
            debug_assert_eq!(self.tail, c);
            self.tail = prev;
        } else {
            arena.set_prev(next, prev);
        }
        arena.set_prev(c, ChunkHandle::NULL);
        arena.set_next(c, ChunkHandle::NULL);
        arena.set_free(c, false);
        self.count -= 1;
        debug_assert!(self.count != 0 || (self.head.is_null() && self.tail.is_null()));
    }

    /// Split off the first `n` chunks (or as many as the list holds) into
    /// `dst`, preserving order. Used when harvesting part of an over-full
    /// size class.
    pub fn get_first_n_chunks(&mut self, arena: &mut ChunkArena, n: usize, dst: &mut FreeList) {
        debug_assert_eq!(dst.size, self.size, "Destination list size mismatch");
        for _ in 0..n {
            let c = match self.get_chunk_at_head(arena) {
                Some(c) => c,
                None => break,
            };
            dst.return_chunk_at_tail(arena, c);
        }
    }

    /// Splice all of `other`'s chunks to the front of this list in O(1),
    /// leaving `other` empty. Used when merging a per-worker list into the
    /// global one.
    pub fn prepend(&mut self, arena: &mut ChunkArena, other: &mut FreeList) {
        debug_assert_eq!(other.size, self.size, "List size mismatch");
        if other.is_empty() {
            return;
        }
        if self.head.is_null() {
            self.head = other.head;
            self.tail = other.tail;
        } else {
            arena.set_next(other.tail, self.head);
            arena.set_prev(self.head, other.tail);
            self.head = other.head;
        }
        self.count += other.count;
        other.head = ChunkHandle::NULL;
        other.tail = ChunkHandle::NULL;
        other.count = 0;
    }

    /// Walk the list checking the per-chunk size invariant and the count.
    pub fn verify(&self, arena: &ChunkArena) {
        let mut n = 0;
        let mut c = self.head;
        let mut prev = ChunkHandle::NULL;
        while !c.is_null() {
            assert_eq!(arena.size(c), self.size, "Chunk size does not match list");
            assert!(arena.is_free(c), "List member must be free");
            assert_eq!(arena.prev(c), prev);
            prev = c;
            c = arena.next(c);
            n += 1;
        }
        assert_eq!(prev, self.tail);
        assert_eq!(n, self.count, "List count does not match length");
    }
}
