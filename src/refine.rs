use atomic::Atomic;
use parking_lot::Mutex;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::dirty_card_queue::{CardPtrClosure, DirtyCardQueueSet};
use crate::ptr_queue::CardPtr;
use crate::Config;

/// What the concurrent phase should do after a cooperative yield. Written by
/// the collector, consumed by exactly one designated reader through
/// `get_pya`.
#[repr(u32)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PostYieldAction {
    Continue,
    Restart,
    Cancel,
}

struct HotCache {
    entries: Box<[CardPtr]>,
    /// Next insertion slot; the oldest entry lives here once the ring is
    /// full.
    idx: usize,
    n_hot: usize,
}

/// The concurrent refinement half: drains completed dirty-card buffers
/// through the registered closure, defers frequently-dirtied cards in a
/// small ring so they are refined once instead of per write, and decides
/// when draining stops paying for itself.
pub struct ConcurrentRefine {
    dcqs: Arc<DirtyCardQueueSet>,
    enabled: AtomicBool,
    first_traversal: AtomicBool,
    traversals: AtomicUsize,
    last_cards_during: AtomicUsize,
    hot_cache: Mutex<HotCache>,
    hot_card_limit: u8,
    /// One saturating dirty-count per card. Relaxed on purpose: a lost
    /// increment only delays hotness, never corrupts anything.
    card_counts: Box<[AtomicU8]>,
    card_table_base: usize,
    count_histogram: Mutex<Box<[usize; 256]>>,
    pya: Atomic<PostYieldAction>,
    last_pya: Atomic<PostYieldAction>,
    verbose: bool,
}

impl ConcurrentRefine {
    /// `card_table_base` is the address of the first card-table byte and
    /// `num_cards` the number of bytes covered; cards outside that window
    /// get no counter and are always refined immediately.
    pub fn new(
        config: &Config,
        dcqs: Arc<DirtyCardQueueSet>,
        card_table_base: usize,
        num_cards: usize,
    ) -> Self {
        let mut counts = Vec::with_capacity(num_cards);
        counts.resize_with(num_cards, || AtomicU8::new(0));
        Self {
            dcqs,
            enabled: AtomicBool::new(false),
            first_traversal: AtomicBool::new(false),
            traversals: AtomicUsize::new(0),
            last_cards_during: AtomicUsize::new(0),
            hot_cache: Mutex::new(HotCache {
                entries: vec![null_mut(); config.hot_cache_size].into_boxed_slice(),
                idx: 0,
                n_hot: 0,
            }),
            hot_card_limit: config.hot_card_limit,
            card_counts: counts.into_boxed_slice(),
            card_table_base,
            count_histogram: Mutex::new(Box::new([0; 256])),
            pya: Atomic::new(PostYieldAction::Continue),
            last_pya: Atomic::new(PostYieldAction::Continue),
            verbose: config.verbose,
        }
    }

    pub fn enable(&self) {
        self.first_traversal.store(true, Ordering::Relaxed);
        self.last_cards_during.store(0, Ordering::Relaxed);
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn traversals(&self) -> usize {
        self.traversals.load(Ordering::Relaxed)
    }

    /// Run one traversal: drain every completed buffer through the closure.
    /// Returns whether the caller should run another traversal right away,
    /// which it should while the drain rate is still clearly falling.
    pub fn refine(&self, worker_id: usize) -> bool {
        let before = self.dcqs.cards_processed();
        self.traversals.fetch_add(1, Ordering::Relaxed);
        while self.dcqs.apply_closure_to_completed_buffer(worker_id, 0, false) {}
        let cards_during = self.dcqs.cards_processed() - before;
        let last = self.last_cards_during.swap(cards_during, Ordering::Relaxed);
        let first = self.first_traversal.swap(false, Ordering::Relaxed);
        logln_if!(
            self.verbose,
            "refine traversal {}: {} cards (prev {})",
            self.traversals(),
            cards_during,
            last
        );
        (first && cards_during > 0) || cards_during * 3 < last * 2
    }

    fn add_card_count(&self, card: CardPtr) -> u8 {
        let index = (card as usize).wrapping_sub(self.card_table_base);
        if index >= self.card_counts.len() {
            // untracked card, treat as never hot
            return 0;
        }
        let cnt = &self.card_counts[index];
        let cur = cnt.load(Ordering::Relaxed);
        if cur < u8::MAX {
            cnt.store(cur + 1, Ordering::Relaxed);
            cur + 1
        } else {
            cur
        }
    }

    /// Classify a freshly dirtied card. A cold card comes straight back for
    /// immediate refinement; a hot one is parked in the ring, which may push
    /// out its oldest occupant for the caller to refine instead. A card
    /// already in the ring is absorbed.
    pub fn cache_insert(&self, card: CardPtr) -> Option<CardPtr> {
        let count = self.add_card_count(card);
        if count < self.hot_card_limit {
            return Some(card);
        }
        let mut cache = self.hot_cache.lock();
        if cache.entries.is_empty() {
            return Some(card);
        }
        if cache.entries.iter().any(|&e| e == card) {
            return None;
        }
        let evicted = if cache.n_hot == cache.entries.len() {
            Some(cache.entries[cache.idx])
        } else {
            cache.n_hot += 1;
            None
        };
        let idx = cache.idx;
        cache.entries[idx] = card;
        cache.idx = (idx + 1) % cache.entries.len();
        evicted
    }

    pub fn hot_cache_occupancy(&self) -> usize {
        self.hot_cache.lock().n_hot
    }

    /// Force-refine everything still parked, newest first. Safepoint use;
    /// the closure must consume every card.
    pub fn clean_up_cache(&self, worker_id: usize, cl: &dyn CardPtrClosure) {
        let mut cache = self.hot_cache.lock();
        let len = cache.entries.len();
        for k in 1..=cache.n_hot {
            let slot = (cache.idx + len - k) % len;
            let consumed = cl.do_card_ptr(cache.entries[slot], worker_id);
            debug_assert!(consumed, "Hot-card cleanup must not stop early");
        }
        cache.n_hot = 0;
        cache.idx = 0;
        for e in cache.entries.iter_mut() {
            *e = null_mut();
        }
    }

    /// Empty the ring without refining anything. The entries are stale after
    /// an aborted cycle.
    pub fn clear_hot_cache(&self) {
        let mut cache = self.hot_cache.lock();
        cache.n_hot = 0;
        cache.idx = 0;
        for e in cache.entries.iter_mut() {
            *e = null_mut();
        }
    }

    /// End of a counting period: fold every nonzero per-card count into the
    /// histogram, then zero the counters.
    pub fn clear_and_record_card_counts(&self) {
        let mut hist = self.count_histogram.lock();
        for cnt in self.card_counts.iter() {
            let c = cnt.load(Ordering::Relaxed);
            if c != 0 {
                hist[c as usize] += 1;
                cnt.store(0, Ordering::Relaxed);
            }
        }
    }

    pub fn card_count_histogram(&self) -> Box<[usize; 256]> {
        self.count_histogram.lock().clone()
    }

    pub fn print_card_count_histogram(&self) {
        let hist = self.count_histogram.lock();
        logln_if!(self.verbose, "Card count histogram:");
        for (count, cards) in hist.iter().enumerate() {
            log_if!(self.verbose && *cards != 0, " {}:{}", count, cards);
        }
        logln_if!(self.verbose, "");
    }

    pub fn set_pya_restart(&self) {
        self.pya.store(PostYieldAction::Restart, Ordering::Release);
    }

    pub fn set_pya_cancel(&self) {
        self.pya.store(PostYieldAction::Cancel, Ordering::Release);
    }

    /// Read-and-reset of the post-yield action. Only the one designated
    /// yielding thread may call this; writers race freely against it.
    pub fn get_pya(&self) -> PostYieldAction {
        let mut a = self.pya.load(Ordering::Acquire);
        while a != PostYieldAction::Continue {
            match self.pya.compare_exchange(
                a,
                PostYieldAction::Continue,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(cur) => a = cur,
            }
        }
        if a != PostYieldAction::Continue {
            self.last_pya.store(a, Ordering::Relaxed);
        }
        a
    }

    /// The last non-`Continue` action `get_pya` handed out.
    pub fn last_pya(&self) -> PostYieldAction {
        self.last_pya.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct AcceptAll;

    impl CardPtrClosure for AcceptAll {
        fn do_card_ptr(&self, _card: CardPtr, _worker_id: usize) -> bool {
            true
        }
    }

    struct Recorder {
        cards: Mutex<Vec<CardPtr>>,
    }

    unsafe impl Send for Recorder {}
    unsafe impl Sync for Recorder {}

    impl CardPtrClosure for Recorder {
        fn do_card_ptr(&self, card: CardPtr, _worker_id: usize) -> bool {
            self.cards.lock().push(card);
            true
        }
    }

    const BASE: usize = 0x1000;

    fn card(i: usize) -> CardPtr {
        (BASE + i) as CardPtr
    }

    fn refine_with(config: &Config) -> ConcurrentRefine {
        let dcqs = Arc::new(DirtyCardQueueSet::new(config));
        dcqs.set_closure(Arc::new(AcceptAll));
        ConcurrentRefine::new(config, dcqs, BASE, 64)
    }

    #[test]
    fn cold_cards_refine_immediately() {
        let config = Config {
            hot_cache_size: 4,
            hot_card_limit: 3,
            ..Config::default()
        };
        let r = refine_with(&config);
        assert_eq!(r.cache_insert(card(0)), Some(card(0)));
        assert_eq!(r.cache_insert(card(0)), Some(card(0)));
        // third dirtying crosses the limit, card is parked
        assert_eq!(r.cache_insert(card(0)), None);
        assert_eq!(r.hot_cache_occupancy(), 1);
    }

    #[test]
    fn cache_holds_no_duplicates() {
        let config = Config {
            hot_cache_size: 4,
            hot_card_limit: 1,
            ..Config::default()
        };
        let r = refine_with(&config);
        assert_eq!(r.cache_insert(card(5)), None);
        assert_eq!(r.cache_insert(card(5)), None);
        assert_eq!(r.cache_insert(card(5)), None);
        assert_eq!(r.hot_cache_occupancy(), 1);
    }

    #[test]
    fn full_cache_evicts_oldest() {
        let config = Config {
            hot_cache_size: 2,
            hot_card_limit: 1,
            ..Config::default()
        };
        let r = refine_with(&config);
        assert_eq!(r.cache_insert(card(1)), None);
        assert_eq!(r.cache_insert(card(2)), None);
        assert_eq!(r.cache_insert(card(3)), Some(card(1)));
        assert_eq!(r.cache_insert(card(4)), Some(card(2)));
    }

    #[test]
    fn zero_sized_cache_never_defers() {
        let config = Config {
            hot_cache_size: 0,
            hot_card_limit: 1,
            ..Config::default()
        };
        let r = refine_with(&config);
        assert_eq!(r.cache_insert(card(1)), Some(card(1)));
        assert_eq!(r.cache_insert(card(1)), Some(card(1)));
    }

    #[test]
    fn untracked_card_is_never_hot() {
        let config = Config {
            hot_cache_size: 4,
            hot_card_limit: 1,
            ..Config::default()
        };
        let r = refine_with(&config);
        let stray = (BASE + 1000) as CardPtr;
        assert_eq!(r.cache_insert(stray), Some(stray));
        assert_eq!(r.cache_insert(stray), Some(stray));
    }

    #[test]
    fn cleanup_drains_newest_first() {
        let config = Config {
            hot_cache_size: 4,
            hot_card_limit: 1,
            ..Config::default()
        };
        let r = refine_with(&config);
        for i in 1..=3 {
            assert_eq!(r.cache_insert(card(i)), None);
        }
        let rec = Recorder {
            cards: Mutex::new(Vec::new()),
        };
        r.clean_up_cache(0, &rec);
        assert_eq!(*rec.cards.lock(), vec![card(3), card(2), card(1)]);
        assert_eq!(r.hot_cache_occupancy(), 0);
        // ring is genuinely reset
        assert_eq!(r.cache_insert(card(1)), None);
        assert_eq!(r.hot_cache_occupancy(), 1);
    }

    #[test]
    fn counts_fold_into_histogram_and_reset() {
        let config = Config {
            hot_cache_size: 0,
            hot_card_limit: 200,
            ..Config::default()
        };
        let r = refine_with(&config);
        for _ in 0..3 {
            r.cache_insert(card(1));
        }
        r.cache_insert(card(2));
        r.clear_and_record_card_counts();
        let hist = r.card_count_histogram();
        assert_eq!(hist[3], 1);
        assert_eq!(hist[1], 1);
        assert_eq!(hist[2], 0);
        // counters start over after the fold
        r.cache_insert(card(1));
        r.clear_and_record_card_counts();
        assert_eq!(r.card_count_histogram()[1], 2);
    }

    fn seed_cards(r: &ConcurrentRefine, n: usize) {
        let buffer_size = r.dcqs.base().buffer_size();
        assert!(n <= buffer_size);
        let buf = r.dcqs.base().allocate_buffer();
        r.dcqs
            .base()
            .enqueue_complete_buffer(buf, buffer_size - n);
    }

    #[test]
    fn traversal_continues_while_drain_rate_falls() {
        let config = Config {
            buffer_size: 128,
            process_completed_threshold: -1,
            max_completed_queue: -1,
            ..Config::default()
        };
        let r = refine_with(&config);
        r.enable();
        seed_cards(&r, 100);
        assert!(r.refine(0));
        seed_cards(&r, 40);
        assert!(r.refine(0));
        seed_cards(&r, 39);
        assert!(!r.refine(0));
        assert_eq!(r.traversals(), 3);
    }

    #[test]
    fn traversal_stops_when_rate_holds_up() {
        let config = Config {
            buffer_size: 128,
            process_completed_threshold: -1,
            max_completed_queue: -1,
            ..Config::default()
        };
        let r = refine_with(&config);
        r.enable();
        seed_cards(&r, 100);
        assert!(r.refine(0));
        seed_cards(&r, 90);
        assert!(!r.refine(0));
    }

    #[test]
    fn first_traversal_without_work_stops() {
        let config = Config {
            process_completed_threshold: -1,
            max_completed_queue: -1,
            ..Config::default()
        };
        let r = refine_with(&config);
        r.enable();
        assert!(!r.refine(0));
    }

    #[test]
    fn pya_reader_resets_and_records() {
        let config = Config::default();
        let r = refine_with(&config);
        assert_eq!(r.get_pya(), PostYieldAction::Continue);
        r.set_pya_restart();
        assert_eq!(r.get_pya(), PostYieldAction::Restart);
        assert_eq!(r.get_pya(), PostYieldAction::Continue);
        assert_eq!(r.last_pya(), PostYieldAction::Restart);
        r.set_pya_cancel();
        assert_eq!(r.get_pya(), PostYieldAction::Cancel);
        assert_eq!(r.last_pya(), PostYieldAction::Cancel);
    }
}
