use crate::dictionary::{BinaryTreeDictionary, Dither};
use crate::dirty_card_queue::{CardPtrClosure, DirtyCardQueue, DirtyCardQueueSet};
use crate::globals::MemRegion;
use crate::ptr_queue::CardPtr;
use crate::refine::ConcurrentRefine;
use crate::Config;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct CountingClosure {
    seen: AtomicUsize,
}

impl CardPtrClosure for CountingClosure {
    fn do_card_ptr(&self, _card: CardPtr, _worker_id: usize) -> bool {
        self.seen.fetch_add(1, Ordering::Relaxed);
        true
    }
}

struct RecordingClosure {
    cards: Mutex<Vec<CardPtr>>,
}

unsafe impl Send for RecordingClosure {}
unsafe impl Sync for RecordingClosure {}

impl CardPtrClosure for RecordingClosure {
    fn do_card_ptr(&self, card: CardPtr, _worker_id: usize) -> bool {
        self.cards.lock().push(card);
        true
    }
}

#[test]
fn mutator_threads_feed_the_completed_list() {
    const THREADS: usize = 4;
    const CARDS_PER_THREAD: usize = 1000;

    let config = Config {
        buffer_size: 64,
        process_completed_threshold: -1,
        max_completed_queue: -1,
        ..Config::default()
    };
    let cl = Arc::new(CountingClosure {
        seen: AtomicUsize::new(0),
    });
    let set = Arc::new(DirtyCardQueueSet::new(&config));
    set.set_closure(cl.clone());

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let set = set.clone();
        handles.push(std::thread::spawn(move || {
            let mut q = DirtyCardQueue::new(true);
            for i in 0..CARDS_PER_THREAD {
                let card = (0x10000 * (t + 1) + i) as CardPtr;
                q.enqueue(&set, card);
            }
            q.flush(&set);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    set.base().assert_completed_buffer_list_len_correct();
    set.apply_closure_to_all_completed_buffers(0);
    assert_eq!(cl.seen.load(Ordering::Relaxed), THREADS * CARDS_PER_THREAD);
    assert_eq!(set.base().completed_buffers_num(), 0);
}

#[test]
fn backpressured_mutators_do_their_own_refinement() {
    const THREADS: usize = 3;
    const CARDS_PER_THREAD: usize = 512;

    let config = Config {
        buffer_size: 16,
        process_completed_threshold: -1,
        max_completed_queue: 2,
        num_par_ids: 2,
        ..Config::default()
    };
    let cl = Arc::new(CountingClosure {
        seen: AtomicUsize::new(0),
    });
    let set = Arc::new(DirtyCardQueueSet::new(&config));
    set.set_closure(cl.clone());

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let set = set.clone();
        handles.push(std::thread::spawn(move || {
            let mut q = DirtyCardQueue::new(true);
            for i in 0..CARDS_PER_THREAD {
                q.enqueue(&set, (0x10000 * (t + 1) + i) as CardPtr);
            }
            q.flush(&set);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    set.apply_closure_to_all_completed_buffers(0);
    // every card got processed exactly once, inline or by the drain
    assert_eq!(cl.seen.load(Ordering::Relaxed), THREADS * CARDS_PER_THREAD);
    assert!(set.processed_buffers_mut() > 0, "Cap never tripped inline work");
}

#[test]
fn dictionary_survives_contended_get_and_return() {
    const THREADS: usize = 4;
    const ROUNDS: usize = 200;

    let region = MemRegion::new(0, 1 << 16);
    let dict = Arc::new(Mutex::new(BinaryTreeDictionary::new(region, false)));
    let initial = dict.lock().total_size();

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let dict = dict.clone();
        handles.push(std::thread::spawn(move || {
            let sizes = [8, 16, 24, 64, 128];
            let mut held = Vec::new();
            for round in 0..ROUNDS {
                let words = sizes[(t + round) % sizes.len()];
                let mut d = dict.lock();
                if let Some(c) = d.get_chunk(words, Dither::RoundUp) {
                    held.push(c);
                }
                if held.len() > 8 {
                    for c in held.drain(..) {
                        d.return_chunk(c);
                    }
                }
            }
            let mut d = dict.lock();
            for c in held.drain(..) {
                d.return_chunk(c);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let d = dict.lock();
    d.verify();
    assert_eq!(d.total_size(), initial);
}

#[test]
fn hot_cards_are_refined_once_at_cleanup() {
    let config = Config {
        buffer_size: 8,
        process_completed_threshold: -1,
        max_completed_queue: -1,
        hot_cache_size: 4,
        hot_card_limit: 2,
        ..Config::default()
    };
    let dcqs = Arc::new(DirtyCardQueueSet::new(&config));
    let rec = Arc::new(RecordingClosure {
        cards: Mutex::new(Vec::new()),
    });
    dcqs.set_closure(rec.clone());
    let base = 0x8000usize;
    let refine = ConcurrentRefine::new(&config, dcqs.clone(), base, 32);

    let hot = (base + 1) as CardPtr;
    let cold = (base + 2) as CardPtr;
    // dirty the hot card three times, the cold one once; whatever
    // cache_insert returns goes through the queue like any dirtied card
    for _ in 0..3 {
        if let Some(c) = refine.cache_insert(hot) {
            dcqs.shared_enqueue(c);
        }
    }
    if let Some(c) = refine.cache_insert(cold) {
        dcqs.shared_enqueue(c);
    }

    // pause: everything buffered and everything parked gets refined
    dcqs.concatenate_logs();
    dcqs.apply_closure_to_all_completed_buffers(0);
    refine.clean_up_cache(0, &*rec);

    let cards = rec.cards.lock();
    // first dirtying of the hot card was below the limit and refined
    // immediately; the parked copy came out exactly once at cleanup
    assert_eq!(cards.iter().filter(|&&c| c == hot).count(), 2);
    assert_eq!(cards.iter().filter(|&&c| c == cold).count(), 1);
    assert_eq!(refine.hot_cache_occupancy(), 0);
}

#[test]
fn sweep_census_steers_coalescing() {
    let region = MemRegion::new(0, 4096);
    let mut d = BinaryTreeDictionary::new(region, false);

    // fragment the span into a population of 32-word chunks
    let mut held = Vec::new();
    let mut c = d.get_chunk(4096, Dither::Exact).unwrap();
    for _ in 0..15 {
        d.split_chunk(c, 32);
        held.push(c);
        c = d.get_chunk(32, Dither::RoundUp).unwrap();
    }
    held.push(c);
    for c in held.drain(..) {
        d.return_chunk(c);
    }

    d.begin_sweep_dict_census(0.9, 1.0, 1.0, 0.0);
    d.end_sweep_dict_census(0.75);
    d.verify();

    // no recorded demand for 32-word chunks, so the class is a coalition
    // target rather than something to preserve
    assert!(d.coal_dict_over_populated(32));
    // a class the dictionary has never seen is always worth coalescing
    assert!(d.coal_dict_over_populated(7));
}
