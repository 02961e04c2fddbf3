use std::collections::VecDeque;

/// Words of displaced-header storage per spool block.
const SPOOL_BLOCK_WORDS: usize = 256;

struct SpoolBlock {
    words: Box<[usize]>,
    top: usize,
}

impl SpoolBlock {
    fn new() -> Self {
        Self {
            words: vec![0; SPOOL_BLOCK_WORDS].into_boxed_slice(),
            top: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.top == self.words.len()
    }
}

struct PromotedEntry {
    addr: usize,
    has_displaced: bool,
}

/// Records objects promoted during a concurrent phase so they can be
/// revisited in promotion order afterwards. Objects whose header word was
/// displaced (by a lock or a forwarding install) have the original word
/// spooled aside; iteration hands each spooled word back exactly once.
///
/// Spool storage is budgeted: when `ensure_spooling_space` cannot add a
/// block the promotion itself must fail upward, before any state is
/// recorded.
pub struct PromotionTracker {
    tracking: bool,
    block_budget: usize,
    spool: VecDeque<SpoolBlock>,
    /// Read position inside the front spool block.
    read_pos: usize,
    promoted: VecDeque<PromotedEntry>,
    spooled_words: usize,
}

impl PromotionTracker {
    pub fn new(block_budget: usize) -> Self {
        Self {
            tracking: false,
            block_budget,
            spool: VecDeque::new(),
            read_pos: 0,
            promoted: VecDeque::new(),
            spooled_words: 0,
        }
    }

    pub fn tracking(&self) -> bool {
        self.tracking
    }

    pub fn start_tracking(&mut self) {
        debug_assert!(self.promoted.is_empty(), "Promotions left from last cycle");
        self.tracking = true;
    }

    pub fn stop_tracking(&mut self) {
        debug_assert!(self.promoted.is_empty(), "Promotions not drained");
        self.tracking = false;
    }

    pub fn promoted_count(&self) -> usize {
        self.promoted.len()
    }

    pub fn spooled_word_count(&self) -> usize {
        self.spooled_words
    }

    pub fn spool_block_count(&self) -> usize {
        self.spool.len()
    }

    /// Guarantee room for one displaced word. Called before the promotion
    /// is committed; `false` means the budget is spent and the caller must
    /// fail the promotion.
    pub fn ensure_spooling_space(&mut self) -> bool {
        if let Some(back) = self.spool.back() {
            if !back.is_full() {
                return true;
            }
        }
        if self.spool.len() < self.block_budget {
            self.spool.push_back(SpoolBlock::new());
            return true;
        }
        false
    }

    pub fn track(&mut self, addr: usize) {
        debug_assert!(self.tracking, "Tracking is off");
        self.promoted.push_back(PromotedEntry {
            addr,
            has_displaced: false,
        });
    }

    pub fn track_displaced(&mut self, addr: usize, header_word: usize) {
        debug_assert!(self.tracking, "Tracking is off");
        let back = self
            .spool
            .back_mut()
            .filter(|b| !b.is_full())
            .expect("ensure_spooling_space not called");
        back.words[back.top] = header_word;
        back.top += 1;
        self.spooled_words += 1;
        self.promoted.push_back(PromotedEntry {
            addr,
            has_displaced: true,
        });
    }

    /// Visit every promoted object in promotion order, handing back its
    /// displaced header word if it had one. Drains the tracker; spool
    /// blocks are released as they empty.
    pub fn promoted_oops_iterate<F>(&mut self, mut f: F) -> usize
    where
        F: FnMut(usize, Option<usize>),
    {
        let mut visited = 0;
        while let Some(entry) = self.promoted.pop_front() {
            let displaced = if entry.has_displaced {
                Some(self.unspool_word())
            } else {
                None
            };
            f(entry.addr, displaced);
            visited += 1;
        }
        debug_assert_eq!(self.spooled_words, 0, "Spooled words left over");
        debug_assert!(self.spool.is_empty());
        self.read_pos = 0;
        visited
    }

    fn unspool_word(&mut self) -> usize {
        let front = self.spool.front().expect("Displaced word not spooled");
        debug_assert!(self.read_pos < front.top);
        let word = front.words[self.read_pos];
        self.read_pos += 1;
        self.spooled_words -= 1;
        if self.read_pos == front.top {
            self.spool.pop_front();
            self.read_pos = 0;
        }
        word
    }
}
