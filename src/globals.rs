pub const WORD_SIZE: usize = core::mem::size_of::<usize>();
/// Smallest block the dictionary will track. A split never leaves a
/// remainder below this.
pub const MIN_CHUNK_WORDS: usize = 2;
pub const CARD_SIZE: usize = 512;
pub const CARD_SIZE_BITS: usize = 9;

/// A contiguous run of heap words handed to the allocator by the owning
/// generation. Word-addressed; the dictionary never dereferences it, all
/// free-space bookkeeping lives in side-table records.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MemRegion {
    start: usize,
    word_size: usize,
}

impl MemRegion {
    pub fn new(start: usize, word_size: usize) -> Self {
        Self { start, word_size }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn word_size(&self) -> usize {
        self.word_size
    }

    pub fn end(&self) -> usize {
        self.start + self.word_size
    }

    pub fn is_empty(&self) -> bool {
        self.word_size == 0
    }

    pub fn contains(&self, word: usize) -> bool {
        word >= self.start && word < self.end()
    }
}
