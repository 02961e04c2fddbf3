macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            println!($($t)*);
        }
    };
}

macro_rules! log_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            print!($($t)*);
        }
    };
}

/// rounds the given value `val` up to the nearest multiple
/// of `align`
pub fn align_usize(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }

    ((value + align - 1) / align) * align
}

pub mod dictionary;
pub mod dirty_card_queue;
pub mod free_list;
pub mod globals;
pub mod promotion;
pub mod ptr_queue;
pub mod refine;
#[cfg(test)]
mod tests;

/// Configuration knobs consumed by the queue sets, the refinement component
/// and the dictionary. These are supplied by the surrounding collector; the
/// defaults here are only sensible starting points.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Card pointers per queue buffer.
    pub buffer_size: usize,
    /// Completed-buffer count at which a waiting consumer is notified.
    /// `-1` never notifies.
    pub process_completed_threshold: isize,
    /// Completed-buffer count past which mutators are asked to process
    /// their own buffers inline. `-1` means the queue may grow unboundedly.
    pub max_completed_queue: isize,
    /// Capacity of the hot-card ring. Zero disables deferral entirely.
    pub hot_cache_size: usize,
    /// Dirty-count at which a card is classified hot and deferred.
    pub hot_card_limit: u8,
    /// Number of parallel worker-id lanes handed out to mutators that
    /// process buffers inline.
    pub num_par_ids: usize,
    /// Enables semi-splay rebalancing of the dictionary after removals.
    pub splay_dictionary: bool,
    /// Enables verbose printing
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            process_completed_threshold: 8,
            max_completed_queue: 128,
            hot_cache_size: 1024,
            hot_card_limit: 4,
            num_par_ids: 4,
            splay_dictionary: false,
            verbose: false,
        }
    }
}
