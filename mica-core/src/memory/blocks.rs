//! Lazily-allocated fixed-size block storage backing each memory segment.

use std::collections::HashMap;
use std::fmt;

/// Number of words per block (4 KiB of simulated memory for word cells).
pub const BLOCK_WORDS: u64 = 1024;
// The index arithmetic below requires a power-of-two block size.
const_assert!(BLOCK_WORDS.is_power_of_two());

/// A sparse table of fixed-size blocks, indexed by word offset.
///
/// A block is allocated on the first store into it; loads from an absent
/// block return `T::default()` without allocating. Segments hand this their
/// word offset relative to the segment base (computed *downward* from the
/// stack base for the stack segment), so the table itself never sees
/// absolute addresses.
pub struct BlockTable<T> {
    blocks: HashMap<u64, Box<[T; BLOCK_WORDS as usize]>>,
}

impl<T: Copy + Default> BlockTable<T> {
    pub fn new() -> Self {
        Self {
            blocks: HashMap::new(),
        }
    }

    /// Loads the value at `word_index`, defaulting for absent blocks.
    pub fn load(&self, word_index: u64) -> T {
        self.slot(word_index).unwrap_or_default()
    }

    /// Loads the value at `word_index`, or `None` if its block was never
    /// allocated. Distinguishes "never written" from "written as default".
    pub fn slot(&self, word_index: u64) -> Option<T> {
        self.blocks
            .get(&(word_index / BLOCK_WORDS))
            .map(|block| block[(word_index % BLOCK_WORDS) as usize])
    }

    /// Stores `value` at `word_index`, allocating its block if needed.
    /// Returns the previous value (the default for a fresh block).
    pub fn store(&mut self, word_index: u64, value: T) -> T {
        let block = self
            .blocks
            .entry(word_index / BLOCK_WORDS)
            .or_insert_with(|| Box::new([T::default(); BLOCK_WORDS as usize]));
        std::mem::replace(&mut block[(word_index % BLOCK_WORDS) as usize], value)
    }

    /// The number of blocks allocated so far.
    pub fn allocated_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl<T: Copy + Default> Default for BlockTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BlockTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut indices: Vec<_> = self.blocks.keys().collect();
        indices.sort_unstable();
        f.debug_struct("BlockTable")
            .field("allocated_blocks", &indices)
            .finish()
    }
}
