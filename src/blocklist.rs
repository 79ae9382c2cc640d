//! The segregated free lists.
//!
//! Each size class has a doubly linked list of free blocks. The list heads
//! live in a small table at the start of the heap region, one word per class,
//! and each free block stores its `prev` and `next` links in the first two
//! words of its payload. Heads and links are block offsets, with 0 for "none".
//!
//! Blocks are pushed at the head of their list, so each list is ordered most
//! recently freed first, and first-fit visits blocks in that order.

use crate::block::{Arena, Block, DWORD, WORD};
use crate::size_class::{SizeClass, SIZE_CLASSES};

use static_assertions::const_assert;

/// Bytes reserved for the list heads, padded to keep the heap aligned.
pub const TABLE_BYTES: usize = (SIZE_CLASSES * WORD).div_ceil(DWORD) * DWORD;
const_assert!(TABLE_BYTES >= SIZE_CLASSES * WORD);
const_assert!(TABLE_BYTES % DWORD == 0);

impl Arena {
    fn head_slot(&self, class: SizeClass) -> u32 {
        self.table() + (class.index() * WORD) as u32
    }

    /// The first block of `class`'s list.
    pub fn head(&self, class: SizeClass) -> Option<Block> {
        Block::from_link(self.word(self.head_slot(class)))
    }

    pub fn set_head(&mut self, class: SizeClass, block: Option<Block>) {
        self.set_word(self.head_slot(class), Block::to_link(block));
    }

    pub fn free_prev(&self, block: Block) -> Option<Block> {
        Block::from_link(self.word(block.offset()))
    }

    pub fn free_next(&self, block: Block) -> Option<Block> {
        Block::from_link(self.word(block.offset() + WORD as u32))
    }

    fn set_free_prev(&mut self, block: Block, prev: Option<Block>) {
        self.set_word(block.offset(), Block::to_link(prev));
    }

    fn set_free_next(&mut self, block: Block, next: Option<Block>) {
        self.set_word(block.offset() + WORD as u32, Block::to_link(next));
    }

    /// Push a free block at the head of `class`'s list.
    pub fn insert(&mut self, class: SizeClass, block: Block) {
        let first = self.head(class);
        self.set_free_prev(block, None);
        self.set_free_next(block, first);
        if let Some(first) = first {
            self.set_free_prev(first, Some(block));
        }
        self.set_head(class, Some(block));
    }

    /// Unlink a free block from its list.
    ///
    /// The list is found from the block's current size, so this must happen
    /// before the size changes.
    pub fn remove(&mut self, block: Block) {
        let prev = self.free_prev(block);
        let next = self.free_next(block);

        match prev {
            Some(prev) => self.set_free_next(prev, next),
            None => {
                let class = SizeClass::for_words(self.size(block));
                debug_assert_eq!(self.head(class), Some(block));
                self.set_head(class, next);
            }
        }
        if let Some(next) = next {
            self.set_free_prev(next, prev);
        }

        self.set_free_prev(block, None);
        self.set_free_next(block, None);
    }

    /// Walk `class`'s list in order.
    pub fn free_list(&self, class: SizeClass) -> FreeIter<'_> {
        FreeIter {
            arena: self,
            next: self.head(class),
        }
    }

    /// First fit: scan the lists from `words`' class upward, and return the
    /// first block large enough.
    pub fn find_fit(&self, words: u32) -> Option<Block> {
        SizeClass::for_words(words)
            .and_larger()
            .flat_map(|class| self.free_list(class))
            .find(|&block| self.size(block) >= words)
    }
}

pub(crate) struct FreeIter<'arena> {
    arena: &'arena Arena,
    next: Option<Block>,
}

impl Iterator for FreeIter<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let block = self.next.take()?;
        self.next = self.arena.free_next(block);
        Some(block)
    }
}
