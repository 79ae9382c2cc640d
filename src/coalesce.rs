//! Boundary-tag coalescing.

use log::trace;

use crate::block::{Arena, Block};
use crate::size_class::SizeClass;

impl Arena {
    /// Merge a block that has just been marked free with its free neighbours,
    /// and return the start of the merged block.
    ///
    /// Neighbours are unlinked from their lists before any size changes, as
    /// their list is found from their size. The merged block is not on any
    /// list when this returns.
    pub fn coalesce(&mut self, block: Block) -> Block {
        let tag = self.tag(block);
        let size = tag.size();
        let next = block.next(size);
        let next_tag = self.tag(next);

        // The prologue is never free, so a set flag always has a block to find.
        let prev = if tag.prev_free() { self.prev(block) } else { None };

        match (prev, next_tag.is_free()) {
            (None, false) => block,
            (None, true) => {
                trace!("coalesce {:#x} with next {:#x}", block.offset(), next.offset());
                self.remove(next);
                self.set_size(block, size + next_tag.size());
                self.mark(block, true);
                block
            }
            (Some(prev), false) => {
                trace!("coalesce {:#x} with prev {:#x}", block.offset(), prev.offset());
                self.remove(prev);
                let merged = self.size(prev) + size;
                self.set_size(prev, merged);
                self.mark(prev, true);
                prev
            }
            (Some(prev), true) => {
                trace!(
                    "coalesce {:#x} with prev {:#x} and next {:#x}",
                    block.offset(),
                    prev.offset(),
                    next.offset()
                );
                self.remove(prev);
                self.remove(next);
                let merged = self.size(prev) + size + next_tag.size();
                self.set_size(prev, merged);
                self.mark(prev, true);
                prev
            }
        }
    }

    /// Coalesce a newly free block and file the result in its list. Both
    /// `release` and heap extension go through here.
    pub fn add_free(&mut self, block: Block) -> Block {
        let block = self.coalesce(block);
        let class = SizeClass::for_words(self.size(block));
        self.insert(class, block);
        block
    }
}
