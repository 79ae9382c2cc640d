//! Heap consistency checking.
//!
//! The checker walks the heap twice: once block by block from the prologue to
//! the epilogue, and once through every free list. It never writes to the
//! heap, and it checks bounds before following any size or link, so it can be
//! pointed at a corrupted heap without wandering off.

use log::{debug, error};
use thiserror::Error;

use crate::allocators::{HeapGrower, RawAlloc};
use crate::block::{Arena, Block, Tag, MIN_BLOCK_WORDS, WORD};
use crate::size_class::SizeClass;

/// Summary of a heap that passed the check.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Ordinary blocks, not counting the sentinels.
    pub blocks: usize,
    pub free_blocks: usize,
    /// Bytes in free blocks, headers and footers included.
    pub free_bytes: usize,
    /// Bytes in allocated blocks, headers included.
    pub allocated_bytes: usize,
    /// Bytes obtained from the memory source, list table and sentinels
    /// included.
    pub heap_bytes: usize,
}

/// A broken heap invariant, with the offset of the block where it was found.
///
/// Offsets are relative to the low bound of the heap region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("bad prologue header {header:#010x}")]
    BadPrologue { header: u32 },

    #[error("block at {block:#x} is not double-word aligned")]
    Misaligned { block: u32 },

    #[error("block at {block:#x} lies outside the heap")]
    OutOfBounds { block: u32 },

    #[error("block at {block:#x} has {size} words, below the minimum")]
    TooSmall { block: u32, size: u32 },

    #[error("free block at {block:#x} has header {header:#010x} but footer {footer:#010x}")]
    FooterMismatch { block: u32, header: u32, footer: u32 },

    #[error("free blocks at {prev:#x} and {block:#x} are adjacent")]
    Uncoalesced { prev: u32, block: u32 },

    #[error("block at {block:#x} has previous-free flag {prev_free}, which does not match its predecessor")]
    PrevFreeMismatch { block: u32, prev_free: bool },

    #[error("bad epilogue header {header:#010x} at {block:#x}")]
    BadEpilogue { block: u32, header: u32 },

    #[error("{class}: node {block:#x} lies outside the heap")]
    ListOutOfBounds { class: SizeClass, block: u32 },

    #[error("{class}: node {block:#x} is marked allocated")]
    ListNodeAllocated { class: SizeClass, block: u32 },

    #[error("{class}: node {block:#x} links back to {found:#x} instead of {expected:#x}")]
    BrokenLink {
        class: SizeClass,
        block: u32,
        expected: u32,
        found: u32,
    },

    #[error("{class}: node {block:#x} of {size} words belongs in {expected}")]
    WrongClass {
        class: SizeClass,
        block: u32,
        size: u32,
        expected: SizeClass,
    },

    #[error("{class}: list does not terminate")]
    ListCycle { class: SizeClass },

    #[error("{in_heap} free blocks in the heap, but {in_lists} in the free lists")]
    FreeCountMismatch { in_heap: usize, in_lists: usize },
}

impl Arena {
    /// Check every invariant of the heap starting after `prologue`.
    pub(crate) fn check(&self, prologue: Block, verbose: bool) -> Result<HeapStats, Violation> {
        let mut stats = self.check_blocks(prologue, verbose)?;
        let in_lists = self.check_lists()?;
        if in_lists != stats.free_blocks {
            return Err(Violation::FreeCountMismatch {
                in_heap: stats.free_blocks,
                in_lists,
            });
        }
        stats.heap_bytes = self.brk() as usize;
        Ok(stats)
    }

    fn check_blocks(&self, prologue: Block, verbose: bool) -> Result<HeapStats, Violation> {
        if !self.contains(prologue.header()) || !self.contains(prologue.offset()) {
            return Err(Violation::OutOfBounds {
                block: prologue.offset(),
            });
        }
        let tag = self.tag(prologue);
        if tag.size() != 2 || tag.is_free() || self.word(prologue.offset()) != tag.bits() {
            return Err(Violation::BadPrologue { header: tag.bits() });
        }

        let mut stats = HeapStats::default();
        let mut prev: Option<Block> = None;
        let mut block = prologue.next(2);
        loop {
            if !self.contains(block.header()) {
                return Err(Violation::OutOfBounds {
                    block: block.offset(),
                });
            }
            let tag = self.tag(block);
            if verbose {
                debug!("{:#x}: {:?}", block.offset(), tag);
            }

            if tag.prev_free() != prev.is_some() {
                return Err(Violation::PrevFreeMismatch {
                    block: block.offset(),
                    prev_free: tag.prev_free(),
                });
            }
            if tag.size() == 0 {
                break;
            }

            if !self.is_aligned(block) {
                return Err(Violation::Misaligned {
                    block: block.offset(),
                });
            }
            if tag.size() < MIN_BLOCK_WORDS {
                return Err(Violation::TooSmall {
                    block: block.offset(),
                    size: tag.size(),
                });
            }
            let next = block.next(tag.size());
            if !self.contains(next.header()) {
                return Err(Violation::OutOfBounds {
                    block: block.offset(),
                });
            }

            let bytes = tag.size() as usize * WORD;
            stats.blocks += 1;
            if tag.is_free() {
                let footer = self.footer_tag(block);
                if footer != tag.footer() {
                    return Err(Violation::FooterMismatch {
                        block: block.offset(),
                        header: tag.bits(),
                        footer: footer.bits(),
                    });
                }
                if let Some(prev) = prev {
                    return Err(Violation::Uncoalesced {
                        prev: prev.offset(),
                        block: block.offset(),
                    });
                }
                stats.free_blocks += 1;
                stats.free_bytes += bytes;
                prev = Some(block);
            } else {
                stats.allocated_bytes += bytes;
                prev = None;
            }

            block = next;
        }

        // The epilogue closes the heap, right at the break.
        let tag = self.tag(block);
        if tag.with_prev_free(false) != Tag::EPILOGUE
            || block.header() + WORD as u32 != self.brk()
        {
            return Err(Violation::BadEpilogue {
                block: block.offset(),
                header: tag.bits(),
            });
        }

        Ok(stats)
    }

    /// Walk every free list, and return the number of nodes found.
    fn check_lists(&self) -> Result<usize, Violation> {
        // No list can hold more nodes than fit in the heap.
        let limit = self.brk() as usize / (MIN_BLOCK_WORDS as usize * WORD);

        let mut count = 0;
        for class in SizeClass::all() {
            let mut expected: Option<Block> = None;
            let mut node = self.head(class);
            let mut steps = 0;
            while let Some(block) = node {
                steps += 1;
                if steps > limit {
                    return Err(Violation::ListCycle { class });
                }
                // A link below one word has no header to look at.
                if block.offset() < WORD as u32
                    || !self.contains(block.header())
                    || !self.contains(block.offset() + WORD as u32)
                {
                    return Err(Violation::ListOutOfBounds {
                        class,
                        block: block.offset(),
                    });
                }

                let tag = self.tag(block);
                if tag.is_allocated() {
                    return Err(Violation::ListNodeAllocated {
                        class,
                        block: block.offset(),
                    });
                }
                let found = self.free_prev(block);
                if found != expected {
                    return Err(Violation::BrokenLink {
                        class,
                        block: block.offset(),
                        expected: Block::to_link(expected),
                        found: Block::to_link(found),
                    });
                }
                let belongs = SizeClass::for_words(tag.size());
                if belongs != class {
                    return Err(Violation::WrongClass {
                        class,
                        block: block.offset(),
                        size: tag.size(),
                        expected: belongs,
                    });
                }

                count += 1;
                expected = Some(block);
                node = self.free_next(block);
            }
        }

        Ok(count)
    }
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Check every heap invariant.
    ///
    /// Returns statistics on success, or the first violation found. An
    /// uninitialized heap is trivially consistent. With `verbose`, every
    /// block visited is logged at debug level.
    pub fn check_heap(&self, verbose: bool) -> Result<HeapStats, Violation> {
        let Ok((arena, prologue)) = self.anchored() else {
            return Ok(HeapStats::default());
        };
        arena
            .check(prologue, verbose)
            .inspect_err(|violation| error!("heap check failed: {}", violation))
    }

    /// With the `checkheap` feature, check the heap and panic on the first
    /// violation. Otherwise a no-op.
    pub(crate) fn debug_check(&self) {
        #[cfg(feature = "checkheap")]
        if let Err(violation) = self.check_heap(true) {
            panic!("heap check failed: {}", violation);
        }
    }
}
