//! Block layout: bit-packed boundary tags, and the raw heap arena they live in.
//!
//! Every block starts with a one-word header. Free blocks also end with a
//! footer that mirrors the header, so the block before any free block can be
//! found in O(1). Allocated blocks have no footer; that word is payload.
//!
//! ```text
//! Allocated:  | header | payload ...................................... |
//! Free:       | header | prev link | next link | (unused) ...  | footer |
//!                      ^
//!                      block offset (8-byte aligned)
//! ```
//!
//! Blocks are identified by the byte offset of their payload from the low
//! bound of the heap region, and free-list links are stored as the same kind
//! of offset. Nothing in the heap holds a real pointer.

use core::fmt;
use core::num::NonZeroU32;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::error::AllocError;

/// Size of a header, footer, or free-list link, in bytes.
pub const WORD: usize = 4;

/// Alignment of every payload, in bytes.
pub const DWORD: usize = 8;

/// The smallest block: a header, two links and a footer.
pub const MIN_BLOCK_WORDS: u32 = 4;

/// Default number of words the heap is extended by.
pub const CHUNK_WORDS: u32 = 40;

const_assert!(MIN_BLOCK_WORDS as usize * WORD >= 4 * WORD);
const_assert!(MIN_BLOCK_WORDS as usize * WORD % DWORD == 0);
const_assert!(CHUNK_WORDS as usize * WORD % DWORD == 0);
const_assert!(CHUNK_WORDS >= MIN_BLOCK_WORDS);

/// The block size, in words, used to satisfy a request for `size` bytes: the
/// payload plus a header, rounded up to a double word, and never below the
/// minimum block size.
pub(crate) fn block_words(size: usize) -> Result<u32, AllocError> {
    let too_large = AllocError::TooLarge { requested: size };
    let bytes = size.checked_add(WORD + DWORD - 1).ok_or(too_large)? / DWORD * DWORD;
    let words = core::cmp::max(bytes / WORD, MIN_BLOCK_WORDS as usize);
    u32::try_from(words)
        .ok()
        .filter(|&words| words <= Tag::SIZE_MASK)
        .ok_or(too_large)
}

/// A header or footer word.
///
/// Bit 31 is set when the physically previous block is free, bit 30 is set
/// when this block is allocated, and the remaining 30 bits hold the size of
/// the block in words.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct Tag(u32);

impl Tag {
    const PREV_FREE: u32 = 1 << 31;
    const ALLOCATED: u32 = 1 << 30;
    pub const SIZE_MASK: u32 = Self::ALLOCATED - 1;

    /// The zero-sized, always-allocated marker closing the heap.
    pub const EPILOGUE: Tag = Tag::new(0, true, false);

    /// Pack a tag. Panics if `size` does not fit in 30 bits.
    pub const fn new(size: u32, allocated: bool, prev_free: bool) -> Tag {
        assert!(size <= Self::SIZE_MASK, "block size does not fit in a tag");
        let mut bits = size;
        if allocated {
            bits |= Self::ALLOCATED;
        }
        if prev_free {
            bits |= Self::PREV_FREE;
        }
        Tag(bits)
    }

    pub const fn from_bits(bits: u32) -> Tag {
        Tag(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Size of the block, in words.
    pub const fn size(self) -> u32 {
        self.0 & Self::SIZE_MASK
    }

    pub const fn is_allocated(self) -> bool {
        self.0 & Self::ALLOCATED != 0
    }

    pub const fn is_free(self) -> bool {
        !self.is_allocated()
    }

    /// Whether the block physically before this one is free.
    pub const fn prev_free(self) -> bool {
        self.0 & Self::PREV_FREE != 0
    }

    pub const fn with_size(self, size: u32) -> Tag {
        Tag::new(size, self.is_allocated(), self.prev_free())
    }

    pub const fn with_allocated(self, allocated: bool) -> Tag {
        Tag::new(self.size(), allocated, self.prev_free())
    }

    pub const fn with_prev_free(self, prev_free: bool) -> Tag {
        Tag::new(self.size(), self.is_allocated(), prev_free)
    }

    /// The same tag without the previous-free bit, as stored in footers.
    pub const fn footer(self) -> Tag {
        self.with_prev_free(false)
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{}{}]",
            self.size(),
            if self.is_allocated() { 'a' } else { 'f' },
            if self.prev_free() { ", prev free" } else { "" },
        )
    }
}

/// A block, named by the offset of its payload from the heap's low bound.
///
/// Offset 0 is always inside the size-class table, so it never names a block
/// and is free to encode "no block" in free-list links.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub(crate) struct Block(NonZeroU32);

impl Block {
    pub fn new(offset: u32) -> Option<Block> {
        NonZeroU32::new(offset).map(Block)
    }

    /// Decode a free-list link.
    pub fn from_link(link: u32) -> Option<Block> {
        Block::new(link)
    }

    /// Encode a free-list link.
    pub fn to_link(block: Option<Block>) -> u32 {
        block.map_or(0, Block::offset)
    }

    pub fn offset(self) -> u32 {
        self.0.get()
    }

    /// Offset of the header word.
    pub fn header(self) -> u32 {
        self.offset() - WORD as u32
    }

    /// Offset of the footer word, given the block size in words.
    pub fn footer(self, size: u32) -> u32 {
        self.offset() + size * WORD as u32 - DWORD as u32
    }

    /// The block physically after this one, given this block's size in words.
    pub fn next(self, size: u32) -> Block {
        Block(self.0.saturating_add(size * WORD as u32))
    }
}

/// A view of the heap region as an array of words.
///
/// An `Arena` is rebuilt from the memory source whenever it is needed, so it
/// always reflects the current break. It is `Copy`; all copies alias the same
/// memory, and writes go through the raw base pointer.
#[derive(Copy, Clone)]
pub(crate) struct Arena {
    base: NonNull<u8>,
    brk: u32,
    table: u32,
}

impl Arena {
    /// Construct a view over `brk` bytes starting at `base`, with the
    /// size-class table at offset `table`.
    ///
    /// # Safety
    ///
    /// `base..base + brk` must be readable and writable memory owned by the
    /// allocator for as long as the view is used, and `base` must be 8-byte
    /// aligned.
    pub unsafe fn new(base: NonNull<u8>, brk: u32, table: u32) -> Arena {
        debug_assert_eq!(base.as_ptr() as usize % DWORD, 0);
        Arena { base, brk, table }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Number of bytes the memory source has handed out so far.
    pub fn brk(&self) -> u32 {
        self.brk
    }

    pub fn table(&self) -> u32 {
        self.table
    }

    /// Whether the word at `offset` lies within the allocator's region.
    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.table
            && offset
                .checked_add(WORD as u32)
                .is_some_and(|end| end <= self.brk)
    }

    pub fn word(&self, offset: u32) -> u32 {
        debug_assert!(self.contains(offset), "read outside heap at {:#x}", offset);
        debug_assert_eq!(offset as usize % WORD, 0);
        unsafe { self.base.as_ptr().add(offset as usize).cast::<u32>().read() }
    }

    pub fn set_word(&mut self, offset: u32, value: u32) {
        debug_assert!(self.contains(offset), "write outside heap at {:#x}", offset);
        debug_assert_eq!(offset as usize % WORD, 0);
        unsafe {
            self.base
                .as_ptr()
                .add(offset as usize)
                .cast::<u32>()
                .write(value)
        }
    }

    /// The payload address of `block`.
    pub fn ptr(&self, block: Block) -> NonNull<u8> {
        unsafe { self.base.add(block.offset() as usize) }
    }

    /// The block whose payload starts at `ptr`, if `ptr` lies in the heap.
    pub fn block_at(&self, ptr: *const u8) -> Option<Block> {
        let offset = (ptr as usize).checked_sub(self.base.as_ptr() as usize)?;
        let offset = u32::try_from(offset).ok()?;
        let block = Block::new(offset)?;
        if offset < WORD as u32 || !self.contains(block.header()) {
            return None;
        }
        Some(block)
    }

    pub fn is_aligned(&self, block: Block) -> bool {
        self.ptr(block).as_ptr() as usize % DWORD == 0
    }

    pub fn tag(&self, block: Block) -> Tag {
        Tag::from_bits(self.word(block.header()))
    }

    pub fn set_tag(&mut self, block: Block, tag: Tag) {
        self.set_word(block.header(), tag.bits());
    }

    /// Read the footer of a free block, locating it through the header.
    pub fn footer_tag(&self, block: Block) -> Tag {
        Tag::from_bits(self.word(block.footer(self.size(block))))
    }

    pub fn size(&self, block: Block) -> u32 {
        self.tag(block).size()
    }

    pub fn is_allocated(&self, block: Block) -> bool {
        self.tag(block).is_allocated()
    }

    /// Change the size recorded in the header, keeping both flags.
    pub fn set_size(&mut self, block: Block, size: u32) {
        let tag = self.tag(block).with_size(size);
        self.set_tag(block, tag);
    }

    pub fn next(&self, block: Block) -> Block {
        block.next(self.size(block))
    }

    /// The block before `block`, found through its footer. Only meaningful
    /// when that block is free.
    pub fn prev(&self, block: Block) -> Option<Block> {
        let footer = block.header().checked_sub(WORD as u32)?;
        if !self.contains(footer) {
            return None;
        }
        let size = Tag::from_bits(self.word(footer)).size();
        Block::new(block.offset().checked_sub(size * WORD as u32)?)
    }

    /// Mark `block` free or allocated.
    ///
    /// A free block gets a footer mirroring its header, and the block after
    /// it has its previous-free flag updated to match. The epilogue has size
    /// zero and no successor, so only its header is touched.
    pub fn mark(&mut self, block: Block, free: bool) {
        let tag = self.tag(block).with_allocated(!free);
        self.set_tag(block, tag);

        let size = tag.size();
        if size == 0 {
            return;
        }
        if free {
            self.set_word(block.footer(size), tag.footer().bits());
        }

        let next = block.next(size);
        let next_tag = self.tag(next).with_prev_free(free);
        self.set_tag(next, next_tag);
    }
}
