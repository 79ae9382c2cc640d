//! Allocator types, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`RawAlloc`](struct.RawAlloc.html)
//!
//! A `RawAlloc` is a single-threaded heap manager: it carves blocks out of a
//! region obtained from a [`HeapGrower`], keeps freed blocks on segregated free
//! lists, and merges neighbouring free blocks as they are released. Its API
//! mirrors `malloc`, `free`, `realloc` and `calloc`, returning null on failure.
//!
//! ### [`GenericAllocator`](struct.GenericAllocator.html)
//!
//! A `GenericAllocator` wraps `RawAlloc` in a spin lock so that it can be a
//! `static` and implement
//! [`core::alloc::GlobalAlloc`](https://doc.rust-lang.org/core/alloc/trait.GlobalAlloc.html).
//! With the `use_libc` feature, `UnixAllocator` is one backed by
//! [`MmapHeapGrower`](../unix/struct.MmapHeapGrower.html).
//!
//! ### [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` abstracts over the source of heap memory: something that can
//! extend a contiguous region, `sbrk`-style, and report its bounds.
//!
//! ### [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a fixed array that can pretend to be a heap, and implements
//! `HeapGrower` for such a purpose. It is mainly useful for testing.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::UnsafeCell;
use core::cmp::{max, min};
use core::fmt;
use core::marker::PhantomData;
use core::ptr::{self, null_mut, NonNull};

use log::{debug, error, trace};
use spin::Mutex;
use thiserror::Error;

use crate::block::{block_words, Arena, Block, Tag, CHUNK_WORDS, DWORD, MIN_BLOCK_WORDS, WORD};
use crate::blocklist::TABLE_BYTES;
use crate::check::{HeapStats, Violation};
use crate::error::AllocError;
use crate::size_class::SizeClass;
#[cfg(feature = "use_libc")]
use crate::unix::MmapHeapGrower;

/// Offsets into the heap are 32 bits wide.
const MAX_HEAP_BYTES: usize = u32::MAX as usize;

/// A source of heap memory.
///
/// # Safety
///
/// Implementors must hand out a single contiguous region:
///
/// - `grow_heap(size)` extends the region by exactly `size` bytes and returns
///   the start of the new bytes, which is the previous `high_bound()`.
/// - `low_bound()` is 8-byte aligned, and neither it nor any byte handed out
///   moves or is reclaimed while the allocator is alive.
/// - `low_bound()..high_bound()` is readable and writable, and not accessed by
///   anything but the allocator and the holders of its allocations.
///
/// Before the first successful `grow_heap`, both bounds may be null.
pub unsafe trait HeapGrower {
    type Err: fmt::Debug;

    /// Grow the heap by `size` bytes, returning a pointer to the new bytes.
    fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// The first byte of the region.
    fn low_bound(&self) -> *mut u8;

    /// One past the last byte of the region.
    fn high_bound(&self) -> *mut u8;
}

/// Where the list table and the prologue ended up during `init`.
#[derive(Copy, Clone, Debug)]
struct Anchor {
    table: u32,
    prologue: Block,
}

/// A raw allocator over a single growable region.
///
/// Note: it never returns memory to the source; the heap only grows.
///
/// The heap is laid out as
///
/// ```text
/// | list table | pad | prologue | blocks ... | epilogue |
/// ```
///
/// where the prologue is an allocated block with no payload and the epilogue
/// a zero-sized allocated header, so walking the heap never needs a bounds
/// check. All state lives in the region itself; `RawAlloc` only remembers
/// where the table and prologue are.
pub struct RawAlloc<G> {
    pub grower: G,
    anchor: Option<Anchor>,
}

impl<G: HeapGrower + Default> Default for RawAlloc<G> {
    fn default() -> Self {
        RawAlloc::new(G::default())
    }
}

impl<G> RawAlloc<G> {
    /// Create a new `RawAlloc`. The heap is set up on first use, or by an
    /// explicit [`init`](#method.init).
    pub const fn new(grower: G) -> Self {
        RawAlloc {
            grower,
            anchor: None,
        }
    }
}

impl<G: HeapGrower> RawAlloc<G> {
    pub(crate) fn arena(&self) -> Result<Arena, AllocError> {
        let anchor = self.anchor.ok_or(AllocError::Uninitialized)?;
        self.arena_with(anchor.table)
    }

    fn arena_with(&self, table: u32) -> Result<Arena, AllocError> {
        let base = NonNull::new(self.grower.low_bound()).ok_or(AllocError::Uninitialized)?;
        let brk = self.grower.high_bound() as usize - base.as_ptr() as usize;
        debug_assert!(brk <= MAX_HEAP_BYTES);
        // Safety: the region belongs to us, per the HeapGrower contract.
        Ok(unsafe { Arena::new(base, brk as u32, table) })
    }

    /// The arena together with the prologue block.
    pub(crate) fn anchored(&self) -> Result<(Arena, Block), AllocError> {
        let anchor = self.anchor.ok_or(AllocError::Uninitialized)?;
        Ok((self.arena_with(anchor.table)?, anchor.prologue))
    }

    /// Whether the heap has been set up.
    pub fn is_initialized(&self) -> bool {
        self.anchor.is_some()
    }

    /// Take `bytes` more bytes from the source, and return their offset.
    fn grow(&mut self, bytes: usize) -> Result<u32, AllocError> {
        let brk = self.grower.high_bound() as usize - self.grower.low_bound() as usize;
        if brk
            .checked_add(bytes)
            .map_or(true, |end| end > MAX_HEAP_BYTES)
        {
            return Err(AllocError::TooLarge { requested: bytes });
        }

        let start = self.grower.grow_heap(bytes).map_err(|err| {
            debug!("heap source refused to grow by {} bytes: {:?}", bytes, err);
            AllocError::OutOfMemory { requested: bytes }
        })?;
        Ok((start.as_ptr() as usize - self.grower.low_bound() as usize) as u32)
    }

    /// Set up an empty heap: the size-class table, the prologue and epilogue,
    /// and one free chunk of [`CHUNK_WORDS`](../constant.CHUNK_WORDS.html)
    /// words.
    ///
    /// Calling this again starts a fresh heap after the old one; blocks in the
    /// old heap are abandoned.
    pub fn init(&mut self) -> Result<(), AllocError> {
        self.anchor = None;

        let table = self.grow(TABLE_BYTES)?;
        let start = self.grow(4 * WORD)?;
        debug_assert_eq!(start, table + TABLE_BYTES as u32);

        let mut arena = self.arena_with(table)?;
        for class in SizeClass::all() {
            arena.set_head(class, None);
        }

        // One word of padding, then the prologue's header and footer, then
        // the epilogue.
        arena.set_word(start, 0);
        let prologue = Block::new(start + DWORD as u32).ok_or(AllocError::Uninitialized)?;
        let tag = Tag::new(2, true, false);
        arena.set_tag(prologue, tag);
        arena.set_word(prologue.footer(2), tag.bits());
        arena.set_tag(prologue.next(2), Tag::EPILOGUE);

        self.anchor = Some(Anchor { table, prologue });
        debug!("heap initialized: table at {:#x}, prologue at {:#x}", table, prologue.offset());

        self.extend_words(CHUNK_WORDS)?;
        Ok(())
    }

    /// Grow the heap by `words` words (rounded up to keep alignment), as one
    /// free block that merges with a free block at the end of the heap.
    pub fn extend(&mut self, words: usize) -> Result<(), AllocError> {
        let words = u32::try_from(words)
            .ok()
            .filter(|&words| words < Tag::SIZE_MASK)
            .ok_or(AllocError::TooLarge {
                requested: words.saturating_mul(WORD),
            })?;
        self.extend_words(words)?;
        self.debug_check();
        Ok(())
    }

    fn extend_words(&mut self, words: u32) -> Result<Block, AllocError> {
        if self.anchor.is_none() {
            return Err(AllocError::Uninitialized);
        }
        let words = max(words + words % 2, MIN_BLOCK_WORDS);
        let start = self.grow(words as usize * WORD)?;
        debug!("extended heap by {} words at {:#x}", words, start);

        // The new block's header takes over the old epilogue's word, along
        // with its previous-free flag.
        let mut arena = self.arena()?;
        let block = Block::new(start).ok_or(AllocError::Uninitialized)?;
        let prev_free = arena.tag(block).prev_free();
        arena.set_tag(block, Tag::new(words, false, prev_free));
        arena.set_tag(block.next(words), Tag::EPILOGUE);
        arena.mark(block, true);

        Ok(arena.add_free(block))
    }

    /// Allocate `size` bytes, returning a pointer to 8-byte aligned memory,
    /// or null if `size` is 0 or the heap cannot grow to fit it.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }

        let ptr = match self.try_allocate(size) {
            Ok(ptr) => ptr.as_ptr(),
            Err(err) => {
                debug!("allocate({}) failed: {}", size, err);
                null_mut()
            }
        };
        self.debug_check();
        ptr
    }

    fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if self.anchor.is_none() {
            self.init()?;
        }
        let words = block_words(size)?;

        let block = match self.arena()?.find_fit(words) {
            Some(block) => block,
            None => self.extend_words(max(words, CHUNK_WORDS))?,
        };

        let mut arena = self.arena()?;
        arena.place(block, words);
        trace!("allocate({}) -> {:#x} ({} words)", size, block.offset(), arena.size(block));
        Ok(arena.ptr(block))
    }

    /// Allocate `size` bytes aligned to `align`, a power of two.
    ///
    /// Alignments up to 8 are plain allocations. Larger ones over-allocate,
    /// then give the misaligned front of the block back to the free lists.
    /// The result is released like any other allocation.
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> *mut u8 {
        if align <= DWORD {
            return self.allocate(size);
        }
        if size == 0 || !align.is_power_of_two() {
            return null_mut();
        }
        let Some(padded) = size.checked_add(align + MIN_BLOCK_WORDS as usize * WORD) else {
            debug!("allocate_aligned({}, {}) overflows", size, align);
            return null_mut();
        };

        let ptr = self.allocate(padded);
        if ptr.is_null() {
            return ptr;
        }
        let Ok(mut arena) = self.arena() else {
            return null_mut();
        };
        let Some(block) = arena.block_at(ptr) else {
            return null_mut();
        };
        let aligned = arena.align(block, align);
        self.debug_check();
        arena.ptr(aligned).as_ptr()
    }

    /// Release memory returned by this allocator. Null is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null, or a pointer returned by this allocator that has
    /// not been released since.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let Some((mut arena, block)) = self.allocated_block(ptr) else {
            error!("release of {:?}, which is not an allocated block", ptr);
            debug_assert!(false, "release of {:?}, which is not an allocated block", ptr);
            return;
        };

        trace!("release {:#x} ({} words)", block.offset(), arena.size(block));
        arena.mark(block, true);
        arena.add_free(block);
        self.debug_check();
    }

    /// Resize an allocation, always by moving it.
    ///
    /// A `size` of 0 releases `ptr` and returns null; a null `ptr` is a plain
    /// allocation. Otherwise the first `min(old size, size)` bytes are copied
    /// to a new block and the old one is released. If no new block can be
    /// found, null is returned and `ptr` is left untouched.
    ///
    /// # Safety
    ///
    /// As for [`release`](#method.release).
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            self.release(ptr);
            return null_mut();
        }
        if ptr.is_null() {
            return self.allocate(size);
        }
        let Some(old_size) = self.payload_size(ptr) else {
            return null_mut();
        };

        let new = self.allocate(size);
        if new.is_null() {
            return null_mut();
        }
        ptr::copy_nonoverlapping(ptr, new, min(old_size, size));
        self.release(ptr);
        new
    }

    /// Allocate zeroed memory for `count` elements of `size` bytes each.
    /// Returns null if the total overflows or cannot be allocated.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> *mut u8 {
        let Some(bytes) = count.checked_mul(size) else {
            debug!("allocate_zeroed({}, {}) overflows", count, size);
            return null_mut();
        };

        let ptr = self.allocate(bytes);
        if !ptr.is_null() {
            // Safety: we just allocated at least `bytes` bytes there.
            unsafe { ptr.write_bytes(0, bytes) };
        }
        ptr
    }

    /// Usable bytes in the allocation at `ptr`, which may exceed the size
    /// asked for. `None` if `ptr` is not an allocated block of this heap.
    pub fn payload_size(&self, ptr: *const u8) -> Option<usize> {
        let (arena, block) = self.allocated_block(ptr)?;
        Some(arena.size(block) as usize * WORD - WORD)
    }

    fn allocated_block(&self, ptr: *const u8) -> Option<(Arena, Block)> {
        let arena = self.arena().ok()?;
        let block = arena.block_at(ptr)?;
        arena.is_allocated(block).then_some((arena, block))
    }

    /// Walk the heap's blocks in address order, sentinels excluded.
    pub fn blocks(&self) -> Blocks<'_> {
        let (arena, next) = match self.anchored() {
            Ok((arena, prologue)) => (Some(arena), Some(prologue.next(2))),
            Err(_) => (None, None),
        };
        Blocks {
            arena,
            next,
            _heap: PhantomData,
        }
    }
}

impl Arena {
    /// Take `words` words out of the free block `block`, splitting off the
    /// rest as a new free block when it is large enough to stand alone.
    fn place(&mut self, block: Block, words: u32) {
        self.remove(block);
        let size = self.size(block);
        debug_assert!(size >= words);

        if size - words >= MIN_BLOCK_WORDS {
            self.set_size(block, words);
            self.mark(block, false);

            let rest = block.next(words);
            self.set_tag(rest, Tag::new(size - words, false, false));
            self.mark(rest, true);
            trace!("split {:#x}: {} + {} words", block.offset(), words, size - words);
            self.add_free(rest);
        } else {
            self.mark(block, false);
        }
    }

    /// Move the start of the allocated `block` forward to the first payload
    /// address aligned to `align` that leaves room for a free block in front.
    /// The block must have `align` bytes and a minimum block to spare.
    fn align(&mut self, block: Block, align: usize) -> Block {
        let misalign = self.ptr(block).as_ptr() as usize % align;
        if misalign == 0 {
            return block;
        }
        let mut lead = align - misalign;
        while lead < MIN_BLOCK_WORDS as usize * WORD {
            lead += align;
        }

        let size = self.size(block);
        let lead_words = (lead / WORD) as u32;
        debug_assert!(size >= lead_words + MIN_BLOCK_WORDS);

        let aligned = block.next(lead_words);
        self.set_tag(aligned, Tag::new(size - lead_words, true, true));
        self.set_size(block, lead_words);
        self.mark(block, true);
        trace!("aligned {:#x} to {:#x}", block.offset(), aligned.offset());
        self.add_free(block);
        aligned
    }
}

/// One block of the heap, as seen by [`RawAlloc::blocks`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Start of the payload.
    pub ptr: NonNull<u8>,
    /// Size of the whole block, header included, in bytes.
    pub size: usize,
    pub allocated: bool,
}

impl BlockInfo {
    /// Bytes usable by the holder of an allocated block.
    pub fn payload_size(&self) -> usize {
        self.size - WORD
    }
}

pub struct Blocks<'heap> {
    arena: Option<Arena>,
    next: Option<Block>,
    _heap: PhantomData<&'heap ()>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let arena = self.arena.as_ref()?;
        let block = self.next.take()?;
        if !arena.contains(block.header()) {
            return None;
        }
        let tag = arena.tag(block);
        if tag.size() == 0 {
            return None;
        }
        self.next = Some(block.next(tag.size()));
        Some(BlockInfo {
            ptr: arena.ptr(block),
            size: tag.size() as usize * WORD,
            allocated: tag.is_allocated(),
        })
    }
}

impl<G: HeapGrower> fmt::Display for RawAlloc<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Ok(arena) = self.arena() else {
            return write!(f, "Heap(uninitialized)");
        };

        write!(f, "Heap(")?;
        for (ix, block) in self.blocks().enumerate() {
            if ix > 0 {
                write!(f, ", ")?;
            }
            let state = if block.allocated { 'a' } else { 'f' };
            write!(f, "Block({:?}, {}, {})", block.ptr, block.size, state)?;
        }
        write!(f, ")")?;

        for class in SizeClass::all() {
            if arena.head(class).is_none() {
                continue;
            }
            write!(f, "\n{}: ", class)?;
            for (ix, block) in arena.free_list(class).enumerate() {
                if ix > 0 {
                    write!(f, " -> ")?;
                }
                write!(f, "{:#x}", block.offset())?;
            }
        }
        Ok(())
    }
}

/// A thread-safe allocator, using a spin lock around a `RawAlloc`.
///
/// Thread-safety is required for an allocator to be used as a global
/// allocator, so that was easy to add with a spin lock. The `RawAlloc` is
/// created from `G::default()` on first use.
///
/// Payloads are 8-byte aligned; layouts asking for more go through
/// [`RawAlloc::allocate_aligned`].
///
/// The allocator logs from inside its lock. While this is the global
/// allocator, keep `debug` and `trace` output away from any logger that
/// allocates, or the allocator will re-enter itself.
pub struct GenericAllocator<G> {
    raw: Mutex<Option<RawAlloc<G>>>,
}

impl<G: HeapGrower + Default> Default for GenericAllocator<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G> GenericAllocator<G> {
    pub const fn new() -> Self {
        GenericAllocator {
            raw: Mutex::new(None),
        }
    }
}

impl<G: HeapGrower + Default> GenericAllocator<G> {
    /// Run `f` with exclusive access to the underlying `RawAlloc`.
    ///
    /// Allocating through the global allocator from inside `f` deadlocks.
    pub fn with_raw<R>(&self, f: impl FnOnce(&mut RawAlloc<G>) -> R) -> R {
        let mut raw = self.raw.lock();
        f(raw.get_or_insert_with(RawAlloc::default))
    }

    pub fn stats(&self) -> Result<HeapStats, Violation> {
        self.with_raw(|raw| raw.check_heap(false))
    }
}

unsafe impl<G: HeapGrower + Default> GlobalAlloc for GenericAllocator<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with_raw(|raw| raw.allocate_aligned(layout.size(), layout.align()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.with_raw(|raw| raw.release(ptr))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= DWORD {
            return self.with_raw(|raw| raw.allocate_zeroed(1, layout.size()));
        }
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            ptr.write_bytes(0, layout.size());
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.with_raw(|raw| {
            if layout.align() <= DWORD {
                return raw.reallocate(ptr, new_size);
            }
            let new = raw.allocate_aligned(new_size, layout.align());
            if !new.is_null() {
                ptr::copy_nonoverlapping(ptr, new, min(layout.size(), new_size));
                raw.release(ptr);
            }
            new
        })
    }
}

/// A global allocator backed by an `mmap` reservation.
#[cfg(feature = "use_libc")]
#[derive(Default)]
pub struct UnixAllocator {
    alloc: GenericAllocator<MmapHeapGrower>,
}

#[cfg(feature = "use_libc")]
impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub fn stats(&self) -> Result<HeapStats, Violation> {
        self.alloc.stats()
    }
}

#[cfg(feature = "use_libc")]
unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.alloc.dealloc(ptr, layout)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.alloc.alloc_zeroed(layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.alloc.realloc(ptr, layout, new_size)
    }
}

/// Capacity of a [`ToyHeap`](struct.ToyHeap.html), in bytes.
pub const TOY_HEAP_SIZE: usize = 256 * 1024;

#[repr(C, align(16))]
struct ToyMemory([u8; TOY_HEAP_SIZE]);

/// A fixed array posing as a heap.
///
/// The memory lives inside the struct, so a `ToyHeap` must not be moved once
/// it has handed out memory. Keep the `RawAlloc` owning it in one place.
pub struct ToyHeap {
    /// Bytes handed out so far.
    pub size: usize,
    limit: usize,
    heap: UnsafeCell<ToyMemory>,
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            size: 0,
            limit: TOY_HEAP_SIZE,
            heap: UnsafeCell::new(ToyMemory([0; TOY_HEAP_SIZE])),
        }
    }
}

impl ToyHeap {
    /// A toy heap that refuses to grow past `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        ToyHeap {
            limit: min(limit, TOY_HEAP_SIZE),
            ..ToyHeap::default()
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("toy heap cannot grow by {requested} bytes: {used} of {limit} bytes in use")]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub used: usize,
    pub limit: usize,
}

unsafe impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        if size > self.limit - self.size {
            return Err(ToyHeapOverflowError {
                requested: size,
                used: self.size,
                limit: self.limit,
            });
        }

        // Safety: `self.size <= self.limit <= TOY_HEAP_SIZE`, so this stays
        // within (or one past) the array, which is never null.
        let start = unsafe { NonNull::new_unchecked(self.low_bound().add(self.size)) };
        self.size += size;
        Ok(start)
    }

    fn low_bound(&self) -> *mut u8 {
        self.heap.get().cast()
    }

    fn high_bound(&self) -> *mut u8 {
        self.low_bound().wrapping_add(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    // Bytes taken by the list table and the sentinels.
    const OVERHEAD: usize = TABLE_BYTES + 4 * WORD;

    fn free_blocks(allocator: &RawAlloc<ToyHeap>) -> Vec<BlockInfo> {
        allocator.blocks().filter(|b| !b.allocated).collect()
    }

    fn fill(ptr: *mut u8, len: usize, seed: u8) {
        for i in 0..len {
            unsafe { ptr.add(i).write(seed.wrapping_add(i as u8)) };
        }
    }

    fn verify(ptr: *const u8, len: usize, seed: u8) -> bool {
        (0..len).all(|i| unsafe { ptr.add(i).read() } == seed.wrapping_add(i as u8))
    }

    #[test]
    fn init_lays_out_sentinels() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        assert!(!allocator.is_initialized());
        allocator.init().unwrap();
        assert!(allocator.is_initialized());

        assert_eq!(allocator.grower.size, OVERHEAD + CHUNK_WORDS as usize * WORD);
        let blocks: Vec<BlockInfo> = allocator.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert!(!blocks[0].allocated);
        assert_eq!(blocks[0].size, CHUNK_WORDS as usize * WORD);
        assert_eq!(blocks[0].ptr.as_ptr() as usize % DWORD, 0);
        allocator.check_heap(true).unwrap();
    }

    #[test]
    fn init_fails_without_memory() {
        let mut allocator = RawAlloc::new(ToyHeap::with_limit(TABLE_BYTES));
        assert_eq!(
            allocator.init(),
            Err(AllocError::OutOfMemory {
                requested: 4 * WORD
            })
        );
        assert!(!allocator.is_initialized());
        assert!(allocator.allocate(8).is_null());
    }

    #[test]
    fn extend_requires_init() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        assert_eq!(allocator.extend(10), Err(AllocError::Uninitialized));
        assert_eq!(allocator.grower.size, 0);
    }

    #[test]
    fn extend_merges_with_trailing_free_block() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        allocator.init().unwrap();
        allocator.extend(9).unwrap();

        // 9 words round up to 10, and join the initial chunk.
        let blocks: Vec<BlockInfo> = allocator.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].size, (CHUNK_WORDS as usize + 10) * WORD);
        allocator.check_heap(true).unwrap();
    }

    #[test]
    fn allocate_zero_is_null() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        assert!(allocator.allocate(0).is_null());
        // Not even initialized.
        assert!(!allocator.is_initialized());
        assert_eq!(allocator.grower.size, 0);

        allocator.init().unwrap();
        let before = allocator.check_heap(false).unwrap();
        assert!(allocator.allocate(0).is_null());
        assert_eq!(allocator.check_heap(false).unwrap(), before);
    }

    #[test]
    fn allocate_is_aligned_and_disjoint() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let sizes = [1, 7, 8, 12, 13, 100, 1000, 5];
        let pointers: Vec<*mut u8> = sizes.iter().map(|&s| allocator.allocate(s)).collect();

        for (i, (&ptr, &size)) in pointers.iter().zip(&sizes).enumerate() {
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % DWORD, 0);
            assert!(allocator.payload_size(ptr).unwrap() >= size);
            fill(ptr, size, i as u8);
        }
        for (i, (&ptr, &size)) in pointers.iter().zip(&sizes).enumerate() {
            assert!(verify(ptr, size, i as u8));
        }
        allocator.check_heap(true).unwrap();
    }

    #[test]
    fn allocate_huge_fails_cleanly() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let small = allocator.allocate(64);
        fill(small, 64, 3);
        let before = allocator.grower.size;

        assert!(allocator.allocate(TOY_HEAP_SIZE).is_null());
        assert!(allocator.allocate(usize::MAX).is_null());
        assert!(allocator.allocate(usize::MAX / 2).is_null());

        assert_eq!(allocator.grower.size, before);
        assert!(verify(small, 64, 3));
        allocator.check_heap(true).unwrap();

        // The heap still works afterwards.
        let ptr = allocator.allocate(64);
        assert!(!ptr.is_null());
        allocator.check_heap(true).unwrap();
    }

    #[test]
    fn reuses_freed_block_of_its_class() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let _p16 = allocator.allocate(16);
        let p32 = allocator.allocate(32);
        let _p48 = allocator.allocate(48);

        unsafe { allocator.release(p32) };
        let p24 = allocator.allocate(24);
        assert_eq!(p24, p32);
        allocator.check_heap(true).unwrap();
    }

    #[test]
    fn splits_only_when_remainder_can_stand_alone() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let a = allocator.allocate(32);
        let _guard = allocator.allocate(8);
        unsafe { allocator.release(a) };

        // A 10-word hole, asked for 8 words: the 2 words left over stay with
        // the allocation.
        let b = allocator.allocate(24);
        assert_eq!(b, a);
        assert_eq!(allocator.payload_size(b), Some(10 * WORD - WORD));

        // A 6-word request out of the tail does split it.
        let before = free_blocks(&allocator);
        assert_eq!(before.len(), 1);
        let c = allocator.allocate(16);
        assert_eq!(c, before[0].ptr.as_ptr());
        let after = free_blocks(&allocator);
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].size, before[0].size - 6 * WORD);
        allocator.check_heap(true).unwrap();
    }

    #[test]
    fn release_null_is_noop() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        unsafe { allocator.release(null_mut()) };
        assert!(!allocator.is_initialized());

        allocator.init().unwrap();
        let before = allocator.check_heap(false).unwrap();
        unsafe { allocator.release(null_mut()) };
        assert_eq!(allocator.check_heap(false).unwrap(), before);
    }

    #[test]
    fn adjacent_releases_coalesce_in_either_order() {
        for reversed in [false, true] {
            let mut allocator = RawAlloc::new(ToyHeap::default());
            let a = allocator.allocate(40);
            let b = allocator.allocate(40);
            let _guard = allocator.allocate(8);
            let a_size = allocator.payload_size(a).unwrap() + WORD;
            let b_size = allocator.payload_size(b).unwrap() + WORD;
            assert_eq!(unsafe { a.add(a_size) }, b);

            unsafe {
                if reversed {
                    allocator.release(b);
                    allocator.release(a);
                } else {
                    allocator.release(a);
                    allocator.release(b);
                }
            }

            let spanning: Vec<BlockInfo> = free_blocks(&allocator)
                .into_iter()
                .filter(|info| info.ptr.as_ptr() <= a && b < unsafe { info.ptr.as_ptr().add(info.size) })
                .collect();
            assert_eq!(spanning.len(), 1);
            assert_eq!(spanning[0].ptr.as_ptr(), a);
            assert_eq!(spanning[0].size, a_size + b_size);
            allocator.check_heap(true).unwrap();
        }
    }

    #[test]
    fn data_survives_unrelated_activity() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let kept = allocator.allocate(200);
        fill(kept, 200, 42);

        let mut others = Vec::new();
        for i in 0..50 {
            let ptr = allocator.allocate(8 + i * 12);
            fill(ptr, 8 + i * 12, i as u8);
            others.push(ptr);
        }
        for ptr in others.drain(..).step_by(2) {
            unsafe { allocator.release(ptr) };
        }
        for i in 0..20 {
            let ptr = allocator.allocate(300 + i);
            fill(ptr, 300 + i, 0xFF);
        }

        assert!(verify(kept, 200, 42));
        allocator.check_heap(true).unwrap();
    }

    #[test]
    fn reallocate_moves_and_copies() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let old = allocator.allocate(64);
        fill(old, 64, 7);

        let new = unsafe { allocator.reallocate(old, 256) };
        assert!(!new.is_null());
        assert_ne!(new, old);
        assert!(verify(new, 64, 7));
        assert!(allocator
            .blocks()
            .any(|info| info.ptr.as_ptr() == old && !info.allocated));
        allocator.check_heap(true).unwrap();

        // Shrinking copies only what fits, and still moves.
        let smaller = unsafe { allocator.reallocate(new, 16) };
        assert_ne!(smaller, new);
        assert!(verify(smaller, 16, 7));
        allocator.check_heap(true).unwrap();
    }

    #[test]
    fn reallocate_edge_cases() {
        let mut allocator = RawAlloc::new(ToyHeap::default());

        let ptr = unsafe { allocator.reallocate(null_mut(), 32) };
        assert!(!ptr.is_null());
        assert_eq!(allocator.payload_size(ptr), Some(36));

        let freed = unsafe { allocator.reallocate(ptr, 0) };
        assert!(freed.is_null());
        assert_eq!(allocator.payload_size(ptr), None);
        allocator.check_heap(true).unwrap();
    }

    #[test]
    fn reallocate_failure_keeps_old_block() {
        let mut allocator = RawAlloc::new(ToyHeap::with_limit(4096));
        let old = allocator.allocate(100);
        fill(old, 100, 9);

        let new = unsafe { allocator.reallocate(old, 8192) };
        assert!(new.is_null());
        assert!(verify(old, 100, 9));
        assert!(allocator.payload_size(old).is_some());
        allocator.check_heap(true).unwrap();
    }

    #[test]
    fn allocate_zeroed_clears_reused_memory() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let dirty = allocator.allocate(80);
        fill(dirty, 80, 1);
        let _guard = allocator.allocate(8);
        unsafe { allocator.release(dirty) };

        let zeroed = allocator.allocate_zeroed(10, 8);
        assert_eq!(zeroed, dirty);
        assert!((0..80).all(|i| unsafe { zeroed.add(i).read() } == 0));

        assert!(allocator.allocate_zeroed(usize::MAX, 2).is_null());
        assert!(allocator.allocate_zeroed(0, 8).is_null());
        allocator.check_heap(true).unwrap();
    }

    #[test]
    fn extension_grows_past_capacity() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        allocator.init().unwrap();
        let before = allocator.grower.size;

        let size = 4000;
        let ptr = allocator.allocate(size);
        assert!(!ptr.is_null());
        let words = block_words(size).unwrap() as usize;

        // The heap grew by exactly the request. The new space merged with the
        // initial chunk, and the request was carved from the front of that.
        assert_eq!(allocator.grower.size - before, words * WORD);
        let blocks: Vec<BlockInfo> = allocator.blocks().collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].allocated);
        assert_eq!(blocks[0].ptr.as_ptr(), ptr);
        assert_eq!(blocks[0].size, words * WORD);
        assert!(!blocks[1].allocated);
        assert_eq!(blocks[1].size, CHUNK_WORDS as usize * WORD);

        let end = unsafe { blocks[1].ptr.as_ptr().add(blocks[1].size) };
        assert_eq!(end as usize - WORD, allocator.grower.high_bound() as usize);
        allocator.check_heap(true).unwrap();
    }

    #[test]
    fn global_alloc_adapter() {
        let allocator: GenericAllocator<ToyHeap> = GenericAllocator::new();
        unsafe {
            let layout = Layout::from_size_align(48, 8).unwrap();
            let ptr = allocator.alloc(layout);
            assert!(!ptr.is_null());
            fill(ptr, 48, 5);

            let grown = allocator.realloc(ptr, layout, 96);
            assert!(verify(grown, 48, 5));

            let zeroed = allocator.alloc_zeroed(Layout::from_size_align(32, 4).unwrap());
            assert!((0..32).all(|i| zeroed.add(i).read() == 0));

            let over_aligned = Layout::from_size_align(64, 64).unwrap();
            let aligned = allocator.alloc_zeroed(over_aligned);
            assert_eq!(aligned as usize % 64, 0);
            assert!((0..64).all(|i| aligned.add(i).read() == 0));
            fill(aligned, 64, 11);
            let moved = allocator.realloc(aligned, over_aligned, 200);
            assert_eq!(moved as usize % 64, 0);
            assert!(verify(moved, 64, 11));

            allocator.dealloc(grown, Layout::from_size_align(96, 8).unwrap());
            allocator.dealloc(zeroed, Layout::from_size_align(32, 4).unwrap());
            allocator.dealloc(moved, Layout::from_size_align(200, 64).unwrap());
        }
        let stats = allocator.stats().unwrap();
        assert_eq!(stats.allocated_bytes, 0);
    }

    #[test]
    fn allocate_aligned_frees_the_lead() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        let _first = allocator.allocate(8);

        for align in [16, 32, 64, 128, 4096] {
            let ptr = allocator.allocate_aligned(100, align);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % align, 0);
            assert!(allocator.payload_size(ptr).unwrap() >= 100);
            fill(ptr, 100, align as u8);
            allocator.check_heap(true).unwrap();
        }

        assert!(allocator.allocate_aligned(100, 48).is_null());
        assert!(allocator.allocate_aligned(0, 64).is_null());
        assert!(allocator.allocate_aligned(usize::MAX - 8, 64).is_null());
        allocator.check_heap(true).unwrap();
    }

    #[test]
    fn display_lists_blocks_and_classes() {
        let mut allocator = RawAlloc::new(ToyHeap::default());
        assert_eq!(allocator.to_string(), "Heap(uninitialized)");

        let a = allocator.allocate(32);
        let shown = allocator.to_string();
        log::info!("{}", shown);
        assert!(shown.starts_with("Heap(Block("));
        assert!(shown.contains(&format!("Block({:?}, 40, a)", NonNull::new(a).unwrap())));
        assert!(shown.contains("class 4 (..=48 words): "));
    }
}
