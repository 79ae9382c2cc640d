#![cfg_attr(not(test), no_std)]

//! A segregated free-list memory allocator.
//!
//! The heap is a single contiguous region, grown on demand through a
//! [`HeapGrower`](allocators/trait.HeapGrower.html). Every block carries a
//! one-word boundary tag; free blocks also carry a footer, so that a block
//! being released can merge with free neighbours on either side in constant
//! time. Free blocks are kept on 13 doubly linked lists, one per
//! [`SizeClass`](size_class/struct.SizeClass.html), and allocation takes the
//! first block that fits, starting from the request's own class.
//!
//! [`RawAlloc`](allocators/struct.RawAlloc.html) is the single-threaded
//! allocator, with a `malloc`-style API:
//!
//! ```
//! use segalloc::{RawAlloc, ToyHeap};
//!
//! let mut heap = RawAlloc::new(ToyHeap::default());
//! let ptr = heap.allocate(100);
//! assert!(!ptr.is_null());
//! assert_eq!(ptr as usize % 8, 0);
//! unsafe { heap.release(ptr) };
//! assert_eq!(heap.check_heap(false).unwrap().allocated_bytes, 0);
//! ```
//!
//! [`GenericAllocator`](allocators/struct.GenericAllocator.html) puts it
//! behind a spin lock, so it can be installed with `#[global_allocator]`; with
//! the `use_libc` feature, `UnixAllocator` does that over `mmap` memory.
//!
//! The `checkheap` feature runs [`RawAlloc::check_heap`] after every
//! operation that changes the heap, and panics on the first inconsistency.

pub mod allocators;
pub mod check;
pub mod error;
pub mod size_class;
#[cfg(feature = "use_libc")]
pub mod unix;

mod block;
mod blocklist;
mod coalesce;

pub use allocators::{BlockInfo, GenericAllocator, HeapGrower, RawAlloc, ToyHeap};
#[cfg(feature = "use_libc")]
pub use allocators::UnixAllocator;
pub use block::{CHUNK_WORDS, DWORD, MIN_BLOCK_WORDS, WORD};
pub use check::{HeapStats, Violation};
pub use error::AllocError;
pub use size_class::SizeClass;
