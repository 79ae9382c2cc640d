//! A memory source backed by anonymous `mmap` memory.
//!
//! The allocator needs one contiguous region that grows upward, like `sbrk`.
//! [`MmapHeapGrower`] reserves a large span of virtual memory the first time
//! it is asked to grow, then hands it out from the bottom. The kernel only
//! commits pages as they are touched, so the reservation is cheap.

use core::ptr::{null_mut, NonNull};

use errno::Errno;
use log::{debug, error};
use thiserror::Error;

use crate::allocators::HeapGrower;

/// Virtual memory reserved by [`MmapHeapGrower::default`]: 256 MiB.
pub const DEFAULT_RESERVE: usize = 256 << 20;

// Round up value to the nearest multiple of increment
fn round_up(value: usize, increment: usize) -> usize {
    if value == 0 {
        return 0;
    }
    increment * ((value - 1) / increment + 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MmapError {
    /// `mmap` refused the reservation.
    #[error("mmap of {len} bytes failed: {errno}")]
    Map { len: usize, errno: Errno },

    /// The reservation is used up.
    #[error("cannot grow by {requested} bytes: {brk} of {reserve} reserved bytes in use")]
    Exhausted {
        reserve: usize,
        brk: usize,
        requested: usize,
    },
}

/// Grows the heap through a single `mmap` reservation.
pub struct MmapHeapGrower {
    reserve: usize,
    base: Option<NonNull<u8>>,
    brk: usize,
    // Just for tracking, not really needed
    pages: usize,
    growths: usize,
}

// The grower owns its mapping outright; nothing else holds the base pointer.
unsafe impl Send for MmapHeapGrower {}

impl Default for MmapHeapGrower {
    fn default() -> Self {
        MmapHeapGrower::new(DEFAULT_RESERVE)
    }
}

impl MmapHeapGrower {
    /// A grower that will reserve `reserve` bytes (rounded up to whole pages)
    /// on first use.
    pub const fn new(reserve: usize) -> Self {
        MmapHeapGrower {
            reserve,
            base: None,
            brk: 0,
            pages: 0,
            growths: 0,
        }
    }

    /// Pages of the reservation handed out so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Number of successful calls to `grow_heap`.
    pub fn growths(&self) -> usize {
        self.growths
    }

    pub fn reserve(&self) -> usize {
        self.reserve
    }

    fn map(&mut self) -> Result<NonNull<u8>, MmapError> {
        if let Some(base) = self.base {
            return Ok(base);
        }

        let pagesize = sysconf::page::pagesize();
        self.reserve = round_up(self.reserve, pagesize);

        let ptr = unsafe {
            libc::mmap(
                // Address we want the memory at. We don't care, so null it is.
                null_mut(),
                self.reserve,
                libc::PROT_WRITE | libc::PROT_READ,
                // Anonymous memory, not shared with any other process.
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            let errno = errno::errno();
            error!("mmap of {} bytes failed: {}", self.reserve, errno);
            return Err(MmapError::Map {
                len: self.reserve,
                errno,
            });
        }

        // mmap never returns null on success, but a null base would be
        // indistinguishable from "not mapped yet".
        let base = NonNull::new(ptr.cast::<u8>()).ok_or(MmapError::Map {
            len: self.reserve,
            errno: Errno(libc::ENOMEM),
        })?;
        debug!("reserved {} bytes at {:?}", self.reserve, base);
        self.base = Some(base);
        Ok(base)
    }
}

unsafe impl HeapGrower for MmapHeapGrower {
    type Err = MmapError;

    fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, MmapError> {
        let base = self.map()?;
        if size > self.reserve - self.brk {
            return Err(MmapError::Exhausted {
                reserve: self.reserve,
                brk: self.brk,
                requested: size,
            });
        }

        // Safety: `brk <= reserve`, so this is within (or one past) the mapping.
        let start = unsafe { base.add(self.brk) };
        self.brk += size;

        let pagesize = sysconf::page::pagesize();
        self.pages = round_up(self.brk, pagesize) / pagesize;
        self.growths += 1;
        Ok(start)
    }

    fn low_bound(&self) -> *mut u8 {
        self.base.map_or(null_mut(), NonNull::as_ptr)
    }

    fn high_bound(&self) -> *mut u8 {
        self.base
            .map_or(null_mut(), |base| base.as_ptr().wrapping_add(self.brk))
    }
}

impl Drop for MmapHeapGrower {
    fn drop(&mut self) {
        if let Some(base) = self.base.take() {
            let result = unsafe { libc::munmap(base.as_ptr().cast(), self.reserve) };
            if result != 0 {
                error!("munmap of {} bytes failed: {}", self.reserve, errno::errno());
            }
        }
    }
}
