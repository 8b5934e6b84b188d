//! # osmem
//!
//! A `malloc`/`calloc`/`realloc`/`free` style allocator built directly on
//! top of two kernel primitives: growing the data segment (`sbrk`) and
//! anonymous mappings (`mmap`).
//!
//! ```text
//!                     +------------------------------+
//!   allocate          |            OsMem             |
//!   allocate_zeroed   |                              |
//!   resize       ---> |  size + header > threshold ? |
//!   release           |        |             |       |
//!                     |       no            yes      |
//!                     |        v             v       |
//!                     |     Arena        MmapList    |
//!                     +--------|-------------|-------+
//!                              v             v
//!                        extend_segment   request_memory / return_memory
//! ```
//!
//! Small and medium blocks live in a single [`arena`] that only grows: the
//! first request reserves [`MMAP_THRESHOLD`] bytes at once, freed blocks are
//! merged with their free neighbours on the next allocating call and reused
//! with a best-fit policy. Large blocks get a mapping of their own that goes
//! back to the kernel as soon as they are released.
//!
//! Every block is preceded by a [`HEADER_SIZE`] bytes header and every size
//! is rounded up to [`ALIGNMENT`].
//!
//! ## Threads
//!
//! An [`OsMem`] is a plain single threaded value: every operation takes
//! `&mut self` and runs to completion. [`GlobalOsMem`] puts one behind a
//! lock so it can serve as the `#[global_allocator]`.
//!
//! ## Errors
//!
//! The `try_*` methods report everything through [`AllocError`]. The plain
//! ones follow the C contract: they return null for misuse the header can
//! detect, and abort the process when the kernel refuses to hand out memory.
//!
//! ## Quick start
//!
//! ```rust
//! use osmem::{OsMem, Reserved};
//!
//! let mut osmem = OsMem::with_kernel(Reserved::with_capacity(1 << 24));
//!
//! let ptr = osmem.allocate(100);
//! unsafe {
//!     ptr.write_bytes(1, 100);
//!     let ptr = osmem.resize(ptr, 4000);
//!     assert_eq!(*ptr.add(99), 1);
//!     osmem.release(ptr);
//! }
//! ```

mod arena;
mod block;
mod config;
mod error;
mod global;
mod kernel;
mod list;
mod mmap;
mod realloc;
mod utils;

use std::ptr::{self, NonNull};

use crate::{
    arena::Arena,
    block::Status,
    mmap::MmapList,
    utils::checked_align,
};

pub use block::BLOCK_HEADER_SIZE as HEADER_SIZE;
pub use config::{Config, MMAP_THRESHOLD};
pub use error::AllocError;
pub use global::GlobalOsMem;
pub use kernel::{Kernel, PlatformMemory, Reserved};
pub use utils::ALIGNMENT;

/// Which entry point a request comes from. Only the routing differs:
/// zeroed requests leave the arena as soon as they reach a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Malloc,
    Calloc,
}

/// Snapshot of the allocator structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    /// Blocks in the arena, free or not.
    pub arena_blocks: usize,
    /// Free blocks in the arena.
    pub free_blocks: usize,
    /// Live mappings, one per large block.
    pub mapped_blocks: usize,
    /// Bytes of data segment taken by the arena, headers included.
    pub arena_bytes: usize,
}

/// The allocator: one arena and one list of mapped blocks on top of a
/// [`PlatformMemory`].
///
/// Nothing is requested from the kernel until the first allocation.
/// Mapped blocks still alive when the value is dropped are unmapped; the
/// arena can only go back if the platform gives it back (see [`Reserved`]).
pub struct OsMem<P: PlatformMemory = Kernel> {
    kernel: P,
    config: Config,
    arena: Arena,
    mapped: MmapList,
}

// SAFETY: all the memory behind the raw pointers belongs to this value.
unsafe impl<P: PlatformMemory + Send> Send for OsMem<P> {}

impl OsMem<Kernel> {
    /// Allocator over the process data segment with the default threshold.
    pub const fn new() -> Self {
        Self::with_config(Kernel::new(), Config::DEFAULT)
    }
}

impl Default for OsMem<Kernel> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PlatformMemory> OsMem<P> {
    pub const fn with_kernel(kernel: P) -> Self {
        Self::with_config(kernel, Config::DEFAULT)
    }

    pub const fn with_config(kernel: P, config: Config) -> Self {
        Self {
            kernel,
            config,
            arena: Arena::new(),
            mapped: MmapList::new(),
        }
    }

    #[inline]
    pub fn config(&self) -> Config {
        self.config
    }

    #[inline]
    pub fn kernel(&self) -> &P {
        &self.kernel
    }

    /// Returns `size` usable bytes aligned to [`ALIGNMENT`], or null if
    /// `size` is zero. Aborts if the kernel has no memory left.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        settle(self.try_allocate(size))
    }

    pub fn try_allocate(&mut self, size: usize) -> Result<*mut u8, AllocError> {
        if size == 0 {
            return Ok(ptr::null_mut());
        }

        self.coalesce();

        self.allocate_kind(size, Kind::Malloc).map(NonNull::as_ptr)
    }

    /// Returns `count * size` bytes set to zero, or null if either is zero
    /// or their product overflows.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> *mut u8 {
        settle(self.try_allocate_zeroed(count, size))
    }

    pub fn try_allocate_zeroed(&mut self, count: usize, size: usize) -> Result<*mut u8, AllocError> {
        if count == 0 || size == 0 {
            return Ok(ptr::null_mut());
        }

        let total = count.checked_mul(size).ok_or(AllocError::SizeOverflow)?;

        self.coalesce();

        let ptr = self.allocate_kind(total, Kind::Calloc)?;

        // Reused arena blocks hold whatever their last owner left.
        unsafe { ptr.as_ptr().write_bytes(0, total) };

        Ok(ptr.as_ptr())
    }

    /// Gives a block back. Null is ignored, and so is a block that is
    /// already free (with a warning).
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer returned by this allocator that has
    /// not been handed to [`OsMem::resize`] since.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        if let Err(err) = unsafe { self.try_release(ptr) } {
            log::warn!("release of {ptr:p} ignored: {err}");
        }
    }

    /// Arena blocks are only marked free; merging them is left to the next
    /// allocating call. Mapped blocks are unmapped right away.
    ///
    /// # Safety
    ///
    /// Same as [`OsMem::release`].
    pub unsafe fn try_release(&mut self, ptr: *mut u8) -> Result<(), AllocError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(());
        };

        unsafe {
            let mut node = block::header(ptr)?;

            match node.as_ref().data.status()? {
                Status::Mapped => self.mapped.unmap(&mut self.kernel, node),
                Status::InUse => node.as_mut().data.set_status(Status::Free),
                Status::Free => {
                    return Err(AllocError::ReleasedTwice {
                        addr: ptr.as_ptr() as usize,
                    });
                }
            }
        }

        log::trace!("released {ptr:p}");

        Ok(())
    }

    /// Usable bytes behind `ptr`, which can be more than requested. Zero for
    /// null.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this allocator.
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> Result<usize, AllocError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Ok(0);
        };

        unsafe {
            let node = block::header(ptr)?;
            node.as_ref().data.status()?;

            Ok(node.as_ref().data.size)
        }
    }

    /// Merges adjacent free arena blocks. Every allocating call starts with
    /// this, so there is rarely a reason to call it by hand. Returns the
    /// number of merges.
    pub fn coalesce(&mut self) -> usize {
        self.arena.coalesce()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            arena_blocks: self.arena.blocks().len(),
            free_blocks: self.arena.free_blocks(),
            mapped_blocks: self.mapped.len(),
            arena_bytes: self.arena.bytes(),
        }
    }

    /// Checks the links, sizes and statuses of every block, and that arena
    /// blocks are laid out back to back.
    pub fn audit(&self) -> Result<(), AllocError> {
        self.arena.audit()?;
        self.mapped.audit()
    }

    /// Allocation engine shared by every entry point. Coalescing is up to the
    /// caller.
    pub(crate) fn allocate_kind(&mut self, size: usize, kind: Kind) -> Result<NonNull<u8>, AllocError> {
        let aligned = checked_align(size, ALIGNMENT).ok_or(AllocError::SizeOverflow)?;

        let node = if self.is_large(aligned, kind) {
            self.mapped.map(&mut self.kernel, aligned)?
        } else {
            self.arena
                .allocate(&mut self.kernel, self.config.mmap_threshold, aligned)?
        };

        let ptr = block::payload(node);

        log::trace!("{kind:?} of {size} bytes served at {ptr:p}");

        Ok(ptr)
    }

    /// Whether an aligned request belongs to the mapped list.
    pub(crate) fn is_large(&self, aligned: usize, kind: Kind) -> bool {
        let total = aligned.saturating_add(HEADER_SIZE);

        total > self.config.mmap_threshold || (kind == Kind::Calloc && total > self.kernel.page_size())
    }
}

impl<P: PlatformMemory> Drop for OsMem<P> {
    fn drop(&mut self) {
        self.mapped.unmap_all(&mut self.kernel);
    }
}

/// Turns the outcome of a `try_*` call into the C style contract.
fn settle(result: Result<*mut u8, AllocError>) -> *mut u8 {
    match result {
        Ok(ptr) => ptr,
        Err(err) if err.is_fatal() => fatal(err),
        Err(err) => {
            log::warn!("{err}");
            ptr::null_mut()
        }
    }
}

/// A kernel primitive failed. There is no safe way to keep going.
#[cold]
fn fatal(err: AllocError) -> ! {
    log::error!("{err}, aborting");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{cell::Cell, rc::Rc};

    fn osmem() -> OsMem<Reserved> {
        OsMem::with_kernel(Reserved::with_capacity(64 << 20))
    }

    #[test]
    fn zero_sized_requests_are_null() {
        let mut osmem = osmem();

        assert!(osmem.allocate(0).is_null());
        assert!(osmem.allocate_zeroed(0, 8).is_null());
        assert!(osmem.allocate_zeroed(8, 0).is_null());

        // Nothing was asked from the kernel.
        assert!(osmem.kernel().is_empty());
        assert_eq!(osmem.stats(), Stats::default());
    }

    #[test]
    fn allocations_are_aligned_and_writable() {
        let mut osmem = osmem();

        for size in [1, 7, 8, 9, 100, 4000, 130_000, 200_000] {
            let ptr = osmem.allocate(size);

            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % ALIGNMENT, 0);

            unsafe {
                for i in 0..size {
                    *ptr.add(i) = i as u8;
                }
                for i in 0..size {
                    assert_eq!(*ptr.add(i), i as u8);
                }
                assert!(osmem.usable_size(ptr).unwrap() >= size);
            }
        }

        osmem.audit().unwrap();
    }

    #[test]
    fn release_marks_arena_blocks_free_without_merging() {
        let mut osmem = osmem();

        let a = osmem.allocate(64);
        let b = osmem.allocate(64);

        unsafe {
            osmem.release(a);
            osmem.release(b);
        }

        // Head, b, tail are all free now but still separate.
        let stats = osmem.stats();
        assert_eq!(stats.arena_blocks, 3);
        assert_eq!(stats.free_blocks, 3);

        assert_eq!(osmem.coalesce(), 2);
        assert_eq!(osmem.stats().arena_blocks, 1);
        assert_eq!(osmem.stats().arena_bytes, MMAP_THRESHOLD);
    }

    #[test]
    fn releasing_twice_is_reported() {
        let mut osmem = osmem();
        let ptr = osmem.allocate(64);

        unsafe {
            osmem.try_release(ptr).unwrap();
            assert_eq!(
                osmem.try_release(ptr),
                Err(AllocError::ReleasedTwice { addr: ptr as usize })
            );

            // The plain entry point just ignores it.
            osmem.release(ptr);
            osmem.release(ptr::null_mut());
        }

        osmem.audit().unwrap();
    }

    #[test]
    fn misaligned_and_corrupt_pointers_are_reported() {
        let mut osmem = osmem();
        let ptr = osmem.allocate(64);

        unsafe {
            assert!(matches!(
                osmem.try_release(ptr.add(3)),
                Err(AllocError::Misaligned { .. })
            ));

            // Scribble over the status tag, the last word of the header.
            let tag = ptr.sub(std::mem::size_of::<usize>()).cast::<usize>();
            let saved = tag.read();
            tag.write(77);

            let corrupt = AllocError::CorruptHeader {
                addr: ptr as usize,
                tag: 77,
            };
            assert_eq!(osmem.try_release(ptr), Err(corrupt));
            assert_eq!(osmem.audit(), Err(corrupt));

            tag.write(saved);
            osmem.try_release(ptr).unwrap();
        }
    }

    #[test]
    fn zeroed_requests_leave_the_arena_past_a_page() {
        let mut osmem = osmem();
        let page = osmem.kernel().page_size();

        let small = osmem.allocate_zeroed(1, page - HEADER_SIZE);
        assert_eq!(osmem.stats().mapped_blocks, 0);

        let large = osmem.allocate_zeroed(1, page - HEADER_SIZE + 1);
        assert_eq!(osmem.stats().mapped_blocks, 1);

        // The same size through the plain entry point stays in the arena.
        let plain = osmem.allocate(page);
        assert_eq!(osmem.stats().mapped_blocks, 1);

        unsafe {
            osmem.release(small);
            osmem.release(large);
            osmem.release(plain);
        }
        assert_eq!(osmem.stats().mapped_blocks, 0);
    }

    #[test]
    fn zeroed_memory_is_zero_even_when_reused() {
        let mut osmem = osmem();

        let dirty = osmem.allocate(1000);
        unsafe {
            dirty.write_bytes(0xff, 1000);
            osmem.release(dirty);
        }

        let clean = osmem.allocate_zeroed(10, 100);
        assert_eq!(clean, dirty);

        let bytes = unsafe { std::slice::from_raw_parts(clean, 1000) };
        assert!(bytes.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn zeroed_size_overflow_is_an_error() {
        let mut osmem = osmem();

        assert_eq!(
            osmem.try_allocate_zeroed(usize::MAX / 2, 3),
            Err(AllocError::SizeOverflow)
        );
        assert!(osmem.allocate_zeroed(usize::MAX / 2, 3).is_null());
    }

    #[test]
    fn custom_threshold_routes_earlier() {
        let config = Config::new(16 * 1024).unwrap();
        let mut osmem = OsMem::with_config(Reserved::with_capacity(1 << 20), config);

        let ptr = osmem.allocate(16 * 1024);
        assert_eq!(osmem.stats().mapped_blocks, 1);
        assert_eq!(osmem.stats().arena_blocks, 0);

        let ptr2 = osmem.allocate(1024);
        assert_eq!(osmem.stats().arena_bytes, 16 * 1024);

        unsafe {
            osmem.release(ptr);
            osmem.release(ptr2);
        }
    }

    /// [`Reserved`] keeping count of the mappings it has out.
    struct Counting {
        segment: Reserved,
        mappings: Rc<Cell<usize>>,
    }

    unsafe impl PlatformMemory for Counting {
        unsafe fn extend_segment(&mut self, len: usize) -> Option<NonNull<u8>> {
            unsafe { self.segment.extend_segment(len) }
        }

        unsafe fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
            let addr = unsafe { self.segment.request_memory(len)? };
            self.mappings.set(self.mappings.get() + 1);
            Some(addr)
        }

        unsafe fn return_memory(&mut self, addr: NonNull<u8>, len: usize) {
            unsafe { self.segment.return_memory(addr, len) };
            self.mappings.set(self.mappings.get() - 1);
        }

        fn page_size(&self) -> usize {
            self.segment.page_size()
        }
    }

    #[test]
    fn drop_unmaps_live_blocks() {
        let mappings = Rc::new(Cell::new(0));
        let mut osmem = OsMem::with_kernel(Counting {
            segment: Reserved::with_capacity(1 << 20),
            mappings: Rc::clone(&mappings),
        });

        let blocks: Vec<_> = (0..4).map(|_| osmem.allocate(300_000)).collect();
        assert_eq!(osmem.stats().mapped_blocks, 4);
        assert_eq!(mappings.get(), 4);

        unsafe { osmem.release(blocks[0]) };
        assert_eq!(mappings.get(), 3);

        drop(osmem);
        assert_eq!(mappings.get(), 0);
    }
}
