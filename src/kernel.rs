use std::ptr::NonNull;

use crate::utils::align;

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. As the allocator, our top level view of this has nothing to
/// do with the concrete implementations / APIs offered by each kernel: we only
/// need a data segment that grows in place and anonymous mappings.
///
/// # Safety
///
/// Implementors must hand out memory that is readable, writable, aligned to
/// [`crate::ALIGNMENT`] and not used by anybody else. Consecutive calls to
/// [`PlatformMemory::extend_segment`] must return adjacent ranges unless some
/// third party moved the segment in between.
pub unsafe trait PlatformMemory {
    /// Moves the end of the data segment `len` bytes forward and returns the
    /// start of the new bytes (the old end), or `None` if the segment can't
    /// grow.
    unsafe fn extend_segment(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Request a memory region of size `len`. It returns a Pointer to the
    /// given location or None if the underlying syscall fails.
    unsafe fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    unsafe fn return_memory(&mut self, addr: NonNull<u8>, len: usize);

    /// Returns the virtual memory page size of the computer in bytes.
    fn page_size(&self) -> usize;
}

/// The memory primitives of the running process.
///
/// On unix the data segment is the real one, moved with `sbrk`. The program
/// break is process wide, so anything else calling `brk`/`sbrk` (the libc
/// allocator included) will make the arena report
/// [`crate::AllocError::Discontiguous`]. Use it from one allocator, ideally
/// the global one, or use [`Reserved`].
///
/// Windows has no data segment, so the break is emulated inside a large
/// reservation of address space, committed as it grows.
#[derive(Debug)]
pub struct Kernel {
    #[cfg(windows)]
    segment: Reserved,
}

impl Kernel {
    pub const fn new() -> Self {
        Self {
            #[cfg(windows)]
            segment: Reserved::with_capacity(self::windows::SEGMENT_RESERVATION),
        }
    }
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

/// A private data segment emulated inside a reservation of `capacity` bytes
/// of address space.
///
/// Nothing is reserved until the first growth and pages are made accessible
/// only as the break crosses them. Since the break belongs to this value
/// alone, any number of allocators can live in the same process, each with
/// its own `Reserved`. The whole reservation goes back to the kernel on drop.
#[derive(Debug)]
pub struct Reserved {
    base: Option<NonNull<u8>>,
    capacity: usize,
    /// Offset of the emulated break from `base`.
    brk: usize,
    /// Bytes from `base` that are already readable and writable.
    committed: usize,
}

// SAFETY: the reservation is owned exclusively by this value.
unsafe impl Send for Reserved {}

impl Reserved {
    pub const fn with_capacity(capacity: usize) -> Self {
        Self {
            base: None,
            capacity,
            brk: 0,
            committed: 0,
        }
    }

    /// Bytes handed out so far.
    pub fn len(&self) -> usize {
        self.brk
    }

    pub fn is_empty(&self) -> bool {
        self.brk == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn base(&mut self) -> Option<NonNull<u8>> {
        if let Some(base) = self.base {
            return Some(base);
        }

        let capacity = align(self.capacity, sys::page_size());
        let base = unsafe { sys::reserve(capacity)? };

        log::debug!("reserved {capacity} bytes of address space at {base:p}");

        self.capacity = capacity;
        self.base = Some(base);

        Some(base)
    }
}

unsafe impl PlatformMemory for Reserved {
    unsafe fn extend_segment(&mut self, len: usize) -> Option<NonNull<u8>> {
        let base = self.base()?;
        let brk = self.brk.checked_add(len)?;

        if brk > self.capacity {
            return None;
        }

        if brk > self.committed {
            let target = align(brk, sys::page_size()).min(self.capacity);

            unsafe {
                let from = base.add(self.committed);
                if !sys::commit(from, target - self.committed) {
                    return None;
                }
            }

            self.committed = target;
        }

        let start = unsafe { base.add(self.brk) };
        self.brk = brk;

        Some(start)
    }

    unsafe fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
        unsafe { sys::map(len) }
    }

    unsafe fn return_memory(&mut self, addr: NonNull<u8>, len: usize) {
        unsafe { sys::unmap(addr, len) }
    }

    fn page_size(&self) -> usize {
        sys::page_size()
    }
}

impl Drop for Reserved {
    fn drop(&mut self) {
        if let Some(base) = self.base.take() {
            unsafe { sys::release(base, self.capacity) }
        }
    }
}

#[cfg(unix)]
use self::unix as sys;

#[cfg(windows)]
use self::windows as sys;

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};
    use crate::utils::{ALIGNMENT, align};

    use libc::{c_int, c_long, c_void, intptr_t, mmap, mprotect, munmap, off_t, size_t};

    use std::{
        ptr::NonNull,
        sync::atomic::{AtomicUsize, Ordering},
    };

    /// Virtual memory page size of the computer. Queried once, this is
    /// usually 4096.
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    /// Used when `sysconf` can't tell.
    const FALLBACK_PAGE_SIZE: usize = 4096;

    pub(super) fn page_size() -> usize {
        match PAGE_SIZE.load(Ordering::Relaxed) {
            0 => {
                let size = page_size_from(unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) });
                PAGE_SIZE.store(size, Ordering::Relaxed);
                size
            }
            size => size,
        }
    }

    /// Validates a raw `sysconf` answer, which is -1 on failure.
    pub(super) fn page_size_from(raw: c_long) -> usize {
        match usize::try_from(raw) {
            Ok(size) if size.is_power_of_two() => size,
            _ => {
                log::warn!("sysconf returned page size {raw}, assuming {FALLBACK_PAGE_SIZE}");
                FALLBACK_PAGE_SIZE
            }
        }
    }

    unsafe fn anonymous(len: usize, prot: c_int) -> Option<NonNull<u8>> {
        // mmap parameters.
        const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
        const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        const FD: c_int = -1;
        const OFFSET: off_t = 0;

        unsafe {
            match mmap(ADDR, len as size_t, prot, FLAGS, FD, OFFSET) {
                libc::MAP_FAILED => None,
                addr => NonNull::new(addr.cast::<u8>()),
            }
        }
    }

    /// Read-Write anonymous memory.
    pub(super) unsafe fn map(len: usize) -> Option<NonNull<u8>> {
        unsafe { anonymous(len, libc::PROT_READ | libc::PROT_WRITE) }
    }

    pub(super) unsafe fn unmap(addr: NonNull<u8>, len: usize) {
        unsafe {
            munmap(addr.as_ptr().cast::<c_void>(), len as size_t);
        }
    }

    /// Address space nobody can touch until it is committed.
    pub(super) unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
        unsafe { anonymous(len, libc::PROT_NONE) }
    }

    pub(super) unsafe fn commit(addr: NonNull<u8>, len: usize) -> bool {
        let prot = libc::PROT_READ | libc::PROT_WRITE;
        unsafe { mprotect(addr.as_ptr().cast::<c_void>(), len as size_t, prot) == 0 }
    }

    pub(super) unsafe fn release(addr: NonNull<u8>, len: usize) {
        unsafe { unmap(addr, len) }
    }

    unsafe impl PlatformMemory for Kernel {
        unsafe fn extend_segment(&mut self, len: usize) -> Option<NonNull<u8>> {
            const FAILED: *mut c_void = usize::MAX as *mut c_void;

            unsafe {
                // Whoever moved the break last may have left it unaligned.
                let current = libc::sbrk(0);
                if current == FAILED {
                    return None;
                }

                let pad = align(current as usize, ALIGNMENT) - current as usize;
                let increment = intptr_t::try_from(len.checked_add(pad)?).ok()?;

                let addr = libc::sbrk(increment);
                if addr == FAILED {
                    return None;
                }

                NonNull::new(addr.cast::<u8>().wrapping_add(pad))
            }
        }

        unsafe fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
            unsafe { map(len) }
        }

        unsafe fn return_memory(&mut self, addr: NonNull<u8>, len: usize) {
            unsafe { unmap(addr, len) }
        }

        fn page_size(&self) -> usize {
            page_size()
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::{Kernel, PlatformMemory};

    use std::{
        mem::MaybeUninit,
        os::raw::c_void,
        ptr::NonNull,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use ::windows::Win32::System::{Memory, SystemInformation};

    /// Address space set aside for the emulated data segment of [`Kernel`].
    #[cfg(target_pointer_width = "64")]
    pub(super) const SEGMENT_RESERVATION: usize = 16 << 30;
    #[cfg(not(target_pointer_width = "64"))]
    pub(super) const SEGMENT_RESERVATION: usize = 256 << 20;

    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    pub(super) fn page_size() -> usize {
        match PAGE_SIZE.load(Ordering::Relaxed) {
            0 => {
                let size = unsafe {
                    let mut system_info = MaybeUninit::uninit();
                    SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                    system_info.assume_init().dwPageSize as usize
                };
                PAGE_SIZE.store(size, Ordering::Relaxed);
                size
            }
            size => size,
        }
    }

    pub(super) unsafe fn map(len: usize) -> Option<NonNull<u8>> {
        // Read-Write only.
        let protection = Memory::PAGE_READWRITE;
        let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

        unsafe { NonNull::new(Memory::VirtualAlloc(None, len, flags, protection).cast()) }
    }

    pub(super) unsafe fn unmap(addr: NonNull<u8>, _len: usize) {
        unsafe {
            let _ = Memory::VirtualFree(addr.as_ptr().cast::<c_void>(), 0, Memory::MEM_RELEASE);
        }
    }

    pub(super) unsafe fn reserve(len: usize) -> Option<NonNull<u8>> {
        let protection = Memory::PAGE_NOACCESS;

        unsafe { NonNull::new(Memory::VirtualAlloc(None, len, Memory::MEM_RESERVE, protection).cast()) }
    }

    pub(super) unsafe fn commit(addr: NonNull<u8>, len: usize) -> bool {
        let addr = addr.as_ptr().cast::<c_void>().cast_const();

        unsafe {
            !Memory::VirtualAlloc(Some(addr), len, Memory::MEM_COMMIT, Memory::PAGE_READWRITE)
                .is_null()
        }
    }

    pub(super) unsafe fn release(addr: NonNull<u8>, len: usize) {
        unsafe { unmap(addr, len) }
    }

    unsafe impl PlatformMemory for Kernel {
        unsafe fn extend_segment(&mut self, len: usize) -> Option<NonNull<u8>> {
            unsafe { self.segment.extend_segment(len) }
        }

        unsafe fn request_memory(&mut self, len: usize) -> Option<NonNull<u8>> {
            unsafe { map(len) }
        }

        unsafe fn return_memory(&mut self, addr: NonNull<u8>, len: usize) {
            unsafe { unmap(addr, len) }
        }

        fn page_size(&self) -> usize {
            page_size()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        let page = Reserved::with_capacity(0).page_size();
        assert!(page.is_power_of_two());
        assert!(page >= 4096);
    }

    #[cfg(unix)]
    #[test]
    fn bogus_sysconf_page_size_falls_back() {
        assert_eq!(unix::page_size_from(-1), 4096);
        assert_eq!(unix::page_size_from(0), 4096);
        assert_eq!(unix::page_size_from(3000), 4096);
        assert_eq!(unix::page_size_from(16384), 16384);
    }

    #[test]
    fn reserved_segment_grows_contiguously() {
        let mut segment = Reserved::with_capacity(1 << 20);

        unsafe {
            let first = segment.extend_segment(100).unwrap();
            let second = segment.extend_segment(5000).unwrap();

            assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + 100);

            // Both ranges are writable, including the page the second one crosses into.
            first.as_ptr().write_bytes(0xaa, 100);
            second.as_ptr().write_bytes(0xbb, 5000);
            assert_eq!(*first.as_ptr().add(99), 0xaa);
            assert_eq!(*second.as_ptr().add(4999), 0xbb);
        }

        assert_eq!(segment.len(), 5100);
    }

    #[test]
    fn reserved_segment_refuses_to_outgrow_capacity() {
        let mut segment = Reserved::with_capacity(8192);

        unsafe {
            assert!(segment.extend_segment(8192).is_some());
            assert!(segment.extend_segment(1).is_none());
        }

        assert_eq!(segment.len(), 8192);
    }

    #[test]
    fn mappings_are_writable() {
        let mut segment = Reserved::with_capacity(0);

        unsafe {
            let addr = segment.request_memory(3 * 4096).unwrap();
            addr.as_ptr().write_bytes(7, 3 * 4096);
            assert_eq!(*addr.as_ptr().add(3 * 4096 - 1), 7);
            segment.return_memory(addr, 3 * 4096);
        }
    }
}
