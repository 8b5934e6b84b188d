use std::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use spin::Mutex;

use crate::{ALIGNMENT, Kernel, OsMem};

/// [`OsMem`] over the process data segment, usable as the
/// `#[global_allocator]`.
///
/// ```rust,no_run
/// use osmem::GlobalOsMem;
///
/// #[global_allocator]
/// static ALLOCATOR: GlobalOsMem = GlobalOsMem::new();
///
/// fn main() {
///     let boxed = Box::new(22);
///     assert_eq!(*boxed, 22);
/// }
/// ```
///
/// The allocator itself is single threaded, so every call goes through one
/// spin lock. Blocks are only aligned to [`ALIGNMENT`]: layouts asking for
/// more get null, and so does every request the kernel can't serve.
///
/// Misuse is reported once the lock is released, but the trace and debug
/// events of the allocator itself are emitted with the lock held: a logger
/// that allocates must not enable those levels for this crate.
pub struct GlobalOsMem {
    inner: Mutex<OsMem<Kernel>>,
}

impl GlobalOsMem {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(OsMem::new()),
        }
    }
}

impl Default for GlobalOsMem {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for GlobalOsMem {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.inner
            .lock()
            .try_allocate(layout.size())
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // The guard is gone by the end of this statement.
        let released = unsafe { self.inner.lock().try_release(ptr) };

        if let Err(err) = released {
            log::warn!("dealloc of {ptr:p} ignored: {err}");
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        self.inner
            .lock()
            .try_allocate_zeroed(1, layout.size())
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        unsafe { self.inner.lock().try_resize(ptr, new_size) }.unwrap_or(ptr::null_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use log::{Level, LevelFilter, Log, Metadata, Record};

    static UNLOCKED: GlobalOsMem = GlobalOsMem::new();

    static WARNINGS: AtomicUsize = AtomicUsize::new(0);
    static LOCKED_WHILE_LOGGING: AtomicBool = AtomicBool::new(false);

    /// Records whether `UNLOCKED` is held whenever one of its warnings comes in.
    struct LockWatcher;

    impl Log for LockWatcher {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= Level::Warn
        }

        fn log(&self, record: &Record) {
            if record.level() == Level::Warn && record.args().to_string().starts_with("dealloc of") {
                WARNINGS.fetch_add(1, Ordering::SeqCst);
                if UNLOCKED.inner.is_locked() {
                    LOCKED_WHILE_LOGGING.store(true, Ordering::SeqCst);
                }
            }
        }

        fn flush(&self) {}
    }

    static WATCHER: LockWatcher = LockWatcher;

    #[test]
    fn dealloc_warns_after_unlocking() {
        log::set_logger(&WATCHER).unwrap();
        log::set_max_level(LevelFilter::Warn);

        // Rejected from the pointer alone, the kernel is never involved.
        let layout = Layout::from_size_align(8, 8).unwrap();
        unsafe { UNLOCKED.dealloc(0x1003 as *mut u8, layout) };

        assert!(WARNINGS.load(Ordering::SeqCst) >= 1);
        assert!(!LOCKED_WHILE_LOGGING.load(Ordering::SeqCst));
    }

    #[test]
    fn over_aligned_layouts_are_refused() {
        let allocator = GlobalOsMem::new();
        let layout = Layout::from_size_align(64, 64).unwrap();

        unsafe {
            assert!(allocator.alloc(layout).is_null());
            assert!(allocator.alloc_zeroed(layout).is_null());
        }

        // Refused before the kernel is ever asked for memory.
        assert_eq!(allocator.inner.lock().stats(), crate::Stats::default());
    }
}
