use std::ptr::{self, NonNull};

use crate::{
    AllocError, Kind, OsMem, settle,
    block::{self, Block, Status},
    kernel::PlatformMemory,
    list::Node,
    utils::{ALIGNMENT, checked_align},
};

impl<P: PlatformMemory> OsMem<P> {
    /// Changes the size of the block behind `ptr` to `size` bytes, keeping
    /// its content up to the smaller of both sizes. Null behaves like
    /// [`OsMem::allocate`], a zero `size` like [`OsMem::release`].
    ///
    /// The returned pointer may differ from `ptr`, in which case `ptr` must
    /// not be used again. Null is also returned if the block was already
    /// free.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this allocator.
    pub unsafe fn resize(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        settle(unsafe { self.try_resize(ptr, size) })
    }

    /// In order of preference:
    ///
    /// 1. Arena blocks that become large move to a mapping. The old block is
    ///    only marked free, it gets merged on the next allocating call.
    /// 2. Same aligned size: nothing to do.
    /// 3. Mapped blocks always move, wherever the new size belongs.
    /// 4. Arena blocks shrink in place, splitting off the tail if it is big
    ///    enough to be a block.
    /// 5. Arena blocks grow in place over a free successor, or by moving the
    ///    segment end if they are the last block.
    /// 6. Anything else moves to a new block.
    ///
    /// # Safety
    ///
    /// Same as [`OsMem::resize`].
    pub unsafe fn try_resize(&mut self, ptr: *mut u8, size: usize) -> Result<*mut u8, AllocError> {
        let Some(ptr) = NonNull::new(ptr) else {
            return self.try_allocate(size);
        };

        if size == 0 {
            unsafe { self.try_release(ptr.as_ptr())? };
            return Ok(ptr::null_mut());
        }

        self.coalesce();

        let aligned = checked_align(size, ALIGNMENT).ok_or(AllocError::SizeOverflow)?;

        unsafe {
            let node = block::header(ptr)?;
            let status = node.as_ref().data.status()?;
            let current = node.as_ref().data.size;

            if status == Status::InUse && self.is_large(aligned, Kind::Malloc) {
                log::trace!("resize of {ptr:p} to {size} bytes leaves the arena");
                return self.migrate(node, size).map(NonNull::as_ptr);
            }

            match status {
                Status::Free => Err(AllocError::NotInUse {
                    addr: ptr.as_ptr() as usize,
                }),
                _ if current == aligned => Ok(ptr.as_ptr()),
                Status::Mapped => {
                    let moved = self.allocate_kind(size, Kind::Malloc)?;
                    ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), current.min(size));
                    self.mapped.unmap(&mut self.kernel, node);

                    log::trace!("mapped block {ptr:p} moved to {moved:p}");

                    Ok(moved.as_ptr())
                }
                Status::InUse if aligned < current => {
                    self.arena.split(node, aligned);
                    Ok(ptr.as_ptr())
                }
                Status::InUse => self.grow(node, aligned, size).map(NonNull::as_ptr),
            }
        }
    }

    /// Grows an arena block, in place if possible.
    ///
    /// **SAFETY**: `node` must be an arena block in use, smaller than `aligned`.
    unsafe fn grow(
        &mut self,
        node: NonNull<Node<Block>>,
        aligned: usize,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        unsafe {
            if self.arena.grow_into_next(node, aligned) {
                log::trace!("block {node:p} grew over its free successor");
                return Ok(block::payload(node));
            }

            if self.arena.is_last(node) {
                self.arena.extend(&mut self.kernel, node, aligned)?;
                return Ok(block::payload(node));
            }

            self.migrate(node, size)
        }
    }

    /// Moves an arena block to a fresh allocation of `size` bytes and marks
    /// the old one free. Merging it with its neighbours is left to the next
    /// coalescing pass, so until then the arena holds a free block next to
    /// free neighbours.
    ///
    /// **SAFETY**: `node` must be an arena block in use.
    unsafe fn migrate(&mut self, mut node: NonNull<Node<Block>>, size: usize) -> Result<NonNull<u8>, AllocError> {
        unsafe {
            let from = block::payload(node);
            let moved = self.allocate_kind(size, Kind::Malloc)?;

            ptr::copy_nonoverlapping(
                from.as_ptr(),
                moved.as_ptr(),
                node.as_ref().data.size.min(size),
            );
            node.as_mut().data.set_status(Status::Free);

            log::trace!("block {from:p} moved to {moved:p}");

            Ok(moved)
        }
    }
}
