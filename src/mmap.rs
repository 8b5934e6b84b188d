use std::ptr::NonNull;

use crate::{
    block::{BLOCK_HEADER_SIZE, Block, Status, payload},
    error::AllocError,
    kernel::PlatformMemory,
    list::{Node, Ring},
    utils::{ALIGNMENT, is_aligned},
};

/// Large blocks, each one living in its own anonymous mapping.
///
/// ```text
///  +------------------------+      +------------------------+
///  | header |    payload    | ---> | header |    payload    | ---+
///  +------------------------+      +------------------------+    |
///      ^                                                         |
///      +---------------------------------------------------------+
/// ```
///
/// Unlike the arena, being neighbours in the ring says nothing about the
/// addresses: every node is a separate mapping of exactly header plus
/// payload bytes, created and destroyed with a single call.
pub(crate) struct MmapList {
    blocks: Ring<Block>,
}

impl MmapList {
    pub const fn new() -> Self {
        Self { blocks: Ring::new() }
    }

    /// Number of live mappings.
    #[inline]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Maps a new block of `size` usable bytes and links it at the end.
    pub fn map<P: PlatformMemory>(
        &mut self,
        kernel: &mut P,
        size: usize,
    ) -> Result<NonNull<Node<Block>>, AllocError> {
        let len = size
            .checked_add(BLOCK_HEADER_SIZE)
            .ok_or(AllocError::SizeOverflow)?;

        let addr = unsafe { kernel.request_memory(len) }
            .ok_or(AllocError::MappingFailed { requested: len })?;

        log::debug!("mapped {len} bytes at {addr:p}");

        unsafe { Ok(self.blocks.push_back(Block::new(size, Status::Mapped), addr)) }
    }

    /// Unlinks `node` and gives its mapping back.
    ///
    /// **SAFETY**: `node` must be linked in this list. It is dangling after
    /// the call.
    pub unsafe fn unmap<P: PlatformMemory>(&mut self, kernel: &mut P, node: NonNull<Node<Block>>) {
        unsafe {
            let len = node.as_ref().data.size + BLOCK_HEADER_SIZE;

            self.blocks.unlink(node);
            kernel.return_memory(node.cast(), len);

            log::debug!("unmapped {len} bytes at {node:p}");
        }
    }

    /// Gives every mapping back.
    pub fn unmap_all<P: PlatformMemory>(&mut self, kernel: &mut P) {
        while let Some(node) = self.blocks.first() {
            unsafe { self.unmap(kernel, node) };
        }
    }

    pub fn audit(&self) -> Result<(), AllocError> {
        for node in &self.blocks {
            unsafe {
                let block = &node.as_ref().data;

                if block.status()? != Status::Mapped
                    || !is_aligned(block.size, ALIGNMENT)
                    || node.as_ref().next.as_ref().prev != node
                {
                    return Err(AllocError::BrokenList {
                        addr: payload(node).as_ptr() as usize,
                    });
                }
            }
        }

        Ok(())
    }
}
