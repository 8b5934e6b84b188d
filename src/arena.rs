use std::ptr::NonNull;

use crate::{
    block::{self, BLOCK_HEADER_SIZE, Block, Status},
    error::AllocError,
    kernel::PlatformMemory,
    list::{Link, Node, Ring},
    utils::{ALIGNMENT, is_aligned},
};

/// The memory obtained by growing the data segment.
///
/// Blocks are laid out back to back in address order and linked in a
/// [`Ring`], so the successor of every block but the last one starts right
/// where its payload ends:
///
/// ```text
///   head                                                 last
/// +--------+---------+--------+---------+--------+------------------+
/// | header | payload | header | payload | header |     payload      |
/// +--------+---------+--------+---------+--------+------------------+
///     ^                                                             ^
///     +---------------------- last.next ----------------------------+ segment end
/// ```
///
/// There is no separate free list: free blocks are found by walking the
/// ring and checking [`Block::is_free`]. Blocks are never given back to the
/// kernel. A released block stays in place until it is merged with its free
/// neighbours by [`Arena::coalesce`] or handed out again.
pub(crate) struct Arena {
    blocks: Ring<Block>,
}

impl Arena {
    pub const fn new() -> Self {
        Self { blocks: Ring::new() }
    }

    #[inline]
    pub fn blocks(&self) -> &Ring<Block> {
        &self.blocks
    }

    /// Whether `node` is the last block, the only one that can grow in place
    /// by moving the segment end.
    ///
    /// **SAFETY**: `node` must be an arena block.
    #[inline]
    pub unsafe fn is_last(&self, node: NonNull<Node<Block>>) -> bool {
        unsafe { self.blocks.is_last(node) }
    }

    /// Serves an aligned `size` request from the arena, creating it if this
    /// is the first one. The returned block is marked [`Status::InUse`].
    ///
    /// `threshold` is the size of the first growth.
    pub fn allocate<P: PlatformMemory>(
        &mut self,
        kernel: &mut P,
        threshold: usize,
        size: usize,
    ) -> Result<NonNull<Node<Block>>, AllocError> {
        debug_assert!(is_aligned(size, ALIGNMENT));

        let Some(last) = self.blocks.last() else {
            return self.init(kernel, threshold, size);
        };

        unsafe {
            if let Some(mut node) = self.find_best_fit(size) {
                self.split(node, size);
                node.as_mut().data.set_status(Status::InUse);

                return Ok(node);
            }

            // Nothing fits. A free block at the end only needs the missing
            // bytes, anything else needs a whole new block.
            if last.as_ref().data.is_free() {
                let mut last = last;
                self.extend(kernel, last, size)?;
                last.as_mut().data.set_status(Status::InUse);

                return Ok(last);
            }
        }

        self.append(kernel, size)
    }

    /// First growth of the segment, `threshold` bytes at once.
    ///
    /// The first request takes the front of it and the rest becomes a free
    /// block. If the rest could not even hold a header and one aligned unit,
    /// the request gets the whole region instead.
    fn init<P: PlatformMemory>(
        &mut self,
        kernel: &mut P,
        threshold: usize,
        size: usize,
    ) -> Result<NonNull<Node<Block>>, AllocError> {
        let addr = self.grow(kernel, threshold)?;

        log::debug!("arena created at {addr:p} with {threshold} bytes");

        unsafe {
            if size + 2 * BLOCK_HEADER_SIZE + ALIGNMENT > threshold {
                let whole = threshold - BLOCK_HEADER_SIZE;
                return Ok(self.blocks.push_back(Block::new(whole, Status::InUse), addr));
            }

            let head = self.blocks.push_back(Block::new(size, Status::InUse), addr);
            let rest = threshold - size - 2 * BLOCK_HEADER_SIZE;
            self.blocks
                .push_back(Block::new(rest, Status::Free), block::end(head));

            Ok(head)
        }
    }

    /// Grows the segment by `len` bytes, checking that the new bytes start
    /// exactly where the arena ends.
    fn grow<P: PlatformMemory>(&self, kernel: &mut P, len: usize) -> Result<NonNull<u8>, AllocError> {
        let addr = unsafe { kernel.extend_segment(len) }
            .ok_or(AllocError::SegmentExhausted { requested: len })?;

        if let Some(last) = self.blocks.last() {
            let expected = unsafe { block::end(last) };

            if addr != expected {
                return Err(AllocError::Discontiguous {
                    expected: expected.as_ptr() as usize,
                    found: addr.as_ptr() as usize,
                });
            }
        }

        debug_assert!(is_aligned(addr.as_ptr() as usize, ALIGNMENT));

        Ok(addr)
    }

    /// Extends the last block to `size` bytes by moving the segment end.
    ///
    /// **SAFETY**: `node` must be the last arena block and smaller than `size`.
    pub unsafe fn extend<P: PlatformMemory>(
        &mut self,
        kernel: &mut P,
        mut node: NonNull<Node<Block>>,
        size: usize,
    ) -> Result<(), AllocError> {
        unsafe {
            debug_assert!(self.is_last(node));

            let missing = size - node.as_ref().data.size;
            self.grow(kernel, missing)?;
            node.as_mut().data.size = size;

            log::debug!("arena grew by {missing} bytes, last block is now {size} bytes");
        }

        Ok(())
    }

    /// Grows the segment by a header plus `size` and links a new in use
    /// block there.
    fn append<P: PlatformMemory>(
        &mut self,
        kernel: &mut P,
        size: usize,
    ) -> Result<NonNull<Node<Block>>, AllocError> {
        let len = size
            .checked_add(BLOCK_HEADER_SIZE)
            .ok_or(AllocError::SizeOverflow)?;
        let addr = self.grow(kernel, len)?;

        log::debug!("arena grew by {len} bytes for a new block at {addr:p}");

        unsafe { Ok(self.blocks.push_back(Block::new(size, Status::InUse), addr)) }
    }

    /// Merges every run of adjacent free blocks into its first block. Returns
    /// the number of merges.
    ///
    /// One pass is enough: once the inner loop stops, the current block is
    /// either in use or followed by a block in use, and merging further ahead
    /// can't change that.
    pub fn coalesce(&mut self) -> usize {
        let Some(mut current) = self.blocks.first() else {
            return 0;
        };

        let mut merged = 0;

        unsafe {
            loop {
                if current.as_ref().data.is_free() {
                    while let Some(next) = self.blocks.successor(current) {
                        if !next.as_ref().data.is_free() {
                            break;
                        }

                        current.as_mut().data.size += BLOCK_HEADER_SIZE + next.as_ref().data.size;
                        self.blocks.unlink(next);
                        merged += 1;
                    }
                }

                match self.blocks.successor(current) {
                    Some(next) => current = next,
                    None => break,
                }
            }
        }

        if merged > 0 {
            log::trace!("coalesced {merged} free blocks");
        }

        merged
    }

    /// Returns the smallest free block that can hold `size` bytes. If several
    /// have the same size the one closest to the head wins.
    ///
    /// This is the best-fit policy: a single pass over the whole ring that
    /// keeps big free blocks around for big requests.
    pub fn find_best_fit(&self, size: usize) -> Link<Node<Block>> {
        let mut best: Link<Node<Block>> = None;

        for node in &self.blocks {
            let block = unsafe { &node.as_ref().data };

            if !block.is_free() || block.size < size {
                continue;
            }

            if best.is_none_or(|best| unsafe { block.size < best.as_ref().data.size }) {
                best = Some(node);
            }
        }

        best
    }

    /// Shrinks `node` to `size` and turns the tail into a new free block
    /// linked right after it. Nothing happens unless the tail can hold a
    /// header and at least one aligned unit, so we never create fragments
    /// nobody can use. Returns whether a split took place.
    ///
    /// **SAFETY**: `node` must be an arena block.
    pub unsafe fn split(&mut self, mut node: NonNull<Node<Block>>, size: usize) -> bool {
        unsafe {
            let current = node.as_ref().data.size;

            if current < size + BLOCK_HEADER_SIZE + ALIGNMENT {
                return false;
            }

            node.as_mut().data.size = size;

            let rest = current - size - BLOCK_HEADER_SIZE;
            self.blocks
                .insert_after(node, Block::new(rest, Status::Free), block::end(node));
        }

        true
    }

    /// Grows `node` to `size` by taking over its successor if that one is
    /// free and big enough. What's left of the successor, if it can hold a
    /// header and an aligned unit, stays behind as a smaller free block.
    /// Returns whether `node` now holds `size` bytes.
    ///
    /// **SAFETY**: `node` must be an arena block smaller than `size`.
    pub unsafe fn grow_into_next(&mut self, mut node: NonNull<Node<Block>>, size: usize) -> bool {
        unsafe {
            let Some(next) = self.blocks.successor(node) else {
                return false;
            };

            if !next.as_ref().data.is_free() {
                return false;
            }

            let combined = node.as_ref().data.size + BLOCK_HEADER_SIZE + next.as_ref().data.size;
            if combined < size {
                return false;
            }

            // The successor header has to go before a new one is written,
            // possibly on top of its payload.
            self.blocks.unlink(next);

            if combined - size >= BLOCK_HEADER_SIZE + ALIGNMENT {
                node.as_mut().data.size = size;

                let rest = combined - size - BLOCK_HEADER_SIZE;
                self.blocks
                    .insert_after(node, Block::new(rest, Status::Free), block::end(node));
            } else {
                node.as_mut().data.size = combined;
            }
        }

        true
    }

    /// Number of free blocks.
    pub fn free_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|node| unsafe { node.as_ref().data.is_free() })
            .count()
    }

    /// Bytes taken from the segment, headers included.
    pub fn bytes(&self) -> usize {
        self.blocks
            .iter()
            .map(|node| unsafe { BLOCK_HEADER_SIZE + node.as_ref().data.size })
            .sum()
    }

    /// Walks the arena checking links, sizes, statuses and that every block
    /// starts where the previous one ends.
    pub fn audit(&self) -> Result<(), AllocError> {
        for node in &self.blocks {
            let addr = block::payload(node).as_ptr() as usize;

            unsafe {
                let block = &node.as_ref().data;

                if block.status()? == Status::Mapped || !is_aligned(block.size, ALIGNMENT) {
                    return Err(AllocError::BrokenList { addr });
                }

                if node.as_ref().next.as_ref().prev != node {
                    return Err(AllocError::BrokenList { addr });
                }

                if let Some(next) = self.blocks.successor(node) {
                    if next.cast::<u8>() != block::end(node) {
                        return Err(AllocError::BrokenList {
                            addr: block::payload(next).as_ptr() as usize,
                        });
                    }
                }
            }
        }

        Ok(())
    }
}
