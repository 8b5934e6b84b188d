use std::{mem, ptr::NonNull};

use crate::{
    error::AllocError,
    list::Node,
    utils::{ALIGNMENT, align, is_aligned},
};

/// Header size of a block. We need to add the overhead introduced by our
/// [`Node`] structure since we always use our `Block` as a node of one of
/// the two rings.
pub const BLOCK_HEADER_SIZE: usize = align(mem::size_of::<Node<Block>>(), ALIGNMENT);

const TAG_FREE: usize = 0;
const TAG_IN_USE: usize = 1;
const TAG_MAPPED: usize = 2;

/// Status of a block.
///
/// Arena blocks go `Free -> InUse -> Free`. Mapped blocks are born `Mapped`
/// and unmapped straight from there, so the release path can decide what to
/// do by looking at the status alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Free,
    InUse,
    Mapped,
}

impl Status {
    const fn tag(self) -> usize {
        match self {
            Self::Free => TAG_FREE,
            Self::InUse => TAG_IN_USE,
            Self::Mapped => TAG_MAPPED,
        }
    }
}

/// This is the structure of a block. The fields of the block are its
/// metadata, content is placed right after this header.
///
/// The following diagram represents this structure including the [`Node`]
/// links that wrap it.
///
/// ```text
/// +---------------------+ <------+
/// |        next         |        |
/// +---------------------+        |
/// |        prev         |        |
/// +---------------------+        | -> Header (BLOCK_HEADER_SIZE)
/// |        size         |        |
/// +---------------------+        |
/// |        tag          |        |
/// +---------------------+ <------+ <- pointer handed to the user
/// |       Content       |        |
/// |         ...         |        | -> `size` addressable bytes
/// |                     |        |
/// +---------------------+ <------+
/// ```
///
/// The status is kept as a raw tag rather than as [`Status`] because the
/// header lives in memory the user can scribble over. Decoding it through
/// [`Block::status`] turns an impossible value into an error instead of
/// undefined behaviour.
#[repr(C)]
pub(crate) struct Block {
    /// Usable size of the block, always a multiple of [`ALIGNMENT`].
    pub size: usize,
    tag: usize,
}

impl Block {
    pub fn new(size: usize, status: Status) -> Self {
        debug_assert!(is_aligned(size, ALIGNMENT));
        Self {
            size,
            tag: status.tag(),
        }
    }

    #[inline]
    pub fn set_status(&mut self, status: Status) {
        self.tag = status.tag();
    }

    pub fn status(&self) -> Result<Status, AllocError> {
        match self.tag {
            TAG_FREE => Ok(Status::Free),
            TAG_IN_USE => Ok(Status::InUse),
            TAG_MAPPED => Ok(Status::Mapped),
            tag => Err(AllocError::CorruptHeader {
                addr: self.payload_addr(),
                tag,
            }),
        }
    }

    /// Payload address of the node this block is the data of.
    fn payload_addr(&self) -> usize {
        (self as *const Self as usize)
            .wrapping_sub(mem::offset_of!(Node<Block>, data))
            .wrapping_add(BLOCK_HEADER_SIZE)
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.tag == TAG_FREE
    }
}

/// Address of the first payload byte of `node`.
#[inline]
pub(crate) fn payload(node: NonNull<Node<Block>>) -> NonNull<u8> {
    unsafe { node.cast::<u8>().add(BLOCK_HEADER_SIZE) }
}

/// Address right after the last payload byte of `node`. In the arena that is
/// where the next block header starts.
///
/// **SAFETY**: `node` must point to an initialized header.
#[inline]
pub(crate) unsafe fn end(node: NonNull<Node<Block>>) -> NonNull<u8> {
    unsafe { payload(node).add(node.as_ref().data.size) }
}

/// Recovers the header of a payload pointer.
///
/// Only alignment can be checked here. Anything else about the pointer is
/// the caller's promise.
///
/// **SAFETY**: `ptr` must have been returned by this allocator.
#[inline]
pub(crate) unsafe fn header(ptr: NonNull<u8>) -> Result<NonNull<Node<Block>>, AllocError> {
    let addr = ptr.as_ptr() as usize;

    if !is_aligned(addr, ALIGNMENT) || addr <= BLOCK_HEADER_SIZE {
        return Err(AllocError::Misaligned { addr });
    }

    let node = ptr.as_ptr().wrapping_sub(BLOCK_HEADER_SIZE);

    unsafe { Ok(NonNull::new_unchecked(node).cast()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    #[test]
    fn header_size_is_aligned() {
        assert_eq!(BLOCK_HEADER_SIZE % ALIGNMENT, 0);
        assert!(BLOCK_HEADER_SIZE >= mem::size_of::<Node<Block>>());
    }

    #[test]
    fn status_round_trips_through_tag() {
        for status in [Status::Free, Status::InUse, Status::Mapped] {
            let block = Block::new(16, status);
            assert_eq!(block.status(), Ok(status));
        }

        let mut block = Block::new(16, Status::InUse);
        assert!(!block.is_free());
        block.set_status(Status::Free);
        assert!(block.is_free());
    }

    #[test]
    fn unknown_tag_is_corrupt() {
        let mut block = Block::new(8, Status::Free);
        block.tag = 0xdead;

        assert!(matches!(
            block.status(),
            Err(AllocError::CorruptHeader { tag: 0xdead, .. })
        ));
    }

    #[test]
    fn corrupt_tag_reports_the_payload_address() {
        let mut slot = MaybeUninit::<Node<Block>>::uninit();
        let node = NonNull::new(slot.as_mut_ptr()).unwrap();

        unsafe {
            node.as_ptr().write(Node {
                next: node,
                prev: node,
                data: Block::new(8, Status::InUse),
            });
            (*node.as_ptr()).data.tag = 5;

            assert_eq!(
                node.as_ref().data.status(),
                Err(AllocError::CorruptHeader {
                    addr: payload(node).as_ptr() as usize,
                    tag: 5,
                })
            );
        }
    }

    #[test]
    fn header_rejects_misaligned_pointers() {
        let ptr = NonNull::new(0x1003 as *mut u8).unwrap();
        assert_eq!(
            unsafe { header(ptr) }.err(),
            Some(AllocError::Misaligned { addr: 0x1003 })
        );

        let ptr = NonNull::new(0x1000 as *mut u8).unwrap();
        let node = unsafe { header(ptr) }.unwrap();
        assert_eq!(node.as_ptr() as usize, 0x1000 - BLOCK_HEADER_SIZE);
    }
}
