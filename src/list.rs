use std::{marker::PhantomData, ptr::NonNull};

/// Non-null pointer to `T`.
pub(crate) type Link<T> = Option<NonNull<T>>;

/// Element of a [`Ring`]. Once a node is linked, `next` and `prev` always
/// point to a live node (itself when it is the only one), so they are never
/// null.
///
/// The layout is fixed so the links always come first in a block header.
#[repr(C)]
pub(crate) struct Node<T> {
    /// Pointer to the next node of the ring
    pub next: NonNull<Self>,
    /// Pointer to the previous node of the ring
    pub prev: NonNull<Self>,
    /// Element of the node
    pub data: T,
}

/// Circular doubly linked list without a sentinel node.
///
/// ```text
///        +------------------------------------------+
///        v                                          |
///   +--------+     +--------+     +--------+        |
///   |  head  | --> |  node  | --> |  last  | -------+
///   +--------+     +--------+     +--------+
///        |                            ^
///        +------------ prev ----------+
/// ```
///
/// The ring only owns the `head` pointer. `head.prev` is the last node and
/// `last.next` is `head` again, so both ends are reachable in O(1).
pub(crate) struct Ring<T> {
    head: Link<Node<T>>,
    len: usize,
    marker: PhantomData<T>,
}

pub(crate) struct Iter<'a, T> {
    current: Link<Node<T>>,
    remaining: usize,
    marker: PhantomData<&'a T>,
}

impl<T> Ring<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            len: 0,
            marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Link<Node<T>> {
        self.head
    }

    #[inline]
    pub fn last(&self) -> Link<Node<T>> {
        self.head.map(|head| unsafe { head.as_ref().prev })
    }

    /// Whether `node` is the last one of the ring, that is, its `next` wraps
    /// around to the head.
    ///
    /// **SAFETY**: `node` must be linked in this ring.
    #[inline]
    pub unsafe fn is_last(&self, node: NonNull<Node<T>>) -> bool {
        unsafe { Some(node.as_ref().next) == self.head }
    }

    /// Returns the node after `node` unless that would wrap back to the head.
    ///
    /// **SAFETY**: `node` must be linked in this ring.
    #[inline]
    pub unsafe fn successor(&self, node: NonNull<Node<T>>) -> Link<Node<T>> {
        unsafe {
            if self.is_last(node) {
                None
            } else {
                Some(node.as_ref().next)
            }
        }
    }

    /// Appends a new node at the end of the ring.
    ///
    /// As with every structure of the allocator, this method can not make
    /// allocations itself. Therefor, it has to receive the `addr` where the
    /// node has to be written.
    ///
    /// **SAFETY**: Caller must guarantee that `addr` is valid for writes of a
    /// `Node<T>` and properly aligned.
    pub unsafe fn push_back(&mut self, data: T, addr: NonNull<u8>) -> NonNull<Node<T>> {
        let node = addr.cast::<Node<T>>();

        unsafe {
            match self.head {
                None => {
                    node.as_ptr().write(Node {
                        next: node,
                        prev: node,
                        data,
                    });
                    self.head = Some(node);
                }
                Some(mut head) => {
                    let mut last = head.as_ref().prev;
                    node.as_ptr().write(Node {
                        next: head,
                        prev: last,
                        data,
                    });
                    last.as_mut().next = node;
                    head.as_mut().prev = node;
                }
            }
        }

        self.len += 1;

        node
    }

    /// Writes a new node at `addr` and links it right after `at`. If `at` is
    /// the last node, the new one becomes the last.
    ///
    /// **SAFETY**: `at` must be linked in this ring and `addr` must be valid
    /// for writes of a `Node<T>`.
    pub unsafe fn insert_after(
        &mut self,
        mut at: NonNull<Node<T>>,
        data: T,
        addr: NonNull<u8>,
    ) -> NonNull<Node<T>> {
        let node = addr.cast::<Node<T>>();

        unsafe {
            let mut next = at.as_ref().next;
            node.as_ptr().write(Node {
                next,
                prev: at,
                data,
            });
            at.as_mut().next = node;
            next.as_mut().prev = node;
        }

        self.len += 1;

        node
    }

    /// Removes `node` from the ring. The node memory itself is left alone.
    ///
    /// There are three cases: the only node (the ring becomes empty), the
    /// head (the head moves forward) and any other node (plain splice).
    ///
    /// **SAFETY**: `node` must be linked in this ring.
    pub unsafe fn unlink(&mut self, node: NonNull<Node<T>>) {
        unsafe {
            if self.len == 1 {
                self.head = None;
            } else {
                let mut prev = node.as_ref().prev;
                let mut next = node.as_ref().next;
                prev.as_mut().next = next;
                next.as_mut().prev = prev;

                if Some(node) == self.head {
                    self.head = Some(next);
                }
            }
        }

        self.len -= 1;
    }

    /// Iterates over the node pointers, starting from the head.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            current: self.head,
            remaining: self.len,
            marker: PhantomData,
        }
    }
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = NonNull<Node<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        let node = self.current?;

        unsafe {
            self.current = Some(node.as_ref().next);
        }
        self.remaining -= 1;

        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, T> IntoIterator for &'a Ring<T> {
    type Item = NonNull<Node<T>>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
