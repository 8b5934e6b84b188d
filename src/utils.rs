//! This file contains all the helper functions for the allocator.
//! This are functions that don't particularly belong to any concrete module of the program.

/// Every block size and every payload address handed out is a multiple of this.
pub const ALIGNMENT: usize = 8;

/// It aligns `to_be_aligned` using `aligment`.
///
/// This method is used to round payload sizes up to [`ALIGNMENT`] and segment
/// reservations up to the page size. `aligment` must be a power of two.
#[inline]
pub const fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Same as [`align`] but returns `None` instead of wrapping around for
/// requests close to `usize::MAX`.
#[inline]
pub fn checked_align(to_be_aligned: usize, aligment: usize) -> Option<usize> {
    Some(to_be_aligned.checked_add(aligment - 1)? & !(aligment - 1))
}

#[inline]
pub fn is_aligned(addr: usize, aligment: usize) -> bool {
    addr & (aligment - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_to_alignment_unit() {
        let aligments = vec![(1..9, 8), (9..17, 16), (17..25, 24), (25..33, 32)];

        for (sizes, expected) in aligments {
            for size in sizes {
                assert_eq!(expected, align(size, ALIGNMENT));
            }
        }

        assert_eq!(0, align(0, ALIGNMENT));
    }

    #[test]
    fn align_page_size() {
        // For testing purposes we are assuming the page size is 4096
        let aligments = vec![(1..4097, 4096), (4097..8193, 8192)];

        for (sizes, expected) in aligments {
            for size in sizes {
                assert_eq!(expected, align(size, 4096))
            }
        }
    }

    #[test]
    fn checked_align_detects_overflow() {
        assert_eq!(Some(16), checked_align(9, ALIGNMENT));
        assert_eq!(None, checked_align(usize::MAX, ALIGNMENT));
        assert_eq!(None, checked_align(usize::MAX - 3, ALIGNMENT));
    }

    #[test]
    fn aligned_addresses() {
        assert!(is_aligned(0, ALIGNMENT));
        assert!(is_aligned(64, ALIGNMENT));
        assert!(!is_aligned(65, ALIGNMENT));
        assert!(!is_aligned(4, ALIGNMENT));
    }
}
