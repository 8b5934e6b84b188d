use crate::{block::BLOCK_HEADER_SIZE, error::AllocError, utils::ALIGNMENT};

/// Requests whose aligned size plus header exceed this many bytes bypass the
/// arena and get their own mapping. It is also the size of the first growth
/// of the arena.
pub const MMAP_THRESHOLD: usize = 128 * 1024;

/// Tunables of one allocator context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Large object threshold. See [`MMAP_THRESHOLD`].
    pub mmap_threshold: usize,
}

impl Config {
    pub const DEFAULT: Self = Self {
        mmap_threshold: MMAP_THRESHOLD,
    };

    /// Builds a configuration with a custom threshold.
    ///
    /// The threshold must be a multiple of [`ALIGNMENT`] and leave room for
    /// two headers and one aligned payload unit, which is the smallest arena
    /// that can be split on creation.
    pub const fn new(mmap_threshold: usize) -> Result<Self, AllocError> {
        if mmap_threshold % ALIGNMENT != 0 {
            return Err(AllocError::InvalidConfig(
                "mmap threshold must be a multiple of the alignment",
            ));
        }

        if mmap_threshold < 2 * BLOCK_HEADER_SIZE + ALIGNMENT {
            return Err(AllocError::InvalidConfig(
                "mmap threshold must fit two headers and one aligned unit",
            ));
        }

        Ok(Self { mmap_threshold })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}
