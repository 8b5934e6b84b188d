use std::fmt;

/// Everything that can go wrong inside the allocator.
///
/// The first group comes from the operating system primitives and is
/// treated as unrecoverable by the plain entry points ([`AllocError::is_fatal`]).
/// The second group is caller misuse that the block header happens to make
/// visible. Misuse the header can't see (foreign pointers, writes past the
/// end of a payload) stays undefined behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The brk-style growth call refused to move the break.
    SegmentExhausted { requested: usize },
    /// The anonymous mapping call failed.
    MappingFailed { requested: usize },
    /// The break moved behind our back: the growth didn't start where the
    /// arena ends.
    Discontiguous { expected: usize, found: usize },
    /// `count * size`, or a size plus its header, doesn't fit in `usize`.
    SizeOverflow,
    /// Rejected [`crate::Config`] value.
    InvalidConfig(&'static str),
    /// Release of a block that is already free.
    ReleasedTwice { addr: usize },
    /// Resize of a block that is free.
    NotInUse { addr: usize },
    /// The pointer can't be a payload: it is not aligned to [`crate::ALIGNMENT`].
    Misaligned { addr: usize },
    /// The status tag of the header is not one we ever write.
    CorruptHeader { addr: usize, tag: usize },
    /// Links, size or placement of the block at `addr` don't agree with its
    /// neighbours.
    BrokenList { addr: usize },
}

impl AllocError {
    /// Failures of the memory primitives. There is no safe way to keep going
    /// after one of these.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SegmentExhausted { .. } | Self::MappingFailed { .. } | Self::Discontiguous { .. }
        )
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SegmentExhausted { requested } => {
                write!(f, "cannot extend the data segment by {requested} bytes")
            }
            Self::MappingFailed { requested } => {
                write!(f, "cannot map {requested} bytes of anonymous memory")
            }
            Self::Discontiguous { expected, found } => write!(
                f,
                "data segment grew at {found:#x} instead of {expected:#x}"
            ),
            Self::SizeOverflow => write!(f, "requested size overflows usize"),
            Self::InvalidConfig(reason) => write!(f, "invalid configuration: {reason}"),
            Self::ReleasedTwice { addr } => write!(f, "block at {addr:#x} released twice"),
            Self::NotInUse { addr } => write!(f, "block at {addr:#x} is not in use"),
            Self::Misaligned { addr } => write!(f, "pointer {addr:#x} is not a payload address"),
            Self::CorruptHeader { addr, tag } => {
                write!(f, "block at {addr:#x} has an unknown status tag {tag}")
            }
            Self::BrokenList { addr } => write!(f, "block at {addr:#x} is badly linked"),
        }
    }
}

impl std::error::Error for AllocError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_primitive_failures_are_fatal() {
        assert!(AllocError::SegmentExhausted { requested: 8 }.is_fatal());
        assert!(AllocError::MappingFailed { requested: 8 }.is_fatal());
        assert!(AllocError::Discontiguous { expected: 0, found: 8 }.is_fatal());

        assert!(!AllocError::SizeOverflow.is_fatal());
        assert!(!AllocError::ReleasedTwice { addr: 8 }.is_fatal());
        assert!(!AllocError::NotInUse { addr: 8 }.is_fatal());
    }

    #[test]
    fn messages_name_the_address() {
        let msg = AllocError::ReleasedTwice { addr: 0x1000 }.to_string();
        assert_eq!(msg, "block at 0x1000 released twice");

        let msg = AllocError::Discontiguous { expected: 0x10, found: 0x20 }.to_string();
        assert!(msg.contains("0x20") && msg.contains("0x10"));
    }
}
