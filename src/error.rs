//! Error types produced by the ring storage core.

use thiserror::Error;

/// Result type used throughout the ring storage core.
pub type Result<T> = ::std::result::Result<T, RingError>;

/// Failure modes of the packet codec and ring allocator/reclaimer.
///
/// `AllocationFull` is deliberately *not* part of this enum: per the
/// propagation policy, an allocation that cannot be satisfied is a normal
/// value (`None`), not an error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    /// `packetLength`/key/value length violates a size constraint, or the
    /// region is too small for the requested index size.
    #[error("invalid length: {0}")]
    InvalidLength(&'static str),

    /// `setKey` was called on a packet that already has key or value content.
    #[error("packet is not empty")]
    NotEmpty,

    /// A setter would exceed the packet's capacity.
    #[error("capacity overflow: {0}")]
    Overflow(&'static str),

    /// `checkIntegrity` failed against the supplied running content hasher.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// A reclaim-time invariant failed; the ring is corrupt and the mutator
    /// must not continue using it.
    #[error("corrupt ring: {0}")]
    CorruptRing(&'static str),
}
