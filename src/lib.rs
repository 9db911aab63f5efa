//! A memory-mappable ring-of-packets storage core for a rolling-hash
//! key/value index.
//!
//! The region is a single contiguous byte span laid out as a header, a
//! caller-owned index array, and a wrap-around ring of bit-packed,
//! self-describing records ("packets"). This crate owns the packet codec
//! and the ring allocator/reclaimer; it does not interpret keys, build a
//! lookup structure over them, or coordinate access across threads or
//! processes — see each module's docs for the exact boundary.
#![deny(missing_docs)]

pub mod bit;
mod crc64;
pub mod error;
pub mod header;
#[cfg(feature = "mmap")]
pub mod mmap;
pub mod packet;
pub mod region;
pub mod ring;

pub use crate::crc64::RunningChecksum;
pub use crate::error::{Result, RingError};
pub use crate::packet::Packet;
pub use crate::region::ByteRegion;
pub use crate::ring::Ring;
