//! Ring allocator and reclaimer: carves packet sequences out of the forward
//! edge of a region and reclaims dead sequences from the head.
//!
//! `Ring<R>` owns the region outright (unlike [`crate::packet::Packet`],
//! which only ever borrows one). Navigation methods that would otherwise
//! need to hold a `Packet` view across a call back into `Ring` instead pass
//! plain offsets and lengths, so the borrow checker never has to reason
//! about two live views of the same region at once.

use crate::bit;
use crate::error::{Result, RingError};
use crate::header::{self, RingHeader};
use crate::packet::{self, Packet};
use crate::region::ByteRegion;

/// A byte region bound as a ring of packets, with a caller-owned index array
/// reserved ahead of packet storage.
pub struct Ring<R: ByteRegion> {
    region: R,
    index_size: usize,
    storage_offset: usize,
}

impl<R: ByteRegion> Ring<R> {
    /// Binds `region` as a ring with room for `index_size` 32-bit index
    /// entries ahead of packet storage. On first bind, `begin`/`end` are
    /// set to `storage_offset` and `wrapped` is cleared; reopening an
    /// already-bound region preserves its state.
    pub fn bind(mut region: R, index_size: usize) -> Result<Self> {
        let min_size = header::HEADER_LENGTH + index_size * 4;
        if region.len() <= min_size {
            return Err(RingError::InvalidLength(
                "region is too small for the requested index size",
            ));
        }
        let storage_offset =
            bit::align_up(header::HEADER_LENGTH + 4 * index_size, bit::PACKET_ALIGNMENT);
        RingHeader::bind(&mut region, storage_offset)?;
        Ok(Ring {
            region,
            index_size,
            storage_offset,
        })
    }

    /// Byte offset of the first storage byte.
    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    /// Byte-length of the storage area (region length minus header and
    /// index).
    pub fn storage_size(&self) -> usize {
        self.region.len() - self.storage_offset
    }

    /// Byte-length of storage currently occupied by live (non-reclaimed)
    /// packets.
    pub fn storage_used(&mut self) -> Result<usize> {
        let header = RingHeader::at(&mut self.region);
        let begin = header.begin()?;
        let end = header.end()?;
        if header.wrapped()? {
            Ok(self.region.len() + end - begin - self.storage_offset)
        } else {
            Ok(end - begin)
        }
    }

    /// Number of 32-bit slots reserved for the caller's index.
    pub fn index_size(&self) -> usize {
        self.index_size
    }

    /// Reads index slot `i`. The contents are never interpreted by the
    /// ring; they belong entirely to the caller's own lookup structure.
    pub fn index_get(&self, i: usize) -> Result<u32> {
        self.check_index(i)?;
        self.region.get_u32(header::HEADER_LENGTH + i * 4)
    }

    /// Writes index slot `i`.
    pub fn index_set(&mut self, i: usize, value: u32) -> Result<()> {
        self.check_index(i)?;
        self.region.put_u32(header::HEADER_LENGTH + i * 4, value)
    }

    fn check_index(&self, i: usize) -> Result<()> {
        if i >= self.index_size {
            Err(RingError::InvalidLength("index slot out of range"))
        } else {
            Ok(())
        }
    }

    /// Borrows the underlying region, for callers (such as [`crate::mmap`])
    /// that need operations the ring itself doesn't expose, like flushing
    /// a memory-mapped file to disk.
    pub fn region(&self) -> &R {
        &self.region
    }

    /// Views the packet at `offset`. The caller is responsible for `offset`
    /// actually being a packet boundary (as returned by [`Self::head`],
    /// [`Self::next_packet`], or [`Self::allocate_packets`]).
    pub fn packet_at(&mut self, offset: usize) -> Packet<'_, R> {
        Packet::at(&mut self.region, offset)
    }

    /// The packet at `begin`, or `None` if the ring holds no live packets.
    pub fn head(&mut self) -> Result<Option<Packet<'_, R>>> {
        let header = RingHeader::at(&mut self.region);
        let wrapped = header.wrapped()?;
        let begin = header.begin()?;
        let end = header.end()?;
        if !wrapped && begin == end {
            return Ok(None);
        }
        Ok(Some(Packet::at(&mut self.region, begin)))
    }

    /// The packet immediately following the packet at `offset` with the
    /// given `packet_length`, or `None` if that packet is the one `end`
    /// points past (the forward edge of the ring).
    pub fn next_packet(&mut self, offset: usize, packet_length: usize) -> Result<Option<Packet<'_, R>>> {
        let header = RingHeader::at(&mut self.region);
        let wrapped = header.wrapped()?;
        let end = header.end()?;
        let region_len = self.region.len();

        let mut next = offset + packet_length;
        if wrapped && next == region_len {
            next = self.storage_offset;
        }
        if next == end {
            return Ok(None);
        }
        Ok(Some(Packet::at(&mut self.region, next)))
    }

    /// Carves a sequence of one or more packets whose combined `capacity()`
    /// covers `capacity`, returning the offset of the head packet. Returns
    /// `None` (not an error — see the crate's error-propagation policy) when
    /// the wrapped-ring remaining free space can't satisfy the request.
    pub fn allocate_packets(&mut self, capacity: usize) -> Result<Option<usize>> {
        let header = RingHeader::at(&mut self.region);
        let mut wrapped = header.wrapped()?;
        let begin = header.begin()?;
        let mut end = header.end()?;
        let region_len = self.region.len();

        let head_offset = end;
        let mut remaining = capacity;
        let mut first = true;

        loop {
            let mut next_boundary = region_len;
            if wrapped {
                if end + packet::HEADER_LENGTH + remaining > begin {
                    log::trace!(
                        "allocate_packets({}): wrapped ring has no room before begin={}",
                        capacity,
                        begin
                    );
                    return Ok(None);
                }
                next_boundary = begin;
            }
            if (end >> bit::BULKHEAD_SHIFT) != (next_boundary >> bit::BULKHEAD_SHIFT) {
                let bulkhead = end >> bit::BULKHEAD_SHIFT;
                next_boundary = (bulkhead + 1) << bit::BULKHEAD_SHIFT;
                log::trace!("allocate_packets: splitting at bulkhead boundary {}", next_boundary);
            }

            let block_length = next_boundary - end;
            if block_length < packet::MIN_PACKET_LENGTH || block_length % bit::PACKET_ALIGNMENT != 0 {
                return Err(RingError::CorruptRing(
                    "ring sizing does not guarantee a valid block for the next packet",
                ));
            }

            let mut packet_length = packet::HEADER_LENGTH + remaining;
            if packet_length % bit::PACKET_ALIGNMENT != 0 {
                packet_length += bit::PACKET_ALIGNMENT - (packet_length % bit::PACKET_ALIGNMENT);
            }
            packet_length = packet_length.min(packet::MAX_PACKET_LENGTH).min(block_length);

            let remainder = block_length - packet_length;
            if remainder != 0 && remainder < packet::MIN_PACKET_LENGTH {
                if packet_length + remainder <= packet::MAX_PACKET_LENGTH {
                    packet_length += remainder;
                } else {
                    packet_length -= packet::MIN_PACKET_LENGTH - remainder;
                }
            }

            let packet_capacity = {
                let mut pkt = Packet::initialize(&mut self.region, end, packet_length)?;
                if !first {
                    pkt.mark_continues_sequence()?;
                }
                let packet_capacity = pkt.capacity()?;
                if packet_capacity >= remaining {
                    pkt.mark_completes_sequence()?;
                }
                packet_capacity
            };
            first = false;

            if packet_capacity >= remaining {
                remaining = 0;
            } else {
                remaining -= packet_capacity;
            }

            if end + packet_length == region_len {
                wrapped = true;
                end = self.storage_offset;
                log::trace!("allocate_packets: wrapped end around to {}", end);
            } else {
                end += packet_length;
            }

            if remaining == 0 {
                break;
            }
        }

        let mut header = RingHeader::at(&mut self.region);
        header.set_end(end as u64)?;
        header.set_wrapped(wrapped)?;
        log::debug!(
            "allocate_packets({}): head={} end={} wrapped={}",
            capacity,
            head_offset,
            end,
            wrapped
        );

        Ok(Some(head_offset))
    }

    /// Advances `begin` past the dead sequence currently at the ring's
    /// head, returning the number of bytes reclaimed. The head packet must
    /// be dead and must not have `continues` set; every packet through the
    /// one with `completes` set must likewise be dead. Any violated
    /// invariant is fatal to the ring (`CorruptRing`).
    pub fn reclaim_head(&mut self) -> Result<usize> {
        let mut reclaimed = 0usize;
        let mut first = true;

        loop {
            let header = RingHeader::at(&mut self.region);
            let wrapped = header.wrapped()?;
            let begin = header.begin()?;
            let end = header.end()?;
            if !wrapped && begin == end {
                return Err(RingError::CorruptRing("reclaim_head called on an empty ring"));
            }

            let (packet_length, dead, continues, completes) = {
                let pkt = Packet::at(&mut self.region, begin);
                (
                    pkt.packet_length()?,
                    pkt.is_dead()?,
                    pkt.continues_sequence()?,
                    pkt.completes_sequence()?,
                )
            };
            if !dead {
                return Err(RingError::CorruptRing("head packet is not dead"));
            }
            if first && continues {
                return Err(RingError::CorruptRing(
                    "head packet continues a preceding sequence",
                ));
            }
            if !first && !continues {
                return Err(RingError::CorruptRing(
                    "sequence packet is missing its continues flag",
                ));
            }
            first = false;

            let region_len = self.region.len();
            let mut new_begin = begin + packet_length;
            if new_begin > region_len {
                return Err(RingError::CorruptRing("begin advanced past region end"));
            }
            let mut new_wrapped = wrapped;
            if wrapped && new_begin == region_len {
                new_begin = self.storage_offset;
                new_wrapped = false;
            }

            let mut header = RingHeader::at(&mut self.region);
            header.set_begin(new_begin as u64)?;
            header.set_wrapped(new_wrapped)?;

            reclaimed += packet_length;
            if completes {
                break;
            }
        }

        log::debug!("reclaim_head: reclaimed {} bytes", reclaimed);
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_ring(region_len: usize) -> Ring<Vec<u8>> {
        Ring::bind(vec![0u8; region_len], 1).unwrap()
    }

    #[test]
    fn bind_sets_storage_offset_and_initial_cursors() {
        let mut ring = new_ring(16608);
        assert_eq!(ring.storage_offset(), 40);
        assert_eq!(ring.storage_size(), 16608 - 40);
        assert!(ring.head().unwrap().is_none());
        assert_eq!(ring.storage_used().unwrap(), 0);
    }

    #[test]
    fn e2_three_allocation_fill() {
        let mut ring = new_ring(16608);

        let head = ring.allocate_packets(100).unwrap().unwrap();
        {
            let pkt = ring.packet_at(head);
            assert_eq!(pkt.packet_length().unwrap(), 120);
            assert_eq!(pkt.capacity().unwrap(), 103);
            assert!(!pkt.continues_sequence().unwrap());
            assert!(pkt.completes_sequence().unwrap());
        }
        assert!(ring.next_packet(head, 120).unwrap().is_none());

        let head2 = ring.allocate_packets(8193).unwrap().unwrap();
        let (len1, cap1, cont1, comp1) = {
            let pkt = ring.packet_at(head2);
            (
                pkt.packet_length().unwrap(),
                pkt.capacity().unwrap(),
                pkt.continues_sequence().unwrap(),
                pkt.completes_sequence().unwrap(),
            )
        };
        assert_eq!((len1, cap1, cont1, comp1), (8208, 8191, false, false));

        let second = ring.next_packet(head2, len1).unwrap().unwrap();
        let second_offset = second.offset();
        assert_eq!(second.packet_length().unwrap(), 24);
        assert_eq!(second.capacity().unwrap(), 7);
        assert!(second.continues_sequence().unwrap());
        assert!(second.completes_sequence().unwrap());
        drop(second);
        assert!(ring.next_packet(second_offset, 24).unwrap().is_none());
        assert_eq!(ring.storage_used().unwrap(), 8352);

        assert!(ring.allocate_packets(8183).unwrap().is_none());

        let head3 = ring.allocate_packets(8181).unwrap().unwrap();
        let len3 = ring.packet_at(head3).packet_length().unwrap();
        assert_eq!(len3, 8192);
        let second3 = ring.next_packet(head3, len3).unwrap().unwrap();
        assert_eq!(second3.packet_length().unwrap(), 24);
        assert_eq!(second3.capacity().unwrap(), 7);
        drop(second3);

        assert_eq!(ring.storage_offset(), 40);
    }

    #[test]
    fn e3_reclaim_after_fill() {
        let mut ring = new_ring(16608);
        let head = ring.allocate_packets(100).unwrap().unwrap();
        ring.packet_at(head).mark_dead().unwrap();
        let reclaimed = ring.reclaim_head().unwrap();
        assert_eq!(reclaimed, 120);
    }

    #[test]
    fn e4_bulkhead_split() {
        let region_len = 2 * (1 << 20);
        let mut ring = new_ring(region_len);

        // Fill up to just short of the first bulkhead boundary, leaving
        // less than `maxPacketByteLength` remaining before it so the next
        // allocation must split across the boundary.
        loop {
            let used = ring.storage_used().unwrap();
            let absolute = ring.storage_offset() + used;
            if (1 << 20) - (absolute % (1 << 20)) <= packet::MAX_PACKET_LENGTH {
                break;
            }
            ring.allocate_packets(packet::MAX_CAPACITY).unwrap().unwrap();
        }

        let head = ring
            .allocate_packets(packet::MAX_PACKET_LENGTH)
            .unwrap()
            .unwrap();
        let len = ring.packet_at(head).packet_length().unwrap();
        let second = ring.next_packet(head, len).unwrap();
        if let Some(second) = second {
            // If a split occurred, the second packet must start exactly at
            // the bulkhead boundary.
            assert_eq!(second.offset() % (1 << 20), 0);
        }
    }

    #[test]
    fn reclaim_on_empty_ring_is_corrupt() {
        let mut ring = new_ring(16608);
        assert!(matches!(
            ring.reclaim_head(),
            Err(RingError::CorruptRing(_))
        ));
    }

    #[test]
    fn reclaim_non_dead_head_is_corrupt() {
        let mut ring = new_ring(16608);
        ring.allocate_packets(100).unwrap();
        assert!(matches!(
            ring.reclaim_head(),
            Err(RingError::CorruptRing(_))
        ));
    }
}
