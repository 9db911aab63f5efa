//! CRC-64/ECMA (a.k.a. CRC-64/XZ) checksum, table-driven, matching Go's
//! `hash/crc64` with `crc64.MakeTable(crc64.ECMA)`.
//!
//! The packet codec needs two different shapes of this checksum: a one-shot
//! digest over a fixed header buffer ([`checksum`]), and a running digest
//! that can be peeked without resetting as more content is written
//! ([`RunningChecksum`]) so multi-packet sequences can be verified with a
//! single hasher threaded across packets. A crate-provided `Digest` only
//! exposes a consuming `finalize`, which can't express that peek, so the
//! table and register arithmetic are reproduced here directly from the
//! algorithm definition instead.

const POLY: u64 = 0xc96c_5795_d787_0f42;

const fn build_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 == 1 {
                (crc >> 1) ^ POLY
            } else {
                crc >> 1
            };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static TABLE: [u64; 256] = build_table();

fn update(register: u64, bytes: &[u8]) -> u64 {
    let mut crc = register;
    for &b in bytes {
        crc = TABLE[((crc ^ b as u64) & 0xff) as usize] ^ (crc >> 8);
    }
    crc
}

/// One-shot CRC-64/ECMA over a single buffer.
pub fn checksum(bytes: &[u8]) -> u64 {
    let mut digest = RunningChecksum::new();
    digest.update(bytes);
    digest.sum64()
}

/// A running CRC-64/ECMA digest that can be written to incrementally and
/// peeked at any point without disturbing further accumulation, mirroring
/// Go's `hash.Hash64.Sum64()` semantics.
#[derive(Debug, Clone)]
pub struct RunningChecksum {
    register: u64,
}

impl RunningChecksum {
    /// A fresh digest, equivalent to `crc64.New(table)`.
    pub fn new() -> Self {
        RunningChecksum { register: !0u64 }
    }

    /// Feed more bytes into the running digest.
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.register = update(self.register, bytes);
        self
    }

    /// The digest of everything written so far, without resetting it.
    pub fn sum64(&self) -> u64 {
        self.register ^ !0u64
    }
}

impl Default for RunningChecksum {
    fn default() -> Self {
        Self::new()
    }
}
