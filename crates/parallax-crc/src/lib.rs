#![cfg_attr(not(any(test, feature = "std")), no_std)]

//! Table driven CRC routines with the fixed seeds the parallax backend expects.
//!
//! Neither routine is a catalogued CRC variant: [`crc16`] is the CCITT
//! polynomial processed MSB-first from seed `0xDEAD`, and [`crc32`] is the
//! reflected Castagnoli polynomial seeded with `0xBABE` and no final xor.
//! Both are used on the wire, so the tables and seeds must never change.

/// Seed for [`crc16`].
pub const CRC16_SEED: u16 = 0xDEAD;

/// Seed for [`crc32`].
pub const CRC32_SEED: u32 = 0xBABE;

const CRC16_POLY: u16 = 0x1021;
const CRC32_POLY_REFLECTED: u32 = 0x82F6_3B78;

/// Lookup table for [`crc16`].
pub static CRC16_TABLE: [u16; 256] = crc16_table();

/// Lookup table for [`crc32`].
pub static CRC32_TABLE: [u32; 256] = crc32_table();

const fn crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ CRC16_POLY
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32_POLY_REFLECTED
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC16 over `data`, MSB-first, one byte at a time.
///
/// An empty input returns the seed.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(CRC16_SEED, |crc, &b| {
        (crc << 8) ^ CRC16_TABLE[usize::from(((crc >> 8) ^ u16::from(b)) as u8)]
    })
}

/// Reflected CRC32 over `data`.
///
/// An empty input returns the seed.
pub fn crc32(data: &[u8]) -> u32 {
    data.iter().fold(CRC32_SEED, |crc, &b| {
        CRC32_TABLE[usize::from((crc ^ u32::from(b)) as u8)] ^ (crc >> 8)
    })
}

/// Running CRC32, for inputs that arrive in pieces (e.g. a firmware image
/// read back block by block).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc32 {
    state: u32,
}

impl Crc32 {
    pub const fn new() -> Self {
        Self { state: CRC32_SEED }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.state = data.iter().fold(self.state, |crc, &b| {
            CRC32_TABLE[usize::from((crc ^ u32::from(b)) as u8)] ^ (crc >> 8)
        });
    }

    pub const fn finish(&self) -> u32 {
        self.state
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}
