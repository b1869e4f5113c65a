//! Incremental file checksum computation.
//!
//! The receiving side of a transaction accumulates the checksum while file data arrives, one
//! write at a time. The modular checksum is independent of the arrival order because every byte
//! is added at its positional shift. CRC32C is only order independent if the file data arrives
//! in order, so the accumulator tracks whether all data so far formed one contiguous prefix.
//! If that is not the case, the final value must be computed from the reassembled file.
use core::fmt::{Debug, Formatter};

use crc::Digest;
use spacepackets::cfdp::ChecksumType;

use crate::CRC_32C;

/// Checksum types which this engine can compute.
pub const SUPPORTED_CHECKSUM_TYPES: [ChecksumType; 3] = [
    ChecksumType::Modular,
    ChecksumType::Crc32C,
    ChecksumType::NullChecksum,
];

pub fn is_supported(checksum_type: ChecksumType) -> bool {
    SUPPORTED_CHECKSUM_TYPES.contains(&checksum_type)
}

/// Convert a raw checksum type code into a supported [ChecksumType].
pub fn supported_from_raw(raw: u8) -> Option<ChecksumType> {
    ChecksumType::try_from(raw)
        .ok()
        .filter(|checksum_type| is_supported(*checksum_type))
}

/// Add a single byte located at the given file offset to a modular checksum.
#[inline]
pub fn add_modular_byte(checksum: u32, offset: u64, byte: u8) -> u32 {
    let shift = 8 * (3 - (offset & 3) as u32);
    checksum.wrapping_add((byte as u32) << shift)
}

/// Add a slice of file data starting at the given file offset to a modular checksum.
pub fn add_modular(mut checksum: u32, offset: u64, data: &[u8]) -> u32 {
    for (idx, byte) in data.iter().enumerate() {
        checksum = add_modular_byte(checksum, offset + idx as u64, *byte);
    }
    checksum
}

#[derive(Clone)]
enum State {
    Modular(u32),
    Crc32C {
        digest: Digest<'static, u32>,
        next_offset: u64,
        contiguous: bool,
    },
    Null,
}

/// Running checksum for the file data of one transaction.
#[derive(Clone)]
pub struct ChecksumAccumulator {
    checksum_type: ChecksumType,
    state: State,
    bytes_added: u64,
}

impl ChecksumAccumulator {
    /// Returns [None] for checksum types which are not supported.
    pub fn new(checksum_type: ChecksumType) -> Option<Self> {
        let state = match checksum_type {
            ChecksumType::Modular => State::Modular(0),
            ChecksumType::Crc32C => State::Crc32C {
                digest: CRC_32C.digest(),
                next_offset: 0,
                contiguous: true,
            },
            ChecksumType::NullChecksum => State::Null,
            _ => return None,
        };
        Some(Self {
            checksum_type,
            state,
            bytes_added: 0,
        })
    }

    pub fn checksum_type(&self) -> ChecksumType {
        self.checksum_type
    }

    /// Whether any file data was added yet. The checksum type is fixed afterwards.
    pub fn has_data(&self) -> bool {
        self.bytes_added > 0
    }

    pub fn add(&mut self, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.bytes_added += data.len() as u64;
        match &mut self.state {
            State::Modular(checksum) => *checksum = add_modular(*checksum, offset, data),
            State::Crc32C {
                digest,
                next_offset,
                contiguous,
            } => {
                if *contiguous && offset == *next_offset {
                    digest.update(data);
                    *next_offset += data.len() as u64;
                } else {
                    *contiguous = false;
                }
            }
            State::Null => (),
        }
    }

    /// Current checksum value. Returns [None] if the value can not be derived incrementally
    /// because CRC32C data arrived out of order.
    pub fn value(&self) -> Option<u32> {
        match &self.state {
            State::Modular(checksum) => Some(*checksum),
            State::Crc32C {
                digest, contiguous, ..
            } => {
                if *contiguous {
                    Some(digest.clone().finalize())
                } else {
                    None
                }
            }
            State::Null => Some(0),
        }
    }
}

/// Modular checksum, the CFDP default.
impl Default for ChecksumAccumulator {
    fn default() -> Self {
        Self {
            checksum_type: ChecksumType::Modular,
            state: State::Modular(0),
            bytes_added: 0,
        }
    }
}

impl Debug for ChecksumAccumulator {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChecksumAccumulator")
            .field("checksum_type", &self.checksum_type)
            .field("bytes_added", &self.bytes_added)
            .field("value", &self.value())
            .finish()
    }
}

/// One-shot checksum of a complete file image starting at offset 0.
pub fn calculate(checksum_type: ChecksumType, data: &[u8]) -> Option<u32> {
    let mut accumulator = ChecksumAccumulator::new(checksum_type)?;
    accumulator.add(0, data);
    accumulator.value()
}
