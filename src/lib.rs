//! This crate contains a transaction engine for the CCSDS File Delivery Protocol (CFDP) as
//! specified in CCSDS 727.0-B-5, restricted to the unacknowledged transmission mode.
//!
//! The basic idea of CFDP is to convert files of any size into a stream of packets called packet
//! data units (PDU). A file copy operation is modelled as a transaction which is identified by
//! the [TransactionId]. The sending side of a transaction is represented by an outbound
//! file delivery unit (FDU) while the receiving side is represented by an inbound FDU. The
//! receiving side reassembles the file from possibly out-of-order, overlapping or duplicated file
//! segments and verifies the result with the checksum asserted by the sender.
//!
//! The core of this library is the [engine::Engine], an explicit context object which owns all
//! transaction state behind a single coarse lock. It is shared between the tasks which drive it:
//!
//! - A transport adapter task which calls [engine::Engine::dequeue_outbound_pdu] in a loop and
//!   moves the returned bytes to the remote entity. This call blocks until a PDU is ready.
//! - A transport adapter task which passes received bytes to
//!   [engine::Engine::handle_inbound_pdu].
//! - A periodic deadline scanner which calls [engine::Engine::overdue_transactions] and
//!   applies the reported faults with [engine::Engine::handle_fault].
//! - The user application which issues put, cancel, suspend, resume and report requests and
//!   consumes [event::CfdpEvent]s with [engine::Engine::get_event].
//!
//! # Examples
//!
//! The [end-to-end test](tests/end-to-end.rs) spawns a sending and a receiving engine on separate
//! threads which are connected by channels, and performs a small file copy operation with and
//! without transaction closure:
//!
//! ```sh
//! cargo test end_to_end_test_no_closure -- --nocapture
//! ```
//!
//! The `udp-loopback` demo does the same over two UDP sockets on the local host.
use core::fmt::{Display, Formatter};
use core::hash::{Hash, Hasher};

use crc::{Crc, CRC_16_IBM_3740, CRC_32_ISCSI};
use derive_new::new;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod checksum;
pub mod config;
pub mod engine;
pub mod entity;
pub mod event;
pub mod extents;
pub mod fault;
pub mod filestore;
pub mod inbound;
pub mod outbound;
pub mod pdu;
pub mod request;
pub mod signal;
pub mod time;

pub use spacepackets::cfdp::pdu::finished::{DeliveryCode, FileStatus};
pub use spacepackets::cfdp::{ChecksumType, ConditionCode, FaultHandlerCode, TransmissionMode};
pub use spacepackets::cfdp::tlv::FilestoreActionCode;

/// [crc::Crc] instance using [crc::CRC_16_IBM_3740], the CCITT polynomial 0x1021 with an initial
/// value of 0xFFFF. Used for the optional PDU trailer.
pub static CRC_16_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
/// [crc::Crc] instance using [crc::CRC_32_ISCSI].
///
/// SANA registry entry: <https://sanaregistry.org/r/checksum_identifiers/records/3>,
/// Entry in CRC catalogue: <https://reveng.sourceforge.io/crc-catalogue/all.htm#crc.cat.crc-32-iscsi>
pub static CRC_32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntityNumberError {
    #[error("invalid entity number length {0}, must be between 1 and 8")]
    InvalidLength(usize),
    #[error("value {value} does not fit into {length} bytes")]
    ValueTooLarge { value: u64, length: u8 },
}

/// Variable length big-endian unsigned number used for entity IDs and transaction sequence
/// numbers.
///
/// Between 1 and 8 bytes are meaningful. They are stored right-justified inside an 8 byte buffer.
/// Comparison, ordering and hashing only consider the numerical value, so the same value encoded
/// with different widths is considered equal.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EntityNumber {
    bytes: [u8; 8],
    length: u8,
}

impl EntityNumber {
    /// Create a number with the minimal width required to represent the value.
    pub const fn new(value: u64) -> Self {
        let significant_bits = 64 - value.leading_zeros();
        let mut length = ((significant_bits + 7) / 8) as u8;
        if length == 0 {
            length = 1;
        }
        Self {
            bytes: value.to_be_bytes(),
            length,
        }
    }

    pub fn with_length(value: u64, length: u8) -> Result<Self, EntityNumberError> {
        if length == 0 || length > 8 {
            return Err(EntityNumberError::InvalidLength(length as usize));
        }
        let minimal = Self::new(value);
        if minimal.length > length {
            return Err(EntityNumberError::ValueTooLarge { value, length });
        }
        Ok(Self {
            bytes: value.to_be_bytes(),
            length,
        })
    }

    /// Decode a number from its raw big-endian representation.
    pub fn from_be_slice(raw: &[u8]) -> Result<Self, EntityNumberError> {
        if raw.is_empty() || raw.len() > 8 {
            return Err(EntityNumberError::InvalidLength(raw.len()));
        }
        let mut bytes = [0; 8];
        bytes[8 - raw.len()..].copy_from_slice(raw);
        Ok(Self {
            bytes,
            length: raw.len() as u8,
        })
    }

    pub fn value(&self) -> u64 {
        u64::from_be_bytes(self.bytes)
    }

    /// Number of meaningful bytes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn as_be_slice(&self) -> &[u8] {
        &self.bytes[8 - self.len()..]
    }

    /// Append the number to the buffer, left-padded with zeros to the given width. The width
    /// is clamped to the range of valid lengths and never truncates the meaningful bytes.
    pub fn write_be(&self, width: usize, buf: &mut Vec<u8>) {
        let width = width.clamp(self.len(), 8);
        buf.extend_from_slice(&self.bytes[8 - width..]);
    }
}

impl Default for EntityNumber {
    fn default() -> Self {
        Self::new(0)
    }
}

impl From<u64> for EntityNumber {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl PartialEq for EntityNumber {
    fn eq(&self, other: &Self) -> bool {
        self.value() == other.value()
    }
}

impl Eq for EntityNumber {}

impl PartialOrd for EntityNumber {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntityNumber {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.value().cmp(&other.value())
    }
}

impl Hash for EntityNumber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value().hash(state);
    }
}

impl Display for EntityNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// A transaction is uniquely identified by the source entity and a sequence number which is
/// assigned by that source entity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, new)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TransactionId {
    source: EntityNumber,
    number: EntityNumber,
}

impl TransactionId {
    pub fn source(&self) -> EntityNumber {
        self.source
    }

    pub fn number(&self) -> EntityNumber {
        self.number
    }
}

impl Display for TransactionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.source, self.number)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::hash_map::DefaultHasher;
    use std::path::Path;

    use crate::config::EngineConfig;
    use crate::engine::Engine;
    use crate::entity::EntityProfile;
    use crate::filestore::NativeFilestore;
    use crate::time::ManualClock;

    use super::*;

    pub const LOCAL_ID: EntityNumber = EntityNumber::new(1);
    pub const REMOTE_ID: EntityNumber = EntityNumber::new(2);

    pub type TestEngine = Engine<NativeFilestore, ManualClock>;

    pub fn test_config(local: EntityNumber, working_dir: &Path) -> EngineConfig {
        let mut config = EngineConfig::new(local);
        config.working_dir = working_dir.to_path_buf();
        config
    }

    /// Engine with a single registered peer and a manual clock starting at 1000 seconds.
    pub fn engine_with_peer(
        local: EntityNumber,
        remote: EntityNumber,
        working_dir: &Path,
    ) -> TestEngine {
        let engine = Engine::with_filestore_and_clock(
            test_config(local, working_dir),
            NativeFilestore::default(),
            ManualClock::new(1000),
        )
        .expect("creating engine failed");
        engine
            .add_entity(&EntityProfile::new(
                remote,
                "bp".to_string(),
                "ipn:2.1".to_string(),
                10,
                ChecksumType::Modular as u8,
                ChecksumType::Modular as u8,
            ))
            .expect("adding entity failed");
        engine
    }

    fn hash_of<T: Hash>(value: &T) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }

    #[test]
    fn test_entity_number_minimal_length() {
        assert_eq!(EntityNumber::new(0).len(), 1);
        assert_eq!(EntityNumber::new(0xff).len(), 1);
        assert_eq!(EntityNumber::new(0x100).len(), 2);
        assert_eq!(EntityNumber::new(u64::MAX).len(), 8);
        assert_eq!(EntityNumber::new(0x0102).as_be_slice(), &[0x01, 0x02]);
    }

    #[test]
    fn test_entity_number_from_slice() {
        let number = EntityNumber::from_be_slice(&[0x00, 0x00, 0x12, 0x34]).unwrap();
        assert_eq!(number.len(), 4);
        assert_eq!(number.value(), 0x1234);
        assert_eq!(number.as_be_slice(), &[0x00, 0x00, 0x12, 0x34]);
        assert_eq!(
            EntityNumber::from_be_slice(&[]),
            Err(EntityNumberError::InvalidLength(0))
        );
        assert_eq!(
            EntityNumber::from_be_slice(&[0; 9]),
            Err(EntityNumberError::InvalidLength(9))
        );
    }

    #[test]
    fn test_entity_number_with_length() {
        let number = EntityNumber::with_length(5, 4).unwrap();
        assert_eq!(number.as_be_slice(), &[0, 0, 0, 5]);
        assert_eq!(
            EntityNumber::with_length(0x1_0000, 2),
            Err(EntityNumberError::ValueTooLarge {
                value: 0x1_0000,
                length: 2
            })
        );
        assert!(EntityNumber::with_length(1, 9).is_err());
    }

    #[test]
    fn test_entity_number_value_semantics() {
        let short = EntityNumber::new(5);
        let wide = EntityNumber::with_length(5, 8).unwrap();
        assert_eq!(short, wide);
        assert_eq!(hash_of(&short), hash_of(&wide));
        assert!(EntityNumber::new(4) < wide);
        assert_eq!(wide.to_string(), "5");
    }

    #[test]
    fn test_entity_number_write_padded() {
        let mut buf = Vec::new();
        EntityNumber::new(0x0a0b).write_be(4, &mut buf);
        assert_eq!(buf, [0, 0, 0x0a, 0x0b]);
        buf.clear();
        // Never truncates meaningful bytes.
        EntityNumber::new(0x0a0b).write_be(1, &mut buf);
        assert_eq!(buf, [0x0a, 0x0b]);
    }

    #[test]
    fn test_transaction_id() {
        let id = TransactionId::new(EntityNumber::new(1), EntityNumber::new(42));
        assert_eq!(id.source().value(), 1);
        assert_eq!(id.number().value(), 42);
        assert_eq!(id.to_string(), "1:42");
        let same = TransactionId::new(
            EntityNumber::with_length(1, 2).unwrap(),
            EntityNumber::with_length(42, 4).unwrap(),
        );
        assert_eq!(id, same);
        assert_eq!(hash_of(&id), hash_of(&same));
    }

    #[test]
    fn test_crc16_check_value() {
        // Check value of CRC-16/IBM-3740 (CCITT-FALSE).
        assert_eq!(CRC_16_CCITT.checksum(b"123456789"), 0x29b1);
    }

    #[test]
    fn test_crc32c_check_value() {
        assert_eq!(CRC_32C.checksum(b"123456789"), 0xe306_9283);
    }
}
