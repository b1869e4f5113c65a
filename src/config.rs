use std::path::PathBuf;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use spacepackets::cfdp::ChecksumType;

use crate::checksum;
use crate::entity::TransportKind;
use crate::fault::FaultHandlerTable;
use crate::pdu::{FIXED_HEADER_LEN, MAX_SEGMENT_METADATA_LEN};
use crate::EntityNumber;

/// Largest amount of file data which may be carried by a single File Data PDU.
pub const MAX_SEGMENT_LEN: usize = 65000;

/// Largest overhead of a File Data PDU: a header with 8 byte entity and transaction numbers,
/// the longest segment metadata prefix, a large file offset and the CRC.
pub const MAX_FILE_DATA_OVERHEAD: usize =
    FIXED_HEADER_LEN + 3 * 8 + 1 + MAX_SEGMENT_METADATA_LEN + 8 + 2;

/// Smallest accepted PDU length. At least one byte of file data fits into every File Data PDU.
pub const MIN_PDU_LEN: usize = MAX_FILE_DATA_OVERHEAD + 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("maximum file data length {0} is not between 1 and {MAX_SEGMENT_LEN}")]
    InvalidMaxFileDataLen(usize),
    #[error("maximum PDU length {0} is smaller than {MIN_PDU_LEN}")]
    InvalidMaxPduLen(usize),
    #[error("at least one outbound buffer unit is required")]
    NoBufferUnits,
    #[error("event queue capacity must not be zero")]
    NoEventCapacity,
    #[error("maximum transaction number must not be zero")]
    InvalidMaxTransactionNumber,
    #[error("default checksum type {0:?} is not supported")]
    UnsupportedChecksum(ChecksumType),
}

/// Configuration of the local CFDP entity.
///
/// ## Fields
///
/// * `local_entity` - Entity number of the local entity. PDUs addressed to other entities are
///    dropped.
/// * `max_transaction_number` - Transaction numbers start at 1 and wrap around after this value.
///    Defaults to 999 999 999.
/// * `fill_byte` - Used to pad gaps between the end of the received data and the start of a
///    newly received segment. Defaults to 0xAA.
/// * `discard_incomplete_file` - Remove the working file of transactions which did not complete
///    successfully. Defaults to true.
/// * `crc_required` - Append a CRC16 to all generated PDUs. Defaults to false.
/// * `max_file_data_len` - Default segment length for outbound file data. Defaults to 65000.
/// * `max_pdu_len` - Size of one outbound buffer unit. Defaults to 65536.
/// * `outbound_buffer_units` - Number of outbound buffer units in the flow-controlled pool.
///    Defaults to 64.
/// * `max_events` - Capacity of the event queue. The oldest event is dropped when the queue
///    is full. Defaults to 256.
/// * `transaction_inactivity_limit` - Seconds after the last received PDU before an inbound
///    transaction is considered inactive. Defaults to 2 000 000 000.
/// * `check_timer_period` - Seconds between checks for an inbound transaction which received
///    its EOF but is missing file data. Defaults to 86400.
/// * `check_timeout_limit` - Number of check timer expirations before the check limit fault is
///    raised. Defaults to 7.
/// * `default_transport` - Transport used for entities registered automatically by inbound PDUs.
///    Defaults to [TransportKind::Bp].
/// * `default_checksum` - Checksum type used for automatically registered entities and as the
///    fallback for invalid outbound checksum types. Defaults to [ChecksumType::Modular].
/// * `working_dir` - Directory for working files and base of relative file names.
///    Defaults to the current directory.
/// * `fault_handlers` - Global fault handler table, see [FaultHandlerTable].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineConfig {
    pub local_entity: EntityNumber,
    pub max_transaction_number: u64,
    pub fill_byte: u8,
    pub discard_incomplete_file: bool,
    pub crc_required: bool,
    pub max_file_data_len: usize,
    pub max_pdu_len: usize,
    pub outbound_buffer_units: usize,
    pub max_events: usize,
    pub transaction_inactivity_limit: u64,
    pub check_timer_period: u64,
    pub check_timeout_limit: u32,
    pub default_transport: TransportKind,
    pub default_checksum: ChecksumType,
    pub working_dir: PathBuf,
    pub fault_handlers: FaultHandlerTable,
}

impl EngineConfig {
    pub fn new(local_entity: EntityNumber) -> Self {
        Self {
            local_entity,
            max_transaction_number: 999_999_999,
            fill_byte: 0xAA,
            discard_incomplete_file: true,
            crc_required: false,
            max_file_data_len: MAX_SEGMENT_LEN,
            max_pdu_len: 65536,
            outbound_buffer_units: 64,
            max_events: 256,
            transaction_inactivity_limit: 2_000_000_000,
            check_timer_period: 86400,
            check_timeout_limit: 7,
            default_transport: TransportKind::Bp,
            default_checksum: ChecksumType::Modular,
            working_dir: PathBuf::from("."),
            fault_handlers: FaultHandlerTable::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_file_data_len == 0 || self.max_file_data_len > MAX_SEGMENT_LEN {
            return Err(ConfigError::InvalidMaxFileDataLen(self.max_file_data_len));
        }
        if self.max_pdu_len < MIN_PDU_LEN {
            return Err(ConfigError::InvalidMaxPduLen(self.max_pdu_len));
        }
        if self.outbound_buffer_units == 0 {
            return Err(ConfigError::NoBufferUnits);
        }
        if self.max_events == 0 {
            return Err(ConfigError::NoEventCapacity);
        }
        if self.max_transaction_number == 0 {
            return Err(ConfigError::InvalidMaxTransactionNumber);
        }
        if !checksum::is_supported(self.default_checksum) {
            return Err(ConfigError::UnsupportedChecksum(self.default_checksum));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use spacepackets::cfdp::{ConditionCode, FaultHandlerCode};

    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::new(EntityNumber::new(3));
        assert_eq!(config.local_entity.value(), 3);
        assert_eq!(config.fill_byte, 0xAA);
        assert!(config.discard_incomplete_file);
        assert_eq!(config.max_transaction_number, 999_999_999);
        assert_eq!(config.check_timeout_limit, 7);
        assert_eq!(config.default_transport, TransportKind::Bp);
        assert_eq!(
            config
                .fault_handlers
                .get_fault_handler(ConditionCode::CheckLimitReached),
            FaultHandlerCode::NoticeOfCancellation
        );
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_invalid_values() {
        let mut config = EngineConfig::new(EntityNumber::new(3));
        config.max_file_data_len = MAX_SEGMENT_LEN + 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxFileDataLen(MAX_SEGMENT_LEN + 1))
        );
        config.max_file_data_len = 1024;
        config.max_pdu_len = 10;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxPduLen(10)));
        config.max_pdu_len = MAX_FILE_DATA_OVERHEAD;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxPduLen(MAX_FILE_DATA_OVERHEAD))
        );
        config.max_pdu_len = MIN_PDU_LEN;
        assert_eq!(config.validate(), Ok(()));
        config.max_pdu_len = 2048;
        config.outbound_buffer_units = 0;
        assert_eq!(config.validate(), Err(ConfigError::NoBufferUnits));
        config.outbound_buffer_units = 1;
        config.default_checksum = ChecksumType::Crc32;
        assert_eq!(
            config.validate(),
            Err(ConfigError::UnsupportedChecksum(ChecksumType::Crc32))
        );
    }
}
