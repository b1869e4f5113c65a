//! Wire codec for the PDUs used by unacknowledged transactions.
//!
//! Every PDU starts with the fixed [PduHeader]. A file directive PDU continues with its directive
//! code and parameters, a file data PDU with the optional segment metadata prefix, the file offset
//! and the file data. Offsets and file sizes are 8 bytes wide if the large file flag is set and
//! 4 bytes wide otherwise. If the CRC flag is set, a CRC16 over the whole PDU is appended and
//! counted in the data field length.
use smallvec::SmallVec;
use spacepackets::cfdp::pdu::finished::{DeliveryCode, FileStatus};
use spacepackets::cfdp::pdu::FileDirectiveType;
use spacepackets::cfdp::tlv::{FilestoreActionCode, TlvType};
use spacepackets::cfdp::{ConditionCode, Direction, PduType, TransmissionMode};

use crate::filestore::{has_second_name, FilestoreRequest, FilestoreResponse};
use crate::{EntityNumber, EntityNumberError, CRC_16_CCITT};

pub const CFDP_VERSION: u8 = 0b001;
/// Fixed part of the header preceding the entity and transaction numbers.
pub const FIXED_HEADER_LEN: usize = 4;
pub const MAX_SEGMENT_METADATA_LEN: usize = 63;
pub const MAX_LV_LEN: usize = u8::MAX as usize;

const TLV_FILESTORE_REQUEST: u8 = TlvType::FilestoreRequest as u8;
const TLV_FILESTORE_RESPONSE: u8 = TlvType::FilestoreResponse as u8;
const TLV_MESSAGE_TO_USER: u8 = TlvType::MsgToUser as u8;
const TLV_FAULT_HANDLER: u8 = TlvType::FaultHandler as u8;
const TLV_FLOW_LABEL: u8 = TlvType::FlowLabel as u8;
const TLV_ENTITY_ID: u8 = TlvType::EntityId as u8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PduError {
    #[error("PDU truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("unsupported CFDP version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid entity number: {0}")]
    EntityNumber(#[from] EntityNumberError),
    #[error("CRC mismatch")]
    CrcMismatch,
    #[error("data field length {0} exceeds the 16 bit length field")]
    DataFieldTooLarge(usize),
    #[error("LV value of {0} bytes exceeds 255 bytes")]
    ValueTooLong(usize),
    #[error("file name is not valid UTF-8")]
    InvalidFileName,
    #[error("segment metadata of {0} bytes exceeds {MAX_SEGMENT_METADATA_LEN} bytes")]
    SegmentMetadataTooLong(usize),
    #[error("file size {0} requires the large file flag")]
    FileSizeTooLarge(u64),
    #[error("invalid directive code {0}")]
    InvalidDirective(u8),
    #[error("invalid TLV type {0}")]
    InvalidTlvType(u8),
    #[error("invalid filestore action {0}")]
    InvalidFilestoreAction(u8),
    #[error("invalid condition code {0}")]
    InvalidConditionCode(u8),
    #[error("invalid delivery status byte {0:#04x}")]
    InvalidDeliveryStatus(u8),
    #[error("file segment of {length} bytes at offset {offset} exceeds the maximum file size")]
    SegmentOutOfRange { offset: u64, length: u64 },
}

/// Fixed PDU header. The data field length is derived when the PDU is assembled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PduHeader {
    pub pdu_type: PduType,
    pub direction: Direction,
    pub transmission_mode: TransmissionMode,
    pub crc_flag: bool,
    pub large_file: bool,
    pub record_boundaries_respected: bool,
    pub segment_metadata: bool,
    pub source: EntityNumber,
    pub transaction_number: EntityNumber,
    pub destination: EntityNumber,
}

impl PduHeader {
    /// Header for a PDU of an unacknowledged transaction.
    pub fn new_unacknowledged(
        pdu_type: PduType,
        direction: Direction,
        source: EntityNumber,
        transaction_number: EntityNumber,
        destination: EntityNumber,
    ) -> Self {
        Self {
            pdu_type,
            direction,
            transmission_mode: TransmissionMode::Unacknowledged,
            crc_flag: false,
            large_file: false,
            record_boundaries_respected: false,
            segment_metadata: false,
            source,
            transaction_number,
            destination,
        }
    }

    /// Source and destination entity numbers share the same width on the wire.
    pub fn entity_width(&self) -> usize {
        self.source.len().max(self.destination.len())
    }

    pub fn header_len(&self) -> usize {
        FIXED_HEADER_LEN + 2 * self.entity_width() + self.transaction_number.len()
    }

    pub fn write(&self, data_field_len: u16, buf: &mut Vec<u8>) {
        let entity_width = self.entity_width();
        let mut flags = CFDP_VERSION << 5;
        if self.pdu_type == PduType::FileData {
            flags |= 1 << 4;
        }
        if self.direction == Direction::TowardsSender {
            flags |= 1 << 3;
        }
        if self.transmission_mode == TransmissionMode::Unacknowledged {
            flags |= 1 << 2;
        }
        if self.crc_flag {
            flags |= 1 << 1;
        }
        if self.large_file {
            flags |= 1;
        }
        buf.push(flags);
        buf.extend_from_slice(&data_field_len.to_be_bytes());
        let mut lengths =
            (((entity_width - 1) as u8) << 4) | (self.transaction_number.len() - 1) as u8;
        if self.record_boundaries_respected {
            lengths |= 1 << 7;
        }
        if self.segment_metadata {
            lengths |= 1 << 3;
        }
        buf.push(lengths);
        self.source.write_be(entity_width, buf);
        self.transaction_number
            .write_be(self.transaction_number.len(), buf);
        self.destination.write_be(entity_width, buf);
    }

    /// Returns the header, the header length and the data field length.
    pub fn from_bytes(raw: &[u8]) -> Result<(Self, usize, usize), PduError> {
        check_len(raw, FIXED_HEADER_LEN)?;
        let version = raw[0] >> 5;
        if version != CFDP_VERSION {
            return Err(PduError::UnsupportedVersion(version));
        }
        let data_field_len = u16::from_be_bytes([raw[1], raw[2]]) as usize;
        let entity_width = (((raw[3] >> 4) & 0b111) + 1) as usize;
        let transaction_width = ((raw[3] & 0b111) + 1) as usize;
        let header_len = FIXED_HEADER_LEN + 2 * entity_width + transaction_width;
        check_len(raw, header_len)?;
        let mut pos = FIXED_HEADER_LEN;
        let mut next_number = |width: usize| {
            let number = EntityNumber::from_be_slice(&raw[pos..pos + width]);
            pos += width;
            number
        };
        let source = next_number(entity_width)?;
        let transaction_number = next_number(transaction_width)?;
        let destination = next_number(entity_width)?;
        let header = Self {
            pdu_type: if raw[0] & (1 << 4) != 0 {
                PduType::FileData
            } else {
                PduType::FileDirective
            },
            direction: if raw[0] & (1 << 3) != 0 {
                Direction::TowardsSender
            } else {
                Direction::TowardsReceiver
            },
            transmission_mode: if raw[0] & (1 << 2) != 0 {
                TransmissionMode::Unacknowledged
            } else {
                TransmissionMode::Acknowledged
            },
            crc_flag: raw[0] & (1 << 1) != 0,
            large_file: raw[0] & 1 != 0,
            record_boundaries_respected: raw[3] & (1 << 7) != 0,
            segment_metadata: raw[3] & (1 << 3) != 0,
            source,
            transaction_number,
            destination,
        };
        Ok((header, header_len, data_field_len))
    }
}

fn check_len(raw: &[u8], expected: usize) -> Result<(), PduError> {
    if raw.len() < expected {
        return Err(PduError::Truncated {
            expected,
            found: raw.len(),
        });
    }
    Ok(())
}

/// Serialize a complete PDU from its header and data field. The CRC is appended if the header
/// has the CRC flag set.
pub fn assemble(header: &PduHeader, data_field: &[u8]) -> Result<Vec<u8>, PduError> {
    let crc_len = if header.crc_flag { 2 } else { 0 };
    let data_field_len = data_field.len() + crc_len;
    if data_field_len > u16::MAX as usize {
        return Err(PduError::DataFieldTooLarge(data_field_len));
    }
    let mut buf = Vec::with_capacity(header.header_len() + data_field_len);
    header.write(data_field_len as u16, &mut buf);
    buf.extend_from_slice(data_field);
    if header.crc_flag {
        let crc = CRC_16_CCITT.checksum(&buf);
        buf.extend_from_slice(&crc.to_be_bytes());
    }
    Ok(buf)
}

/// Parsed header with a reference to the data field, excluding the CRC.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RawPdu<'raw> {
    pub header: PduHeader,
    pub data_field: &'raw [u8],
}

impl<'raw> RawPdu<'raw> {
    /// Directive code and parameters of a file directive PDU.
    pub fn directive(&self) -> Result<(FileDirectiveType, &'raw [u8]), PduError> {
        check_len(self.data_field, 1)?;
        let code = self.data_field[0];
        let directive =
            FileDirectiveType::try_from(code).map_err(|_| PduError::InvalidDirective(code))?;
        Ok((directive, &self.data_field[1..]))
    }
}

/// Parse the header and verify the CRC if one is present. Bytes following the PDU are ignored.
pub fn parse_pdu(raw: &[u8]) -> Result<RawPdu<'_>, PduError> {
    let (header, header_len, data_field_len) = PduHeader::from_bytes(raw)?;
    let total_len = header_len + data_field_len;
    check_len(raw, total_len)?;
    let mut data_end = total_len;
    if header.crc_flag {
        if data_field_len < 2 {
            return Err(PduError::Truncated {
                expected: header_len + 2,
                found: total_len,
            });
        }
        data_end -= 2;
        let expected = u16::from_be_bytes([raw[data_end], raw[data_end + 1]]);
        if CRC_16_CCITT.checksum(&raw[..data_end]) != expected {
            return Err(PduError::CrcMismatch);
        }
    }
    Ok(RawPdu {
        header,
        data_field: &raw[header_len..data_end],
    })
}

struct Reader<'raw> {
    raw: &'raw [u8],
    pos: usize,
}

impl<'raw> Reader<'raw> {
    fn new(raw: &'raw [u8]) -> Self {
        Self { raw, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'raw [u8], PduError> {
        check_len(self.raw, self.pos + len)?;
        let slice = &self.raw[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, PduError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, PduError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// File size sensitive value: an offset or a file size.
    fn fss(&mut self, large_file: bool) -> Result<u64, PduError> {
        if !large_file {
            return Ok(self.u32()? as u64);
        }
        let raw = self.take(8)?;
        let mut bytes = [0; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_be_bytes(bytes))
    }

    fn lv(&mut self) -> Result<&'raw [u8], PduError> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    fn lv_string(&mut self) -> Result<Option<String>, PduError> {
        let raw = self.lv()?;
        if raw.is_empty() {
            return Ok(None);
        }
        core::str::from_utf8(raw)
            .map(|name| Some(name.to_string()))
            .map_err(|_| PduError::InvalidFileName)
    }

    fn remaining(&mut self) -> &'raw [u8] {
        let rest = &self.raw[self.pos.min(self.raw.len())..];
        self.pos = self.raw.len();
        rest
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.raw.len()
    }
}

fn write_fss(buf: &mut Vec<u8>, large_file: bool, value: u64) -> Result<(), PduError> {
    if large_file {
        buf.extend_from_slice(&value.to_be_bytes());
        return Ok(());
    }
    let value = u32::try_from(value).map_err(|_| PduError::FileSizeTooLarge(value))?;
    buf.extend_from_slice(&value.to_be_bytes());
    Ok(())
}

fn write_lv(buf: &mut Vec<u8>, value: &[u8]) -> Result<(), PduError> {
    if value.len() > MAX_LV_LEN {
        return Err(PduError::ValueTooLong(value.len()));
    }
    buf.push(value.len() as u8);
    buf.extend_from_slice(value);
    Ok(())
}

fn write_lv_str(buf: &mut Vec<u8>, value: Option<&str>) -> Result<(), PduError> {
    write_lv(buf, value.unwrap_or_default().as_bytes())
}

fn condition_from_raw(raw: u8) -> Result<ConditionCode, PduError> {
    ConditionCode::try_from(raw).map_err(|_| PduError::InvalidConditionCode(raw))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tlv {
    FilestoreRequest(FilestoreRequest),
    FilestoreResponse(FilestoreResponse),
    MessageToUser(Vec<u8>),
    /// Raw condition code and raw fault handler code.
    FaultHandlerOverride { condition: u8, handler: u8 },
    FlowLabel(Vec<u8>),
    EntityId(EntityNumber),
}

impl Tlv {
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<(), PduError> {
        let mut value = Vec::new();
        let tlv_type = match self {
            Tlv::FilestoreRequest(request) => {
                value.push((request.action as u8) << 4);
                write_lv_str(&mut value, Some(request.first_name.as_str()))?;
                if has_second_name(request.action) {
                    write_lv_str(&mut value, request.second_name.as_deref())?;
                }
                TLV_FILESTORE_REQUEST
            }
            Tlv::FilestoreResponse(response) => {
                value.push(((response.action as u8) << 4) | (response.status & 0x0f));
                write_lv_str(&mut value, Some(response.first_name.as_str()))?;
                if has_second_name(response.action) {
                    write_lv_str(&mut value, response.second_name.as_deref())?;
                }
                write_lv_str(&mut value, response.message.as_deref())?;
                TLV_FILESTORE_RESPONSE
            }
            Tlv::MessageToUser(message) => {
                value.extend_from_slice(message);
                TLV_MESSAGE_TO_USER
            }
            Tlv::FaultHandlerOverride { condition, handler } => {
                value.push((*condition << 4) | (*handler & 0x0f));
                TLV_FAULT_HANDLER
            }
            Tlv::FlowLabel(label) => {
                value.extend_from_slice(label);
                TLV_FLOW_LABEL
            }
            Tlv::EntityId(entity) => {
                value.extend_from_slice(entity.as_be_slice());
                TLV_ENTITY_ID
            }
        };
        buf.push(tlv_type);
        write_lv(buf, &value)
    }

    fn parse(tlv_type: u8, value: &[u8]) -> Result<Self, PduError> {
        let mut reader = Reader::new(value);
        Ok(match tlv_type {
            TLV_FILESTORE_REQUEST => {
                let action = filestore_action(reader.u8()? >> 4)?;
                let first_name = reader.lv_string()?.unwrap_or_default();
                let second_name = if has_second_name(action) {
                    reader.lv_string()?
                } else {
                    None
                };
                Tlv::FilestoreRequest(FilestoreRequest::new(action, first_name, second_name))
            }
            TLV_FILESTORE_RESPONSE => {
                let first = reader.u8()?;
                let action = filestore_action(first >> 4)?;
                let first_name = reader.lv_string()?.unwrap_or_default();
                let second_name = if has_second_name(action) {
                    reader.lv_string()?
                } else {
                    None
                };
                let message = if reader.is_empty() {
                    None
                } else {
                    reader.lv_string()?
                };
                Tlv::FilestoreResponse(FilestoreResponse::new(
                    action,
                    first & 0x0f,
                    first_name,
                    second_name,
                    message,
                ))
            }
            TLV_MESSAGE_TO_USER => Tlv::MessageToUser(value.to_vec()),
            TLV_FAULT_HANDLER => {
                let raw = reader.u8()?;
                Tlv::FaultHandlerOverride {
                    condition: raw >> 4,
                    handler: raw & 0x0f,
                }
            }
            TLV_FLOW_LABEL => Tlv::FlowLabel(value.to_vec()),
            TLV_ENTITY_ID => Tlv::EntityId(EntityNumber::from_be_slice(value)?),
            _ => return Err(PduError::InvalidTlvType(tlv_type)),
        })
    }
}

fn filestore_action(raw: u8) -> Result<FilestoreActionCode, PduError> {
    FilestoreActionCode::try_from(raw).map_err(|_| PduError::InvalidFilestoreAction(raw))
}

/// Parse TLVs until the data is exhausted. Parsing stops at the first malformed TLV and the
/// TLVs parsed before are returned.
pub fn parse_tlvs(raw: &[u8]) -> Vec<Tlv> {
    let mut tlvs = Vec::new();
    let mut reader = Reader::new(raw);
    while !reader.is_empty() {
        match next_tlv(&mut reader) {
            Ok(tlv) => tlvs.push(tlv),
            Err(e) => {
                log::debug!("stopping TLV parsing: {e}");
                break;
            }
        }
    }
    tlvs
}

fn next_tlv(reader: &mut Reader<'_>) -> Result<Tlv, PduError> {
    let tlv_type = reader.u8()?;
    let value = reader.lv()?;
    Tlv::parse(tlv_type, value)
}

fn fault_location(tlvs: &[Tlv]) -> Option<EntityNumber> {
    tlvs.iter().find_map(|tlv| match tlv {
        Tlv::EntityId(entity) => Some(*entity),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPdu {
    pub closure_requested: bool,
    /// Raw checksum type. Validated by the receiving side.
    pub checksum_type: u8,
    pub file_size: u64,
    pub source_file: Option<String>,
    pub dest_file: Option<String>,
    pub tlvs: Vec<Tlv>,
}

impl MetadataPdu {
    /// Serialize the directive code and parameters.
    pub fn to_bytes(&self, large_file: bool) -> Result<Vec<u8>, PduError> {
        let mut buf = vec![FileDirectiveType::MetadataPdu as u8];
        buf.push(((self.closure_requested as u8) << 6) | (self.checksum_type & 0x0f));
        write_fss(&mut buf, large_file, self.file_size)?;
        write_lv_str(&mut buf, self.source_file.as_deref())?;
        write_lv_str(&mut buf, self.dest_file.as_deref())?;
        for tlv in &self.tlvs {
            tlv.write(&mut buf)?;
        }
        Ok(buf)
    }

    pub fn from_params(params: &[u8], large_file: bool) -> Result<Self, PduError> {
        let mut reader = Reader::new(params);
        let first = reader.u8()?;
        let file_size = reader.fss(large_file)?;
        let source_file = reader.lv_string()?;
        let dest_file = reader.lv_string()?;
        Ok(Self {
            closure_requested: first & (1 << 6) != 0,
            checksum_type: first & 0x0f,
            file_size,
            source_file,
            dest_file,
            tlvs: parse_tlvs(reader.remaining()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EofPdu {
    pub condition: ConditionCode,
    pub checksum: u32,
    pub file_size: u64,
    /// Only transmitted if the condition is not [ConditionCode::NoError].
    pub fault_location: Option<EntityNumber>,
}

impl EofPdu {
    pub fn to_bytes(&self, large_file: bool) -> Result<Vec<u8>, PduError> {
        let mut buf = vec![FileDirectiveType::EofPdu as u8, (self.condition as u8) << 4];
        buf.extend_from_slice(&self.checksum.to_be_bytes());
        write_fss(&mut buf, large_file, self.file_size)?;
        if self.condition != ConditionCode::NoError {
            if let Some(entity) = self.fault_location {
                Tlv::EntityId(entity).write(&mut buf)?;
            }
        }
        Ok(buf)
    }

    pub fn from_params(params: &[u8], large_file: bool) -> Result<Self, PduError> {
        let mut reader = Reader::new(params);
        let condition = condition_from_raw(reader.u8()? >> 4)?;
        let checksum = reader.u32()?;
        let file_size = reader.fss(large_file)?;
        let fault_location = if condition != ConditionCode::NoError {
            fault_location(&parse_tlvs(reader.remaining()))
        } else {
            None
        };
        Ok(Self {
            condition,
            checksum,
            file_size,
            fault_location,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishPdu {
    pub condition: ConditionCode,
    pub delivery_code: DeliveryCode,
    pub file_status: FileStatus,
    pub filestore_responses: Vec<FilestoreResponse>,
    /// Only transmitted if the condition is not [ConditionCode::NoError].
    pub fault_location: Option<EntityNumber>,
}

impl FinishPdu {
    pub fn to_bytes(&self) -> Result<Vec<u8>, PduError> {
        let mut buf = vec![
            FileDirectiveType::FinishedPdu as u8,
            ((self.condition as u8) << 4)
                | ((self.delivery_code as u8) << 2)
                | (self.file_status as u8),
        ];
        for response in &self.filestore_responses {
            Tlv::FilestoreResponse(response.clone()).write(&mut buf)?;
        }
        if self.condition != ConditionCode::NoError {
            if let Some(entity) = self.fault_location {
                Tlv::EntityId(entity).write(&mut buf)?;
            }
        }
        Ok(buf)
    }

    pub fn from_params(params: &[u8]) -> Result<Self, PduError> {
        let mut reader = Reader::new(params);
        let first = reader.u8()?;
        let condition = condition_from_raw(first >> 4)?;
        let delivery_code = DeliveryCode::try_from((first >> 2) & 0b1)
            .map_err(|_| PduError::InvalidDeliveryStatus(first))?;
        let file_status = FileStatus::try_from(first & 0b11)
            .map_err(|_| PduError::InvalidDeliveryStatus(first))?;
        let tlvs = parse_tlvs(reader.remaining());
        let filestore_responses = tlvs
            .iter()
            .filter_map(|tlv| match tlv {
                Tlv::FilestoreResponse(response) => Some(response.clone()),
                _ => None,
            })
            .collect();
        Ok(Self {
            condition,
            delivery_code,
            file_status,
            filestore_responses,
            fault_location: fault_location(&tlvs),
        })
    }
}

/// Record continuation state carried in the segment metadata prefix of a file data PDU.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ContinuationState {
    /// Neither the start nor the end of a record.
    #[default]
    NoBoundary = 0,
    StartOfRecord = 1,
    EndOfRecord = 2,
    /// The segment contains a complete record.
    EntireRecord = 3,
}

impl From<u8> for ContinuationState {
    fn from(raw: u8) -> Self {
        match raw & 0b11 {
            1 => ContinuationState::StartOfRecord,
            2 => ContinuationState::EndOfRecord,
            3 => ContinuationState::EntireRecord,
            _ => ContinuationState::NoBoundary,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDataPdu<'data> {
    pub offset: u64,
    pub continuation_state: ContinuationState,
    /// The prefix is only present on the wire if this is [Some]. It must match the segment
    /// metadata flag of the header.
    pub segment_metadata: Option<SmallVec<[u8; 16]>>,
    pub data: &'data [u8],
}

impl<'data> FileDataPdu<'data> {
    pub fn to_bytes(&self, large_file: bool) -> Result<Vec<u8>, PduError> {
        let mut buf = Vec::with_capacity(self.data.len() + 10);
        if let Some(metadata) = &self.segment_metadata {
            if metadata.len() > MAX_SEGMENT_METADATA_LEN {
                return Err(PduError::SegmentMetadataTooLong(metadata.len()));
            }
            buf.push(((self.continuation_state as u8) << 6) | metadata.len() as u8);
            buf.extend_from_slice(metadata);
        }
        write_fss(&mut buf, large_file, self.offset)?;
        buf.extend_from_slice(self.data);
        Ok(buf)
    }

    pub fn from_data_field(
        data_field: &'data [u8],
        large_file: bool,
        segment_metadata_flag: bool,
    ) -> Result<Self, PduError> {
        let mut reader = Reader::new(data_field);
        let mut continuation_state = ContinuationState::NoBoundary;
        let mut segment_metadata = None;
        if segment_metadata_flag {
            let prefix = reader.u8()?;
            continuation_state = ContinuationState::from(prefix >> 6);
            let len = (prefix & 0x3f) as usize;
            segment_metadata = Some(SmallVec::from_slice(reader.take(len)?));
        }
        let offset = reader.fss(large_file)?;
        let data = reader.remaining();
        if offset.checked_add(data.len() as u64).is_none() {
            return Err(PduError::SegmentOutOfRange {
                offset,
                length: data.len() as u64,
            });
        }
        Ok(Self {
            offset,
            continuation_state,
            segment_metadata,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use spacepackets::cfdp::{ChecksumType, FaultHandlerCode};

    use super::*;

    fn header(pdu_type: PduType) -> PduHeader {
        PduHeader::new_unacknowledged(
            pdu_type,
            Direction::TowardsReceiver,
            EntityNumber::new(1),
            EntityNumber::new(0x1234),
            EntityNumber::new(0x0300),
        )
    }

    #[test]
    fn test_header_layout() {
        let mut header = header(PduType::FileData);
        header.crc_flag = true;
        header.segment_metadata = true;
        header.record_boundaries_respected = true;
        let mut buf = Vec::new();
        header.write(0x0102, &mut buf);
        // Version 1, file data, unacknowledged, CRC.
        assert_eq!(buf[0], 0b0011_0110);
        assert_eq!(&buf[1..3], &[0x01, 0x02]);
        // Entity width 2, transaction width 2.
        assert_eq!(buf[3], 0b1001_1001);
        assert_eq!(&buf[4..], &[0x00, 0x01, 0x12, 0x34, 0x03, 0x00]);
        assert_eq!(buf.len(), header.header_len());
        let (parsed, header_len, data_field_len) = PduHeader::from_bytes(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(header_len, 10);
        assert_eq!(data_field_len, 0x0102);
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = Vec::new();
        header(PduType::FileDirective).write(0, &mut buf);
        buf[0] &= 0b0001_1111;
        assert_eq!(
            PduHeader::from_bytes(&buf),
            Err(PduError::UnsupportedVersion(0))
        );
    }

    #[test]
    fn test_truncated_header() {
        let mut buf = Vec::new();
        header(PduType::FileDirective).write(0, &mut buf);
        assert!(matches!(
            PduHeader::from_bytes(&buf[..6]),
            Err(PduError::Truncated { .. })
        ));
    }

    #[test]
    fn test_crc_verified() {
        let mut header = header(PduType::FileDirective);
        header.crc_flag = true;
        let eof = EofPdu {
            condition: ConditionCode::NoError,
            checksum: 0xdead_beef,
            file_size: 10,
            fault_location: None,
        };
        let mut raw = assemble(&header, &eof.to_bytes(false).unwrap()).unwrap();
        let parsed = parse_pdu(&raw).unwrap();
        assert_eq!(parsed.header, header);
        let (directive, params) = parsed.directive().unwrap();
        assert_eq!(directive, FileDirectiveType::EofPdu);
        assert_eq!(EofPdu::from_params(params, false).unwrap(), eof);
        let last = raw.len() - 3;
        raw[last] ^= 0xff;
        assert_eq!(parse_pdu(&raw), Err(PduError::CrcMismatch));
    }

    #[test]
    fn test_data_field_length_checked() {
        let header = header(PduType::FileDirective);
        let raw = assemble(&header, &[FileDirectiveType::EofPdu as u8, 0, 0]).unwrap();
        assert!(matches!(
            parse_pdu(&raw[..raw.len() - 1]),
            Err(PduError::Truncated { .. })
        ));
        assert!(assemble(&header, &vec![0; 70000]).is_err());
    }

    #[test]
    fn test_metadata_with_tlvs() {
        let metadata = MetadataPdu {
            closure_requested: true,
            checksum_type: ChecksumType::Crc32C as u8,
            file_size: 0x1_0000_0000,
            source_file: Some("/tmp/source.bin".into()),
            dest_file: None,
            tlvs: vec![
                Tlv::MessageToUser(b"hello".to_vec()),
                Tlv::FilestoreRequest(FilestoreRequest::new(
                    FilestoreActionCode::RenameFile,
                    "a".into(),
                    Some("b".into()),
                )),
                Tlv::FaultHandlerOverride {
                    condition: ConditionCode::FileChecksumFailure as u8,
                    handler: FaultHandlerCode::AbandonTransaction as u8,
                },
                Tlv::FlowLabel(vec![7]),
            ],
        };
        assert_eq!(
            metadata.to_bytes(false),
            Err(PduError::FileSizeTooLarge(0x1_0000_0000))
        );
        let raw = metadata.to_bytes(true).unwrap();
        assert_eq!(raw[0], FileDirectiveType::MetadataPdu as u8);
        assert_eq!(raw[1], 0b0100_0010);
        assert_eq!(MetadataPdu::from_params(&raw[1..], true).unwrap(), metadata);
    }

    #[test]
    fn test_malformed_tlv_ends_parsing() {
        let mut raw = Vec::new();
        Tlv::MessageToUser(b"first".to_vec()).write(&mut raw).unwrap();
        // Length exceeds the remaining data.
        raw.extend_from_slice(&[TLV_MESSAGE_TO_USER, 20, 1, 2]);
        let tlvs = parse_tlvs(&raw);
        assert_eq!(tlvs, vec![Tlv::MessageToUser(b"first".to_vec())]);
    }

    #[test]
    fn test_eof_with_fault_location() {
        let eof = EofPdu {
            condition: ConditionCode::CancelRequestReceived,
            checksum: 5,
            file_size: 100,
            fault_location: Some(EntityNumber::new(3)),
        };
        let raw = eof.to_bytes(false).unwrap();
        assert_eq!(raw[1], (ConditionCode::CancelRequestReceived as u8) << 4);
        assert_eq!(raw.len(), 1 + 1 + 4 + 4 + 3);
        assert_eq!(EofPdu::from_params(&raw[1..], false).unwrap(), eof);
    }

    #[test]
    fn test_finish_with_responses() {
        let finish = FinishPdu {
            condition: ConditionCode::FilestoreRejection,
            delivery_code: DeliveryCode::Incomplete,
            file_status: FileStatus::DiscardedFsRejection,
            filestore_responses: vec![FilestoreResponse::new(
                FilestoreActionCode::DeleteFile,
                1,
                "gone.txt".into(),
                None,
                Some("file does not exist".into()),
            )],
            fault_location: Some(EntityNumber::new(2)),
        };
        let raw = finish.to_bytes().unwrap();
        assert_eq!(raw[0], FileDirectiveType::FinishedPdu as u8);
        assert_eq!(FinishPdu::from_params(&raw[1..]).unwrap(), finish);
    }

    #[test]
    fn test_file_data_prefix() {
        let data = [1, 2, 3, 4, 5];
        let pdu = FileDataPdu {
            offset: 40,
            continuation_state: ContinuationState::EndOfRecord,
            segment_metadata: Some(SmallVec::from_slice(&[0xaa, 0xbb])),
            data: &data,
        };
        let raw = pdu.to_bytes(false).unwrap();
        assert_eq!(raw[0], 0b1000_0010);
        assert_eq!(&raw[3..7], &[0, 0, 0, 40]);
        assert_eq!(FileDataPdu::from_data_field(&raw, false, true).unwrap(), pdu);

        let plain = FileDataPdu {
            offset: 7,
            continuation_state: ContinuationState::NoBoundary,
            segment_metadata: None,
            data: &data,
        };
        let raw = plain.to_bytes(true).unwrap();
        assert_eq!(raw.len(), 8 + data.len());
        assert_eq!(FileDataPdu::from_data_field(&raw, true, false).unwrap(), plain);
    }

    #[test]
    fn test_segment_metadata_too_long() {
        let metadata = [0; 64];
        let pdu = FileDataPdu {
            offset: 0,
            continuation_state: ContinuationState::NoBoundary,
            segment_metadata: Some(SmallVec::from_slice(&metadata)),
            data: &[],
        };
        assert_eq!(
            pdu.to_bytes(false),
            Err(PduError::SegmentMetadataTooLong(64))
        );
    }

    #[test]
    fn test_segment_beyond_max_file_size() {
        let data = [1, 2, 3, 4];
        let pdu = FileDataPdu {
            offset: u64::MAX - 1,
            continuation_state: ContinuationState::NoBoundary,
            segment_metadata: None,
            data: &data,
        };
        let raw = pdu.to_bytes(true).unwrap();
        assert_eq!(
            FileDataPdu::from_data_field(&raw, true, false),
            Err(PduError::SegmentOutOfRange {
                offset: u64::MAX - 1,
                length: 4
            })
        );
        let last = FileDataPdu {
            offset: u64::MAX - 4,
            ..pdu
        };
        let raw = last.to_bytes(true).unwrap();
        assert_eq!(FileDataPdu::from_data_field(&raw, true, false).unwrap(), last);
    }
}
