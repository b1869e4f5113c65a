//! Sending side of a transaction.
//!
//! An [OutboundFdu] is created from a put request. All directive PDUs are serialized up front,
//! while file data is only described by [SegmentDescriptor]s and read from the source file when
//! the PDU is requested by the transport adapter.
use std::collections::VecDeque;
use std::path::Path;

use log::debug;
use spacepackets::cfdp::pdu::finished::{DeliveryCode, FileStatus};
use spacepackets::cfdp::{ChecksumType, ConditionCode, Direction, PduType};

use crate::checksum;
use crate::config::EngineConfig;
use crate::entity::Entity;
use crate::event::EventKind;
use crate::fault::FaultHandlerOverrides;
use crate::filestore::{resolve_path, FilestoreError, VirtualFilestore};
use crate::pdu::{
    assemble, ContinuationState, EofPdu, FileDataPdu, MetadataPdu, PduHeader, Tlv,
    MAX_SEGMENT_METADATA_LEN,
};
use crate::request::{PutRequest, PutRequestError, SegmentMetadata};
use crate::{EntityNumber, TransactionId};

/// Buffer size used to compute the checksum of source files.
const CHECKSUM_BUF_LEN: usize = 4096;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FduState {
    Active,
    Suspended,
    /// Terminal. The FDU only remains as a record until it is purged.
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentDescriptor {
    pub offset: u64,
    pub length: u64,
    pub continuation_state: ContinuationState,
    pub metadata: Option<SegmentMetadata>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OutboundPduKind {
    Metadata,
    FileData { offset: u64, length: u64 },
    Eof,
    Finish,
}

/// Serialized PDU which was not yet committed to the FDU state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltPdu {
    pub bytes: Vec<u8>,
    pub kind: OutboundPduKind,
}

#[derive(Debug, Clone)]
pub struct OutboundFdu {
    id: TransactionId,
    destination: EntityNumber,
    state: FduState,
    checksum_type: ChecksumType,
    fault_handlers: FaultHandlerOverrides,
    header: PduHeader,
    record_boundaries_respected: bool,
    metadata_pdu: Option<Vec<u8>>,
    segments: VecDeque<SegmentDescriptor>,
    source_file: Option<String>,
    eof_pdu: Option<Vec<u8>>,
    metadata_sent: bool,
    eof_sent: bool,
    closure_requested: bool,
    file_size: u64,
    progress: u64,
    finish_deadline: Option<u64>,
}

fn continuation_state(respected: bool, first: bool, last: bool) -> ContinuationState {
    if !respected {
        return ContinuationState::NoBoundary;
    }
    match (first, last) {
        (true, true) => ContinuationState::EntireRecord,
        (true, false) => ContinuationState::StartOfRecord,
        (false, true) => ContinuationState::EndOfRecord,
        (false, false) => ContinuationState::NoBoundary,
    }
}

impl OutboundFdu {
    /// Prepare all PDUs of a new transaction. The source file is measured and checksummed
    /// immediately.
    pub fn from_put_request<Vfs: VirtualFilestore + ?Sized>(
        id: TransactionId,
        request: &PutRequest,
        destination: &Entity,
        config: &EngineConfig,
        vfs: &Vfs,
    ) -> Result<Self, PutRequestError> {
        request.validate()?;
        let checksum_type = destination.outbound_checksum;
        let source_path = request
            .source_file()
            .map(|name| resolve_path(&config.working_dir, name));
        let (file_size, file_checksum) = match &source_path {
            Some(path) => {
                let file_size = vfs.file_size(path)?;
                let mut buf = [0; CHECKSUM_BUF_LEN];
                let value = vfs.calculate_checksum(path, checksum_type, file_size, &mut buf)?;
                (file_size, value)
            }
            None => (0, checksum::calculate(checksum_type, &[]).unwrap_or(0)),
        };

        let mut header = PduHeader::new_unacknowledged(
            PduType::FileDirective,
            Direction::TowardsReceiver,
            id.source(),
            id.number(),
            destination.number,
        );
        header.crc_flag = config.crc_required;
        header.large_file = file_size > u32::MAX as u64;
        header.record_boundaries_respected = request.record_boundaries_respected;

        let mut tlvs = Vec::new();
        tlvs.extend(request.fs_requests.iter().cloned().map(Tlv::FilestoreRequest));
        tlvs.extend(request.msgs_to_user.iter().cloned().map(Tlv::MessageToUser));
        tlvs.extend(
            request
                .fault_handler_overrides
                .iter()
                .map(|(condition, handler)| Tlv::FaultHandlerOverride {
                    condition,
                    handler: handler as u8,
                }),
        );
        if let Some(flow_label) = &request.flow_label {
            tlvs.push(Tlv::FlowLabel(flow_label.clone()));
        }
        let metadata = MetadataPdu {
            closure_requested: request.closure_requested,
            checksum_type: checksum_type as u8,
            file_size,
            source_file: request.source_file().map(str::to_string),
            dest_file: request.dest_file().map(str::to_string),
            tlvs,
        };
        let metadata_pdu = assemble(&header, &metadata.to_bytes(header.large_file)?)?;
        let eof = EofPdu {
            condition: ConditionCode::NoError,
            checksum: file_checksum,
            file_size,
            fault_location: None,
        };
        let eof_pdu = assemble(&header, &eof.to_bytes(header.large_file)?)?;

        // Keep every file data PDU inside one buffer unit.
        let overhead = header.header_len() + 1 + MAX_SEGMENT_METADATA_LEN + 8 + 2;
        let segment_len = request
            .segment_len
            .unwrap_or(config.max_file_data_len)
            .min(config.max_pdu_len.saturating_sub(overhead))
            .max(1) as u64;
        let mut segments = VecDeque::new();
        let mut offset = 0;
        while offset < file_size {
            let length = segment_len.min(file_size - offset);
            let metadata = match request.segment_metadata {
                Some(metadata_fn) => {
                    let metadata = metadata_fn(offset, length);
                    if metadata.len() > MAX_SEGMENT_METADATA_LEN {
                        return Err(PutRequestError::SegmentMetadataTooLong(metadata.len()));
                    }
                    Some(metadata)
                }
                None => None,
            };
            segments.push_back(SegmentDescriptor {
                offset,
                length,
                continuation_state: continuation_state(
                    request.record_boundaries_respected,
                    offset == 0,
                    offset + length == file_size,
                ),
                metadata,
            });
            offset += length;
        }

        Ok(Self {
            id,
            destination: destination.number,
            state: FduState::Active,
            checksum_type,
            fault_handlers: request.fault_handler_overrides,
            header,
            record_boundaries_respected: request.record_boundaries_respected,
            metadata_pdu: Some(metadata_pdu),
            segments,
            source_file: source_path,
            eof_pdu: Some(eof_pdu),
            metadata_sent: false,
            eof_sent: false,
            closure_requested: request.closure_requested,
            file_size,
            progress: 0,
            finish_deadline: None,
        })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn destination(&self) -> EntityNumber {
        self.destination
    }

    pub fn state(&self) -> FduState {
        self.state
    }

    pub fn checksum_type(&self) -> ChecksumType {
        self.checksum_type
    }

    pub fn fault_handlers(&self) -> &FaultHandlerOverrides {
        &self.fault_handlers
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn progress(&self) -> u64 {
        self.progress
    }

    pub fn closure_requested(&self) -> bool {
        self.closure_requested
    }

    pub fn eof_sent(&self) -> bool {
        self.eof_sent
    }

    pub fn pending_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn finish_deadline(&self) -> Option<u64> {
        self.finish_deadline
    }

    pub(crate) fn set_finish_deadline(&mut self, deadline: u64) {
        self.finish_deadline = Some(deadline);
    }

    /// Whether the FDU can currently produce a PDU.
    pub fn is_ready(&self) -> bool {
        self.state == FduState::Active && !self.eof_sent
    }

    /// Build the next PDU without changing the FDU. [Self::commit] must be called once the PDU
    /// was handed out.
    pub fn next_pdu<Vfs: VirtualFilestore + ?Sized>(
        &self,
        vfs: &Vfs,
    ) -> Result<Option<BuiltPdu>, FilestoreError> {
        if !self.is_ready() {
            return Ok(None);
        }
        if !self.metadata_sent {
            return Ok(self.metadata_pdu.clone().map(|bytes| BuiltPdu {
                bytes,
                kind: OutboundPduKind::Metadata,
            }));
        }
        if let (Some(segment), Some(path)) = (self.segments.front(), &self.source_file) {
            let mut data = vec![0; segment.length as usize];
            vfs.read_data(path, segment.offset, &mut data)?;
            let with_prefix = self.record_boundaries_respected || segment.metadata.is_some();
            let mut header = self.header;
            header.pdu_type = PduType::FileData;
            header.segment_metadata = with_prefix;
            let pdu = FileDataPdu {
                offset: segment.offset,
                continuation_state: segment.continuation_state,
                segment_metadata: with_prefix
                    .then(|| segment.metadata.clone().unwrap_or_default()),
                data: &data,
            };
            // The descriptors were validated on creation.
            let bytes = pdu
                .to_bytes(header.large_file)
                .and_then(|data_field| assemble(&header, &data_field))
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            return Ok(Some(BuiltPdu {
                bytes,
                kind: OutboundPduKind::FileData {
                    offset: segment.offset,
                    length: segment.length,
                },
            }));
        }
        Ok(self.eof_pdu.clone().map(|bytes| BuiltPdu {
            bytes,
            kind: OutboundPduKind::Eof,
        }))
    }

    /// Record that the PDU of the given kind was handed out.
    pub fn commit(&mut self, kind: OutboundPduKind) {
        match kind {
            OutboundPduKind::Metadata => {
                self.metadata_sent = true;
                self.metadata_pdu = None;
            }
            OutboundPduKind::FileData { length, .. } => {
                self.segments.pop_front();
                self.progress = (self.progress + length).min(self.file_size);
            }
            OutboundPduKind::Eof => {
                self.eof_sent = true;
                self.eof_pdu = None;
            }
            OutboundPduKind::Finish => (),
        }
    }

    /// Drop the next file data segment without accounting it as progress.
    pub fn skip_segment(&mut self) {
        if let Some(segment) = self.segments.pop_front() {
            debug!(
                "{}: skipping segment at offset {} with length {}",
                self.id, segment.offset, segment.length
            );
        }
    }

    pub fn delivery_code(&self) -> DeliveryCode {
        if self.metadata_sent && self.eof_sent && self.progress == self.file_size {
            DeliveryCode::Complete
        } else {
            DeliveryCode::Incomplete
        }
    }

    pub fn suspend(&mut self, condition: ConditionCode) -> Option<EventKind> {
        if self.state != FduState::Active {
            return None;
        }
        self.state = FduState::Suspended;
        Some(EventKind::Suspended { condition })
    }

    pub fn resume(&mut self) -> Option<EventKind> {
        if self.state != FduState::Suspended {
            return None;
        }
        self.state = FduState::Active;
        Some(EventKind::Resumed {
            progress: self.progress,
        })
    }

    /// Cancel the FDU. Repeated cancellations have no effect.
    pub fn cancel(&mut self, condition: ConditionCode) -> Option<EventKind> {
        if self.state == FduState::Canceled {
            return None;
        }
        let event = EventKind::TransactionFinished {
            condition,
            delivery_code: self.delivery_code(),
            file_status: FileStatus::Unreported,
            progress: self.progress,
            status_report: None,
            filestore_responses: Vec::new(),
        };
        self.state = FduState::Canceled;
        self.release();
        Some(event)
    }

    pub fn finished_event(&self, condition: ConditionCode, file_status: FileStatus) -> EventKind {
        EventKind::TransactionFinished {
            condition,
            delivery_code: self.delivery_code(),
            file_status,
            progress: self.progress,
            status_report: None,
            filestore_responses: Vec::new(),
        }
    }

    pub fn abandoned_event(&self, condition: ConditionCode) -> EventKind {
        EventKind::Abandoned {
            condition,
            progress: self.progress,
        }
    }

    /// Release the serialized PDUs, the segment queue, the pending Finish and the source file
    /// reference.
    pub fn release(&mut self) {
        self.metadata_pdu = None;
        self.segments.clear();
        self.eof_pdu = None;
        self.finish_deadline = None;
        self.source_file = None;
    }

    pub fn status_report(&self) -> String {
        format!(
            "state {:?}  size {}  progress {}  segments {}",
            self.state,
            self.file_size,
            self.progress,
            self.segments.len()
        )
    }
}

/// Pending Finish PDU deadline of an outbound transaction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PendingFinish {
    pub deadline: u64,
    pub id: TransactionId,
}

/// Outbound FDUs in creation order and the pending Finish deadlines in ascending order.
#[derive(Debug, Default, Clone)]
pub struct OutboundFdus {
    fdus: Vec<OutboundFdu>,
    pending_finishes: Vec<PendingFinish>,
}

impl OutboundFdus {
    pub fn push(&mut self, fdu: OutboundFdu) {
        self.fdus.push(fdu);
    }

    pub fn find(&self, id: &TransactionId) -> Option<&OutboundFdu> {
        self.fdus.iter().find(|fdu| fdu.id == *id)
    }

    pub fn find_mut(&mut self, id: &TransactionId) -> Option<&mut OutboundFdu> {
        self.fdus.iter_mut().find(|fdu| fdu.id == *id)
    }

    /// First FDU which can produce a PDU.
    pub fn next_ready_mut(&mut self) -> Option<&mut OutboundFdu> {
        self.fdus.iter_mut().find(|fdu| fdu.is_ready())
    }

    pub fn has_ready(&self) -> bool {
        self.fdus.iter().any(OutboundFdu::is_ready)
    }

    /// Remove the FDU and its pending Finish record.
    pub fn remove(&mut self, id: &TransactionId) -> Option<OutboundFdu> {
        self.disarm_finish(id);
        let idx = self.fdus.iter().position(|fdu| fdu.id == *id)?;
        Some(self.fdus.remove(idx))
    }

    pub fn arm_finish(&mut self, id: TransactionId, deadline: u64) {
        if let Some(fdu) = self.find_mut(&id) {
            fdu.set_finish_deadline(deadline);
        }
        let pending = PendingFinish { deadline, id };
        let idx = self.pending_finishes.partition_point(|other| *other <= pending);
        self.pending_finishes.insert(idx, pending);
    }

    pub fn disarm_finish(&mut self, id: &TransactionId) {
        self.pending_finishes.retain(|pending| pending.id != *id);
    }

    pub fn pending_finishes(&self) -> &[PendingFinish] {
        &self.pending_finishes
    }

    /// Transactions whose Finish PDU was not received before the deadline.
    pub fn overdue_finishes(&self, now: u64) -> impl Iterator<Item = TransactionId> + '_ {
        self.pending_finishes
            .iter()
            .take_while(move |pending| pending.deadline <= now)
            .map(|pending| pending.id)
    }

    /// Remove all canceled FDUs. Returns their number.
    pub fn purge_canceled(&mut self) -> usize {
        let before = self.fdus.len();
        self.fdus.retain(|fdu| fdu.state != FduState::Canceled);
        let fdus = &self.fdus;
        self.pending_finishes
            .retain(|pending| fdus.iter().any(|fdu| fdu.id == pending.id));
        before - self.fdus.len()
    }

    pub fn len(&self) -> usize {
        self.fdus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fdus.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutboundFdu> {
        self.fdus.iter()
    }
}

/// Destination file name from a path, used for logging.
pub(crate) fn display_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use smallvec::SmallVec;
    use spacepackets::cfdp::pdu::FileDirectiveType;
    use tempfile::tempdir;

    use crate::entity::{EntityProfile, EntityRegistry};
    use crate::filestore::NativeFilestore;
    use crate::pdu::parse_pdu;
    use crate::tests::{test_config, LOCAL_ID, REMOTE_ID};

    use super::*;

    fn destination(config: &EngineConfig) -> Entity {
        let mut registry = EntityRegistry::default();
        registry
            .add(
                &EntityProfile::new(
                    REMOTE_ID,
                    "bp".into(),
                    "ipn:2.1".into(),
                    10,
                    ChecksumType::Modular as u8,
                    ChecksumType::Modular as u8,
                ),
                config,
            )
            .unwrap();
        registry.find(REMOTE_ID).unwrap().clone()
    }

    fn id() -> TransactionId {
        TransactionId::new(LOCAL_ID, EntityNumber::new(1))
    }

    fn drain(fdu: &mut OutboundFdu) -> Vec<BuiltPdu> {
        let mut pdus = Vec::new();
        while let Some(pdu) = fdu.next_pdu(&NativeFilestore::default()).unwrap() {
            fdu.commit(pdu.kind);
            pdus.push(pdu);
        }
        pdus
    }

    #[test]
    fn test_pdu_sequence() {
        let tmpdir = tempdir().unwrap();
        let config = test_config(LOCAL_ID, tmpdir.path());
        let data: Vec<u8> = (0..250u8).collect();
        fs::write(tmpdir.path().join("src.bin"), &data).unwrap();
        let request = PutRequest::new_regular_request(REMOTE_ID, "src.bin", Some("dest.bin"))
            .unwrap()
            .with_segment_len(100);
        let mut fdu = OutboundFdu::from_put_request(
            id(),
            &request,
            &destination(&config),
            &config,
            &NativeFilestore::default(),
        )
        .unwrap();
        assert_eq!(fdu.file_size(), 250);
        assert_eq!(fdu.pending_segments(), 3);
        let pdus = drain(&mut fdu);
        let kinds: Vec<OutboundPduKind> = pdus.iter().map(|pdu| pdu.kind).collect();
        assert_eq!(
            kinds,
            vec![
                OutboundPduKind::Metadata,
                OutboundPduKind::FileData {
                    offset: 0,
                    length: 100
                },
                OutboundPduKind::FileData {
                    offset: 100,
                    length: 100
                },
                OutboundPduKind::FileData {
                    offset: 200,
                    length: 50
                },
                OutboundPduKind::Eof,
            ]
        );
        assert_eq!(fdu.progress(), 250);
        assert!(fdu.eof_sent());
        assert_eq!(fdu.delivery_code(), DeliveryCode::Complete);

        let eof = parse_pdu(&pdus[4].bytes).unwrap();
        let (directive, params) = eof.directive().unwrap();
        assert_eq!(directive, FileDirectiveType::EofPdu);
        let eof = EofPdu::from_params(params, false).unwrap();
        assert_eq!(
            Some(eof.checksum),
            checksum::calculate(ChecksumType::Modular, &data)
        );
        let segment = parse_pdu(&pdus[3].bytes).unwrap();
        let file_data =
            FileDataPdu::from_data_field(segment.data_field, false, segment.header.segment_metadata)
                .unwrap();
        assert_eq!(file_data.offset, 200);
        assert_eq!(file_data.data, &data[200..]);
    }

    #[test]
    fn test_metadata_only() {
        let tmpdir = tempdir().unwrap();
        let config = test_config(LOCAL_ID, tmpdir.path());
        let request = PutRequest::new_msgs_to_user_only(REMOTE_ID, &[b"ping".as_slice()]);
        let mut fdu = OutboundFdu::from_put_request(
            id(),
            &request,
            &destination(&config),
            &config,
            &NativeFilestore::default(),
        )
        .unwrap();
        let pdus = drain(&mut fdu);
        assert_eq!(pdus.len(), 2);
        let metadata = parse_pdu(&pdus[0].bytes).unwrap();
        let (_, params) = metadata.directive().unwrap();
        let metadata = MetadataPdu::from_params(params, false).unwrap();
        assert_eq!(metadata.tlvs, vec![Tlv::MessageToUser(b"ping".to_vec())]);
        assert!(metadata.source_file.is_none());
        assert_eq!(fdu.delivery_code(), DeliveryCode::Complete);
    }

    fn record_metadata(offset: u64, _length: u64) -> SegmentMetadata {
        SmallVec::from_slice(&[offset as u8])
    }

    #[test]
    fn test_segment_metadata_and_record_boundaries() {
        let tmpdir = tempdir().unwrap();
        let config = test_config(LOCAL_ID, tmpdir.path());
        fs::write(tmpdir.path().join("src.bin"), [1u8; 20]).unwrap();
        let request = PutRequest::new_regular_request(REMOTE_ID, "src.bin", None)
            .unwrap()
            .with_segment_len(10)
            .with_record_boundaries_respected(true)
            .with_segment_metadata(record_metadata);
        let mut fdu = OutboundFdu::from_put_request(
            id(),
            &request,
            &destination(&config),
            &config,
            &NativeFilestore::default(),
        )
        .unwrap();
        let pdus = drain(&mut fdu);
        let second = parse_pdu(&pdus[2].bytes).unwrap();
        assert!(second.header.segment_metadata);
        assert!(second.header.record_boundaries_respected);
        let file_data = FileDataPdu::from_data_field(second.data_field, false, true).unwrap();
        assert_eq!(file_data.continuation_state, ContinuationState::EndOfRecord);
        assert_eq!(file_data.segment_metadata.unwrap().as_slice(), &[10]);
    }

    fn max_metadata(_offset: u64, _length: u64) -> SegmentMetadata {
        SmallVec::from_slice(&[0xee; MAX_SEGMENT_METADATA_LEN])
    }

    #[test]
    fn test_smallest_pdu_len_respected() {
        let tmpdir = tempdir().unwrap();
        let wide = EntityNumber::new(u64::MAX);
        let mut config = test_config(EntityNumber::new(u64::MAX - 1), tmpdir.path());
        config.max_pdu_len = crate::config::MIN_PDU_LEN;
        config.crc_required = true;
        config.validate().unwrap();
        let mut registry = EntityRegistry::default();
        registry
            .add(
                &EntityProfile::new(
                    wide,
                    "bp".into(),
                    "ipn:2.1".into(),
                    10,
                    ChecksumType::Modular as u8,
                    ChecksumType::Modular as u8,
                ),
                &config,
            )
            .unwrap();
        let destination = registry.find(wide).unwrap().clone();
        fs::write(tmpdir.path().join("src.bin"), [7u8; 10]).unwrap();
        let request = PutRequest::new_regular_request(wide, "src.bin", Some("d"))
            .unwrap()
            .with_segment_metadata(max_metadata);
        let mut fdu = OutboundFdu::from_put_request(
            TransactionId::new(config.local_entity, EntityNumber::new(u64::MAX)),
            &request,
            &destination,
            &config,
            &NativeFilestore::default(),
        )
        .unwrap();
        let pdus = drain(&mut fdu);
        assert!(pdus
            .iter()
            .any(|pdu| matches!(pdu.kind, OutboundPduKind::FileData { .. })));
        for pdu in &pdus {
            assert!(
                pdu.bytes.len() <= config.max_pdu_len,
                "{:?} PDU of {} bytes",
                pdu.kind,
                pdu.bytes.len()
            );
        }
    }

    #[test]
    fn test_missing_source_file() {
        let tmpdir = tempdir().unwrap();
        let config = test_config(LOCAL_ID, tmpdir.path());
        let request = PutRequest::new_regular_request(REMOTE_ID, "missing.bin", None).unwrap();
        let result = OutboundFdu::from_put_request(
            id(),
            &request,
            &destination(&config),
            &config,
            &NativeFilestore::default(),
        );
        assert!(matches!(
            result,
            Err(PutRequestError::Filestore(FilestoreError::FileDoesNotExist))
        ));
    }

    #[test]
    fn test_state_transitions() {
        let tmpdir = tempdir().unwrap();
        let config = test_config(LOCAL_ID, tmpdir.path());
        let request = PutRequest::new_metadata_only(REMOTE_ID);
        let mut fdu = OutboundFdu::from_put_request(
            id(),
            &request,
            &destination(&config),
            &config,
            &NativeFilestore::default(),
        )
        .unwrap();
        assert!(fdu.resume().is_none());
        assert!(fdu.suspend(ConditionCode::SuspendRequestReceived).is_some());
        assert!(!fdu.is_ready());
        assert!(fdu.suspend(ConditionCode::SuspendRequestReceived).is_none());
        assert_eq!(fdu.resume(), Some(EventKind::Resumed { progress: 0 }));
        let event = fdu.cancel(ConditionCode::CancelRequestReceived).unwrap();
        assert!(matches!(
            event,
            EventKind::TransactionFinished {
                delivery_code: DeliveryCode::Incomplete,
                ..
            }
        ));
        assert_eq!(fdu.state(), FduState::Canceled);
        assert!(fdu.cancel(ConditionCode::CancelRequestReceived).is_none());
        assert!(fdu.next_pdu(&NativeFilestore::default()).unwrap().is_none());
    }

    #[test]
    fn test_pending_finishes_sorted_and_purge() {
        let tmpdir = tempdir().unwrap();
        let config = test_config(LOCAL_ID, tmpdir.path());
        let mut fdus = OutboundFdus::default();
        for number in 1..=3 {
            let id = TransactionId::new(LOCAL_ID, EntityNumber::new(number));
            let fdu = OutboundFdu::from_put_request(
                id,
                &PutRequest::new_metadata_only(REMOTE_ID),
                &destination(&config),
                &config,
                &NativeFilestore::default(),
            )
            .unwrap();
            fdus.push(fdu);
        }
        let ids: Vec<TransactionId> = fdus.iter().map(OutboundFdu::id).collect();
        fdus.arm_finish(ids[0], 30);
        fdus.arm_finish(ids[1], 10);
        fdus.arm_finish(ids[2], 20);
        let deadlines: Vec<u64> = fdus
            .pending_finishes()
            .iter()
            .map(|pending| pending.deadline)
            .collect();
        assert_eq!(deadlines, vec![10, 20, 30]);
        assert_eq!(
            fdus.overdue_finishes(20).collect::<Vec<_>>(),
            vec![ids[1], ids[2]]
        );
        fdus.find_mut(&ids[1])
            .unwrap()
            .cancel(ConditionCode::CancelRequestReceived);
        assert_eq!(fdus.purge_canceled(), 1);
        assert_eq!(fdus.len(), 2);
        assert_eq!(fdus.pending_finishes().len(), 2);
        assert!(fdus.remove(&ids[0]).is_some());
        assert_eq!(fdus.pending_finishes().len(), 1);
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("/tmp/dir/file.txt"), "file.txt");
        assert_eq!(display_name("file.txt"), "file.txt");
    }
}
