use smallvec::SmallVec;
use spacepackets::cfdp::{ConditionCode, FaultHandlerCode};

use crate::config::MAX_SEGMENT_LEN;
use crate::fault::FaultHandlerOverrides;
use crate::filestore::{FilestoreError, FilestoreRequest};
use crate::pdu::{PduError, MAX_SEGMENT_METADATA_LEN};
use crate::EntityNumber;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[error("file path of {0} bytes exceeds 255 bytes")]
pub struct FilePathTooLarge(pub usize);

#[derive(Debug, thiserror::Error)]
pub enum PutRequestError {
    #[error("destination entity {0} is not registered")]
    UnknownDestination(EntityNumber),
    #[error(transparent)]
    FilePathTooLarge(#[from] FilePathTooLarge),
    #[error("a destination file requires a source file")]
    DestWithoutSource,
    #[error("segment length {0} is not between 1 and {MAX_SEGMENT_LEN}")]
    InvalidSegmentLength(usize),
    #[error("segment metadata of {0} bytes exceeds {MAX_SEGMENT_METADATA_LEN} bytes")]
    SegmentMetadataTooLong(usize),
    #[error("source file: {0}")]
    Filestore(#[from] FilestoreError),
    #[error("PDU generation: {0}")]
    Pdu(#[from] PduError),
}

/// Segment metadata attached to a single file data PDU. At most 63 bytes long.
pub type SegmentMetadata = SmallVec<[u8; 16]>;

/// Called once for every file data segment with the segment offset and length when the
/// transaction is created.
pub type SegmentMetadataFn = fn(offset: u64, length: u64) -> SegmentMetadata;

/// Request to copy a file, or to only transmit metadata if no source file is given.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PutRequest {
    pub destination_id: EntityNumber,
    source_file: Option<String>,
    dest_file: Option<String>,
    pub closure_requested: bool,
    pub record_boundaries_respected: bool,
    /// Overrides the configured maximum file data length for this transaction.
    pub segment_len: Option<usize>,
    #[cfg_attr(feature = "serde", serde(skip))]
    pub segment_metadata: Option<SegmentMetadataFn>,
    pub fault_handler_overrides: FaultHandlerOverrides,
    pub flow_label: Option<Vec<u8>>,
    pub msgs_to_user: Vec<Vec<u8>>,
    pub fs_requests: Vec<FilestoreRequest>,
}

pub fn generic_path_checks(
    source_file: Option<&str>,
    dest_file: Option<&str>,
) -> Result<(), FilePathTooLarge> {
    if let Some(src_file) = source_file {
        if src_file.len() > u8::MAX as usize {
            return Err(FilePathTooLarge(src_file.len()));
        }
    }
    if let Some(dest_file) = dest_file {
        if dest_file.len() > u8::MAX as usize {
            return Err(FilePathTooLarge(dest_file.len()));
        }
    }
    Ok(())
}

impl PutRequest {
    /// Request without any file. Only the metadata PDU with its TLVs and the EOF PDU are sent.
    pub fn new_metadata_only(destination_id: EntityNumber) -> Self {
        Self {
            destination_id,
            source_file: None,
            dest_file: None,
            closure_requested: false,
            record_boundaries_respected: false,
            segment_len: None,
            segment_metadata: None,
            fault_handler_overrides: FaultHandlerOverrides::default(),
            flow_label: None,
            msgs_to_user: Vec::new(),
            fs_requests: Vec::new(),
        }
    }

    /// The destination file name defaults to the source file name.
    pub fn new_regular_request(
        destination_id: EntityNumber,
        source_file: &str,
        dest_file: Option<&str>,
    ) -> Result<Self, FilePathTooLarge> {
        generic_path_checks(Some(source_file), dest_file)?;
        let mut request = Self::new_metadata_only(destination_id);
        request.source_file = Some(source_file.to_string());
        request.dest_file = dest_file.map(str::to_string);
        Ok(request)
    }

    pub fn new_msgs_to_user_only(destination_id: EntityNumber, msgs_to_user: &[&[u8]]) -> Self {
        let mut request = Self::new_metadata_only(destination_id);
        request.msgs_to_user = msgs_to_user.iter().map(|msg| msg.to_vec()).collect();
        request
    }

    pub fn with_closure_requested(mut self, closure_requested: bool) -> Self {
        self.closure_requested = closure_requested;
        self
    }

    pub fn with_record_boundaries_respected(mut self, respected: bool) -> Self {
        self.record_boundaries_respected = respected;
        self
    }

    pub fn with_segment_len(mut self, segment_len: usize) -> Self {
        self.segment_len = Some(segment_len);
        self
    }

    pub fn with_segment_metadata(mut self, segment_metadata: SegmentMetadataFn) -> Self {
        self.segment_metadata = Some(segment_metadata);
        self
    }

    pub fn with_fault_handler_override(
        mut self,
        condition: ConditionCode,
        handler: FaultHandlerCode,
    ) -> Self {
        self.fault_handler_overrides.set(condition, handler);
        self
    }

    pub fn with_flow_label(mut self, flow_label: &[u8]) -> Self {
        self.flow_label = Some(flow_label.to_vec());
        self
    }

    pub fn with_msg_to_user(mut self, msg: &[u8]) -> Self {
        self.msgs_to_user.push(msg.to_vec());
        self
    }

    pub fn with_fs_request(mut self, request: FilestoreRequest) -> Self {
        self.fs_requests.push(request);
        self
    }

    pub fn source_file(&self) -> Option<&str> {
        self.source_file.as_deref()
    }

    /// Destination file name as it is transmitted.
    pub fn dest_file(&self) -> Option<&str> {
        self.dest_file.as_deref().or(self.source_file.as_deref())
    }

    pub fn validate(&self) -> Result<(), PutRequestError> {
        generic_path_checks(self.source_file(), self.dest_file())?;
        if self.source_file.is_none() && self.dest_file.is_some() {
            return Err(PutRequestError::DestWithoutSource);
        }
        if let Some(segment_len) = self.segment_len {
            if segment_len == 0 || segment_len > MAX_SEGMENT_LEN {
                return Err(PutRequestError::InvalidSegmentLength(segment_len));
            }
        }
        Ok(())
    }
}
