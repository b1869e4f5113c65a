//! Receiving side of a transaction.
//!
//! An [InboundFdu] reassembles the file inside a working file named `cfdp.<source>.<number>` in
//! the working directory. File segments may arrive out of order, overlapping or duplicated. Only
//! bytes which were not received before are written and added to the checksum. Once the metadata
//! and the EOF PDU were received and all bytes are present, the checksum is verified and the
//! working file is moved to its destination.
use log::{debug, info, warn};
use spacepackets::cfdp::pdu::finished::{DeliveryCode, FileStatus};
use spacepackets::cfdp::{ChecksumType, ConditionCode, Direction, FaultHandlerCode, PduType};

use crate::checksum::{self, ChecksumAccumulator};
use crate::config::EngineConfig;
use crate::event::{CfdpEvent, EventKind};
use crate::extents::{Extent, ExtentList};
use crate::fault::{resolve_handler, FaultHandlerOverrides};
use crate::filestore::{
    execute_requests, resolve_path, FilestoreError, FilestoreRequest, FilestoreResponse,
    VirtualFilestore,
};
use crate::pdu::{assemble, EofPdu, FileDataPdu, FinishPdu, MetadataPdu, PduHeader, Tlv};
use crate::TransactionId;

const FILL_CHUNK_LEN: usize = 4096;

/// Everything an inbound FDU needs from the engine while it processes a PDU or a fault.
pub struct InboundContext<'ctx, Vfs: VirtualFilestore + ?Sized> {
    pub vfs: &'ctx Vfs,
    pub config: &'ctx EngineConfig,
    /// Fault handler overrides of the source entity.
    pub entity_handlers: Option<FaultHandlerOverrides>,
    pub now: u64,
    /// Events are staged here and published by the engine once the operation succeeded.
    pub events: &'ctx mut Vec<CfdpEvent>,
}

impl<Vfs: VirtualFilestore + ?Sized> InboundContext<'_, Vfs> {
    fn emit(&mut self, id: TransactionId, kind: EventKind) {
        self.events.push(CfdpEvent::new(id, self.now, kind));
    }
}

/// What the engine has to do with the FDU after it was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// The transaction is still in progress.
    Active,
    /// The transaction was completed. Contains the Finish PDU if closure was requested.
    Finished(Option<Vec<u8>>),
    Abandoned,
}

impl InboundOutcome {
    pub fn is_active(&self) -> bool {
        matches!(self, InboundOutcome::Active)
    }
}

#[derive(Debug, Clone)]
pub struct InboundFdu {
    id: TransactionId,
    metadata_received: bool,
    eof_received: bool,
    closure_requested: bool,
    source_file: Option<String>,
    dest_file: Option<String>,
    working_file: String,
    working_file_created: bool,
    fs_requests: Vec<FilestoreRequest>,
    flow_label: Option<Vec<u8>>,
    fault_handlers: FaultHandlerOverrides,
    extents: ExtentList,
    checksum: ChecksumAccumulator,
    eof_checksum: u32,
    file_size: u64,
    progress: u64,
    bytes_received: u64,
    checksum_verified: bool,
    inactivity_deadline: u64,
    check_deadline: Option<u64>,
    check_cycles: u32,
}

impl InboundFdu {
    pub fn new(id: TransactionId, now: u64, config: &EngineConfig) -> Self {
        let working_file = resolve_path(
            &config.working_dir,
            &format!("cfdp.{}.{}", id.source(), id.number()),
        );
        Self {
            id,
            metadata_received: false,
            eof_received: false,
            closure_requested: false,
            source_file: None,
            dest_file: None,
            working_file,
            working_file_created: false,
            fs_requests: Vec::new(),
            flow_label: None,
            fault_handlers: FaultHandlerOverrides::default(),
            extents: ExtentList::default(),
            checksum: ChecksumAccumulator::new(config.default_checksum).unwrap_or_default(),
            eof_checksum: 0,
            file_size: 0,
            progress: 0,
            bytes_received: 0,
            checksum_verified: false,
            inactivity_deadline: now.saturating_add(config.transaction_inactivity_limit),
            check_deadline: None,
            check_cycles: 0,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn metadata_received(&self) -> bool {
        self.metadata_received
    }

    pub fn eof_received(&self) -> bool {
        self.eof_received
    }

    pub fn source_file(&self) -> Option<&str> {
        self.source_file.as_deref()
    }

    pub fn dest_file(&self) -> Option<&str> {
        self.dest_file.as_deref()
    }

    pub fn working_file(&self) -> &str {
        &self.working_file
    }

    pub fn flow_label(&self) -> Option<&[u8]> {
        self.flow_label.as_deref()
    }

    pub fn extents(&self) -> &[Extent] {
        self.extents.extents()
    }

    pub fn checksum_type(&self) -> ChecksumType {
        self.checksum.checksum_type()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn progress(&self) -> u64 {
        self.progress
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn checksum_verified(&self) -> bool {
        self.checksum_verified
    }

    pub fn inactivity_deadline(&self) -> u64 {
        self.inactivity_deadline
    }

    pub fn check_deadline(&self) -> Option<u64> {
        self.check_deadline
    }

    /// Change the checksum type. This is rejected once file data was received, the previous type
    /// is kept in that case.
    pub fn set_checksum_type(&mut self, checksum_type: ChecksumType) -> bool {
        if checksum_type == self.checksum.checksum_type() {
            return true;
        }
        if self.checksum.has_data() {
            warn!(
                "{}: checksum type change to {:?} after file data was received, keeping {:?}",
                self.id,
                checksum_type,
                self.checksum.checksum_type()
            );
            return false;
        }
        match ChecksumAccumulator::new(checksum_type) {
            Some(accumulator) => {
                self.checksum = accumulator;
                true
            }
            None => false,
        }
    }

    pub fn status_report(&self) -> String {
        format!(
            "bytesReceived {}  size {}  progress {}",
            self.bytes_received, self.file_size, self.progress
        )
    }

    fn touch(&mut self, now: u64, config: &EngineConfig) {
        self.inactivity_deadline = now.saturating_add(config.transaction_inactivity_limit);
    }

    /// Returns true if the inactivity limit was reached. The deadline is re-armed.
    pub fn take_inactivity(&mut self, now: u64, config: &EngineConfig) -> bool {
        if self.inactivity_deadline > now {
            return false;
        }
        self.touch(now, config);
        true
    }

    /// Advance the check timer. Returns [ConditionCode::CheckLimitReached] once the timer expired
    /// `check_timeout_limit` times without the transaction being completed.
    pub fn take_check_limit(&mut self, now: u64, config: &EngineConfig) -> Option<ConditionCode> {
        let deadline = self.check_deadline?;
        if deadline > now {
            return None;
        }
        self.check_cycles += 1;
        if self.check_cycles >= config.check_timeout_limit {
            self.check_deadline = None;
            return Some(ConditionCode::CheckLimitReached);
        }
        debug!("{}: check timer expired {} times", self.id, self.check_cycles);
        self.check_deadline = Some(now.saturating_add(config.check_timer_period));
        None
    }

    pub fn handle_metadata<Vfs: VirtualFilestore + ?Sized>(
        &mut self,
        metadata: &MetadataPdu,
        ctx: &mut InboundContext<'_, Vfs>,
    ) -> InboundOutcome {
        self.touch(ctx.now, ctx.config);
        if self.metadata_received {
            debug!("{}: ignoring duplicate metadata PDU", self.id);
            return InboundOutcome::Active;
        }
        self.metadata_received = true;
        self.closure_requested = metadata.closure_requested;
        self.source_file = metadata.source_file.clone();
        self.dest_file = metadata.dest_file.clone();
        let mut messages_to_user = Vec::new();
        for tlv in &metadata.tlvs {
            match tlv {
                Tlv::FilestoreRequest(request) => self.fs_requests.push(request.clone()),
                Tlv::MessageToUser(msg) => messages_to_user.push(msg.clone()),
                Tlv::FaultHandlerOverride { condition, handler } => {
                    if !self.fault_handlers.set_raw(*condition, *handler) {
                        debug!(
                            "{}: invalid fault handler override {condition}:{handler}",
                            self.id
                        );
                    }
                }
                Tlv::FlowLabel(label) => self.flow_label = Some(label.clone()),
                Tlv::FilestoreResponse(_) | Tlv::EntityId(_) => (),
            }
        }
        ctx.emit(
            self.id,
            EventKind::MetadataRecv {
                source_file: self.source_file.clone(),
                dest_file: self.dest_file.clone(),
                // Projected size. The size asserted by the EOF PDU is authoritative.
                file_size: metadata.file_size,
                messages_to_user,
            },
        );

        match checksum::supported_from_raw(metadata.checksum_type) {
            Some(checksum_type) => {
                self.set_checksum_type(checksum_type);
            }
            None => {
                warn!(
                    "{}: unsupported checksum type {}",
                    self.id, metadata.checksum_type
                );
                let outcome = self.fault(ConditionCode::UnsupportedChecksumType, ctx).1;
                if !outcome.is_active() {
                    return outcome;
                }
            }
        }

        if let Some(dest_file) = &self.dest_file {
            let dest_path = resolve_path(&ctx.config.working_dir, dest_file);
            if ctx.vfs.exists(&dest_path).unwrap_or(false) {
                warn!("{}: destination file {dest_path} already exists", self.id);
                let outcome = self.fault(ConditionCode::FilestoreRejection, ctx).1;
                if !outcome.is_active() {
                    return outcome;
                }
            }
        }
        self.check_completion(ctx)
    }

    pub fn handle_file_data<Vfs: VirtualFilestore + ?Sized>(
        &mut self,
        file_data: &FileDataPdu<'_>,
        ctx: &mut InboundContext<'_, Vfs>,
    ) -> InboundOutcome {
        let length = file_data.data.len() as u64;
        let Some(end) = file_data.offset.checked_add(length) else {
            warn!(
                "{}: ignoring segment of {length} bytes at offset {}",
                self.id, file_data.offset
            );
            return InboundOutcome::Active;
        };
        if length == 0 {
            return InboundOutcome::Active;
        }
        self.touch(ctx.now, ctx.config);
        if end > self.progress {
            self.progress = end;
        }
        if self.eof_received && self.progress > self.file_size {
            warn!(
                "{}: file data up to {} exceeds file size {}",
                self.id, self.progress, self.file_size
            );
            let outcome = self.fault(ConditionCode::FileSizeError, ctx).1;
            if !outcome.is_active() {
                return outcome;
            }
        }

        let new_ranges = self.extents.insert(file_data.offset, length);
        if let Err(e) = self.write_ranges(file_data, &new_ranges, ctx) {
            warn!("{}: writing working file failed: {e}", self.id);
            let outcome = self.fault(ConditionCode::FilestoreRejection, ctx).1;
            if !outcome.is_active() {
                return outcome;
            }
        }
        ctx.emit(
            self.id,
            EventKind::FileSegmentRecv {
                offset: file_data.offset,
                length,
                continuation_state: file_data.continuation_state,
                segment_metadata: file_data.segment_metadata.clone().unwrap_or_default(),
            },
        );
        self.check_completion(ctx)
    }

    /// Write the new ranges of a segment. Ranges which could not be written are removed from
    /// the extents again so they are accepted on retransmission.
    fn write_ranges<Vfs: VirtualFilestore + ?Sized>(
        &mut self,
        file_data: &FileDataPdu<'_>,
        new_ranges: &[Extent],
        ctx: &mut InboundContext<'_, Vfs>,
    ) -> Result<(), FilestoreError> {
        if new_ranges.is_empty() {
            return Ok(());
        }
        for (idx, range) in new_ranges.iter().enumerate() {
            if let Err(e) = self.write_range(file_data, range, ctx) {
                for range in &new_ranges[idx..] {
                    self.extents.remove(range.offset, range.length);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn write_range<Vfs: VirtualFilestore + ?Sized>(
        &mut self,
        file_data: &FileDataPdu<'_>,
        range: &Extent,
        ctx: &mut InboundContext<'_, Vfs>,
    ) -> Result<(), FilestoreError> {
        self.create_working_file(ctx.vfs)?;
        let current_len = ctx.vfs.file_size(&self.working_file)?;
        if range.offset > current_len {
            self.fill(ctx.vfs, current_len, range.offset, ctx.config.fill_byte)?;
        }
        let start = (range.offset - file_data.offset) as usize;
        let data = &file_data.data[start..start + range.length as usize];
        ctx.vfs.write_data(&self.working_file, range.offset, data)?;
        self.checksum.add(range.offset, data);
        self.bytes_received += range.length;
        Ok(())
    }

    fn create_working_file<Vfs: VirtualFilestore + ?Sized>(
        &mut self,
        vfs: &Vfs,
    ) -> Result<(), FilestoreError> {
        if self.working_file_created {
            return Ok(());
        }
        if vfs.exists(&self.working_file)? {
            // Leftover of an earlier run with the same transaction ID.
            vfs.truncate_file(&self.working_file)?;
        } else {
            vfs.create_file(&self.working_file)?;
        }
        self.working_file_created = true;
        Ok(())
    }

    fn fill<Vfs: VirtualFilestore + ?Sized>(
        &self,
        vfs: &Vfs,
        from: u64,
        to: u64,
        fill_byte: u8,
    ) -> Result<(), FilestoreError> {
        let chunk = [fill_byte; FILL_CHUNK_LEN];
        let mut offset = from;
        while offset < to {
            let len = (to - offset).min(FILL_CHUNK_LEN as u64) as usize;
            vfs.write_data(&self.working_file, offset, &chunk[..len])?;
            offset += len as u64;
        }
        Ok(())
    }

    pub fn handle_eof<Vfs: VirtualFilestore + ?Sized>(
        &mut self,
        eof: &EofPdu,
        ctx: &mut InboundContext<'_, Vfs>,
    ) -> InboundOutcome {
        self.touch(ctx.now, ctx.config);
        if self.eof_received {
            debug!("{}: ignoring duplicate EOF PDU", self.id);
            return InboundOutcome::Active;
        }
        self.eof_received = true;
        self.file_size = eof.file_size;
        self.eof_checksum = eof.checksum;
        if eof.condition != ConditionCode::NoError {
            info!(
                "{}: sender canceled the transaction with {:?}",
                self.id, eof.condition
            );
            ctx.emit(
                self.id,
                EventKind::EofRecv {
                    file_size: eof.file_size,
                },
            );
            return self.complete(eof.condition, ctx);
        }
        if self.progress > self.file_size {
            warn!(
                "{}: received data up to {} exceeds file size {}",
                self.id, self.progress, self.file_size
            );
            let outcome = self.fault(ConditionCode::FileSizeError, ctx).1;
            if !outcome.is_active() {
                return outcome;
            }
        }
        ctx.emit(
            self.id,
            EventKind::EofRecv {
                file_size: eof.file_size,
            },
        );
        self.check_deadline = Some(ctx.now.saturating_add(ctx.config.check_timer_period));
        self.check_cycles = 0;
        self.check_completion(ctx)
    }

    fn verify_checksum<Vfs: VirtualFilestore + ?Sized>(&self, vfs: &Vfs) -> bool {
        let checksum_type = self.checksum.checksum_type();
        if checksum_type == ChecksumType::NullChecksum {
            return true;
        }
        let computed = match self.checksum.value() {
            Some(value) => Ok(value),
            None => {
                let mut buf = [0; FILL_CHUNK_LEN];
                vfs.calculate_checksum(&self.working_file, checksum_type, self.file_size, &mut buf)
            }
        };
        match computed {
            Ok(computed) => computed == self.eof_checksum,
            Err(e) => {
                warn!("{}: calculating checksum failed: {e}", self.id);
                false
            }
        }
    }

    /// Complete the transaction if the metadata, the EOF PDU and all file data were received.
    pub fn check_completion<Vfs: VirtualFilestore + ?Sized>(
        &mut self,
        ctx: &mut InboundContext<'_, Vfs>,
    ) -> InboundOutcome {
        if !self.metadata_received
            || !self.eof_received
            || self.bytes_received < self.file_size
        {
            return InboundOutcome::Active;
        }
        if self.verify_checksum(ctx.vfs) {
            self.checksum_verified = true;
        } else {
            warn!("{}: checksum verification failed", self.id);
            let outcome = self.fault(ConditionCode::FileChecksumFailure, ctx).1;
            if !outcome.is_active() {
                return outcome;
            }
        }
        self.complete(ConditionCode::NoError, ctx)
    }

    /// Apply the fault handler for the given condition.
    ///
    /// Suspension is not supported for inbound transactions and behaves like ignoring the fault
    /// without an event.
    pub fn fault<Vfs: VirtualFilestore + ?Sized>(
        &mut self,
        condition: ConditionCode,
        ctx: &mut InboundContext<'_, Vfs>,
    ) -> (FaultHandlerCode, InboundOutcome) {
        let handler = resolve_handler(
            Some(&self.fault_handlers),
            ctx.entity_handlers.as_ref(),
            &ctx.config.fault_handlers,
            condition,
        );
        let outcome = match handler {
            FaultHandlerCode::NoticeOfCancellation => self.complete(condition, ctx),
            FaultHandlerCode::NoticeOfSuspension => {
                debug!("{}: suspending inbound transactions is a no-op", self.id);
                InboundOutcome::Active
            }
            FaultHandlerCode::IgnoreError => {
                ctx.emit(
                    self.id,
                    EventKind::Fault {
                        condition,
                        progress: self.progress,
                    },
                );
                InboundOutcome::Active
            }
            FaultHandlerCode::AbandonTransaction => self.abandon(condition, ctx),
        };
        (handler, outcome)
    }

    fn discard_working_file<Vfs: VirtualFilestore + ?Sized>(&mut self, vfs: &Vfs) {
        if !self.working_file_created {
            return;
        }
        if let Err(e) = vfs.remove_file(&self.working_file) {
            warn!("{}: removing working file failed: {e}", self.id);
        }
        self.working_file_created = false;
    }

    /// Move the working file to the destination. Returns the file status.
    fn retain_file<Vfs: VirtualFilestore + ?Sized>(
        &mut self,
        dest_file: &str,
        ctx: &InboundContext<'_, Vfs>,
    ) -> FileStatus {
        let dest_path = resolve_path(&ctx.config.working_dir, dest_file);
        let result = self
            .create_working_file(ctx.vfs)
            .and_then(|_| ctx.vfs.rename_file(&self.working_file, &dest_path));
        match result {
            Ok(()) => {
                self.working_file_created = false;
                FileStatus::Retained
            }
            Err(e) => {
                warn!(
                    "{}: moving working file to {dest_path} failed: {e}",
                    self.id
                );
                self.discard_working_file(ctx.vfs);
                FileStatus::DiscardedFsRejection
            }
        }
    }

    /// Finish the transaction with the given condition.
    pub fn complete<Vfs: VirtualFilestore + ?Sized>(
        &mut self,
        condition: ConditionCode,
        ctx: &mut InboundContext<'_, Vfs>,
    ) -> InboundOutcome {
        let verified_delivery = if self.checksum_verified {
            DeliveryCode::Complete
        } else {
            DeliveryCode::Incomplete
        };
        let mut filestore_responses: Vec<FilestoreResponse> = Vec::new();
        let dest_file = self.dest_file.clone();
        let (file_status, delivery_code) = match condition {
            ConditionCode::NoError => {
                filestore_responses =
                    execute_requests(ctx.vfs, &self.fs_requests, &ctx.config.working_dir);
                match dest_file {
                    Some(dest_file) => match self.retain_file(&dest_file, ctx) {
                        FileStatus::Retained => (FileStatus::Retained, DeliveryCode::Complete),
                        status => (status, DeliveryCode::Incomplete),
                    },
                    None => {
                        self.discard_working_file(ctx.vfs);
                        (FileStatus::Unreported, DeliveryCode::Complete)
                    }
                }
            }
            ConditionCode::FilestoreRejection => {
                self.discard_working_file(ctx.vfs);
                (FileStatus::DiscardedFsRejection, DeliveryCode::Incomplete)
            }
            _ => match dest_file {
                None => {
                    self.discard_working_file(ctx.vfs);
                    (FileStatus::Unreported, verified_delivery)
                }
                Some(_) if ctx.config.discard_incomplete_file => {
                    self.discard_working_file(ctx.vfs);
                    (FileStatus::DiscardDeliberately, DeliveryCode::Incomplete)
                }
                Some(dest_file) => match self.retain_file(&dest_file, ctx) {
                    FileStatus::Retained => (FileStatus::Retained, verified_delivery),
                    status => (status, DeliveryCode::Incomplete),
                },
            },
        };
        info!(
            "{}: inbound transaction finished with {:?}, {:?}, {:?}",
            self.id, condition, delivery_code, file_status
        );

        let finish_pdu = if self.closure_requested {
            self.finish_pdu(
                condition,
                delivery_code,
                file_status,
                &filestore_responses,
                ctx.config,
            )
        } else {
            None
        };
        ctx.emit(
            self.id,
            EventKind::TransactionFinished {
                condition,
                delivery_code,
                file_status,
                progress: self.progress,
                status_report: Some(self.status_report()),
                filestore_responses,
            },
        );
        InboundOutcome::Finished(finish_pdu)
    }

    fn finish_pdu(
        &self,
        condition: ConditionCode,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
        filestore_responses: &[FilestoreResponse],
        config: &EngineConfig,
    ) -> Option<Vec<u8>> {
        let mut header = PduHeader::new_unacknowledged(
            PduType::FileDirective,
            Direction::TowardsSender,
            self.id.source(),
            self.id.number(),
            config.local_entity,
        );
        header.crc_flag = config.crc_required;
        let finish = FinishPdu {
            condition,
            delivery_code,
            file_status,
            filestore_responses: filestore_responses.to_vec(),
            fault_location: (condition != ConditionCode::NoError).then_some(config.local_entity),
        };
        match finish
            .to_bytes()
            .and_then(|data_field| assemble(&header, &data_field))
        {
            Ok(pdu) => Some(pdu),
            Err(e) => {
                warn!("{}: generating Finish PDU failed: {e}", self.id);
                None
            }
        }
    }

    /// Abandon the transaction. The working file is removed and no Finish PDU is sent.
    pub fn abandon<Vfs: VirtualFilestore + ?Sized>(
        &mut self,
        condition: ConditionCode,
        ctx: &mut InboundContext<'_, Vfs>,
    ) -> InboundOutcome {
        info!("{}: abandoning inbound transaction: {:?}", self.id, condition);
        ctx.emit(
            self.id,
            EventKind::Abandoned {
                condition,
                progress: self.progress,
            },
        );
        self.discard_working_file(ctx.vfs);
        InboundOutcome::Abandoned
    }

    /// Read bytes of the working file. Only bytes which were already received are meaningful.
    pub fn preview<Vfs: VirtualFilestore + ?Sized>(
        &self,
        vfs: &Vfs,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>, FilestoreError> {
        if !self.working_file_created {
            return Ok(Vec::new());
        }
        let file_size = vfs.file_size(&self.working_file)?;
        let len = len.min(file_size.saturating_sub(offset));
        let mut buf = vec![0; len as usize];
        vfs.read_data(&self.working_file, offset, &mut buf)?;
        Ok(buf)
    }
}
