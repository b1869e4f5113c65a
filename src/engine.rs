//! The engine context which owns all transaction state.
//!
//! All structural state lives in a single [EngineState] behind one coarse lock. Every operation
//! locks it once, stages the events it generates and publishes them only after the operation
//! succeeded, so callers never observe half-applied operations.
use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use spacepackets::cfdp::pdu::finished::FileStatus;
use spacepackets::cfdp::pdu::FileDirectiveType;
use spacepackets::cfdp::{
    ConditionCode, Direction, FaultHandlerCode, PduType, TransmissionMode,
};

use crate::config::{ConfigError, EngineConfig};
use crate::entity::{EntityProfile, EntityRegistry, RegistryError, DEFAULT_ACK_TIMER_INTERVAL};
use crate::event::{CfdpEvent, EventKind, EventQueue};
use crate::extents::Extent;
use crate::fault::resolve_handler;
use crate::filestore::{FilestoreError, NativeFilestore, VirtualFilestore};
use crate::inbound::{InboundContext, InboundFdu, InboundOutcome};
use crate::outbound::{display_name, FduState, OutboundFdu, OutboundFdus, OutboundPduKind};
use crate::pdu::{
    parse_pdu, EofPdu, FileDataPdu, FinishPdu, MetadataPdu, PduError, PduHeader, RawPdu,
};
use crate::request::{PutRequest, PutRequestError};
use crate::signal::{BufferPool, BufferReservation, Signal, Stopped};
use crate::time::{StdTimeProvider, TimeProvider};
use crate::{EntityNumber, TransactionId};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine was stopped")]
    Stopped(#[from] Stopped),
    #[error("transaction {0} is unknown")]
    UnknownTransaction(TransactionId),
    #[error("entity registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("put request: {0}")]
    PutRequest(#[from] PutRequestError),
    #[error("filestore: {0}")]
    Filestore(#[from] FilestoreError),
    #[error("PDU: {0}")]
    Pdu(#[from] PduError),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

/// PDU ready to be moved to the remote entity by the transport adapter.
///
/// The PDU holds one unit of the outbound buffer pool until it is dropped.
#[derive(Debug)]
pub struct OutboundPdu {
    pub id: TransactionId,
    /// Entity the PDU has to be sent to.
    pub destination: EntityNumber,
    pub kind: OutboundPduKind,
    pub bytes: Vec<u8>,
    _reservation: BufferReservation,
}

/// What happened to a received PDU.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InboundDisposition {
    Processed,
    /// The PDU was malformed, not addressed to the local entity or did not match any
    /// transaction.
    Dropped,
}

#[derive(Debug, Clone)]
struct QueuedFinish {
    id: TransactionId,
    bytes: Vec<u8>,
}

/// Forward PDU after parsing, before it is dispatched to its inbound FDU.
enum ForwardPdu<'raw> {
    Metadata(MetadataPdu),
    FileData(FileDataPdu<'raw>),
    Eof(EofPdu),
}

#[derive(Debug)]
struct EngineState {
    config: EngineConfig,
    registry: EntityRegistry,
    outbound: OutboundFdus,
    finishes: VecDeque<QueuedFinish>,
    last_transaction_number: u64,
}

impl EngineState {
    fn next_transaction_number(&self) -> u64 {
        if self.last_transaction_number >= self.config.max_transaction_number {
            1
        } else {
            self.last_transaction_number + 1
        }
    }

    fn is_outbound(&self, id: &TransactionId) -> bool {
        id.source() == self.config.local_entity
    }

    fn cancel_outbound(
        &mut self,
        id: TransactionId,
        condition: ConditionCode,
        now: u64,
        events: &mut Vec<CfdpEvent>,
    ) -> bool {
        let Some(fdu) = self.outbound.find_mut(&id) else {
            return false;
        };
        match fdu.cancel(condition) {
            Some(event) => {
                info!("{id}: outbound transaction canceled: {condition:?}");
                events.push(CfdpEvent::new(id, now, event));
                self.outbound.disarm_finish(&id);
                true
            }
            None => false,
        }
    }

    fn abandon_outbound(
        &mut self,
        id: TransactionId,
        condition: ConditionCode,
        now: u64,
        events: &mut Vec<CfdpEvent>,
    ) -> bool {
        match self.outbound.remove(&id) {
            Some(mut fdu) => {
                info!("{id}: abandoning outbound transaction: {condition:?}");
                events.push(CfdpEvent::new(id, now, fdu.abandoned_event(condition)));
                fdu.release();
                true
            }
            None => false,
        }
    }

    /// Apply the fault handler of an outbound transaction. Unknown transactions only resolve the
    /// handler of the global table.
    fn fault_outbound(
        &mut self,
        id: TransactionId,
        condition: ConditionCode,
        now: u64,
        events: &mut Vec<CfdpEvent>,
    ) -> FaultHandlerCode {
        let Some(fdu) = self.outbound.find(&id) else {
            debug!("{id}: fault {condition:?} for unknown outbound transaction");
            return self.config.fault_handlers.get_fault_handler(condition);
        };
        let entity_handlers = self
            .registry
            .find(fdu.destination())
            .map(|entity| entity.fault_handlers);
        let handler = resolve_handler(
            Some(fdu.fault_handlers()),
            entity_handlers.as_ref(),
            &self.config.fault_handlers,
            condition,
        );
        let progress = fdu.progress();
        warn!("{id}: outbound fault {condition:?}, handler {handler:?}");
        match handler {
            FaultHandlerCode::NoticeOfCancellation => {
                self.cancel_outbound(id, condition, now, events);
            }
            FaultHandlerCode::NoticeOfSuspension => {
                if let Some(event) = self
                    .outbound
                    .find_mut(&id)
                    .and_then(|fdu| fdu.suspend(condition))
                {
                    events.push(CfdpEvent::new(id, now, event));
                }
            }
            FaultHandlerCode::IgnoreError => {
                events.push(CfdpEvent::new(
                    id,
                    now,
                    EventKind::Fault {
                        condition,
                        progress,
                    },
                ));
            }
            FaultHandlerCode::AbandonTransaction => {
                self.abandon_outbound(id, condition, now, events);
            }
        }
        handler
    }

    /// Bookkeeping after the EOF PDU of an outbound transaction was handed out.
    fn eof_sent(&mut self, id: TransactionId, now: u64, events: &mut Vec<CfdpEvent>) {
        events.push(CfdpEvent::new(id, now, EventKind::EofSent));
        let Some(fdu) = self.outbound.find(&id) else {
            return;
        };
        if fdu.closure_requested() {
            let interval = self
                .registry
                .find(fdu.destination())
                .map(|entity| entity.ack_timer_interval)
                .unwrap_or(DEFAULT_ACK_TIMER_INTERVAL);
            self.outbound
                .arm_finish(id, now.saturating_add(interval as u64));
            return;
        }
        if let Some(mut fdu) = self.outbound.remove(&id) {
            info!(
                "{id}: outbound transaction finished, {} bytes sent",
                fdu.progress()
            );
            events.push(CfdpEvent::new(
                id,
                now,
                fdu.finished_event(ConditionCode::NoError, FileStatus::Unreported),
            ));
            fdu.release();
        }
    }
}

/// CFDP engine for one local entity.
///
/// The engine is shared between the transport adapters, the user application and the deadline
/// scanner, usually inside an [Arc]. It does not spawn any threads itself.
#[derive(Debug)]
pub struct Engine<Vfs: VirtualFilestore = NativeFilestore, Clock: TimeProvider = StdTimeProvider> {
    state: Mutex<EngineState>,
    vfs: Vfs,
    clock: Clock,
    events: EventQueue,
    new_work: Signal,
    buffers: Arc<BufferPool>,
}

impl Engine<NativeFilestore, StdTimeProvider> {
    /// Engine using the native file system and the system clock.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_filestore_and_clock(config, NativeFilestore::default(), StdTimeProvider)
    }
}

impl<Vfs: VirtualFilestore, Clock: TimeProvider> Engine<Vfs, Clock> {
    pub fn with_filestore_and_clock(
        config: EngineConfig,
        vfs: Vfs,
        clock: Clock,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        info!(
            "starting CFDP engine for entity {} in {}",
            config.local_entity,
            config.working_dir.display()
        );
        Ok(Self {
            events: EventQueue::new(config.max_events),
            buffers: BufferPool::new(config.outbound_buffer_units),
            state: Mutex::new(EngineState {
                config,
                registry: EntityRegistry::default(),
                outbound: OutboundFdus::default(),
                finishes: VecDeque::new(),
                last_transaction_number: 0,
            }),
            vfs,
            clock,
            new_work: Signal::default(),
        })
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    pub fn config(&self) -> EngineConfig {
        self.state.lock().config.clone()
    }

    pub fn local_entity(&self) -> EntityNumber {
        self.state.lock().config.local_entity
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.new_work.is_ended() {
            return Err(Stopped.into());
        }
        Ok(())
    }

    pub fn add_entity(&self, profile: &EntityProfile) -> Result<(), EngineError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.registry.add(profile, &state.config)?;
        info!("added entity {}", profile.number);
        Ok(())
    }

    pub fn change_entity(&self, profile: &EntityProfile) -> Result<(), EngineError> {
        self.state.lock().registry.change(profile)?;
        info!("changed entity {}", profile.number);
        Ok(())
    }

    /// Remove an entity. Fails while inbound transactions from that entity are pending.
    pub fn remove_entity(&self, number: EntityNumber) -> Result<EntityProfile, EngineError> {
        let entity = self.state.lock().registry.remove(number)?;
        info!("removed entity {number}");
        Ok(entity.profile())
    }

    pub fn entity(&self, number: EntityNumber) -> Option<EntityProfile> {
        self.state
            .lock()
            .registry
            .find(number)
            .map(|entity| entity.profile())
    }

    pub fn entities(&self) -> Vec<EntityProfile> {
        self.state
            .lock()
            .registry
            .iter()
            .map(|entity| entity.profile())
            .collect()
    }

    /// Override the fault handler for one condition of a remote entity.
    pub fn set_entity_fault_handler(
        &self,
        number: EntityNumber,
        condition: ConditionCode,
        handler: FaultHandlerCode,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let entity = state
            .registry
            .find_mut(number)
            .ok_or(RegistryError::Unknown(number))?;
        entity.fault_handlers.set(condition, handler);
        Ok(())
    }

    /// Change the global fault handler for one condition.
    pub fn set_fault_handler(&self, condition: ConditionCode, handler: FaultHandlerCode) {
        self.state
            .lock()
            .config
            .fault_handlers
            .set_fault_handler(condition, handler);
    }

    /// Start a new outbound transaction.
    pub fn put(&self, request: &PutRequest) -> Result<TransactionId, EngineError> {
        self.ensure_running()?;
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let destination = state
            .registry
            .find(request.destination_id)
            .ok_or(PutRequestError::UnknownDestination(request.destination_id))?;
        let number = state.next_transaction_number();
        let id = TransactionId::new(state.config.local_entity, EntityNumber::new(number));
        let fdu =
            match OutboundFdu::from_put_request(id, request, destination, &state.config, &self.vfs) {
                Ok(fdu) => fdu,
                Err(e) => {
                    error!("{id}: rejecting put request: {e}");
                    return Err(e.into());
                }
            };
        info!(
            "{id}: starting transaction to entity {}, {} bytes from {}",
            request.destination_id,
            fdu.file_size(),
            request.source_file().map(display_name).unwrap_or("-")
        );
        state.last_transaction_number = number;
        state.outbound.push(fdu);
        self.events
            .push(CfdpEvent::new(id, now, EventKind::TransactionStarted));
        self.new_work.give();
        Ok(id)
    }

    /// Cancel a transaction. Returns false if the transaction was already canceled.
    ///
    /// No EOF PDU is sent for canceled outbound transactions. Canceled outbound FDUs remain
    /// visible until [Self::purge_canceled] is called.
    pub fn cancel(&self, id: TransactionId) -> Result<bool, EngineError> {
        self.ensure_running()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut events = Vec::new();
        let condition = ConditionCode::CancelRequestReceived;
        let canceled = if state.is_outbound(&id) {
            if state.outbound.find(&id).is_none() {
                return Err(EngineError::UnknownTransaction(id));
            }
            state.cancel_outbound(id, condition, now, &mut events)
        } else {
            self.process_inbound(&mut *state, id, now, &mut events, |fdu, ctx| {
                fdu.complete(condition, ctx)
            })?;
            true
        };
        self.events.extend(events);
        Ok(canceled)
    }

    /// Suspend an outbound transaction. Suspending inbound transactions is accepted but has no
    /// effect. Returns whether the state changed.
    pub fn suspend(&self, id: TransactionId) -> Result<bool, EngineError> {
        self.ensure_running()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        if !state.is_outbound(&id) {
            self.find_inbound(&state, &id)?;
            return Ok(false);
        }
        let fdu = state
            .outbound
            .find_mut(&id)
            .ok_or(EngineError::UnknownTransaction(id))?;
        match fdu.suspend(ConditionCode::SuspendRequestReceived) {
            Some(event) => {
                debug!("{id}: suspended");
                self.events.push(CfdpEvent::new(id, now, event));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Resume a suspended outbound transaction. Returns whether the state changed.
    pub fn resume(&self, id: TransactionId) -> Result<bool, EngineError> {
        self.ensure_running()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        if !state.is_outbound(&id) {
            self.find_inbound(&state, &id)?;
            return Ok(false);
        }
        let fdu = state
            .outbound
            .find_mut(&id)
            .ok_or(EngineError::UnknownTransaction(id))?;
        match fdu.resume() {
            Some(event) => {
                debug!("{id}: resumed");
                self.events.push(CfdpEvent::new(id, now, event));
                self.new_work.give();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Emit a [EventKind::Report] event with the status of the transaction.
    pub fn report(&self, id: TransactionId) -> Result<(), EngineError> {
        self.ensure_running()?;
        let now = self.clock.now();
        let state = self.state.lock();
        let status_report = if state.is_outbound(&id) {
            state
                .outbound
                .find(&id)
                .ok_or(EngineError::UnknownTransaction(id))?
                .status_report()
        } else {
            self.find_inbound(&state, &id)?.status_report()
        };
        self.events
            .push(CfdpEvent::new(id, now, EventKind::Report { status_report }));
        Ok(())
    }

    /// Apply the fault handler for the given condition to a transaction.
    ///
    /// This is the entry point for faults detected outside the engine, most notably the
    /// conditions returned by [Self::overdue_transactions]. Returns the applied handler.
    pub fn handle_fault(
        &self,
        id: TransactionId,
        condition: ConditionCode,
    ) -> Result<FaultHandlerCode, EngineError> {
        self.ensure_running()?;
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut events = Vec::new();
        let handler = if state.is_outbound(&id) {
            state.fault_outbound(id, condition, now, &mut events)
        } else {
            let known = state
                .registry
                .find(id.source())
                .is_some_and(|entity| entity.inbound_fdus.contains_key(&id.number()));
            if known {
                self.process_inbound(&mut *state, id, now, &mut events, |fdu, ctx| {
                    fdu.fault(condition, ctx)
                })?
                .0
            } else {
                debug!("{id}: fault {condition:?} for unknown inbound transaction");
                state.config.fault_handlers.get_fault_handler(condition)
            }
        };
        self.events.extend(events);
        Ok(handler)
    }

    fn find_inbound<'state>(
        &self,
        state: &'state EngineState,
        id: &TransactionId,
    ) -> Result<&'state InboundFdu, EngineError> {
        state
            .registry
            .find(id.source())
            .and_then(|entity| entity.inbound_fdus.get(&id.number()))
            .ok_or(EngineError::UnknownTransaction(*id))
    }

    /// Take an inbound FDU out of its entity, run `f` on it and put it back if it is still
    /// active. Finish PDUs of completed transactions are queued for the transport adapter.
    fn process_inbound<R>(
        &self,
        state: &mut EngineState,
        id: TransactionId,
        now: u64,
        events: &mut Vec<CfdpEvent>,
        f: impl FnOnce(&mut InboundFdu, &mut InboundContext<'_, Vfs>) -> R,
    ) -> Result<R, EngineError>
    where
        R: ProcessResult,
    {
        let EngineState {
            config,
            registry,
            finishes,
            ..
        } = state;
        let entity = registry
            .find_mut(id.source())
            .ok_or(EngineError::UnknownTransaction(id))?;
        let mut fdu = entity
            .inbound_fdus
            .remove(&id.number())
            .ok_or(EngineError::UnknownTransaction(id))?;
        let mut ctx = InboundContext {
            vfs: &self.vfs,
            config,
            entity_handlers: Some(entity.fault_handlers),
            now,
            events,
        };
        let result = f(&mut fdu, &mut ctx);
        match result.outcome() {
            InboundOutcome::Active => {
                entity.inbound_fdus.insert(id.number(), fdu);
            }
            InboundOutcome::Finished(Some(bytes)) => {
                finishes.push_back(QueuedFinish {
                    id,
                    bytes: bytes.clone(),
                });
                self.new_work.give();
            }
            InboundOutcome::Finished(None) | InboundOutcome::Abandoned => (),
        }
        Ok(result)
    }

    /// Block until the next outbound PDU is available.
    ///
    /// One unit of the outbound buffer pool is reserved before a PDU is built, so this call
    /// also blocks while all units are held by PDUs which were not dropped yet. Returns
    /// [EngineError::Stopped] once the engine was stopped.
    pub fn dequeue_outbound_pdu(&self) -> Result<OutboundPdu, EngineError> {
        loop {
            let reservation = self.buffers.reserve()?;
            if let Some(pdu) = self.next_outbound_pdu(reservation)? {
                return Ok(pdu);
            }
            self.new_work.take()?;
        }
    }

    /// Non-blocking variant of [Self::dequeue_outbound_pdu].
    pub fn try_dequeue_outbound_pdu(&self) -> Result<Option<OutboundPdu>, EngineError> {
        self.ensure_running()?;
        match self.buffers.try_reserve()? {
            Some(reservation) => self.next_outbound_pdu(reservation),
            None => Ok(None),
        }
    }

    /// Whether a call to [Self::dequeue_outbound_pdu] would return without waiting for work.
    pub fn has_pending_output(&self) -> bool {
        let state = self.state.lock();
        !state.finishes.is_empty() || state.outbound.has_ready()
    }

    fn next_outbound_pdu(
        &self,
        reservation: BufferReservation,
    ) -> Result<Option<OutboundPdu>, EngineError> {
        self.ensure_running()?;
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(finish) = state.finishes.pop_front() {
            return Ok(Some(OutboundPdu {
                id: finish.id,
                destination: finish.id.source(),
                kind: OutboundPduKind::Finish,
                bytes: finish.bytes,
                _reservation: reservation,
            }));
        }
        let mut events = Vec::new();
        loop {
            let Some(fdu) = state.outbound.next_ready_mut() else {
                self.events.extend(events);
                return Ok(None);
            };
            let id = fdu.id();
            let destination = fdu.destination();
            match fdu.next_pdu(&self.vfs) {
                Ok(Some(built)) => {
                    fdu.commit(built.kind);
                    if built.kind == OutboundPduKind::Eof {
                        state.eof_sent(id, now, &mut events);
                    }
                    self.events.extend(events);
                    return Ok(Some(OutboundPdu {
                        id,
                        destination,
                        kind: built.kind,
                        bytes: built.bytes,
                        _reservation: reservation,
                    }));
                }
                Ok(None) => {
                    self.events.extend(events);
                    return Ok(None);
                }
                Err(e) => {
                    warn!("{id}: reading source file failed: {e}");
                    state.fault_outbound(id, ConditionCode::FilestoreRejection, now, &mut events);
                    if let Some(fdu) = state.outbound.find_mut(&id) {
                        if fdu.is_ready() {
                            fdu.skip_segment();
                        }
                    }
                }
            }
        }
    }

    /// Process a received PDU.
    ///
    /// Malformed PDUs, PDUs with a CRC mismatch and PDUs which are not addressed to the local
    /// entity are dropped without an error.
    pub fn handle_inbound_pdu(&self, raw: &[u8]) -> Result<InboundDisposition, EngineError> {
        self.ensure_running()?;
        let pdu = match parse_pdu(raw) {
            Ok(pdu) => pdu,
            Err(e) => {
                debug!("dropping PDU: {e}");
                return Ok(InboundDisposition::Dropped);
            }
        };
        let header = pdu.header;
        let id = TransactionId::new(header.source, header.transaction_number);
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let addressee = match header.direction {
            Direction::TowardsReceiver => header.destination,
            Direction::TowardsSender => header.source,
        };
        if addressee != state.config.local_entity {
            debug!("{id}: dropping PDU addressed to entity {addressee}");
            return Ok(InboundDisposition::Dropped);
        }
        if header.transmission_mode == TransmissionMode::Acknowledged {
            warn!("{id}: dropping PDU of an acknowledged mode transaction");
            self.events.push(CfdpEvent::new(
                id,
                now,
                EventKind::Fault {
                    condition: ConditionCode::InvalidTransmissionMode,
                    progress: 0,
                },
            ));
            return Ok(InboundDisposition::Dropped);
        }
        match header.direction {
            Direction::TowardsSender => Ok(self.handle_finish(state, id, &pdu, now)),
            Direction::TowardsReceiver => {
                let forward = match parse_forward(&header, &pdu) {
                    Ok(Some(forward)) => forward,
                    Ok(None) => return Ok(InboundDisposition::Dropped),
                    Err(e) => {
                        debug!("{id}: dropping malformed PDU: {e}");
                        return Ok(InboundDisposition::Dropped);
                    }
                };
                self.handle_forward(state, id, forward, now)
            }
        }
    }

    fn handle_finish(
        &self,
        state: &mut EngineState,
        id: TransactionId,
        pdu: &RawPdu<'_>,
        now: u64,
    ) -> InboundDisposition {
        let finish = match pdu.directive() {
            Ok((FileDirectiveType::FinishedPdu, params)) => FinishPdu::from_params(params),
            Ok((directive, _)) => {
                debug!("{id}: dropping {directive:?} PDU sent towards the sender");
                return InboundDisposition::Dropped;
            }
            Err(e) => Err(e),
        };
        let finish = match finish {
            Ok(finish) => finish,
            Err(e) => {
                debug!("{id}: dropping malformed Finish PDU: {e}");
                return InboundDisposition::Dropped;
            }
        };
        let awaiting = state.outbound.find(&id).is_some_and(|fdu| {
            fdu.state() != FduState::Canceled && fdu.closure_requested() && fdu.eof_sent()
        });
        if !awaiting {
            debug!("{id}: ignoring unexpected Finish PDU");
            return InboundDisposition::Dropped;
        }
        let Some(mut fdu) = state.outbound.remove(&id) else {
            return InboundDisposition::Dropped;
        };
        info!(
            "{id}: outbound transaction finished with {:?}, {:?}, {:?}",
            finish.condition, finish.delivery_code, finish.file_status
        );
        self.events.push(CfdpEvent::new(
            id,
            now,
            EventKind::TransactionFinished {
                condition: finish.condition,
                delivery_code: finish.delivery_code,
                file_status: finish.file_status,
                progress: fdu.progress(),
                status_report: None,
                filestore_responses: finish.filestore_responses,
            },
        ));
        fdu.release();
        InboundDisposition::Processed
    }

    fn handle_forward(
        &self,
        state: &mut EngineState,
        id: TransactionId,
        forward: ForwardPdu<'_>,
        now: u64,
    ) -> Result<InboundDisposition, EngineError> {
        {
            let EngineState {
                config, registry, ..
            } = &mut *state;
            let entity = registry.find_or_register(id.source(), config);
            if !entity.inbound_fdus.contains_key(&id.number()) {
                info!("{id}: new inbound transaction");
                let mut fdu = InboundFdu::new(id, now, config);
                fdu.set_checksum_type(entity.inbound_checksum);
                entity.inbound_fdus.insert(id.number(), fdu);
            }
        }
        let mut events = Vec::new();
        self.process_inbound(state, id, now, &mut events, |fdu, ctx| match &forward {
            ForwardPdu::Metadata(metadata) => fdu.handle_metadata(metadata, ctx),
            ForwardPdu::FileData(file_data) => fdu.handle_file_data(file_data, ctx),
            ForwardPdu::Eof(eof) => fdu.handle_eof(eof, ctx),
        })?;
        self.events.extend(events);
        Ok(InboundDisposition::Processed)
    }

    /// Block until the next event is available. Returns [None] if the wait was interrupted with
    /// [Self::interrupt] or the engine was stopped.
    pub fn get_event(&self) -> Option<CfdpEvent> {
        self.events.wait_next()
    }

    pub fn try_get_event(&self) -> Option<CfdpEvent> {
        self.events.try_next()
    }

    /// Wake up a consumer blocked in [Self::get_event].
    pub fn interrupt(&self) {
        self.events.interrupt();
    }

    /// Read received bytes of an inbound transaction.
    pub fn preview(&self, id: TransactionId, offset: u64, len: u64) -> Result<Vec<u8>, EngineError> {
        let state = self.state.lock();
        let fdu = self.find_inbound(&state, &id)?;
        fdu.preview(&self.vfs, offset, len).map_err(|e| {
            error!("{id}: reading working file failed: {e}");
            e.into()
        })
    }

    /// Received extents of an inbound transaction.
    pub fn map(&self, id: TransactionId) -> Result<Vec<Extent>, EngineError> {
        let state = self.state.lock();
        Ok(self.find_inbound(&state, &id)?.extents().to_vec())
    }

    pub fn outbound_state(&self, id: TransactionId) -> Option<FduState> {
        self.state.lock().outbound.find(&id).map(OutboundFdu::state)
    }

    pub fn outbound_transaction_count(&self) -> usize {
        self.state.lock().outbound.len()
    }

    pub fn inbound_transaction_count(&self) -> usize {
        self.state
            .lock()
            .registry
            .iter()
            .map(|entity| entity.inbound_transaction_count())
            .sum()
    }

    /// Collect the transactions whose deadlines expired.
    ///
    /// This covers the inactivity limit and the check limit of inbound transactions and the
    /// Finish PDU deadline of outbound transactions with closure requested. Each expiry is
    /// reported once, the caller applies them with [Self::handle_fault].
    pub fn overdue_transactions(&self) -> Vec<(TransactionId, ConditionCode)> {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut overdue = Vec::new();
        for entity in state.registry.iter_mut() {
            for fdu in entity.inbound_fdus.values_mut() {
                if fdu.take_inactivity(now, &state.config) {
                    overdue.push((fdu.id(), ConditionCode::InactivityDetected));
                }
                if let Some(condition) = fdu.take_check_limit(now, &state.config) {
                    overdue.push((fdu.id(), condition));
                }
            }
        }
        let finishes: Vec<TransactionId> = state.outbound.overdue_finishes(now).collect();
        for id in finishes {
            state.outbound.disarm_finish(&id);
            overdue.push((id, ConditionCode::CheckLimitReached));
        }
        for (id, condition) in &overdue {
            debug!("{id}: deadline expired: {condition:?}");
        }
        overdue
    }

    /// Remove all canceled outbound transactions. Returns their number.
    pub fn purge_canceled(&self) -> usize {
        self.state.lock().outbound.purge_canceled()
    }

    /// Stop the engine. All blocked calls return and every following operation fails with
    /// [EngineError::Stopped].
    pub fn stop(&self) {
        info!("stopping CFDP engine");
        self.new_work.end();
        self.buffers.end();
        self.events.end();
    }

    pub fn is_stopped(&self) -> bool {
        self.new_work.is_ended()
    }
}

/// Result of a closure run on an inbound FDU. Exposes the outcome of the FDU.
trait ProcessResult {
    fn outcome(&self) -> &InboundOutcome;
}

impl ProcessResult for InboundOutcome {
    fn outcome(&self) -> &InboundOutcome {
        self
    }
}

impl ProcessResult for (FaultHandlerCode, InboundOutcome) {
    fn outcome(&self) -> &InboundOutcome {
        &self.1
    }
}

fn parse_forward<'raw>(
    header: &PduHeader,
    pdu: &RawPdu<'raw>,
) -> Result<Option<ForwardPdu<'raw>>, PduError> {
    if header.pdu_type == PduType::FileData {
        return Ok(Some(ForwardPdu::FileData(FileDataPdu::from_data_field(
            pdu.data_field,
            header.large_file,
            header.segment_metadata,
        )?)));
    }
    let (directive, params) = pdu.directive()?;
    Ok(match directive {
        FileDirectiveType::MetadataPdu => Some(ForwardPdu::Metadata(MetadataPdu::from_params(
            params,
            header.large_file,
        )?)),
        FileDirectiveType::EofPdu => Some(ForwardPdu::Eof(EofPdu::from_params(
            params,
            header.large_file,
        )?)),
        _ => {
            debug!("dropping {directive:?} PDU");
            None
        }
    })
}
