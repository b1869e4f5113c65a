//! Fault handler tables and the lookup policy.
//!
//! Every protocol fault is identified by its [ConditionCode] and mapped to one of the four
//! [FaultHandlerCode]s. The handler is looked up in the FDU override table first, then in the
//! table of the remote entity owning the transaction and finally in the global table of the
//! engine configuration.
use spacepackets::cfdp::{ConditionCode, FaultHandlerCode};

/// Number of representable condition codes. Condition codes are 4 bit wide on the wire.
pub const CONDITION_CODE_COUNT: usize = 16;

#[inline]
fn index(condition: ConditionCode) -> usize {
    (condition as u8 as usize) & (CONDITION_CODE_COUNT - 1)
}

/// Sparse handler table. Unset entries defer to the next table in the lookup chain.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FaultHandlerOverrides {
    handlers: [Option<FaultHandlerCode>; CONDITION_CODE_COUNT],
}

impl FaultHandlerOverrides {
    pub fn set(&mut self, condition: ConditionCode, handler: FaultHandlerCode) {
        self.handlers[index(condition)] = Some(handler);
    }

    /// Set an override from its raw wire representation. Returns false and leaves the table
    /// untouched if the handler code is invalid.
    pub fn set_raw(&mut self, condition: u8, handler: u8) -> bool {
        match FaultHandlerCode::try_from(handler) {
            Ok(handler) => {
                self.handlers[(condition as usize) & (CONDITION_CODE_COUNT - 1)] = Some(handler);
                true
            }
            Err(_) => false,
        }
    }

    pub fn clear(&mut self, condition: ConditionCode) {
        self.handlers[index(condition)] = None;
    }

    pub fn get(&self, condition: ConditionCode) -> Option<FaultHandlerCode> {
        self.handlers[index(condition)]
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.iter().all(Option::is_none)
    }

    /// Iterate over all set overrides as (raw condition code, handler) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u8, FaultHandlerCode)> + '_ {
        self.handlers
            .iter()
            .enumerate()
            .filter_map(|(idx, handler)| handler.map(|handler| (idx as u8, handler)))
    }
}

/// Complete handler table which terminates the lookup chain.
///
/// The default table ignores all faults except filestore rejections and check limit
/// expirations, which cancel the transaction. Ignoring checksum failures by default keeps the
/// check limit mechanism of unacknowledged transfers functional.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FaultHandlerTable {
    handlers: [FaultHandlerCode; CONDITION_CODE_COUNT],
}

impl Default for FaultHandlerTable {
    fn default() -> Self {
        let mut handlers = [FaultHandlerCode::IgnoreError; CONDITION_CODE_COUNT];
        handlers[index(ConditionCode::FilestoreRejection)] = FaultHandlerCode::NoticeOfCancellation;
        handlers[index(ConditionCode::CheckLimitReached)] = FaultHandlerCode::NoticeOfCancellation;
        Self { handlers }
    }
}

impl FaultHandlerTable {
    pub fn set_fault_handler(&mut self, condition: ConditionCode, handler: FaultHandlerCode) {
        self.handlers[index(condition)] = handler;
    }

    pub fn get_fault_handler(&self, condition: ConditionCode) -> FaultHandlerCode {
        self.handlers[index(condition)]
    }
}

/// Resolve the handler for a fault using the FDU overrides, the entity overrides and the global
/// table, in this order.
pub fn resolve_handler(
    fdu: Option<&FaultHandlerOverrides>,
    entity: Option<&FaultHandlerOverrides>,
    global: &FaultHandlerTable,
    condition: ConditionCode,
) -> FaultHandlerCode {
    fdu.and_then(|table| table.get(condition))
        .or_else(|| entity.and_then(|table| table.get(condition)))
        .unwrap_or_else(|| global.get_fault_handler(condition))
}
