//! CFDP indications delivered to the user application.
use std::collections::VecDeque;

use derive_new::new;
use log::debug;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use spacepackets::cfdp::pdu::finished::{DeliveryCode, FileStatus};
use spacepackets::cfdp::ConditionCode;

use crate::filestore::FilestoreResponse;
use crate::pdu::ContinuationState;
use crate::TransactionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    TransactionStarted,
    EofSent,
    TransactionFinished {
        condition: ConditionCode,
        delivery_code: DeliveryCode,
        file_status: FileStatus,
        progress: u64,
        status_report: Option<String>,
        filestore_responses: Vec<FilestoreResponse>,
    },
    MetadataRecv {
        source_file: Option<String>,
        dest_file: Option<String>,
        file_size: u64,
        messages_to_user: Vec<Vec<u8>>,
    },
    FileSegmentRecv {
        offset: u64,
        length: u64,
        continuation_state: ContinuationState,
        segment_metadata: SmallVec<[u8; 16]>,
    },
    EofRecv {
        file_size: u64,
    },
    Suspended {
        condition: ConditionCode,
    },
    Resumed {
        progress: u64,
    },
    Report {
        status_report: String,
    },
    Fault {
        condition: ConditionCode,
        progress: u64,
    },
    Abandoned {
        condition: ConditionCode,
        progress: u64,
    },
}

/// Indication for a single transaction. The timestamp is in seconds since the UNIX epoch.
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct CfdpEvent {
    pub id: TransactionId,
    pub timestamp: u64,
    pub kind: EventKind,
}

impl CfdpEvent {
    /// Condition code carried by the event, if any.
    pub fn condition(&self) -> Option<ConditionCode> {
        match &self.kind {
            EventKind::TransactionFinished { condition, .. }
            | EventKind::Suspended { condition }
            | EventKind::Fault { condition, .. }
            | EventKind::Abandoned { condition, .. } => Some(*condition),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<CfdpEvent>,
    interrupted: bool,
    ended: bool,
}

/// Bounded FIFO of events. The oldest event is dropped when a new one does not fit.
#[derive(Debug)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cond: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, event: CfdpEvent) {
        self.extend(core::iter::once(event));
    }

    pub fn extend(&self, events: impl IntoIterator<Item = CfdpEvent>) {
        let mut state = self.state.lock();
        let mut pushed = false;
        for event in events {
            if state.events.len() >= self.capacity {
                if let Some(evicted) = state.events.pop_front() {
                    debug!("event queue full, dropping {:?} for {}", evicted.kind, evicted.id);
                }
            }
            state.events.push_back(event);
            pushed = true;
        }
        if pushed {
            self.cond.notify_all();
        }
    }

    /// Block until an event is available. Returns [None] if the wait was interrupted with
    /// [Self::interrupt] or the queue was ended.
    pub fn wait_next(&self) -> Option<CfdpEvent> {
        let mut state = self.state.lock();
        loop {
            if let Some(event) = state.events.pop_front() {
                return Some(event);
            }
            if state.interrupted {
                state.interrupted = false;
                return None;
            }
            if state.ended {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    pub fn try_next(&self) -> Option<CfdpEvent> {
        self.state.lock().events.pop_front()
    }

    /// Wake up a blocked consumer without an event.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.cond.notify_all();
    }

    pub fn end(&self) {
        let mut state = self.state.lock();
        state.ended = true;
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::EntityNumber;

    use super::*;

    fn event(number: u64) -> CfdpEvent {
        CfdpEvent::new(
            TransactionId::new(EntityNumber::new(1), EntityNumber::new(number)),
            0,
            EventKind::TransactionStarted,
        )
    }

    #[test]
    fn test_fifo_order() {
        let queue = EventQueue::new(4);
        queue.push(event(1));
        queue.push(event(2));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_next().unwrap().id.number().value(), 1);
        assert_eq!(queue.wait_next().unwrap().id.number().value(), 2);
        assert!(queue.try_next().is_none());
    }

    #[test]
    fn test_oldest_evicted() {
        let queue = EventQueue::new(2);
        queue.extend((1..=3).map(event));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_next().unwrap().id.number().value(), 2);
        assert_eq!(queue.try_next().unwrap().id.number().value(), 3);
    }

    #[test]
    fn test_interrupt_wakes_consumer() {
        let queue = Arc::new(EventQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait_next())
        };
        thread::sleep(Duration::from_millis(20));
        queue.interrupt();
        assert!(consumer.join().unwrap().is_none());
        // The interruption is consumed, events are delivered again afterwards.
        queue.push(event(5));
        assert_eq!(queue.wait_next().unwrap().id.number().value(), 5);
    }

    #[test]
    fn test_blocked_consumer_receives_event() {
        let queue = Arc::new(EventQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.wait_next())
        };
        thread::sleep(Duration::from_millis(20));
        queue.push(event(9));
        assert_eq!(consumer.join().unwrap().unwrap().id.number().value(), 9);
    }

    #[test]
    fn test_condition_accessor() {
        let id = TransactionId::new(EntityNumber::new(1), EntityNumber::new(1));
        let fault = CfdpEvent::new(
            id,
            0,
            EventKind::Fault {
                condition: ConditionCode::FileSizeError,
                progress: 3,
            },
        );
        assert_eq!(fault.condition(), Some(ConditionCode::FileSizeError));
        assert_eq!(event(1).condition(), None);
    }
}
