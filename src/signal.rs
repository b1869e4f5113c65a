//! Blocking signals shared between the engine and the tasks driving it.
//!
//! Both primitives can be ended. Ending wakes up every waiter, which then observes [Stopped]
//! instead of a regular result. This is how an engine shutdown unblocks the transport adapters.
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Returned by blocking operations after the signal was ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[error("signal was ended")]
pub struct Stopped;

#[derive(Debug, Default)]
struct SignalState {
    count: u32,
    ended: bool,
}

/// Counting signal, similar to a counting semaphore.
#[derive(Debug, Default)]
pub struct Signal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl Signal {
    pub fn give(&self) {
        let mut state = self.state.lock();
        state.count = state.count.saturating_add(1);
        self.cond.notify_one();
    }

    /// Block until the signal was given at least once or until it is ended.
    pub fn take(&self) -> Result<(), Stopped> {
        let mut state = self.state.lock();
        loop {
            if state.ended {
                return Err(Stopped);
            }
            if state.count > 0 {
                state.count -= 1;
                return Ok(());
            }
            self.cond.wait(&mut state);
        }
    }

    /// Non-blocking variant of [Self::take]. Returns `Ok(false)` if the signal was not given.
    pub fn try_take(&self) -> Result<bool, Stopped> {
        let mut state = self.state.lock();
        if state.ended {
            return Err(Stopped);
        }
        if state.count > 0 {
            state.count -= 1;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn end(&self) {
        let mut state = self.state.lock();
        state.ended = true;
        self.cond.notify_all();
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }
}

#[derive(Debug)]
struct PoolState {
    available: usize,
    ended: bool,
}

/// Flow-controlled pool of output buffer units.
///
/// One unit is large enough for a maximum sized PDU. A unit is held by a [BufferReservation]
/// and returned to the pool when the reservation is dropped.
#[derive(Debug)]
pub struct BufferPool {
    state: Mutex<PoolState>,
    cond: Condvar,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                available: capacity,
                ended: false,
            }),
            cond: Condvar::new(),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Block until a unit is available or the pool is ended.
    pub fn reserve(self: &Arc<Self>) -> Result<BufferReservation, Stopped> {
        let mut state = self.state.lock();
        loop {
            if state.ended {
                return Err(Stopped);
            }
            if state.available > 0 {
                state.available -= 1;
                return Ok(BufferReservation {
                    pool: Arc::clone(self),
                });
            }
            self.cond.wait(&mut state);
        }
    }

    pub fn try_reserve(self: &Arc<Self>) -> Result<Option<BufferReservation>, Stopped> {
        let mut state = self.state.lock();
        if state.ended {
            return Err(Stopped);
        }
        if state.available == 0 {
            return Ok(None);
        }
        state.available -= 1;
        Ok(Some(BufferReservation {
            pool: Arc::clone(self),
        }))
    }

    pub fn end(&self) {
        let mut state = self.state.lock();
        state.ended = true;
        self.cond.notify_all();
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if state.available < self.capacity {
            state.available += 1;
        }
        self.cond.notify_one();
    }
}

/// One reserved buffer unit. Returned to its pool on drop.
#[derive(Debug)]
pub struct BufferReservation {
    pool: Arc<BufferPool>,
}

impl Drop for BufferReservation {
    fn drop(&mut self) {
        self.pool.release();
    }
}
