//! FIFO counting semaphore with hard cancellation.
//!
//! Admits at most `capacity` concurrent holders; excess acquirers queue in
//! FIFO order. `abort()` fails every queued acquirer and blocks new
//! admissions until `reset()`. Unlike `tokio::sync::Semaphore`, a freed slot
//! is handed directly to the woken waiter: `active` is not decremented on
//! release when the queue is non-empty, so a third party can never race into
//! the slot between release and wake-up.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;

use loresmith_shared::{LoresmithError, Result};

/// Concurrency-limiting primitive bounding simultaneous in-flight work.
pub struct Semaphore {
    state: Mutex<SemState>,
}

struct SemState {
    capacity: usize,
    active: usize,
    aborted: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// RAII admission token. Dropping it releases the slot.
pub struct Permit<'a> {
    sem: &'a Semaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

impl Semaphore {
    /// Create a semaphore admitting at most `capacity` holders (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(SemState {
                capacity: capacity.max(1),
                active: 0,
                aborted: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquire a slot, suspending FIFO-queued until one frees up.
    ///
    /// Fails immediately with `Aborted` if the semaphore is aborted; queued
    /// acquirers fail the same way when `abort()` is called while they wait.
    pub async fn acquire(&self) -> Result<Permit<'_>> {
        let rx = {
            let mut state = self.state.lock().expect("semaphore state poisoned");
            if state.aborted {
                return Err(LoresmithError::Aborted);
            }
            if state.active < state.capacity {
                state.active += 1;
                return Ok(Permit { sem: self });
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        // Suspend until a releasing holder hands us its slot. A dropped
        // sender means abort()/reset() cleared the queue.
        match rx.await {
            Ok(()) => Ok(Permit { sem: self }),
            Err(_) => Err(LoresmithError::Aborted),
        }
    }

    /// Release one slot: wake the head waiter if any, otherwise decrement
    /// `active`. Called from `Permit::drop`.
    fn release(&self) {
        let mut state = self.state.lock().expect("semaphore state poisoned");
        if !state.aborted {
            // Hand the slot to the next waiter without touching `active`.
            // A waiter whose receiver is gone is skipped.
            while let Some(tx) = state.waiters.pop_front() {
                if tx.send(()).is_ok() {
                    return;
                }
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    /// Fail every queued acquirer and reject new ones until `reset()`.
    /// Already-admitted holders are unaffected; they must check
    /// [`Semaphore::is_aborted`] themselves before doing more work.
    pub fn abort(&self) {
        let mut state = self.state.lock().expect("semaphore state poisoned");
        state.aborted = true;
        // Dropping the senders fails every queued acquire() with Aborted.
        state.waiters.clear();
    }

    /// Clear the aborted flag, the active count, and the queue. Used between
    /// independent batches; outstanding permits from the prior batch must be
    /// gone before calling this.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("semaphore state poisoned");
        state.aborted = false;
        state.active = 0;
        state.waiters.clear();
    }

    /// Whether `abort()` has been called without a subsequent `reset()`.
    pub fn is_aborted(&self) -> bool {
        self.state.lock().expect("semaphore state poisoned").aborted
    }

    /// Current number of admitted holders.
    pub fn active(&self) -> usize {
        self.state.lock().expect("semaphore state poisoned").active
    }
}
