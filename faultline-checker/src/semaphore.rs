//! A FIFO counting semaphore for bounding checker concurrency.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct State {
    permits: usize,
    /// Tickets waiting, in arrival order.
    queue: VecDeque<u64>,
    next_ticket: u64,
}

/// A counting semaphore that grants permits strictly in arrival order, so a
/// burst of expensive checks cannot starve an early caller.
pub struct FifoSemaphore {
    state: Mutex<State>,
    available: Condvar,
}

impl FifoSemaphore {
    pub fn new(permits: usize) -> Self {
        FifoSemaphore {
            state: Mutex::new(State {
                permits,
                queue: VecDeque::new(),
                next_ticket: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Blocks until a permit is available and every earlier caller has been
    /// served. The permit is released when the guard drops.
    pub fn acquire(&self) -> Permit<'_> {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);
        while state.permits == 0 || state.queue.front() != Some(&ticket) {
            self.available.wait(&mut state);
        }
        state.queue.pop_front();
        state.permits -= 1;
        // Wake the next waiter in line if a permit remains for it.
        if state.permits > 0 {
            self.available.notify_all();
        }
        Permit { semaphore: self }
    }
}

/// An acquired permit; dropping it releases the slot.
pub struct Permit<'a> {
    semaphore: &'a FifoSemaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut state = self.semaphore.state.lock();
        state.permits += 1;
        self.semaphore.available.notify_all();
    }
}
