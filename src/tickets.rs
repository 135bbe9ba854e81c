//! Bounded ticket semaphores limiting concurrent read and write
//! transactions on the engine.

use crate::error::CaskError;
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketStats {
    pub used: u32,
    pub available: u32,
    pub capacity: u32,
}

struct TicketState {
    capacity: u32,
    used: u32,
}

/// A resizable counting semaphore. `resize` only blocks new acquisitions for
/// as long as it takes to adjust the capacity; tickets already out stay out.
pub struct TicketHolder {
    state: Mutex<TicketState>,
    cv: Condvar,
}

impl TicketHolder {
    pub fn new(capacity: u32) -> Self {
        Self {
            state: Mutex::new(TicketState { capacity, used: 0 }),
            cv: Condvar::new(),
        }
    }

    /// Blocks until a ticket is available.
    pub fn acquire(&self) -> Ticket<'_> {
        let mut state = self.state.lock();
        while state.used >= state.capacity {
            self.cv.wait(&mut state);
        }
        state.used += 1;
        Ticket { holder: self }
    }

    /// Non-blocking variant; `None` when the semaphore is exhausted.
    pub fn try_acquire(&self) -> Option<Ticket<'_>> {
        let mut state = self.state.lock();
        if state.used >= state.capacity {
            return None;
        }
        state.used += 1;
        Some(Ticket { holder: self })
    }

    fn release(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.used > 0);
        state.used = state.used.saturating_sub(1);
        drop(state);
        self.cv.notify_one();
    }

    pub fn used(&self) -> u32 {
        self.state.lock().used
    }

    pub fn available(&self) -> u32 {
        let state = self.state.lock();
        state.capacity.saturating_sub(state.used)
    }

    pub fn capacity(&self) -> u32 {
        self.state.lock().capacity
    }

    /// Adjusts the capacity. Growing wakes blocked waiters; shrinking lets
    /// outstanding tickets drain naturally.
    pub fn resize(&self, capacity: u32) -> Result<(), CaskError> {
        if capacity < 1 {
            return Err(CaskError::InvalidOptions(
                "ticket capacity must be at least 1".into(),
            ));
        }
        let mut state = self.state.lock();
        let grew = capacity > state.capacity;
        state.capacity = capacity;
        drop(state);
        if grew {
            self.cv.notify_all();
        }
        Ok(())
    }

    pub fn stats(&self) -> TicketStats {
        let state = self.state.lock();
        TicketStats {
            used: state.used,
            available: state.capacity.saturating_sub(state.used),
            capacity: state.capacity,
        }
    }
}

/// RAII ticket; releasing happens on drop.
pub struct Ticket<'a> {
    holder: &'a TicketHolder,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.holder.release();
    }
}

#[cfg(test)]
mod tests {
    use super::TicketHolder;
    use crate::error::CaskErrorCode;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_release_accounting() {
        let holder = TicketHolder::new(2);
        let t1 = holder.acquire();
        let t2 = holder.acquire();
        assert_eq!(holder.used(), 2);
        assert_eq!(holder.available(), 0);
        assert!(holder.try_acquire().is_none());
        drop(t1);
        assert_eq!(holder.available(), 1);
        drop(t2);
        assert_eq!(holder.used(), 0);
        assert_eq!(holder.capacity(), 2);
    }

    #[test]
    fn resize_rejects_zero() {
        let holder = TicketHolder::new(4);
        let err = holder.resize(0).expect_err("must reject");
        assert_eq!(err.code(), CaskErrorCode::InvalidOptions);
        holder.resize(1).expect("shrink");
        assert_eq!(holder.capacity(), 1);
    }

    #[test]
    fn resize_wakes_blocked_acquirer() {
        let holder = Arc::new(TicketHolder::new(1));
        let ticket = holder.acquire();

        let waiter = {
            let holder = Arc::clone(&holder);
            thread::spawn(move || {
                let _t = holder.acquire();
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        holder.resize(2).expect("grow");
        waiter.join().expect("waiter joins");
        drop(ticket);
        assert_eq!(holder.used(), 0);
    }

    #[test]
    fn shrink_below_outstanding_drains_naturally() {
        let holder = TicketHolder::new(3);
        let t1 = holder.acquire();
        let _t2 = holder.acquire();
        holder.resize(1).expect("shrink");
        assert_eq!(holder.available(), 0);
        assert!(holder.try_acquire().is_none());
        drop(t1);
        // Still over capacity until the second ticket returns.
        assert!(holder.try_acquire().is_none());
    }
}
