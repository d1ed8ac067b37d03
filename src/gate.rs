//! Admission control for the write queue.
//!
//! The gate tracks how many bytes are admitted into the queue and blocks
//! producers until the budget has room. A request larger than the whole budget
//! is admitted once nothing else is charged, otherwise it could never get in.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct GateState {
    charged: u64,
    outstanding: usize,
    peak: u64,
}

/// Byte budget shared by producers and the worker.
#[derive(Debug)]
pub struct BufferGate {
    max_buffer_size: u64,
    state: Mutex<GateState>,
    changed: Condvar,
}

impl BufferGate {
    /// Creates a gate with the given budget in bytes.
    #[must_use]
    pub fn new(max_buffer_size: u64) -> Self {
        Self {
            max_buffer_size,
            state: Mutex::new(GateState::default()),
            changed: Condvar::new(),
        }
    }

    /// The configured budget.
    #[must_use]
    pub const fn max_buffer_size(&self) -> u64 {
        self.max_buffer_size
    }

    /// Blocks until `wanted` bytes fit in the budget, or until nothing is
    /// charged at all, then charges them.
    ///
    /// The returned [`Reservation`] releases the charge when dropped.
    pub fn reserve(self: &Arc<Self>, wanted: u64) -> Reservation {
        let mut state = self.state.lock();
        while !(state.charged == 0 || state.charged.saturating_add(wanted) <= self.max_buffer_size) {
            tracing::trace!(wanted, charged = state.charged, max = self.max_buffer_size, "waiting for buffer space");
            self.changed.wait(&mut state);
        }
        state.charged += wanted;
        state.outstanding += 1;
        state.peak = state.peak.max(state.charged);
        tracing::trace!(wanted, charged = state.charged, "buffer space reserved");

        Reservation {
            gate: Arc::clone(self),
            size: wanted,
        }
    }

    fn release(&self, size: u64) {
        let mut state = self.state.lock();
        debug_assert!(state.charged >= size, "release of {size} exceeds charge {}", state.charged);
        state.charged = state.charged.saturating_sub(size);
        state.outstanding = state.outstanding.saturating_sub(1);
        tracing::trace!(released = size, charged = state.charged, "buffer space released");
        drop(state);
        self.changed.notify_all();
    }

    /// Bytes currently charged against the budget.
    #[must_use]
    pub fn charged_bytes(&self) -> u64 {
        self.state.lock().charged
    }

    /// Number of live reservations.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Highest charge observed since construction.
    #[must_use]
    pub fn peak_charged(&self) -> u64 {
        self.state.lock().peak
    }

    /// Blocks until every reservation has been released.
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.outstanding > 0 {
            self.changed.wait(&mut state);
        }
    }
}

/// A charge held against a [`BufferGate`].
#[derive(Debug)]
#[must_use = "dropping a reservation releases its charge immediately"]
pub struct Reservation {
    gate: Arc<BufferGate>,
    size: u64,
}

impl Reservation {
    /// Bytes held by this reservation.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Releases the charge now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.gate.release(self.size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn reserve_within_budget_does_not_block() {
        let gate = Arc::new(BufferGate::new(100));
        let a = gate.reserve(40);
        let b = gate.reserve(60);
        assert_eq!(gate.charged_bytes(), 100);
        assert_eq!(gate.outstanding(), 2);
        drop(a);
        b.release();
        assert_eq!(gate.charged_bytes(), 0);
        assert_eq!(gate.outstanding(), 0);
    }

    #[test]
    fn oversized_request_admitted_when_empty() {
        let gate = Arc::new(BufferGate::new(10));
        let big = gate.reserve(1_000);
        assert_eq!(gate.charged_bytes(), 1_000);
        assert_eq!(big.size(), 1_000);
        drop(big);
        assert_eq!(gate.charged_bytes(), 0);
    }

    #[test]
    fn reserve_blocks_until_release() {
        let gate = Arc::new(BufferGate::new(100));
        let held = gate.reserve(80);

        let admitted = Arc::new(AtomicBool::new(false));
        let waiter = {
            let gate = Arc::clone(&gate);
            let admitted = Arc::clone(&admitted);
            thread::spawn(move || {
                let r = gate.reserve(30);
                admitted.store(true, Ordering::SeqCst);
                r
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!admitted.load(Ordering::SeqCst));

        drop(held);
        let r = waiter.join().unwrap();
        assert!(admitted.load(Ordering::SeqCst));
        assert_eq!(gate.charged_bytes(), 30);
        drop(r);
    }

    #[test]
    fn second_oversized_waits_for_first() {
        let gate = Arc::new(BufferGate::new(10));
        let first = gate.reserve(50);

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.reserve(50))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(gate.charged_bytes(), 50);

        drop(first);
        let second = waiter.join().unwrap();
        assert_eq!(gate.charged_bytes(), 50);
        assert_eq!(gate.peak_charged(), 50);
        drop(second);
    }

    #[test]
    fn wait_idle_returns_after_last_release() {
        let gate = Arc::new(BufferGate::new(10));
        let r = gate.reserve(0);
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(r);
        });
        gate.wait_idle();
        assert_eq!(gate.outstanding(), 0);
        releaser.join().unwrap();
    }
}
