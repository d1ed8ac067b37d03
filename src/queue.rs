//! FIFO of pending writes shared by producers and the worker.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::{CollatorError, CollatorResult};
use crate::gate::{BufferGate, Reservation};
use crate::request::WriteRequest;

/// A request together with the buffer charge it holds.
///
/// Dropping it releases the charge, whichever way the write went.
#[derive(Debug)]
pub struct QueuedWrite {
    /// The pending write.
    pub request: WriteRequest,
    /// Charge against the gate, released on drop.
    pub charge: Reservation,
}

/// Unbounded FIFO; the [`BufferGate`] is what bounds it.
///
/// Once closed, `push` fails and `blocking_pop` keeps returning queued items
/// until the queue is empty, then `None`.
#[derive(Debug)]
pub struct WriteQueue {
    tx: Mutex<Option<Sender<QueuedWrite>>>,
    rx: Receiver<QueuedWrite>,
    gate: Arc<BufferGate>,
}

impl WriteQueue {
    /// Creates an open queue charging against `gate`.
    #[must_use]
    pub fn new(gate: Arc<BufferGate>) -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
            gate,
        }
    }

    /// Appends a charged request at the tail.
    pub fn push(&self, request: WriteRequest, charge: Reservation) -> CollatorResult<()> {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(CollatorError::internal("write queue is closed"));
        };
        tx.send(QueuedWrite { request, charge })
            .map_err(|_| CollatorError::internal("write queue receiver is gone"))
    }

    /// Removes the head, blocking while the queue is open and empty.
    pub fn blocking_pop(&self) -> Option<QueuedWrite> {
        self.rx.recv().ok()
    }

    /// Stops accepting new requests. Already queued requests stay poppable.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Number of requests waiting to be popped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether nothing is waiting to be popped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Bytes charged by queued and in-flight requests.
    #[must_use]
    pub fn charged_bytes(&self) -> u64 {
        self.gate.charged_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{GroupChannel, LocalGroup};
    use crate::request::WriteOptions;
    use std::thread;
    use std::time::Duration;

    fn request(tag: &str, len: usize) -> WriteRequest {
        let member: Arc<dyn GroupChannel> = Arc::new(LocalGroup::new(1).unwrap().remove(0));
        WriteRequest::new(member, tag, "out/f", vec![0; len], Some(vec![len as u64]), WriteOptions::binary())
            .unwrap()
    }

    #[test]
    fn pop_returns_requests_in_push_order() {
        let gate = Arc::new(BufferGate::new(1_000));
        let queue = WriteQueue::new(Arc::clone(&gate));
        for tag in ["a", "b", "c"] {
            let req = request(tag, 5);
            let charge = gate.reserve(req.size());
            queue.push(req, charge).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.charged_bytes(), 15);

        let tags: Vec<String> = (0..3)
            .map(|_| queue.blocking_pop().unwrap().request.type_tag().to_string())
            .collect();
        assert_eq!(tags, ["a", "b", "c"]);
        assert!(queue.is_empty());
        assert_eq!(queue.charged_bytes(), 0);
    }

    #[test]
    fn closed_queue_drains_then_ends() {
        let gate = Arc::new(BufferGate::new(1_000));
        let queue = WriteQueue::new(Arc::clone(&gate));
        let req = request("a", 1);
        let charge = gate.reserve(1);
        queue.push(req, charge).unwrap();
        queue.close();
        assert!(queue.is_closed());

        assert!(queue.blocking_pop().is_some());
        assert!(queue.blocking_pop().is_none());

        let req = request("b", 1);
        let charge = gate.reserve(1);
        assert!(queue.push(req, charge).unwrap_err().is_internal());
        assert_eq!(gate.charged_bytes(), 0);
    }

    #[test]
    fn pop_blocks_until_push() {
        let gate = Arc::new(BufferGate::new(1_000));
        let queue = Arc::new(WriteQueue::new(Arc::clone(&gate)));
        let popper = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.blocking_pop().map(|q| q.request.type_tag().to_string()))
        };
        thread::sleep(Duration::from_millis(20));
        let req = request("late", 2);
        let charge = gate.reserve(2);
        queue.push(req, charge).unwrap();
        assert_eq!(popper.join().unwrap().as_deref(), Some("late"));
    }
}
