//! Background writer thread.
//!
//! One worker per collator. It pops requests in FIFO order, finishes each one
//! through the [`CollectiveWriter`], and releases the request's buffer charge
//! whatever the outcome. A failure here has no caller to return to, so it is
//! logged and recorded (or made fatal) instead.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{CollatorError, CollatorResult};
use crate::queue::{QueuedWrite, WriteQueue};
use crate::writer::CollectiveWriter;

/// Failure messages kept for [`FailureLog::take`]; older ones are dropped.
pub const MAX_KEPT_FAILURES: usize = 64;

/// Record of background-write failures.
///
/// Every failure is counted, but only the latest [`MAX_KEPT_FAILURES`]
/// messages are kept.
#[derive(Debug, Default)]
pub struct FailureLog {
    count: AtomicU64,
    messages: Mutex<VecDeque<String>>,
    fatal: bool,
}

impl FailureLog {
    /// Creates a log; with `fatal` set, the first failure aborts the process.
    #[must_use]
    pub fn new(fatal: bool) -> Self {
        Self {
            fatal,
            ..Self::default()
        }
    }

    fn record(&self, request: Uuid, path: &Path, err: &CollatorError) {
        tracing::error!(%request, path = %path.display(), error = %err, "background collated write failed");
        self.count.fetch_add(1, Ordering::Relaxed);
        let mut messages = self.messages.lock();
        if messages.len() == MAX_KEPT_FAILURES {
            messages.pop_front();
        }
        messages.push_back(format!("{}: {err}", path.display()));
        drop(messages);

        if self.fatal {
            tracing::error!("aborting: background write failures are fatal");
            std::process::abort();
        }
    }

    /// Number of failures recorded so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Drains the kept failure messages, oldest first.
    pub fn take(&self) -> Vec<String> {
        self.messages.lock().drain(..).collect()
    }
}

/// Handle to the running writer thread.
#[derive(Debug)]
pub struct Worker {
    handle: JoinHandle<()>,
}

impl Worker {
    /// Starts the writer thread on `queue`.
    pub fn spawn(
        name: &str,
        queue: Arc<WriteQueue>,
        writer: Arc<CollectiveWriter>,
        failures: Arc<FailureLog>,
    ) -> CollatorResult<Self> {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(&queue, &writer, &failures))
            .map_err(|e| CollatorError::internal(format!("failed to spawn writer thread: {e}")))?;
        tracing::info!(worker = name, "collator writer started");
        Ok(Self { handle })
    }

    /// Closes `queue`, lets the thread drain it, and waits for it to exit.
    pub fn shutdown(self, queue: &WriteQueue) {
        // Close first: the loop ends only once the queue is closed and empty.
        queue.close();
        if self.handle.join().is_err() {
            tracing::error!("collator writer thread panicked");
        }
        tracing::info!("collator writer stopped");
    }
}

fn worker_loop(queue: &WriteQueue, writer: &CollectiveWriter, failures: &FailureLog) {
    while let Some(QueuedWrite { request, charge }) = queue.blocking_pop() {
        let id = request.id();
        let path = request.path().to_path_buf();
        tracing::debug!(
            request = %id,
            path = %path.display(),
            pre_gathered = request.have_pre_gathered_payload(),
            charge = charge.size(),
            "writing queued request"
        );

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| writer.write_request(request)))
            .unwrap_or_else(|_| Err(CollatorError::internal("writer panicked")));
        if let Err(err) = outcome {
            failures.record(id, &path, &err);
        }

        // Released only after the store returned.
        drop(charge);
    }
}
