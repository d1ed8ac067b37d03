//! The public collective writer.
//!
//! Every participant of a group owns one [`Collator`] over its own
//! [`GroupChannel`] member and calls [`Collator::write`] for the same outputs
//! in the same order. The call gathers sizes, picks a strategy, and either
//! writes before returning or hands the work to the background writer.
//!
//! Writes that were queued report success as soon as they are queued. If the
//! store later fails there is nobody to return the error to: it is logged,
//! counted in [`Collator::background_failures`], and kept for
//! [`Collator::take_background_errors`] (or aborts the process when
//! `fatal_background_errors` is configured).

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::CollatorConfig;
use crate::encoder::{BlockFileEncoder, FileEncoder};
use crate::error::CollatorResult;
use crate::gate::{BufferGate, Reservation};
use crate::group::{GroupChannel, Rank, SizeExtent};
use crate::queue::WriteQueue;
use crate::request::{validate_target, WriteOptions, WriteRequest};
use crate::worker::{FailureLog, Worker};
use crate::writer::{select_strategy, CollectiveWriter, WriteStrategy};

/// Collated, backpressure-bounded writer for one participant.
pub struct Collator {
    config: CollatorConfig,
    group: Arc<dyn GroupChannel>,
    writer: Arc<CollectiveWriter>,
    gate: Arc<BufferGate>,
    queue: Arc<WriteQueue>,
    worker: Mutex<Option<Worker>>,
    failures: Arc<FailureLog>,
}

impl std::fmt::Debug for Collator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collator")
            .field("rank", &self.group.rank())
            .field("group_size", &self.group.size())
            .field("config", &self.config)
            .field("pending", &self.queue.len())
            .field("charged_bytes", &self.gate.charged_bytes())
            .finish_non_exhaustive()
    }
}

impl Collator {
    /// Creates a collator with the given budget and the default encoder.
    pub fn new(group: Arc<dyn GroupChannel>, max_buffer_size: u64) -> CollatorResult<Self> {
        Self::with_config(group, CollatorConfig::with_max_buffer_size(max_buffer_size))
    }

    /// Creates a collator from a configuration, with the default encoder.
    pub fn with_config(group: Arc<dyn GroupChannel>, config: CollatorConfig) -> CollatorResult<Self> {
        Self::with_encoder(group, config, Arc::new(BlockFileEncoder::new()))
    }

    /// Creates a collator storing through a custom encoder.
    ///
    /// No thread is started here; the writer starts with the first queued
    /// request.
    pub fn with_encoder(
        group: Arc<dyn GroupChannel>,
        config: CollatorConfig,
        encoder: Arc<dyn FileEncoder>,
    ) -> CollatorResult<Self> {
        let config = config.validate()?;
        let gate = Arc::new(BufferGate::new(config.max_buffer_size));
        let queue = Arc::new(WriteQueue::new(Arc::clone(&gate)));
        let failures = Arc::new(FailureLog::new(config.fatal_background_errors));

        tracing::debug!(
            rank = group.rank(),
            group_size = group.size(),
            max_buffer_size = config.max_buffer_size,
            "collator created"
        );

        Ok(Self {
            config,
            group,
            writer: Arc::new(CollectiveWriter::new(encoder)),
            gate,
            queue,
            worker: Mutex::new(None),
            failures,
        })
    }

    /// Collective: writes this participant's `payload` into the collated file
    /// at `path`.
    ///
    /// Every participant must call this for the same output, in the same order
    /// relative to its other writes. Returns `Ok(true)` once the data is
    /// stored (scheduled path) or queued (buffered paths).
    ///
    /// # Errors
    /// - `Config` for an empty type tag or path (before any collective traffic)
    /// - `Io` if a synchronous store fails
    /// - `Protocol` if a peer diverges, disappears, or sends unannounced sizes
    pub fn write(
        &self,
        type_tag: &str,
        path: impl AsRef<Path>,
        payload: Vec<u8>,
        options: WriteOptions,
    ) -> CollatorResult<bool> {
        let path = path.as_ref();
        validate_target(type_tag, path)?;

        let local = payload.len() as u64;
        let sizes = self.group.gather_sizes(local)?;
        let extent = self
            .group
            .broadcast_extent(sizes.as_deref().map(SizeExtent::from_sizes))?;
        let strategy = select_strategy(self.gate.max_buffer_size(), extent);

        tracing::debug!(
            rank = self.group.rank(),
            type_tag,
            path = %path.display(),
            local,
            total = extent.total,
            max_local = extent.max_local,
            ?strategy,
            "collective write"
        );

        match strategy {
            WriteStrategy::Scheduled => {
                // Older queued writes finish first so writes never overlap.
                self.gate.wait_idle();
                self.writer
                    .write_scheduled(self.group.as_ref(), type_tag, path, payload, sizes.as_deref(), &options)?;
            }
            WriteStrategy::BackgroundGather => {
                let request = WriteRequest::new(Arc::clone(&self.group), type_tag, path, payload, sizes, options)?;
                let charge = self.gate.reserve(request.size());
                self.enqueue(request, charge)?;
            }
            WriteStrategy::LocalGather => {
                if !self.group.is_coordinator() {
                    self.writer.gather_inline(self.group.as_ref(), &payload, None)?;
                    return Ok(true);
                }
                let charge = self.gate.reserve(extent.total);
                let gathered = self.writer.gather_inline(self.group.as_ref(), &payload, sizes.as_deref())?;
                let request = WriteRequest::with_pre_gathered(
                    Arc::clone(&self.group),
                    type_tag,
                    path,
                    payload,
                    sizes,
                    gathered,
                    options,
                )?;
                self.enqueue(request, charge)?;
            }
        }
        Ok(true)
    }

    /// Like [`Collator::write`], but reports failure as `false` after logging it.
    pub fn write_ok(&self, type_tag: &str, path: impl AsRef<Path>, payload: Vec<u8>, options: WriteOptions) -> bool {
        let path = path.as_ref();
        match self.write(type_tag, path, payload, options) {
            Ok(written) => written,
            Err(err) => {
                tracing::error!(type_tag, path = %path.display(), error = %err, "collated write failed");
                false
            }
        }
    }

    fn enqueue(&self, request: WriteRequest, charge: Reservation) -> CollatorResult<()> {
        self.ensure_worker()?;
        tracing::debug!(
            request = %request.id(),
            path = %request.path().display(),
            charge = charge.size(),
            pre_gathered = request.have_pre_gathered_payload(),
            "request queued"
        );
        self.queue.push(request, charge)
    }

    fn ensure_worker(&self) -> CollatorResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            *worker = Some(Worker::spawn(
                &self.config.worker_name,
                Arc::clone(&self.queue),
                Arc::clone(&self.writer),
                Arc::clone(&self.failures),
            )?);
        }
        Ok(())
    }

    /// Blocks until every queued write has been stored (or has failed).
    pub fn flush(&self) {
        self.gate.wait_idle();
    }

    /// Requests waiting for the worker, excluding the one being written.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.queue.len()
    }

    /// Bytes charged by queued and in-flight requests.
    #[must_use]
    pub fn charged_bytes(&self) -> u64 {
        self.queue.charged_bytes()
    }

    /// Highest charge observed since construction.
    #[must_use]
    pub fn peak_charged_bytes(&self) -> u64 {
        self.gate.peak_charged()
    }

    /// Whether the background writer has been started.
    #[must_use]
    pub fn worker_started(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Number of background writes that failed.
    #[must_use]
    pub fn background_failures(&self) -> u64 {
        self.failures.count()
    }

    /// Drains the messages of the latest failed background writes (at most
    /// [`crate::worker::MAX_KEPT_FAILURES`]).
    pub fn take_background_errors(&self) -> Vec<String> {
        self.failures.take()
    }

    /// The configured budget.
    #[must_use]
    pub const fn max_buffer_size(&self) -> u64 {
        self.config.max_buffer_size
    }

    /// This participant's rank.
    #[must_use]
    pub fn rank(&self) -> Rank {
        self.group.rank()
    }

    /// Number of participants.
    #[must_use]
    pub fn group_size(&self) -> usize {
        self.group.size()
    }
}

impl Drop for Collator {
    fn drop(&mut self) {
        // Drain everything that was queued, then join. No request is dropped.
        let worker = self.worker.get_mut().take();
        match worker {
            Some(worker) => worker.shutdown(&self.queue),
            None => self.queue.close(),
        }
    }
}
