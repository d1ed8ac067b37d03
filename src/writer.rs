//! Strategy selection and the gather-encode-store operations.
//!
//! Every participant runs the same selection on the same group-wide
//! [`SizeExtent`], so they all take the same branch:
//!
//! - **Scheduled**: some participant's payload alone exceeds the budget. The
//!   coordinator receives rank by rank and writes each segment as it arrives.
//!   Nothing is queued.
//! - **Background gather**: every payload fits but the total does not. The
//!   request is queued charged at its local size; the worker collects the rest.
//! - **Local gather**: the total fits. The coordinator collects inline and the
//!   worker only writes.

use std::path::Path;
use std::sync::Arc;

use crate::error::{CollatorError, CollatorResult, ProtocolError};
use crate::encoder::{BlockSink, FileEncoder};
use crate::group::{GroupChannel, Lane, Rank, SizeExtent, COORDINATOR};
use crate::request::{WriteOptions, WriteRequest};

/// Execution path chosen for one collective write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteStrategy {
    /// Synchronous rank-by-rank transfer and store.
    Scheduled,
    /// Queued; the worker gathers and writes.
    BackgroundGather,
    /// Gathered inline; the worker only writes.
    LocalGather,
}

/// Picks the execution path for a write.
///
/// A zero budget disables queueing altogether.
#[must_use]
pub const fn select_strategy(max_buffer_size: u64, extent: SizeExtent) -> WriteStrategy {
    if max_buffer_size == 0 || extent.max_local > max_buffer_size {
        WriteStrategy::Scheduled
    } else if extent.total > max_buffer_size {
        WriteStrategy::BackgroundGather
    } else {
        WriteStrategy::LocalGather
    }
}

/// Performs gathers and stores through a [`FileEncoder`].
pub struct CollectiveWriter {
    encoder: Arc<dyn FileEncoder>,
}

impl std::fmt::Debug for CollectiveWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectiveWriter").finish_non_exhaustive()
    }
}

impl CollectiveWriter {
    /// Creates a writer storing through `encoder`.
    #[must_use]
    pub fn new(encoder: Arc<dyn FileEncoder>) -> Self {
        Self { encoder }
    }

    /// Scheduled path: stream every rank's payload to storage in rank order.
    ///
    /// Non-coordinators hand their payload to the coordinator and return. The
    /// coordinator keeps receiving after a storage or protocol failure so the
    /// group stays in step, then reports the first failure. A failed block is
    /// rolled back by the sink and never replaces the previous file content.
    pub fn write_scheduled(
        &self,
        group: &dyn GroupChannel,
        type_tag: &str,
        path: &Path,
        payload: Vec<u8>,
        sizes: Option<&[u64]>,
        options: &WriteOptions,
    ) -> CollatorResult<()> {
        if !group.is_coordinator() {
            return group.send_to(Lane::Inline, COORDINATOR, payload);
        }

        let sizes = coordinator_sizes(group, sizes)?;
        let mut store: CollatorResult<Box<dyn BlockSink>> = self
            .encoder
            .open(path, options)
            .and_then(|mut sink| {
                sink.write_header(type_tag, sizes)?;
                sink.write_segment(&payload)?;
                Ok(sink)
            })
            .map_err(CollatorError::from);
        drop(payload);

        // Every rank's segment is consumed even after a failure, so no stale
        // message is left on the lane for the next write.
        for rank in 1..group.size() {
            let received = receive_segment(group, Lane::Inline, rank, sizes[rank]);
            let failed = match (store.as_mut(), received) {
                (Ok(sink), Ok(segment)) => sink.write_segment(&segment).err().map(CollatorError::from),
                (Ok(_), Err(err)) => Some(err),
                (Err(_), _) => None,
            };
            if let Some(err) = failed {
                tracing::warn!(path = %path.display(), rank, error = %err, "scheduled write failed, draining peers");
                store = Err(err);
            }
        }

        store?.finish()?;
        tracing::debug!(path = %path.display(), ranks = group.size(), "scheduled write complete");
        Ok(())
    }

    /// Local-gather path: collect every non-coordinator payload now.
    ///
    /// Returns the remote payloads concatenated in rank order on the
    /// coordinator, and an empty buffer elsewhere.
    pub fn gather_inline(
        &self,
        group: &dyn GroupChannel,
        payload: &[u8],
        sizes: Option<&[u64]>,
    ) -> CollatorResult<Vec<u8>> {
        if !group.is_coordinator() {
            group.send_to(Lane::Inline, COORDINATOR, payload.to_vec())?;
            return Ok(Vec::new());
        }
        let sizes = coordinator_sizes(group, sizes)?;
        gather(group, Lane::Inline, sizes)
    }

    /// Worker path: finish a queued request.
    ///
    /// Requests without pre-gathered bytes gather first (on the coordinator) or
    /// hand their payload over (elsewhere). Requests with pre-gathered bytes
    /// only need storing.
    pub fn write_request(&self, request: WriteRequest) -> CollatorResult<()> {
        let group = Arc::clone(request.group());

        if !group.is_coordinator() {
            if request.have_pre_gathered_payload() {
                return Ok(());
            }
            return group.send_to(Lane::Background, COORDINATOR, request.into_local_payload());
        }

        let sizes = coordinator_sizes(group.as_ref(), request.participant_sizes())?;
        if request.have_pre_gathered_payload() {
            return self.store(&request, sizes, request.pre_gathered_payload());
        }

        let remote = gather(group.as_ref(), Lane::Background, sizes)?;
        self.store(&request, sizes, &remote)
    }

    fn store(&self, request: &WriteRequest, sizes: &[u64], remote: &[u8]) -> CollatorResult<()> {
        let mut sink = self.encoder.open(request.path(), request.options())?;
        sink.write_header(request.type_tag(), sizes)?;
        sink.write_segment(request.local_payload())?;

        let mut offset = 0usize;
        for (rank, &size) in sizes.iter().enumerate().skip(1) {
            let len = usize::try_from(size)
                .map_err(|_| CollatorError::internal(format!("segment of rank {rank} too large: {size}")))?;
            let end = offset + len;
            let segment = remote.get(offset..end).ok_or_else(|| {
                CollatorError::internal(format!(
                    "gathered payload of {} bytes is short of rank {rank}'s segment",
                    remote.len()
                ))
            })?;
            sink.write_segment(segment)?;
            offset = end;
        }

        sink.finish()?;
        tracing::debug!(
            request = %request.id(),
            path = %request.path().display(),
            bytes = request.local_payload().len() + remote.len(),
            "collated block stored"
        );
        Ok(())
    }
}

fn coordinator_sizes<'a>(group: &dyn GroupChannel, sizes: Option<&'a [u64]>) -> CollatorResult<&'a [u64]> {
    let sizes = sizes.ok_or_else(|| CollatorError::internal("coordinator is missing the gathered sizes"))?;
    if sizes.len() != group.size() {
        return Err(ProtocolError::SizeCount {
            expected: group.size(),
            actual: sizes.len(),
        }
        .into());
    }
    Ok(sizes)
}

fn gather(group: &dyn GroupChannel, lane: Lane, sizes: &[u64]) -> CollatorResult<Vec<u8>> {
    let remote_total: u64 = sizes.iter().skip(1).sum();
    let mut gathered = Vec::with_capacity(usize::try_from(remote_total).unwrap_or(0));
    let mut failure = None;
    for rank in 1..group.size() {
        match receive_segment(group, lane, rank, sizes[rank]) {
            Ok(segment) if failure.is_none() => gathered.extend_from_slice(&segment),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(rank, ?lane, error = %err, "gather failed, draining remaining ranks");
                failure.get_or_insert(err);
            }
        }
    }
    failure.map_or(Ok(gathered), Err)
}

fn receive_segment(group: &dyn GroupChannel, lane: Lane, rank: Rank, expected: u64) -> CollatorResult<Vec<u8>> {
    let segment = group.receive_from(lane, rank)?;
    check_segment(rank, expected, &segment)?;
    Ok(segment)
}

fn check_segment(rank: Rank, expected: u64, segment: &[u8]) -> CollatorResult<()> {
    if segment.len() as u64 != expected {
        return Err(ProtocolError::SizeMismatch {
            rank,
            expected,
            actual: segment.len() as u64,
        }
        .into());
    }
    Ok(())
}
