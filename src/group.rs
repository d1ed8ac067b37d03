//! Group channel: the communicator the collator gathers through.
//!
//! The collator never talks to a concrete transport. It sees a
//! [`GroupChannel`]: a rank, a group size, and point-to-point byte messages on
//! a small set of [`Lane`]s. The size gather and the extent broadcast are
//! provided on top of those primitives, so a transport only has to move bytes.
//!
//! [`LocalGroup`] builds an in-memory group of `n` members wired together with
//! crossbeam channels. Each member can be moved onto its own thread to play
//! one participant.

use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::error::{CollatorError, CollatorResult, ConfigError, ProtocolError};

/// Participant index within a group.
pub type Rank = usize;

/// The participant that owns the collated artifact.
pub const COORDINATOR: Rank = 0;

/// Independent message streams between two participants.
///
/// Traffic generated on a caller's thread never shares a lane with traffic
/// generated on the background worker, so the two cannot steal each other's
/// messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// Size gather and extent broadcast (caller thread).
    Control,
    /// Payload transfer on the scheduled and local-gather paths (caller thread).
    Inline,
    /// Payload transfer on the background-gather path (worker thread).
    Background,
}

impl Lane {
    /// Every lane, in index order.
    pub const ALL: [Self; 3] = [Self::Control, Self::Inline, Self::Background];

    const fn index(self) -> usize {
        match self {
            Self::Control => 0,
            Self::Inline => 1,
            Self::Background => 2,
        }
    }
}

/// Group-wide size facts every participant needs to pick the same strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeExtent {
    /// Sum of every participant's payload length.
    pub total: u64,
    /// Largest single participant payload length.
    pub max_local: u64,
}

impl SizeExtent {
    const ENCODED_LEN: usize = 16;

    /// Computes the extent of a gathered size list.
    #[must_use]
    pub fn from_sizes(sizes: &[u64]) -> Self {
        Self {
            total: sizes.iter().sum(),
            max_local: sizes.iter().copied().max().unwrap_or(0),
        }
    }

    fn encode(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(&self.total.to_le_bytes());
        out.extend_from_slice(&self.max_local.to_le_bytes());
        out
    }

    fn decode(src: Rank, bytes: &[u8]) -> CollatorResult<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(malformed(src, format!("extent message of {} bytes", bytes.len())));
        }
        Ok(Self {
            total: read_u64(&bytes[..8]),
            max_local: read_u64(&bytes[8..]),
        })
    }
}

/// Communicator capability used by the collator.
///
/// Implementations must deliver messages between any ordered pair of ranks on
/// a given lane in send order.
pub trait GroupChannel: Send + Sync {
    /// This participant's rank.
    fn rank(&self) -> Rank;

    /// Number of participants in the group.
    fn size(&self) -> usize;

    /// Sends `payload` to `dst` on `lane`. Must not block on the receiver.
    fn send_to(&self, lane: Lane, dst: Rank, payload: Vec<u8>) -> CollatorResult<()>;

    /// Receives the next message from `src` on `lane`, blocking until it arrives.
    fn receive_from(&self, lane: Lane, src: Rank) -> CollatorResult<Vec<u8>>;

    /// Whether this participant is the coordinator.
    fn is_coordinator(&self) -> bool {
        self.rank() == COORDINATOR
    }

    /// Collective: gathers every participant's local size onto the coordinator.
    ///
    /// Returns the sizes in rank order on the coordinator, `None` elsewhere.
    fn gather_sizes(&self, local: u64) -> CollatorResult<Option<Vec<u64>>> {
        if !self.is_coordinator() {
            self.send_to(Lane::Control, COORDINATOR, local.to_le_bytes().to_vec())?;
            return Ok(None);
        }

        let mut sizes = Vec::with_capacity(self.size());
        sizes.push(local);
        for src in 1..self.size() {
            let msg = self.receive_from(Lane::Control, src)?;
            if msg.len() != 8 {
                return Err(malformed(src, format!("size message of {} bytes", msg.len())));
            }
            sizes.push(read_u64(&msg));
        }
        Ok(Some(sizes))
    }

    /// Collective: distributes the coordinator's extent to every participant.
    ///
    /// The coordinator passes `Some(extent)`; everyone else passes `None` and
    /// receives the coordinator's value.
    fn broadcast_extent(&self, extent: Option<SizeExtent>) -> CollatorResult<SizeExtent> {
        if !self.is_coordinator() {
            let msg = self.receive_from(Lane::Control, COORDINATOR)?;
            return SizeExtent::decode(COORDINATOR, &msg);
        }

        let extent = extent.ok_or_else(|| CollatorError::internal("coordinator broadcast without an extent"))?;
        for dst in 1..self.size() {
            self.send_to(Lane::Control, dst, extent.encode())?;
        }
        Ok(extent)
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn malformed(rank: Rank, reason: String) -> CollatorError {
    CollatorError::Protocol(ProtocolError::MalformedControl { rank, reason })
}

/// Factory for in-memory groups.
#[derive(Debug)]
pub struct LocalGroup;

impl LocalGroup {
    /// Creates `size` connected members with blocking receives.
    ///
    /// # Errors
    /// Returns `ConfigError::EmptyGroup` if `size` is zero.
    pub fn new(size: usize) -> CollatorResult<Vec<LocalMember>> {
        Self::build(size, None)
    }

    /// Creates `size` connected members whose receives give up after `timeout`.
    ///
    /// A receive that times out reports `ProtocolError::Stalled`, which is how a
    /// diverging collective call shows up instead of hanging forever.
    pub fn with_timeout(size: usize, timeout: Duration) -> CollatorResult<Vec<LocalMember>> {
        Self::build(size, Some(timeout))
    }

    fn build(size: usize, timeout: Option<Duration>) -> CollatorResult<Vec<LocalMember>> {
        if size == 0 {
            return Err(ConfigError::EmptyGroup { size }.into());
        }

        // senders[src][dst][lane], receivers[dst][src][lane]
        let mut senders: Vec<Vec<Vec<Sender<Vec<u8>>>>> = (0..size).map(|_| Vec::with_capacity(size)).collect();
        let mut receivers: Vec<Vec<Vec<Receiver<Vec<u8>>>>> =
            (0..size).map(|_| (0..size).map(|_| Vec::with_capacity(Lane::ALL.len())).collect()).collect();

        for (src, outboxes) in senders.iter_mut().enumerate() {
            for inboxes in &mut receivers {
                let mut lanes = Vec::with_capacity(Lane::ALL.len());
                for _ in Lane::ALL {
                    let (tx, rx) = unbounded();
                    lanes.push(tx);
                    inboxes[src].push(rx);
                }
                outboxes.push(lanes);
            }
        }

        Ok(senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(rank, (outboxes, inboxes))| LocalMember {
                rank,
                size,
                outboxes,
                inboxes,
                timeout,
            })
            .collect())
    }
}

/// One participant of a [`LocalGroup`].
#[derive(Debug)]
pub struct LocalMember {
    rank: Rank,
    size: usize,
    outboxes: Vec<Vec<Sender<Vec<u8>>>>,
    inboxes: Vec<Vec<Receiver<Vec<u8>>>>,
    timeout: Option<Duration>,
}

impl LocalMember {
    fn check_rank(&self, rank: Rank) -> CollatorResult<()> {
        if rank >= self.size {
            return Err(ProtocolError::InvalidRank { rank, size: self.size }.into());
        }
        Ok(())
    }
}

impl GroupChannel for LocalMember {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send_to(&self, lane: Lane, dst: Rank, payload: Vec<u8>) -> CollatorResult<()> {
        self.check_rank(dst)?;
        self.outboxes[dst][lane.index()]
            .send(payload)
            .map_err(|_| ProtocolError::Disconnected { rank: dst, lane }.into())
    }

    fn receive_from(&self, lane: Lane, src: Rank) -> CollatorResult<Vec<u8>> {
        self.check_rank(src)?;
        let rx = &self.inboxes[src][lane.index()];
        match self.timeout {
            None => rx
                .recv()
                .map_err(|_| ProtocolError::Disconnected { rank: src, lane }.into()),
            Some(timeout) => rx.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => ProtocolError::Stalled {
                    rank: src,
                    lane,
                    timeout_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
                }
                .into(),
                RecvTimeoutError::Disconnected => ProtocolError::Disconnected { rank: src, lane }.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn empty_group_is_rejected() {
        let err = LocalGroup::new(0).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn members_know_rank_and_size() {
        let members = LocalGroup::new(4).unwrap();
        for (i, m) in members.iter().enumerate() {
            assert_eq!(m.rank(), i);
            assert_eq!(m.size(), 4);
            assert_eq!(m.is_coordinator(), i == COORDINATOR);
        }
    }

    #[test]
    fn lanes_are_independent() {
        let members = LocalGroup::new(2).unwrap();
        members[1].send_to(Lane::Background, 0, b"bg".to_vec()).unwrap();
        members[1].send_to(Lane::Inline, 0, b"inline".to_vec()).unwrap();

        assert_eq!(members[0].receive_from(Lane::Inline, 1).unwrap(), b"inline");
        assert_eq!(members[0].receive_from(Lane::Background, 1).unwrap(), b"bg");
    }

    #[test]
    fn messages_arrive_in_send_order() {
        let members = LocalGroup::new(2).unwrap();
        for i in 0u8..5 {
            members[1].send_to(Lane::Inline, 0, vec![i]).unwrap();
        }
        for i in 0u8..5 {
            assert_eq!(members[0].receive_from(Lane::Inline, 1).unwrap(), vec![i]);
        }
    }

    #[test]
    fn gather_and_broadcast_across_threads() {
        let members = LocalGroup::new(3).unwrap();
        let handles: Vec<_> = members
            .into_iter()
            .map(|m| {
                thread::spawn(move || {
                    let local = (m.rank() as u64 + 1) * 10;
                    let sizes = m.gather_sizes(local).unwrap();
                    let extent = m.broadcast_extent(sizes.as_deref().map(SizeExtent::from_sizes)).unwrap();
                    (m.rank(), sizes, extent)
                })
            })
            .collect();

        for h in handles {
            let (rank, sizes, extent) = h.join().unwrap();
            if rank == COORDINATOR {
                assert_eq!(sizes, Some(vec![10, 20, 30]));
            } else {
                assert!(sizes.is_none());
            }
            assert_eq!(extent, SizeExtent { total: 60, max_local: 30 });
        }
    }

    #[test]
    fn receive_with_timeout_reports_stall() {
        let members = LocalGroup::with_timeout(2, Duration::from_millis(20)).unwrap();
        let err = members[0].receive_from(Lane::Inline, 1).unwrap_err();
        let CollatorError::Protocol(ProtocolError::Stalled { rank, lane, timeout_ms }) = err else {
            panic!("expected Stalled, got {err:?}");
        };
        assert_eq!((rank, lane, timeout_ms), (1, Lane::Inline, 20));
    }

    #[test]
    fn dropped_peer_reports_disconnect() {
        let mut members = LocalGroup::new(2).unwrap();
        let peer = members.pop().unwrap();
        drop(peer);
        let err = members[0].receive_from(Lane::Control, 1).unwrap_err();
        assert!(matches!(
            err,
            CollatorError::Protocol(ProtocolError::Disconnected { rank: 1, lane: Lane::Control })
        ));
    }

    #[test]
    fn out_of_range_rank_is_rejected() {
        let members = LocalGroup::new(2).unwrap();
        let err = members[0].send_to(Lane::Inline, 5, Vec::new()).unwrap_err();
        assert!(matches!(err, CollatorError::Protocol(ProtocolError::InvalidRank { rank: 5, size: 2 })));
    }

    #[test]
    fn malformed_size_message_is_a_protocol_error() {
        let members = LocalGroup::new(2).unwrap();
        members[1].send_to(Lane::Control, 0, vec![1, 2, 3]).unwrap();
        let err = members[0].gather_sizes(4).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn extent_of_sizes() {
        assert_eq!(SizeExtent::from_sizes(&[]), SizeExtent::default());
        assert_eq!(SizeExtent::from_sizes(&[5, 100, 7]), SizeExtent { total: 112, max_local: 100 });
    }
}
