use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter, Result};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::lock::QuorumLock;
use crate::messages::{AcceptReply, PromiseReply};
use crate::types::{AcceptedPair, NodeId, Seqnum, Value};

const NOTHING_GENERATED: u64 = u64::MAX;

/// Acceptor side Paxos state of one node.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct AcceptorState {
    pub committed: BTreeMap<Seqnum, Value>,
    pub promised: Option<Seqnum>,
    pub accepted: Option<AcceptedPair>,
}

impl AcceptorState {
    pub fn highest_committed(&self) -> Option<Seqnum> {
        self.committed.keys().next_back().copied()
    }

    fn is_committed_past(&self, seqnum: Seqnum) -> bool {
        self.highest_committed().is_some_and(|highest| seqnum <= highest)
    }
}

impl Debug for AcceptorState {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.debug_struct("AcceptorState")
            .field("committed entries", &self.committed.len())
            .field("highest_committed", &self.highest_committed())
            .field("promised", &self.promised)
            .field("accepted", &self.accepted)
            .finish()
    }
}

/// The acceptor role of a node plus its proposer side sequence number generator.
///
/// Every mutation takes the write side of the lock, so promises, accepts and
/// commits on one node are linearizable.
pub struct AcceptorLog {
    self_id: NodeId,
    num_nodes: u64,
    last_generated: AtomicU64,
    state: QuorumLock<AcceptorState>,
}

impl AcceptorLog {
    pub fn new(self_id: NodeId, num_nodes: usize) -> Self {
        assert!(num_nodes > 0, "a cluster has at least one node");
        assert!((self_id as usize) < num_nodes, "node id {self_id} outside a cluster of {num_nodes}");

        Self {
            self_id,
            num_nodes: num_nodes as u64,
            last_generated: AtomicU64::new(NOTHING_GENERATED),
            state: QuorumLock::new("acceptor log", AcceptorState::default()),
        }
    }

    /// Smallest seqnum owned by this node that is greater than anything committed
    /// or generated so far. `None` once no such number fits in a `u64`.
    pub async fn generate_next_seqnum(&self) -> Option<Seqnum> {
        self.generate_next_seqnum_after(None).await
    }

    /// Like [`AcceptorLog::generate_next_seqnum`], additionally greater than `after`.
    pub async fn generate_next_seqnum_after(&self, after: Option<Seqnum>) -> Option<Seqnum> {
        let floor = self.state.read().await.highest_committed().max(after);

        let mut last = self.last_generated.load(Ordering::Acquire);
        loop {
            let generated_so_far = (last != NOTHING_GENERATED).then_some(last);
            let Some(candidate) = self.next_owned_above(floor.max(generated_so_far)) else {
                tracing::warn!(?floor, "no sequence number left above the high-water mark");
                return None;
            };

            match self
                .last_generated
                .compare_exchange(last, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    tracing::trace!(seqnum = candidate, "generated seqnum");
                    return Some(candidate);
                }
                // another task generated one concurrently, go above it
                Err(actual) => last = actual,
            }
        }
    }

    /// Smallest `s > floor` with `s mod N == self_id`, if it does not overflow.
    /// `NOTHING_GENERATED` is never handed out.
    fn next_owned_above(&self, floor: Option<Seqnum>) -> Option<Seqnum> {
        let id = self.self_id as u64;
        let Some(floor) = floor else {
            return Some(id);
        };
        let candidate = (floor - floor % self.num_nodes).checked_add(id)?;
        let candidate = if candidate > floor {
            candidate
        } else {
            candidate.checked_add(self.num_nodes)?
        };
        (candidate != NOTHING_GENERATED).then_some(candidate)
    }

    /// Phase 1: promise to ignore proposals numbered at or below `seqnum`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn promise(&self, seqnum: Seqnum) -> PromiseReply {
        let mut state = self.state.write().await;

        if state.is_committed_past(seqnum) || state.promised.is_some_and(|promised| seqnum <= promised) {
            tracing::trace!(?state, "stale proposal, rejecting");
            return PromiseReply::Rejected;
        }

        if let Some(accepted) = state.accepted {
            tracing::trace!(?accepted, "already accepted a value, handing it to the proposer");
            return PromiseReply::Agree { accepted: Some(accepted) };
        }

        state.promised = Some(seqnum);
        PromiseReply::Agree { accepted: None }
    }

    /// Phase 2: accept `value` under `seqnum` unless a higher promise was made.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn accept(&self, seqnum: Seqnum, value: Value) -> AcceptReply {
        let mut state = self.state.write().await;

        // equal to the promise is fine: the proposer may reuse the number it was promised
        if state.is_committed_past(seqnum) || state.promised.is_some_and(|promised| seqnum < promised) {
            tracing::trace!(?state, "stale accept request, rejecting");
            return AcceptReply::Rejected;
        }

        state.accepted = Some((seqnum, value));
        AcceptReply::Accepted
    }

    /// Record a decided value. Commits are notifications and are never rejected.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn commit(&self, seqnum: Seqnum, value: Value) {
        let mut state = self.state.write().await;

        let existing = *state.committed.entry(seqnum).or_insert(value);
        if existing != value {
            tracing::warn!(existing, "seqnum already committed with another value, keeping the first");
        }

        if state.promised == Some(seqnum) {
            state.promised = None;
        }
        if state.accepted.is_some_and(|(_, accepted_value)| accepted_value == value) {
            state.accepted = None;
        }
    }

    pub async fn committed_value(&self, seqnum: Seqnum) -> Option<Value> {
        self.state.read().await.committed.get(&seqnum).copied()
    }

    pub async fn committed_log(&self) -> BTreeMap<Seqnum, Value> {
        self.state.read().await.committed.clone()
    }

    pub async fn snapshot(&self) -> AcceptorState {
        self.state.read().await.clone()
    }
}

impl Debug for AcceptorLog {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        f.debug_struct("AcceptorLog")
            .field("self_id", &self.self_id)
            .field("num_nodes", &self.num_nodes)
            .finish_non_exhaustive()
    }
}
