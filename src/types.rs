/// Proposer-chosen ordering token. Each node owns the residue class `id mod N`.
pub type Seqnum = u64;

/// Value clients ask the cluster to agree on.
pub type Value = i64;

pub type NodeId = u32;

/// A `(seqnum, value)` pair held by an acceptor that has accepted but not yet seen a commit.
pub type AcceptedPair = (Seqnum, Value);
