//! Operation identities and the two replicated operations.
//!
//! Every operation carries an [`OpId`] built from the authoring peer and a
//! Lamport counter. Ids compare as `(counter, peer)`, which gives a single
//! total order over all operations of all peers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::{Asset, AssetRecord};

/// Globally unique replica identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// `(counter, peer)` operation id. Field order is the ordering: the derived
/// `Ord` compares counters first and breaks ties on peer bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub counter: u64,
    pub peer: PeerId,
}

impl OpId {
    pub const fn new(peer: PeerId, counter: u64) -> Self {
        Self { counter, peer }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.peer)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InsertOp {
    /// Element this record was placed after when authored; `None` is the head.
    pub after: Option<OpId>,
    pub record: AssetRecord,
}

impl InsertOp {
    pub fn id(&self) -> OpId {
        self.record.id
    }

    pub fn asset(&self) -> &Asset {
        &self.record.asset
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOp {
    /// Identity of the delete itself (origin peer + counter).
    pub id: OpId,
    pub target: OpId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Insert(InsertOp),
    Delete(DeleteOp),
}

impl Operation {
    pub fn insert(after: Option<OpId>, record: AssetRecord) -> Self {
        Operation::Insert(InsertOp { after, record })
    }

    pub fn delete(id: OpId, target: OpId) -> Self {
        Operation::Delete(DeleteOp { id, target })
    }

    /// The operation's own id.
    pub fn id(&self) -> OpId {
        match self {
            Operation::Insert(op) => op.id(),
            Operation::Delete(op) => op.id,
        }
    }

    pub fn origin(&self) -> PeerId {
        self.id().peer
    }

    pub fn counter(&self) -> u64 {
        self.id().counter
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, Operation::Insert(_))
    }
}

/// Malformed or undeliverable operations. Dropped and logged, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolAnomaly {
    #[error("operation {0} uses reserved counter 0")]
    ZeroCounter(OpId),
    #[error("insert {id} is anchored at itself")]
    SelfAnchored { id: OpId },
    #[error("insert {id} is not causally after its anchor {after}")]
    AnchorNotEarlier { id: OpId, after: OpId },
    #[error("insert {id} waited for anchor {missing} longer than the buffering window")]
    OrphanExpired { id: OpId, missing: OpId },
}

/// Outcome of merging one operation into a replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyResult {
    /// Live state changed. `released` counts buffered inserts that became
    /// applicable as a consequence.
    Applied { released: usize },
    /// Delete of an already-deleted or not-yet-seen record; remembered so a
    /// late insert stays dead.
    Recorded,
    Duplicate,
    /// Insert held until its anchor arrives.
    Buffered { missing: OpId },
    Rejected(ProtocolAnomaly),
}

impl ApplyResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyResult::Applied { .. })
    }

    /// Whether the operation was new to this replica and should be relayed.
    pub fn is_new(&self) -> bool {
        matches!(
            self,
            ApplyResult::Applied { .. } | ApplyResult::Recorded | ApplyResult::Buffered { .. }
        )
    }
}
