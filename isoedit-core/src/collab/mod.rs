pub mod op;
pub mod replica;
pub mod undo;

use std::time::Instant;
use thiserror::Error;

use crate::{Asset, AssetRecord, GridPos};
use op::{ApplyResult, OpId, Operation, PeerId, ProtocolAnomaly};
use replica::{ReplicaConfig, ReplicaState};
use undo::{UndoConfig, UndoManager, UndoStep};

/// Errors of local edit calls. Merges never fail; see [`ApplyResult`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("anchor {0} is not part of this document")]
    UnknownAnchor(OpId),
    #[error("record {0} is not live in this document")]
    UnknownRecord(OpId),
}

/// One room's asset map: the replicated sequence plus this peer's undo
/// history. All local edits go through here so they are captured for undo.
pub struct MapDocument {
    replica: ReplicaState,
    undo: UndoManager,
    /// Bumped on every change to the live asset list.
    version: u64,
}

impl MapDocument {
    pub fn new(peer: PeerId, replica_config: ReplicaConfig, undo_config: UndoConfig) -> Self {
        Self {
            replica: ReplicaState::new(peer, replica_config),
            undo: UndoManager::new(undo_config),
            version: 0,
        }
    }

    pub fn with_peer(peer: PeerId) -> Self {
        Self::new(peer, ReplicaConfig::default(), UndoConfig::default())
    }

    pub fn peer_id(&self) -> PeerId {
        self.replica.peer_id()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    // ── Local edits (captured for undo) ────────────────────────────

    /// Place an asset at the end of the sequence.
    pub fn local_insert(&mut self, asset: Asset) -> OpId {
        self.transact(|doc| {
            let id = doc.replica.local_insert(asset);
            doc.undo.record(UndoStep::Inserted { id });
            doc.version += 1;
            id
        })
    }

    pub fn local_insert_after(&mut self, after: Option<OpId>, asset: Asset) -> Result<OpId, CoreError> {
        self.transact(|doc| {
            let id = doc.replica.local_insert_after(after, asset)?;
            doc.undo.record(UndoStep::Inserted { id });
            doc.version += 1;
            Ok(id)
        })
    }

    /// Delete a live record. Returns `false` if it was unknown or already gone.
    pub fn local_delete(&mut self, id: OpId) -> bool {
        self.transact(|doc| match doc.replica.local_delete(id) {
            Some(deleted) => {
                doc.undo.record(UndoStep::Deleted {
                    record: deleted.record,
                    anchor: deleted.anchor,
                });
                doc.version += 1;
                true
            }
            None => false,
        })
    }

    /// Delete the first live record at a grid cell.
    pub fn remove_at(&mut self, pos: GridPos) -> Option<AssetRecord> {
        let id = self.replica.first_live_at(pos)?;
        let record = self.replica.get(id)?;
        self.local_delete(id).then_some(record)
    }

    /// Reorder a record to sit right after `after` (`None` = head). Records are
    /// immutable, so this deletes and re-inserts under a fresh id as one
    /// undoable action.
    pub fn move_after(&mut self, id: OpId, after: Option<OpId>) -> Result<OpId, CoreError> {
        let record = self.replica.get(id).ok_or(CoreError::UnknownRecord(id))?;
        if let Some(anchor) = after {
            if !self.replica.contains(anchor) {
                return Err(CoreError::UnknownAnchor(anchor));
            }
        }
        self.transact(|doc| {
            doc.local_delete(id);
            doc.local_insert_after(after, record.asset)
        })
    }

    /// Swap the whole collection for `assets` in one undoable action.
    pub fn replace_all(&mut self, assets: Vec<Asset>) -> Vec<OpId> {
        self.transact(|doc| {
            for record in doc.replica.snapshot() {
                doc.local_delete(record.id);
            }
            assets.into_iter().map(|asset| doc.local_insert(asset)).collect()
        })
    }

    /// Load assets without capturing them for undo (initial map content).
    pub fn seed(&mut self, assets: impl IntoIterator<Item = Asset>) -> Vec<OpId> {
        let ids: Vec<OpId> = assets.into_iter().map(|asset| self.replica.local_insert(asset)).collect();
        if !ids.is_empty() {
            self.version += 1;
        }
        ids
    }

    // ── Transactions and history ───────────────────────────────────

    pub fn begin_transaction(&mut self) {
        self.undo.begin();
    }

    pub fn commit_transaction(&mut self) {
        self.undo.commit(Instant::now());
    }

    /// Run `f` inside a transaction so every edit it makes undoes as one.
    pub fn transact<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.begin_transaction();
        let result = f(self);
        self.commit_transaction();
        result
    }

    pub fn undo(&mut self) -> bool {
        let changed = self.undo.undo(&mut self.replica);
        if changed {
            self.version += 1;
        }
        changed
    }

    pub fn redo(&mut self) -> bool {
        let changed = self.undo.redo(&mut self.replica);
        if changed {
            self.version += 1;
        }
        changed
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    pub fn stop_capturing(&mut self) {
        self.undo.stop_capturing();
    }

    pub fn clear_history(&mut self) {
        self.undo.clear();
    }

    // ── Replication ────────────────────────────────────────────────

    pub fn apply_remote(&mut self, op: Operation) -> ApplyResult {
        let result = self.replica.apply(op);
        if result.is_applied() {
            self.version += 1;
        }
        result
    }

    pub fn expire_orphans(&mut self, now: Instant) -> Vec<ProtocolAnomaly> {
        self.replica.expire_orphans(now)
    }

    pub fn drain_outgoing(&mut self) -> Vec<Operation> {
        self.replica.drain_outgoing()
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Vec<AssetRecord> {
        self.replica.snapshot()
    }

    /// Live assets without ids, in order, for saving a named map.
    pub fn export(&self) -> Vec<Asset> {
        self.replica.snapshot().into_iter().map(|record| record.asset).collect()
    }

    pub fn len(&self) -> usize {
        self.replica.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replica.is_empty()
    }

    pub fn replica(&self) -> &ReplicaState {
        &self.replica
    }
}
