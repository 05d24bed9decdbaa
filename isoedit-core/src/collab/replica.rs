//! Replicated sequence of asset records.
//!
//! The replica is a Replicated Growable Array: an ordered list of elements
//! where deleted elements stay in place as tombstones so they keep working as
//! anchors for inserts that reference them.
//!
//! ```text
//!   insert X after A
//!        │
//!        ▼
//!   [ … A │ S1 S1a S2 │ B … ]     S* have ids > X  → skipped
//!                     ▲
//!                     └── X lands before the first element with id < X
//! ```
//!
//! Because counters are Lamport clocks, everything inserted (transitively)
//! after a sibling has a larger id than that sibling, so skipping "while the
//! next id is greater" jumps over whole concurrent subtrees. The final order
//! depends only on the set of operations, never on their arrival order.
//!
//! Reference: Roh et al., "Replicated abstract data types" (RGA), 2011

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use super::op::{ApplyResult, DeleteOp, InsertOp, OpId, Operation, PeerId, ProtocolAnomaly};
use super::CoreError;
use crate::{Asset, AssetRecord, GridPos};

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// How long an insert may wait for its anchor before it is dropped.
    pub buffer_window: Duration,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            buffer_window: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
struct Element {
    id: OpId,
    asset: Asset,
    deleted: bool,
}

#[derive(Debug, Clone)]
struct Pending {
    op: InsertOp,
    received: Instant,
}

/// What a local delete removed, with enough context to put it back.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedRecord {
    pub record: AssetRecord,
    /// Element that preceded the record when it was deleted (`None` = head).
    pub anchor: Option<OpId>,
}

/// One peer's replica of a room's asset sequence.
///
/// Single writer: callers serialize `apply` and the `local_*` mutations.
pub struct ReplicaState {
    peer: PeerId,
    config: ReplicaConfig,
    /// Lamport clock: highest counter seen or issued.
    clock: u64,
    elements: Vec<Element>,
    known: HashSet<OpId>,
    /// Target id → peers that deleted it. May hold ids never seen as inserts.
    deleters: HashMap<OpId, BTreeSet<PeerId>>,
    deletes_seen: HashSet<OpId>,
    high_water: BTreeMap<PeerId, u64>,
    /// Missing anchor → inserts waiting for it.
    pending: HashMap<OpId, Vec<Pending>>,
    pending_ids: HashSet<OpId>,
    log: Vec<Operation>,
    outgoing: VecDeque<Operation>,
}

impl ReplicaState {
    pub fn new(peer: PeerId, config: ReplicaConfig) -> Self {
        Self {
            peer,
            config,
            clock: 0,
            elements: Vec::new(),
            known: HashSet::new(),
            deleters: HashMap::new(),
            deletes_seen: HashSet::new(),
            high_water: BTreeMap::new(),
            pending: HashMap::new(),
            pending_ids: HashSet::new(),
            log: Vec::new(),
            outgoing: VecDeque::new(),
        }
    }

    pub fn with_defaults(peer: PeerId) -> Self {
        Self::new(peer, ReplicaConfig::default())
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    // ── Merge ──────────────────────────────────────────────────────

    /// Merge an operation from any source. Idempotent and order-independent.
    pub fn apply(&mut self, op: Operation) -> ApplyResult {
        self.apply_at(op, Instant::now())
    }

    /// [`apply`](Self::apply) with an explicit arrival time for buffering.
    pub fn apply_at(&mut self, op: Operation, now: Instant) -> ApplyResult {
        match op {
            Operation::Insert(insert) => self.apply_insert(insert, now),
            Operation::Delete(delete) => self.apply_delete(delete),
        }
    }

    fn apply_insert(&mut self, op: InsertOp, now: Instant) -> ApplyResult {
        let id = op.id();
        if let Err(anomaly) = validate_insert(&op) {
            log::warn!("Rejecting insert from {}: {anomaly}", id.peer);
            return ApplyResult::Rejected(anomaly);
        }
        if self.known.contains(&id) || self.pending_ids.contains(&id) {
            return ApplyResult::Duplicate;
        }
        self.observe(id);

        if let Some(after) = op.after {
            if !self.known.contains(&after) {
                log::debug!("Buffering insert {id} until anchor {after} arrives");
                self.pending_ids.insert(id);
                self.pending.entry(after).or_default().push(Pending { op, received: now });
                return ApplyResult::Buffered { missing: after };
            }
        }

        self.integrate(op);
        let released = self.release_waiting_on(id);
        ApplyResult::Applied { released }
    }

    fn apply_delete(&mut self, op: DeleteOp) -> ApplyResult {
        if op.id.counter == 0 {
            let anomaly = ProtocolAnomaly::ZeroCounter(op.id);
            log::warn!("Rejecting delete from {}: {anomaly}", op.id.peer);
            return ApplyResult::Rejected(anomaly);
        }
        if !self.deletes_seen.insert(op.id) {
            return ApplyResult::Duplicate;
        }
        self.observe(op.id);
        self.log.push(Operation::Delete(op));
        self.deleters.entry(op.target).or_default().insert(op.id.peer);

        match self.elements.iter_mut().find(|e| e.id == op.target) {
            Some(element) if !element.deleted => {
                element.deleted = true;
                ApplyResult::Applied { released: 0 }
            }
            _ => ApplyResult::Recorded,
        }
    }

    /// Place an insert whose anchor is known.
    fn integrate(&mut self, op: InsertOp) {
        let id = op.id();
        let mut pos = match op.after {
            Some(after) => self.position(after).map_or(0, |p| p + 1),
            None => 0,
        };
        while pos < self.elements.len() && self.elements[pos].id > id {
            pos += 1;
        }

        let deleted = self.deleters.contains_key(&id);
        self.elements.insert(
            pos,
            Element {
                id,
                asset: op.record.asset.clone(),
                deleted,
            },
        );
        self.known.insert(id);
        self.log.push(Operation::Insert(op));
    }

    /// Integrate every buffered insert that was (transitively) waiting on `id`.
    fn release_waiting_on(&mut self, id: OpId) -> usize {
        let mut released = 0;
        let mut ready = vec![id];
        while let Some(anchor) = ready.pop() {
            let Some(mut waiting) = self.pending.remove(&anchor) else {
                continue;
            };
            waiting.sort_by_key(|p| p.op.id());
            for pending in waiting {
                let pid = pending.op.id();
                self.pending_ids.remove(&pid);
                self.integrate(pending.op);
                released += 1;
                ready.push(pid);
            }
        }
        if released > 0 {
            log::debug!("Anchor {id} released {released} buffered inserts");
        }
        released
    }

    /// Drop buffered inserts whose anchor has not arrived within the window.
    pub fn expire_orphans(&mut self, now: Instant) -> Vec<ProtocolAnomaly> {
        let window = self.config.buffer_window;
        let mut expired = Vec::new();
        self.pending.retain(|missing, waiting| {
            waiting.retain(|p| {
                if now.saturating_duration_since(p.received) >= window {
                    expired.push(ProtocolAnomaly::OrphanExpired {
                        id: p.op.id(),
                        missing: *missing,
                    });
                    false
                } else {
                    true
                }
            });
            !waiting.is_empty()
        });

        for anomaly in &expired {
            if let ProtocolAnomaly::OrphanExpired { id, .. } = anomaly {
                self.pending_ids.remove(id);
            }
            log::warn!("Protocol anomaly: {anomaly}");
        }
        expired
    }

    fn observe(&mut self, id: OpId) {
        self.clock = self.clock.max(id.counter);
        let mark = self.high_water.entry(id.peer).or_insert(0);
        *mark = (*mark).max(id.counter);
    }

    fn next_id(&mut self) -> OpId {
        let id = OpId::new(self.peer, self.clock + 1);
        self.observe(id);
        id
    }

    // ── Local edits ────────────────────────────────────────────────

    /// Append an asset after the last element of the sequence.
    pub fn local_insert(&mut self, asset: Asset) -> OpId {
        let after = self.elements.last().map(|e| e.id);
        self.insert_local(after, asset)
    }

    /// Insert an asset right after `after` (`None` = at the head).
    pub fn local_insert_after(&mut self, after: Option<OpId>, asset: Asset) -> Result<OpId, CoreError> {
        if let Some(anchor) = after {
            if !self.known.contains(&anchor) {
                return Err(CoreError::UnknownAnchor(anchor));
            }
        }
        Ok(self.insert_local(after, asset))
    }

    fn insert_local(&mut self, after: Option<OpId>, asset: Asset) -> OpId {
        let id = self.next_id();
        let op = InsertOp {
            after,
            record: AssetRecord { id, asset },
        };
        self.outgoing.push_back(Operation::Insert(op.clone()));
        self.integrate(op);
        id
    }

    /// Tombstone a live record. Returns `None` when it is unknown or already
    /// deleted, in which case nothing is emitted.
    pub fn local_delete(&mut self, target: OpId) -> Option<DeletedRecord> {
        let pos = self.position(target)?;
        if self.elements[pos].deleted {
            return None;
        }
        let anchor = pos.checked_sub(1).map(|p| self.elements[p].id);
        let id = self.next_id();

        let element = &mut self.elements[pos];
        element.deleted = true;
        let record = AssetRecord {
            id: element.id,
            asset: element.asset.clone(),
        };

        let op = DeleteOp { id, target };
        self.deletes_seen.insert(id);
        self.deleters.entry(target).or_default().insert(self.peer);
        self.log.push(Operation::Delete(op));
        self.outgoing.push_back(Operation::Delete(op));
        Some(DeletedRecord { record, anchor })
    }

    /// Locally authored operations not yet handed to the transport.
    pub fn drain_outgoing(&mut self) -> Vec<Operation> {
        self.outgoing.drain(..).collect()
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.len()
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Live records in sequence order.
    pub fn snapshot(&self) -> Vec<AssetRecord> {
        self.elements
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| AssetRecord {
                id: e.id,
                asset: e.asset.clone(),
            })
            .collect()
    }

    pub fn get(&self, id: OpId) -> Option<AssetRecord> {
        self.elements
            .iter()
            .find(|e| e.id == id && !e.deleted)
            .map(|e| AssetRecord {
                id: e.id,
                asset: e.asset.clone(),
            })
    }

    /// First live record placed at `pos`, in sequence order.
    pub fn first_live_at(&self, pos: GridPos) -> Option<OpId> {
        self.elements
            .iter()
            .find(|e| !e.deleted && e.asset.position == pos)
            .map(|e| e.id)
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.elements.iter().filter(|e| !e.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the insert with this id has been integrated (live or not).
    pub fn contains(&self, id: OpId) -> bool {
        self.known.contains(&id)
    }

    pub fn is_live(&self, id: OpId) -> bool {
        self.elements.iter().any(|e| e.id == id && !e.deleted)
    }

    pub fn is_deleted(&self, id: OpId) -> bool {
        self.deleters.contains_key(&id)
    }

    /// Whether a peer other than this one has deleted `id`.
    pub fn deleted_by_others(&self, id: OpId) -> bool {
        self.deleters
            .get(&id)
            .is_some_and(|peers| peers.iter().any(|p| *p != self.peer))
    }

    pub fn tombstone_count(&self) -> usize {
        self.deleters.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending_ids.len()
    }

    /// Inserts still waiting for an anchor, oldest anchor first.
    pub fn pending_ops(&self) -> Vec<Operation> {
        let mut ops: Vec<Operation> = self
            .pending
            .values()
            .flatten()
            .map(|p| Operation::Insert(p.op.clone()))
            .collect();
        ops.sort_by_key(Operation::id);
        ops
    }

    /// Every merged operation in application order. Replaying it in order
    /// into an empty replica never buffers.
    pub fn op_log(&self) -> &[Operation] {
        &self.log
    }

    /// Per-peer counter high-water marks.
    pub fn version_vector(&self) -> &BTreeMap<PeerId, u64> {
        &self.high_water
    }

    pub fn clock(&self) -> u64 {
        self.clock
    }

    fn position(&self, id: OpId) -> Option<usize> {
        self.elements.iter().position(|e| e.id == id)
    }
}

fn validate_insert(op: &InsertOp) -> Result<(), ProtocolAnomaly> {
    let id = op.id();
    if id.counter == 0 {
        return Err(ProtocolAnomaly::ZeroCounter(id));
    }
    match op.after {
        Some(after) if after == id => Err(ProtocolAnomaly::SelfAnchored { id }),
        Some(after) if after > id => Err(ProtocolAnomaly::AnchorNotEarlier { id, after }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn peer(byte: u8) -> PeerId {
        PeerId::from_uuid(Uuid::from_bytes([byte; 16]))
    }

    fn cube(x: i32, z: i32) -> Asset {
        Asset::cube(GridPos::new(x, 0, z), "#ff0000", None)
    }

    fn ids(replica: &ReplicaState) -> Vec<OpId> {
        replica.snapshot().iter().map(|r| r.id).collect()
    }

    fn insert_op(peer_id: PeerId, counter: u64, after: Option<OpId>, asset: Asset) -> Operation {
        Operation::insert(
            after,
            AssetRecord {
                id: OpId::new(peer_id, counter),
                asset,
            },
        )
    }

    #[test]
    fn test_local_insert_appends_in_order() {
        let mut replica = ReplicaState::with_defaults(peer(1));
        let a = replica.local_insert(cube(0, 0));
        let b = replica.local_insert(cube(1, 0));
        let c = replica.local_insert(cube(2, 0));

        assert_eq!(ids(&replica), vec![a, b, c]);
        assert_eq!(replica.len(), 3);
        assert_eq!(replica.drain_outgoing().len(), 3);
        assert_eq!(replica.outgoing_len(), 0);
    }

    #[test]
    fn test_counters_strictly_increase() {
        let mut replica = ReplicaState::with_defaults(peer(1));
        let a = replica.local_insert(cube(0, 0));
        let b = replica.local_insert(cube(0, 1));
        assert!(b.counter > a.counter);
        assert_eq!(a.counter, 1);
    }

    #[test]
    fn test_counter_jumps_past_remote_clock() {
        let mut replica = ReplicaState::with_defaults(peer(1));
        replica.apply(insert_op(peer(2), 40, None, cube(0, 0)));
        let local = replica.local_insert(cube(1, 1));
        assert_eq!(local.counter, 41);
        assert_eq!(replica.version_vector().get(&peer(2)), Some(&40));
        assert_eq!(replica.version_vector().get(&peer(1)), Some(&41));
    }

    #[test]
    fn test_local_insert_after_head_and_anchor() {
        let mut replica = ReplicaState::with_defaults(peer(1));
        let a = replica.local_insert(cube(0, 0));
        let c = replica.local_insert(cube(2, 0));
        let b = replica.local_insert_after(Some(a), cube(1, 0)).unwrap();
        let head = replica.local_insert_after(None, cube(9, 9)).unwrap();

        assert_eq!(ids(&replica), vec![head, a, b, c]);
    }

    #[test]
    fn test_local_insert_after_unknown_anchor_errors() {
        let mut replica = ReplicaState::with_defaults(peer(1));
        let missing = OpId::new(peer(2), 3);
        let err = replica.local_insert_after(Some(missing), cube(0, 0)).unwrap_err();
        assert_eq!(err, CoreError::UnknownAnchor(missing));
        assert!(replica.is_empty());
    }

    #[test]
    fn test_local_delete_tombstones_and_reports_anchor() {
        let mut replica = ReplicaState::with_defaults(peer(1));
        let a = replica.local_insert(cube(0, 0));
        let b = replica.local_insert(cube(1, 0));

        let deleted = replica.local_delete(b).unwrap();
        assert_eq!(deleted.record.id, b);
        assert_eq!(deleted.anchor, Some(a));
        assert!(!replica.is_live(b));
        assert!(replica.contains(b));
        assert_eq!(ids(&replica), vec![a]);

        // Second delete is a no-op and emits nothing.
        replica.drain_outgoing();
        assert!(replica.local_delete(b).is_none());
        assert_eq!(replica.outgoing_len(), 0);
    }

    #[test]
    fn test_concurrent_inserts_same_anchor_converge() {
        let mut origin = ReplicaState::with_defaults(peer(1));
        let a = origin.local_insert(cube(0, 0));
        let base = origin.drain_outgoing();

        let mut left = ReplicaState::with_defaults(peer(2));
        let mut right = ReplicaState::with_defaults(peer(3));
        for op in &base {
            left.apply(op.clone());
            right.apply(op.clone());
        }

        let l = left.local_insert_after(Some(a), cube(2, 3)).unwrap();
        let r = right.local_insert_after(Some(a), cube(2, 3)).unwrap();
        assert_eq!(l.counter, r.counter);

        for op in left.drain_outgoing() {
            right.apply(op);
        }
        for op in right.drain_outgoing() {
            left.apply(op);
        }

        assert_eq!(ids(&left), ids(&right));
        // Equal counters: the larger peer id is placed first.
        assert_eq!(ids(&left), vec![a, r, l]);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let op = insert_op(peer(2), 1, None, cube(0, 0));
        let mut replica = ReplicaState::with_defaults(peer(1));

        assert_eq!(replica.apply(op.clone()), ApplyResult::Applied { released: 0 });
        assert_eq!(replica.apply(op), ApplyResult::Duplicate);
        assert_eq!(replica.len(), 1);
        assert_eq!(replica.op_log().len(), 1);

        let delete = Operation::delete(OpId::new(peer(2), 2), OpId::new(peer(2), 1));
        assert_eq!(replica.apply(delete.clone()), ApplyResult::Applied { released: 0 });
        assert_eq!(replica.apply(delete), ApplyResult::Duplicate);
        assert!(replica.is_empty());
    }

    #[test]
    fn test_insert_with_unseen_anchor_is_buffered() {
        let anchor = OpId::new(peer(2), 1);
        let child = insert_op(peer(2), 2, Some(anchor), cube(1, 1));
        let mut replica = ReplicaState::with_defaults(peer(1));

        assert_eq!(replica.apply(child.clone()), ApplyResult::Buffered { missing: anchor });
        assert!(replica.is_empty());
        assert_eq!(replica.pending_len(), 1);
        assert_eq!(replica.apply(child), ApplyResult::Duplicate);

        let result = replica.apply(insert_op(peer(2), 1, None, cube(0, 0)));
        assert_eq!(result, ApplyResult::Applied { released: 1 });
        assert_eq!(ids(&replica), vec![anchor, OpId::new(peer(2), 2)]);
        assert_eq!(replica.pending_len(), 0);
    }

    #[test]
    fn test_buffered_chain_releases_transitively() {
        let p = peer(2);
        let mut replica = ReplicaState::with_defaults(peer(1));
        replica.apply(insert_op(p, 3, Some(OpId::new(p, 2)), cube(3, 0)));
        replica.apply(insert_op(p, 2, Some(OpId::new(p, 1)), cube(2, 0)));
        assert_eq!(replica.pending_len(), 2);

        let result = replica.apply(insert_op(p, 1, None, cube(1, 0)));
        assert_eq!(result, ApplyResult::Applied { released: 2 });
        assert_eq!(
            ids(&replica),
            vec![OpId::new(p, 1), OpId::new(p, 2), OpId::new(p, 3)]
        );
    }

    #[test]
    fn test_orphan_expires_after_window() {
        let mut replica = ReplicaState::new(
            peer(1),
            ReplicaConfig {
                buffer_window: Duration::from_millis(100),
            },
        );
        let start = Instant::now();
        let missing = OpId::new(peer(2), 1);
        replica.apply_at(insert_op(peer(2), 2, Some(missing), cube(0, 0)), start);

        assert!(replica.expire_orphans(start + Duration::from_millis(50)).is_empty());
        let dropped = replica.expire_orphans(start + Duration::from_millis(150));
        assert_eq!(
            dropped,
            vec![ProtocolAnomaly::OrphanExpired {
                id: OpId::new(peer(2), 2),
                missing,
            }]
        );
        assert_eq!(replica.pending_len(), 0);

        // The anchor arriving later no longer drags the orphan in.
        replica.apply(insert_op(peer(2), 1, None, cube(5, 5)));
        assert_eq!(ids(&replica), vec![missing]);
    }

    #[test]
    fn test_delete_before_insert_keeps_record_dead() {
        let target = OpId::new(peer(2), 1);
        let mut replica = ReplicaState::with_defaults(peer(1));

        let delete = Operation::delete(OpId::new(peer(3), 2), target);
        assert_eq!(replica.apply(delete), ApplyResult::Recorded);
        assert_eq!(replica.tombstone_count(), 1);

        replica.apply(insert_op(peer(2), 1, None, cube(0, 0)));
        assert!(replica.is_empty());
        assert!(replica.contains(target));
        assert!(replica.is_deleted(target));
    }

    #[test]
    fn test_insert_after_deleted_anchor_uses_tombstone_position() {
        let mut replica = ReplicaState::with_defaults(peer(1));
        let a = replica.local_insert(cube(0, 0));
        let b = replica.local_insert(cube(1, 0));
        let c = replica.local_insert(cube(2, 0));
        replica.local_delete(b);

        // A remote insert authored against `b` before it saw the delete.
        let remote = OpId::new(peer(2), replica.clock() + 1);
        replica.apply(insert_op(peer(2), remote.counter, Some(b), cube(7, 7)));
        assert_eq!(ids(&replica), vec![a, remote, c]);
    }

    #[test]
    fn test_rejects_malformed_inserts() {
        let mut replica = ReplicaState::with_defaults(peer(1));
        let zero = insert_op(peer(2), 0, None, cube(0, 0));
        assert!(matches!(
            replica.apply(zero),
            ApplyResult::Rejected(ProtocolAnomaly::ZeroCounter(_))
        ));

        let own = OpId::new(peer(2), 5);
        let self_anchored = insert_op(peer(2), 5, Some(own), cube(0, 0));
        assert!(matches!(
            replica.apply(self_anchored),
            ApplyResult::Rejected(ProtocolAnomaly::SelfAnchored { .. })
        ));

        let backwards = insert_op(peer(2), 3, Some(OpId::new(peer(3), 9)), cube(0, 0));
        assert!(matches!(
            replica.apply(backwards),
            ApplyResult::Rejected(ProtocolAnomaly::AnchorNotEarlier { .. })
        ));
        assert!(replica.is_empty());
        assert_eq!(replica.pending_len(), 0);
    }

    #[test]
    fn test_op_log_replay_reproduces_state() {
        let mut a = ReplicaState::with_defaults(peer(1));
        let first = a.local_insert(cube(0, 0));
        a.local_insert(cube(1, 0));
        a.local_insert_after(Some(first), cube(2, 0)).unwrap();
        a.local_delete(first);

        let mut b = ReplicaState::with_defaults(peer(2));
        for op in a.op_log() {
            let result = b.apply(op.clone());
            assert!(!matches!(result, ApplyResult::Buffered { .. }));
        }
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_deleted_by_others() {
        let mut replica = ReplicaState::with_defaults(peer(1));
        let a = replica.local_insert(cube(0, 0));
        replica.local_delete(a);
        assert!(!replica.deleted_by_others(a));

        replica.apply(Operation::delete(OpId::new(peer(2), 9), a));
        assert!(replica.deleted_by_others(a));
    }

    #[test]
    fn test_first_live_at_skips_tombstones() {
        let mut replica = ReplicaState::with_defaults(peer(1));
        let cell = GridPos::new(2, 0, 3);
        let a = replica.local_insert(Asset::cube(cell, "#fff", None));
        let b = replica.local_insert(Asset::cube(cell, "#000", None));
        assert_eq!(replica.first_live_at(cell), Some(a));
        replica.local_delete(a);
        assert_eq!(replica.first_live_at(cell), Some(b));
        assert_eq!(replica.first_live_at(GridPos::new(9, 9, 9)), None);
    }

    #[test]
    fn test_pending_ops_lists_buffered_inserts() {
        let mut replica = ReplicaState::with_defaults(peer(1));
        let op = insert_op(peer(2), 4, Some(OpId::new(peer(2), 3)), cube(0, 0));
        replica.apply(op.clone());
        assert_eq!(replica.pending_ops(), vec![op]);
    }
}
