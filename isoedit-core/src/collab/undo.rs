//! Session-scoped linear undo/redo over a [`ReplicaState`].
//!
//! Each entry stores the inverse steps of one local transaction. Steps are
//! reverted against the current replica, so anything a collaborator changed in
//! the meantime is respected: records they deleted are never brought back.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::op::OpId;
use super::replica::ReplicaState;
use crate::AssetRecord;

#[derive(Debug, Clone, Default)]
pub struct UndoConfig {
    /// Transactions committed within this window of the previous one are
    /// merged into the same entry. Zero disables merging.
    pub capture_timeout: Duration,
}

/// One reversible local mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum UndoStep {
    /// A record this peer inserted; reverting deletes it.
    Inserted { id: OpId },
    /// A record this peer deleted; reverting re-inserts its asset after
    /// `anchor` under a fresh id.
    Deleted { record: AssetRecord, anchor: Option<OpId> },
}

#[derive(Debug, Clone)]
struct UndoEntry {
    steps: Vec<UndoStep>,
    committed_at: Instant,
}

#[derive(Debug, Default)]
pub struct UndoManager {
    config: UndoConfig,
    undo_stack: Vec<UndoEntry>,
    redo_stack: Vec<UndoEntry>,
    open: Vec<UndoStep>,
    depth: usize,
    /// Set by `stop_capturing` so the next commit never merges.
    boundary: bool,
    /// Original id → id of the record that re-created it on undo/redo.
    recreated: HashMap<OpId, OpId>,
}

impl UndoManager {
    pub fn new(config: UndoConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn begin(&mut self) {
        self.depth += 1;
    }

    /// Seal the current transaction. Only the outermost commit produces an
    /// entry; returns whether one was pushed or extended.
    pub fn commit(&mut self, now: Instant) -> bool {
        if self.depth == 0 {
            log::warn!("commit_transaction called without a matching begin");
            return false;
        }
        self.depth -= 1;
        if self.depth > 0 || self.open.is_empty() {
            return false;
        }

        let steps = std::mem::take(&mut self.open);
        self.redo_stack.clear();

        let window = self.config.capture_timeout;
        let merge = !self.boundary
            && !window.is_zero()
            && self
                .undo_stack
                .last()
                .is_some_and(|last| now.saturating_duration_since(last.committed_at) < window);
        self.boundary = false;

        match self.undo_stack.last_mut() {
            Some(last) if merge => {
                last.steps.extend(steps);
                last.committed_at = now;
            }
            _ => self.undo_stack.push(UndoEntry { steps, committed_at: now }),
        }
        true
    }

    /// Record a step into the open transaction.
    pub fn record(&mut self, step: UndoStep) {
        if self.depth == 0 {
            log::warn!("undo step recorded outside a transaction, ignoring");
            return;
        }
        self.open.push(step);
    }

    pub fn in_transaction(&self) -> bool {
        self.depth > 0
    }

    /// Force the next committed transaction into a new entry.
    pub fn stop_capturing(&mut self) {
        self.boundary = true;
    }

    pub fn undo(&mut self, replica: &mut ReplicaState) -> bool {
        while let Some(entry) = self.undo_stack.pop() {
            let inverse = self.revert(replica, &entry.steps);
            if !inverse.is_empty() {
                self.redo_stack.push(UndoEntry {
                    steps: inverse,
                    committed_at: entry.committed_at,
                });
                self.boundary = true;
                return true;
            }
            log::debug!("Discarding undo entry with no remaining effect");
        }
        false
    }

    pub fn redo(&mut self, replica: &mut ReplicaState) -> bool {
        while let Some(entry) = self.redo_stack.pop() {
            let inverse = self.revert(replica, &entry.steps);
            if !inverse.is_empty() {
                self.undo_stack.push(UndoEntry {
                    steps: inverse,
                    committed_at: entry.committed_at,
                });
                self.boundary = true;
                return true;
            }
            log::debug!("Discarding redo entry with no remaining effect");
        }
        false
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.recreated.clear();
    }

    /// Apply the inverse of `steps` (last step first) and return the steps
    /// that would reverse what was actually done.
    fn revert(&mut self, replica: &mut ReplicaState, steps: &[UndoStep]) -> Vec<UndoStep> {
        let mut inverse = Vec::new();
        for step in steps.iter().rev() {
            match step {
                UndoStep::Inserted { id } => {
                    let current = self.latest(*id);
                    match replica.local_delete(current) {
                        Some(deleted) => inverse.push(UndoStep::Deleted {
                            record: deleted.record,
                            anchor: deleted.anchor,
                        }),
                        None => log::debug!("Skipping undo of insert {current}: already removed"),
                    }
                }
                UndoStep::Deleted { record, anchor } => {
                    if replica.deleted_by_others(record.id) {
                        log::debug!("Skipping re-insert of {}: also deleted by a collaborator", record.id);
                        continue;
                    }
                    let anchor = anchor.filter(|a| replica.contains(*a));
                    match replica.local_insert_after(anchor, record.asset.clone()) {
                        Ok(id) => {
                            self.recreated.insert(record.id, id);
                            inverse.push(UndoStep::Inserted { id });
                        }
                        Err(err) => log::warn!("Undo re-insert of {} failed: {err}", record.id),
                    }
                }
            }
        }
        inverse
    }

    fn latest(&self, mut id: OpId) -> OpId {
        while let Some(next) = self.recreated.get(&id) {
            id = *next;
        }
        id
    }
}
