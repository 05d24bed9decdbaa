//! JSON wire protocol shared by the relay and the session client.
//!
//! One message per websocket text frame, tagged by `type`:
//! ```text
//! { "type": "op", "peerId", "counter", "opKind": "insert"|"delete", "afterId"?, "record"?, "target"? }
//! { "type": "presence", "peerId", "name", "color", "cursor" }
//! { "type": "sync-request" }
//! { "type": "sync-response", "ops": [ <op without "type"> ... ], "last": bool }
//! ```
//!
//! The room is not part of any message; it is the path of the websocket URL.

use isoedit_core::{Asset, AssetRecord, GridPos, OpId, Operation, PeerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Insert,
    Delete,
}

/// Wire form of one [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpMessage {
    pub peer_id: PeerId,
    pub counter: u64,
    pub op_kind: OpKind,
    /// Insert anchor; absent means the head of the sequence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_id: Option<OpId>,
    /// Inserted asset. The record id is `(counter, peerId)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Asset>,
    /// Deleted record id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<OpId>,
}

impl OpMessage {
    pub fn id(&self) -> OpId {
        OpId::new(self.peer_id, self.counter)
    }
}

impl From<&Operation> for OpMessage {
    fn from(op: &Operation) -> Self {
        let id = op.id();
        match op {
            Operation::Insert(insert) => Self {
                peer_id: id.peer,
                counter: id.counter,
                op_kind: OpKind::Insert,
                after_id: insert.after,
                record: Some(insert.record.asset.clone()),
                target: None,
            },
            Operation::Delete(delete) => Self {
                peer_id: id.peer,
                counter: id.counter,
                op_kind: OpKind::Delete,
                after_id: None,
                record: None,
                target: Some(delete.target),
            },
        }
    }
}

impl TryFrom<OpMessage> for Operation {
    type Error = ProtocolError;

    fn try_from(msg: OpMessage) -> Result<Self, Self::Error> {
        let id = msg.id();
        match msg.op_kind {
            OpKind::Insert => {
                let asset = msg
                    .record
                    .ok_or_else(|| ProtocolError::Malformed(format!("insert {id} has no record")))?;
                Ok(Operation::insert(msg.after_id, AssetRecord { id, asset }))
            }
            OpKind::Delete => {
                let target = msg
                    .target
                    .ok_or_else(|| ProtocolError::Malformed(format!("delete {id} has no target")))?;
                Ok(Operation::delete(id, target))
            }
        }
    }
}

/// One peer's full presence entry, re-sent on every heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub peer_id: PeerId,
    pub name: String,
    pub color: String,
    pub cursor: Option<GridPos>,
}

fn last_chunk() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireMessage {
    Op(OpMessage),
    Presence(PresenceMessage),
    SyncRequest,
    SyncResponse {
        ops: Vec<OpMessage>,
        /// `false` while more chunks of the same response follow.
        #[serde(default = "last_chunk")]
        last: bool,
    },
}

impl WireMessage {
    pub fn op(op: &Operation) -> Self {
        WireMessage::Op(op.into())
    }

    /// Split a reconciliation answer into frames of at most `cap` operations.
    /// Always yields at least one frame, the last one flagged `last`.
    pub fn sync_responses(ops: &[Operation], cap: usize) -> Vec<WireMessage> {
        let cap = cap.max(1);
        if ops.is_empty() {
            return vec![WireMessage::SyncResponse { ops: Vec::new(), last: true }];
        }
        let chunks = ops.len().div_ceil(cap);
        ops.chunks(cap)
            .enumerate()
            .map(|(i, chunk)| WireMessage::SyncResponse {
                ops: chunk.iter().map(OpMessage::from).collect(),
                last: i + 1 == chunks,
            })
            .collect()
    }

    /// Peer that authored the message, if it names one.
    pub fn sender(&self) -> Option<PeerId> {
        match self {
            WireMessage::Op(op) => Some(op.peer_id),
            WireMessage::Presence(presence) => Some(presence.peer_id),
            WireMessage::SyncRequest | WireMessage::SyncResponse { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Failure to encode, decode or interpret a wire frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("malformed operation: {0}")]
    Malformed(String),
}
