use serde::{Deserialize, Serialize};
use std::fmt;

pub mod collab;

pub use collab::op::{ApplyResult, DeleteOp, InsertOp, OpId, Operation, PeerId, ProtocolAnomaly};
pub use collab::replica::{DeletedRecord, ReplicaConfig, ReplicaState};
pub use collab::undo::{UndoConfig, UndoManager, UndoStep};
pub use collab::{CoreError, MapDocument};

/// Integer grid cell. Serialized as `[x, y, z]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "[i32; 3]", into = "[i32; 3]")]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl GridPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

impl From<[i32; 3]> for GridPos {
    fn from([x, y, z]: [i32; 3]) -> Self {
        Self { x, y, z }
    }
}

impl From<GridPos> for [i32; 3] {
    fn from(p: GridPos) -> Self {
        [p.x, p.y, p.z]
    }
}

impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Cube,
    Model,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CubeProps {
    /// CSS color string, e.g. `#ff0000`.
    pub color: String,
    /// Texture catalog id, `None` for a flat-colored cube.
    #[serde(default)]
    pub texture: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelProps {
    pub model_id: String,
    /// Y-axis rotation in degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f32>,
}

/// Kind-specific fields of a placed asset, tagged by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AssetPayload {
    Cube(CubeProps),
    Model(ModelProps),
}

impl AssetPayload {
    pub fn kind(&self) -> AssetKind {
        match self {
            AssetPayload::Cube(_) => AssetKind::Cube,
            AssetPayload::Model(_) => AssetKind::Model,
        }
    }
}

/// A placement without identity: what the editor asks to insert, what travels
/// in an insert's `record`, and what a saved map stores.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub position: GridPos,
    #[serde(flatten)]
    pub payload: AssetPayload,
}

impl Asset {
    pub fn cube(position: GridPos, color: impl Into<String>, texture: Option<String>) -> Self {
        Self {
            position,
            payload: AssetPayload::Cube(CubeProps {
                color: color.into(),
                texture,
            }),
        }
    }

    pub fn model(position: GridPos, model_id: impl Into<String>, rotation: Option<i32>, scale: Option<f32>) -> Self {
        Self {
            position,
            payload: AssetPayload::Model(ModelProps {
                model_id: model_id.into(),
                rotation,
                scale,
            }),
        }
    }

    pub fn kind(&self) -> AssetKind {
        self.payload.kind()
    }
}

/// An asset with its replica-wide identity. Never mutated after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: OpId,
    #[serde(flatten)]
    pub asset: Asset,
}

impl AssetRecord {
    pub fn position(&self) -> GridPos {
        self.asset.position
    }

    pub fn kind(&self) -> AssetKind {
        self.asset.kind()
    }
}
