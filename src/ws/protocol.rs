//! Wire message definitions
//! Peer-to-peer replication messages plus the relay frames that carry them

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use glam::{Quat, Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::game::stats::StatMap;

/// Actor number assigned by the relay (starts at 1, never reused within a room)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Networked entity id.
///
/// Player entities share the owning peer's actor number. Non-player
/// damageable objects use negative ids so the two ranges never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i32);

impl EntityId {
    pub fn for_peer(peer: PeerId) -> Self {
        Self(peer.0 as i32)
    }

    /// Id for the n-th non-player damageable object (n starts at 0)
    pub fn for_object(index: u32) -> Self {
        Self(-(index as i32) - 1)
    }

    pub fn is_player(self) -> bool {
        self.0 > 0
    }

    /// Owning peer for player entities
    pub fn owner(self) -> Option<PeerId> {
        self.is_player().then_some(PeerId(self.0 as u32))
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type PickupId = u32;

/// Moving platform reference; `NO_PLATFORM` means world space
pub type PlatformId = i32;
pub const NO_PLATFORM: PlatformId = -1;

/// Match phase as replicated in full snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    #[default]
    NotStarted,
    Playing,
    BetweenGames,
}

/// Delivery class a message travels with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Latest sample wins, drops and reordering tolerated
    Unreliable,
    /// Per-sender order preserved
    ReliableOrdered,
}

/// Who a peer message is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "to", content = "peer", rename_all = "snake_case")]
pub enum Target {
    All,
    Others,
    Peer(PeerId),
}

/// Full canonical state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub phase: GamePhase,
    /// Seconds left on the match clock (0 when the clock is open-ended)
    pub time_left: f64,
    pub duration: f64,
    pub per_entity: BTreeMap<EntityId, StatMap>,
    pub disabled_pickups: BTreeSet<PickupId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialSnapshot {
    pub per_entity: BTreeMap<EntityId, StatMap>,
}

/// Continuous movement sample, sent unreliably every network tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContinuousSample {
    pub platform_id: PlatformId,
    /// Platform-relative when `platform_id != NO_PLATFORM`, else world space
    pub position: Vec3,
    /// (camera pitch, root yaw) in radians
    pub rotation: Vec2,
    pub velocity: Vec3,
    pub input_vector: Vec2,
    pub weapon_index: i32,
}

/// Discrete activities a player can start or stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Crouch,
    Run,
    Reload,
    Zoom,
    Climb,
    OutOfControl,
    WeaponSwitch,
    Attack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityPhase {
    Start,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub activity: Activity,
    pub phase: ActivityPhase,
    /// Extra payload, e.g. the target weapon index for a weapon switch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg: Option<i32>,
}

/// Weapon discharge. Spread is never sent; peers rebuild it from `seed`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FireEvent {
    pub weapon_index: i32,
    pub position: Vec3,
    pub rotation: Quat,
    pub seed: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KillEvent {
    pub entity_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub killer: Option<EntityId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RespawnEvent {
    pub entity_id: EntityId,
    pub position: Vec3,
    pub rotation: Quat,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthUpdate {
    pub entity_id: EntityId,
    pub health: f32,
}

/// Authority's answer to a spawn request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnAssignment {
    pub entity_id: EntityId,
    pub team: i32,
    pub position: Vec3,
    pub rotation: Quat,
}

/// Messages exchanged between peers (through the relay)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMsg {
    Snapshot(Snapshot),
    PartialSnapshot(PartialSnapshot),
    Sample {
        entity_id: EntityId,
        sample: ContinuousSample,
    },
    Activity {
        entity_id: EntityId,
        event: ActivityEvent,
    },
    Fire {
        entity_id: EntityId,
        event: FireEvent,
    },
    Kill(KillEvent),
    Respawn(RespawnEvent),
    Health(HealthUpdate),
    /// Joining peer asks the authority for a team and spawn point
    SpawnRequest {
        name: String,
    },
    SpawnAssignment(SpawnAssignment),
    /// A peer announces its freshly instantiated local entity
    Spawned {
        entity_id: EntityId,
        name: String,
        team: i32,
    },
    /// Non-authority reports touching a pickup; the authority decides
    PickupTaken {
        pickup_id: PickupId,
    },
}

impl PeerMsg {
    /// Delivery class for this message kind
    pub fn delivery(&self) -> Delivery {
        match self {
            PeerMsg::Sample { .. } => Delivery::Unreliable,
            _ => Delivery::ReliableOrdered,
        }
    }

    /// Whether only the current authority may send this message
    pub fn authority_only(&self) -> bool {
        matches!(
            self,
            PeerMsg::Snapshot(_)
                | PeerMsg::PartialSnapshot(_)
                | PeerMsg::Kill(_)
                | PeerMsg::Respawn(_)
                | PeerMsg::Health(_)
                | PeerMsg::SpawnAssignment(_)
        )
    }

    /// Entity a self-describing message is about (samples, activities, fire, spawn announce)
    pub fn subject(&self) -> Option<EntityId> {
        match self {
            PeerMsg::Sample { entity_id, .. }
            | PeerMsg::Activity { entity_id, .. }
            | PeerMsg::Fire { entity_id, .. }
            | PeerMsg::Spawned { entity_id, .. } => Some(*entity_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PeerMsg::Snapshot(_) => "snapshot",
            PeerMsg::PartialSnapshot(_) => "partial_snapshot",
            PeerMsg::Sample { .. } => "sample",
            PeerMsg::Activity { .. } => "activity",
            PeerMsg::Fire { .. } => "fire",
            PeerMsg::Kill(_) => "kill",
            PeerMsg::Respawn(_) => "respawn",
            PeerMsg::Health(_) => "health",
            PeerMsg::SpawnRequest { .. } => "spawn_request",
            PeerMsg::SpawnAssignment(_) => "spawn_assignment",
            PeerMsg::Spawned { .. } => "spawned",
            PeerMsg::PickupTaken { .. } => "pickup_taken",
        }
    }
}

/// Frame sent from a peer to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub target: Target,
    pub msg: PeerMsg,
}

/// Frames sent from the relay to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayFrame {
    /// First frame after connecting
    Welcome {
        peer: PeerId,
        master: PeerId,
        /// Every peer in the room, including the receiver
        peers: Vec<PeerId>,
    },
    PeerJoined {
        peer: PeerId,
    },
    PeerLeft {
        peer: PeerId,
    },
    /// The authority role moved to `master`
    MasterChanged {
        master: PeerId,
    },
    /// A peer message, with the sender stamped by the relay
    Message {
        sender: PeerId,
        msg: PeerMsg,
    },
    Error {
        code: String,
        message: String,
    },
}
