//! Replication core: networked entities, sync strategies, authority

pub mod activity;
pub mod authority;
pub mod clock;
pub mod combat;
pub mod damage;
pub mod entity;
pub mod inventory;
pub mod limiter;
pub mod local;
pub mod remote;
pub mod schedule;
pub mod session;
pub mod stats;
pub mod world;

pub use authority::{AuthorityError, AuthorityManager, Level, Pickup, SpawnPoint};
pub use entity::{EntityState, EntityTable, Lifecycle, NetworkEntity, SyncStrategy};
pub use session::{PeerSession, SpawnState, TickReport};
pub use world::{FlatArena, PlatformTransform, WorldQuery};
