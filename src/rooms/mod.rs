//! Room relay: peers join a named room and exchange frames through it

pub mod registry;
pub mod room;

pub use registry::RoomRegistry;
pub use room::{PeerLink, Room, RoomError, RoomHandle, RoomState};
