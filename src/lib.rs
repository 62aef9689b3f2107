//! Arena Sync - authority and replication layer for a multiplayer arena
//! shooter, plus the room relay peers talk through.
//!
//! - `game`: networked entities, local/remote sync, authority and rounds
//! - `ws::protocol`: wire messages shared by peers and the relay
//! - `rooms`, `ws::handler`, `http`: the relay server

pub mod app;
pub mod config;
pub mod game;
pub mod http;
pub mod rooms;
pub mod util;
pub mod ws;

pub use game::PeerSession;
