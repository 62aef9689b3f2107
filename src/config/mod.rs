//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::util::rate_limit::PEER_FRAME_RATE_LIMIT;
use crate::util::time::SIMULATION_TPS;

/// Relay server configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit logs as JSON lines (LOG_FORMAT=json)
    pub log_json: bool,
    /// Maximum peers per room
    pub room_capacity: usize,
    /// Inbound frames per second allowed from one peer
    pub peer_frame_rate: u32,
    /// Allowed client origins for CORS (comma-separated, empty = any)
    pub client_origin: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // PORT wins over SERVER_ADDR for hosted deployments
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")),
            room_capacity: env_or("ROOM_CAPACITY", 16)?,
            peer_frame_rate: env_or("PEER_MSG_RATE", PEER_FRAME_RATE_LIMIT)?,
            client_origin: env::var("CLIENT_ORIGIN").unwrap_or_default(),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid server address format")]
    InvalidAddress,

    #[error("Invalid value for environment variable {0}")]
    InvalidValue(&'static str),
}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue(key)),
        Err(_) => Ok(default),
    }
}

/// Remote replica smoothing and clamping tunables
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaConfig {
    /// Horizontal drift from the latest sample that forces a snap (meters)
    pub max_horizontal_deviation: f32,
    /// Allowed height above the latest sample (meters)
    pub vertical_margin: f32,
    /// Distance above ground at which a falling replica is snapped down (meters)
    pub ground_snap_threshold: f32,
    /// How far below the replica the ground probe looks (meters)
    pub ground_probe_distance: f32,
    /// Exponential smoothing rate toward the latest sample (1/s)
    pub lerp_rate: f32,
    /// Smoothing rate used when snapping to ground (1/s)
    pub ground_snap_rate: f32,
    /// Seconds after spawn during which dead reckoning is disabled
    pub extrapolation_warmup: f32,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            max_horizontal_deviation: 3.0,
            vertical_margin: 0.25,
            ground_snap_threshold: 0.3,
            ground_probe_distance: 5.0,
            lerp_rate: 12.0,
            ground_snap_rate: 30.0,
            extrapolation_warmup: 0.5,
        }
    }
}

/// Round flow tunables used while this peer holds authority
#[derive(Clone, Debug, PartialEq)]
pub struct RoundConfig {
    /// Match length in seconds (0 = no time limit)
    pub match_duration: f64,
    /// Pause between rounds in seconds
    pub between_games_duration: f64,
    pub respawn_delay: f64,
    /// Nametag stays hidden this long after a respawn teleport
    pub nametag_grace: f64,
    pub pickup_respawn: f64,
    /// Replicate health of non-player damageable objects
    pub sync_object_health: bool,
    /// Start the first round as soon as the authority has spawned
    pub auto_start: bool,
    /// Number of teams (0 = free for all)
    pub team_count: i32,
    pub max_health: f32,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            match_duration: 300.0,
            between_games_duration: 10.0,
            respawn_delay: 3.0,
            nametag_grace: 1.0,
            pickup_respawn: 20.0,
            sync_object_health: true,
            auto_start: true,
            team_count: 2,
            max_health: 100.0,
        }
    }
}

/// Per-peer session configuration
#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub tick_rate: u32,
    pub replica: ReplicaConfig,
    pub round: RoundConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            tick_rate: SIMULATION_TPS,
            replica: ReplicaConfig::default(),
            round: RoundConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by `ARENA_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        Ok(Self {
            tick_rate: env_or("ARENA_TICK_RATE", d.tick_rate)?,
            replica: ReplicaConfig {
                max_horizontal_deviation: env_or(
                    "ARENA_MAX_DEVIATION",
                    d.replica.max_horizontal_deviation,
                )?,
                vertical_margin: env_or("ARENA_VERTICAL_MARGIN", d.replica.vertical_margin)?,
                ground_snap_threshold: env_or(
                    "ARENA_GROUND_SNAP_THRESHOLD",
                    d.replica.ground_snap_threshold,
                )?,
                lerp_rate: env_or("ARENA_LERP_RATE", d.replica.lerp_rate)?,
                ..d.replica
            },
            round: RoundConfig {
                match_duration: env_or("ARENA_MATCH_DURATION", d.round.match_duration)?,
                between_games_duration: env_or(
                    "ARENA_BETWEEN_GAMES",
                    d.round.between_games_duration,
                )?,
                respawn_delay: env_or("ARENA_RESPAWN_DELAY", d.round.respawn_delay)?,
                sync_object_health: env_or(
                    "ARENA_SYNC_OBJECT_HEALTH",
                    d.round.sync_object_health,
                )?,
                team_count: env_or("ARENA_TEAMS", d.round.team_count)?,
                ..d.round
            },
        })
    }
}
