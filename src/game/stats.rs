//! Stat registry: name-keyed accessors over replicated entity state.
//!
//! Every replicated primitive of an entity (health, team, shot counter,
//! transform, inventory, weapon) is exposed through a getter/setter pair
//! registered under a stable name. Snapshots are produced by calling every
//! getter and consumed by calling the setter for every key present.

use std::collections::BTreeMap;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// Replicated stat names
pub mod names {
    pub const NAME: &str = "Name";
    pub const HEALTH: &str = "Health";
    pub const TEAM: &str = "Team";
    pub const SHOTS_FIRED: &str = "ShotsFired";
    pub const KILLS: &str = "Kills";
    pub const DEATHS: &str = "Deaths";
    pub const POSITION: &str = "Position";
    pub const ROTATION: &str = "Rotation";
    pub const ITEMS: &str = "Items";
    pub const WEAPON: &str = "Weapon";

    /// Stats whose value is the entity transform
    pub const TRANSFORM: [&str; 2] = [POSITION, ROTATION];
}

/// A single replicated value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum StatValue {
    Float(f32),
    Int(i64),
    Text(String),
    Vector(Vec3),
    Rotation(Quat),
    /// Item name to count
    Items(BTreeMap<String, i32>),
}

impl StatValue {
    pub fn as_float(&self) -> Option<f32> {
        match self {
            StatValue::Float(v) => Some(*v),
            StatValue::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            StatValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            StatValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<Vec3> {
        match self {
            StatValue::Vector(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_rotation(&self) -> Option<Quat> {
        match self {
            StatValue::Rotation(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_items(&self) -> Option<&BTreeMap<String, i32>> {
        match self {
            StatValue::Items(v) => Some(v),
            _ => None,
        }
    }
}

/// Stat name to value, ordered by name
pub type StatMap = BTreeMap<String, StatValue>;

pub type Getter<T> = fn(&T) -> StatValue;
pub type Setter<T> = fn(&mut T, &StatValue);

/// Hook for targets that re-render on change (inventory UI and the like).
///
/// `apply` suspends refreshes for the duration of a snapshot so one
/// snapshot triggers at most one refresh.
pub trait StatTarget {
    fn suspend_refresh(&mut self) {}
    fn resume_refresh(&mut self) {}
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StatError {
    #[error("stat {0:?} is already registered")]
    Duplicate(String),
}

struct Accessor<T> {
    get: Getter<T>,
    set: Setter<T>,
}

/// Table of accessors shared by every entity of type `T`
pub struct StatRegistry<T> {
    accessors: BTreeMap<&'static str, Accessor<T>>,
}

impl<T: StatTarget> StatRegistry<T> {
    pub fn new() -> Self {
        Self {
            accessors: BTreeMap::new(),
        }
    }

    /// Register a stat. A name can only be registered once.
    pub fn register(
        &mut self,
        name: &'static str,
        get: Getter<T>,
        set: Setter<T>,
    ) -> Result<(), StatError> {
        if self.accessors.contains_key(name) {
            warn!(stat = name, "Stat already registered, keeping the first accessor");
            return Err(StatError::Duplicate(name.to_string()));
        }
        self.accessors.insert(name, Accessor { get, set });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.accessors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.accessors.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.accessors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accessors.is_empty()
    }

    pub fn get(&self, target: &T, name: &str) -> Option<StatValue> {
        self.accessors.get(name).map(|a| (a.get)(target))
    }

    /// Read every registered stat
    pub fn snapshot(&self, target: &T) -> StatMap {
        self.accessors
            .iter()
            .map(|(name, a)| (name.to_string(), (a.get)(target)))
            .collect()
    }

    /// Read only the listed stats; unknown names are skipped
    pub fn snapshot_subset(&self, target: &T, names: &[&str]) -> StatMap {
        names
            .iter()
            .filter_map(|name| {
                self.accessors
                    .get(*name)
                    .map(|a| (name.to_string(), (a.get)(target)))
            })
            .collect()
    }

    /// Write every known key of `values`. Unknown keys are ignored.
    pub fn apply(&self, target: &mut T, values: &StatMap) {
        self.apply_filtered(target, values, |_| true);
    }

    /// Like [`apply`](Self::apply) but only for keys accepted by `keep`
    pub fn apply_filtered(&self, target: &mut T, values: &StatMap, keep: impl Fn(&str) -> bool) {
        target.suspend_refresh();
        for (name, value) in values {
            if !keep(name) {
                continue;
            }
            match self.accessors.get(name.as_str()) {
                Some(a) => (a.set)(target, value),
                None => trace!(stat = %name, "Ignoring unknown stat"),
            }
        }
        target.resume_refresh();
    }
}

impl<T: StatTarget> Default for StatRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
