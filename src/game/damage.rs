//! Damage, kill, and respawn relay.
//!
//! The authority computes damage and emits the outcome; every other peer
//! mirrors health, kills, and respawns verbatim and never decides lethality.

use std::collections::BTreeMap;

use glam::{Quat, Vec3};
use tracing::{debug, info};

use crate::ws::protocol::{
    ClientFrame, EntityId, HealthUpdate, KillEvent, PartialSnapshot, PeerMsg, RespawnEvent, Target,
};

use super::combat::CombatSystem;
use super::entity::EntityTable;
use super::stats::names;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DamageOutcome {
    /// Target missing, already dead, or destroyed
    Ignored,
    Damaged { health: f32 },
    Killed,
}

#[derive(Debug, Clone)]
pub struct DamageRelay {
    sync_object_health: bool,
}

impl DamageRelay {
    pub fn new(sync_object_health: bool) -> Self {
        Self { sync_object_health }
    }

    /// Apply authoritative damage and queue the resulting broadcasts
    pub fn apply_damage(
        &self,
        entities: &mut EntityTable,
        target: EntityId,
        amount: f32,
        source: Option<EntityId>,
        outbox: &mut Vec<ClientFrame>,
    ) -> DamageOutcome {
        if target.is_player() {
            self.damage_player(entities, target, amount, source, outbox)
        } else {
            self.damage_object(entities, target, amount, outbox)
        }
    }

    fn damage_player(
        &self,
        entities: &mut EntityTable,
        target: EntityId,
        amount: f32,
        source: Option<EntityId>,
        outbox: &mut Vec<ClientFrame>,
    ) -> DamageOutcome {
        let Some(victim) = entities.get_mut(target) else {
            debug!(entity = %target, "Damage for unknown entity dropped");
            return DamageOutcome::Ignored;
        };
        if !victim.is_alive() {
            return DamageOutcome::Ignored;
        }

        let (health, dead) = CombatSystem::apply_damage(victim.state.health, amount);
        victim.state.health = health;
        if !dead {
            broadcast(
                outbox,
                PeerMsg::Health(HealthUpdate {
                    entity_id: target,
                    health,
                }),
            );
            return DamageOutcome::Damaged { health };
        }

        if let Err(e) = victim.kill() {
            debug!(error = %e, "Kill skipped");
            return DamageOutcome::Ignored;
        }
        victim.state.deaths += 1;

        let killer = source.filter(|k| *k != target && k.is_player());
        if let Some(killer) = killer.and_then(|k| entities.get_mut(k)) {
            killer.state.kills += 1;
        }
        info!(victim = %target, killer = ?killer.map(|k| k.0), "Player killed");

        broadcast(
            outbox,
            PeerMsg::Kill(KillEvent {
                entity_id: target,
                killer,
            }),
        );

        let mut scored = vec![target];
        scored.extend(killer);
        let mut per_entity = BTreeMap::new();
        for id in scored {
            if let Some(entity) = entities.get(id) {
                per_entity.insert(
                    id,
                    entities.stats().snapshot_subset(
                        &entity.state,
                        &[names::HEALTH, names::KILLS, names::DEATHS],
                    ),
                );
            }
        }
        broadcast(
            outbox,
            PeerMsg::PartialSnapshot(PartialSnapshot { per_entity }),
        );
        DamageOutcome::Killed
    }

    fn damage_object(
        &self,
        entities: &mut EntityTable,
        target: EntityId,
        amount: f32,
        outbox: &mut Vec<ClientFrame>,
    ) -> DamageOutcome {
        let Some(object) = entities.object_mut(target) else {
            debug!(object = %target, "Damage for unknown object dropped");
            return DamageOutcome::Ignored;
        };
        if object.destroyed {
            return DamageOutcome::Ignored;
        }

        let (health, dead) = CombatSystem::apply_damage(object.health, amount);
        object.health = health;
        if dead {
            object.destroyed = true;
            debug!(object = %target, "Object destroyed");
            broadcast(
                outbox,
                PeerMsg::Kill(KillEvent {
                    entity_id: target,
                    killer: None,
                }),
            );
            return DamageOutcome::Killed;
        }
        if self.sync_object_health {
            broadcast(
                outbox,
                PeerMsg::Health(HealthUpdate {
                    entity_id: target,
                    health,
                }),
            );
        }
        DamageOutcome::Damaged { health }
    }

    /// Respawn on the authority and announce it
    #[allow(clippy::too_many_arguments)]
    pub fn respawn(
        &self,
        entities: &mut EntityTable,
        id: EntityId,
        position: Vec3,
        rotation: Quat,
        health: f32,
        hide_nametag_until: f64,
        outbox: &mut Vec<ClientFrame>,
    ) -> bool {
        let Some(entity) = entities.get_mut(id) else {
            return false;
        };
        if let Err(e) = entity.respawn(position, rotation, health, hide_nametag_until) {
            debug!(error = %e, "Respawn skipped");
            return false;
        }
        broadcast(
            outbox,
            PeerMsg::Respawn(RespawnEvent {
                entity_id: id,
                position,
                rotation,
            }),
        );
        true
    }

    pub fn mirror_health(&self, entities: &mut EntityTable, update: &HealthUpdate) {
        if let Some(entity) = entities.get_mut(update.entity_id) {
            entity.state.health = update.health;
        } else if let Some(object) = entities.object_mut(update.entity_id) {
            object.health = update.health;
        } else {
            debug!(entity = %update.entity_id, "Health update for unknown entity dropped");
        }
    }

    pub fn mirror_kill(&self, entities: &mut EntityTable, event: &KillEvent) {
        if let Some(entity) = entities.get_mut(event.entity_id) {
            if let Err(e) = entity.kill() {
                debug!(error = %e, "Kill mirror skipped");
            }
        } else if let Some(object) = entities.object_mut(event.entity_id) {
            object.health = 0.0;
            object.destroyed = true;
        } else {
            debug!(entity = %event.entity_id, "Kill for unknown entity dropped");
        }
    }

    pub fn mirror_respawn(
        &self,
        entities: &mut EntityTable,
        event: &RespawnEvent,
        health: f32,
        hide_nametag_until: f64,
    ) {
        let Some(entity) = entities.get_mut(event.entity_id) else {
            debug!(entity = %event.entity_id, "Respawn for unknown entity dropped");
            return;
        };
        if let Err(e) = entity.respawn(event.position, event.rotation, health, hide_nametag_until)
        {
            debug!(error = %e, "Respawn mirror skipped");
        }
    }
}

fn broadcast(outbox: &mut Vec<ClientFrame>, msg: PeerMsg) {
    outbox.push(ClientFrame {
        target: Target::Others,
        msg,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::entity::{Lifecycle, NetworkEntity};

    fn table_with_two() -> EntityTable {
        let mut table = EntityTable::new();
        for (id, name) in [(1, "a"), (2, "b")] {
            let mut e = NetworkEntity::local(EntityId(id), name, 0);
            e.spawn_local(Vec3::ZERO, Quat::IDENTITY).unwrap();
            table.insert(e);
        }
        table
    }

    #[test]
    fn lethal_damage_kills_and_scores() {
        let relay = DamageRelay::new(true);
        let mut table = table_with_two();
        let mut outbox = Vec::new();

        let hit = relay.apply_damage(&mut table, EntityId(2), 60.0, Some(EntityId(1)), &mut outbox);
        assert_eq!(hit, DamageOutcome::Damaged { health: 40.0 });
        let kill = relay.apply_damage(&mut table, EntityId(2), 60.0, Some(EntityId(1)), &mut outbox);
        assert_eq!(kill, DamageOutcome::Killed);

        assert_eq!(table.get(EntityId(2)).unwrap().lifecycle(), Lifecycle::Dead);
        assert_eq!(table.get(EntityId(2)).unwrap().state.deaths, 1);
        assert_eq!(table.get(EntityId(1)).unwrap().state.kills, 1);
        assert!(outbox.iter().any(|f| matches!(
            f.msg,
            PeerMsg::Kill(KillEvent {
                entity_id: EntityId(2),
                killer: Some(EntityId(1))
            })
        )));

        // Dead players take no further damage
        let again = relay.apply_damage(&mut table, EntityId(2), 10.0, None, &mut outbox);
        assert_eq!(again, DamageOutcome::Ignored);
    }

    #[test]
    fn suicide_does_not_score() {
        let relay = DamageRelay::new(true);
        let mut table = table_with_two();
        let mut outbox = Vec::new();
        relay.apply_damage(&mut table, EntityId(1), 500.0, Some(EntityId(1)), &mut outbox);
        assert_eq!(table.get(EntityId(1)).unwrap().state.kills, 0);
        assert_eq!(table.get(EntityId(1)).unwrap().state.deaths, 1);
    }

    #[test]
    fn object_health_sync_is_optional() {
        let mut table = EntityTable::new();
        let barrel = table.add_object(30.0);
        let mut outbox = Vec::new();

        DamageRelay::new(false).apply_damage(&mut table, barrel, 10.0, None, &mut outbox);
        assert!(outbox.is_empty());

        DamageRelay::new(false).apply_damage(&mut table, barrel, 25.0, None, &mut outbox);
        assert_eq!(outbox.len(), 1);
        assert!(matches!(outbox[0].msg, PeerMsg::Kill(_)));
        assert!(table.object(barrel).unwrap().destroyed);
    }

    #[test]
    fn mirrors_apply_verbatim() {
        let relay = DamageRelay::new(true);
        let mut table = EntityTable::new();
        table.insert(NetworkEntity::remote(EntityId(3)));
        table.get_mut(EntityId(3)).unwrap().transition(Lifecycle::Active).unwrap();

        relay.mirror_health(
            &mut table,
            &HealthUpdate {
                entity_id: EntityId(3),
                health: 5.0,
            },
        );
        assert_eq!(table.get(EntityId(3)).unwrap().state.health, 5.0);

        relay.mirror_kill(
            &mut table,
            &KillEvent {
                entity_id: EntityId(3),
                killer: None,
            },
        );
        assert_eq!(table.get(EntityId(3)).unwrap().lifecycle(), Lifecycle::Dead);

        let pos = Vec3::new(1.0, 0.0, 2.0);
        relay.mirror_respawn(
            &mut table,
            &RespawnEvent {
                entity_id: EntityId(3),
                position: pos,
                rotation: Quat::IDENTITY,
            },
            100.0,
            1.0,
        );
        let e = table.get(EntityId(3)).unwrap();
        assert_eq!(e.lifecycle(), Lifecycle::Active);
        assert_eq!(e.state.position, pos);
        assert_eq!(e.state.health, 100.0);
    }
}
