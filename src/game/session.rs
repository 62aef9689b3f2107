//! Peer session: the per-peer context that owns every replicated entity.
//!
//! A session is created from the relay's welcome and fed relay frames as
//! they arrive. Outgoing messages accumulate in an outbox that the transport
//! drains after each call. All state changes happen on the caller's tick;
//! nothing here blocks.

use std::collections::BTreeSet;
use std::sync::Arc;

use glam::{Quat, Vec2, Vec3};
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::util::time::TimeSource;
use crate::ws::protocol::{
    Activity, ActivityPhase, ClientFrame, EntityId, FireEvent, GamePhase, PeerId, PeerMsg,
    PickupId, PlatformId, RelayFrame, Snapshot, SpawnAssignment, Target,
};

use super::activity::dispatch;
use super::authority::{AuthorityError, AuthorityManager, Level, RoleChange};
use super::combat::{clear_owner_collider, resolve_hits, shot_rays, ShotHit, WeaponStats, FORWARD};
use super::damage::{DamageOutcome, DamageRelay};
use super::entity::{EntityTable, Lifecycle, NetworkEntity, Platforms, NO_TEAM};
use super::remote::{ReplayedShot, ReplicaEnv};
use super::schedule::ScheduledTask;
use super::stats::{names, StatMap};
use super::world::{PlatformTransform, WorldQuery};

/// Progress of this peer's own player entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnState {
    /// Authority waiting for level data
    Waiting,
    /// Spawn info requested from the master
    Requested,
    Spawned,
}

/// Everything observable that happened during one session tick
#[derive(Debug, Default)]
pub struct TickReport {
    pub replayed: Vec<ReplayedShot>,
    /// Hits resolved by this peer (authority only)
    pub hits: Vec<ShotHit>,
    pub forced_switches: Vec<(EntityId, i32)>,
    pub tasks: Vec<ScheduledTask>,
}

pub struct PeerSession {
    config: SessionConfig,
    time: Arc<dyn TimeSource>,
    local: PeerId,
    name: String,
    peers: BTreeSet<PeerId>,
    authority: AuthorityManager,
    relay: DamageRelay,
    entities: EntityTable,
    platforms: Platforms,
    outbox: Vec<ClientFrame>,
    spawn: SpawnState,
    pending_requests: Vec<(PeerId, String)>,
}

impl PeerSession {
    /// Start a session from the relay's welcome
    pub fn join(
        config: SessionConfig,
        time: Arc<dyn TimeSource>,
        name: &str,
        local: PeerId,
        master: PeerId,
        peers: &[PeerId],
    ) -> Self {
        let mut known: BTreeSet<PeerId> = peers.iter().copied().collect();
        known.insert(local);

        let relay = DamageRelay::new(config.round.sync_object_health);
        let mut session = Self {
            config,
            time,
            local,
            name: name.to_string(),
            peers: known,
            authority: AuthorityManager::new(local, master),
            relay,
            entities: EntityTable::new(),
            platforms: Platforms::new(),
            outbox: Vec::new(),
            spawn: SpawnState::Waiting,
            pending_requests: Vec::new(),
        };
        info!(peer = %local, master = %master, name = %name, "Joined session");

        if !session.authority.is_authority() {
            session.request_spawn();
        }
        session
    }

    fn now(&self) -> f64 {
        self.time.now()
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn local_id(&self) -> EntityId {
        EntityId::for_peer(self.local)
    }

    pub fn master(&self) -> PeerId {
        self.authority.master()
    }

    pub fn is_authority(&self) -> bool {
        self.authority.is_authority()
    }

    pub fn authority(&self) -> &AuthorityManager {
        &self.authority
    }

    pub fn peers(&self) -> &BTreeSet<PeerId> {
        &self.peers
    }

    pub fn spawn_state(&self) -> SpawnState {
        self.spawn
    }

    pub fn phase(&self) -> GamePhase {
        self.authority.phase()
    }

    pub fn time_left(&self) -> f64 {
        self.authority.clock().time_left(self.now())
    }

    pub fn entities(&self) -> &EntityTable {
        &self.entities
    }

    pub fn entity(&self, id: EntityId) -> Option<&NetworkEntity> {
        self.entities.get(id)
    }

    pub fn local_entity(&self) -> Option<&NetworkEntity> {
        self.entities.get(self.local_id())
    }

    pub fn nametag_visible(&self, id: EntityId) -> bool {
        self.entities
            .get(id)
            .is_some_and(|e| e.nametag_visible(self.now()))
    }

    /// Take every message queued since the last drain
    pub fn drain_outbox(&mut self) -> Vec<ClientFrame> {
        std::mem::take(&mut self.outbox)
    }

    fn send(&mut self, target: Target, msg: PeerMsg) {
        self.outbox.push(ClientFrame { target, msg });
    }

    fn broadcast(&mut self, msg: PeerMsg) {
        self.send(Target::Others, msg);
    }

    // ---- Relay input ----

    pub fn handle_frame(&mut self, frame: RelayFrame) {
        match frame {
            RelayFrame::Welcome { peer, .. } => {
                warn!(peer = %peer, "Welcome for a running session ignored");
            }
            RelayFrame::PeerJoined { peer } => {
                debug!(peer = %peer, "Peer joined");
                self.peers.insert(peer);
            }
            RelayFrame::PeerLeft { peer } => self.peer_left(peer),
            RelayFrame::MasterChanged { master } => self.set_master(master),
            RelayFrame::Message { sender, msg } => {
                self.handle_message(sender, msg);
            }
            RelayFrame::Error { code, message } => {
                warn!(code = %code, message = %message, "Relay error");
            }
        }
    }

    fn peer_left(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
        let id = EntityId::for_peer(peer);
        if self.entities.remove(id).is_some() {
            debug!(peer = %peer, "Removed entity of departed peer");
        }
        self.authority
            .scheduler_mut()
            .cancel(ScheduledTask::Respawn(id));
        self.pending_requests.retain(|(p, _)| *p != peer);

        if peer == self.authority.master() {
            // Same rule as the relay: lowest remaining actor number
            if let Some(next) = self.peers.iter().next().copied() {
                self.set_master(next);
            }
        }
    }

    fn set_master(&mut self, master: PeerId) {
        match self.authority.set_master(master) {
            RoleChange::Promoted => self.take_over(),
            RoleChange::MasterMoved | RoleChange::Demoted => {
                if self.spawn == SpawnState::Requested {
                    self.request_spawn();
                }
            }
            RoleChange::Unchanged => {}
        }
    }

    /// Re-create authority timers under the new epoch and resync everyone
    fn take_over(&mut self) {
        let now = self.now();
        let round = self.config.round.clone();

        let dead: Vec<EntityId> = self
            .entities
            .players()
            .filter(|e| e.lifecycle() == Lifecycle::Dead)
            .map(|e| e.id)
            .collect();
        let pickups: Vec<PickupId> = self.authority.disabled_pickups().iter().copied().collect();
        let restart_at = self.authority.clock().end_time().max(now);
        let phase = self.authority.phase();

        let scheduler = self.authority.scheduler_mut();
        for id in &dead {
            scheduler.schedule(now + round.respawn_delay, ScheduledTask::Respawn(*id));
        }
        for pickup in &pickups {
            scheduler.schedule(now + round.pickup_respawn, ScheduledTask::EnablePickup(*pickup));
        }
        if phase == GamePhase::BetweenGames {
            scheduler.schedule(restart_at, ScheduledTask::RestartRound);
        }
        info!(
            peer = %self.local,
            respawns = dead.len(),
            pickups = pickups.len(),
            "Took over authority"
        );

        if self.spawn != SpawnState::Spawned {
            if let Err(e) = self.self_spawn() {
                debug!(error = %e, "Self spawn deferred");
            }
        }
        self.broadcast_snapshot();
    }

    /// Apply one peer message; returns whether it was accepted
    pub fn handle_message(&mut self, sender: PeerId, msg: PeerMsg) -> bool {
        if sender == self.local {
            trace!("Own message echoed back, ignoring");
            return false;
        }
        if msg.authority_only() && !self.authority.accepts_from(sender) {
            debug!(
                sender = %sender,
                master = %self.authority.master(),
                kind = msg.kind(),
                "Dropped authority message from non-authority"
            );
            return false;
        }
        if let Some(subject) = msg.subject() {
            if subject != EntityId::for_peer(sender) {
                debug!(sender = %sender, subject = %subject, kind = msg.kind(), "Dropped message about another entity");
                return false;
            }
        }

        match msg {
            PeerMsg::Snapshot(snapshot) => self.apply_snapshot(&snapshot),
            PeerMsg::PartialSnapshot(partial) => {
                for (id, stats) in &partial.per_entity {
                    self.apply_entity_stats(*id, stats);
                }
            }
            PeerMsg::Sample { entity_id, sample } => match self.entities.get_mut(entity_id) {
                Some(entity) if !entity.is_local() => entity.serialize_in(sample),
                _ => trace!(entity = %entity_id, "Sample for unknown entity dropped"),
            },
            PeerMsg::Activity { entity_id, event } => {
                match self.entities.get_mut(entity_id).and_then(|e| e.remote_parts()) {
                    Some((_, state)) => dispatch(&mut state.activities, &event),
                    None => debug!(entity = %entity_id, "Activity for unknown entity dropped"),
                }
            }
            PeerMsg::Fire { entity_id, event } => {
                if self.authority.phase() != GamePhase::Playing {
                    debug!(entity = %entity_id, "Fire outside a round dropped");
                    return false;
                }
                match self.entities.get_mut(entity_id) {
                    Some(entity) if entity.is_alive() && !entity.state.frozen => {
                        if let Some((adapter, _)) = entity.remote_parts() {
                            adapter.receive_fire(event);
                        }
                    }
                    _ => {
                        debug!(entity = %entity_id, "Fire from dead, frozen or unknown entity dropped");
                        return false;
                    }
                }
            }
            PeerMsg::Kill(kill) => self.relay.mirror_kill(&mut self.entities, &kill),
            PeerMsg::Respawn(respawn) => {
                let hide_until = self.now() + self.config.round.nametag_grace;
                self.relay.mirror_respawn(
                    &mut self.entities,
                    &respawn,
                    self.config.round.max_health,
                    hide_until,
                );
            }
            PeerMsg::Health(update) => self.relay.mirror_health(&mut self.entities, &update),
            PeerMsg::SpawnRequest { name } => {
                if !self.authority.is_authority() {
                    debug!(sender = %sender, "Spawn request sent to a non-authority");
                    return false;
                }
                return self.handle_spawn_request(sender, name);
            }
            PeerMsg::SpawnAssignment(assignment) => {
                if assignment.entity_id != self.local_id() || self.spawn == SpawnState::Spawned {
                    debug!(entity = %assignment.entity_id, "Unexpected spawn assignment");
                    return false;
                }
                self.instantiate_local(assignment.team, assignment.position, assignment.rotation);
            }
            PeerMsg::Spawned {
                entity_id,
                name,
                team,
            } => {
                // Teams come from the authority; an announce only names a known entity
                if let Some(entity) = self.entities.get_mut(entity_id) {
                    if entity.state.team != team {
                        debug!(entity = %entity_id, announced = team, team = entity.state.team, "Ignored announced team");
                    }
                    entity.state.name = name;
                } else {
                    let team = if self.authority.is_authority() {
                        let population = self.entities.team_population(self.config.round.team_count);
                        self.authority.allocate_team(&population)
                    } else {
                        team
                    };
                    let mut entity = NetworkEntity::remote(entity_id);
                    entity.state.name = name;
                    entity.state.team = team;
                    self.entities.insert(entity);
                }
            }
            PeerMsg::PickupTaken { pickup_id } => {
                if !self.authority.is_authority() {
                    return false;
                }
                if let Err(e) = self.grant_pickup(EntityId::for_peer(sender), pickup_id) {
                    debug!(sender = %sender, error = %e, "Pickup claim rejected");
                }
            }
        }
        true
    }

    fn apply_snapshot(&mut self, snapshot: &Snapshot) {
        let now = self.now();
        self.authority.apply_header(now, snapshot);
        for (id, stats) in &snapshot.per_entity {
            self.apply_entity_stats(*id, stats);
        }
        let frozen = snapshot.phase != GamePhase::Playing;
        for entity in self.entities.players_mut() {
            entity.state.frozen = frozen;
        }
        trace!(entities = snapshot.per_entity.len(), phase = ?snapshot.phase, "Snapshot applied");
    }

    /// Player transforms belong to their adapters and are never overwritten
    /// from snapshots
    fn apply_entity_stats(&mut self, id: EntityId, stats: &StatMap) {
        if id.is_player() {
            if !self.entities.contains(id) {
                if id == self.local_id() {
                    return;
                }
                self.entities.insert(NetworkEntity::remote(id));
            }
            self.entities
                .apply_stats(id, stats, |name| !names::TRANSFORM.contains(&name));
        } else if let Some(object) = self.entities.object_mut(id) {
            if let Some(health) = stats.get(names::HEALTH).and_then(|v| v.as_float()) {
                object.health = health;
                object.destroyed = health <= 0.0;
            }
        } else {
            debug!(object = %id, "Stats for unknown object dropped");
        }
    }

    // ---- Join flow ----

    fn request_spawn(&mut self) {
        let master = self.authority.master();
        self.send(
            Target::Peer(master),
            PeerMsg::SpawnRequest {
                name: self.name.clone(),
            },
        );
        self.spawn = SpawnState::Requested;
        debug!(master = %master, "Requested spawn");
    }

    /// Only peers without a placed entity may ask; returns whether the request was honoured
    fn handle_spawn_request(&mut self, sender: PeerId, name: String) -> bool {
        let id = EntityId::for_peer(sender);
        if let Some(existing) = self.entities.get(id) {
            if existing.lifecycle() != Lifecycle::Spawning {
                debug!(sender = %sender, lifecycle = ?existing.lifecycle(), "Spawn request from placed entity dropped");
                return false;
            }
        }
        if !self.authority.has_level() {
            debug!(sender = %sender, "Level not loaded, queueing spawn request");
            self.pending_requests.push((sender, name));
            return true;
        }

        let team = match self.entities.get(id) {
            Some(existing) if existing.state.team != NO_TEAM => existing.state.team,
            _ => {
                let population = self.entities.team_population(self.config.round.team_count);
                self.authority.allocate_team(&population)
            }
        };
        let point = match self.authority.pick_spawn(team) {
            Ok(point) => point,
            Err(e) => {
                warn!(sender = %sender, error = %e, "Cannot assign spawn");
                return false;
            }
        };

        if !self.entities.contains(id) {
            self.entities.insert(NetworkEntity::remote(id));
        }
        if let Some(entity) = self.entities.get_mut(id) {
            entity.state.name = name;
            entity.state.team = team;
            entity.state.health = self.config.round.max_health;
        }
        info!(peer = %sender, team, "Assigned spawn");

        self.send(
            Target::Peer(sender),
            PeerMsg::SpawnAssignment(SpawnAssignment {
                entity_id: id,
                team,
                position: point.position,
                rotation: point.rotation,
            }),
        );
        let snapshot = self.authority.assemble_snapshot(self.now(), &self.entities);
        self.send(Target::Peer(sender), PeerMsg::Snapshot(snapshot));
        true
    }

    /// The authority allocates its own spawn once level data is available
    fn self_spawn(&mut self) -> Result<(), AuthorityError> {
        let population = self.entities.team_population(self.config.round.team_count);
        let team = self.authority.allocate_team(&population);
        let point = self.authority.pick_spawn(team)?;
        self.instantiate_local(team, point.position, point.rotation);
        Ok(())
    }

    fn instantiate_local(&mut self, team: i32, position: Vec3, rotation: Quat) {
        let id = self.local_id();
        let mut entity = NetworkEntity::local(id, &self.name, team);
        if let Err(e) = entity.spawn_local(position, rotation) {
            warn!(error = %e, "Local spawn failed");
            return;
        }
        entity.state.health = self.config.round.max_health;
        entity.state.frozen = self.authority.phase() != GamePhase::Playing;
        self.entities.insert(entity);
        self.spawn = SpawnState::Spawned;
        info!(entity = %id, team, position = %position, "Local entity spawned");

        self.broadcast(PeerMsg::Spawned {
            entity_id: id,
            name: self.name.clone(),
            team,
        });
    }

    /// Level data became available locally
    pub fn load_level(&mut self, level: Level) {
        if self.entities.objects().next().is_none() {
            for max_health in &level.objects {
                self.entities.add_object(*max_health);
            }
        }
        self.authority.load_level(level);

        if !self.authority.is_authority() {
            return;
        }
        if self.spawn != SpawnState::Spawned {
            if let Err(e) = self.self_spawn() {
                warn!(error = %e, "Authority cannot spawn itself");
            }
        }
        for (peer, name) in std::mem::take(&mut self.pending_requests) {
            if !self.handle_spawn_request(peer, name) {
                debug!(peer = %peer, "Queued spawn request dropped");
            }
        }
    }

    pub fn register_object(&mut self, max_health: f32) -> EntityId {
        self.entities.add_object(max_health)
    }

    pub fn set_platform(&mut self, id: PlatformId, transform: PlatformTransform) {
        self.platforms.insert(id, transform);
    }

    pub fn remove_platform(&mut self, id: PlatformId) {
        self.platforms.remove(&id);
    }

    // ---- Simulation tick ----

    pub fn tick(&mut self, dt: f32, world: &dyn WorldQuery) -> TickReport {
        let mut report = TickReport::default();
        let local_id = self.local_id();

        if let Some(entity) = self.entities.get_mut(local_id) {
            if let Some((adapter, state)) = entity.local_parts() {
                adapter.tick(state, dt);
            }
            if entity.is_alive() {
                if let Some(sample) = entity.serialize_out(&self.platforms) {
                    self.outbox.push(ClientFrame {
                        target: Target::Others,
                        msg: PeerMsg::Sample {
                            entity_id: local_id,
                            sample,
                        },
                    });
                }
            }
        }

        let env = ReplicaEnv {
            config: &self.config.replica,
            platforms: &self.platforms,
            world,
            tick_rate: self.config.tick_rate,
        };
        for entity in self.entities.players_mut() {
            let id = entity.id;
            let armed = entity.is_alive() && !entity.state.frozen;
            let Some((adapter, state)) = entity.remote_parts() else {
                continue;
            };
            let out = adapter.tick(id, state, dt, &env);

            if out.first_sample && entity.lifecycle() == Lifecycle::Spawning {
                if let Err(e) = entity.transition(Lifecycle::Active) {
                    debug!(error = %e, "Replica activation skipped");
                }
            }
            if let Some(weapon) = out.forced_switch {
                report.forced_switches.push((id, weapon));
            }
            if let Some(shot) = out.shot.filter(|_| armed) {
                report.replayed.push(shot);
            }
        }

        if self.authority.is_authority() {
            // Shots queued before a round ended resolve to nothing
            let live = self.authority.phase() == GamePhase::Playing;
            for shot in report.replayed.iter().filter(|_| live) {
                let Some(weapon) = WeaponStats::for_index(shot.weapon_index) else {
                    continue;
                };
                let hits = resolve_hits(world, shot.shooter, shot.origin, &shot.rays, &weapon);
                for hit in &hits {
                    self.damage(hit.target, hit.damage, Some(shot.shooter));
                }
                report.hits.extend(hits);
            }
            report.tasks = self.run_round();
        }
        report
    }

    /// Authority round flow: scheduled tasks, clock expiry, auto start
    fn run_round(&mut self) -> Vec<ScheduledTask> {
        let now = self.now();
        let tasks = self.authority.scheduler_mut().drain_due(now);
        for task in &tasks {
            debug!(task = ?task, "Running scheduled task");
            match *task {
                ScheduledTask::Respawn(id) => self.respawn_player(id),
                ScheduledTask::RestartRound => {
                    if let Err(e) = self.start_game() {
                        warn!(error = %e, "Round restart failed");
                    }
                }
                ScheduledTask::EnablePickup(pickup) => {
                    if self.authority.enable_pickup(pickup) {
                        self.broadcast_snapshot();
                    }
                }
            }
        }

        let phase = self.authority.phase();
        if phase == GamePhase::Playing && !self.authority.clock().is_running(now) {
            if let Err(e) = self.stop_game() {
                warn!(error = %e, "Round stop failed");
            }
        } else if phase == GamePhase::NotStarted
            && self.config.round.auto_start
            && self.spawn == SpawnState::Spawned
        {
            if let Err(e) = self.start_game() {
                warn!(error = %e, "Auto start failed");
            }
        }
        tasks
    }

    fn respawn_player(&mut self, id: EntityId) {
        let Some(team) = self.entities.get(id).map(|e| e.state.team) else {
            return;
        };
        let point = match self.authority.pick_spawn(team) {
            Ok(point) => point,
            Err(e) => {
                warn!(entity = %id, error = %e, "Respawn failed");
                return;
            }
        };
        let hide_until = self.now() + self.config.round.nametag_grace;
        self.relay.respawn(
            &mut self.entities,
            id,
            point.position,
            point.rotation,
            self.config.round.max_health,
            hide_until,
            &mut self.outbox,
        );
    }

    // ---- Authority operations ----

    fn require_authority(&self) -> Result<(), AuthorityError> {
        if self.authority.is_authority() {
            Ok(())
        } else {
            Err(AuthorityError::NotAuthority)
        }
    }

    /// Respawn everyone, reset scores, unfreeze, restart the clock
    pub fn start_game(&mut self) -> Result<(), AuthorityError> {
        self.require_authority()?;
        if !self.authority.has_level() {
            return Err(AuthorityError::LevelNotLoaded);
        }

        let now = self.now();
        let hide_until = now + self.config.round.nametag_grace;
        let max_health = self.config.round.max_health;
        for id in self.entities.player_ids() {
            let Some(entity) = self.entities.get(id) else {
                continue;
            };
            if matches!(
                entity.lifecycle(),
                Lifecycle::Uninitialized | Lifecycle::Destroyed
            ) {
                continue;
            }
            let point = self.authority.pick_spawn(entity.state.team)?;
            self.authority
                .scheduler_mut()
                .cancel(ScheduledTask::Respawn(id));
            self.relay.respawn(
                &mut self.entities,
                id,
                point.position,
                point.rotation,
                max_health,
                hide_until,
                &mut self.outbox,
            );
            if let Some(entity) = self.entities.get_mut(id) {
                entity.state.kills = 0;
                entity.state.deaths = 0;
                entity.state.frozen = false;
            }
        }

        self.authority.scheduler_mut().cancel(ScheduledTask::RestartRound);
        self.authority
            .reset_clock(now, self.config.round.match_duration);
        self.authority.set_phase(GamePhase::Playing);
        info!(duration = self.config.round.match_duration, "Round started");
        self.broadcast_snapshot();
        Ok(())
    }

    /// Freeze everyone and count down to the next round
    pub fn stop_game(&mut self) -> Result<(), AuthorityError> {
        self.require_authority()?;
        let now = self.now();
        let pause = self.config.round.between_games_duration;

        for entity in self.entities.players_mut() {
            entity.state.frozen = true;
        }
        self.authority.set_phase(GamePhase::BetweenGames);
        self.authority.reset_clock(now, pause);
        self.authority
            .scheduler_mut()
            .schedule(now + pause, ScheduledTask::RestartRound);
        info!(pause, "Round over");
        self.broadcast_snapshot();
        Ok(())
    }

    fn broadcast_snapshot(&mut self) {
        let snapshot = self.authority.assemble_snapshot(self.now(), &self.entities);
        self.broadcast(PeerMsg::Snapshot(snapshot));
    }

    pub fn transmit_full_snapshot(&mut self) -> Result<(), AuthorityError> {
        self.require_authority()?;
        self.broadcast_snapshot();
        Ok(())
    }

    pub fn transmit_partial_snapshot(
        &mut self,
        ids: &[EntityId],
        stat_names: &[&str],
    ) -> Result<(), AuthorityError> {
        self.require_authority()?;
        let partial = self
            .authority
            .partial_snapshot(&self.entities, ids, stat_names);
        if !partial.per_entity.is_empty() {
            self.broadcast(PeerMsg::PartialSnapshot(partial));
        }
        Ok(())
    }

    /// Authoritative damage; lethal hits on players schedule a respawn
    pub fn apply_damage(
        &mut self,
        target: EntityId,
        amount: f32,
        source: Option<EntityId>,
    ) -> Result<DamageOutcome, AuthorityError> {
        self.require_authority()?;
        Ok(self.damage(target, amount, source))
    }

    fn damage(&mut self, target: EntityId, amount: f32, source: Option<EntityId>) -> DamageOutcome {
        let outcome =
            self.relay
                .apply_damage(&mut self.entities, target, amount, source, &mut self.outbox);
        if outcome == DamageOutcome::Killed && target.is_player() {
            let due = self.now() + self.config.round.respawn_delay;
            self.authority
                .scheduler_mut()
                .schedule(due, ScheduledTask::Respawn(target));
        }
        outcome
    }

    fn grant_pickup(&mut self, taker: EntityId, pickup: PickupId) -> Result<bool, AuthorityError> {
        let level = self.authority.level().ok_or(AuthorityError::LevelNotLoaded)?;
        let item = level
            .pickup(pickup)
            .cloned()
            .ok_or(AuthorityError::UnknownPickup(pickup))?;
        if !self.authority.is_pickup_enabled(pickup) {
            return Ok(false);
        }
        let entity = self
            .entities
            .get_mut(taker)
            .filter(|e| e.is_alive())
            .ok_or(AuthorityError::UnknownEntity(taker))?;

        entity.state.inventory.add(&item.item, item.count);
        self.authority.disable_pickup(pickup);
        let due = self.now() + self.config.round.pickup_respawn;
        self.authority
            .scheduler_mut()
            .schedule(due, ScheduledTask::EnablePickup(pickup));
        debug!(entity = %taker, pickup, item = %item.item, "Pickup granted");
        self.broadcast_snapshot();
        Ok(true)
    }

    // ---- Local player actions ----

    /// Mirror the local simulation into the entity this peer drives
    pub fn update_local_motion(
        &mut self,
        position: Vec3,
        yaw: f32,
        pitch: f32,
        velocity: Vec3,
        input: Vec2,
    ) {
        let local_id = self.local_id();
        if let Some((adapter, state)) = self
            .entities
            .get_mut(local_id)
            .and_then(|e| e.local_parts())
        {
            state.position = position;
            state.rotation = Quat::from_rotation_y(yaw);
            state.pitch = pitch;
            state.velocity = velocity;
            adapter.set_input(input);
        }
    }

    pub fn set_local_platform(&mut self, platform: Option<PlatformId>) {
        let local_id = self.local_id();
        if let Some((adapter, _)) = self
            .entities
            .get_mut(local_id)
            .and_then(|e| e.local_parts())
        {
            match platform {
                Some(id) => adapter.attach_platform(id),
                None => adapter.detach_platform(),
            }
        }
    }

    pub fn start_activity(&mut self, activity: Activity, arg: Option<i32>) -> bool {
        self.local_activity(activity, ActivityPhase::Start, arg)
    }

    pub fn stop_activity(&mut self, activity: Activity) -> bool {
        self.local_activity(activity, ActivityPhase::Stop, None)
    }

    fn local_activity(&mut self, activity: Activity, phase: ActivityPhase, arg: Option<i32>) -> bool {
        let local_id = self.local_id();
        let Some(entity) = self.entities.get_mut(local_id).filter(|e| e.is_alive()) else {
            return false;
        };
        let Some((adapter, state)) = entity.local_parts() else {
            return false;
        };
        let event = adapter.activity(state, activity, phase, arg);
        self.broadcast(PeerMsg::Activity {
            entity_id: local_id,
            event,
        });
        true
    }

    pub fn switch_weapon(&mut self, index: i32) -> bool {
        let local_id = self.local_id();
        let event = self
            .entities
            .get_mut(local_id)
            .filter(|e| e.is_alive())
            .and_then(|e| e.local_parts())
            .and_then(|(adapter, state)| adapter.switch_weapon(state, index));
        match event {
            Some(event) => {
                self.broadcast(PeerMsg::Activity {
                    entity_id: local_id,
                    event,
                });
                true
            }
            None => false,
        }
    }

    /// Fire the local weapon. The authority resolves its own hits at once;
    /// other peers' shots are resolved when the authority replays them.
    pub fn fire(&mut self, muzzle: Vec3, aim: Quat, world: &dyn WorldQuery) -> Option<FireEvent> {
        let local_id = self.local_id();
        let tick_rate = self.config.tick_rate;
        let event = self
            .entities
            .get_mut(local_id)
            .filter(|e| e.is_alive())
            .and_then(|e| e.local_parts())
            .and_then(|(adapter, state)| adapter.try_fire(state, muzzle, aim, tick_rate))?;

        self.broadcast(PeerMsg::Fire {
            entity_id: local_id,
            event,
        });

        if self.authority.is_authority() {
            if let Some(weapon) = WeaponStats::for_index(event.weapon_index) {
                let rays = shot_rays(local_id, event.seed, aim, &weapon);
                let origin =
                    clear_owner_collider(world, local_id, muzzle, aim * FORWARD, weapon.range);
                for hit in resolve_hits(world, local_id, origin, &rays, &weapon) {
                    self.damage(hit.target, hit.damage, Some(local_id));
                }
            }
        }
        Some(event)
    }

    /// Claim a pickup; non-authorities ask the master
    pub fn take_pickup(&mut self, pickup: PickupId) -> Result<bool, AuthorityError> {
        if self.authority.is_authority() {
            return self.grant_pickup(self.local_id(), pickup);
        }
        let master = self.authority.master();
        self.send(Target::Peer(master), PeerMsg::PickupTaken { pickup_id: pickup });
        Ok(false)
    }

    /// Drop all session state, as on leaving the room or changing level
    pub fn teardown(&mut self) {
        info!(peer = %self.local, "Session torn down");
        self.entities.clear();
        self.platforms.clear();
        self.outbox.clear();
        self.pending_requests.clear();
        self.authority.reset();
        self.spawn = SpawnState::Waiting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::game::authority::{Pickup, SpawnPoint};
    use crate::game::world::FlatArena;
    use crate::rooms::room::RoomState;
    use crate::util::time::ManualClock;
    use crate::ws::protocol::{ContinuousSample, HealthUpdate, KillEvent, NO_PLATFORM};

    const DT: f32 = 1.0 / 30.0;

    fn level() -> Level {
        Level {
            name: "depot".into(),
            spawn_points: vec![
                SpawnPoint {
                    position: Vec3::new(-20.0, 0.0, 0.0),
                    rotation: Quat::IDENTITY,
                    team: Some(0),
                },
                SpawnPoint {
                    position: Vec3::new(20.0, 0.0, 0.0),
                    rotation: Quat::from_rotation_y(std::f32::consts::PI),
                    team: Some(1),
                },
            ],
            pickups: vec![Pickup {
                id: 7,
                item: "medkit".into(),
                count: 1,
            }],
            objects: vec![50.0],
        }
    }

    /// In-process room: sessions exchange frames through a relay room
    struct Loopback {
        room: RoomState,
        clock: ManualClock,
        arena: FlatArena,
        sessions: BTreeMap<PeerId, PeerSession>,
    }

    impl Loopback {
        fn new() -> Self {
            Self {
                room: RoomState::new("test", 8),
                clock: ManualClock::new(0.0),
                arena: FlatArena::new(0.0),
                sessions: BTreeMap::new(),
            }
        }

        fn join(&mut self, name: &str) -> PeerId {
            let (peer, deliveries) = self.room.join().unwrap();
            let mut rest = Vec::new();
            for (to, frame) in deliveries {
                match frame {
                    RelayFrame::Welcome {
                        peer: me,
                        master,
                        peers,
                    } if to == peer => {
                        let session = PeerSession::join(
                            SessionConfig::default(),
                            Arc::new(self.clock.clone()),
                            name,
                            me,
                            master,
                            &peers,
                        );
                        self.sessions.insert(peer, session);
                    }
                    other => rest.push((to, other)),
                }
            }
            self.deliver(rest);
            self.pump();
            peer
        }

        fn leave(&mut self, peer: PeerId) {
            self.sessions.remove(&peer);
            let deliveries = self.room.leave(peer);
            self.deliver(deliveries);
            self.pump();
        }

        fn deliver(&mut self, deliveries: Vec<(PeerId, RelayFrame)>) {
            for (to, frame) in deliveries {
                if let Some(session) = self.sessions.get_mut(&to) {
                    session.handle_frame(frame);
                }
            }
        }

        fn pump(&mut self) {
            loop {
                let mut moved = false;
                let peers: Vec<PeerId> = self.sessions.keys().copied().collect();
                for peer in peers {
                    let frames = match self.sessions.get_mut(&peer) {
                        Some(s) => s.drain_outbox(),
                        None => continue,
                    };
                    for frame in frames {
                        moved = true;
                        let deliveries = self.room.route(peer, frame);
                        self.deliver(deliveries);
                    }
                }
                if !moved {
                    break;
                }
            }
        }

        fn tick(&mut self) {
            self.clock.advance(DT as f64);
            for session in self.sessions.values_mut() {
                session.tick(DT, &self.arena);
            }
            self.pump();
        }

        fn run(&mut self, seconds: f32) {
            for _ in 0..(seconds / DT).round() as u32 {
                self.tick();
            }
        }

        fn session(&self, peer: PeerId) -> &PeerSession {
            &self.sessions[&peer]
        }

        fn session_mut(&mut self, peer: PeerId) -> &mut PeerSession {
            self.sessions.get_mut(&peer).unwrap()
        }

        fn load_level(&mut self, peer: PeerId) {
            self.session_mut(peer).load_level(level());
            self.pump();
        }
    }

    /// Two peers with the first as authority, both spawned and playing
    fn two_peers() -> (Loopback, PeerId, PeerId) {
        let mut net = Loopback::new();
        let a = net.join("alpha");
        net.load_level(a);
        let b = net.join("bravo");
        net.load_level(b);
        net.run(0.2);
        (net, a, b)
    }

    #[test]
    fn first_peer_waits_for_level_before_spawning() {
        let mut net = Loopback::new();
        let a = net.join("alpha");
        assert!(net.session(a).is_authority());
        assert_eq!(net.session(a).spawn_state(), SpawnState::Waiting);
        assert!(net.session(a).local_entity().is_none());

        net.load_level(a);
        assert_eq!(net.session(a).spawn_state(), SpawnState::Spawned);
        net.tick();
        assert_eq!(net.session(a).phase(), GamePhase::Playing);
    }

    #[test]
    fn joiner_gets_team_spawn_and_snapshot() {
        let (net, a, b) = two_peers();
        let sb = net.session(b);
        assert_eq!(sb.spawn_state(), SpawnState::Spawned);
        assert_eq!(sb.phase(), GamePhase::Playing);

        let alpha_team = net.session(a).local_entity().unwrap().state.team;
        let bravo_team = sb.local_entity().unwrap().state.team;
        assert_ne!(alpha_team, bravo_team);

        // Each side sees the other, with names from the snapshot/announce
        let alpha_on_b = sb.entity(EntityId::for_peer(a)).unwrap();
        assert_eq!(alpha_on_b.state.name, "alpha");
        assert_eq!(alpha_on_b.lifecycle(), Lifecycle::Active);
        let bravo_on_a = net.session(a).entity(EntityId::for_peer(b)).unwrap();
        assert_eq!(bravo_on_a.state.name, "bravo");
        assert_eq!(bravo_on_a.lifecycle(), Lifecycle::Active);
    }

    #[test]
    fn kill_and_respawn_mirror_on_replica() {
        let (mut net, a, b) = two_peers();
        let victim = EntityId::for_peer(b);
        let killer = EntityId::for_peer(a);

        let outcome = net
            .session_mut(a)
            .apply_damage(victim, 1000.0, Some(killer))
            .unwrap();
        assert_eq!(outcome, DamageOutcome::Killed);
        net.pump();

        let on_b = net.session(b).entity(victim).unwrap();
        assert_eq!(on_b.lifecycle(), Lifecycle::Dead);
        assert_eq!(on_b.state.deaths, 1);
        assert_eq!(net.session(b).entity(killer).unwrap().state.kills, 1);

        // Replica cannot act while dead
        assert!(net
            .session_mut(b)
            .fire(Vec3::Y, Quat::IDENTITY, &FlatArena::new(0.0))
            .is_none());

        net.run(2.9);
        assert_eq!(net.session(b).entity(victim).unwrap().lifecycle(), Lifecycle::Dead);
        net.run(0.2);

        // bravo is on team 1, which has a single spawn point
        let sb = net.session(b);
        let on_b = sb.entity(victim).unwrap();
        assert_eq!(on_b.lifecycle(), Lifecycle::Active);
        assert_eq!(on_b.state.position, Vec3::new(20.0, 0.0, 0.0));
        let facing = Quat::from_rotation_y(std::f32::consts::PI);
        assert_eq!(on_b.state.rotation, facing);
        assert_eq!(on_b.state.health, 100.0);
        assert!(!sb.nametag_visible(victim));
        // The authority's replica faces the same way
        let on_a = net.session(a).entity(victim).unwrap();
        assert!(on_a.state.rotation.angle_between(facing) < 1e-2);

        net.run(1.1);
        assert!(net.session(b).nametag_visible(victim));
    }

    #[test]
    fn replica_ignores_kill_from_non_authority() {
        let (mut net, a, b) = two_peers();
        let c = net.join("charlie");
        net.run(0.2);

        let target = EntityId::for_peer(a);
        let forged = PeerMsg::Kill(KillEvent {
            entity_id: target,
            killer: None,
        });
        assert!(!net.session_mut(c).handle_message(b, forged.clone()));
        assert_eq!(net.session(c).entity(target).unwrap().lifecycle(), Lifecycle::Active);

        let forged_health = PeerMsg::Health(HealthUpdate {
            entity_id: target,
            health: 1.0,
        });
        assert!(!net.session_mut(c).handle_message(b, forged_health));
        assert!(net.session_mut(c).handle_message(a, forged));
    }

    #[test]
    fn samples_about_other_entities_are_rejected() {
        let (mut net, a, b) = two_peers();
        let spoof = PeerMsg::Sample {
            entity_id: EntityId::for_peer(a),
            sample: ContinuousSample {
                platform_id: NO_PLATFORM,
                position: Vec3::splat(99.0),
                rotation: Vec2::ZERO,
                velocity: Vec3::ZERO,
                input_vector: Vec2::ZERO,
                weapon_index: 0,
            },
        };
        assert!(!net.session_mut(a).handle_message(b, spoof));
    }

    #[test]
    fn single_authority_across_handovers() {
        let mut net = Loopback::new();
        let a = net.join("alpha");
        net.load_level(a);
        let b = net.join("bravo");
        let c = net.join("charlie");
        net.run(0.2);

        net.leave(a);
        assert!(net.session(b).is_authority());
        assert!(!net.session(c).is_authority());
        assert_eq!(net.session(b).authority().promotions(), 1);

        let msg = PeerMsg::Health(HealthUpdate {
            entity_id: EntityId::for_peer(c),
            health: 50.0,
        });
        // The departed master is no longer accepted, the new one is
        assert!(!net.session_mut(c).handle_message(a, msg.clone()));
        assert!(net.session_mut(c).handle_message(b, msg));

        // Repeated notifications do not re-run the takeover
        net.session_mut(b).handle_frame(RelayFrame::MasterChanged { master: b });
        net.session_mut(b).handle_frame(RelayFrame::PeerLeft { peer: a });
        assert_eq!(net.session(b).authority().promotions(), 1);

        net.leave(b);
        assert!(net.session(c).is_authority());
        assert_eq!(net.sessions.values().filter(|s| s.is_authority()).count(), 1);
    }

    #[test]
    fn handover_reschedules_pending_respawn() {
        let mut net = Loopback::new();
        let a = net.join("alpha");
        net.load_level(a);
        let b = net.join("bravo");
        net.load_level(b);
        let c = net.join("charlie");
        net.load_level(c);
        net.run(0.2);

        let victim = EntityId::for_peer(c);
        net.session_mut(a)
            .apply_damage(victim, 1000.0, None)
            .unwrap();
        net.pump();
        assert_eq!(net.session(b).entity(victim).unwrap().lifecycle(), Lifecycle::Dead);

        // Authority leaves before the respawn fires; the new one re-creates it
        net.leave(a);
        assert!(net.session(b).is_authority());
        assert!(net
            .session(b)
            .authority()
            .scheduler()
            .is_pending(ScheduledTask::Respawn(victim)));

        net.run(3.2);
        assert_eq!(net.session(c).local_entity().unwrap().lifecycle(), Lifecycle::Active);
    }

    #[test]
    fn pending_joiner_re_requests_from_new_master() {
        let mut net = Loopback::new();
        let a = net.join("alpha");
        // No level on the master: the request is parked there
        let b = net.join("bravo");
        assert_eq!(net.session(b).spawn_state(), SpawnState::Requested);

        net.leave(a);
        // bravo is now master and spawns itself once it has the level
        assert!(net.session(b).is_authority());
        net.load_level(b);
        assert_eq!(net.session(b).spawn_state(), SpawnState::Spawned);
    }

    #[test]
    fn round_ends_on_clock_and_restarts() {
        let (mut net, a, b) = two_peers();
        let config = SessionConfig::default();

        net.session_mut(a).stop_game().unwrap();
        net.pump();
        assert_eq!(net.session(b).phase(), GamePhase::BetweenGames);
        assert!(net.session(b).local_entity().unwrap().state.frozen);

        net.run(config.round.between_games_duration as f32 + 0.1);
        assert_eq!(net.session(a).phase(), GamePhase::Playing);
        assert_eq!(net.session(b).phase(), GamePhase::Playing);
        assert!(!net.session(b).local_entity().unwrap().state.frozen);
        assert!(net.session(b).time_left() > config.round.match_duration - 1.0);
    }

    #[test]
    fn non_authority_cannot_start_rounds() {
        let (mut net, _a, b) = two_peers();
        assert_eq!(
            net.session_mut(b).start_game(),
            Err(AuthorityError::NotAuthority)
        );
        assert_eq!(
            net.session_mut(b).transmit_full_snapshot(),
            Err(AuthorityError::NotAuthority)
        );
    }

    #[test]
    fn pickups_are_granted_once_and_return() {
        let (mut net, a, b) = two_peers();
        assert_eq!(net.session_mut(b).take_pickup(7), Ok(false));
        net.pump();

        let bravo = EntityId::for_peer(b);
        let sb = net.session(b);
        assert_eq!(sb.local_entity().unwrap().state.inventory.count("medkit"), 1);
        assert!(!sb.authority().is_pickup_enabled(7));

        // Already taken
        assert_eq!(net.session_mut(a).take_pickup(7), Ok(false));
        assert_eq!(
            net.session(a).entity(bravo).unwrap().state.inventory.count("medkit"),
            1
        );

        net.run(SessionConfig::default().round.pickup_respawn as f32 + 0.1);
        assert!(net.session(b).authority().is_pickup_enabled(7));
    }

    #[test]
    fn object_damage_replicates() {
        let (mut net, a, b) = two_peers();
        let barrel = EntityId::for_object(0);
        net.session_mut(a).apply_damage(barrel, 20.0, None).unwrap();
        net.pump();
        assert_eq!(net.session(b).entities().object(barrel).unwrap().health, 30.0);

        net.session_mut(a).apply_damage(barrel, 40.0, None).unwrap();
        net.pump();
        assert!(net.session(b).entities().object(barrel).unwrap().destroyed);
    }

    #[test]
    fn activities_arrive_in_order() {
        let (mut net, a, b) = two_peers();
        let sb = net.session_mut(b);
        assert!(sb.start_activity(Activity::Crouch, None));
        assert!(sb.start_activity(Activity::Zoom, None));
        assert!(sb.stop_activity(Activity::Crouch));
        net.pump();

        let flags = &net.session(a).entity(EntityId::for_peer(b)).unwrap().state.activities;
        assert!(!flags.crouching);
        assert!(flags.zoomed);
    }

    #[test]
    fn remote_fire_is_replayed_and_resolved_by_authority() {
        let (mut net, a, b) = two_peers();
        let shooter = EntityId::for_peer(b);
        let target = EntityId::for_peer(a);

        // Line the target up in front of the shooter's muzzle
        net.arena.set_body(target, Vec3::new(0.0, 1.0, -10.0), 0.5);
        let arena = net.arena.clone();
        let shot = net
            .session_mut(b)
            .fire(Vec3::new(0.0, 1.0, 0.0), Quat::IDENTITY, &arena);
        assert!(shot.is_some());
        net.pump();

        // Replayed on the authority's next tick
        net.tick();
        let health = net.session(a).local_entity().unwrap().state.health;
        let pistol = WeaponStats::for_index(0).unwrap();
        assert!((health - (100.0 - pistol.damage)).abs() < 1e-4, "health {health}");
        assert_eq!(
            net.session(a).entity(shooter).unwrap().state.shots_fired,
            1
        );
    }

    #[test]
    fn repeated_spawn_request_does_not_heal() {
        let (mut net, a, b) = two_peers();
        let bravo = EntityId::for_peer(b);
        net.session_mut(a).apply_damage(bravo, 60.0, None).unwrap();
        net.pump();

        let again = PeerMsg::SpawnRequest {
            name: "bravo".into(),
        };
        assert!(!net.session_mut(a).handle_message(b, again));
        assert_eq!(net.session(a).entity(bravo).unwrap().state.health, 40.0);
        net.pump();
        assert_eq!(net.session(b).local_entity().unwrap().state.health, 40.0);
    }

    #[test]
    fn announced_team_does_not_override_allocation() {
        let (mut net, a, b) = two_peers();
        let c = net.join("charlie");
        net.run(0.2);

        let bravo = EntityId::for_peer(b);
        let assigned = net.session(a).entity(bravo).unwrap().state.team;
        let announce = PeerMsg::Spawned {
            entity_id: bravo,
            name: "bravo".into(),
            team: 1 - assigned,
        };
        net.session_mut(a).handle_message(b, announce.clone());
        net.session_mut(c).handle_message(b, announce);
        assert_eq!(net.session(a).entity(bravo).unwrap().state.team, assigned);
        assert_eq!(net.session(c).entity(bravo).unwrap().state.team, assigned);
    }

    #[test]
    fn fire_between_rounds_deals_no_damage() {
        let (mut net, a, b) = two_peers();
        let shooter = EntityId::for_peer(b);
        let target = EntityId::for_peer(a);
        net.arena.set_body(target, Vec3::new(0.0, 1.0, -10.0), 0.5);

        // Shot queued on the authority while playing, round ends before it replays
        let arena = net.arena.clone();
        assert!(net
            .session_mut(b)
            .fire(Vec3::new(0.0, 1.0, 0.0), Quat::IDENTITY, &arena)
            .is_some());
        net.pump();
        net.session_mut(a).stop_game().unwrap();
        net.tick();
        assert_eq!(net.session(a).phase(), GamePhase::BetweenGames);
        assert_eq!(net.session(a).local_entity().unwrap().state.health, 100.0);

        let late = PeerMsg::Fire {
            entity_id: shooter,
            event: FireEvent {
                weapon_index: 0,
                position: Vec3::new(0.0, 1.0, 0.0),
                rotation: Quat::IDENTITY,
                seed: 5,
            },
        };
        assert!(!net.session_mut(a).handle_message(b, late));
        net.tick();
        assert_eq!(net.session(a).local_entity().unwrap().state.health, 100.0);
    }

    #[test]
    fn partial_snapshot_updates_only_named_stats() {
        let (mut net, a, b) = two_peers();
        let alpha = EntityId::for_peer(a);
        {
            let sa = net.session_mut(a);
            sa.apply_damage(alpha, 30.0, None).unwrap();
            sa.drain_outbox();
            sa.transmit_partial_snapshot(&[alpha], &[names::KILLS]).unwrap();
        }
        net.pump();
        // Health was not part of the partial snapshot
        assert_eq!(net.session(b).entity(alpha).unwrap().state.health, 100.0);
    }

    #[test]
    fn teardown_clears_the_session() {
        let (mut net, _a, b) = two_peers();
        let sb = net.session_mut(b);
        sb.teardown();
        assert!(sb.local_entity().is_none());
        assert_eq!(sb.entities().players().count(), 0);
        assert_eq!(sb.phase(), GamePhase::NotStarted);
        assert!(sb.drain_outbox().is_empty());
    }
}
