//! Level geometry collaborators: ground probing, ray casts, moving platforms

use glam::{EulerRot, Quat, Vec3};

use crate::ws::protocol::EntityId;

/// Result of a ray cast against level geometry and entity colliders
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// Entity whose collider was hit, `None` for level geometry
    pub entity: Option<EntityId>,
    pub distance: f32,
    pub point: Vec3,
}

/// Queries the replication layer needs from the physics/level layer
pub trait WorldQuery {
    /// Height of the first ground surface below `from`, at most `max_drop` down
    fn ground_height(&self, from: Vec3, max_drop: f32) -> Option<f32>;

    /// First hit along a normalized direction
    fn raycast(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<RayHit>;
}

/// World transform of a moving platform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlatformTransform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl PlatformTransform {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn to_world(&self, local: Vec3) -> Vec3 {
        self.position + self.rotation * local
    }

    pub fn to_local(&self, world: Vec3) -> Vec3 {
        self.rotation.inverse() * (world - self.position)
    }

    pub fn yaw(&self) -> f32 {
        self.rotation.to_euler(EulerRot::YXZ).0
    }
}

#[derive(Debug, Clone, Copy)]
struct Body {
    entity: EntityId,
    center: Vec3,
    radius: f32,
}

/// Flat ground plane plus spherical entity colliders.
///
/// Enough geometry for headless peers and tests; real clients back
/// [`WorldQuery`] with their physics scene.
#[derive(Debug, Clone, Default)]
pub struct FlatArena {
    ground_y: f32,
    bodies: Vec<Body>,
}

impl FlatArena {
    pub fn new(ground_y: f32) -> Self {
        Self {
            ground_y,
            bodies: Vec::new(),
        }
    }

    /// Add or move an entity collider
    pub fn set_body(&mut self, entity: EntityId, center: Vec3, radius: f32) {
        match self.bodies.iter_mut().find(|b| b.entity == entity) {
            Some(body) => {
                body.center = center;
                body.radius = radius;
            }
            None => self.bodies.push(Body {
                entity,
                center,
                radius,
            }),
        }
    }

    pub fn remove_body(&mut self, entity: EntityId) {
        self.bodies.retain(|b| b.entity != entity);
    }
}

impl WorldQuery for FlatArena {
    fn ground_height(&self, from: Vec3, max_drop: f32) -> Option<f32> {
        let drop = from.y - self.ground_y;
        (drop >= 0.0 && drop <= max_drop).then_some(self.ground_y)
    }

    fn raycast(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Option<RayHit> {
        let mut best: Option<RayHit> = None;
        let mut consider = |hit: RayHit| {
            if hit.distance <= max_distance && best.map_or(true, |b| hit.distance < b.distance) {
                best = Some(hit);
            }
        };

        for body in &self.bodies {
            if let Some(t) = ray_sphere(origin, direction, body.center, body.radius) {
                consider(RayHit {
                    entity: Some(body.entity),
                    distance: t,
                    point: origin + direction * t,
                });
            }
        }

        if direction.y < 0.0 && origin.y > self.ground_y {
            let t = (self.ground_y - origin.y) / direction.y;
            consider(RayHit {
                entity: None,
                distance: t,
                point: origin + direction * t,
            });
        }

        best
    }
}

/// Distance to the first sphere surface crossing, including the exit point
/// when the ray starts inside the sphere
fn ray_sphere(origin: Vec3, dir: Vec3, center: Vec3, radius: f32) -> Option<f32> {
    let oc = origin - center;
    let b = oc.dot(dir);
    let c = oc.length_squared() - radius * radius;
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    let sqrt = disc.sqrt();
    let near = -b - sqrt;
    if near >= 0.0 {
        return Some(near);
    }
    let far = -b + sqrt;
    (far >= 0.0).then_some(far)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_round_trip() {
        let platform = PlatformTransform::new(
            Vec3::new(10.0, 2.0, -4.0),
            Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
        );
        let world = Vec3::new(11.0, 3.0, -4.0);
        let local = platform.to_local(world);
        assert!(platform.to_world(local).distance(world) < 1e-5);
        assert!((platform.yaw() - std::f32::consts::FRAC_PI_2).abs() < 1e-5);
    }

    #[test]
    fn raycast_prefers_nearest_body() {
        let mut arena = FlatArena::new(0.0);
        arena.set_body(EntityId(1), Vec3::new(0.0, 1.0, -10.0), 0.5);
        arena.set_body(EntityId(2), Vec3::new(0.0, 1.0, -5.0), 0.5);
        let hit = arena
            .raycast(Vec3::new(0.0, 1.0, 0.0), Vec3::NEG_Z, 100.0)
            .unwrap();
        assert_eq!(hit.entity, Some(EntityId(2)));
        assert!((hit.distance - 4.5).abs() < 1e-4);
    }

    #[test]
    fn ray_from_inside_hits_exit_point() {
        let mut arena = FlatArena::new(-100.0);
        arena.set_body(EntityId(1), Vec3::ZERO, 1.0);
        let hit = arena.raycast(Vec3::ZERO, Vec3::X, 10.0).unwrap();
        assert_eq!(hit.entity, Some(EntityId(1)));
        assert!((hit.distance - 1.0).abs() < 1e-5);
    }

    #[test]
    fn ground_probe_respects_max_drop() {
        let arena = FlatArena::new(0.0);
        assert_eq!(arena.ground_height(Vec3::new(0.0, 2.0, 0.0), 5.0), Some(0.0));
        assert_eq!(arena.ground_height(Vec3::new(0.0, 20.0, 0.0), 5.0), None);
        assert_eq!(arena.ground_height(Vec3::new(0.0, -1.0, 0.0), 5.0), None);
    }
}
