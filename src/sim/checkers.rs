// src/sim/checkers.rs
//
// World-consistency checks run at the top of every tick. Both only look at
// the ego vehicle; a scene without the ego passes trivially.

use super::{ConsistencyChecker, SceneSnapshot};
use crate::error::WorldViolation;
use crate::types::VehicleState;

// ============================================================================
// COLLISION
// ============================================================================

pub struct CollisionChecker;

impl ConsistencyChecker for CollisionChecker {
    fn name(&self) -> &'static str {
        "collision"
    }

    fn check(&self, scene: &SceneSnapshot, ego_id: &str) -> Result<(), WorldViolation> {
        let Some(ego) = scene.vehicle(ego_id) else {
            return Ok(());
        };
        let ego_box = corners(ego);

        for (id, other) in &scene.vehicles {
            if id == ego_id {
                continue;
            }
            if boxes_overlap(&ego_box, &corners(other)) {
                return Err(WorldViolation::Collision { other: id.clone() });
            }
        }
        Ok(())
    }
}

/// Oriented footprint, counter-clockwise from front-left.
pub fn corners(v: &VehicleState) -> [[f64; 2]; 4] {
    let (sin, cos) = v.yaw.sin_cos();
    let hl = v.length / 2.0;
    let hw = v.width / 2.0;
    [[hl, hw], [-hl, hw], [-hl, -hw], [hl, -hw]].map(|[lx, ly]| {
        [v.x + lx * cos - ly * sin, v.y + lx * sin + ly * cos]
    })
}

/// Separating-axis test for two convex quads.
pub fn boxes_overlap(a: &[[f64; 2]; 4], b: &[[f64; 2]; 4]) -> bool {
    for quad in [a, b] {
        for i in 0..2 {
            let edge = [quad[i + 1][0] - quad[i][0], quad[i + 1][1] - quad[i][1]];
            let axis = [-edge[1], edge[0]];
            let (a_min, a_max) = project(a, axis);
            let (b_min, b_max) = project(b, axis);
            if a_max < b_min || b_max < a_min {
                return false;
            }
        }
    }
    true
}

fn project(quad: &[[f64; 2]; 4], axis: [f64; 2]) -> (f64, f64) {
    quad.iter()
        .map(|p| p[0] * axis[0] + p[1] * axis[1])
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), d| (lo.min(d), hi.max(d)))
}

// ============================================================================
// OFF-ROAD
// ============================================================================

pub struct OffRoadChecker;

impl ConsistencyChecker for OffRoadChecker {
    fn name(&self) -> &'static str {
        "off_road"
    }

    fn check(&self, scene: &SceneSnapshot, ego_id: &str) -> Result<(), WorldViolation> {
        let Some(ego) = scene.vehicle(ego_id) else {
            return Ok(());
        };
        // no map loaded, nothing to check against
        if scene.road.polygons.is_empty() {
            return Ok(());
        }

        let p = [ego.x, ego.y];
        if scene.road.polygons.iter().any(|poly| point_in_polygon(p, poly)) {
            Ok(())
        } else {
            Err(WorldViolation::OffRoad { x: ego.x, y: ego.y })
        }
    }
}

/// Even-odd ray cast. Works with or without a repeated closing point.
pub fn point_in_polygon(p: [f64; 2], poly: &[[f64; 2]]) -> bool {
    if poly.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = poly.len() - 1;
    for i in 0..poly.len() {
        let (pi, pj) = (poly[i], poly[j]);
        if (pi[1] > p[1]) != (pj[1] > p[1]) {
            let x_cross = pj[0] + (p[1] - pj[1]) * (pi[0] - pj[0]) / (pi[1] - pj[1]);
            if p[0] < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::RoadGraph;
    use std::collections::BTreeMap;

    fn car(id: &str, x: f64, y: f64, yaw: f64) -> VehicleState {
        VehicleState {
            id: id.to_string(),
            x,
            y,
            yaw,
            speed: 0.0,
            length: 4.0,
            width: 2.0,
        }
    }

    fn scene(vehicles: Vec<VehicleState>, polygons: Vec<Vec<[f64; 2]>>) -> SceneSnapshot {
        SceneSnapshot {
            time_step: 0,
            road: RoadGraph { polygons },
            vehicles: vehicles
                .into_iter()
                .map(|v| (v.id.clone(), v))
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn road() -> Vec<Vec<[f64; 2]>> {
        vec![vec![[-10.0, -5.0], [100.0, -5.0], [100.0, 5.0], [-10.0, 5.0]]]
    }

    #[test]
    fn test_separate_vehicles_do_not_collide() {
        let s = scene(vec![car("ego", 0.0, 0.0, 0.0), car("a", 6.0, 0.0, 0.0)], road());
        assert!(CollisionChecker.check(&s, "ego").is_ok());
    }

    #[test]
    fn test_overlapping_vehicles_collide() {
        let s = scene(vec![car("ego", 0.0, 0.0, 0.0), car("a", 3.0, 0.5, 0.3)], road());
        match CollisionChecker.check(&s, "ego") {
            Err(WorldViolation::Collision { other }) => assert_eq!(other, "a"),
            other => panic!("expected collision, got {:?}", other),
        }
    }

    #[test]
    fn test_rotated_box_gap_is_found() {
        // diagonal neighbour whose corners would overlap an axis-aligned bound
        let a = corners(&car("a", 0.0, 0.0, std::f64::consts::FRAC_PI_4));
        let b = corners(&car("b", 3.2, 3.2, std::f64::consts::FRAC_PI_4));
        assert!(!boxes_overlap(&a, &b));
    }

    #[test]
    fn test_off_road_detection() {
        let on = scene(vec![car("ego", 20.0, 1.0, 0.0)], road());
        assert!(OffRoadChecker.check(&on, "ego").is_ok());

        let off = scene(vec![car("ego", 20.0, 9.0, 0.0)], road());
        assert!(matches!(
            OffRoadChecker.check(&off, "ego"),
            Err(WorldViolation::OffRoad { .. })
        ));
    }

    #[test]
    fn test_missing_ego_or_map_passes() {
        let s = scene(vec![car("a", 0.0, 50.0, 0.0)], road());
        assert!(OffRoadChecker.check(&s, "ego").is_ok());
        assert!(CollisionChecker.check(&s, "ego").is_ok());

        let no_map = scene(vec![car("ego", 0.0, 50.0, 0.0)], vec![]);
        assert!(OffRoadChecker.check(&no_map, "ego").is_ok());
    }

    #[test]
    fn test_point_in_polygon_with_closing_point() {
        let square = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.0, 0.0]];
        assert!(point_in_polygon([0.5, 0.5], &square));
        assert!(!point_in_polygon([1.5, 0.5], &square));
    }
}
