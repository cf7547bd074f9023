// src/kinematics.rs
//
// Back-derives the kinematic hints the synthesis service expects from two
// trajectories: the planned one returned by the policy service (ego frame,
// fixed sample spacing) and the simulator's own reference trajectory.
//
// Output layout matches the synthesis service: accel is (forward, left, up)
// with gravity on z, rotation rate carries yaw only, vel carries the total
// speed on x.

use crate::geometry::normalize_angle;
use crate::types::Trajectory;
use serde::{Deserialize, Serialize};

/// Gravity-only vertical component; no vertical acceleration is modelled.
pub const GRAVITY_Z: f64 = 9.80;

/// Reference samples spanning the yaw-rate window (~1 s at 0.1 s steps).
const YAW_WINDOW_STATES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KinematicHints {
    pub accel: [f64; 3],
    pub rotation_rate: [f64; 3],
    pub vel: [f64; 3],
}

impl Default for KinematicHints {
    fn default() -> Self {
        Self {
            accel: [0.0, 0.0, GRAVITY_Z],
            rotation_rate: [0.0, 0.0, 0.0],
            vel: [0.0, 0.0, 0.0],
        }
    }
}

/// Acceleration from the second difference of the first four points.
///
/// `v1 = p2 - p0`, `v2 = p3 - p1`, `a = (v2 - v1) / spacing`. Fewer than four
/// points yields zero.
pub fn planar_acceleration(points: &[[f64; 2]], spacing: f64) -> [f64; 2] {
    if points.len() < 4 || spacing <= 0.0 {
        return [0.0, 0.0];
    }
    let v1 = [points[2][0] - points[0][0], points[2][1] - points[0][1]];
    let v2 = [points[3][0] - points[1][0], points[3][1] - points[1][1]];
    [(v2[0] - v1[0]) / spacing, (v2[1] - v1[1]) / spacing]
}

/// Yaw change over the first ~1 s of the reference, 0 when it is shorter.
pub fn reference_yaw_rate(reference: &Trajectory) -> f64 {
    if reference.len() < YAW_WINDOW_STATES {
        return 0.0;
    }
    normalize_angle(reference.states[YAW_WINDOW_STATES - 1].yaw - reference.states[0].yaw)
}

/// Full set of hints for the next synthesis request.
pub fn estimate(planned: &[[f64; 2]], reference: &Trajectory, spacing: f64) -> KinematicHints {
    let [ax, ay] = planar_acceleration(planned, spacing);
    let speed = reference.states.first().map(|s| s.vel).unwrap_or(0.0);
    KinematicHints {
        accel: [ax, ay, GRAVITY_Z],
        rotation_rate: [0.0, 0.0, reference_yaw_rate(reference)],
        vel: [speed, 0.0, 0.0],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::State;

    fn reference(yaws: &[f64], vel: f64) -> Trajectory {
        Trajectory::new(
            yaws.iter()
                .enumerate()
                .map(|(i, &yaw)| State {
                    t: i as f64 * 0.1,
                    x: i as f64,
                    y: 0.0,
                    yaw,
                    vel,
                    acc: 0.0,
                })
                .collect(),
        )
    }

    #[test]
    fn test_constant_velocity_has_no_acceleration() {
        let points = [[0.0, 0.0], [2.0, 0.5], [4.0, 1.0], [6.0, 1.5]];
        assert_eq!(planar_acceleration(&points, 0.5), [0.0, 0.0]);
    }

    #[test]
    fn test_unit_velocity_increment_gives_two() {
        // v1 = p2 - p0 = 2, v2 = p3 - p1 = 3
        let points = [[0.0, 0.0], [1.0, 0.0], [2.0, 0.0], [4.0, 0.0]];
        let a = planar_acceleration(&points, 0.5);
        assert!((a[0] - 2.0).abs() < 1e-12);
        assert_eq!(a[1], 0.0);
    }

    #[test]
    fn test_short_plan_has_no_acceleration() {
        assert_eq!(planar_acceleration(&[[0.0, 0.0], [1.0, 0.0]], 0.5), [0.0, 0.0]);
    }

    #[test]
    fn test_yaw_rate_needs_ten_states() {
        assert_eq!(reference_yaw_rate(&reference(&[0.0, 0.5, 1.0], 3.0)), 0.0);
        let yaws: Vec<f64> = (0..12).map(|i| i as f64 * 0.05).collect();
        assert!((reference_yaw_rate(&reference(&yaws, 3.0)) - 0.45).abs() < 1e-12);
    }

    #[test]
    fn test_yaw_rate_wraps_across_pi() {
        let mut yaws = vec![3.1; 10];
        yaws[9] = -3.1;
        let rate = reference_yaw_rate(&reference(&yaws, 0.0));
        assert!((rate - (2.0 * std::f64::consts::PI - 6.2)).abs() < 1e-9);
    }

    #[test]
    fn test_estimate_reports_total_speed_and_gravity() {
        let points = [[0.0, 0.0], [1.0, 0.0], [2.0, 0.0], [4.0, 0.0]];
        let hints = estimate(&points, &reference(&[0.0; 4], 7.5), 0.5);
        assert_eq!(hints.vel, [7.5, 0.0, 0.0]);
        assert_eq!(hints.accel[2], GRAVITY_Z);
        assert_eq!(hints.rotation_rate, [0.0, 0.0, 0.0]);
    }
}
