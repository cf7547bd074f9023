// src/geometry.rs
//
// Coordinate-frame helpers shared by the pipeline, the simulator boundary
// and the renderer. Pure functions, no state.
//
// Ego frame: origin at the vehicle's position, x forward, y to the left,
// yaw counter-clockwise.

use crate::types::{Pose2, State, Trajectory, VehicleState};
use std::f64::consts::PI;

/// Map any angle into (-pi, pi].
pub fn normalize_angle(angle: f64) -> f64 {
    let wrapped = (angle + PI).rem_euclid(2.0 * PI) - PI;
    if wrapped <= -PI {
        wrapped + 2.0 * PI
    } else {
        wrapped
    }
}

/// Express `target` relative to `origin` (rotate by -origin.yaw after
/// translating by -origin.position).
pub fn transform_to_ego_frame(origin: &Pose2, target: &Pose2) -> Pose2 {
    let dx = target.x - origin.x;
    let dy = target.y - origin.y;
    let (sin, cos) = origin.yaw.sin_cos();
    Pose2 {
        x: dx * cos + dy * sin,
        y: -dx * sin + dy * cos,
        yaw: normalize_angle(target.yaw - origin.yaw),
    }
}

/// Inverse of [`transform_to_ego_frame`].
pub fn transform_from_ego_frame(origin: &Pose2, local: &Pose2) -> Pose2 {
    let (sin, cos) = origin.yaw.sin_cos();
    Pose2 {
        x: origin.x + local.x * cos - local.y * sin,
        y: origin.y + local.x * sin + local.y * cos,
        yaw: normalize_angle(origin.yaw + local.yaw),
    }
}

pub fn ego_point_to_world(origin: &Pose2, point: [f64; 2]) -> [f64; 2] {
    let p = transform_from_ego_frame(origin, &Pose2::new(point[0], point[1], 0.0));
    [p.x, p.y]
}

pub fn world_point_to_ego(origin: &Pose2, point: [f64; 2]) -> [f64; 2] {
    let p = transform_to_ego_frame(origin, &Pose2::new(point[0], point[1], origin.yaw));
    [p.x, p.y]
}

/// Project a world-frame position history into the vehicle's current ego
/// frame. Order is preserved (oldest first).
pub fn world_to_ego<'a, I>(history: I, vehicle: &VehicleState) -> Vec<[f64; 2]>
where
    I: IntoIterator<Item = &'a [f64; 2]>,
{
    let origin = vehicle.pose();
    history
        .into_iter()
        .map(|p| world_point_to_ego(&origin, *p))
        .collect()
}

/// Turn ego-frame offsets sampled every `point_spacing` seconds into a
/// simulator trajectory sampled every `step` seconds, starting at `t0`.
///
/// The vehicle's current pose anchors the frame and its speed seeds the first
/// sample. Heading follows each segment; a segment shorter than 1 mm keeps the
/// previous heading so a stationary plan does not spin the vehicle.
pub fn interpolate_traj(
    vehicle: &VehicleState,
    offsets: &[[f64; 2]],
    t0: f64,
    point_spacing: f64,
    step: f64,
) -> Trajectory {
    let origin = vehicle.pose();
    let mut states = vec![State {
        t: t0,
        x: vehicle.x,
        y: vehicle.y,
        yaw: vehicle.yaw,
        vel: vehicle.speed,
        acc: 0.0,
    }];

    let world: Vec<[f64; 2]> = offsets
        .iter()
        .map(|p| ego_point_to_world(&origin, *p))
        .collect();
    if world.len() < 2 || point_spacing <= 0.0 || step <= 0.0 {
        return Trajectory::new(states);
    }

    let substeps = ((point_spacing / step).round() as usize).max(1);
    let mut yaw = vehicle.yaw;
    let mut prev_vel = vehicle.speed;

    for (i, seg) in world.windows(2).enumerate() {
        let (a, b) = (seg[0], seg[1]);
        let dx = b[0] - a[0];
        let dy = b[1] - a[1];
        let len = dx.hypot(dy);
        if len > 1e-3 {
            yaw = dy.atan2(dx);
        }
        let vel = len / point_spacing;
        let acc = (vel - prev_vel) / point_spacing;
        prev_vel = vel;

        for k in 1..=substeps {
            let frac = k as f64 / substeps as f64;
            states.push(State {
                t: t0 + (i as f64 + frac) * point_spacing,
                x: a[0] + dx * frac,
                y: a[1] + dy * frac,
                yaw,
                vel,
                acc,
            });
        }
    }

    Trajectory::new(states)
}

/// Homogeneous 4x4 transform of a planar pose (z = 0).
pub fn pose_to_matrix(pose: &Pose2) -> [[f64; 4]; 4] {
    let (sin, cos) = pose.yaw.sin_cos();
    [
        [cos, -sin, 0.0, pose.x],
        [sin, cos, 0.0, pose.y],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]
}

/// Rotation part of a 4x4 transform as a unit quaternion `[x, y, z, w]`.
pub fn matrix_to_quaternion(m: &[[f64; 4]; 4]) -> [f64; 4] {
    let trace = m[0][0] + m[1][1] + m[2][2];
    let q = if trace > 0.0 {
        let s = (trace + 1.0).sqrt() * 2.0;
        [
            (m[2][1] - m[1][2]) / s,
            (m[0][2] - m[2][0]) / s,
            (m[1][0] - m[0][1]) / s,
            0.25 * s,
        ]
    } else if m[0][0] > m[1][1] && m[0][0] > m[2][2] {
        let s = (1.0 + m[0][0] - m[1][1] - m[2][2]).sqrt() * 2.0;
        [
            0.25 * s,
            (m[0][1] + m[1][0]) / s,
            (m[0][2] + m[2][0]) / s,
            (m[2][1] - m[1][2]) / s,
        ]
    } else if m[1][1] > m[2][2] {
        let s = (1.0 + m[1][1] - m[0][0] - m[2][2]).sqrt() * 2.0;
        [
            (m[0][1] + m[1][0]) / s,
            0.25 * s,
            (m[1][2] + m[2][1]) / s,
            (m[0][2] - m[2][0]) / s,
        ]
    } else {
        let s = (1.0 + m[2][2] - m[0][0] - m[1][1]).sqrt() * 2.0;
        [
            (m[0][2] + m[2][0]) / s,
            (m[1][2] + m[2][1]) / s,
            0.25 * s,
            (m[1][0] - m[0][1]) / s,
        ]
    };

    let norm = q.iter().map(|c| c * c).sum::<f64>().sqrt();
    if norm > 0.0 {
        [q[0] / norm, q[1] / norm, q[2] / norm, q[3] / norm]
    } else {
        [0.0, 0.0, 0.0, 1.0]
    }
}
