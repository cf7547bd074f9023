// src/conventions.rs
//
// Axis conventions of the two external services, isolated here so the rest
// of the crate only ever sees the canonical ego frame (x forward, y left).
//
// Synthesis service: orientation is read from its 4x4 ego pose and the
// policy service expects the quaternion with components 0 and 2 exchanged.
//
// Policy service: a waypoint arrives as a (row, col) pair. Once the parser
// has reversed it the pair reads (lateral, forward) with lateral positive to
// the right. Negating the lateral component and reordering gives the
// canonical ego point.

/// Decimal places the policy service receives orientation with.
const ORIENTATION_DECIMALS: i32 = 2;

/// Quaternion `[x, y, z, w]` from the synthesis pose → policy orientation.
pub fn synthesis_to_policy_orientation(quat: [f64; 4]) -> [f64; 4] {
    let scale = 10f64.powi(ORIENTATION_DECIMALS);
    let swapped = [quat[2], quat[1], quat[0], quat[3]];
    swapped.map(|c| (c * scale).round() / scale)
}

/// Parsed policy waypoint `(lateral_right, forward)` → ego `(x, y)`.
pub fn policy_point_to_ego(point: [f64; 2]) -> [f64; 2] {
    let lateral_left = -point[0];
    [point[1], lateral_left]
}

/// Inverse of [`policy_point_to_ego`], used for history sent to the policy
/// service.
pub fn ego_point_to_policy(point: [f64; 2]) -> [f64; 2] {
    [-point[1], point[0]]
}
