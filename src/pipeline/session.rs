// src/pipeline/session.rs
//
// State carried from one planning frame to the next. The orchestrator takes
// it by value at the start of a tick and hands back the updated copy, so
// every feedback path of the loop is visible in `advance_tick`'s signature.

use crate::geometry::{pose_to_matrix, world_to_ego};
use crate::kinematics::KinematicHints;
use crate::types::{Pose2, VehicleState};
use std::collections::VecDeque;

/// Ego positions kept for the history sent to the policy service.
pub const PAST_TRAJ_CAPACITY: usize = 7;

/// World-frame ego positions, oldest first. Appending past capacity evicts
/// the oldest sample.
#[derive(Debug, Clone)]
pub struct PastTrajectory {
    points: VecDeque<[f64; 2]>,
    capacity: usize,
}

impl PastTrajectory {
    pub fn new() -> Self {
        Self::with_capacity(PAST_TRAJ_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, point: [f64; 2]) {
        if self.capacity == 0 {
            return;
        }
        if self.points.len() >= self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f64; 2]> {
        self.points.iter()
    }

    /// History expressed in `vehicle`'s current ego frame.
    pub fn to_ego(&self, vehicle: &VehicleState) -> Vec<[f64; 2]> {
        world_to_ego(self.iter(), vehicle)
    }
}

impl Default for PastTrajectory {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct SessionState {
    /// Advances by the frame interval on every planning tick; starts one
    /// interval before zero so the first planning frame is t = 0
    pub timestamp: f64,
    /// Ego pose sent with the previous synthesis request
    pub last_pose: [[f64; 4]; 4],
    /// Kinematics derived on the previous planning frame
    pub hints: KinematicHints,
    pub past_traj: PastTrajectory,
    /// `past_traj` in the ego frame of the last planning frame
    pub ego_past_traj: Vec<[f64; 2]>,
    /// Ego-frame plan of the last planning frame, origin first
    pub last_plan: Vec<[f64; 2]>,
    pub ego_seen: bool,
}

impl SessionState {
    pub fn new(frame_interval: f64) -> Self {
        Self {
            timestamp: -frame_interval,
            last_pose: pose_to_matrix(&Pose2::new(0.0, 0.0, 0.0)),
            hints: KinematicHints::default(),
            past_traj: PastTrajectory::new(),
            ego_past_traj: Vec::new(),
            last_plan: Vec::new(),
            ego_seen: false,
        }
    }
}
