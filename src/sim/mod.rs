// src/sim/mod.rs
//
// Simulator boundary. The frame pipeline only ever talks to the traffic
// simulation through `Simulator` and `ConsistencyChecker`, so the built-in
// scenario runner can be swapped for an external engine.

pub mod checkers;
pub mod drivable;
pub mod scenario;

pub use checkers::{CollisionChecker, OffRoadChecker};
pub use drivable::{rasterize_drivable, DrivableMask};

use crate::error::WorldViolation;
use crate::types::{Trajectory, VehicleState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Drivable surface as closed world-frame polygons (closing point optional).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoadGraph {
    pub polygons: Vec<Vec<[f64; 2]>>,
}

/// One tick's view of the world.
#[derive(Debug, Clone, Default)]
pub struct SceneSnapshot {
    pub time_step: u64,
    pub road: RoadGraph,
    pub vehicles: BTreeMap<String, VehicleState>,
}

impl SceneSnapshot {
    pub fn vehicle(&self, id: &str) -> Option<&VehicleState> {
        self.vehicles.get(id)
    }
}

/// What the renderer and the drivable-mask rasteriser consume.
#[derive(Debug, Clone, Default)]
pub struct RenderData {
    pub road: RoadGraph,
    pub vehicles: Vec<VehicleState>,
}

pub trait Simulator {
    /// Move the world forward by one tick.
    fn advance(&mut self);

    fn time_step(&self) -> u64;

    /// Seconds per tick.
    fn step_length(&self) -> f64;

    fn export_scene(&self) -> SceneSnapshot;

    /// Reference trajectories from the simulator's own planner, keyed by
    /// vehicle id. `time` is absolute sim time in seconds.
    fn plan(&self, time: f64, scene: &SceneSnapshot) -> HashMap<String, Trajectory>;

    /// Vehicles named here follow the given trajectory from now on; everyone
    /// else keeps their current behaviour.
    fn set_trajectories(&mut self, trajectories: HashMap<String, Trajectory>);

    fn render_data(&self) -> RenderData;

    fn is_finished(&self) -> bool;

    /// Release the simulation. Safe to call more than once.
    fn destroy(&mut self);
}

pub trait ConsistencyChecker {
    fn name(&self) -> &'static str;

    fn check(&self, scene: &SceneSnapshot, ego_id: &str) -> Result<(), WorldViolation>;
}
