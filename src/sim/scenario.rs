// src/sim/scenario.rs
//
// Built-in traffic simulation driven by a YAML scenario file.
//
// Vehicles move on a constant-turn-rate model until they are handed a
// trajectory, after which they track it by sim time (and keep their last
// speed and heading once it runs out).

use super::{RenderData, RoadGraph, SceneSnapshot, Simulator};
use crate::geometry::normalize_angle;
use crate::types::{State, Trajectory, VehicleState};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::{debug, info};

/// States in one reference plan (5 s at 0.1 s steps).
pub const PLAN_STATES: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    #[serde(default)]
    pub road: RoadGraph,
    pub vehicles: Vec<ScenarioVehicle>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioVehicle {
    pub id: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub yaw: f64,
    #[serde(default)]
    pub speed: f64,
    /// rad/s
    #[serde(default)]
    pub yaw_rate: f64,
    #[serde(default = "default_length")]
    pub length: f64,
    #[serde(default = "default_width")]
    pub width: f64,
    /// Leaves the world after this tick
    #[serde(default)]
    pub exit_step: Option<u64>,
}

fn default_max_steps() -> u64 {
    600
}

fn default_length() -> f64 {
    4.5
}

fn default_width() -> f64 {
    1.8
}

impl Scenario {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse scenario file: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let scenario: Scenario = serde_yaml::from_str(content)?;
        Ok(scenario)
    }
}

struct Agent {
    state: VehicleState,
    yaw_rate: f64,
    exit_step: Option<u64>,
    follow: Option<Trajectory>,
}

pub struct ScenarioSimulator {
    name: String,
    road: RoadGraph,
    agents: BTreeMap<String, Agent>,
    step: u64,
    step_length: f64,
    max_steps: u64,
    destroyed: bool,
}

impl ScenarioSimulator {
    pub fn new(scenario: Scenario, step_length: f64) -> Self {
        info!(
            "Scenario '{}' loaded ({} vehicles, {} road polygons)",
            scenario.name,
            scenario.vehicles.len(),
            scenario.road.polygons.len()
        );

        let agents = scenario
            .vehicles
            .into_iter()
            .map(|v| {
                let agent = Agent {
                    state: VehicleState {
                        id: v.id.clone(),
                        x: v.x,
                        y: v.y,
                        yaw: normalize_angle(v.yaw),
                        speed: v.speed,
                        length: v.length,
                        width: v.width,
                    },
                    yaw_rate: v.yaw_rate,
                    exit_step: v.exit_step,
                    follow: None,
                };
                (v.id, agent)
            })
            .collect();

        Self {
            name: scenario.name,
            road: scenario.road,
            agents,
            step: 0,
            step_length,
            max_steps: scenario.max_steps,
            destroyed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn sim_time(&self) -> f64 {
        self.step as f64 * self.step_length
    }
}

impl Simulator for ScenarioSimulator {
    fn advance(&mut self) {
        if self.destroyed {
            return;
        }
        self.step += 1;
        let t = self.sim_time();
        let dt = self.step_length;

        for agent in self.agents.values_mut() {
            match &agent.follow {
                Some(traj) => agent.state = sample_trajectory(&agent.state, traj, t),
                None => {
                    let s = &mut agent.state;
                    s.yaw = normalize_angle(s.yaw + agent.yaw_rate * dt);
                    s.x += s.speed * s.yaw.cos() * dt;
                    s.y += s.speed * s.yaw.sin() * dt;
                }
            }
        }

        let step = self.step;
        self.agents.retain(|id, agent| match agent.exit_step {
            Some(exit) if step > exit => {
                debug!("Vehicle {} left the scenario at tick {}", id, step);
                false
            }
            _ => true,
        });
    }

    fn time_step(&self) -> u64 {
        self.step
    }

    fn step_length(&self) -> f64 {
        self.step_length
    }

    fn export_scene(&self) -> SceneSnapshot {
        SceneSnapshot {
            time_step: self.step,
            road: self.road.clone(),
            vehicles: self
                .agents
                .iter()
                .map(|(id, a)| (id.clone(), a.state.clone()))
                .collect(),
        }
    }

    fn plan(&self, time: f64, scene: &SceneSnapshot) -> HashMap<String, Trajectory> {
        scene
            .vehicles
            .iter()
            .map(|(id, v)| {
                let yaw_rate = self.agents.get(id).map(|a| a.yaw_rate).unwrap_or(0.0);
                (id.clone(), constant_turn_plan(v, yaw_rate, time, self.step_length))
            })
            .collect()
    }

    fn set_trajectories(&mut self, trajectories: HashMap<String, Trajectory>) {
        for (id, traj) in trajectories {
            if traj.is_empty() {
                continue;
            }
            if let Some(agent) = self.agents.get_mut(&id) {
                debug!("Vehicle {} now follows a {}-state trajectory", id, traj.len());
                agent.follow = Some(traj);
            }
        }
    }

    fn render_data(&self) -> RenderData {
        RenderData {
            road: self.road.clone(),
            vehicles: self.agents.values().map(|a| a.state.clone()).collect(),
        }
    }

    fn is_finished(&self) -> bool {
        self.destroyed || self.step >= self.max_steps
    }

    fn destroy(&mut self) {
        if !self.destroyed {
            info!("Scenario '{}' released at tick {}", self.name, self.step);
            self.agents.clear();
            self.destroyed = true;
        }
    }
}

/// Roll the constant-turn-rate model forward from `v`.
pub fn constant_turn_plan(v: &VehicleState, yaw_rate: f64, t0: f64, dt: f64) -> Trajectory {
    let mut states = Vec::with_capacity(PLAN_STATES);
    let (mut x, mut y, mut yaw) = (v.x, v.y, v.yaw);
    for k in 0..PLAN_STATES {
        states.push(State {
            t: t0 + k as f64 * dt,
            x,
            y,
            yaw,
            vel: v.speed,
            acc: 0.0,
        });
        yaw = normalize_angle(yaw + yaw_rate * dt);
        x += v.speed * yaw.cos() * dt;
        y += v.speed * yaw.sin() * dt;
    }
    Trajectory::new(states)
}

/// Vehicle state at sim time `t` on `traj`. Linear between samples; past the
/// last sample the vehicle carries on at the last speed and heading.
pub fn sample_trajectory(current: &VehicleState, traj: &Trajectory, t: f64) -> VehicleState {
    let mut next = current.clone();
    let (Some(first), Some(last)) = (traj.states.first(), traj.states.last()) else {
        return next;
    };

    let s = if t <= first.t {
        *first
    } else if t >= last.t {
        let dt = t - last.t;
        State {
            t,
            x: last.x + last.vel * last.yaw.cos() * dt,
            y: last.y + last.vel * last.yaw.sin() * dt,
            ..*last
        }
    } else {
        let i = traj.states.partition_point(|s| s.t <= t);
        let (a, b) = (traj.states[i - 1], traj.states[i]);
        let span = b.t - a.t;
        let frac = if span > 0.0 { (t - a.t) / span } else { 1.0 };
        State {
            t,
            x: a.x + (b.x - a.x) * frac,
            y: a.y + (b.y - a.y) * frac,
            yaw: b.yaw,
            vel: a.vel + (b.vel - a.vel) * frac,
            acc: b.acc,
        }
    };

    next.x = s.x;
    next.y = s.y;
    next.yaw = normalize_angle(s.yaw);
    next.speed = s.vel;
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
name: two_cars
max_steps: 30
road:
  polygons:
    - [[-50.0, -6.0], [300.0, -6.0], [300.0, 6.0], [-50.0, 6.0]]
vehicles:
  - id: egoCar
    x: 0.0
    y: -1.75
    speed: 10.0
  - id: lead
    x: 30.0
    y: -1.75
    speed: 8.0
    exit_step: 3
"#;

    fn sim() -> ScenarioSimulator {
        ScenarioSimulator::new(Scenario::from_yaml(SCENARIO).unwrap(), 0.1)
    }

    #[test]
    fn test_scenario_defaults() {
        let s = Scenario::from_yaml(SCENARIO).unwrap();
        assert_eq!(s.vehicles[0].length, 4.5);
        assert_eq!(s.vehicles[0].yaw_rate, 0.0);
        assert_eq!(s.vehicles[1].exit_step, Some(3));
    }

    #[test]
    fn test_advance_moves_vehicles_forward() {
        let mut sim = sim();
        sim.advance();
        let scene = sim.export_scene();
        assert_eq!(scene.time_step, 1);
        let ego = scene.vehicle("egoCar").unwrap();
        assert!((ego.x - 1.0).abs() < 1e-9);
        assert!((ego.y + 1.75).abs() < 1e-9);
    }

    #[test]
    fn test_vehicle_leaves_after_exit_step() {
        let mut sim = sim();
        for _ in 0..3 {
            sim.advance();
        }
        assert!(sim.export_scene().vehicle("lead").is_some());
        sim.advance();
        assert!(sim.export_scene().vehicle("lead").is_none());
    }

    #[test]
    fn test_plan_covers_five_seconds() {
        let sim = sim();
        let scene = sim.export_scene();
        let plans = sim.plan(0.0, &scene);
        let ego = &plans["egoCar"];
        assert_eq!(ego.len(), PLAN_STATES);
        assert!((ego.states[0].x - 0.0).abs() < 1e-9);
        assert!((ego.states[10].x - 10.0).abs() < 1e-9);
        assert!((ego.states[49].t - 4.9).abs() < 1e-9);
    }

    #[test]
    fn test_turning_plan_changes_heading() {
        let v = VehicleState {
            id: "v".to_string(),
            x: 0.0,
            y: 0.0,
            yaw: 0.0,
            speed: 5.0,
            length: 4.5,
            width: 1.8,
        };
        let plan = constant_turn_plan(&v, 0.2, 0.0, 0.1);
        assert!(plan.states[9].yaw > 0.17);
        assert!(plan.states.last().unwrap().y > 0.0);
    }

    #[test]
    fn test_handed_back_trajectory_is_followed() {
        let mut sim = sim();
        let traj = Trajectory::new(vec![
            State { t: 0.0, x: 0.0, y: -1.75, yaw: 0.0, vel: 4.0, acc: 0.0 },
            State { t: 1.0, x: 4.0, y: 0.25, yaw: 0.5, vel: 4.0, acc: 0.0 },
        ]);
        sim.set_trajectories(HashMap::from([("egoCar".to_string(), traj)]));
        for _ in 0..5 {
            sim.advance();
        }
        let ego = sim.export_scene().vehicles["egoCar"].clone();
        assert!((ego.x - 2.0).abs() < 1e-9);
        assert!((ego.y + 0.75).abs() < 1e-9);
        assert_eq!(ego.speed, 4.0);

        // past the end: constant velocity along the last heading
        for _ in 0..10 {
            sim.advance();
        }
        let ego = sim.export_scene().vehicles["egoCar"].clone();
        assert!((ego.x - (4.0 + 4.0 * 0.5f64.cos() * 0.5)).abs() < 1e-9);
    }

    #[test]
    fn test_empty_trajectory_set_keeps_reference_motion() {
        let mut sim = sim();
        sim.set_trajectories(HashMap::new());
        sim.advance();
        assert!((sim.export_scene().vehicles["egoCar"].x - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_finish_and_destroy() {
        let mut finished = sim();
        for _ in 0..30 {
            finished.advance();
        }
        assert!(finished.is_finished());

        let mut destroyed = sim();
        destroyed.destroy();
        destroyed.destroy();
        assert!(destroyed.is_finished());
        assert!(destroyed.export_scene().vehicles.is_empty());
    }
}
