// src/types.rs

use serde::{Deserialize, Serialize};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub servers: ServerConfig,
    pub simulation: SimulationConfig,
    pub map: MapConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub command: CommandConfig,
    #[serde(default)]
    pub policy_retry: RetryConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL of the scene-synthesis service, e.g. `http://localhost:11000/`
    pub synthesis: String,
    /// Base URL of the driving-policy service
    pub policy: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub ego_id: String,
    #[serde(default = "default_step_length")]
    pub step_length: f64,
    pub max_sim_time: f64,
    #[serde(default)]
    pub use_agent_path: bool,
    /// Simulator ticks between two planning frames
    #[serde(default = "default_planning_stride")]
    pub planning_stride: u64,
    /// Simulated seconds covered by one planning frame
    #[serde(default = "default_frame_interval")]
    pub frame_interval: f64,
    /// The policy service gets this long before its path is handed back
    #[serde(default = "default_agent_warmup")]
    pub agent_warmup_secs: f64,
    #[serde(default = "default_scenario")]
    pub scenario: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    pub name: String,
    #[serde(default)]
    pub gen_description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Edge length of the drivable-mask raster in pixels
    pub size: u32,
    pub meters_per_pixel: f64,
    /// Width the forward camera tiles are resized to for the policy service
    pub target_width: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            size: 200,
            meters_per_pixel: 0.5,
            target_width: 800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    pub lateral_threshold: f64,
    /// Max reference states looked ahead when deriving the command
    pub horizon_steps: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            lateral_threshold: 4.0,
            horizon_steps: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
    pub timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 4000,
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    pub results_root: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_root: "./results".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_request_timeout() -> u64 {
    120
}

fn default_step_length() -> f64 {
    0.1
}

fn default_planning_stride() -> u64 {
    5
}

fn default_frame_interval() -> f64 {
    0.5
}

fn default_agent_warmup() -> f64 {
    2.5
}

fn default_scenario() -> String {
    "scenarios/straight_road.yaml".to_string()
}

// ============================================================================
// WORLD TYPES
// ============================================================================

/// Planar pose in the world frame (yaw counter-clockwise from +x).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose2 {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
}

impl Pose2 {
    pub fn new(x: f64, y: f64, yaw: f64) -> Self {
        Self { x, y, yaw }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
    /// Total speed in m/s
    pub speed: f64,
    pub length: f64,
    pub width: f64,
}

impl VehicleState {
    pub fn pose(&self) -> Pose2 {
        Pose2::new(self.x, self.y, self.yaw)
    }
}

/// One sample of a simulator trajectory, keyed by absolute sim time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub t: f64,
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
    pub vel: f64,
    pub acc: f64,
}

impl State {
    pub fn pose(&self) -> Pose2 {
        Pose2::new(self.x, self.y, self.yaw)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub states: Vec<State>,
}

impl Trajectory {
    pub fn new(states: Vec<State>) -> Self {
        Self { states }
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }
}

// ============================================================================
// DRIVING COMMAND
// ============================================================================

/// Discrete driving intent. Wire codes follow the synthesis service:
/// 0 = right, 1 = left, 2 = straight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Straight,
    Left,
    Right,
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::Right => 0,
            Command::Left => 1,
            Command::Straight => 2,
        }
    }

    /// Unknown codes fall back to straight.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Command::Right,
            1 => Command::Left,
            _ => Command::Straight,
        }
    }

    /// Prompt string the driving-policy service expects.
    pub fn as_prompt(self) -> &'static str {
        match self {
            Command::Right => "Turn Right",
            Command::Left => "Turn Left",
            Command::Straight => "Go Straight.",
        }
    }

    /// Derive the command from the reference horizon endpoint, expressed in
    /// the ego frame of the current reference state.
    ///
    /// The lateral branch is checked first: an endpoint more than
    /// `lateral_threshold` to either side is a turn regardless of how far
    /// ahead it lies. Anything else is straight, so the longitudinal offset
    /// never changes the outcome.
    pub fn derive(_local_x: f64, local_y: f64, cfg: &CommandConfig) -> Self {
        if local_y > cfg.lateral_threshold {
            Command::Left
        } else if local_y < -cfg.lateral_threshold {
            Command::Right
        } else {
            Command::Straight
        }
    }
}
