// src/pipeline/frame_context.rs
//
// Everything one planning frame knows about the world, gathered once at the
// top of the frame so every later step reads the same values.

use crate::geometry::transform_to_ego_frame;
use crate::sim::DrivableMask;
use crate::types::{Command, CommandConfig, Trajectory, VehicleState};

#[derive(Debug, Clone)]
pub struct FrameContext {
    pub tick: u64,
    /// Session timestamp (seconds, steps of the frame interval)
    pub timestamp: f64,
    /// Absolute sim time of this tick
    pub sim_time: f64,
    pub ego: VehicleState,
    pub reference: Trajectory,
    pub command: Command,
    pub mask: DrivableMask,
}

impl FrameContext {
    pub fn new(
        tick: u64,
        timestamp: f64,
        sim_time: f64,
        ego: VehicleState,
        reference: Trajectory,
        mask: DrivableMask,
        command_cfg: &CommandConfig,
    ) -> Self {
        let command = derive_command(&reference, command_cfg);
        Self {
            tick,
            timestamp,
            sim_time,
            ego,
            reference,
            command,
            mask,
        }
    }

    /// Artifact index: the doubled timestamp.
    pub fn frame_idx(&self) -> i64 {
        (self.timestamp * 2.0).round() as i64
    }
}

/// Command from the reference horizon: the state `horizon_steps` ahead (or
/// the last one) seen from the first.
pub fn derive_command(reference: &Trajectory, cfg: &CommandConfig) -> Command {
    let Some(first) = reference.states.first() else {
        return Command::Straight;
    };
    let horizon = (reference.len() - 1).min(cfg.horizon_steps);
    let end = &reference.states[horizon];
    let local = transform_to_ego_frame(&first.pose(), &end.pose());
    Command::derive(local.x, local.y, cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::State;

    fn arc(lateral_per_step: f64, n: usize) -> Trajectory {
        Trajectory::new(
            (0..n)
                .map(|i| State {
                    t: i as f64 * 0.1,
                    x: 10.0 + i as f64,
                    y: 20.0 + lateral_per_step * i as f64,
                    yaw: 0.0,
                    vel: 10.0,
                    acc: 0.0,
                })
                .collect(),
        )
    }

    #[test]
    fn test_command_from_reference_horizon() {
        let cfg = CommandConfig::default();
        assert_eq!(derive_command(&arc(0.0, 50), &cfg), Command::Straight);
        // 25 steps of 0.2 m = 5 m to the left
        assert_eq!(derive_command(&arc(0.2, 50), &cfg), Command::Left);
        assert_eq!(derive_command(&arc(-0.2, 50), &cfg), Command::Right);
    }

    #[test]
    fn test_short_reference_uses_last_state() {
        let cfg = CommandConfig::default();
        // 4 steps of 0.2 m stays inside the lateral threshold
        assert_eq!(derive_command(&arc(0.2, 5), &cfg), Command::Straight);
        assert_eq!(derive_command(&arc(2.0, 5), &cfg), Command::Left);
        assert_eq!(derive_command(&Trajectory::default(), &cfg), Command::Straight);
    }
}
