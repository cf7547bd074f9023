// src/scorer.rs
//
// Per-run driving score. Every tick is recorded (drivable ratio, whether the
// ego sits on drivable ground); planning frames also carry how far the
// executed plan strays from the simulator's reference.

use crate::sim::DrivableMask;
use crate::types::Trajectory;
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

pub const RESULTS_FILE: &str = "drive_arena.json";

pub trait FrameRecorder {
    fn record_frame(
        &mut self,
        mask: &DrivableMask,
        is_planning_frame: bool,
        planned: Option<&Trajectory>,
        reference: Option<&Trajectory>,
    );

    fn save(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameScore {
    pub frame: u64,
    pub drivable_ratio: f64,
    pub ego_on_drivable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_deviation: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_deviation: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoreReport {
    pub run_id: String,
    pub map_name: String,
    pub created_at: String,
    pub total_frames: u64,
    pub planning_frames: u64,
    pub mean_drivable_ratio: f64,
    pub off_drivable_frames: u64,
    pub mean_deviation: Option<f64>,
    pub max_deviation: Option<f64>,
    pub planning: Vec<FrameScore>,
}

pub struct DriveScorer {
    run_id: uuid::Uuid,
    map_name: String,
    output_path: PathBuf,
    total_frames: u64,
    drivable_ratio_sum: f64,
    off_drivable_frames: u64,
    planning: Vec<FrameScore>,
}

impl DriveScorer {
    pub fn new(map_name: &str, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4(),
            map_name: map_name.to_string(),
            output_path: output_dir.into().join(RESULTS_FILE),
            total_frames: 0,
            drivable_ratio_sum: 0.0,
            off_drivable_frames: 0,
            planning: Vec::new(),
        }
    }

    pub fn report(&self) -> ScoreReport {
        let deviations: Vec<f64> = self.planning.iter().filter_map(|f| f.mean_deviation).collect();
        let mean_deviation = if deviations.is_empty() {
            None
        } else {
            Some(deviations.iter().sum::<f64>() / deviations.len() as f64)
        };
        let max_deviation = self
            .planning
            .iter()
            .filter_map(|f| f.max_deviation)
            .reduce(f64::max);

        ScoreReport {
            run_id: self.run_id.to_string(),
            map_name: self.map_name.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
            total_frames: self.total_frames,
            planning_frames: self.planning.len() as u64,
            mean_drivable_ratio: if self.total_frames > 0 {
                self.drivable_ratio_sum / self.total_frames as f64
            } else {
                0.0
            },
            off_drivable_frames: self.off_drivable_frames,
            mean_deviation,
            max_deviation,
            planning: self.planning.clone(),
        }
    }
}

impl FrameRecorder for DriveScorer {
    fn record_frame(
        &mut self,
        mask: &DrivableMask,
        is_planning_frame: bool,
        planned: Option<&Trajectory>,
        reference: Option<&Trajectory>,
    ) {
        let ratio = mask.drivable_ratio();
        self.total_frames += 1;
        self.drivable_ratio_sum += ratio;
        let ego_on_drivable = mask.contains([0.0, 0.0]);
        if !ego_on_drivable {
            self.off_drivable_frames += 1;
        }

        if !is_planning_frame {
            return;
        }

        let (mean_deviation, max_deviation) = match (planned, reference) {
            (Some(p), Some(r)) => match deviation(p, r) {
                Some((mean, max)) => (Some(mean), Some(max)),
                None => (None, None),
            },
            _ => (None, None),
        };
        self.planning.push(FrameScore {
            frame: self.total_frames,
            drivable_ratio: ratio,
            ego_on_drivable,
            mean_deviation,
            max_deviation,
        });
    }

    fn save(&mut self) -> Result<()> {
        if let Some(parent) = self.output_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let report = self.report();
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&self.output_path, json)
            .with_context(|| format!("Failed to write {}", self.output_path.display()))?;
        info!(
            "💾 Scores saved to {} ({} frames, {} planning)",
            self.output_path.display(),
            report.total_frames,
            report.planning_frames
        );
        Ok(())
    }
}

/// Mean and max distance between each planned state and the reference state
/// closest to it in time. `None` when either trajectory is empty.
pub fn deviation(planned: &Trajectory, reference: &Trajectory) -> Option<(f64, f64)> {
    if planned.is_empty() || reference.is_empty() {
        return None;
    }

    let dists: Vec<f64> = planned
        .states
        .iter()
        .filter_map(|p| {
            reference
                .states
                .iter()
                .min_by(|a, b| (a.t - p.t).abs().total_cmp(&(b.t - p.t).abs()))
                .map(|r| (p.x - r.x).hypot(p.y - r.y))
        })
        .collect();

    let mean = dists.iter().sum::<f64>() / dists.len() as f64;
    let max = dists.iter().copied().fold(0.0, f64::max);
    Some((mean, max))
}
