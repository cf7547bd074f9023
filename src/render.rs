// src/render.rs
//
// Annotated bird's-eye view for each planning frame. Ego-centred, forward
// up, same pixel convention as the drivable mask.

use crate::geometry::world_point_to_ego;
use crate::pipeline::FrameContext;
use crate::sim::checkers::corners;
use crate::sim::drivable::ego_to_pixel;
use crate::sim::RenderData;
use crate::types::Command;
use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut, draw_polygon_mut};
use imageproc::point::Point;
use std::path::PathBuf;
use tracing::debug;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const ROAD: Rgb<u8> = Rgb([205, 205, 205]);
const EGO: Rgb<u8> = Rgb([230, 140, 30]);
const OTHER: Rgb<u8> = Rgb([70, 90, 140]);
const REFERENCE: Rgb<u8> = Rgb([20, 160, 60]);
const PLANNED: Rgb<u8> = Rgb([210, 30, 30]);
const PAST: Rgb<u8> = Rgb([30, 80, 220]);
const ARROW: Rgb<u8> = Rgb([0, 0, 0]);

pub struct BevRenderer {
    output_dir: PathBuf,
    size: u32,
    meters_per_pixel: f64,
}

impl BevRenderer {
    pub fn new(output_dir: impl Into<PathBuf>, size: u32, meters_per_pixel: f64) -> Self {
        Self {
            output_dir: output_dir.into(),
            size,
            meters_per_pixel,
        }
    }

    /// Draw and save `bev_<idx>.png`. `planned` and `past` are ego-frame
    /// points.
    pub fn render(
        &self,
        ctx: &FrameContext,
        scene: &RenderData,
        planned: &[[f64; 2]],
        past: &[[f64; 2]],
    ) -> Result<PathBuf> {
        let img = self.draw(ctx, scene, planned, past);
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(bev_file_name(ctx.frame_idx()));
        img.save(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        debug!("BEV written to {}", path.display());
        Ok(path)
    }

    pub fn draw(
        &self,
        ctx: &FrameContext,
        scene: &RenderData,
        planned: &[[f64; 2]],
        past: &[[f64; 2]],
    ) -> RgbImage {
        let mut img = RgbImage::from_pixel(self.size, self.size, BACKGROUND);
        let origin = ctx.ego.pose();

        for polygon in &scene.road.polygons {
            let local: Vec<[f64; 2]> = polygon.iter().map(|p| world_point_to_ego(&origin, *p)).collect();
            self.fill(&mut img, &local, ROAD);
        }

        for vehicle in &scene.vehicles {
            let local: Vec<[f64; 2]> = corners(vehicle)
                .iter()
                .map(|p| world_point_to_ego(&origin, *p))
                .collect();
            let color = if vehicle.id == ctx.ego.id { EGO } else { OTHER };
            self.fill(&mut img, &local, color);
        }

        let reference: Vec<[f64; 2]> = ctx
            .reference
            .states
            .iter()
            .map(|s| world_point_to_ego(&origin, [s.x, s.y]))
            .collect();
        self.polyline(&mut img, &reference, REFERENCE);
        self.polyline(&mut img, past, PAST);
        self.polyline(&mut img, planned, PLANNED);

        self.command_arrow(&mut img, ctx.command);
        img
    }

    fn to_pixel(&self, p: [f64; 2]) -> (f32, f32) {
        let (col, row) = ego_to_pixel(p, self.size, self.meters_per_pixel);
        (col as f32, row as f32)
    }

    fn fill(&self, img: &mut RgbImage, local: &[[f64; 2]], color: Rgb<u8>) {
        let mut pts: Vec<Point<i32>> = local
            .iter()
            .map(|p| {
                let (x, y) = self.to_pixel(*p);
                Point::new(x.round() as i32, y.round() as i32)
            })
            .collect();
        pts.dedup();
        while pts.len() > 1 && pts.first() == pts.last() {
            pts.pop();
        }
        if pts.len() >= 3 {
            draw_polygon_mut(img, &pts, color);
        }
    }

    fn polyline(&self, img: &mut RgbImage, points: &[[f64; 2]], color: Rgb<u8>) {
        for seg in points.windows(2) {
            draw_line_segment_mut(img, self.to_pixel(seg[0]), self.to_pixel(seg[1]), color);
        }
        for p in points {
            let (x, y) = self.to_pixel(*p);
            draw_filled_circle_mut(img, (x.round() as i32, y.round() as i32), 2, color);
        }
    }

    /// Arrow in the bottom-left corner pointing the commanded way.
    fn command_arrow(&self, img: &mut RgbImage, command: Command) {
        let s = self.size as f32;
        let base = (s * 0.12, s * 0.92);
        let len = s * 0.08;
        let tip = match command {
            Command::Straight => (base.0, base.1 - len),
            Command::Left => (base.0 - len * 0.7, base.1 - len * 0.7),
            Command::Right => (base.0 + len * 0.7, base.1 - len * 0.7),
        };
        draw_line_segment_mut(img, base, tip, ARROW);
        draw_filled_circle_mut(img, (tip.0.round() as i32, tip.1.round() as i32), 3, ARROW);
    }
}

pub fn bev_file_name(frame_idx: i64) -> String {
    format!("bev_{:03}.png", frame_idx)
}
