// src/sim/drivable.rs
//
// Ego-centred drivable-area raster. The ego sits in the middle of a square
// grid; rows grow backwards (forward is up) and columns grow to the right.

use super::RoadGraph;
use crate::geometry::world_point_to_ego;
use crate::types::{ImageConfig, Pose2};
use image::{GrayImage, Luma};
use imageproc::drawing::draw_polygon_mut;
use imageproc::point::Point;

#[derive(Debug, Clone)]
pub struct DrivableMask {
    pub size: u32,
    pub meters_per_pixel: f64,
    cells: GrayImage,
}

impl DrivableMask {
    pub fn is_drivable(&self, row: u32, col: u32) -> bool {
        row < self.size && col < self.size && self.cells.get_pixel(col, row)[0] > 0
    }

    /// Whether an ego-frame point (metres) lands on a drivable cell.
    pub fn contains(&self, point: [f64; 2]) -> bool {
        let (col, row) = ego_to_pixel(point, self.size, self.meters_per_pixel);
        if col < 0.0 || row < 0.0 {
            return false;
        }
        self.is_drivable(row.floor() as u32, col.floor() as u32)
    }

    /// Row-major 0/1 grid for the synthesis request.
    pub fn to_nested(&self) -> Vec<Vec<u8>> {
        self.cells
            .rows()
            .map(|row| row.map(|px| u8::from(px[0] > 0)).collect())
            .collect()
    }

    pub fn drivable_ratio(&self) -> f64 {
        let total = (self.size as usize) * (self.size as usize);
        if total == 0 {
            return 0.0;
        }
        let drivable = self.cells.pixels().filter(|px| px[0] > 0).count();
        drivable as f64 / total as f64
    }
}

/// Ego-frame metres → (column, row) in the raster.
pub fn ego_to_pixel(point: [f64; 2], size: u32, meters_per_pixel: f64) -> (f64, f64) {
    let centre = size as f64 / 2.0;
    (centre - point[1] / meters_per_pixel, centre - point[0] / meters_per_pixel)
}

pub fn rasterize_drivable(road: &RoadGraph, ego: &Pose2, cfg: &ImageConfig) -> DrivableMask {
    let mut cells = GrayImage::new(cfg.size, cfg.size);

    for polygon in &road.polygons {
        let mut pts: Vec<Point<i32>> = polygon
            .iter()
            .map(|p| {
                let (col, row) =
                    ego_to_pixel(world_point_to_ego(ego, *p), cfg.size, cfg.meters_per_pixel);
                Point::new(col.round() as i32, row.round() as i32)
            })
            .collect();
        pts.dedup();
        // the fill routine rejects an explicit closing point
        while pts.len() > 1 && pts.first() == pts.last() {
            pts.pop();
        }
        if pts.len() < 3 {
            continue;
        }
        draw_polygon_mut(&mut cells, &pts, Luma([1u8]));
    }

    DrivableMask {
        size: cfg.size,
        meters_per_pixel: cfg.meters_per_pixel,
        cells,
    }
}
