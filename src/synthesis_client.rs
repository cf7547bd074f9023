// src/synthesis_client.rs
//
// Request/response wrapper around the scene-synthesis service.
//
// The service answers `POST /dreamer-api/` with JSON carrying a base64 image
// that stacks the six camera views vertically (equal-height tiles), the ego
// pose it rendered from, the command it assumed and an echo of the kinematic
// hints. Every successful call also leaves a debug mosaic on disk:
//
//   [ tile0 | tile1 | tile2 ]
//   [ tile5 | tile4 | tile3 ]

use crate::error::SynthesisError;
use crate::types::Command;
use base64::Engine;
use image::{imageops, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CAMERA_TILES: u32 = 6;

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

/// Another vehicle as seen from the ego frame.
#[derive(Debug, Clone, Serialize)]
pub struct AgentBox {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
    pub length: f64,
    pub width: f64,
    pub speed: f64,
}

/// Everything crosses the boundary as plain nested numbers.
#[derive(Debug, Clone, Serialize)]
pub struct SynthesisRequest {
    pub timestamp: f64,
    pub location: String,
    pub prompt: String,
    /// 0 = right, 1 = left, 2 = straight
    pub command: u8,
    /// Current ego pose (world, 4x4)
    pub ego_pose: [[f64; 4]; 4],
    /// Pose sent with the previous request
    pub last_ego_pose: [[f64; 4]; 4],
    pub accel: [f64; 3],
    pub rotation_rate: [f64; 3],
    pub vel: [f64; 3],
    pub agents: Vec<AgentBox>,
    /// Drivable polygons, ego frame
    pub map_polygons: Vec<Vec<[f64; 2]>>,
    /// Row-major 0/1 raster, ego-centred, forward up
    pub drivable_mask: Vec<Vec<u8>>,
}

/// The service may send the pose nested (4x4) or flattened (16).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PoseMatrix {
    Nested([[f64; 4]; 4]),
    Flat([f64; 16]),
}

impl PoseMatrix {
    pub fn to_nested(&self) -> [[f64; 4]; 4] {
        match self {
            PoseMatrix::Nested(m) => *m,
            PoseMatrix::Flat(f) => {
                let mut m = [[0.0; 4]; 4];
                for (i, v) in f.iter().enumerate() {
                    m[i / 4][i % 4] = *v;
                }
                m
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisPayload {
    #[serde(default)]
    pub img_byte_array: Option<String>,
    pub ego_pose: PoseMatrix,
    pub command: u8,
    #[serde(default)]
    pub accel: Vec<f64>,
    #[serde(default)]
    pub rotation_rate: Vec<f64>,
    #[serde(default)]
    pub vel: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct SynthesisResult {
    /// Six camera views in service order; the first three face forward
    /// (front-left, front, front-right)
    pub tiles: Vec<RgbImage>,
    pub ego_pose: [[f64; 4]; 4],
    pub command: Command,
    pub accel: Vec<f64>,
    pub rotation_rate: Vec<f64>,
    pub vel: Vec<f64>,
}

// ============================================================================
// ENDPOINT
// ============================================================================

#[allow(async_fn_in_trait)]
pub trait SynthesisEndpoint {
    async fn request(&self, request: &SynthesisRequest) -> Result<SynthesisPayload, SynthesisError>;

    /// Startup liveness probe / state reset.
    async fn probe(&self) -> Result<(), SynthesisError>;
}

pub struct HttpSynthesisEndpoint {
    http_client: reqwest::Client,
    server_url: String,
}

impl HttpSynthesisEndpoint {
    pub fn new(server_url: &str, timeout_secs: u64) -> Result<Self, SynthesisError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            http_client,
            server_url: server_url.trim_end_matches('/').to_string(),
        })
    }
}

impl SynthesisEndpoint for HttpSynthesisEndpoint {
    async fn request(&self, request: &SynthesisRequest) -> Result<SynthesisPayload, SynthesisError> {
        let url = format!("{}/dreamer-api/", self.server_url);
        info!("Sending scene to synthesis service ({} agents)", request.agents.len());

        let response = self.http_client.post(&url).json(request).send().await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        check_reply(response.status(), content_type)?;

        response
            .json::<SynthesisPayload>()
            .await
            .map_err(|e| SynthesisError::Decode(e.to_string()))
    }

    async fn probe(&self) -> Result<(), SynthesisError> {
        let url = format!("{}/dreamer-clean/", self.server_url);
        self.http_client.get(&url).send().await?.error_for_status()?;
        Ok(())
    }
}

/// A usable reply is an HTTP success carrying JSON.
pub fn check_reply(status: reqwest::StatusCode, content_type: &str) -> Result<(), SynthesisError> {
    if !status.is_success() {
        return Err(SynthesisError::Status(status.as_u16()));
    }
    if !content_type.contains("application/json") {
        return Err(SynthesisError::UnexpectedContentType(content_type.to_string()));
    }
    Ok(())
}

// ============================================================================
// CLIENT
// ============================================================================

pub struct ImageSynthesisClient<E> {
    endpoint: E,
    artifact_dir: PathBuf,
}

impl<E: SynthesisEndpoint> ImageSynthesisClient<E> {
    pub fn new(endpoint: E, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            endpoint,
            artifact_dir: artifact_dir.into(),
        }
    }

    pub async fn probe(&self) -> Result<(), SynthesisError> {
        self.endpoint.probe().await
    }

    /// Request imagery for one planning frame. An `Err` means there is no
    /// usable imagery and the frame cannot proceed.
    pub async fn synthesize(
        &self,
        request: &SynthesisRequest,
        frame_idx: i64,
    ) -> Result<SynthesisResult, SynthesisError> {
        let payload = self.endpoint.request(request).await.map_err(|e| {
            warn!("Synthesis request failed: {}", e);
            e
        })?;

        let encoded = payload
            .img_byte_array
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(SynthesisError::MissingImage)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| SynthesisError::Decode(e.to_string()))?;
        let stacked = image::load_from_memory(&bytes)?.to_rgb8();
        let tiles = split_tiles(&stacked, CAMERA_TILES)?;

        let mosaic_path = self.artifact_dir.join(mosaic_file_name(frame_idx));
        if let Err(e) = save_mosaic(&tiles, &mosaic_path) {
            warn!("Could not write {}: {}", mosaic_path.display(), e);
        } else {
            debug!("Mosaic written to {}", mosaic_path.display());
        }

        Ok(SynthesisResult {
            tiles,
            ego_pose: payload.ego_pose.to_nested(),
            command: Command::from_code(payload.command),
            accel: payload.accel,
            rotation_rate: payload.rotation_rate,
            vel: payload.vel,
        })
    }
}

pub fn mosaic_file_name(frame_idx: i64) -> String {
    format!("diffusion_{:03}.jpg", frame_idx)
}

/// Split a vertical stack into `count` equal-height tiles.
pub fn split_tiles(stacked: &RgbImage, count: u32) -> Result<Vec<RgbImage>, SynthesisError> {
    let (width, height) = stacked.dimensions();
    if count == 0 || height == 0 || height % count != 0 {
        return Err(SynthesisError::TileGeometry {
            height,
            tiles: count,
        });
    }
    let tile_h = height / count;
    Ok((0..count)
        .map(|i| imageops::crop_imm(stacked, 0, i * tile_h, width, tile_h).to_image())
        .collect())
}

/// First three tiles left-to-right on top, the rest reversed underneath.
pub fn compose_mosaic(tiles: &[RgbImage]) -> RgbImage {
    let Some(first) = tiles.first() else {
        return RgbImage::new(0, 0);
    };
    let (tw, th) = first.dimensions();
    let top = tiles.len().min(3);
    let rows = if tiles.len() > 3 { 2 } else { 1 };
    let mut mosaic = RgbImage::new(tw * top as u32, th * rows);

    for (col, tile) in tiles.iter().take(3).enumerate() {
        imageops::replace(&mut mosaic, tile, (col as u32 * tw) as i64, 0);
    }
    for (col, tile) in tiles.iter().skip(3).rev().enumerate() {
        imageops::replace(&mut mosaic, tile, (col as u32 * tw) as i64, th as i64);
    }
    mosaic
}

fn save_mosaic(tiles: &[RgbImage], path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    compose_mosaic(tiles).save(path)?;
    Ok(())
}

/// Encode raw RGB tiles as JPEG for the policy request.
pub fn encode_jpeg(img: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = std::io::Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, 90);
    img.write_with_encoder(encoder)?;
    Ok(buf.into_inner())
}
