// src/error.rs
//
// Error kinds at each seam of the closed loop. Fatal kinds abort the run
// (after the orderly shutdown in main); recoverable conditions never surface
// here: policy not-ready is retried and malformed policy output degrades to
// the zero trajectory.

use std::time::Duration;
use thiserror::Error;

/// A world-consistency checker rejected the simulator state.
#[derive(Debug, Error)]
pub enum WorldViolation {
    #[error("ego collided with vehicle {other}")]
    Collision { other: String },

    #[error("ego left the drivable area at ({x:.2}, {y:.2})")]
    OffRoad { x: f64, y: f64 },
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("synthesis request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("synthesis service returned HTTP {0}")]
    Status(u16),

    #[error("unexpected content type {0:?}")]
    UnexpectedContentType(String),

    #[error("synthesis payload could not be decoded: {0}")]
    Decode(String),

    #[error("synthesis payload carried no image")]
    MissingImage,

    #[error("synthesized image is unreadable: {0}")]
    Image(#[from] image::ImageError),

    #[error("image of height {height} cannot be split into {tiles} camera tiles")]
    TileGeometry { height: u32, tiles: u32 },
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("policy service not ready after {attempts} attempts ({waited:?})")]
    Timeout { attempts: u32, waited: Duration },

    #[error("policy wait cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("world consistency check failed at tick {tick}: {source}")]
    WorldConsistency {
        tick: u64,
        #[source]
        source: WorldViolation,
    },

    #[error("no imagery for frame at t={timestamp:.1}s: {source}")]
    Synthesis {
        timestamp: f64,
        #[source]
        source: SynthesisError,
    },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("run cancelled at tick {tick}")]
    Cancelled { tick: u64 },
}
