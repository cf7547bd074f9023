// src/policy_client.rs
//
// Request/poll wrapper around the driving-policy service.
//
// Sends the forward camera bundle + vehicle state to `POST /driver-api/` and
// resubmits the identical request until the service reports it is done
// (non-200 or a literal `false` body means "not yet"). The ready body carries
// a `traj` field: either a JSON list of numeric pairs (current schema) or the
// legacy `"(a,b),(c,d),..."` string. Anything unusable degrades to the zero
// trajectory so the loop keeps running.

use crate::error::PolicyError;
use crate::retry::{poll_until_ready, CancelFlag, Poll};
use crate::types::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Points returned when the policy output cannot be used.
pub const FALLBACK_POINTS: usize = 6;

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PolicyRequest {
    pub timestamp: f64,
    /// Base64 JPEG, resized to the configured target width
    pub cam_front_left: String,
    pub cam_front: String,
    pub cam_front_right: String,
    pub image_width: u32,
    pub image_height: u32,
    /// Quaternion `[x, y, z, w]` already in the policy service's convention
    pub ego_pose: [f64; 4],
    /// Human-readable command, e.g. "Turn Left"
    pub command: String,
    pub accel: [f64; 3],
    pub rotation_rate: [f64; 3],
    pub vel: [f64; 3],
    /// Ego history in the policy service's point convention, oldest first
    pub past_traj: Vec<[f64; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TrajectoryPayload {
    Points(Vec<[f64; 2]>),
    Legacy(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyResponse {
    pub traj: TrajectoryPayload,
}

/// Parsed policy output: waypoints as `(lateral, forward)` pairs in the
/// service's convention (see `conventions::policy_point_to_ego`).
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyReply {
    pub points: Vec<[f64; 2]>,
    pub retries: u32,
    /// True when the zero trajectory was substituted
    pub degraded: bool,
}

// ============================================================================
// ENDPOINT
// ============================================================================

/// One submission to the policy service.
#[allow(async_fn_in_trait)]
pub trait PolicyEndpoint {
    /// `Ready(body)` carries the raw response text.
    async fn submit(&self, request: &PolicyRequest) -> Result<Poll<String>, PolicyError>;

    /// Startup liveness probe / state reset.
    async fn probe(&self) -> Result<(), PolicyError>;
}

pub struct HttpPolicyEndpoint {
    http_client: reqwest::Client,
    server_url: String,
}

impl HttpPolicyEndpoint {
    pub fn new(server_url: &str, timeout_secs: u64) -> Result<Self, PolicyError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            http_client,
            server_url: server_url.trim_end_matches('/').to_string(),
        })
    }
}

impl PolicyEndpoint for HttpPolicyEndpoint {
    async fn submit(&self, request: &PolicyRequest) -> Result<Poll<String>, PolicyError> {
        let url = format!("{}/driver-api/", self.server_url);
        let response = self.http_client.post(&url).json(request).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !is_ready(status, &body) {
            debug!("Policy service not ready (HTTP {})", status);
            return Ok(Poll::NotReady);
        }
        Ok(Poll::Ready(body))
    }

    async fn probe(&self) -> Result<(), PolicyError> {
        let url = format!("{}/driver-clean/", self.server_url);
        self.http_client.get(&url).send().await?.error_for_status()?;
        Ok(())
    }
}

/// Only a 200 whose body is not the literal `false` counts as done.
pub fn is_ready(status: reqwest::StatusCode, body: &str) -> bool {
    status == reqwest::StatusCode::OK && body.trim() != "false"
}

// ============================================================================
// CLIENT
// ============================================================================

pub struct DrivingPolicyClient<E> {
    endpoint: E,
    retry: RetryConfig,
    cancel: CancelFlag,
}

impl<E: PolicyEndpoint> DrivingPolicyClient<E> {
    pub fn new(endpoint: E, retry: RetryConfig, cancel: CancelFlag) -> Self {
        Self {
            endpoint,
            retry,
            cancel,
        }
    }

    pub async fn probe(&self) -> Result<(), PolicyError> {
        self.endpoint.probe().await
    }

    /// Submit `request` until the service is ready, then parse its trajectory.
    pub async fn query(&self, request: &PolicyRequest) -> Result<PolicyReply, PolicyError> {
        let polled = poll_until_ready(&self.retry, &self.cancel, || {
            self.endpoint.submit(request)
        })
        .await?;

        if polled.retries > 0 {
            info!("Policy service ready after {} retries", polled.retries);
        }

        let (points, degraded) = parse_response(&polled.value);
        Ok(PolicyReply {
            points,
            retries: polled.retries,
            degraded,
        })
    }
}

/// Extract the waypoints from a ready body. The flag is true when the
/// fallback was used.
pub fn parse_response(body: &str) -> (Vec<[f64; 2]>, bool) {
    let response: PolicyResponse = match serde_json::from_str(body) {
        Ok(r) => r,
        Err(e) => {
            warn!("Policy body is not a trajectory response ({}), using zero trajectory", e);
            return (zero_trajectory(), true);
        }
    };

    match response.traj {
        TrajectoryPayload::Points(points) if !points.is_empty() => (points, false),
        TrajectoryPayload::Points(_) => {
            warn!("Policy returned an empty trajectory, using zero trajectory");
            (zero_trajectory(), true)
        }
        TrajectoryPayload::Legacy(s) => parse_trajectory(&s),
    }
}

/// Parse `"(a,b),(c,d),..."` into `[[b,a],[d,c],...]`, falling back to the
/// zero trajectory on any malformed input. The flag is true on fallback.
pub fn parse_trajectory(traj: &str) -> (Vec<[f64; 2]>, bool) {
    match parse_legacy_trajectory(traj) {
        Some(points) => (points, false),
        None => {
            warn!("Invalid trajectory from policy service: {:?}, using zero trajectory", traj);
            (zero_trajectory(), true)
        }
    }
}

fn parse_legacy_trajectory(traj: &str) -> Option<Vec<[f64; 2]>> {
    let inner = traj.trim().trim_start_matches('(').trim_end_matches(')');
    if inner.is_empty() {
        return None;
    }

    inner
        .split("),(")
        .map(|pair| {
            let mut parts = pair.split(',').map(|c| c.trim().parse::<f64>());
            match (parts.next(), parts.next(), parts.next()) {
                (Some(Ok(a)), Some(Ok(b)), None) => Some([b, a]),
                _ => None,
            }
        })
        .collect()
}

pub fn zero_trajectory() -> Vec<[f64; 2]> {
    vec![[0.0, 0.0]; FALLBACK_POINTS]
}
