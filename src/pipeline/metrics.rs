// src/pipeline/metrics.rs
//
// Run counters and last-call latencies. Logged as a summary at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pub ticks: Arc<AtomicU64>,
    pub planning_frames: Arc<AtomicU64>,
    pub skipped_frames: Arc<AtomicU64>,
    pub synthesis_calls: Arc<AtomicU64>,
    pub policy_retries: Arc<AtomicU64>,
    pub degraded_replies: Arc<AtomicU64>,
    pub agent_handbacks: Arc<AtomicU64>,
    pub synthesis_time_ms: Arc<AtomicU64>,
    pub policy_time_ms: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            ticks: Arc::new(AtomicU64::new(0)),
            planning_frames: Arc::new(AtomicU64::new(0)),
            skipped_frames: Arc::new(AtomicU64::new(0)),
            synthesis_calls: Arc::new(AtomicU64::new(0)),
            policy_retries: Arc::new(AtomicU64::new(0)),
            degraded_replies: Arc::new(AtomicU64::new(0)),
            agent_handbacks: Arc::new(AtomicU64::new(0)),
            synthesis_time_ms: Arc::new(AtomicU64::new(0)),
            policy_time_ms: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_timing(&self, counter: &AtomicU64, duration_ms: u64) {
        counter.store(duration_ms, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            ticks: self.ticks.load(Ordering::Relaxed),
            planning_frames: self.planning_frames.load(Ordering::Relaxed),
            skipped_frames: self.skipped_frames.load(Ordering::Relaxed),
            synthesis_calls: self.synthesis_calls.load(Ordering::Relaxed),
            policy_retries: self.policy_retries.load(Ordering::Relaxed),
            degraded_replies: self.degraded_replies.load(Ordering::Relaxed),
            agent_handbacks: self.agent_handbacks.load(Ordering::Relaxed),
            last_synthesis_ms: self.synthesis_time_ms.load(Ordering::Relaxed),
            last_policy_ms: self.policy_time_ms.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub ticks: u64,
    pub planning_frames: u64,
    pub skipped_frames: u64,
    pub synthesis_calls: u64,
    pub policy_retries: u64,
    pub degraded_replies: u64,
    pub agent_handbacks: u64,
    pub last_synthesis_ms: u64,
    pub last_policy_ms: u64,
    pub elapsed_secs: f64,
}
