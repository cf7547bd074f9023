// src/main.rs

mod config;
mod conventions;
mod error;
mod geometry;
mod kinematics;
mod pipeline;
mod policy_client;
mod render;
mod retry;
mod scorer;
mod sim;
mod synthesis_client;
mod types;

use anyhow::{Context, Result};
use pipeline::{FramePipeline, SessionState};
use policy_client::{DrivingPolicyClient, HttpPolicyEndpoint};
use render::BevRenderer;
use retry::CancelFlag;
use scorer::DriveScorer;
use sim::scenario::{Scenario, ScenarioSimulator};
use std::path::{Path, PathBuf};
use synthesis_client::{HttpSynthesisEndpoint, ImageSynthesisClient};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use types::Config;

const CONFIG_ENV: &str = "DRIVE_LOOP_CONFIG";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = Config::load(&config_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_directive()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚗 Closed-loop driver starting");
    info!("✓ Config loaded from {}", config_path);

    let run_dir = create_run_dir(&config.output.results_root)?;
    let img_dir = run_dir.join("imgs");
    std::fs::create_dir_all(&img_dir)?;
    info!("💾 Results will be written to: {}", run_dir.display());

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl-C received, stopping");
                cancel.cancel();
            }
        });
    }

    // ── Services ─────────────────────────────────────────────────────────
    let timeout = config.servers.request_timeout_secs;
    let synthesis = ImageSynthesisClient::new(
        HttpSynthesisEndpoint::new(&config.servers.synthesis, timeout)?,
        &img_dir,
    );
    let policy = DrivingPolicyClient::new(
        HttpPolicyEndpoint::new(&config.servers.policy, timeout)?,
        config.policy_retry.clone(),
        cancel.clone(),
    );

    info!("Testing connection to synthesis & policy servers...");
    synthesis
        .probe()
        .await
        .with_context(|| format!("Synthesis service unreachable at {}", config.servers.synthesis))?;
    policy
        .probe()
        .await
        .with_context(|| format!("Policy service unreachable at {}", config.servers.policy))?;
    info!("✓ Both services reachable");

    // ── Simulation ───────────────────────────────────────────────────────
    let scenario = Scenario::load(&config.simulation.scenario)?;
    let simulator = ScenarioSimulator::new(scenario, config.simulation.step_length);
    info!(
        "✓ Simulator ready: '{}' on {} (ego {}, {:.1}s budget)",
        simulator.name(),
        config.map.name,
        config.simulation.ego_id,
        config.simulation.max_sim_time
    );

    let scorer = DriveScorer::new(&config.map.name, &run_dir);
    let renderer = BevRenderer::new(&img_dir, config.image.size, config.image.meters_per_pixel);
    let session = SessionState::new(config.simulation.frame_interval);

    let mut pipeline = FramePipeline::new(
        config, simulator, synthesis, policy, scorer, renderer, cancel,
    );

    let outcome = pipeline.run(session).await;
    pipeline.shutdown();

    match outcome {
        Ok(reason) => {
            info!("✅ Run complete ({:?})", reason);
            Ok(())
        }
        Err(e) => {
            error!("❌ Run aborted: {}", e);
            Err(e.into())
        }
    }
}

/// `<root>/<mm-dd-HHMMSS>/`
fn create_run_dir(root: &str) -> Result<PathBuf> {
    let dir = Path::new(root).join(chrono::Local::now().format("%m-%d-%H%M%S").to_string());
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create results directory {}", dir.display()))?;
    Ok(dir)
}
