// src/pipeline/orchestrator.rs
//
// The per-tick state machine closing the loop
//
//   simulator ─▶ synthesis service ─▶ policy service ─▶ simulator
//
// Every tick runs the consistency checkers and rasterises the drivable area.
// Every `planning_stride`-th tick is a planning frame: reference plan →
// command → synthetic cameras → policy trajectory → kinematics → hand-back.

use super::frame_context::FrameContext;
use super::metrics::PipelineMetrics;
use super::session::SessionState;
use crate::conventions::{ego_point_to_policy, policy_point_to_ego, synthesis_to_policy_orientation};
use crate::error::{PipelineError, SynthesisError};
use crate::geometry::{
    interpolate_traj, matrix_to_quaternion, pose_to_matrix, transform_to_ego_frame,
    world_point_to_ego,
};
use crate::kinematics;
use crate::policy_client::{DrivingPolicyClient, PolicyEndpoint, PolicyRequest};
use crate::render::BevRenderer;
use crate::retry::CancelFlag;
use crate::scorer::FrameRecorder;
use crate::sim::{
    rasterize_drivable, CollisionChecker, ConsistencyChecker, OffRoadChecker, SceneSnapshot,
    Simulator,
};
use crate::synthesis_client::{
    encode_jpeg, AgentBox, ImageSynthesisClient, SynthesisEndpoint, SynthesisRequest,
    SynthesisResult,
};
use crate::types::{Config, Pose2};
use base64::Engine;
use image::imageops::{self, FilterType};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSignal {
    Continue,
    StopTimeLimit,
    /// The ego vehicle is not in the world this tick
    NoEgo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    SimulationFinished,
    TimeLimit,
    EgoLeft,
}

/// Shuts down on drop if [`FramePipeline::shutdown`] was never called, so a
/// panic unwinding out of the loop still saves scores and frees the simulator.
pub struct FramePipeline<S, Y, P, R>
where
    S: Simulator,
    Y: SynthesisEndpoint,
    P: PolicyEndpoint,
    R: FrameRecorder,
{
    config: Config,
    simulator: S,
    synthesis: ImageSynthesisClient<Y>,
    policy: DrivingPolicyClient<P>,
    recorder: R,
    renderer: BevRenderer,
    checkers: Vec<Box<dyn ConsistencyChecker>>,
    metrics: PipelineMetrics,
    cancel: CancelFlag,
    shut_down: bool,
}

impl<S, Y, P, R> FramePipeline<S, Y, P, R>
where
    S: Simulator,
    Y: SynthesisEndpoint,
    P: PolicyEndpoint,
    R: FrameRecorder,
{
    pub fn new(
        config: Config,
        simulator: S,
        synthesis: ImageSynthesisClient<Y>,
        policy: DrivingPolicyClient<P>,
        recorder: R,
        renderer: BevRenderer,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            config,
            simulator,
            synthesis,
            policy,
            recorder,
            renderer,
            checkers: vec![Box::new(OffRoadChecker), Box::new(CollisionChecker)],
            metrics: PipelineMetrics::new(),
            cancel,
            shut_down: false,
        }
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn recorder(&self) -> &R {
        &self.recorder
    }

    /// Drive the loop until the simulation ends, the time limit is hit or the
    /// ego leaves. Fatal errors are returned as-is; call [`Self::shutdown`]
    /// afterwards either way.
    pub async fn run(&mut self, mut session: SessionState) -> Result<StopReason, PipelineError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled {
                    tick: self.simulator.time_step(),
                });
            }
            if self.simulator.is_finished() {
                info!("Simulation finished at tick {}", self.simulator.time_step());
                return Ok(StopReason::SimulationFinished);
            }

            let (signal, next) = self.step(session).await?;
            session = next;

            match signal {
                TickSignal::Continue => {}
                TickSignal::StopTimeLimit => return Ok(StopReason::TimeLimit),
                TickSignal::NoEgo if session.ego_seen => {
                    info!("Ego vehicle left the simulation");
                    return Ok(StopReason::EgoLeft);
                }
                // not spawned yet
                TickSignal::NoEgo => {}
            }
        }
    }

    /// Advance the simulator one tick and process it.
    pub async fn step(
        &mut self,
        session: SessionState,
    ) -> Result<(TickSignal, SessionState), PipelineError> {
        self.simulator.advance();
        self.advance_tick(session).await
    }

    /// Process the simulator's current tick.
    pub async fn advance_tick(
        &mut self,
        mut session: SessionState,
    ) -> Result<(TickSignal, SessionState), PipelineError> {
        self.metrics.inc(&self.metrics.ticks);
        let scene = self.simulator.export_scene();
        let tick = scene.time_step;
        let ego_id = self.config.simulation.ego_id.clone();
        let Some(ego) = scene.vehicle(&ego_id).cloned() else {
            return Ok((TickSignal::NoEgo, session));
        };
        session.ego_seen = true;

        // ── 1. World consistency ──────────────────────────────────────────
        for checker in &self.checkers {
            if let Err(source) = checker.check(&scene, &ego_id) {
                warn!("Checker '{}' failed @ tick {}: {}", checker.name(), tick, source);
                return Err(PipelineError::WorldConsistency { tick, source });
            }
        }

        // ── 2. Drivable area ─────────────────────────────────────────────
        let render = self.simulator.render_data();
        let mask = rasterize_drivable(&render.road, &ego.pose(), &self.config.image);

        // ── 3. Non-planning tick ─────────────────────────────────────────
        if tick % self.config.simulation.planning_stride != 0 {
            self.recorder.record_frame(&mask, false, None, None);
            return Ok((TickSignal::Continue, session));
        }

        // ── 4. Time budget ───────────────────────────────────────────────
        session.timestamp += self.config.simulation.frame_interval;
        if session.timestamp >= self.config.simulation.max_sim_time {
            info!("Simulation time end (t={:.1}s)", session.timestamp);
            return Ok((TickSignal::StopTimeLimit, session));
        }

        // ── 5. Reference plan ────────────────────────────────────────────
        let sim_time = tick as f64 * self.simulator.step_length();
        let reference = match self.simulator.plan(sim_time, &scene).remove(&ego_id) {
            Some(traj) if !traj.is_empty() => traj,
            _ => {
                debug!("No reference states for {} at tick {}, skipping frame", ego_id, tick);
                self.metrics.inc(&self.metrics.skipped_frames);
                return Ok((TickSignal::Continue, session));
            }
        };

        // ── 6. Command ───────────────────────────────────────────────────
        let ctx = FrameContext::new(
            tick,
            session.timestamp,
            sim_time,
            ego,
            reference,
            mask,
            &self.config.command,
        );
        self.metrics.inc(&self.metrics.planning_frames);
        info!(
            "Planning frame t={:.1}s (tick {}), command: {}",
            ctx.timestamp,
            ctx.tick,
            ctx.command.as_prompt()
        );

        // ── 7-8. Synthetic cameras ───────────────────────────────────────
        let request = self.synthesis_request(&ctx, &scene, &session);
        session.last_pose = request.ego_pose;

        self.metrics.inc(&self.metrics.synthesis_calls);
        let started = Instant::now();
        let synthesized = self
            .synthesis
            .synthesize(&request, ctx.frame_idx())
            .await
            .map_err(|source| PipelineError::Synthesis {
                timestamp: ctx.timestamp,
                source,
            })?;
        self.metrics
            .set_timing(&self.metrics.synthesis_time_ms, started.elapsed().as_millis() as u64);

        // ── 9-10. Policy ─────────────────────────────────────────────────
        let policy_request = self
            .policy_request(&ctx, &synthesized, &session)
            .map_err(|source| PipelineError::Synthesis {
                timestamp: ctx.timestamp,
                source,
            })?;

        let started = Instant::now();
        let reply = self.policy.query(&policy_request).await?;
        self.metrics
            .set_timing(&self.metrics.policy_time_ms, started.elapsed().as_millis() as u64);
        self.metrics.add(&self.metrics.policy_retries, reply.retries as u64);
        if reply.degraded {
            self.metrics.inc(&self.metrics.degraded_replies);
        }

        // ── 11. Plan in the ego frame, origin first ──────────────────────
        let mut planned = Vec::with_capacity(reply.points.len() + 1);
        planned.push([0.0, 0.0]);
        planned.extend(reply.points.iter().map(|p| policy_point_to_ego(*p)));
        debug!("Driver path: {:?}", planned);

        // ── 12. History ──────────────────────────────────────────────────
        session.past_traj.push([ctx.ego.x, ctx.ego.y]);
        session.ego_past_traj = session.past_traj.to_ego(&ctx.ego);

        // ── 13-14. Executed trajectory and kinematics ────────────────────
        let spacing = self.config.simulation.frame_interval;
        let executed = interpolate_traj(
            &ctx.ego,
            &planned,
            ctx.sim_time,
            spacing,
            self.simulator.step_length(),
        );
        session.hints = kinematics::estimate(&planned, &ctx.reference, spacing);
        debug!(
            "accel {:?}, rotation rate {:?}, vel {:?}",
            session.hints.accel, session.hints.rotation_rate, session.hints.vel
        );

        // ── 15. Artifacts ────────────────────────────────────────────────
        if let Err(e) = self.renderer.render(&ctx, &render, &planned, &session.ego_past_traj) {
            warn!("BEV render failed: {:#}", e);
        }
        self.recorder
            .record_frame(&ctx.mask, true, Some(&executed), Some(&ctx.reference));

        // ── 16-17. Hand-back ─────────────────────────────────────────────
        let mut handback = HashMap::new();
        if self.config.simulation.use_agent_path
            && ctx.timestamp > self.config.simulation.agent_warmup_secs
        {
            info!("Use agent path to drive");
            self.metrics.inc(&self.metrics.agent_handbacks);
            handback.insert(ego_id, executed);
        }
        self.simulator.set_trajectories(handback);
        session.last_plan = planned;

        Ok((TickSignal::Continue, session))
    }

    /// Orderly shutdown: persist scores, release the simulator, log metrics.
    /// Runs once; later calls (and the drop guard) are no-ops.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        info!("Simulation ends");
        if let Err(e) = self.recorder.save() {
            warn!("Could not save scores: {:#}", e);
        }
        self.simulator.destroy();

        let summary = self.metrics.summary();
        info!(
            "📊 {} ticks, {} planning frames ({} skipped), {} policy retries, {} degraded",
            summary.ticks,
            summary.planning_frames,
            summary.skipped_frames,
            summary.policy_retries,
            summary.degraded_replies
        );
        match serde_json::to_string(&summary) {
            Ok(json) => debug!("metrics: {}", json),
            Err(e) => warn!("Could not serialise metrics: {}", e),
        }
    }

    fn synthesis_request(
        &self,
        ctx: &FrameContext,
        scene: &SceneSnapshot,
        session: &SessionState,
    ) -> SynthesisRequest {
        let origin = ctx.ego.pose();
        let agents = scene
            .vehicles
            .values()
            .filter(|v| v.id != ctx.ego.id)
            .map(|v| {
                let local = transform_to_ego_frame(&origin, &v.pose());
                AgentBox {
                    id: v.id.clone(),
                    x: local.x,
                    y: local.y,
                    yaw: local.yaw,
                    length: v.length,
                    width: v.width,
                    speed: v.speed,
                }
            })
            .collect();

        SynthesisRequest {
            timestamp: ctx.timestamp,
            location: self.config.map.name.clone(),
            prompt: self.config.map.gen_description.clone(),
            command: ctx.command.code(),
            ego_pose: pose_to_matrix(&origin),
            last_ego_pose: session.last_pose,
            accel: session.hints.accel,
            rotation_rate: session.hints.rotation_rate,
            vel: session.hints.vel,
            agents,
            map_polygons: road_in_ego_frame(&scene.road.polygons, &origin),
            drivable_mask: ctx.mask.to_nested(),
        }
    }

    fn policy_request(
        &self,
        ctx: &FrameContext,
        synthesized: &SynthesisResult,
        session: &SessionState,
    ) -> Result<PolicyRequest, SynthesisError> {
        let target_width = self.config.image.target_width.max(1);
        let mut encoded = Vec::with_capacity(3);
        let mut dims = (0, 0);
        for tile in synthesized.tiles.iter().take(3) {
            let (w, h) = tile.dimensions();
            let target_height = ((target_width as f64 / w.max(1) as f64) * h as f64).round() as u32;
            let resized = imageops::resize(tile, target_width, target_height.max(1), FilterType::Lanczos3);
            dims = resized.dimensions();
            encoded.push(base64::engine::general_purpose::STANDARD.encode(encode_jpeg(&resized)?));
        }
        let [cam_front_left, cam_front, cam_front_right]: [String; 3] = encoded
            .try_into()
            .map_err(|_| SynthesisError::TileGeometry {
                height: 0,
                tiles: synthesized.tiles.len() as u32,
            })?;

        let quat = matrix_to_quaternion(&synthesized.ego_pose);
        Ok(PolicyRequest {
            timestamp: ctx.timestamp,
            cam_front_left,
            cam_front,
            cam_front_right,
            image_width: dims.0,
            image_height: dims.1,
            ego_pose: synthesis_to_policy_orientation(quat),
            command: synthesized.command.as_prompt().to_string(),
            accel: vec3(&synthesized.accel, session.hints.accel),
            rotation_rate: vec3(&synthesized.rotation_rate, session.hints.rotation_rate),
            vel: vec3(&synthesized.vel, session.hints.vel),
            past_traj: session
                .ego_past_traj
                .iter()
                .map(|p| ego_point_to_policy(*p))
                .collect(),
        })
    }
}

impl<S, Y, P, R> Drop for FramePipeline<S, Y, P, R>
where
    S: Simulator,
    Y: SynthesisEndpoint,
    P: PolicyEndpoint,
    R: FrameRecorder,
{
    fn drop(&mut self) {
        if !self.shut_down {
            warn!("Pipeline dropped without shutdown, cleaning up");
            self.shutdown();
        }
    }
}

fn road_in_ego_frame(polygons: &[Vec<[f64; 2]>], origin: &Pose2) -> Vec<Vec<[f64; 2]>> {
    polygons
        .iter()
        .map(|poly| poly.iter().map(|p| world_point_to_ego(origin, *p)).collect())
        .collect()
}

/// Echoed 3-vector from the synthesis payload, or `fallback` when it is
/// missing or short.
fn vec3(values: &[f64], fallback: [f64; 3]) -> [f64; 3] {
    match values {
        [x, y, z, ..] => [*x, *y, *z],
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PolicyError, WorldViolation};
    use crate::retry::Poll;
    use crate::sim::scenario::{Scenario, ScenarioSimulator};
    use crate::sim::DrivableMask;
    use crate::synthesis_client::tests::{payload, stacked_png_base64};
    use crate::synthesis_client::SynthesisPayload;
    use crate::types::Trajectory;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    const CONFIG: &str = r#"
servers:
  synthesis: "http://localhost:11000/"
  policy: "http://localhost:11002/"
simulation:
  ego_id: "egoCar"
  max_sim_time: 20.0
map:
  name: "boston-seaport"
  gen_description: "sunny daytime"
image:
  size: 100
  meters_per_pixel: 0.5
  target_width: 16
"#;

    const SCENARIO: &str = r#"
name: test_road
max_steps: 200
road:
  polygons:
    - [[-100.0, -8.0], [500.0, -8.0], [500.0, 8.0], [-100.0, 8.0]]
vehicles:
  - id: egoCar
    x: 0.0
    y: 0.0
    speed: 5.0
  - id: lead
    x: 40.0
    y: 3.5
    speed: 5.0
"#;

    struct CountingSynthesis {
        payload: SynthesisPayload,
        calls: Rc<Cell<u32>>,
        requests: Rc<RefCell<Vec<SynthesisRequest>>>,
    }

    impl SynthesisEndpoint for CountingSynthesis {
        async fn request(
            &self,
            request: &SynthesisRequest,
        ) -> Result<SynthesisPayload, SynthesisError> {
            self.calls.set(self.calls.get() + 1);
            self.requests.borrow_mut().push(request.clone());
            Ok(self.payload.clone())
        }

        async fn probe(&self) -> Result<(), SynthesisError> {
            Ok(())
        }
    }

    struct ScriptedPolicy {
        replies: RefCell<VecDeque<Poll<String>>>,
        calls: Rc<Cell<u32>>,
    }

    impl PolicyEndpoint for ScriptedPolicy {
        async fn submit(&self, _request: &PolicyRequest) -> Result<Poll<String>, PolicyError> {
            self.calls.set(self.calls.get() + 1);
            Ok(self
                .replies
                .borrow_mut()
                .pop_front()
                .unwrap_or(Poll::NotReady))
        }

        async fn probe(&self) -> Result<(), PolicyError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingScorer {
        frames: Vec<(bool, Option<usize>)>,
        saves: Rc<Cell<u32>>,
    }

    impl FrameRecorder for RecordingScorer {
        fn record_frame(
            &mut self,
            _mask: &DrivableMask,
            is_planning_frame: bool,
            planned: Option<&Trajectory>,
            _reference: Option<&Trajectory>,
        ) {
            self.frames.push((is_planning_frame, planned.map(|t| t.len())));
        }

        fn save(&mut self) -> anyhow::Result<()> {
            self.saves.set(self.saves.get() + 1);
            Ok(())
        }
    }

    type TestPipeline = FramePipeline<ScenarioSimulator, CountingSynthesis, ScriptedPolicy, RecordingScorer>;

    struct Harness {
        pipeline: TestPipeline,
        synthesis_calls: Rc<Cell<u32>>,
        synthesis_requests: Rc<RefCell<Vec<SynthesisRequest>>>,
        policy_calls: Rc<Cell<u32>>,
        dir: tempfile::TempDir,
    }

    fn harness(config: &str, scenario: &str, replies: Vec<Poll<String>>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_yaml(config).unwrap();
        let simulator = ScenarioSimulator::new(
            Scenario::from_yaml(scenario).unwrap(),
            config.simulation.step_length,
        );

        let synthesis_calls = Rc::new(Cell::new(0));
        let synthesis_requests = Rc::new(RefCell::new(Vec::new()));
        let synthesis = ImageSynthesisClient::new(
            CountingSynthesis {
                payload: payload(Some(stacked_png_base64())),
                calls: synthesis_calls.clone(),
                requests: synthesis_requests.clone(),
            },
            dir.path(),
        );

        let policy_calls = Rc::new(Cell::new(0));
        let cancel = CancelFlag::new();
        let policy = DrivingPolicyClient::new(
            ScriptedPolicy {
                replies: RefCell::new(replies.into()),
                calls: policy_calls.clone(),
            },
            config.policy_retry.clone(),
            cancel.clone(),
        );

        let renderer = BevRenderer::new(dir.path(), 100, 0.5);
        let pipeline = FramePipeline::new(
            config,
            simulator,
            synthesis,
            policy,
            RecordingScorer::default(),
            renderer,
            cancel,
        );

        Harness {
            pipeline,
            synthesis_calls,
            synthesis_requests,
            policy_calls,
            dir,
        }
    }

    const READY: &str = r#"{"traj": "(1,0),(3,0),(6,0),(10,0),(15,0),(21,0)"}"#;

    #[tokio::test(start_paused = true)]
    async fn test_planning_frame_end_to_end() {
        let mut h = harness(
            CONFIG,
            SCENARIO,
            vec![Poll::NotReady, Poll::Ready(READY.to_string())],
        );
        let started = tokio::time::Instant::now();

        let mut session = SessionState::new(0.5);
        for _ in 0..5 {
            let (signal, next) = h.pipeline.step(session).await.unwrap();
            assert_eq!(signal, TickSignal::Continue);
            session = next;
        }

        // one retry sleep of the initial backoff
        assert_eq!(h.pipeline.metrics().policy_retries.load(Ordering::Relaxed), 1);
        assert_eq!(h.policy_calls.get(), 2);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(1000));

        // six policy points plus the origin
        assert_eq!(session.last_plan.len(), 7);
        assert_eq!(session.last_plan[0], [0.0, 0.0]);
        assert_eq!(session.last_plan[1], [1.0, 0.0]);

        let planning: Vec<_> = h.pipeline.recorder().frames.iter().filter(|f| f.0).collect();
        assert_eq!(planning.len(), 1);
        assert_eq!(h.pipeline.recorder().frames.len(), 5);
        // 1 anchor + 6 segments × 5 sim steps
        assert_eq!(planning[0].1, Some(31));

        // kinematics seeded for the next request
        assert!((session.hints.accel[0] - 4.0).abs() < 1e-9);
        assert_eq!(session.hints.vel, [5.0, 0.0, 0.0]);
        assert_eq!(session.timestamp, 0.0);
        assert_eq!(session.ego_past_traj.len(), 1);

        // synthesis saw the scene in the ego frame
        assert_eq!(h.synthesis_calls.get(), 1);
        let requests = h.synthesis_requests.borrow();
        assert_eq!(requests[0].command, 2);
        assert_eq!(requests[0].agents.len(), 1);
        assert!((requests[0].agents[0].x - 40.0).abs() < 1e-9);
        assert_eq!(requests[0].drivable_mask.len(), 100);

        assert!(h.dir.path().join("diffusion_000.jpg").exists());
        assert!(h.dir.path().join("bev_000.png").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_planning_tick_calls_no_service() {
        let mut h = harness(CONFIG, SCENARIO, vec![]);
        let (signal, _) = h.pipeline.step(SessionState::new(0.5)).await.unwrap();
        assert_eq!(signal, TickSignal::Continue);
        assert_eq!(h.synthesis_calls.get(), 0);
        assert_eq!(h.policy_calls.get(), 0);
        assert_eq!(h.pipeline.recorder().frames, vec![(false, None)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_limit_stops_before_service_calls() {
        let config = CONFIG.replace("max_sim_time: 20.0", "max_sim_time: 0.0");
        let mut h = harness(&config, SCENARIO, vec![]);
        let reason = h.pipeline.run(SessionState::new(0.5)).await.unwrap();
        assert_eq!(reason, StopReason::TimeLimit);
        assert_eq!(h.synthesis_calls.get(), 0);
        assert_eq!(h.policy_calls.get(), 0);
        assert_eq!(h.pipeline.metrics().ticks.load(Ordering::Relaxed), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_path_handed_back_after_warmup() {
        let config = CONFIG.replace(
            "max_sim_time: 20.0",
            "max_sim_time: 20.0\n  use_agent_path: true\n  agent_warmup_secs: 0.0",
        );
        let replies = (0..3).map(|_| Poll::Ready(READY.to_string())).collect();
        let mut h = harness(&config, SCENARIO, replies);

        let mut session = SessionState::new(0.5);
        for _ in 0..10 {
            session = h.pipeline.step(session).await.unwrap().1;
        }
        // t=0.0 is not past the warm-up, t=0.5 is
        assert_eq!(h.pipeline.metrics().agent_handbacks.load(Ordering::Relaxed), 1);
        assert_eq!(session.timestamp, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_collision_is_fatal() {
        let scenario = SCENARIO.replace("x: 40.0\n    y: 3.5", "x: 2.0\n    y: 0.0");
        let mut h = harness(CONFIG, &scenario, vec![]);
        let err = h.pipeline.step(SessionState::new(0.5)).await.unwrap_err();
        match err {
            PipelineError::WorldConsistency { tick, source } => {
                assert_eq!(tick, 1);
                assert!(matches!(source, WorldViolation::Collision { .. }));
            }
            other => panic!("expected world violation, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_image_is_fatal() {
        let mut h = harness(CONFIG, SCENARIO, vec![]);
        h.pipeline.synthesis = ImageSynthesisClient::new(
            CountingSynthesis {
                payload: payload(None),
                calls: h.synthesis_calls.clone(),
                requests: h.synthesis_requests.clone(),
            },
            h.dir.path(),
        );

        let mut session = SessionState::new(0.5);
        for _ in 0..4 {
            session = h.pipeline.step(session).await.unwrap().1;
        }
        let err = h.pipeline.step(session).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Synthesis {
                source: SynthesisError::MissingImage,
                ..
            }
        ));
        assert_eq!(h.policy_calls.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_when_ego_leaves_and_shutdown_saves() {
        let scenario = SCENARIO.replace("    speed: 5.0\n  - id: lead", "    speed: 5.0\n    exit_step: 2\n  - id: lead");
        let mut h = harness(CONFIG, &scenario, vec![]);
        let reason = h.pipeline.run(SessionState::new(0.5)).await.unwrap();
        assert_eq!(reason, StopReason::EgoLeft);

        h.pipeline.shutdown();
        assert_eq!(h.pipeline.recorder().saves.get(), 1);
    }

    #[test]
    fn test_shutdown_runs_once() {
        let mut h = harness(CONFIG, SCENARIO, vec![]);
        let saves = h.pipeline.recorder().saves.clone();
        h.pipeline.shutdown();
        h.pipeline.shutdown();
        drop(h);
        assert_eq!(saves.get(), 1);
    }

    #[test]
    fn test_panic_unwinding_still_shuts_down() {
        let h = harness(CONFIG, SCENARIO, vec![]);
        let saves = h.pipeline.recorder().saves.clone();
        let pipeline = h.pipeline;
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _pipeline = pipeline;
            panic!("simulator crashed");
        }));
        assert!(outcome.is_err());
        assert_eq!(saves.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_returns_error() {
        let mut h = harness(CONFIG, SCENARIO, vec![]);
        h.pipeline.cancel.cancel();
        let err = h.pipeline.run(SessionState::new(0.5)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { tick: 0 }));
    }
}
