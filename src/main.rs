use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use nalgebra::Vector3;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_pgslam::geometry::SE3;
use rust_pgslam::io::SystemConfig;
use rust_pgslam::loop_closing::{LoopConstraint, LoopDetector};
use rust_pgslam::map::{Cluster, ClusterId, Frame, FrameId, KeyPoint, VertexId};
use rust_pgslam::system::SlamBackend;

/// Frames per side of the synthetic square trajectory.
const FRAMES_PER_SIDE: usize = 10;

/// Side length of the square in meters.
const SIDE_LENGTH: f64 = 5.0;

/// Per-step drift injected into the odometry estimates.
const DRIFT_PER_STEP: f64 = 0.004;

/// Detector stub backed by the generator's ground truth.
///
/// A real detector would match descriptors and verify geometry; this demo
/// "verifies" a candidate whenever the true poses are close and reports the
/// true relative transform, which is exactly the contract the back-end
/// expects from the external loop-closing algorithm.
struct GroundTruthDetector {
    truth: HashMap<VertexId, SE3>,
    max_distance: f64,
}

impl LoopDetector for GroundTruthDetector {
    fn insert(&mut self, _vertex_id: VertexId, _cluster: &Cluster) {}

    fn verify(&mut self, anchor: VertexId, candidates: &[VertexId]) -> Option<LoopConstraint> {
        let anchor_truth = self.truth.get(&anchor)?;
        for &candidate in candidates {
            let Some(candidate_truth) = self.truth.get(&candidate) else {
                continue;
            };
            let distance = (candidate_truth.translation - anchor_truth.translation).norm();
            if distance < self.max_distance {
                return Some(LoopConstraint {
                    matched: candidate,
                    transform: candidate_truth.between(anchor_truth),
                    inliers: 150,
                });
            }
        }
        None
    }
}

/// True poses along a closed square, one per frame.
fn square_trajectory() -> Vec<SE3> {
    let step = SIDE_LENGTH / FRAMES_PER_SIDE as f64;
    let mut poses = Vec::new();
    for side in 0..4 {
        for i in 0..FRAMES_PER_SIDE {
            let along = i as f64 * step;
            let (x, y) = match side {
                0 => (along, 0.0),
                1 => (SIDE_LENGTH, along),
                2 => (SIDE_LENGTH - along, SIDE_LENGTH),
                _ => (0.0, SIDE_LENGTH - along),
            };
            poses.push(SE3 {
                translation: Vector3::new(x, y, 0.0),
                ..SE3::identity()
            });
        }
    }
    // Close the loop: return to the start
    poses.push(SE3::identity());
    poses
}

/// A minimal one-cluster frame at the given estimated pose.
fn synthetic_frame(id: u64, pose: SE3) -> Frame {
    let cluster = Cluster::new(
        ClusterId::new(0),
        FrameId::new(id),
        pose.clone(),
        vec![KeyPoint::new(320.0, 240.0), KeyPoint::new(100.0, 80.0)],
        vec![vec![0u8; 32]; 2],
        vec![vec![0.0f32; 128]; 2],
        vec![Vector3::new(0.0, 0.0, 2.0), Vector3::new(0.5, 0.2, 3.0)],
    );
    Frame::new(FrameId::new(id), id * 50_000_000, pose, vec![cluster])
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };

    let truth = square_trajectory();
    info!(frames = truth.len(), "generated synthetic square trajectory");

    // The detector sees the world as it really is
    let truth_by_vertex: HashMap<VertexId, SE3> = truth
        .iter()
        .enumerate()
        .map(|(i, pose)| (VertexId::new(i as u64), pose.clone()))
        .collect();
    let detector = GroundTruthDetector {
        truth: truth_by_vertex,
        max_distance: 0.5,
    };

    let mut backend = SlamBackend::new(config, Box::new(detector))?;
    let manager = backend.manager().clone();

    // Feed drifting odometry estimates at a simulated sensor rate
    let mut drift = Vector3::zeros();
    for (i, true_pose) in truth.iter().enumerate() {
        drift += Vector3::new(0.0, DRIFT_PER_STEP, 0.0);
        let estimate = SE3 {
            rotation: true_pose.rotation,
            translation: true_pose.translation + drift,
        };
        manager.add_frame_to_queue(synthetic_frame(i as u64, estimate))?;
        std::thread::sleep(Duration::from_millis(5));
    }

    // Wait for the worker to drain the queue
    let total = truth.len() as u64;
    let deadline = Instant::now() + Duration::from_secs(30);
    while manager.frames_processed() < total {
        if Instant::now() > deadline {
            bail!("worker did not drain the frame queue in time");
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    // One final refinement pass before dumping the map
    match manager.update() {
        Ok(summary) => info!(
            iterations = summary.iterations,
            initial_error = summary.initial_error,
            final_error = summary.final_error,
            "final optimization pass"
        ),
        Err(e) => warn!("final optimization pass failed: {e}"),
    }

    let start = manager
        .vertex_pose(VertexId::new(0))
        .map(|p| p.translation)
        .unwrap_or_default();
    let end = manager
        .vertex_pose(VertexId::new(total - 1))
        .map(|p| p.translation)
        .unwrap_or_default();
    info!(
        vertices = manager.num_vertices(),
        edges = manager.num_edges(),
        closure_gap = (end - start).norm(),
        "map built"
    );

    manager.save_to_file("graph.yaml")?;
    manager.export_trajectory("trajectory.csv")?;
    info!("wrote graph.yaml and trajectory.csv");

    backend.shutdown();
    Ok(())
}
