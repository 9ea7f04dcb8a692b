//! GraphManager - the pose-graph back-end core.
//!
//! Converts queued frames into vertices, links them sequentially, offers
//! new vertices to the loop-closing detector, and periodically refines all
//! poses by nonlinear optimization.
//!
//! The manager is a cheaply clonable handle over shared state: producers
//! call `add_frame_to_queue` from their own threads, the dedicated worker
//! thread drives `run`, and the loop closer calls back into
//! `find_closest_vertices`/`add_edge`/`update` concurrently. Only the
//! worker thread converts frames into vertices, which is what keeps the
//! sequential chain well-formed; everything else is serialized by the graph
//! mutex, so no two structural mutations ever interleave.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::geometry::SE3;
use crate::io::config::{CameraModel, GraphTuning, SystemConfig};
use crate::io::persistence;
use crate::map::{EdgeKind, Frame, FrameId, GraphError, VertexId};
use crate::optimizer::{apply_outcome, collect_problem, PoseGraphSolver};

use super::messages::NewVertexMsg;
use super::shared_state::{ManagerState, SharedState};

/// Inlier count credited to sequential (odometry) edges, which are always
/// trusted.
const SEQUENTIAL_EDGE_INLIERS: usize = 100;

/// Idle sleep between empty-queue checks in the intake loop. Bounds both
/// the wakeup latency for a freshly queued frame and the busy-work while
/// idle.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Summary of one optimization pass.
#[derive(Debug, Clone, Copy)]
pub struct OptimizationSummary {
    /// Solver iterations run (0 when there was nothing to optimize).
    pub iterations: usize,

    /// Weighted residual norm before the pass.
    pub initial_error: f64,

    /// Weighted residual norm after the pass.
    pub final_error: f64,

    /// Number of vertex poses overwritten.
    pub updated: usize,
}

/// The pose-graph manager handle.
#[derive(Clone)]
pub struct GraphManager {
    shared: Arc<SharedState>,

    /// Injected nonlinear least-squares engine.
    solver: Arc<dyn PoseGraphSolver>,

    /// Camera intrinsics, carried for collaborators that interpret
    /// geometric measurements.
    camera: CameraModel,

    /// Fixed camera-to-reference-frame offset composed into every initial
    /// vertex pose.
    camera_to_ref: SE3,

    tuning: GraphTuning,

    /// Handoff of new vertices to the loop closer.
    vertex_tx: Sender<NewVertexMsg>,

    /// Processed frames counter.
    frames_processed: Arc<AtomicU64>,
}

impl GraphManager {
    /// Create a manager in the `Uninitialized` state.
    pub fn new(
        config: &SystemConfig,
        solver: Arc<dyn PoseGraphSolver>,
        vertex_tx: Sender<NewVertexMsg>,
    ) -> Result<Self> {
        Ok(Self {
            shared: SharedState::new(),
            solver,
            camera: config.camera.camera_model(),
            camera_to_ref: config.camera_to_ref.to_se3()?,
            tuning: config.graph.clone(),
            vertex_tx,
            frames_processed: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Initialize the manager: `Uninitialized → Running`.
    ///
    /// Resets the graph, the queue, and the counters. Ignored (with a
    /// warning) in any other state; `Stopped` is terminal.
    pub fn init(&self) {
        if self.shared.state() != ManagerState::Uninitialized {
            warn!(state = ?self.shared.state(), "init called outside Uninitialized; ignored");
            return;
        }
        self.shared.graph.lock().clear();
        self.shared.frame_queue.lock().clear();
        self.frames_processed.store(0, Ordering::SeqCst);
        self.shared.set_state(ManagerState::Running);
        info!("graph manager initialized");
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        self.shared.state()
    }

    /// Request a cooperative shutdown: `Running → ShuttingDown`.
    ///
    /// The intake loop finishes its current cycle, discards any frames
    /// still queued, and transitions to `Stopped`. An in-flight `update`
    /// is never aborted.
    pub fn request_shutdown(&self) {
        if self.shared.request_shutdown() {
            info!("shutdown requested");
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Frame intake
    // ─────────────────────────────────────────────────────────────────────

    /// Append a frame to the intake queue.
    ///
    /// Non-blocking beyond the brief queue-mutex hold. Frame content is not
    /// validated. Rejected once shutdown has begun.
    pub fn add_frame_to_queue(&self, frame: Frame) -> Result<(), GraphError> {
        if !self.shared.is_running() {
            return Err(GraphError::ShuttingDown);
        }
        self.shared.frame_queue.lock().push_back(frame);
        Ok(())
    }

    /// The intake/processing loop. Valid only in `Running`.
    ///
    /// Cooperative polling: dequeue the oldest frame if one is available,
    /// otherwise sleep briefly and recheck. The shutdown flag is observed
    /// every iteration; frames still queued when shutdown finalizes are
    /// dropped, an accepted data-loss point that is logged, not surfaced.
    pub fn run(&self) {
        if self.shared.state() != ManagerState::Running {
            warn!(state = ?self.shared.state(), "run called outside Running; ignored");
            return;
        }
        info!("graph worker started");

        loop {
            if self.shared.is_shutdown_requested() {
                break;
            }

            let frame = self.shared.frame_queue.lock().pop_front();
            match frame {
                Some(frame) => {
                    self.process_new_frame(frame);

                    let processed = self.frames_processed.load(Ordering::SeqCst);
                    if self.tuning.optimize_every > 0
                        && processed % self.tuning.optimize_every == 0
                    {
                        if let Err(e) = self.update() {
                            warn!("periodic optimization skipped: {e}");
                        }
                    }
                }
                None => std::thread::sleep(POLL_INTERVAL),
            }
        }

        let dropped = {
            let mut queue = self.shared.frame_queue.lock();
            let n = queue.len();
            queue.clear();
            n
        };
        if dropped > 0 {
            info!(dropped, "discarded queued frames on shutdown");
        }
        self.shared.mark_stopped();
        info!(
            frames = self.frames_processed.load(Ordering::SeqCst),
            "graph worker stopped"
        );
    }

    /// Convert one frame into graph vertices.
    ///
    /// Each cluster yields a vertex whose initial estimate is the frame's
    /// reported pose composed with the camera-to-reference offset. When a
    /// previously-assigned vertex exists it is linked to the new one by a
    /// sequential edge carrying the relative transform between the two
    /// estimates. The new vertex is then offered to the loop closer.
    ///
    /// Only the worker thread may call this; the sequential chain relies on
    /// frame-to-vertex conversion being single-threaded.
    pub fn process_new_frame(&self, frame: Frame) {
        debug!(frame = %frame.id, clusters = frame.clusters.len(), "processing frame");

        let vertex_pose = self.camera_to_ref.compose(&frame.pose);

        for cluster in frame.clusters {
            let vertex_id = {
                let mut graph = self.shared.graph.lock();
                let prev = graph.last_vertex_id();
                let id = graph.add_vertex(vertex_pose.clone(), frame.id);

                if let Some(prev_id) = prev {
                    if let Some(prev_pose) = graph.vertex_pose(prev_id) {
                        let rel = prev_pose.between(&vertex_pose);
                        if let Err(e) = graph.add_edge(
                            prev_id,
                            id,
                            rel,
                            SEQUENTIAL_EDGE_INLIERS,
                            EdgeKind::Sequential,
                        ) {
                            warn!("sequential edge rejected: {e}");
                        }
                    }
                }
                id
            };

            // Offer the vertex as a loop-closure query anchor. If the loop
            // closer is saturated the candidate is skipped, not awaited.
            let _ = self.vertex_tx.try_send(NewVertexMsg {
                vertex_id,
                cluster: Arc::new(cluster),
            });
        }

        self.frames_processed.fetch_add(1, Ordering::SeqCst);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Graph mutation and queries
    // ─────────────────────────────────────────────────────────────────────

    /// Insert a verified loop edge between two existing vertices.
    ///
    /// `measurement` is the measured relative transform i → j; `inliers` is
    /// the verified correspondence count backing it. Invalid references
    /// leave the graph unchanged.
    pub fn add_edge(
        &self,
        vertex_i: VertexId,
        vertex_j: VertexId,
        measurement: SE3,
        inliers: usize,
    ) -> Result<(), GraphError> {
        if !self.shared.is_running() {
            return Err(GraphError::ShuttingDown);
        }
        let mut graph = self.shared.graph.lock();
        graph.add_edge(vertex_i, vertex_j, measurement, inliers, EdgeKind::Loop)?;
        info!(%vertex_i, %vertex_j, inliers, "loop edge inserted");
        Ok(())
    }

    /// Run one full optimization pass over the current graph.
    ///
    /// Holds the graph guarantee for the whole solve: intake halts from the
    /// graph's perspective, though the frame queue stays independently
    /// appendable. On success every vertex pose is overwritten with the
    /// solver's result; on failure the previous estimates are left
    /// untouched and `NotConverged` is reported: the map simply does not
    /// improve this cycle.
    pub fn update(&self) -> Result<OptimizationSummary, GraphError> {
        if self.shared.is_shutdown_requested() {
            return Err(GraphError::ShuttingDown);
        }

        let mut graph = self.shared.graph.lock();
        if graph.num_vertices() < 2 || graph.num_edges() == 0 {
            return Ok(OptimizationSummary {
                iterations: 0,
                initial_error: 0.0,
                final_error: 0.0,
                updated: 0,
            });
        }

        let problem = match collect_problem(&graph) {
            Some(p) => p,
            None => {
                return Ok(OptimizationSummary {
                    iterations: 0,
                    initial_error: 0.0,
                    final_error: 0.0,
                    updated: 0,
                })
            }
        };

        match self.solver.solve(&problem) {
            Some(outcome) => {
                let updated = apply_outcome(&mut graph, &outcome);
                info!(
                    iterations = outcome.iterations,
                    initial_error = outcome.initial_error,
                    final_error = outcome.final_error,
                    updated,
                    "graph optimized"
                );
                Ok(OptimizationSummary {
                    iterations: outcome.iterations,
                    initial_error: outcome.initial_error,
                    final_error: outcome.final_error,
                    updated,
                })
            }
            None => {
                warn!("optimization failed to converge; pose estimates retained");
                Err(GraphError::NotConverged)
            }
        }
    }

    /// Spatial-neighbor candidates for loop closure.
    ///
    /// See [`crate::map::PoseGraph::find_closest_vertices`] for the
    /// exclusion-window and ordering semantics. Never mutates the graph.
    pub fn find_closest_vertices(
        &self,
        vertex_id: VertexId,
        window_center: VertexId,
        window: u64,
        best_n: usize,
    ) -> Vec<VertexId> {
        self.shared
            .graph
            .lock()
            .find_closest_vertices(vertex_id, window_center, window, best_n)
    }

    /// Vertices originating from the given frame (empty if unknown).
    pub fn frame_vertices(&self, frame_id: FrameId) -> Vec<VertexId> {
        self.shared.graph.lock().frame_vertices(frame_id)
    }

    /// Current pose estimate of a vertex.
    pub fn vertex_pose(&self, id: VertexId) -> Option<SE3> {
        self.shared.graph.lock().vertex_pose(id)
    }

    pub fn num_vertices(&self) -> usize {
        self.shared.graph.lock().num_vertices()
    }

    pub fn num_edges(&self) -> usize {
        self.shared.graph.lock().num_edges()
    }

    /// Write a complete, consistent snapshot of the graph to `path`.
    ///
    /// The snapshot is taken under the graph guarantee, so it never
    /// observes a half-inserted edge.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let graph = self.shared.graph.lock();
        persistence::save_graph(path, &graph)
    }

    /// Export the current vertex poses as a flat CSV trajectory.
    pub fn export_trajectory<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let graph = self.shared.graph.lock();
        persistence::export_trajectory_csv(path, &graph)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Static configuration
    // ─────────────────────────────────────────────────────────────────────

    /// Camera intrinsics consumed at initialization.
    pub fn camera(&self) -> &CameraModel {
        &self.camera
    }

    /// The fixed camera-to-reference-frame offset.
    pub fn camera_to_ref(&self) -> &SE3 {
        &self.camera_to_ref
    }

    /// Number of frames processed so far.
    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{Cluster, ClusterId, KeyPoint};
    use crate::optimizer::LevenbergMarquardt;
    use crossbeam_channel::{bounded, Receiver};
    use nalgebra::Vector3;

    fn pose_at(x: f64, y: f64) -> SE3 {
        SE3 {
            translation: Vector3::new(x, y, 0.0),
            ..SE3::identity()
        }
    }

    fn frame_at(id: u64, pose: SE3) -> Frame {
        let cluster = Cluster::new(
            ClusterId::new(0),
            FrameId::new(id),
            pose.clone(),
            vec![KeyPoint::new(10.0, 20.0)],
            vec![vec![0u8; 32]],
            vec![vec![0.0f32; 128]],
            vec![Vector3::new(0.0, 0.0, 2.0)],
        );
        Frame::new(FrameId::new(id), id * 50_000_000, pose, vec![cluster])
    }

    fn test_manager() -> (GraphManager, Receiver<NewVertexMsg>) {
        let (tx, rx) = bounded(64);
        let manager = GraphManager::new(
            &SystemConfig::default(),
            Arc::new(LevenbergMarquardt::default()),
            tx,
        )
        .unwrap();
        manager.init();
        (manager, rx)
    }

    /// Feed five sequential frames straight through the processing path.
    fn feed_line(manager: &GraphManager) {
        for i in 0..5u64 {
            manager.process_new_frame(frame_at(i, pose_at(i as f64, 0.0)));
        }
    }

    #[test]
    fn test_five_frames_five_vertices_four_edges() {
        let (manager, _rx) = test_manager();
        feed_line(&manager);

        assert_eq!(manager.num_vertices(), 5);
        assert_eq!(manager.num_edges(), 4);
        assert_eq!(manager.frames_processed(), 5);

        for i in 0..5u64 {
            assert_eq!(
                manager.frame_vertices(FrameId::new(i)),
                vec![VertexId::new(i)]
            );
        }
    }

    #[test]
    fn test_find_closest_excludes_window() {
        let (manager, _rx) = test_manager();
        feed_line(&manager);

        let neighbors =
            manager.find_closest_vertices(VertexId::new(4), VertexId::new(4), 2, 3);
        assert_eq!(neighbors, vec![VertexId::new(1), VertexId::new(0)]);
    }

    #[test]
    fn test_add_edge_invalid_reference() {
        let (manager, _rx) = test_manager();
        feed_line(&manager);

        let err = manager
            .add_edge(VertexId::new(2), VertexId::new(99), SE3::identity(), 30)
            .unwrap_err();
        assert_eq!(err, GraphError::UnknownVertex(VertexId::new(99)));
        assert_eq!(manager.num_edges(), 4);
    }

    #[test]
    fn test_new_vertices_offered_to_loop_closer() {
        let (manager, rx) = test_manager();
        feed_line(&manager);

        let msgs: Vec<NewVertexMsg> = rx.try_iter().collect();
        assert_eq!(msgs.len(), 5);
        assert_eq!(msgs[0].vertex_id, VertexId::new(0));
        assert_eq!(msgs[4].vertex_id, VertexId::new(4));
        assert_eq!(msgs[2].cluster.frame_id(), FrameId::new(2));
    }

    #[test]
    fn test_loop_edge_and_update_reduce_discrepancy() {
        let (manager, _rx) = test_manager();

        // Drifting estimates: y creeps up while measurements say pure x steps
        for i in 0..5u64 {
            manager.process_new_frame(frame_at(i, pose_at(i as f64, 0.1 * i as f64)));
        }

        let loop_meas = pose_at(4.0, 0.0);
        let discrepancy = |m: &GraphManager| {
            let p0 = m.vertex_pose(VertexId::new(0)).unwrap();
            let p4 = m.vertex_pose(VertexId::new(4)).unwrap();
            (p0.between(&p4).translation - loop_meas.translation).norm()
        };
        let before = discrepancy(&manager);

        manager
            .add_edge(VertexId::new(0), VertexId::new(4), loop_meas.clone(), 300)
            .unwrap();
        assert_eq!(manager.num_edges(), 5);

        let summary = manager.update().unwrap();
        assert!(summary.final_error <= summary.initial_error);
        assert!(discrepancy(&manager) < before);
    }

    #[test]
    fn test_update_trivial_graph_is_noop() {
        let (manager, _rx) = test_manager();
        manager.process_new_frame(frame_at(0, pose_at(0.0, 0.0)));

        let summary = manager.update().unwrap();
        assert_eq!(summary.iterations, 0);
        assert_eq!(summary.updated, 0);
    }

    #[test]
    fn test_shutdown_rejects_mutation() {
        let (manager, _rx) = test_manager();
        feed_line(&manager);

        manager.request_shutdown();

        assert_eq!(
            manager.add_frame_to_queue(frame_at(9, pose_at(9.0, 0.0))),
            Err(GraphError::ShuttingDown)
        );
        assert_eq!(
            manager.add_edge(VertexId::new(0), VertexId::new(4), SE3::identity(), 50),
            Err(GraphError::ShuttingDown)
        );
        assert!(matches!(manager.update(), Err(GraphError::ShuttingDown)));

        // The graph itself is untouched
        assert_eq!(manager.num_vertices(), 5);
        assert_eq!(manager.num_edges(), 4);
    }

    #[test]
    fn test_camera_to_ref_offset_applied() {
        let (tx, _rx) = bounded(8);
        let mut config = SystemConfig::default();
        config.camera_to_ref.data = vec![
            1.0, 0.0, 0.0, 0.5, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
            0.0, 0.0, 0.0, 1.0,
        ];
        let manager =
            GraphManager::new(&config, Arc::new(LevenbergMarquardt::default()), tx).unwrap();
        manager.init();

        manager.process_new_frame(frame_at(0, pose_at(1.0, 0.0)));
        let pose = manager.vertex_pose(VertexId::new(0)).unwrap();
        assert!((pose.translation.x - 1.5).abs() < 1e-12);
    }
}
