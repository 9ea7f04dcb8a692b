//! LoopCloser - the loop-closing worker thread.
//!
//! Receives newly created vertices from the intake worker, queries the
//! graph for spatially close candidates outside the temporal exclusion
//! window, hands them to the detector, and inserts any verified constraint
//! back into the graph followed by an optimization pass.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info, warn};

use crate::system::{GraphManager, ManagerState, NewVertexMsg};

use super::LoopDetector;

/// Timeout for receiving vertices. Allows periodic shutdown checks.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Configuration for the loop closer.
#[derive(Debug, Clone)]
pub struct LoopCloserConfig {
    /// Vertex-id half-window excluded around the anchor, so
    /// recently-inserted poses are never candidates.
    pub window: u64,

    /// Maximum number of candidates handed to the detector.
    pub best_n: usize,
}

impl Default for LoopCloserConfig {
    fn default() -> Self {
        Self {
            window: 10,
            best_n: 5,
        }
    }
}

/// Counters for the loop closer.
#[derive(Debug, Default, Clone)]
pub struct LoopCloserStats {
    /// Vertices received from the intake worker.
    pub vertices_processed: usize,

    /// Candidates handed to the detector.
    pub candidates_considered: usize,

    /// Loop edges successfully inserted.
    pub loops_closed: usize,
}

/// The loop-closing worker.
pub struct LoopCloser {
    manager: GraphManager,
    detector: Box<dyn LoopDetector>,
    config: LoopCloserConfig,
    stats: LoopCloserStats,
}

impl LoopCloser {
    pub fn new(
        manager: GraphManager,
        detector: Box<dyn LoopDetector>,
        config: LoopCloserConfig,
    ) -> Self {
        Self {
            manager,
            detector,
            config,
            stats: LoopCloserStats::default(),
        }
    }

    /// Main worker loop: consume vertices until shutdown or disconnect.
    pub fn run(&mut self, vertex_rx: Receiver<NewVertexMsg>) {
        info!("loop closer started");

        loop {
            if self.manager.state() != ManagerState::Running {
                break;
            }

            match vertex_rx.recv_timeout(RECV_TIMEOUT) {
                Ok(msg) => self.process_vertex(msg),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    info!("loop closer channel disconnected");
                    break;
                }
            }
        }

        info!(
            processed = self.stats.vertices_processed,
            candidates = self.stats.candidates_considered,
            closed = self.stats.loops_closed,
            "loop closer exiting"
        );
    }

    /// Handle one newly created vertex.
    fn process_vertex(&mut self, msg: NewVertexMsg) {
        self.stats.vertices_processed += 1;
        self.detector.insert(msg.vertex_id, &msg.cluster);

        let candidates = self.manager.find_closest_vertices(
            msg.vertex_id,
            msg.vertex_id,
            self.config.window,
            self.config.best_n,
        );
        if candidates.is_empty() {
            return;
        }
        self.stats.candidates_considered += candidates.len();
        debug!(anchor = %msg.vertex_id, candidates = candidates.len(), "loop candidates");

        let constraint = match self.detector.verify(msg.vertex_id, &candidates) {
            Some(c) => c,
            None => return,
        };

        match self.manager.add_edge(
            constraint.matched,
            msg.vertex_id,
            constraint.transform,
            constraint.inliers,
        ) {
            Ok(()) => {
                self.stats.loops_closed += 1;
                info!(
                    anchor = %msg.vertex_id,
                    matched = %constraint.matched,
                    inliers = constraint.inliers,
                    "loop closed"
                );
                // Pull the correction into the map right away
                if let Err(e) = self.manager.update() {
                    warn!("post-loop optimization skipped: {e}");
                }
            }
            Err(e) => warn!("loop edge rejected: {e}"),
        }
    }

    pub fn stats(&self) -> &LoopCloserStats {
        &self.stats
    }
}
