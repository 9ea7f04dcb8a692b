//! PoseGraph - the vertex/edge aggregate at the heart of the back-end.
//!
//! Vertices hold camera pose estimates; edges hold measured relative
//! transforms with a confidence weight. The graph also maintains the
//! frame → vertices index (one frame may yield several vertices when its
//! observations are split into clusters) and the tail of the sequential
//! chain used to link consecutive vertices.
//!
//! The graph is a plain data structure: all synchronization lives in the
//! shared state that owns it. Edges store ids rather than references, so
//! there are no ownership cycles between vertices and their incident edges.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::SE3;

use super::types::{FrameId, VertexId};

/// Non-fatal errors reported by graph operations.
///
/// None of these corrupt shared state: the failing call leaves the graph
/// exactly as it found it.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    /// An edge referenced a vertex id that was never created.
    #[error("unknown vertex {0}")]
    UnknownVertex(VertexId),

    /// The optimizer failed to reach an acceptable solution; the previous
    /// pose estimates were retained.
    #[error("pose graph optimization did not converge")]
    NotConverged,

    /// A structural mutation was attempted after shutdown began.
    #[error("graph manager is shutting down")]
    ShuttingDown,
}

/// A graph node holding one camera pose estimate.
#[derive(Debug, Clone)]
pub struct Vertex {
    /// Unique, stable id. Never reused.
    pub id: VertexId,

    /// Pose estimate. Overwritten in place by the optimization cycle.
    pub pose: SE3,

    /// The frame this vertex originated from.
    pub frame_id: FrameId,
}

/// Edge provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    /// Connects temporally consecutive vertices (odometry-derived).
    Sequential,
    /// Connects non-consecutive vertices after place-revisit verification.
    Loop,
}

/// A constraint between two vertices.
#[derive(Debug, Clone)]
pub struct Edge {
    /// First endpoint.
    pub vertex_i: VertexId,

    /// Second endpoint.
    pub vertex_j: VertexId,

    /// Measured relative transform from i to j.
    pub measurement: SE3,

    /// Confidence weight (information): higher inlier support means a
    /// tighter constraint in the optimizer.
    pub weight: f64,

    /// Edge provenance.
    pub kind: EdgeKind,
}

/// Map a verified inlier count to a confidence weight.
///
/// Monotonically increasing; floored at 1 so even a weak measurement
/// contributes a usable constraint.
pub fn confidence_from_inliers(inliers: usize) -> f64 {
    (inliers as f64).max(1.0)
}

/// The pose graph: vertex arena, append-only edge list, and indices.
#[derive(Debug, Default)]
pub struct PoseGraph {
    /// All vertices, keyed by id.
    vertices: HashMap<VertexId, Vertex>,

    /// All edges, in insertion order. Append-only.
    edges: Vec<Edge>,

    /// Counter for generating unique vertex ids.
    next_vertex_id: u64,

    /// Frame → vertices reverse index.
    frame_index: HashMap<FrameId, Vec<VertexId>>,

    /// Most recently created vertex (tail of the sequential chain).
    last_vertex_id: Option<VertexId>,
}

impl PoseGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Vertex operations
    // ─────────────────────────────────────────────────────────────────────

    /// Create a new vertex with the given pose estimate.
    ///
    /// Ids are assigned in strictly increasing order starting from 0, with
    /// no gaps and no reuse. The frame index is updated atomically with the
    /// insertion. Always succeeds.
    pub fn add_vertex(&mut self, pose: SE3, frame_id: FrameId) -> VertexId {
        let id = VertexId::new(self.next_vertex_id);
        self.next_vertex_id += 1;

        self.vertices.insert(
            id,
            Vertex {
                id,
                pose,
                frame_id,
            },
        );
        self.frame_index.entry(frame_id).or_default().push(id);
        self.last_vertex_id = Some(id);
        id
    }

    /// Insert an existing vertex, preserving its id.
    ///
    /// Restore path for snapshot loading; bumps the id counter past the
    /// restored id so later `add_vertex` calls stay unique.
    pub fn insert_vertex(&mut self, vertex: Vertex) {
        if vertex.id.0 >= self.next_vertex_id {
            self.next_vertex_id = vertex.id.0 + 1;
        }
        self.frame_index
            .entry(vertex.frame_id)
            .or_default()
            .push(vertex.id);
        if self.last_vertex_id.map_or(true, |last| vertex.id > last) {
            self.last_vertex_id = Some(vertex.id);
        }
        self.vertices.insert(vertex.id, vertex);
    }

    /// Get a vertex by id.
    pub fn vertex(&self, id: VertexId) -> Option<&Vertex> {
        self.vertices.get(&id)
    }

    /// Get a vertex's current pose estimate.
    pub fn vertex_pose(&self, id: VertexId) -> Option<SE3> {
        self.vertices.get(&id).map(|v| v.pose.clone())
    }

    /// Overwrite a vertex's pose estimate (optimization write-back).
    pub fn set_vertex_pose(&mut self, id: VertexId, pose: SE3) -> Result<(), GraphError> {
        match self.vertices.get_mut(&id) {
            Some(v) => {
                v.pose = pose;
                Ok(())
            }
            None => Err(GraphError::UnknownVertex(id)),
        }
    }

    /// Number of vertices.
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Iterate over all vertices (unordered).
    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.vertices.values()
    }

    /// The most recently created vertex, if any.
    pub fn last_vertex_id(&self) -> Option<VertexId> {
        self.last_vertex_id
    }

    // ─────────────────────────────────────────────────────────────────────
    // Edge operations
    // ─────────────────────────────────────────────────────────────────────

    /// Append an edge between two existing vertices.
    ///
    /// The confidence weight is derived from `inliers`. If either endpoint
    /// is unknown the call reports `UnknownVertex` and the graph is left
    /// unchanged.
    pub fn add_edge(
        &mut self,
        vertex_i: VertexId,
        vertex_j: VertexId,
        measurement: SE3,
        inliers: usize,
        kind: EdgeKind,
    ) -> Result<(), GraphError> {
        self.insert_edge(Edge {
            vertex_i,
            vertex_j,
            measurement,
            weight: confidence_from_inliers(inliers),
            kind,
        })
    }

    /// Append a fully-formed edge (restore path; weight taken as-is).
    pub fn insert_edge(&mut self, edge: Edge) -> Result<(), GraphError> {
        if !self.vertices.contains_key(&edge.vertex_i) {
            return Err(GraphError::UnknownVertex(edge.vertex_i));
        }
        if !self.vertices.contains_key(&edge.vertex_j) {
            return Err(GraphError::UnknownVertex(edge.vertex_j));
        }
        self.edges.push(edge);
        Ok(())
    }

    /// Number of edges.
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// All edges, in insertion order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Vertices originating from the given frame.
    ///
    /// Unknown frames return an empty list: a frame may legitimately have
    /// produced no vertices, or may not have been processed yet.
    pub fn frame_vertices(&self, frame_id: FrameId) -> Vec<VertexId> {
        self.frame_index.get(&frame_id).cloned().unwrap_or_default()
    }

    /// Find the vertices spatially closest to `vertex_id`, excluding a
    /// window of recent ids.
    ///
    /// Every vertex whose id lies in `[window_center - window,
    /// window_center + window]` is discarded, so trivially-nearby recent
    /// poses never become loop candidates. Returns up to `best_n` ids
    /// sorted by ascending Euclidean distance between pose translations,
    /// ties broken by ascending id. Read-only; an unknown anchor yields an
    /// empty list.
    pub fn find_closest_vertices(
        &self,
        vertex_id: VertexId,
        window_center: VertexId,
        window: u64,
        best_n: usize,
    ) -> Vec<VertexId> {
        let anchor = match self.vertices.get(&vertex_id) {
            Some(v) => &v.pose.translation,
            None => return Vec::new(),
        };

        let lo = window_center.0.saturating_sub(window);
        let hi = window_center.0.saturating_add(window);

        let mut candidates: Vec<(f64, VertexId)> = self
            .vertices
            .values()
            .filter(|v| v.id != vertex_id && (v.id.0 < lo || v.id.0 > hi))
            .map(|v| ((v.pose.translation - anchor).norm(), v.id))
            .collect();

        candidates.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.1.cmp(&b.1))
        });
        candidates.truncate(best_n);
        candidates.into_iter().map(|(_, id)| id).collect()
    }

    /// Clear the entire graph (full reset).
    pub fn clear(&mut self) {
        self.vertices.clear();
        self.edges.clear();
        self.frame_index.clear();
        self.next_vertex_id = 0;
        self.last_vertex_id = None;
    }
}
