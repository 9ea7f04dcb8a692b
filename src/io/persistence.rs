//! Graph persistence: snapshot save/load and trajectory export.
//!
//! The snapshot is a complete, internally consistent dump of vertex poses
//! and edges, enough to fully reconstruct the graph (ids, poses, edge
//! endpoints, weights, kinds). The caller is responsible for taking it
//! under the graph guarantee; the graph manager's `save_to_file` does so.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::geometry::SE3;
use crate::map::{Edge, EdgeKind, FrameId, GraphError, PoseGraph, Vertex, VertexId};

/// Serialized rigid transform: translation + quaternion [w, x, y, z].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseRecord {
    pub translation: [f64; 3],
    pub rotation: [f64; 4],
}

impl PoseRecord {
    fn from_se3(pose: &SE3) -> Self {
        let q = pose.rotation.quaternion();
        Self {
            translation: [pose.translation.x, pose.translation.y, pose.translation.z],
            rotation: [q.w, q.i, q.j, q.k],
        }
    }

    fn to_se3(&self) -> SE3 {
        let [tx, ty, tz] = self.translation;
        let [qw, qx, qy, qz] = self.rotation;
        SE3::from_quaternion(qw, qx, qy, qz, nalgebra::Vector3::new(tx, ty, tz))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VertexRecord {
    pub id: u64,
    pub frame_id: u64,
    pub pose: PoseRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub vertex_i: u64,
    pub vertex_j: u64,
    pub kind: EdgeKind,
    pub measurement: PoseRecord,
    pub weight: f64,
}

/// A complete dump of the graph state.
#[derive(Debug, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub vertices: Vec<VertexRecord>,
    pub edges: Vec<EdgeRecord>,
}

impl GraphSnapshot {
    /// Capture the current graph state. Vertices are sorted by id so the
    /// output is deterministic.
    pub fn capture(graph: &PoseGraph) -> Self {
        let mut vertices: Vec<VertexRecord> = graph
            .vertices()
            .map(|v| VertexRecord {
                id: v.id.0,
                frame_id: v.frame_id.0,
                pose: PoseRecord::from_se3(&v.pose),
            })
            .collect();
        vertices.sort_by_key(|v| v.id);

        let edges = graph
            .edges()
            .iter()
            .map(|e| EdgeRecord {
                vertex_i: e.vertex_i.0,
                vertex_j: e.vertex_j.0,
                kind: e.kind,
                measurement: PoseRecord::from_se3(&e.measurement),
                weight: e.weight,
            })
            .collect();

        Self { vertices, edges }
    }

    /// Rebuild a graph from this snapshot.
    ///
    /// Edge endpoints are validated the same way live insertion validates
    /// them; a dangling record fails the whole restore.
    pub fn restore(&self) -> Result<PoseGraph, GraphError> {
        let mut graph = PoseGraph::new();
        for v in &self.vertices {
            graph.insert_vertex(Vertex {
                id: VertexId::new(v.id),
                pose: v.pose.to_se3(),
                frame_id: FrameId::new(v.frame_id),
            });
        }
        for e in &self.edges {
            graph.insert_edge(Edge {
                vertex_i: VertexId::new(e.vertex_i),
                vertex_j: VertexId::new(e.vertex_j),
                measurement: e.measurement.to_se3(),
                weight: e.weight,
                kind: e.kind,
            })?;
        }
        Ok(graph)
    }
}

/// Write a graph snapshot to a YAML file.
pub fn save_graph<P: AsRef<Path>>(path: P, graph: &PoseGraph) -> Result<()> {
    let path = path.as_ref();
    let file =
        File::create(path).with_context(|| format!("Failed to create snapshot {:?}", path))?;
    serde_yaml::to_writer(file, &GraphSnapshot::capture(graph))
        .with_context(|| format!("Failed to write snapshot {:?}", path))
}

/// Load a graph from a YAML snapshot file.
pub fn load_graph<P: AsRef<Path>>(path: P) -> Result<PoseGraph> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("Failed to open snapshot {:?}", path))?;
    let snapshot: GraphSnapshot = serde_yaml::from_reader(file)
        .with_context(|| format!("Failed to parse snapshot {:?}", path))?;
    snapshot
        .restore()
        .with_context(|| format!("Inconsistent snapshot {:?}", path))
}

/// One row of the flat trajectory export.
#[derive(Debug, Serialize)]
struct TrajectoryRow {
    vertex_id: u64,
    frame_id: u64,
    tx: f64,
    ty: f64,
    tz: f64,
    qw: f64,
    qx: f64,
    qy: f64,
    qz: f64,
}

/// Export the vertex poses as a flat CSV trajectory, sorted by vertex id.
///
/// Companion output for offline evaluation tools; the YAML snapshot remains
/// the round-trippable format.
pub fn export_trajectory_csv<P: AsRef<Path>>(path: P, graph: &PoseGraph) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create trajectory file {:?}", path))?;

    let mut vertices: Vec<&Vertex> = graph.vertices().collect();
    vertices.sort_by_key(|v| v.id);

    for v in vertices {
        let q = v.pose.rotation.quaternion();
        writer.serialize(TrajectoryRow {
            vertex_id: v.id.0,
            frame_id: v.frame_id.0,
            tx: v.pose.translation.x,
            ty: v.pose.translation.y,
            tz: v.pose.translation.z,
            qw: q.w,
            qx: q.i,
            qy: q.j,
            qz: q.k,
        })?;
    }
    writer.flush()?;
    Ok(())
}
