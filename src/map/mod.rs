//! Map data entities: frames, clusters, and the pose graph.

pub mod cluster;
pub mod frame;
pub mod pose_graph;
pub mod types;

pub use cluster::{BinaryDescriptor, Cluster, KeyPoint, RealDescriptor};
pub use frame::Frame;
pub use pose_graph::{confidence_from_inliers, Edge, EdgeKind, GraphError, PoseGraph, Vertex};
pub use types::{ClusterId, FrameId, VertexId};
