//! Inter-thread message types.

use std::sync::Arc;

use crate::map::{Cluster, VertexId};

/// Message sent from the intake worker to the loop closer when a new
/// vertex is created.
///
/// Carries the originating cluster so the detector can index its
/// descriptors and geometry without going back to the graph.
pub struct NewVertexMsg {
    /// The id assigned to the new vertex.
    pub vertex_id: VertexId,

    /// The cluster the vertex was built from.
    pub cluster: Arc<Cluster>,
}
