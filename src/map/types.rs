//! Core ID types for the pose graph.

/// Unique identifier for a graph vertex.
///
/// VertexIds are assigned sequentially when vertices are created. They serve
/// as lightweight handles for cross-referencing without needing Arc/Rc,
/// which simplifies ownership and avoids cyclic references between vertices
/// and their incident edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VertexId(pub u64);

impl VertexId {
    /// Create a new VertexId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for VertexId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "V{}", self.0)
    }
}

/// Unique identifier for a camera frame produced by the front-end.
///
/// One frame may yield several vertices when its observations are split
/// into clusters, so the graph keeps a frame → vertices index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u64);

impl FrameId {
    /// Create a new FrameId with the given value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for FrameId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "F{}", self.0)
    }
}

/// Identifier of a cluster, unique within its owning frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterId(pub u32);

impl ClusterId {
    /// Create a new ClusterId with the given value.
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "C{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_id_equality() {
        let id1 = VertexId::new(42);
        let id2 = VertexId::new(42);
        let id3 = VertexId::new(43);

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(format!("{}", VertexId::new(7)), "V7");
        assert_eq!(format!("{}", FrameId::new(3)), "F3");
        assert_eq!(format!("{}", ClusterId::new(0)), "C0");
    }

    #[test]
    fn test_id_as_hashmap_key() {
        use std::collections::HashMap;

        let mut map: HashMap<VertexId, &str> = HashMap::new();
        map.insert(VertexId::new(1), "first");
        map.insert(VertexId::new(2), "second");

        assert_eq!(map.get(&VertexId::new(1)), Some(&"first"));
        assert_eq!(map.get(&VertexId::new(3)), None);
    }
}
