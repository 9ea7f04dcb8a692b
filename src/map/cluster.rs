//! Cluster - an immutable bundle of features captured at one camera pose.
//!
//! The front-end partitions each frame's observations into clusters. A
//! cluster carries the 2D keypoints, two descriptor representations (a
//! compact binary code for fast matching and a real-valued vector for
//! precise matching), the corresponding 3D points in camera-local
//! coordinates, and the camera pose at capture time.
//!
//! Clusters are read-only after construction; the loop-closing detector
//! matches against them long after the originating frame is gone.

use nalgebra::Vector3;

use crate::geometry::SE3;

use super::types::{ClusterId, FrameId};

/// A 2D image feature location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeyPoint {
    pub x: f32,
    pub y: f32,
}

impl KeyPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Compact binary descriptor row (one per keypoint), for fast matching.
pub type BinaryDescriptor = Vec<u8>;

/// Real-valued descriptor row (one per keypoint), for precise matching.
pub type RealDescriptor = Vec<f32>;

/// An immutable cluster of keypoints captured at one camera pose.
#[derive(Debug, Clone)]
pub struct Cluster {
    id: ClusterId,
    frame_id: FrameId,
    pose: SE3,
    keypoints: Vec<KeyPoint>,
    binary_descriptors: Vec<BinaryDescriptor>,
    real_descriptors: Vec<RealDescriptor>,
    camera_points: Vec<Vector3<f64>>,
}

impl Cluster {
    /// Create a new cluster.
    ///
    /// The descriptor sequences are parallel to `keypoints` (one row per
    /// keypoint); `camera_points` holds the triangulated 3D points for the
    /// keypoint subset used for geometry.
    pub fn new(
        id: ClusterId,
        frame_id: FrameId,
        pose: SE3,
        keypoints: Vec<KeyPoint>,
        binary_descriptors: Vec<BinaryDescriptor>,
        real_descriptors: Vec<RealDescriptor>,
        camera_points: Vec<Vector3<f64>>,
    ) -> Self {
        debug_assert_eq!(keypoints.len(), binary_descriptors.len());
        debug_assert_eq!(keypoints.len(), real_descriptors.len());

        Self {
            id,
            frame_id,
            pose,
            keypoints,
            binary_descriptors,
            real_descriptors,
            camera_points,
        }
    }

    /// Get the cluster id.
    pub fn id(&self) -> ClusterId {
        self.id
    }

    /// Get the owning frame id.
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Get the camera pose at capture time.
    pub fn pose(&self) -> &SE3 {
        &self.pose
    }

    /// Get the keypoints.
    pub fn keypoints(&self) -> &[KeyPoint] {
        &self.keypoints
    }

    /// Get the binary descriptors.
    pub fn binary_descriptors(&self) -> &[BinaryDescriptor] {
        &self.binary_descriptors
    }

    /// Get the real-valued descriptors.
    pub fn real_descriptors(&self) -> &[RealDescriptor] {
        &self.real_descriptors
    }

    /// Get the 3D points in the camera frame.
    pub fn camera_points(&self) -> &[Vector3<f64>] {
        &self.camera_points
    }

    /// Compute the 3D points in world coordinates.
    ///
    /// Each camera-frame point is mapped through the capture pose. Returns
    /// an empty vector when the cluster has no geometry.
    pub fn world_points(&self) -> Vec<Vector3<f64>> {
        self.pose.transform_points(&self.camera_points)
    }
}
