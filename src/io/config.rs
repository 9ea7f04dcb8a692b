//! Static system configuration, loaded once at initialization.
//!
//! The back-end consumes a fixed camera-to-reference-frame offset and the
//! camera intrinsics. The intrinsics are carried for collaborators that
//! interpret geometric measurements (e.g. a detector reprojecting matches);
//! the graph logic itself never reads them.

use std::fs::File;
use std::path::Path;

use anyhow::{bail, Context, Result};
use nalgebra::Matrix4;
use serde::Deserialize;

use crate::geometry::SE3;

/// Pinhole camera intrinsics.
#[derive(Debug, Clone, Copy)]
pub struct CameraModel {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraModel {
    /// Project a camera-frame point to pixel coordinates.
    ///
    /// Returns `None` for points at or behind the camera plane.
    pub fn project(&self, p_cam: &nalgebra::Vector3<f64>) -> Option<(f64, f64)> {
        if p_cam.z <= 0.0 {
            return None;
        }
        let u = self.fx * p_cam.x / p_cam.z + self.cx;
        let v = self.fy * p_cam.y / p_cam.z + self.cy;
        Some((u, v))
    }
}

/// Camera section of the YAML config.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Camera model name. Only "pinhole" is interpreted.
    pub model: String,

    /// Intrinsics as [fx, fy, cx, cy].
    pub intrinsics: [f64; 4],
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            model: "pinhole".to_string(),
            intrinsics: [458.654, 457.296, 367.215, 248.375],
        }
    }
}

impl CameraConfig {
    pub fn camera_model(&self) -> CameraModel {
        let [fx, fy, cx, cy] = self.intrinsics;
        CameraModel { fx, fy, cx, cy }
    }
}

/// A 4x4 row-major transform block, the shape EuRoC-style calibration files
/// use for extrinsics.
#[derive(Debug, Clone, Deserialize)]
pub struct TransformBlock {
    pub data: Vec<f64>,
}

impl Default for TransformBlock {
    fn default() -> Self {
        Self {
            data: vec![
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0, //
                0.0, 0.0, 0.0, 1.0,
            ],
        }
    }
}

impl TransformBlock {
    pub fn to_se3(&self) -> Result<SE3> {
        if self.data.len() != 16 {
            bail!(
                "transform block must have 16 entries, got {}",
                self.data.len()
            );
        }
        let mat = Matrix4::from_row_slice(&self.data);
        Ok(SE3::from_matrix(mat))
    }
}

/// Graph tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphTuning {
    /// Vertex-id half-window excluded around a loop-candidate anchor, so
    /// recently-inserted poses are never treated as loop candidates.
    pub loop_window: u64,

    /// Maximum number of loop candidates handed to the detector.
    pub loop_candidates: usize,

    /// Frames between periodic optimization passes.
    pub optimize_every: u64,

    /// Capacity of the bounded vertex channel feeding the loop closer.
    pub channel_capacity: usize,
}

impl Default for GraphTuning {
    fn default() -> Self {
        Self {
            loop_window: 10,
            loop_candidates: 5,
            optimize_every: 10,
            channel_capacity: 5,
        }
    }
}

/// Top-level system configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub camera: CameraConfig,

    /// Fixed camera-to-reference-frame offset, composed into every initial
    /// vertex pose.
    pub camera_to_ref: TransformBlock,

    pub graph: GraphTuning,
}

impl SystemConfig {
    /// Load a configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("Failed to open config {:?}", path))?;
        serde_yaml::from_reader(file).with_context(|| format!("Failed to parse config {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    #[test]
    fn test_default_transform_is_identity() {
        let se3 = SystemConfig::default().camera_to_ref.to_se3().unwrap();
        assert_relative_eq!(se3.translation.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_transform_block_wrong_length() {
        let block = TransformBlock { data: vec![1.0; 9] };
        assert!(block.to_se3().is_err());
    }

    #[test]
    fn test_transform_block_row_major() {
        // Identity rotation with translation (1, 2, 3)
        let block = TransformBlock {
            data: vec![
                1.0, 0.0, 0.0, 1.0, //
                0.0, 1.0, 0.0, 2.0, //
                0.0, 0.0, 1.0, 3.0, //
                0.0, 0.0, 0.0, 1.0,
            ],
        };
        let se3 = block.to_se3().unwrap();
        assert_relative_eq!(se3.translation, Vector3::new(1.0, 2.0, 3.0), epsilon = 1e-12);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
camera:
  model: pinhole
  intrinsics: [400.0, 400.0, 320.0, 240.0]
graph:
  loop_window: 4
  loop_candidates: 2
"#;
        let config: SystemConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.camera.camera_model().fx, 400.0);
        assert_eq!(config.graph.loop_window, 4);
        assert_eq!(config.graph.loop_candidates, 2);
        // Unspecified fields fall back to defaults
        assert_eq!(config.graph.optimize_every, 10);
    }

    #[test]
    fn test_project() {
        let cam = CameraModel {
            fx: 100.0,
            fy: 100.0,
            cx: 320.0,
            cy: 240.0,
        };
        let (u, v) = cam.project(&Vector3::new(1.0, 0.5, 2.0)).unwrap();
        assert_relative_eq!(u, 370.0, epsilon = 1e-12);
        assert_relative_eq!(v, 265.0, epsilon = 1e-12);

        assert!(cam.project(&Vector3::new(0.0, 0.0, -1.0)).is_none());
    }
}
