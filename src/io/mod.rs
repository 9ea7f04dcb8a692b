//! Configuration loading and graph persistence.

pub mod config;
pub mod persistence;

pub use config::{CameraModel, SystemConfig};
pub use persistence::{export_trajectory_csv, load_graph, save_graph, GraphSnapshot};
