//! Nonlinear optimization of the pose graph.

pub mod pose_graph;

pub use pose_graph::{
    apply_outcome, collect_problem, LevenbergMarquardt, OptimizerConfig, PoseGraphProblem,
    PoseGraphSolver, SolveOutcome,
};
