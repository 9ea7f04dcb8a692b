//! Pose graph optimization.
//!
//! Nonlinear least-squares refinement of all vertex poses against the edge
//! constraints, weighted by each edge's confidence.
//!
//! This module uses the three-phase pattern:
//! 1. COLLECT: extract poses and edges from the graph
//! 2. SOLVE: run LM optimization
//! 3. APPLY: write back optimized poses
//!
//! The solver itself sits behind [`PoseGraphSolver`] so the graph manager
//! depends only on its contract: it either returns a complete fresh pose
//! set or nothing at all; it never partially mutates anything.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::geometry::SE3;
use crate::map::{Edge, PoseGraph, VertexId};

/// Tangent-space parameters per pose: 3 rotation + 3 translation.
const PARAMS_PER_POSE: usize = 6;

/// Configuration for pose graph optimization.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Maximum number of LM iterations.
    pub max_iterations: usize,

    /// Convergence threshold on parameter change.
    pub param_tolerance: f64,

    /// Convergence threshold on gradient norm.
    pub gradient_tolerance: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            param_tolerance: 1e-6,
            gradient_tolerance: 1e-6,
        }
    }
}

/// Data extracted for one optimization pass.
pub struct PoseGraphProblem {
    /// Vertex ids in optimization order (ascending).
    pub vertex_ids: Vec<VertexId>,

    /// Initial pose estimate for each vertex.
    pub initial_poses: HashMap<VertexId, SE3>,

    /// Edge constraints.
    pub edges: Vec<Edge>,

    /// The anchored vertex held fixed during optimization.
    pub fixed_vertex: VertexId,
}

/// Result of one optimization pass.
pub struct SolveOutcome {
    /// Optimized pose for every vertex in the problem.
    pub optimized_poses: HashMap<VertexId, SE3>,

    /// Number of iterations run.
    pub iterations: usize,

    /// Weighted residual norm before optimization.
    pub initial_error: f64,

    /// Weighted residual norm after optimization.
    pub final_error: f64,
}

/// An opaque nonlinear least-squares engine.
///
/// Contract: `solve` returns `None` when there is nothing to optimize or no
/// acceptable solution was found; it never partially mutates state, so a
/// failed solve leaves the caller's poses untouched by construction.
pub trait PoseGraphSolver: Send + Sync {
    fn solve(&self, problem: &PoseGraphProblem) -> Option<SolveOutcome>;
}

/// PHASE 1: Collect the optimization problem from the graph.
///
/// The lowest vertex id is anchored, fixing the gauge freedom. Returns
/// `None` for an empty graph.
pub fn collect_problem(graph: &PoseGraph) -> Option<PoseGraphProblem> {
    let mut vertex_ids: Vec<VertexId> = graph.vertices().map(|v| v.id).collect();
    if vertex_ids.is_empty() {
        return None;
    }
    vertex_ids.sort();

    let fixed_vertex = vertex_ids[0];
    let initial_poses = graph.vertices().map(|v| (v.id, v.pose.clone())).collect();

    Some(PoseGraphProblem {
        vertex_ids,
        initial_poses,
        edges: graph.edges().to_vec(),
        fixed_vertex,
    })
}

/// PHASE 3: Write optimized poses back into the graph.
///
/// Returns the number of vertices updated.
pub fn apply_outcome(graph: &mut PoseGraph, outcome: &SolveOutcome) -> usize {
    let mut updated = 0;
    for (id, pose) in &outcome.optimized_poses {
        if graph.set_vertex_pose(*id, pose.clone()).is_ok() {
            updated += 1;
        }
    }
    updated
}

/// Levenberg-Marquardt solver over the 6-DOF SE3 tangent space.
///
/// Residual per edge: `log(measurement⁻¹ ∘ (pose_i⁻¹ ∘ pose_j))`, scaled by
/// the square root of the edge weight. Jacobians are computed by central
/// differences. Only improving steps are accepted, so a repeated solve on
/// an unchanged problem never increases the residual.
pub struct LevenbergMarquardt {
    config: OptimizerConfig,
}

impl LevenbergMarquardt {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self::new(OptimizerConfig::default())
    }
}

impl PoseGraphSolver for LevenbergMarquardt {
    fn solve(&self, problem: &PoseGraphProblem) -> Option<SolveOutcome> {
        let n_poses = problem.vertex_ids.len();
        if n_poses < 2 || problem.edges.is_empty() {
            return None;
        }

        // Vertex id → dense index
        let id_to_idx: HashMap<VertexId, usize> = problem
            .vertex_ids
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .collect();

        let fixed_idx = *id_to_idx.get(&problem.fixed_vertex)?;

        // Index → parameter block, skipping the fixed pose
        let mut idx_to_param: HashMap<usize, usize> = HashMap::new();
        let mut param_idx = 0;
        for vertex_idx in 0..n_poses {
            if vertex_idx != fixed_idx {
                idx_to_param.insert(vertex_idx, param_idx);
                param_idx += 1;
            }
        }

        let n_params = (n_poses - 1) * PARAMS_PER_POSE;

        // Initialize parameters from the current estimates
        let mut params = DVector::zeros(n_params);
        for (vertex_idx, id) in problem.vertex_ids.iter().enumerate() {
            if vertex_idx == fixed_idx {
                continue;
            }
            let offset = idx_to_param[&vertex_idx] * PARAMS_PER_POSE;
            if let Some(pose) = problem.initial_poses.get(id) {
                let tangent = pose.log();
                for i in 0..PARAMS_PER_POSE {
                    params[offset + i] = tangent[i];
                }
            }
        }

        let fixed_pose = problem
            .initial_poses
            .get(&problem.fixed_vertex)
            .cloned()
            .unwrap_or_else(SE3::identity);

        let ctx = ProblemContext {
            edges: &problem.edges,
            id_to_idx: &id_to_idx,
            idx_to_param: &idx_to_param,
            fixed_pose: &fixed_pose,
            fixed_idx,
        };

        let initial_error = compute_error(&params, &ctx);

        // LM iterations
        let mut current_params = params;
        let mut lambda = 1e-3;
        let lambda_up = 10.0;
        let lambda_down = 0.1;
        let min_lambda = 1e-10;
        let max_lambda = 1e10;
        let mut iterations = 0;

        for iter in 0..self.config.max_iterations {
            iterations = iter + 1;

            let (residuals, jacobian) = compute_residuals_and_jacobian(&current_params, &ctx);
            let current_error = residuals.norm_squared();

            let gradient = jacobian.transpose() * &residuals;
            let jtj = jacobian.transpose() * &jacobian;

            if gradient.norm() < self.config.gradient_tolerance {
                break;
            }

            // Damped system
            let mut damped_jtj = jtj.clone();
            for i in 0..n_params {
                damped_jtj[(i, i)] += lambda * damped_jtj[(i, i)].max(1e-6);
            }

            let delta = match damped_jtj.lu().solve(&(-&gradient)) {
                Some(d) => d,
                None => break,
            };

            if delta.norm()
                < self.config.param_tolerance
                    * (current_params.norm() + self.config.param_tolerance)
            {
                break;
            }

            // Trial step: accept only if it improves the error
            let trial_params = &current_params + &delta;
            let trial_error = compute_error(&trial_params, &ctx);

            if trial_error < current_error {
                current_params = trial_params;
                lambda = (lambda * lambda_down).max(min_lambda);
            } else {
                lambda = (lambda * lambda_up).min(max_lambda);
            }
        }

        let final_error = compute_error(&current_params, &ctx);
        if !final_error.is_finite() {
            return None;
        }

        // Extract optimized poses
        let mut optimized_poses = HashMap::new();
        optimized_poses.insert(problem.fixed_vertex, fixed_pose.clone());
        for (vertex_idx, &id) in problem.vertex_ids.iter().enumerate() {
            if vertex_idx == fixed_idx {
                continue;
            }
            optimized_poses.insert(id, pose_from_params(&current_params, vertex_idx, &ctx));
        }

        debug!(
            iterations,
            initial_error = initial_error.sqrt(),
            final_error = final_error.sqrt(),
            "pose graph solve finished"
        );

        Some(SolveOutcome {
            optimized_poses,
            iterations,
            initial_error: initial_error.sqrt(),
            final_error: final_error.sqrt(),
        })
    }
}

/// Borrowed problem indices shared by the error/Jacobian helpers.
struct ProblemContext<'a> {
    edges: &'a [Edge],
    id_to_idx: &'a HashMap<VertexId, usize>,
    idx_to_param: &'a HashMap<usize, usize>,
    fixed_pose: &'a SE3,
    fixed_idx: usize,
}

/// Get a pose from the parameter vector (or the fixed anchor).
fn pose_from_params(params: &DVector<f64>, vertex_idx: usize, ctx: &ProblemContext) -> SE3 {
    if vertex_idx == ctx.fixed_idx {
        return ctx.fixed_pose.clone();
    }

    let offset = ctx.idx_to_param[&vertex_idx] * PARAMS_PER_POSE;
    let mut tangent = [0.0; PARAMS_PER_POSE];
    for (i, t) in tangent.iter_mut().enumerate() {
        *t = params[offset + i];
    }
    SE3::exp(&tangent)
}

/// Residual of one edge given the two endpoint poses.
fn edge_error(edge: &Edge, pose_i: &SE3, pose_j: &SE3) -> [f64; PARAMS_PER_POSE] {
    let predicted = pose_i.inverse().compose(pose_j);
    edge.measurement.inverse().compose(&predicted).log()
}

/// Total weighted squared error.
fn compute_error(params: &DVector<f64>, ctx: &ProblemContext) -> f64 {
    let mut total_error = 0.0;

    for edge in ctx.edges {
        let idx_i = ctx.id_to_idx[&edge.vertex_i];
        let idx_j = ctx.id_to_idx[&edge.vertex_j];

        let pose_i = pose_from_params(params, idx_i, ctx);
        let pose_j = pose_from_params(params, idx_j, ctx);

        let error_vec = edge_error(edge, &pose_i, &pose_j);
        let error_sq: f64 = error_vec.iter().map(|e| e * e).sum();
        total_error += error_sq * edge.weight;
    }

    total_error
}

/// Residual vector and central-difference Jacobian.
fn compute_residuals_and_jacobian(
    params: &DVector<f64>,
    ctx: &ProblemContext,
) -> (DVector<f64>, DMatrix<f64>) {
    let n_residuals = ctx.edges.len() * PARAMS_PER_POSE;
    let n_params = params.len();

    let mut residuals = DVector::zeros(n_residuals);
    let mut jacobian = DMatrix::zeros(n_residuals, n_params);

    let eps = 1e-6;

    for (edge_idx, edge) in ctx.edges.iter().enumerate() {
        let idx_i = ctx.id_to_idx[&edge.vertex_i];
        let idx_j = ctx.id_to_idx[&edge.vertex_j];

        let pose_i = pose_from_params(params, idx_i, ctx);
        let pose_j = pose_from_params(params, idx_j, ctx);

        let error_vec = edge_error(edge, &pose_i, &pose_j);
        let weight_sqrt = edge.weight.sqrt();
        let res_offset = edge_idx * PARAMS_PER_POSE;

        for i in 0..PARAMS_PER_POSE {
            residuals[res_offset + i] = error_vec[i] * weight_sqrt;
        }

        for endpoint_idx in [idx_i, idx_j] {
            if endpoint_idx == ctx.fixed_idx {
                continue;
            }
            let col_offset = ctx.idx_to_param[&endpoint_idx] * PARAMS_PER_POSE;

            for p in 0..PARAMS_PER_POSE {
                let mut params_plus = params.clone();
                let mut params_minus = params.clone();
                params_plus[col_offset + p] += eps;
                params_minus[col_offset + p] -= eps;

                let perturbed_plus = pose_from_params(&params_plus, endpoint_idx, ctx);
                let perturbed_minus = pose_from_params(&params_minus, endpoint_idx, ctx);

                // The perturbed pose stays on the side it occupies in the edge
                let (err_plus, err_minus) = if endpoint_idx == idx_i {
                    (
                        edge_error(edge, &perturbed_plus, &pose_j),
                        edge_error(edge, &perturbed_minus, &pose_j),
                    )
                } else {
                    (
                        edge_error(edge, &pose_i, &perturbed_plus),
                        edge_error(edge, &pose_i, &perturbed_minus),
                    )
                };

                for r in 0..PARAMS_PER_POSE {
                    jacobian[(res_offset + r, col_offset + p)] =
                        (err_plus[r] - err_minus[r]) / (2.0 * eps) * weight_sqrt;
                }
            }
        }
    }

    (residuals, jacobian)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{EdgeKind, FrameId};
    use nalgebra::Vector3;

    fn pose_at(x: f64, y: f64, z: f64) -> SE3 {
        SE3 {
            translation: Vector3::new(x, y, z),
            ..SE3::identity()
        }
    }

    /// Chain of vertices with consistent sequential measurements: already
    /// at the optimum.
    fn consistent_chain(n: u64) -> PoseGraph {
        let mut graph = PoseGraph::new();
        let mut prev = None;
        for i in 0..n {
            let pose = pose_at(i as f64, 0.0, 0.0);
            let id = graph.add_vertex(pose.clone(), FrameId::new(i));
            if let Some(p) = prev {
                let rel = graph.vertex_pose(p).unwrap().between(&pose);
                graph.add_edge(p, id, rel, 100, EdgeKind::Sequential).unwrap();
            }
            prev = Some(id);
        }
        graph
    }

    /// Chain whose estimates have drifted away from the measurements, plus
    /// a strong loop constraint between the first and last vertex.
    fn drifted_loop_graph() -> PoseGraph {
        let mut graph = PoseGraph::new();
        let mut prev = None;
        for i in 0..5u64 {
            // Drift grows linearly along y
            let est = pose_at(i as f64, 0.1 * i as f64, 0.0);
            let id = graph.add_vertex(est, FrameId::new(i));
            if let Some(p) = prev {
                // Measurements say pure x steps
                graph
                    .add_edge(p, id, pose_at(1.0, 0.0, 0.0), 100, EdgeKind::Sequential)
                    .unwrap();
            }
            prev = Some(id);
        }
        // The loop measurement agrees with the sequential chain
        graph
            .add_edge(
                VertexId::new(0),
                VertexId::new(4),
                pose_at(4.0, 0.0, 0.0),
                300,
                EdgeKind::Loop,
            )
            .unwrap();
        graph
    }

    #[test]
    fn test_collect_problem_empty_graph() {
        let graph = PoseGraph::new();
        assert!(collect_problem(&graph).is_none());
    }

    #[test]
    fn test_collect_problem_anchors_lowest_id() {
        let graph = consistent_chain(3);
        let problem = collect_problem(&graph).unwrap();
        assert_eq!(problem.fixed_vertex, VertexId::new(0));
        assert_eq!(problem.vertex_ids.len(), 3);
        assert_eq!(problem.edges.len(), 2);
    }

    #[test]
    fn test_solve_consistent_chain_stays_put() {
        let graph = consistent_chain(4);
        let problem = collect_problem(&graph).unwrap();
        let solver = LevenbergMarquardt::default();
        let outcome = solver.solve(&problem).unwrap();

        assert!(outcome.final_error <= outcome.initial_error + 1e-12);
        assert!(outcome.final_error < 1e-6);

        // Poses should stay where they were
        for (id, pose) in &outcome.optimized_poses {
            let initial = &problem.initial_poses[id];
            assert!((pose.translation - initial.translation).norm() < 1e-4);
        }
    }

    #[test]
    fn test_solve_reduces_loop_discrepancy() {
        let mut graph = drifted_loop_graph();
        let problem = collect_problem(&graph).unwrap();

        // Discrepancy between the measured loop transform and the one
        // implied by the current endpoint estimates
        let loop_meas = pose_at(4.0, 0.0, 0.0);
        let discrepancy = |g: &PoseGraph| {
            let p0 = g.vertex_pose(VertexId::new(0)).unwrap();
            let p4 = g.vertex_pose(VertexId::new(4)).unwrap();
            (p0.between(&p4).translation - loop_meas.translation).norm()
        };
        let before = discrepancy(&graph);

        let solver = LevenbergMarquardt::default();
        let outcome = solver.solve(&problem).unwrap();
        assert!(outcome.final_error < outcome.initial_error);

        apply_outcome(&mut graph, &outcome);
        let after = discrepancy(&graph);
        assert!(after < before);
    }

    #[test]
    fn test_repeated_solve_does_not_worsen() {
        let mut graph = drifted_loop_graph();
        let solver = LevenbergMarquardt::default();

        let first = solver.solve(&collect_problem(&graph).unwrap()).unwrap();
        apply_outcome(&mut graph, &first);

        let second = solver.solve(&collect_problem(&graph).unwrap()).unwrap();
        assert!(second.final_error <= second.initial_error + 1e-12);
        assert!(second.final_error <= first.final_error + 1e-9);
    }

    #[test]
    fn test_solve_single_vertex_is_none() {
        let mut graph = PoseGraph::new();
        graph.add_vertex(SE3::identity(), FrameId::new(0));
        let problem = collect_problem(&graph).unwrap();
        assert!(LevenbergMarquardt::default().solve(&problem).is_none());
    }
}
