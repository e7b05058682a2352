//! Levenberg-Marquardt algorithm implementation.
//!
//! Each iteration solves the damped normal equations
//! `(JᵀJ + λI) δ = -Jᵀr` with sparse Cholesky, applies `δ` through the
//! parameter blocks' manifolds and accepts or rejects it based on the ratio of
//! actual to predicted cost reduction.

use std::fmt;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::{ColumnLayout, Problem};
use crate::linalg::{FaerMatrix, SparseCholeskySolver, SparseLinearSolver, SparseMatrix};
use crate::optimizer::{OptimizationStatus, OptimizerError, OptimizerResult};

/// Configuration for the Levenberg-Marquardt solver.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtConfig {
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Relative cost change below which the solve stops
    pub cost_tolerance: f64,
    /// Relative step size below which the solve stops
    pub parameter_tolerance: f64,
    /// Gradient max-norm below which the solve stops
    pub gradient_tolerance: f64,
    pub initial_damping: f64,
    pub damping_min: f64,
    pub damping_max: f64,
    pub damping_increase_factor: f64,
    pub damping_decrease_factor: f64,
    /// Steps with a gain ratio at or below this are rejected
    pub min_step_quality: f64,
    /// Steps with a gain ratio above this shrink the damping
    pub good_step_quality: f64,
    pub timeout: Option<Duration>,
}

impl Default for LevenbergMarquardtConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            cost_tolerance: 1e-12,
            parameter_tolerance: 1e-12,
            gradient_tolerance: 1e-12,
            initial_damping: 1e-4,
            damping_min: 1e-12,
            damping_max: 1e12,
            damping_increase_factor: 10.0,
            damping_decrease_factor: 0.3,
            min_step_quality: 0.0,
            good_step_quality: 0.75,
            timeout: None,
        }
    }
}

impl LevenbergMarquardtConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_cost_tolerance(mut self, cost_tolerance: f64) -> Self {
        self.cost_tolerance = cost_tolerance;
        self
    }

    pub fn with_parameter_tolerance(mut self, parameter_tolerance: f64) -> Self {
        self.parameter_tolerance = parameter_tolerance;
        self
    }

    pub fn with_gradient_tolerance(mut self, gradient_tolerance: f64) -> Self {
        self.gradient_tolerance = gradient_tolerance;
        self
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.initial_damping = damping;
        self
    }

    pub fn with_damping_bounds(mut self, min: f64, max: f64) -> Self {
        self.damping_min = min;
        self.damping_max = max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Summary statistics for the Levenberg-Marquardt optimization process.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardtSummary {
    pub status: OptimizationStatus,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    /// Steps that decreased the cost
    pub successful_steps: usize,
    /// Steps rejected with increased damping
    pub unsuccessful_steps: usize,
    pub final_damping: f64,
    pub final_gradient_norm: f64,
    pub final_parameter_update_norm: f64,
    pub total_time: Duration,
}

impl fmt::Display for LevenbergMarquardtSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Levenberg-Marquardt Optimization Summary ===")?;
        writeln!(f, "Status:                    {}", self.status)?;
        writeln!(f, "Initial cost:              {:.6e}", self.initial_cost)?;
        writeln!(f, "Final cost:                {:.6e}", self.final_cost)?;
        writeln!(
            f,
            "Cost reduction:            {:.6e} ({:.2}%)",
            self.initial_cost - self.final_cost,
            100.0 * (self.initial_cost - self.final_cost) / self.initial_cost.max(1e-12)
        )?;
        writeln!(f, "Total iterations:          {}", self.iterations)?;
        writeln!(f, "Successful steps:          {}", self.successful_steps)?;
        writeln!(f, "Unsuccessful steps:        {}", self.unsuccessful_steps)?;
        writeln!(f, "Final damping parameter:   {:.6e}", self.final_damping)?;
        writeln!(f, "Final gradient norm:       {:.6e}", self.final_gradient_norm)?;
        writeln!(
            f,
            "Final param update norm:   {:.6e}",
            self.final_parameter_update_norm
        )?;
        writeln!(f, "Total time:                {:?}", self.total_time)?;
        Ok(())
    }
}

/// Levenberg-Marquardt solver for nonlinear least squares optimization.
pub struct LevenbergMarquardt {
    config: LevenbergMarquardtConfig,
    damping: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self::new()
    }
}

/// `Jᵀr`
fn compute_gradient(residuals: &FaerMatrix, jacobian: &SparseMatrix) -> Vec<f64> {
    let symbolic = jacobian.symbolic();
    (0..jacobian.ncols())
        .map(|col| {
            symbolic
                .row_idx_of_col_raw(col)
                .iter()
                .zip(jacobian.val_of_col(col))
                .map(|(&row, &value)| value * residuals[(row, 0)])
                .sum::<f64>()
        })
        .collect()
}

/// `J δ`
fn jacobian_times(jacobian: &SparseMatrix, step: &FaerMatrix) -> Vec<f64> {
    let symbolic = jacobian.symbolic();
    let mut product = vec![0.0; jacobian.nrows()];
    for col in 0..jacobian.ncols() {
        let s = step[(col, 0)];
        for (&row, &value) in symbolic
            .row_idx_of_col_raw(col)
            .iter()
            .zip(jacobian.val_of_col(col))
        {
            product[row] += value * s;
        }
    }
    product
}

impl LevenbergMarquardt {
    pub fn new() -> Self {
        Self::with_config(LevenbergMarquardtConfig::default())
    }

    pub fn with_config(config: LevenbergMarquardtConfig) -> Self {
        let damping = config.initial_damping;
        Self { config, damping }
    }

    pub fn config(&self) -> &LevenbergMarquardtConfig {
        &self.config
    }

    /// Update damping parameter based on step quality; returns whether to accept.
    fn update_damping(&mut self, rho: f64) -> bool {
        if rho > self.config.good_step_quality {
            self.damping = (self.damping * self.config.damping_decrease_factor).max(self.config.damping_min);
            true
        } else if rho <= self.config.min_step_quality {
            self.damping = (self.damping * self.config.damping_increase_factor).min(self.config.damping_max);
            false
        } else {
            true
        }
    }

    /// Predicted reduction of `0.5‖r‖²` under the linear model: `-rᵀJδ - 0.5‖Jδ‖²`.
    fn compute_predicted_reduction(residuals: &FaerMatrix, jacobian: &SparseMatrix, step: &FaerMatrix) -> f64 {
        let j_step = jacobian_times(jacobian, step);
        let mut linear_term = 0.0;
        let mut quadratic_term = 0.0;
        for (row, value) in j_step.iter().enumerate() {
            linear_term += residuals[(row, 0)] * value;
            quadratic_term += value * value;
        }
        -linear_term - 0.5 * quadratic_term
    }

    fn parameter_norm(problem: &Problem, layout: &ColumnLayout) -> f64 {
        problem
            .parameter_block_ids()
            .filter(|&id| layout.offset(id).is_some())
            .flat_map(|id| problem.parameter_block_values(id).iter().copied())
            .map(|v| v * v)
            .sum::<f64>()
            .sqrt()
    }

    /// Minimize the problem's cost in place, starting from its current values.
    pub fn optimize(&mut self, problem: &mut Problem) -> OptimizerResult<LevenbergMarquardtSummary> {
        let start_time = Instant::now();
        self.damping = self.config.initial_damping;
        let layout = ColumnLayout::new(problem);
        let initial_cost = problem.cost();
        if !initial_cost.is_finite() {
            return Err(OptimizerError::NumericalFailure(format!(
                "initial cost is {initial_cost}"
            )));
        }

        let mut summary = LevenbergMarquardtSummary {
            status: OptimizationStatus::NoVariables,
            initial_cost,
            final_cost: initial_cost,
            iterations: 0,
            successful_steps: 0,
            unsuccessful_steps: 0,
            final_damping: self.damping,
            final_gradient_norm: 0.0,
            final_parameter_update_norm: 0.0,
            total_time: Duration::ZERO,
        };
        if layout.num_cols() == 0 {
            return Ok(summary);
        }

        info!(
            "Starting Levenberg-Marquardt: {} residuals, {} tangent parameters, initial cost {:.6e}",
            problem.num_residuals(),
            layout.num_cols(),
            initial_cost
        );

        let mut linear_solver = SparseCholeskySolver::new();
        let mut current_cost = initial_cost;
        let mut relinearize = true;
        let mut residuals = FaerMatrix::zeros(0, 1);
        let mut jacobian: Option<SparseMatrix> = None;

        let status = loop {
            if let Some(timeout) = self.config.timeout
                && start_time.elapsed() >= timeout
            {
                break OptimizationStatus::Timeout;
            }
            if summary.iterations >= self.config.max_iterations {
                break OptimizationStatus::MaxIterationsReached;
            }
            if relinearize {
                let (r, j) = problem
                    .evaluate_jacobian(&layout)
                    .map_err(|e| OptimizerError::Evaluation(e.to_string()))?;
                residuals = r;
                jacobian = Some(j);
                relinearize = false;
            }
            let Some(jac) = jacobian.as_ref() else {
                return Err(OptimizerError::Evaluation("missing Jacobian".to_string()));
            };

            let gradient_norm = compute_gradient(&residuals, jac)
                .iter()
                .fold(0.0f64, |acc, g| acc.max(g.abs()));
            summary.final_gradient_norm = gradient_norm;
            if gradient_norm < self.config.gradient_tolerance {
                break OptimizationStatus::GradientToleranceReached;
            }

            summary.iterations += 1;
            let step = match linear_solver.solve_augmented_equation(&residuals, jac, self.damping) {
                Ok(step) => step,
                Err(e) => {
                    warn!("Linear solve failed at damping {:.3e}: {}", self.damping, e);
                    summary.unsuccessful_steps += 1;
                    if self.damping >= self.config.damping_max {
                        break OptimizationStatus::DampingLimitReached;
                    }
                    self.damping = (self.damping * self.config.damping_increase_factor)
                        .min(self.config.damping_max);
                    continue;
                }
            };
            let step_norm = step.norm_l2();
            summary.final_parameter_update_norm = step_norm;

            let parameter_norm = Self::parameter_norm(problem, &layout);
            if step_norm <= self.config.parameter_tolerance * (parameter_norm + self.config.parameter_tolerance) {
                break OptimizationStatus::ParameterToleranceReached;
            }

            let predicted_reduction = Self::compute_predicted_reduction(&residuals, jac, &step);
            let snapshot = problem.snapshot_values();
            problem
                .apply_tangent_step(&layout, &step)
                .map_err(|e| OptimizerError::Update(e.to_string()))?;
            let new_cost = problem.cost();

            let actual_reduction = current_cost - new_cost;
            let rho = if !new_cost.is_finite() {
                f64::NEG_INFINITY
            } else if predicted_reduction.abs() < 1e-300 {
                if actual_reduction > 0.0 { 1.0 } else { 0.0 }
            } else {
                actual_reduction / predicted_reduction
            };

            debug!(
                "iter {:3}: cost {:.6e} -> {:.6e}, rho {:.3}, damping {:.3e}, |step| {:.3e}",
                summary.iterations, current_cost, new_cost, rho, self.damping, step_norm
            );

            if self.update_damping(rho) {
                summary.successful_steps += 1;
                let previous_cost = current_cost;
                current_cost = new_cost;
                relinearize = true;
                if actual_reduction.abs() <= self.config.cost_tolerance * previous_cost {
                    break OptimizationStatus::CostToleranceReached;
                }
            } else {
                problem.restore_values(snapshot);
                summary.unsuccessful_steps += 1;
                if self.damping >= self.config.damping_max {
                    break OptimizationStatus::DampingLimitReached;
                }
            }
        };

        summary.status = status;
        summary.final_cost = current_cost;
        summary.final_damping = self.damping;
        summary.total_time = start_time.elapsed();
        info!(
            "Levenberg-Marquardt finished: {} after {} iterations, cost {:.6e} -> {:.6e}",
            summary.status, summary.iterations, summary.initial_cost, summary.final_cost
        );
        Ok(summary)
    }
}
