//! Point elimination and inversion of the reduced system.
//!
//! The tangent-space Gauss-Newton matrix is split into a reduced part (pose and
//! other blocks) and per-point 3×3 blocks:
//!
//! ```text
//! H = | H_cc  W  |      S = H_cc − Σ_p W_p V_p⁻¹ W_pᵀ
//!     | Wᵀ    V  |      V_p = H_pp + λI
//! ```
//!
//! `S⁻¹` is the covariance of the reduced parameters. A point's marginal
//! covariance is `V_p⁻¹ + Y_pᵀ S⁻¹ Y_p` with `Y_p = W_p V_p⁻¹`.

use std::collections::{BTreeMap, HashMap};

use nalgebra::{DMatrix, DVector, Matrix3, SymmetricEigen};
use rayon::prelude::*;
use tracing::debug;

use super::catalog::{PointParam, PoseParam};
use super::{BaCovarianceOptions, CovarianceError, CovarianceResult};
use crate::core::{LinearizedResidual, ParamBlockId, Problem};
use crate::linalg::symmetrize;
use crate::scene::Point3DId;

/// Column offsets of the reduced (non-point) blocks. Pose blocks come first, in
/// pose order, followed by the other blocks.
#[derive(Debug, Clone, Default)]
pub(crate) struct ReducedLayout {
    offsets: HashMap<ParamBlockId, (usize, usize)>,
    num_pose_cols: usize,
    num_cols: usize,
}

impl ReducedLayout {
    pub fn new(problem: &Problem, poses: &[PoseParam], others: &[ParamBlockId]) -> Self {
        let mut layout = Self::default();
        for pose in poses {
            for id in pose.blocks() {
                layout.push(problem, id);
            }
        }
        layout.num_pose_cols = layout.num_cols;
        for &id in others {
            layout.push(problem, id);
        }
        layout
    }

    fn push(&mut self, problem: &Problem, id: ParamBlockId) {
        if self.offsets.contains_key(&id) {
            return;
        }
        let size = problem.parameter_block_tangent_size(id);
        self.offsets.insert(id, (self.num_cols, size));
        self.num_cols += size;
    }

    /// `(offset, tangent size)` of a reduced block.
    pub fn get(&self, id: ParamBlockId) -> Option<(usize, usize)> {
        self.offsets.get(&id).copied()
    }

    /// Columns `[0, num_pose_cols)` belong to pose blocks.
    pub fn num_pose_cols(&self) -> usize {
        self.num_pose_cols
    }

    pub fn num_cols(&self) -> usize {
        self.num_cols
    }
}

#[derive(Debug, Clone)]
struct CrossBlock {
    offset: usize,
    w: DMatrix<f64>,
    y: DMatrix<f64>,
}

/// Everything kept from eliminating one point.
#[derive(Debug, Clone)]
pub(crate) struct PointElimination {
    pub point3d_id: Point3DId,
    v_inv: Matrix3<f64>,
    cross: Vec<CrossBlock>,
}

impl PointElimination {
    /// Marginal covariance of the point given the inverse reduced matrix.
    pub fn covariance(&self, s_inv: &DMatrix<f64>) -> Matrix3<f64> {
        let mut cov = self.v_inv;
        for a in &self.cross {
            for b in &self.cross {
                let s_ab = s_inv.view((a.offset, b.offset), (a.y.nrows(), b.y.nrows()));
                let term = a.y.transpose() * s_ab * &b.y;
                cov += term.fixed_view::<3, 3>(0, 0);
            }
        }
        0.5 * (cov + cov.transpose())
    }

    fn subtract_from(&self, schur: &mut DMatrix<f64>) {
        for a in &self.cross {
            for b in &self.cross {
                let update = &a.y * b.w.transpose();
                let mut view = schur.view_mut((a.offset, b.offset), (update.nrows(), update.ncols()));
                view -= update;
            }
        }
    }
}

/// Inverted reduced system plus the per-point data needed for recovery.
#[derive(Debug, Clone)]
pub(crate) struct SchurSystem {
    pub layout: ReducedLayout,
    pub s_inv: DMatrix<f64>,
    pub rank_deficiency: usize,
    pub eliminations: Vec<PointElimination>,
}

/// Linearize the problem, eliminate every variable point and invert the reduced
/// system.
pub(crate) fn eliminate_and_invert(
    options: &BaCovarianceOptions,
    problem: &Problem,
    poses: &[PoseParam],
    points: &[PointParam],
    others: &[ParamBlockId],
) -> CovarianceResult<SchurSystem> {
    let layout = ReducedLayout::new(problem, poses, others);

    let mut point_index: HashMap<ParamBlockId, usize> = HashMap::new();
    let mut point_ids: Vec<Point3DId> = Vec::new();
    for point in points {
        let Some(id) = point.xyz else { continue };
        if layout.get(id).is_some() || point_index.contains_key(&id) {
            continue;
        }
        assert_eq!(
            problem.parameter_block_tangent_size(id),
            3,
            "point {} must have a 3-dimensional tangent space",
            point.point3d_id
        );
        point_index.insert(id, point_ids.len());
        point_ids.push(point.point3d_id);
    }

    let linearized = problem
        .linearize()
        .map_err(|e| CovarianceError::Evaluation(e.to_string()))?;

    let mut residuals_of_point: Vec<Vec<usize>> = vec![Vec::new(); point_ids.len()];
    for (idx, lin) in linearized.iter().enumerate() {
        let mut owner: Option<usize> = None;
        for (id, jacobian) in lin.parameter_blocks.iter().zip(&lin.jacobians) {
            if jacobian.is_none() {
                continue;
            }
            let Some(&p) = point_index.get(id) else { continue };
            match owner {
                Some(q) if q != p => {
                    return Err(CovarianceError::PointCoupling {
                        residual_block_id: lin.residual_block_id,
                        first: point_ids[q],
                        second: point_ids[p],
                    });
                }
                _ => owner = Some(p),
            }
        }
        if let Some(p) = owner {
            residuals_of_point[p].push(idx);
        }
    }

    let n = layout.num_cols();
    debug!(
        "Eliminating {} points from a {}x{} reduced system",
        point_ids.len(),
        n,
        n
    );

    let h_cc = linearized
        .par_iter()
        .fold(
            || DMatrix::zeros(n, n),
            |mut acc, lin| {
                accumulate_reduced(&mut acc, lin, &layout);
                acc
            },
        )
        .reduce(|| DMatrix::zeros(n, n), |a, b| a + b);

    let eliminations: Vec<PointElimination> = residuals_of_point
        .par_iter()
        .enumerate()
        .map(|(p, residual_ids)| {
            eliminate_point(
                point_ids[p],
                residual_ids.iter().map(|&r| &linearized[r]),
                &point_index,
                &layout,
                options,
            )
        })
        .collect::<CovarianceResult<_>>()?;

    let reduction = eliminations
        .par_iter()
        .fold(
            || DMatrix::zeros(n, n),
            |mut acc, elimination| {
                elimination.subtract_from(&mut acc);
                acc
            },
        )
        .reduce(|| DMatrix::zeros(n, n), |a, b| a + b);

    let mut schur = h_cc + reduction;
    symmetrize(&mut schur);
    if schur.iter().any(|v| !v.is_finite()) {
        return Err(CovarianceError::NonFiniteSchurComplement);
    }

    let (s_inv, rank_deficiency) = pseudo_inverse(&schur, options.rank_tolerance)?;
    if rank_deficiency > 0 {
        debug!("Reduced system has rank deficiency {}", rank_deficiency);
        if options.damping == 0.0 {
            return Err(CovarianceError::RankDeficientSchurComplement { rank_deficiency });
        }
    }

    Ok(SchurSystem {
        layout,
        s_inv,
        rank_deficiency,
        eliminations,
    })
}

/// Add `J_aᵀ J_b` for every pair of reduced blocks of one residual.
fn accumulate_reduced(acc: &mut DMatrix<f64>, lin: &LinearizedResidual, layout: &ReducedLayout) {
    let reduced: Vec<(usize, &DMatrix<f64>)> = lin
        .parameter_blocks
        .iter()
        .zip(&lin.jacobians)
        .filter_map(|(id, jacobian)| Some((layout.get(*id)?.0, jacobian.as_ref()?)))
        .collect();
    for &(offset_a, j_a) in &reduced {
        for &(offset_b, j_b) in &reduced {
            let block = j_a.transpose() * j_b;
            let mut view = acc.view_mut((offset_a, offset_b), (block.nrows(), block.ncols()));
            view += block;
        }
    }
}

fn eliminate_point<'a>(
    point3d_id: Point3DId,
    residuals: impl Iterator<Item = &'a LinearizedResidual>,
    point_index: &HashMap<ParamBlockId, usize>,
    layout: &ReducedLayout,
    options: &BaCovarianceOptions,
) -> CovarianceResult<PointElimination> {
    let mut v = Matrix3::<f64>::zeros();
    let mut w_blocks: BTreeMap<usize, DMatrix<f64>> = BTreeMap::new();

    for lin in residuals {
        let Some(j_p) = lin
            .parameter_blocks
            .iter()
            .zip(&lin.jacobians)
            .find_map(|(id, jacobian)| point_index.contains_key(id).then_some(jacobian.as_ref()).flatten())
        else {
            continue;
        };
        let j_p_t = j_p.transpose();
        v += (&j_p_t * j_p).fixed_view::<3, 3>(0, 0);

        for (id, jacobian) in lin.parameter_blocks.iter().zip(&lin.jacobians) {
            let (Some((offset, size)), Some(j_c)) = (layout.get(*id), jacobian.as_ref()) else {
                continue;
            };
            let w = w_blocks
                .entry(offset)
                .or_insert_with(|| DMatrix::zeros(size, 3));
            *w += j_c.transpose() * j_p;
        }
    }

    v += Matrix3::identity() * options.damping;
    let v_inv = invert_point_block(point3d_id, &v, options.point_block_tolerance)?;
    let v_inv_dyn = DMatrix::from_column_slice(3, 3, v_inv.as_slice());

    let cross = w_blocks
        .into_iter()
        .map(|(offset, w)| CrossBlock {
            offset,
            y: &w * &v_inv_dyn,
            w,
        })
        .collect();

    Ok(PointElimination {
        point3d_id,
        v_inv,
        cross,
    })
}

fn invert_point_block(
    point3d_id: Point3DId,
    v: &Matrix3<f64>,
    tolerance: f64,
) -> CovarianceResult<Matrix3<f64>> {
    let singular = |min_eigenvalue: f64, max_eigenvalue: f64| CovarianceError::SingularPointBlock {
        point3d_id,
        min_eigenvalue,
        max_eigenvalue,
    };
    if v.iter().any(|x| !x.is_finite()) {
        return Err(singular(f64::NAN, f64::NAN));
    }
    let eigen = SymmetricEigen::new(*v);
    let min = eigen.eigenvalues.min();
    let max = eigen.eigenvalues.max();
    if !(max > 0.0) || min <= tolerance * max {
        return Err(singular(min, max));
    }
    let inv_diag = Matrix3::from_diagonal(&eigen.eigenvalues.map(|l| 1.0 / l));
    let v_inv = eigen.eigenvectors * inv_diag * eigen.eigenvectors.transpose();
    Ok(0.5 * (v_inv + v_inv.transpose()))
}

/// Pseudo-inverse of a symmetric positive semi-definite matrix.
///
/// The matrix is first scaled to unit diagonal so that the rank threshold does
/// not depend on the units of the parameters. Eigenvalues at or below
/// `rank_tolerance · λ_max` are treated as zero; the number of such eigenvalues
/// is returned as the rank deficiency.
pub(crate) fn pseudo_inverse(
    matrix: &DMatrix<f64>,
    rank_tolerance: f64,
) -> CovarianceResult<(DMatrix<f64>, usize)> {
    let n = matrix.nrows();
    if n == 0 {
        return Ok((DMatrix::zeros(0, 0), 0));
    }

    let scale = DVector::from_fn(n, |i, _| {
        let d = matrix[(i, i)];
        if d > 0.0 { 1.0 / d.sqrt() } else { 1.0 }
    });
    let scaled = DMatrix::from_fn(n, n, |i, j| matrix[(i, j)] * scale[i] * scale[j]);

    let eigen = SymmetricEigen::new(scaled);
    let max = eigen.eigenvalues.max();
    let min = eigen.eigenvalues.min();
    if !(max > 0.0) || min < -rank_tolerance.sqrt() * max {
        return Err(CovarianceError::IndefiniteSchurComplement {
            min_eigenvalue: min,
            max_eigenvalue: max,
        });
    }

    let threshold = rank_tolerance * max;
    let mut rank_deficiency = 0;
    let inv_eigenvalues = eigen.eigenvalues.map(|l| {
        if l > threshold {
            1.0 / l
        } else {
            rank_deficiency += 1;
            0.0
        }
    });

    let q = &eigen.eigenvectors;
    let mut inverse = q * DMatrix::from_diagonal(&inv_eigenvalues) * q.transpose();
    for i in 0..n {
        for j in 0..n {
            inverse[(i, j)] *= scale[i] * scale[j];
        }
    }
    symmetrize(&mut inverse);
    Ok((inverse, rank_deficiency))
}
