//! Small dense linear algebra helpers.
//!
//! Network systems are tiny (tens to a few hundred pairs), so everything is
//! solved through an SVD. Ranks and pseudo-inverses use a cutoff relative to
//! the largest singular value.

use nalgebra::{DMatrix, DVector};

/// Pseudo-inverse of a matrix together with its numerical rank
#[derive(Debug, Clone)]
pub struct PseudoInverse {
    pub matrix: DMatrix<f64>,
    pub rank: usize,
}

fn cutoff(singular_values: &DVector<f64>, rcond: f64) -> f64 {
    let max_sv = singular_values.iter().cloned().fold(0.0_f64, f64::max);
    max_sv * rcond
}

/// Numerical rank using a relative singular value cutoff
pub fn rank(a: &DMatrix<f64>, rcond: f64) -> usize {
    if a.nrows() == 0 || a.ncols() == 0 {
        return 0;
    }
    let svd = a.clone().svd(false, false);
    let tol = cutoff(&svd.singular_values, rcond);
    svd.singular_values.iter().filter(|&&s| s > tol).count()
}

/// SVD pseudo-inverse; `None` if the decomposition is unusable
pub fn pseudo_inverse(a: &DMatrix<f64>, rcond: f64) -> Option<PseudoInverse> {
    if a.nrows() == 0 || a.ncols() == 0 {
        return None;
    }
    let svd = a.clone().svd(true, true);
    let tol = cutoff(&svd.singular_values, rcond);
    let rank = svd.singular_values.iter().filter(|&&s| s > tol).count();
    // nalgebra treats the cutoff as absolute; keep it strictly positive
    let matrix = svd.pseudo_inverse(tol.max(f64::MIN_POSITIVE)).ok()?;
    if matrix.iter().all(|v| v.is_finite()) {
        Some(PseudoInverse { matrix, rank })
    } else {
        None
    }
}

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(a: &DMatrix<f64>, b: &DVector<f64>, rcond: f64) -> Option<DVector<f64>> {
    let pinv = pseudo_inverse(a, rcond)?;
    let x = &pinv.matrix * b;
    if x.iter().all(|v| v.is_finite()) {
        Some(x)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_least_squares_solves_simple_system() {
        // Fit y = 2 + 3x on x = [0,1,2]
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let b = DVector::from_row_slice(&[2.0, 5.0, 8.0]);

        let x = solve_least_squares(&a, &b, 1e-12).unwrap();
        assert_abs_diff_eq!(x[0], 2.0, epsilon = 1e-10);
        assert_abs_diff_eq!(x[1], 3.0, epsilon = 1e-10);
    }

    #[test]
    fn test_rank_detects_collinear_columns() {
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 2.0, 4.0, 3.0, 6.0]);
        assert_eq!(rank(&a, 1e-10), 1);
        assert_eq!(rank(&DMatrix::<f64>::zeros(0, 3), 1e-10), 0);
    }

    #[test]
    fn test_pseudo_inverse_of_wide_matrix() {
        let a = DMatrix::from_row_slice(1, 2, &[1.0, 1.0]);
        let pinv = pseudo_inverse(&a, 1e-10).unwrap();
        assert_eq!(pinv.rank, 1);
        assert_abs_diff_eq!(pinv.matrix[(0, 0)], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(pinv.matrix[(1, 0)], 0.5, epsilon = 1e-12);
    }
}
