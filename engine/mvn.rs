//! Multivariate normal sampling with positive-semi-definite repair.
//!
//! Caller-supplied correlation matrices are often slightly indefinite
//! (hand-written, or rounded from a publication table). Rather than
//! rejecting them, the spectrum is shifted just past zero and sampling
//! proceeds through an eigendecomposition-based factor, which accepts
//! any repaired matrix including rank-deficient ones.

use ndarray::{Array1, Array2};
use ndarray_linalg::{Eigh, UPLO};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MvnError {
    #[error("correlation matrix must be square, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error(
        "means, stds and correlation matrix disagree on dimension ({means} means, {stds} stds, {matrix}x{matrix} matrix)"
    )]
    DimensionMismatch {
        means: usize,
        stds: usize,
        matrix: usize,
    },
    #[error("eigendecomposition failed: {0}")]
    Eigen(#[from] ndarray_linalg::error::LinalgError),
}

/// Shift an indefinite symmetric matrix back into the PSD cone.
///
/// A matrix whose minimum eigenvalue `lambda` is negative is replaced by
/// `M - 1.1 * lambda * I`; a matrix that is already PSD is returned
/// unchanged.
pub fn ensure_positive_semidefinite(matrix: &Array2<f64>) -> Result<Array2<f64>, MvnError> {
    if matrix.nrows() != matrix.ncols() {
        return Err(MvnError::NotSquare {
            rows: matrix.nrows(),
            cols: matrix.ncols(),
        });
    }
    let (eigenvalues, _) = matrix.eigh(UPLO::Lower)?;
    let min_eigenvalue = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
    if min_eigenvalue >= 0.0 {
        return Ok(matrix.clone());
    }
    let mut repaired = matrix.clone();
    for i in 0..repaired.nrows() {
        repaired[[i, i]] -= 1.1 * min_eigenvalue;
    }
    Ok(repaired)
}

/// `cov[i][j] = std[i] * std[j] * corr[i][j]`.
pub fn covariance_from_correlation(
    stds: &Array1<f64>,
    correlation: &Array2<f64>,
) -> Result<Array2<f64>, MvnError> {
    let p = stds.len();
    if correlation.nrows() != correlation.ncols() {
        return Err(MvnError::NotSquare {
            rows: correlation.nrows(),
            cols: correlation.ncols(),
        });
    }
    if correlation.nrows() != p {
        return Err(MvnError::DimensionMismatch {
            means: p,
            stds: p,
            matrix: correlation.nrows(),
        });
    }
    let mut covariance = correlation.clone();
    for i in 0..p {
        for j in 0..p {
            covariance[[i, j]] *= stds[i] * stds[j];
        }
    }
    Ok(covariance)
}

/// Draw `n` rows from N(means, covariance).
///
/// The covariance is factored through its eigendecomposition with
/// negative residual eigenvalues clamped to zero, so a freshly repaired
/// PSD matrix never fails to factor.
pub fn sample(
    rng: &mut StdRng,
    n: usize,
    means: &Array1<f64>,
    covariance: &Array2<f64>,
) -> Result<Array2<f64>, MvnError> {
    let p = means.len();
    if covariance.nrows() != covariance.ncols() {
        return Err(MvnError::NotSquare {
            rows: covariance.nrows(),
            cols: covariance.ncols(),
        });
    }
    if covariance.nrows() != p {
        return Err(MvnError::DimensionMismatch {
            means: p,
            stds: p,
            matrix: covariance.nrows(),
        });
    }

    let (eigenvalues, eigenvectors) = covariance.eigh(UPLO::Lower)?;
    let mut factor = eigenvectors;
    for j in 0..p {
        let scale = eigenvalues[j].max(0.0).sqrt();
        for i in 0..p {
            factor[[i, j]] *= scale;
        }
    }

    let mut draws = Array2::<f64>::zeros((n, p));
    let mut z = Array1::<f64>::zeros(p);
    for row in 0..n {
        for value in z.iter_mut() {
            *value = rng.sample(StandardNormal);
        }
        let shifted = factor.dot(&z);
        for j in 0..p {
            draws[[row, j]] = means[j] + shifted[j];
        }
    }
    Ok(draws)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::SeedableRng;

    #[test]
    fn psd_matrix_passes_through_unchanged() {
        let matrix = array![[1.0, 0.3], [0.3, 1.0]];
        let repaired = ensure_positive_semidefinite(&matrix).unwrap();
        assert_eq!(repaired, matrix);
    }

    #[test]
    fn indefinite_matrix_is_lifted() {
        // Three pairwise correlations of -0.9 cannot coexist.
        let matrix = array![
            [1.0, -0.9, -0.9],
            [-0.9, 1.0, -0.9],
            [-0.9, -0.9, 1.0]
        ];
        let repaired = ensure_positive_semidefinite(&matrix).unwrap();
        let (eigenvalues, _) = repaired.eigh(UPLO::Lower).unwrap();
        let min_eigenvalue = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
        assert!(
            min_eigenvalue >= 0.0,
            "minimum eigenvalue {min_eigenvalue} still negative"
        );
    }

    #[test]
    fn rejects_non_square_input() {
        let matrix = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            ensure_positive_semidefinite(&matrix),
            Err(MvnError::NotSquare { rows: 2, cols: 3 })
        ));
    }

    #[test]
    fn sample_reproduces_correlation_structure() {
        let mut rng = StdRng::seed_from_u64(7);
        let means = array![10.0, -4.0];
        let stds = array![2.0, 5.0];
        let correlation = array![[1.0, 0.6], [0.6, 1.0]];
        let covariance = covariance_from_correlation(&stds, &correlation).unwrap();
        let draws = sample(&mut rng, 20_000, &means, &covariance).unwrap();

        let first: Array1<f64> = draws.column(0).to_owned();
        let second: Array1<f64> = draws.column(1).to_owned();
        assert_relative_eq!(stats::mean(&first), 10.0, epsilon = 0.1);
        assert_relative_eq!(stats::mean(&second), -4.0, epsilon = 0.2);
        assert_relative_eq!(stats::std_dev(&first, 0), 2.0, epsilon = 0.1);
        assert_relative_eq!(stats::pearson(&first, &second), 0.6, epsilon = 0.03);
    }
}
