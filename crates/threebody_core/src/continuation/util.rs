//! Tangent computation for pseudo-arclength continuation.

use nalgebra::{DMatrix, DVector};

use crate::error::{Cr3bpError, Result};

/// Unit null vector of an n x (n+1) Jacobian.
///
/// The Jacobian is padded with a zero row so the SVD is square and the right
/// singular vector of the smallest singular value spans the kernel. The sign
/// is arbitrary; callers orient it.
pub fn compute_nullspace_tangent(j_ext: &DMatrix<f64>) -> Result<DVector<f64>> {
    let dim = j_ext.nrows();
    if dim == 0 {
        return Err(Cr3bpError::Linalg(
            "cannot compute tangent of a zero-dimensional system".into(),
        ));
    }
    if j_ext.ncols() != dim + 1 {
        return Err(Cr3bpError::Linalg(format!(
            "tangent needs {} columns, got {}",
            dim + 1,
            j_ext.ncols()
        )));
    }
    if j_ext.iter().any(|v| !v.is_finite()) {
        return Err(Cr3bpError::Linalg("Jacobian has non-finite entries".into()));
    }

    let svd = j_ext.clone().insert_row(dim, 0.0).svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| Cr3bpError::Linalg("SVD did not produce right singular vectors".into()))?;
    let (smallest, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .ok_or_else(|| Cr3bpError::Linalg("SVD returned no singular values".into()))?;

    let tangent = v_t.row(smallest).transpose();
    let norm = tangent.norm();
    if !(norm.is_finite() && norm > 0.0) {
        return Err(Cr3bpError::Linalg("null vector is degenerate".into()));
    }
    Ok(tangent / norm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tangent_spans_the_kernel() {
        let j = DMatrix::from_row_slice(2, 3, &[1.0, 2.0, 0.0, 0.0, 1.0, -1.0]);
        let t = compute_nullspace_tangent(&j).expect("tangent");
        assert!((&j * &t).norm() < 1e-12);
        assert!((t.norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn tangent_of_a_single_row() {
        let j = DMatrix::from_row_slice(1, 2, &[3.0, 4.0]);
        let t = compute_nullspace_tangent(&j).expect("tangent");
        assert!((3.0 * t[0] + 4.0 * t[1]).abs() < 1e-12);
        assert!((t[0].abs() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn tangent_rejects_wrong_shape() {
        let j = DMatrix::<f64>::zeros(2, 2);
        assert!(compute_nullspace_tangent(&j).is_err());
        let j = DMatrix::from_row_slice(1, 2, &[f64::NAN, 1.0]);
        assert!(compute_nullspace_tangent(&j).is_err());
    }
}
