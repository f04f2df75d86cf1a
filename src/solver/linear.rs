//! Dense linear-solve backend.
//!
//! Thin wrapper around nalgebra's partial-pivot LU so the rest of the solver
//! deals with one factorization type. Factorizations are computed once per
//! switch state at initialization and are immutable afterwards, so they can
//! be shared between solve tasks without locks.

use nalgebra::{DMatrix, DVector, Dyn, LU};

use crate::solver::scalar::MnaScalar;

/// Precomputed partial-pivot LU factorization of one system matrix.
#[derive(Debug)]
pub struct Factorization<S: MnaScalar> {
    lu: LU<S, Dyn, Dyn>,
}

impl<S: MnaScalar> Factorization<S> {
    /// Factorizes `m`, returning `None` if the matrix is singular.
    pub fn compute(m: DMatrix<S>) -> Option<Self> {
        let lu = m.lu();
        lu.is_invertible().then_some(Self { lu })
    }

    pub fn solve(&self, b: &DVector<S>) -> DVector<S> {
        self.lu
            .solve(b)
            .expect("matrix was verified invertible at factorization time")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_a_small_system() {
        let m = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 4.0]);
        let f = Factorization::compute(m).unwrap();
        let x = f.solve(&DVector::from_vec(vec![2.0, 8.0]));
        assert_eq!(x, DVector::from_vec(vec![1.0, 2.0]));
    }

    #[test]
    fn singular_matrix_is_rejected() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        assert!(Factorization::<f64>::compute(m).is_none());
    }
}
