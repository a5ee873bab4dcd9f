use nalgebra_sparse::CscMatrix;
use rsparse::{
    data::{self, Numeric, Symb},
    lsolve, lu, sqr, usolve,
};

use super::Solve;
use crate::basic::error::{PowerFlowError, Result};

type Factors = Box<dyn Fn(&mut [f64]) + Send + Sync>;

/// LU solver backed by `rsparse` (a CSparse port).
///
/// The symbolic analysis (column ordering) is reused for as long as the
/// sparsity pattern stays the same, which is the common case for Newton
/// iterations on a fixed set of PV/PQ buses.
#[derive(Default)]
pub struct RSparseSolver {
    pattern: Option<(Vec<usize>, Vec<usize>)>,
    symbolic: Option<Symb>,
    factors: Option<Factors>,
}

impl RSparseSolver {
    fn same_pattern(&self, a: &CscMatrix<f64>) -> bool {
        match &self.pattern {
            Some((offsets, indices)) => {
                offsets.as_slice() == a.col_offsets() && indices.as_slice() == a.row_indices()
            }
            None => false,
        }
    }
}

fn structurally_singular(a: &CscMatrix<f64>) -> bool {
    let mut row_used = vec![false; a.nrows()];
    a.row_indices().iter().for_each(|&r| row_used[r] = true);
    let empty_col = a.col_offsets().windows(2).any(|w| w[0] == w[1]);
    empty_col || row_used.iter().any(|used| !used)
}

impl Solve for RSparseSolver {
    fn factorize(&mut self, a: &CscMatrix<f64>) -> Result<()> {
        let n = a.nrows();
        if n != a.ncols() {
            return Err(PowerFlowError::Factorization(format!(
                "matrix is {}x{}, expected square",
                a.nrows(),
                a.ncols()
            )));
        }
        self.factors = None;
        if n == 0 {
            self.factors = Some(Box::new(|_: &mut [f64]| {}));
            return Ok(());
        }
        if structurally_singular(a) {
            return Err(PowerFlowError::Factorization(
                "matrix has an empty row or column".into(),
            ));
        }

        let sprs = data::Sprs {
            m: n,
            n,
            i: a.row_indices().to_vec(),
            p: a.col_offsets().iter().map(|&v| v as isize).collect(),
            x: a.values().to_vec(),
            nzmax: a.nnz(),
        };
        if !self.same_pattern(a) || self.symbolic.is_none() {
            self.symbolic = Some(sqr(&sprs, 1, false));
            self.pattern = Some((a.col_offsets().to_vec(), a.row_indices().to_vec()));
        }
        let s = self
            .symbolic
            .as_mut()
            .ok_or_else(|| PowerFlowError::Factorization("missing symbolic analysis".into()))?;
        let num = lu(&sprs, s, 1e-6)
            .map_err(|_| PowerFlowError::Factorization("LU factorization failed".into()))?;
        let q = s.q.clone();
        self.factors = Some(Box::new(move |b: &mut [f64]| {
            let mut x = vec![0.0; b.len()];
            ipvec(&num.pinv, b, &mut x); // x = P*b
            lsolve(&num.l, &mut x); // x = L\x
            usolve(&num.u, &mut x); // x = U\x
            ipvec(&q, &x, b); // b = Q*x
        }));
        Ok(())
    }

    fn solve_factored(&self, b: &mut [f64]) -> Result<()> {
        let factors = self.factors.as_ref().ok_or_else(|| {
            PowerFlowError::Factorization("solve requested before factorization".into())
        })?;
        factors(b);
        if b.iter().any(|v| !v.is_finite()) {
            return Err(PowerFlowError::Factorization(
                "non-finite solution, matrix is numerically singular".into(),
            ));
        }
        Ok(())
    }
}

fn ipvec<T: Numeric<T>>(p: &Option<Vec<isize>>, b: &[T], x: &mut [T]) {
    match p {
        Some(pvec) => {
            for k in 0..b.len() {
                x[pvec[k] as usize] = b[k];
            }
        }
        None => x.copy_from_slice(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra_sparse::CooMatrix;

    fn matrix(entries: &[(usize, usize, f64)], n: usize) -> CscMatrix<f64> {
        let mut coo = CooMatrix::new(n, n);
        entries.iter().for_each(|&(r, c, v)| coo.push(r, c, v));
        CscMatrix::from(&coo)
    }

    #[test]
    fn test_solve_and_reuse_factors() {
        let a = matrix(
            &[(0, 0, 4.0), (0, 1, 1.0), (1, 0, 2.0), (1, 1, 3.0), (2, 2, 5.0), (2, 0, 1.0)],
            3,
        );
        let mut solver = RSparseSolver::default();
        solver.factorize(&a).unwrap();

        let mut b = [6.0, 8.0, 11.0];
        solver.solve_factored(&mut b).unwrap();
        // x = [1, 2, 2]
        assert_relative_eq!(b[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(b[1], 2.0, epsilon = 1e-12);
        assert_relative_eq!(b[2], 2.0, epsilon = 1e-12);

        let mut b = [4.0, 2.0, 1.0];
        solver.solve_factored(&mut b).unwrap();
        assert_relative_eq!(b[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(b[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(b[2], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_singular_is_reported() {
        let a = matrix(&[(0, 0, 1.0), (1, 0, 1.0)], 2);
        let mut solver = RSparseSolver::default();
        let mut b = [1.0, 1.0];
        assert!(solver.solve(&a, &mut b).is_err());

        let a = matrix(&[(0, 0, 1.0), (0, 1, 2.0), (1, 0, 2.0), (1, 1, 4.0)], 2);
        let mut solver = RSparseSolver::default();
        let mut b = [1.0, 1.0];
        assert!(solver.solve(&a, &mut b).is_err());
    }
}
