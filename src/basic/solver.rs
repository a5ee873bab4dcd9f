use nalgebra_sparse::CscMatrix;

use super::error::Result;

mod rsparse;
pub use rsparse::*;

pub type DefaultSolver = RSparseSolver;

/// A sparse direct solver for the real systems produced by the power flow
/// methods (Jacobians, `B'`/`B''`, the HELM augmented matrix).
///
/// The factorization is split from the solve so that methods with constant
/// matrices factorize once and solve many right-hand sides.
pub trait Solve {
    /// Computes and stores the LU factors of the square matrix `a`.
    fn factorize(&mut self, a: &CscMatrix<f64>) -> Result<()>;

    /// Solves with the stored factors; `b` is overwritten with the solution.
    fn solve_factored(&self, b: &mut [f64]) -> Result<()>;

    /// Factorizes `a` and solves `a x = b` in place.
    fn solve(&mut self, a: &CscMatrix<f64>, b: &mut [f64]) -> Result<()> {
        self.factorize(a)?;
        self.solve_factored(b)
    }
}
