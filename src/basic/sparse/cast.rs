use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;

use super::conj::with_values;

/// Lifts a real sparse matrix into the complex field.
pub(crate) trait Cast<T> {
    type Mat;

    fn cast(&self) -> Self::Mat;
}

impl Cast<Complex64> for CscMatrix<f64> {
    type Mat = CscMatrix<Complex64>;

    fn cast(&self) -> Self::Mat {
        with_values(
            self,
            self.values().iter().map(|x| Complex64::new(*x, 0.0)).collect(),
        )
    }
}
