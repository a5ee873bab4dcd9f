pub(crate) mod cast;
pub(crate) mod conj;
pub(crate) mod slice;
pub(crate) mod stack;

use nalgebra::Scalar;
use nalgebra_sparse::CscMatrix;
use num_traits::{One, Zero};

/// Builds a square diagonal matrix holding `values`.
///
/// The pattern always stores every diagonal entry, even explicit zeros, so
/// products with it keep a stable structure across iterations.
pub(crate) fn diag<T: Scalar + Zero + One + Copy>(values: &[T]) -> CscMatrix<T> {
    let mut d = CscMatrix::identity(values.len());
    d.values_mut().copy_from_slice(values);
    d
}
