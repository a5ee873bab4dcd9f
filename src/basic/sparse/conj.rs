use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;

/// Rebuilds a matrix on the pattern of `mat` with new values.
#[inline(always)]
pub(crate) fn with_values<T, U>(mat: &CscMatrix<T>, values: Vec<U>) -> CscMatrix<U> {
    debug_assert_eq!(mat.nnz(), values.len());
    // SAFETY: the pattern is cloned from a valid matrix and `values` has one
    // entry per stored element.
    unsafe {
        CscMatrix::try_from_pattern_and_values(mat.pattern().clone(), values).unwrap_unchecked()
    }
}

/// Element-wise conjugation of a complex sparse matrix.
pub(crate) trait Conjugate {
    fn conjugate(&self) -> Self;
}

impl Conjugate for CscMatrix<Complex64> {
    fn conjugate(&self) -> Self {
        with_values(self, self.values().iter().map(|v| v.conj()).collect())
    }
}

/// Splits a complex sparse matrix into real matrices sharing its pattern.
pub(crate) trait RealImag {
    type Real;
    fn real(&self) -> Self::Real;
    fn imag(&self) -> Self::Real;
}

impl RealImag for CscMatrix<Complex64> {
    type Real = CscMatrix<f64>;

    fn real(&self) -> Self::Real {
        with_values(self, self.values().iter().map(|v| v.re).collect())
    }

    fn imag(&self) -> Self::Real {
        with_values(self, self.values().iter().map(|v| v.im).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra_sparse::CooMatrix;

    fn sample(sign: f64) -> CscMatrix<Complex64> {
        let mut a = CooMatrix::new(4, 4);
        a.push(0, 0, Complex64::new(1.0, -1.0 * sign));
        a.push(2, 1, Complex64::new(3.0, 1.0 * sign));
        a.push(3, 3, Complex64::new(5.0, -2.2 * sign));
        (&a).into()
    }

    #[test]
    fn test_conj() {
        let a = sample(1.0);
        assert!(a.conjugate() == sample(-1.0), "matrices do not match!");
        assert!(a.conjugate().conjugate() == a, "matrices do not match!");
    }

    #[test]
    fn test_real_imag_keep_pattern() {
        let a = sample(1.0);
        let (re, im) = (a.real(), a.imag());
        assert_eq!(re.pattern(), a.pattern());
        assert_eq!(re.values(), &[1.0, 3.0, 5.0]);
        assert_eq!(im.values(), &[-1.0, 1.0, -2.2]);
    }
}
