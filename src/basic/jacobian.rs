use nalgebra::DVector;
use nalgebra_sparse::CscMatrix;
use num_complex::Complex64;

use super::dsbus_dv::dSbus_dV;
use super::sparse::{conj::RealImag, diag, slice::select, stack::csc_bmat};

/// Arranges complex derivative matrices into the real Newton Jacobian
///
/// ```text
/// | Re dVa[pvpq, pvpq]  Re dVm[pvpq, pq] |
/// | Im dVa[pq,   pvpq]  Im dVm[pq,   pq] |
/// ```
pub fn assemble(
    d_dvm: &CscMatrix<Complex64>,
    d_dva: &CscMatrix<Complex64>,
    pvpq: &[usize],
    pq: &[usize],
) -> CscMatrix<f64> {
    let j11 = select(d_dva, pvpq, pvpq).real();
    let j12 = select(d_dvm, pvpq, pq).real();
    let j21 = select(d_dva, pq, pvpq).imag();
    let j22 = select(d_dvm, pq, pq).imag();
    csc_bmat(&[&[&j11, &j12], &[&j21, &j22]])
}

/// Jacobian of `V·conj(Ybus·V) - (S0 + I0·|V|)` in polar coordinates.
pub fn jacobian(
    ybus: &CscMatrix<Complex64>,
    v: &DVector<Complex64>,
    i0: Option<&DVector<Complex64>>,
    pvpq: &[usize],
    pq: &[usize],
) -> CscMatrix<f64> {
    let (mut ds_dvm, ds_dva) = dSbus_dV(ybus, v);
    if let Some(i0) = i0.filter(|i0| i0.iter().any(|c| c.norm_sqr() > 0.0)) {
        ds_dvm = &ds_dvm - &diag(i0.as_slice());
    }
    assemble(&ds_dvm, &ds_dva, pvpq, pq)
}
